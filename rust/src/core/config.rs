use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub(crate) const CONFIG_FILE: &str = "nodes_config.json";

const DEFAULT_REPLAY_GRACE_MS: u64 = 2_000;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 16;
const DEFAULT_SOUND_DEBOUNCE_MS: u64 = 2_000;
const DEFAULT_MAX_MESSAGES_PER_SURFACE: usize = 500;
const DEFAULT_PREVIEW_CHARS: usize = 120;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct AppConfig {
    /// Time after a subscription opens during which deliveries count as replay.
    pub(crate) replay_grace_ms: Option<u64>,
    pub(crate) flush_interval_ms: Option<u64>,
    pub(crate) sound_debounce_ms: Option<u64>,
    pub(crate) max_messages_per_surface: Option<usize>,
    pub(crate) preview_chars: Option<usize>,
    pub(crate) alert_on_replay: Option<bool>,
}

pub(crate) fn load_app_config(data_dir: &str) -> AppConfig {
    let path = Path::new(data_dir).join(CONFIG_FILE);
    let Ok(bytes) = std::fs::read(&path) else {
        return AppConfig::default();
    };
    match serde_json::from_slice::<AppConfig>(&bytes) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(path = %path.display(), %e, "config unreadable, using defaults");
            AppConfig::default()
        }
    }
}

impl AppConfig {
    pub(crate) fn replay_grace(&self) -> Duration {
        let env = std::env::var("NODES_REPLAY_GRACE_MS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok());
        Duration::from_millis(
            env.or(self.replay_grace_ms)
                .unwrap_or(DEFAULT_REPLAY_GRACE_MS),
        )
    }

    pub(crate) fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.unwrap_or(DEFAULT_FLUSH_INTERVAL_MS))
    }

    pub(crate) fn sound_debounce(&self) -> Duration {
        Duration::from_millis(self.sound_debounce_ms.unwrap_or(DEFAULT_SOUND_DEBOUNCE_MS))
    }

    pub(crate) fn max_messages_per_surface(&self) -> usize {
        self.max_messages_per_surface
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_MESSAGES_PER_SURFACE)
    }

    pub(crate) fn preview_chars(&self) -> usize {
        self.preview_chars
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_PREVIEW_CHARS)
    }

    pub(crate) fn alert_on_replay(&self) -> bool {
        self.alert_on_replay.unwrap_or(false)
    }
}

/// The `nodes_config.json` payload used when no config file exists.
pub(crate) fn default_app_config_json() -> String {
    let v = serde_json::json!({
        "replay_grace_ms": DEFAULT_REPLAY_GRACE_MS,
        "flush_interval_ms": DEFAULT_FLUSH_INTERVAL_MS,
        "sound_debounce_ms": DEFAULT_SOUND_DEBOUNCE_MS,
        "max_messages_per_surface": DEFAULT_MAX_MESSAGES_PER_SURFACE,
        "preview_chars": DEFAULT_PREVIEW_CHARS,
        "alert_on_replay": false,
    });
    serde_json::to_string_pretty(&v).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_app_config(dir.path().to_str().unwrap());
        assert_eq!(cfg.flush_interval(), Duration::from_millis(16));
        assert_eq!(cfg.max_messages_per_surface(), 500);
        assert_eq!(cfg.preview_chars(), 120);
        assert!(!cfg.alert_on_replay());
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"flush_interval_ms": 5, "unknown_key": true}"#,
        )
        .unwrap();
        let cfg = load_app_config(dir.path().to_str().unwrap());
        assert_eq!(cfg.flush_interval(), Duration::from_millis(5));
        assert_eq!(cfg.sound_debounce(), Duration::from_millis(2_000));
    }

    #[test]
    fn garbage_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), b"not json").unwrap();
        let cfg = load_app_config(dir.path().to_str().unwrap());
        assert_eq!(cfg.preview_chars(), 120);
    }

    #[test]
    fn default_json_round_trips_into_config() {
        let cfg: AppConfig = serde_json::from_str(&default_app_config_json()).unwrap();
        assert_eq!(cfg.replay_grace_ms, Some(2_000));
        assert_eq!(cfg.alert_on_replay, Some(false));
    }
}
