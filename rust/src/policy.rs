//! Layered notification settings: global defaults, per-node overrides and
//! per-channel overrides. Channel beats node beats global; a channel set to
//! `Default` defers to its node.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::state::SurfaceKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    pub desktop_enabled: bool,
    pub sound_enabled: bool,
    pub do_not_disturb: bool,
    pub dm_notifications: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            desktop_enabled: true,
            sound_enabled: true,
            do_not_disturb: false,
            dm_notifications: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeLevel {
    #[default]
    All,
    Mentions,
    Nothing,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeOverride {
    pub level: NodeLevel,
    pub suppress_everyone: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelLevel {
    #[default]
    Default,
    All,
    Mentions,
    Nothing,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub global: GlobalSettings,
    /// node id -> override
    pub nodes: BTreeMap<String, NodeOverride>,
    /// channel surface id -> override
    pub channels: BTreeMap<String, ChannelLevel>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EffectiveLevel {
    All,
    Mentions,
    Nothing,
}

/// Fully resolved policy for one surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub level: EffectiveLevel,
    pub suppress_everyone: bool,
    pub do_not_disturb: bool,
    pub dm_notifications: bool,
    pub desktop_enabled: bool,
    pub sound_enabled: bool,
}

/// Why a message was relevant to the current user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relevance {
    Direct,
    Everyone,
    Here,
    Dm,
}

impl Relevance {
    pub fn is_broadcast(self) -> bool {
        matches!(self, Relevance::Everyone | Relevance::Here)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateReason {
    DoNotDisturb,
    LevelNothing,
    MentionsOnly,
    EveryoneSuppressed,
    DmDisabled,
}

impl NotificationSettings {
    pub fn resolve(&self, surface_id: &str, kind: &SurfaceKind) -> ResolvedPolicy {
        let base = ResolvedPolicy {
            level: EffectiveLevel::All,
            suppress_everyone: false,
            do_not_disturb: self.global.do_not_disturb,
            dm_notifications: self.global.dm_notifications,
            desktop_enabled: self.global.desktop_enabled,
            sound_enabled: self.global.sound_enabled,
        };
        let Some(node_id) = kind.node_id() else {
            return base;
        };

        let node = self.nodes.get(node_id).copied().unwrap_or_default();
        let node_level = match node.level {
            NodeLevel::All => EffectiveLevel::All,
            NodeLevel::Mentions => EffectiveLevel::Mentions,
            NodeLevel::Nothing => EffectiveLevel::Nothing,
        };
        let level = match self.channels.get(surface_id).copied().unwrap_or_default() {
            ChannelLevel::Default => node_level,
            ChannelLevel::All => EffectiveLevel::All,
            ChannelLevel::Mentions => EffectiveLevel::Mentions,
            ChannelLevel::Nothing => EffectiveLevel::Nothing,
        };
        ResolvedPolicy {
            level,
            suppress_everyone: node.suppress_everyone,
            ..base
        }
    }
}

impl ResolvedPolicy {
    /// Policy gate for a relevant message. `Ok` means the message may be delivered.
    pub fn admit(&self, relevance: Relevance) -> Result<(), GateReason> {
        if self.do_not_disturb {
            return Err(GateReason::DoNotDisturb);
        }
        if relevance == Relevance::Dm {
            return if self.dm_notifications {
                Ok(())
            } else {
                Err(GateReason::DmDisabled)
            };
        }
        match self.level {
            EffectiveLevel::Nothing => Err(GateReason::LevelNothing),
            EffectiveLevel::All => Ok(()),
            EffectiveLevel::Mentions => match relevance {
                Relevance::Direct => Ok(()),
                r if r.is_broadcast() && self.suppress_everyone => {
                    Err(GateReason::EveryoneSuppressed)
                }
                r if r.is_broadcast() => Ok(()),
                _ => Err(GateReason::MentionsOnly),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(node: &str) -> SurfaceKind {
        SurfaceKind::Channel {
            node_id: node.into(),
        }
    }

    #[test]
    fn defaults_pass_everything() {
        let s = NotificationSettings::default();
        let p = s.resolve("general", &channel("n1"));
        assert_eq!(p.level, EffectiveLevel::All);
        assert!(p.admit(Relevance::Everyone).is_ok());
        assert!(p.admit(Relevance::Direct).is_ok());
    }

    #[test]
    fn channel_mentions_with_node_suppress_everyone() {
        let mut s = NotificationSettings::default();
        s.nodes.insert(
            "n1".into(),
            NodeOverride {
                level: NodeLevel::All,
                suppress_everyone: true,
            },
        );
        s.channels.insert("general".into(), ChannelLevel::Mentions);
        let p = s.resolve("general", &channel("n1"));
        assert_eq!(p.admit(Relevance::Everyone), Err(GateReason::EveryoneSuppressed));
        assert_eq!(p.admit(Relevance::Here), Err(GateReason::EveryoneSuppressed));
        assert!(p.admit(Relevance::Direct).is_ok());
    }

    #[test]
    fn channel_default_falls_through_to_node() {
        let mut s = NotificationSettings::default();
        s.nodes.insert(
            "n1".into(),
            NodeOverride {
                level: NodeLevel::Nothing,
                suppress_everyone: false,
            },
        );
        s.channels.insert("general".into(), ChannelLevel::Default);
        let p = s.resolve("general", &channel("n1"));
        assert_eq!(p.level, EffectiveLevel::Nothing);
        assert_eq!(p.admit(Relevance::Direct), Err(GateReason::LevelNothing));

        s.channels.insert("general".into(), ChannelLevel::All);
        let p = s.resolve("general", &channel("n1"));
        assert!(p.admit(Relevance::Everyone).is_ok());
    }

    #[test]
    fn dnd_beats_every_level() {
        let mut s = NotificationSettings::default();
        s.global.do_not_disturb = true;
        s.channels.insert("general".into(), ChannelLevel::All);
        let p = s.resolve("general", &channel("n1"));
        assert_eq!(p.admit(Relevance::Direct), Err(GateReason::DoNotDisturb));
        let dm = s.resolve(
            "dm:bob",
            &SurfaceKind::Conversation {
                peer_id: "bob".into(),
            },
        );
        assert_eq!(dm.admit(Relevance::Dm), Err(GateReason::DoNotDisturb));
    }

    #[test]
    fn dm_toggle_controls_conversations_only() {
        let mut s = NotificationSettings::default();
        s.global.dm_notifications = false;
        let kind = SurfaceKind::Conversation {
            peer_id: "bob".into(),
        };
        let p = s.resolve("dm:bob", &kind);
        assert_eq!(p.admit(Relevance::Dm), Err(GateReason::DmDisabled));
        let ch = s.resolve("general", &channel("n1"));
        assert!(ch.admit(Relevance::Direct).is_ok());
    }

    #[test]
    fn settings_json_tolerates_missing_fields() {
        let s: NotificationSettings =
            serde_json::from_str(r#"{"channels":{"general":"mentions"}}"#).unwrap();
        assert_eq!(s.global, GlobalSettings::default());
        assert_eq!(s.channels.get("general"), Some(&ChannelLevel::Mentions));
    }
}
