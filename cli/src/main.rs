use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use nodes_core::memory::{JsonFileStore, MemoryTransport, RecordingAlerts};
use nodes_core::{
    AppAction, Collaborators, InboundEvent, NavigationState, NodesApp, SessionState,
    SubscriptionStatus, SurfaceDescriptor,
};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "nodes-cli")]
#[command(about = "Drive the chat ingestion and notification engine against a loopback transport")]
struct Cli {
    /// Data directory (engine config + persisted notifications live here between runs)
    #[arg(long, default_value = ".nodes-cli", env = "NODES_DATA_DIR")]
    data_dir: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the default engine config
    DefaultConfig,

    /// Replay a scripted backlog, publish live events, and print the resulting state
    Simulate {
        /// Scenario JSON file (built-in demo scenario when omitted)
        #[arg(long)]
        scenario: Option<PathBuf>,

        /// Local user id
        #[arg(long, default_value = "u-alice")]
        user: String,

        /// Local display name (used for @mention matching)
        #[arg(long, default_value = "Alice")]
        display_name: String,

        /// Seconds to wait for each phase to settle
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

/// A scripted run: surfaces to track, events already on the transport, and
/// events published once every surface is live.
#[derive(Debug, Deserialize)]
struct Scenario {
    surfaces: Vec<SurfaceDescriptor>,
    #[serde(default)]
    backlog: Vec<InboundEvent>,
    #[serde(default)]
    live: Vec<InboundEvent>,
    /// Surface to open after the live events land.
    #[serde(default)]
    open: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match &cli.cmd {
        Command::DefaultConfig => cmd_default_config(),
        Command::Simulate {
            scenario,
            user,
            display_name,
            timeout,
        } => cmd_simulate(
            &cli,
            scenario.as_deref(),
            user,
            display_name,
            Duration::from_secs(*timeout),
        ),
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn print(v: serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(&v).expect("json encode"));
}

fn wait_for(
    what: &str,
    timeout: Duration,
    mut done: impl FnMut() -> bool,
) -> anyhow::Result<()> {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if done() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    Err(anyhow!("timed out waiting for {what}"))
}

fn load_scenario(path: Option<&Path>) -> anyhow::Result<Scenario> {
    let Some(path) = path else {
        return Ok(demo_scenario());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read scenario {}", path.display()))?;
    let scenario: Scenario = serde_json::from_str(&raw).context("parse scenario json")?;
    if scenario.surfaces.is_empty() {
        bail!("scenario has no surfaces");
    }
    Ok(scenario)
}

fn demo_scenario() -> Scenario {
    Scenario {
        surfaces: vec![
            SurfaceDescriptor::channel("general", "node-1").with_last_read_at(100),
            SurfaceDescriptor::conversation("dm:bob", "bob"),
        ],
        backlog: vec![
            InboundEvent::text("a", "general", "bob", 101, "morning all"),
            InboundEvent::text("b", "general", "bob", 99, "read already"),
            InboundEvent::text("d1", "dm:bob", "bob", 50, "ping me when you're in"),
        ],
        live: vec![
            InboundEvent::text("c", "general", "carol", 200, "@alice can you review?"),
            InboundEvent::text("c", "general", "carol", 200, "@alice can you review?"),
            InboundEvent::text("e", "general", "dave", 201, "@everyone deploy at 5"),
        ],
        open: None,
    }
}

// ── Commands ────────────────────────────────────────────────────────────────

fn cmd_default_config() -> anyhow::Result<()> {
    let v: serde_json::Value =
        serde_json::from_str(&nodes_core::default_config_json()).context("parse default config")?;
    print(json!({
        "file": nodes_core::config_file_name(),
        "config": v,
    }));
    Ok(())
}

fn cmd_simulate(
    cli: &Cli,
    scenario: Option<&Path>,
    user: &str,
    display_name: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let scenario = load_scenario(scenario)?;
    std::fs::create_dir_all(&cli.data_dir)
        .with_context(|| format!("create data dir {}", cli.data_dir.display()))?;

    let transport = MemoryTransport::new();
    let mut backlog: BTreeMap<String, Vec<InboundEvent>> = BTreeMap::new();
    for ev in scenario.backlog {
        backlog.entry(ev.surface_id.clone()).or_default().push(ev);
    }
    for (surface_id, events) in backlog {
        transport.seed_backlog(&surface_id, events);
    }

    let nav = NavigationState::default();
    let alerts = Arc::new(RecordingAlerts::default());
    let app = NodesApp::new(
        cli.data_dir.to_string_lossy().to_string(),
        Collaborators {
            transport: Arc::new(transport.clone()),
            store: Arc::new(JsonFileStore::new(&cli.data_dir)),
            active_view: Arc::new(nav.clone()),
            alerts: alerts.clone(),
        },
    );

    app.dispatch(AppAction::Login {
        user_id: user.to_string(),
        display_name: display_name.to_string(),
    });
    wait_for("session", timeout, || {
        matches!(app.state().session, SessionState::Ready { .. })
    })?;

    let surface_ids: Vec<String> = scenario
        .surfaces
        .iter()
        .map(|s| s.surface_id.clone())
        .collect();
    app.dispatch(AppAction::ReconcileSurfaces {
        desired: scenario.surfaces,
    });
    wait_for("surfaces to settle", timeout, || {
        let state = app.state();
        surface_ids.iter().all(|id| {
            state.surface(id).is_some_and(|s| {
                matches!(
                    s.status,
                    SubscriptionStatus::Live | SubscriptionStatus::Failed
                )
            })
        })
    })?;
    let after_replay = app.state();

    let mut published = 0usize;
    for ev in scenario.live {
        published += transport.publish(ev);
    }
    // Give the dispatcher a few flush windows.
    std::thread::sleep(Duration::from_millis(200));

    if let Some(surface_id) = scenario.open {
        nav.set_active(Some(&surface_id));
        app.dispatch(AppAction::OpenSurface {
            surface_id: surface_id.clone(),
        });
        wait_for("open surface", timeout, || {
            app.state().unread_for(&surface_id) == 0
        })?;
    }
    tracing::debug!(published, "simulation settled");

    let state = app.state();
    let desktop: Vec<serde_json::Value> = alerts
        .desktop_alerts()
        .into_iter()
        .map(|a| {
            json!({
                "title": a.title,
                "body": a.body,
                "surface_id": a.surface_id,
            })
        })
        .collect();
    print(json!({
        "unread_after_replay": after_replay.unread_total,
        "published_deliveries": published,
        "desktop_alerts": desktop,
        "sounds": alerts.sound_count(),
        "state": state,
    }));
    Ok(())
}
