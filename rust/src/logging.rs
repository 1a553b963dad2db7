/// Logging initialization.
///
/// Installs a `tracing-subscriber` fmt subscriber writing to stderr. `RUST_LOG`
/// wins when set; otherwise the engine logs at debug and everything else at info.
///
/// Called once at the start of `NodesApp::new()`; later calls are no-ops.
pub fn init_logging(data_dir: &str) {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nodes_core=debug,info".into()),
        )
        .with_target(true)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!(data_dir = %data_dir, "logging initialized");
    }
}
