use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tickd_core::adapter::AdapterRegistry;
use tickd_core::daemon::Daemon;
use tickd_server::state::AppState;

use super::open;
use super::run::stop_on_interrupt;

pub fn run(root: &Path, port: u16, with_daemon: bool) -> anyhow::Result<()> {
    let (config, store) = open(root)?;
    // One store handle for both halves: redb allows a single open per process.
    let app_state = AppState::new(Arc::clone(&store), &config);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        if !with_daemon {
            return tickd_server::serve(app_state, port).await;
        }

        let registry = AdapterRegistry::from_config(&config).context("failed to build adapters")?;
        let daemon = Daemon::new(config, store, registry).context("invalid daemon config")?;
        stop_on_interrupt(daemon.shutdown_handle());
        tokio::select! {
            served = tickd_server::serve(app_state, port) => served,
            summary = daemon.run(None) => {
                let summary = summary?;
                tracing::info!(reason = ?summary.stop_reason, "executor stopped, shutting down API");
                Ok(())
            }
        }
    })
}
