use anyhow::Context;
use std::path::Path;
use tickd_core::adapter::AdapterRegistry;
use tickd_core::daemon::{Daemon, ShutdownHandle};

use super::open;
use crate::output::print_json;

/// Stop after the current tick on Ctrl-C. Leaves the shared control row alone.
pub fn stop_on_interrupt(handle: ShutdownHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping after the current tick");
            handle.shutdown();
        }
    });
}

pub fn run(root: &Path, max_ticks: Option<u64>, json: bool) -> anyhow::Result<()> {
    let (config, store) = open(root)?;
    let registry = AdapterRegistry::from_config(&config).context("failed to build adapters")?;
    let daemon = Daemon::new(config, store, registry).context("invalid daemon config")?;

    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(async {
        stop_on_interrupt(daemon.shutdown_handle());
        daemon.run(max_ticks).await
    })?;

    if json {
        return print_json(&summary);
    }
    println!(
        "stopped ({:?}): {} iteration(s), {} as leader [owner {}]",
        summary.stop_reason, summary.iterations, summary.ticks_led, summary.owner_id
    );
    Ok(())
}
