pub mod actions;
pub mod control;
pub mod enqueue;
pub mod init;
pub mod run;
pub mod serve;
pub mod status;

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tickd_core::config::Config;
use tickd_core::store::{self, Store};

/// Load the project config and open its store.
pub fn open(root: &Path) -> anyhow::Result<(Config, Arc<dyn Store>)> {
    let config = Config::load(root).context("failed to load .tickd/config.yaml")?;
    let store = store::open_store(root, &config.store).with_context(|| {
        format!(
            "failed to open store at {}",
            config.store.resolve_path(root).display()
        )
    })?;
    Ok((config, store))
}

pub fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}
