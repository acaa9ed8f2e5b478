use std::path::Path;
use tickd_core::control::{ControlFlags, ControlSurface, Mode};

use super::{open, yes_no};
use crate::output::print_json;

fn surface(root: &Path) -> anyhow::Result<ControlSurface> {
    let (config, store) = open(root)?;
    Ok(ControlSurface::new(store, config.status_recent))
}

fn report(flags: &ControlFlags, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(flags);
    }
    println!(
        "mode: {}  paused: {}  killed: {}  (version {})",
        flags.mode,
        yes_no(flags.paused),
        yes_no(flags.killed),
        flags.version
    );
    Ok(())
}

pub fn pause(root: &Path, json: bool) -> anyhow::Result<()> {
    report(&surface(root)?.pause()?, json)
}

pub fn resume(root: &Path, json: bool) -> anyhow::Result<()> {
    report(&surface(root)?.resume()?, json)
}

pub fn kill(root: &Path, clear: bool, json: bool) -> anyhow::Result<()> {
    report(&surface(root)?.set_killed(!clear)?, json)
}

pub fn mode(root: &Path, mode: Option<&str>, json: bool) -> anyhow::Result<()> {
    let control = surface(root)?;
    let flags = match mode {
        Some(raw) => control.set_mode(raw.parse::<Mode>()?)?,
        None => control.flags()?,
    };
    report(&flags, json)
}
