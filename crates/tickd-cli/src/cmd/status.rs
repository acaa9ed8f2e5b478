use std::path::Path;
use tickd_core::control::ControlSurface;

use super::{open, yes_no};
use crate::output::{print_json, print_table, truncate};

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let (config, store) = open(root)?;
    let status = ControlSurface::new(store, config.status_recent).get_status()?;

    if json {
        return print_json(&status);
    }

    let c = &status.control;
    println!(
        "mode: {}  paused: {}  killed: {}  (version {})",
        c.mode,
        yes_no(c.paused),
        yes_no(c.killed),
        c.version
    );
    match &status.lease {
        Some(lease) => println!(
            "lease: {} token={} expires={} {}",
            lease.owner_id,
            lease.fencing_token,
            lease.expires_at.format("%Y-%m-%d %H:%M:%S"),
            if lease.active { "(active)" } else { "(expired)" }
        ),
        None => println!("lease: none"),
    }
    let depth: Vec<String> = status
        .queue_depth
        .iter()
        .map(|(s, n)| format!("{s}={n}"))
        .collect();
    println!("queue: {}", depth.join("  "));

    if !status.recent_ticks.is_empty() {
        println!("\nRecent ticks:");
        let rows = status
            .recent_ticks
            .iter()
            .map(|t| {
                vec![
                    t.started_at.format("%H:%M:%S").to_string(),
                    t.owner_id.clone(),
                    t.fencing_token.to_string(),
                    t.actions_attempted.to_string(),
                    t.actions_succeeded.to_string(),
                    t.actions_failed.to_string(),
                    t.duration_ms.to_string(),
                    t.outcome.to_string(),
                ]
            })
            .collect();
        print_table(
            &["STARTED", "OWNER", "TOKEN", "TRIED", "OK", "FAILED", "MS", "OUTCOME"],
            rows,
        );
    }

    if !status.recent_executions.is_empty() {
        println!("\nRecent executions:");
        let rows = status
            .recent_executions
            .iter()
            .map(|e| {
                vec![
                    e.timestamp.format("%H:%M:%S").to_string(),
                    e.action_id.to_string(),
                    e.outcome.to_string(),
                    truncate(&e.detail, 60),
                ]
            })
            .collect();
        print_table(&["AT", "ACTION", "OUTCOME", "DETAIL"], rows);
    }

    if !status.dead_letters.is_empty() {
        println!("\nDead letters:");
        let rows = status
            .dead_letters
            .iter()
            .map(|a| {
                vec![
                    a.id.to_string(),
                    a.action_type.to_string(),
                    a.attempts.to_string(),
                    truncate(a.last_error.as_deref().unwrap_or("-"), 60),
                ]
            })
            .collect();
        print_table(&["ID", "TYPE", "ATTEMPTS", "LAST ERROR"], rows);
    }
    Ok(())
}
