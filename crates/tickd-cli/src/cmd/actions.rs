use anyhow::Context;
use clap::Subcommand;
use std::path::Path;
use tickd_core::action::ActionStatus;
use tickd_core::queue::ActionQueue;
use uuid::Uuid;

use super::open;
use crate::output::{print_json, print_table, truncate};

#[derive(Subcommand, Debug)]
pub enum ActionsSubcommand {
    /// List actions in creation order
    List {
        /// Only actions in this status (e.g. PENDING, DEAD_LETTER)
        #[arg(long)]
        status: Option<String>,
        /// Maximum number of rows
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one action and its execution history
    Show {
        /// Action id
        #[arg(required_unless_present = "key", conflicts_with = "key")]
        id: Option<String>,
        /// Look the action up by idempotency key instead
        #[arg(long)]
        key: Option<String>,
    },
}

fn queue(root: &Path) -> anyhow::Result<ActionQueue> {
    let (config, store) = open(root)?;
    Ok(ActionQueue::from_config(store, &config))
}

fn parse_id(raw: &str) -> anyhow::Result<Uuid> {
    raw.parse::<Uuid>()
        .with_context(|| format!("invalid action id '{raw}'"))
}

pub fn run(root: &Path, subcommand: ActionsSubcommand, json: bool) -> anyhow::Result<()> {
    match subcommand {
        ActionsSubcommand::List { status, limit } => list(root, status.as_deref(), limit, json),
        ActionsSubcommand::Show { id, key } => show(root, id.as_deref(), key.as_deref(), json),
    }
}

fn list(root: &Path, status: Option<&str>, limit: Option<usize>, json: bool) -> anyhow::Result<()> {
    let status = status.map(|s| s.parse::<ActionStatus>()).transpose()?;
    let actions = queue(root)?.list(status, limit)?;

    if json {
        return print_json(&actions);
    }
    if actions.is_empty() {
        println!("no actions");
        return Ok(());
    }
    let rows = actions
        .iter()
        .map(|a| {
            vec![
                a.id.to_string(),
                a.action_type.to_string(),
                a.status.to_string(),
                format!("{}/{}", a.attempts, a.max_attempts),
                truncate(&a.idempotency_key, 24),
                a.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();
    print_table(
        &["ID", "TYPE", "STATUS", "ATTEMPTS", "KEY", "CREATED"],
        rows,
    );
    Ok(())
}

fn show(root: &Path, id: Option<&str>, key: Option<&str>, json: bool) -> anyhow::Result<()> {
    let queue = queue(root)?;
    let action = match (id, key) {
        (Some(id), _) => queue.get(parse_id(id)?)?,
        (None, Some(key)) => queue
            .get_by_key(key)?
            .with_context(|| format!("no action with idempotency key '{key}'"))?,
        (None, None) => anyhow::bail!("an action id or --key is required"),
    };
    let history = queue.history(action.id)?;

    if json {
        return print_json(&serde_json::json!({
            "action": action,
            "history": history,
        }));
    }

    println!("id:       {}", action.id);
    println!("type:     {}", action.action_type);
    println!("status:   {}", action.status);
    println!("key:      {}", action.idempotency_key);
    println!("attempts: {}/{}", action.attempts, action.max_attempts);
    println!("payload:  {}", action.payload);
    if let Some(err) = &action.last_error {
        println!("error:    {err}");
    }
    if let Some(artifact) = &action.artifact_ref {
        println!("artifact: {artifact}");
    }
    if !history.is_empty() {
        println!();
        let rows = history
            .iter()
            .map(|e| {
                vec![
                    e.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                    e.tick_id.to_string(),
                    e.outcome.to_string(),
                    truncate(&e.detail, 60),
                ]
            })
            .collect();
        print_table(&["AT", "TICK", "OUTCOME", "DETAIL"], rows);
    }
    Ok(())
}

pub fn requeue(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let id = parse_id(id)?;
    let action = queue(root)?.requeue(id)?;
    if json {
        return print_json(&action);
    }
    println!("{} requeued [{}]", action.id, action.status);
    Ok(())
}
