use anyhow::Context;
use std::path::Path;
use tickd_core::action::ActionType;
use tickd_core::queue::ActionQueue;

use super::open;
use crate::output::print_json;

fn read_payload(inline: Option<&str>, file: Option<&Path>) -> anyhow::Result<serde_json::Value> {
    let raw = match (inline, file) {
        (Some(s), _) => s.to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => return Ok(serde_json::json!({})),
    };
    serde_json::from_str(&raw).context("payload is not valid JSON")
}

pub fn run(
    root: &Path,
    action_type: &str,
    key: &str,
    payload: Option<&str>,
    payload_file: Option<&Path>,
    json: bool,
) -> anyhow::Result<()> {
    let action_type: ActionType = action_type.parse()?;
    let payload = read_payload(payload, payload_file)?;
    let (config, store) = open(root)?;
    let queue = ActionQueue::from_config(store, &config);
    let action = queue.enqueue(action_type, payload, key)?;

    if json {
        return print_json(&action);
    }
    println!(
        "{} {} [{}] key={} attempts={}/{}",
        action.id,
        action.action_type,
        action.status,
        action.idempotency_key,
        action.attempts,
        action.max_attempts
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_defaults_to_empty_object() {
        assert_eq!(read_payload(None, None).unwrap(), serde_json::json!({}));
    }

    #[test]
    fn inline_payload_must_be_json() {
        assert_eq!(
            read_payload(Some(r#"{"to":"ops"}"#), None).unwrap()["to"],
            "ops"
        );
        assert!(read_payload(Some("{not json"), None).is_err());
    }
}
