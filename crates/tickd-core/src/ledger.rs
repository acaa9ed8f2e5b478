//! Append-only audit records: one `TickRecord` per loop iteration that held
//! the lease, one `ExecutionLogEntry` per action-execution attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::action::{Action, ActionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    /// Every claimed action was attempted.
    Completed,
    /// Control flags had `paused` set; nothing was claimed.
    Paused,
    /// The wall-clock ceiling cut the batch short.
    DeadlineExceeded,
    /// Renewal between actions failed; the rest of the batch was released.
    LeaseLost,
    /// A store error cut the batch short; unstarted claims were released.
    Aborted,
}

impl fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TickOutcome::Completed => "completed",
            TickOutcome::Paused => "paused",
            TickOutcome::DeadlineExceeded => "deadline_exceeded",
            TickOutcome::LeaseLost => "lease_lost",
            TickOutcome::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    pub tick_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub owner_id: String,
    pub fencing_token: u64,
    pub actions_attempted: u32,
    pub actions_succeeded: u32,
    pub actions_failed: u32,
    pub duration_ms: u64,
    pub outcome: TickOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOutcome {
    Success,
    FailedRetry,
    DeadLetter,
}

impl LogOutcome {
    /// The log outcome implied by the status an attempt left the action in.
    pub fn for_status(status: ActionStatus) -> Self {
        match status {
            ActionStatus::Success => LogOutcome::Success,
            ActionStatus::DeadLetter => LogOutcome::DeadLetter,
            _ => LogOutcome::FailedRetry,
        }
    }
}

impl fmt::Display for LogOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogOutcome::Success => "success",
            LogOutcome::FailedRetry => "failed_retry",
            LogOutcome::DeadLetter => "dead_letter",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: Uuid,
    pub action_id: Uuid,
    pub tick_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub outcome: LogOutcome,
    /// Artifact reference on success, error text otherwise.
    pub detail: String,
}

impl ExecutionLogEntry {
    /// Build the entry for an attempt that left `action` in its current state.
    pub fn for_attempt(tick_id: Uuid, action: &Action) -> Self {
        let outcome = LogOutcome::for_status(action.status);
        let detail = match outcome {
            LogOutcome::Success => action.artifact_ref.clone().unwrap_or_default(),
            _ => action.last_error.clone().unwrap_or_default(),
        };
        Self {
            id: Uuid::new_v4(),
            action_id: action.id,
            tick_id,
            timestamp: Utc::now(),
            outcome,
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionType;

    #[test]
    fn entry_detail_follows_outcome() {
        let tick = Uuid::new_v4();
        let mut action = Action::new(ActionType::Webhook, serde_json::json!({}), "k", 3);

        action.status = ActionStatus::Success;
        action.artifact_ref = Some("proof:sha256:abc".into());
        let ok = ExecutionLogEntry::for_attempt(tick, &action);
        assert_eq!(ok.outcome, LogOutcome::Success);
        assert_eq!(ok.detail, "proof:sha256:abc");

        action.status = ActionStatus::Pending;
        action.last_error = Some("[transient] timeout".into());
        let retry = ExecutionLogEntry::for_attempt(tick, &action);
        assert_eq!(retry.outcome, LogOutcome::FailedRetry);
        assert_eq!(retry.detail, "[transient] timeout");

        action.status = ActionStatus::DeadLetter;
        let dead = ExecutionLogEntry::for_attempt(tick, &action);
        assert_eq!(dead.outcome, LogOutcome::DeadLetter);
    }
}
