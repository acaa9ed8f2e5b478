//! Action data model for the tick executor.
//!
//! An `Action` is the atomic unit of follow-through work: a typed tag saying
//! which integration to invoke, an opaque JSON payload, and the bookkeeping the
//! queue needs to deliver it at least once and deduplicate it to one effect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, TickdError};

// ---------------------------------------------------------------------------
// ActionType
// ---------------------------------------------------------------------------

/// The fixed set of integrations an action can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    PostSocial,
    SendMessage,
    SendEmail,
    CrmSync,
    Webhook,
}

impl ActionType {
    pub fn all() -> &'static [ActionType] {
        &[
            ActionType::PostSocial,
            ActionType::SendMessage,
            ActionType::SendEmail,
            ActionType::CrmSync,
            ActionType::Webhook,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::PostSocial => "POST_SOCIAL",
            ActionType::SendMessage => "SEND_MESSAGE",
            ActionType::SendEmail => "SEND_EMAIL",
            ActionType::CrmSync => "CRM_SYNC",
            ActionType::Webhook => "WEBHOOK",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionType {
    type Err = TickdError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        ActionType::all()
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| TickdError::InvalidActionType(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// ActionStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of an action.
///
/// Transitions: `Pending → Running → Success | FailedRetry | DeadLetter`, and
/// `FailedRetry → Running` once its backoff has elapsed. `Success` and
/// `DeadLetter` are terminal; only an operator requeue leaves `DeadLetter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Pending,
    Running,
    Success,
    FailedRetry,
    DeadLetter,
}

impl ActionStatus {
    pub fn all() -> &'static [ActionStatus] {
        &[
            ActionStatus::Pending,
            ActionStatus::Running,
            ActionStatus::Success,
            ActionStatus::FailedRetry,
            ActionStatus::DeadLetter,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Pending => "PENDING",
            ActionStatus::Running => "RUNNING",
            ActionStatus::Success => "SUCCESS",
            ActionStatus::FailedRetry => "FAILED_RETRY",
            ActionStatus::DeadLetter => "DEAD_LETTER",
        }
    }

    /// Whether a claimer may pick this action up (subject to `available_at`).
    pub fn is_claimable(self) -> bool {
        matches!(self, ActionStatus::Pending | ActionStatus::FailedRetry)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = TickdError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        ActionStatus::all()
            .iter()
            .copied()
            .find(|st| st.as_str() == normalized)
            .ok_or_else(|| TickdError::Config(format!("unknown action status '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    /// Caller-supplied token collapsing duplicate submissions into this record.
    pub idempotency_key: String,
    pub action_type: ActionType,
    pub payload: serde_json::Value,
    pub status: ActionStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest instant a claimer may pick the action up. Pushed out by retry
    /// backoff; equal to `created_at` for fresh submissions.
    pub available_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Owner that moved the action to `Running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    /// Lease epoch under which the action was claimed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fencing_token: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
}

impl Action {
    /// Create a new action in `Pending` state, immediately claimable.
    pub fn new(
        action_type: ActionType,
        payload: serde_json::Value,
        idempotency_key: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            idempotency_key: idempotency_key.into(),
            action_type,
            payload,
            status: ActionStatus::Pending,
            attempts: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
            available_at: now,
            last_error: None,
            claimed_by: None,
            fencing_token: None,
            artifact_ref: None,
        }
    }

    /// Whether the action is claimable at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.available_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_type_parses_loose_spellings() {
        assert_eq!(
            "post_social".parse::<ActionType>().unwrap(),
            ActionType::PostSocial
        );
        assert_eq!(
            "SEND-MESSAGE".parse::<ActionType>().unwrap(),
            ActionType::SendMessage
        );
        assert!(matches!(
            "FAX".parse::<ActionType>(),
            Err(TickdError::InvalidActionType(_))
        ));
    }

    #[test]
    fn action_type_serializes_as_tag() {
        let json = serde_json::to_string(&ActionType::CrmSync).unwrap();
        assert_eq!(json, "\"CRM_SYNC\"");
    }

    #[test]
    fn new_action_is_pending_and_due() {
        let action = Action::new(
            ActionType::SendEmail,
            serde_json::json!({"to": "ops@example.com"}),
            "k1",
            3,
        );
        assert_eq!(action.status, ActionStatus::Pending);
        assert_eq!(action.attempts, 0);
        assert!(action.is_due(Utc::now()));
    }

    #[test]
    fn claimable_statuses() {
        assert!(ActionStatus::Pending.is_claimable());
        assert!(ActionStatus::FailedRetry.is_claimable());
        assert!(!ActionStatus::Success.is_claimable());
        assert!(!ActionStatus::DeadLetter.is_claimable());
        assert!(!ActionStatus::Running.is_claimable());
    }
}
