//! Durable, idempotent action queue with retry and dead-letter policy.
//!
//! Every transition after the claim is fenced: it only applies while the row
//! is still `Running` under the owner, fencing token and attempt count it
//! was claimed with. A completion arriving from a deposed leader is dropped
//! (`Ok(None)`) instead of overwriting whatever the new leader did.
//!
//! Every charged attempt commits its execution-log entry in the same
//! transaction as the status change, so the log never lags the row.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::action::{Action, ActionStatus, ActionType};
use crate::adapter::AdapterError;
use crate::config::{Config, RetryPolicy};
use crate::error::{Result, TickdError};
use crate::lease::Lease;
use crate::ledger::ExecutionLogEntry;
use crate::store::Store;

pub const ORPHANED_ERROR: &str = "orphaned: owner lost before completion";

/// Whether `current` is still the exact claim the caller holds.
fn still_claimed(current: &Action, claimed: &Action) -> bool {
    current.status == ActionStatus::Running
        && current.fencing_token == claimed.fencing_token
        && current.claimed_by == claimed.claimed_by
        && current.attempts == claimed.attempts
}

/// The row after one failed attempt.
fn after_failure(
    current: &Action,
    error: &AdapterError,
    retry: &RetryPolicy,
    now: DateTime<Utc>,
) -> Action {
    let attempts = current.attempts + 1;
    let mut next = Action {
        attempts,
        updated_at: now,
        last_error: Some(error.to_string()),
        ..current.clone()
    };
    if !error.is_retryable() || attempts >= current.max_attempts {
        next.status = ActionStatus::DeadLetter;
        return next;
    }
    let delay = retry.delay_for(attempts);
    if delay.is_zero() {
        next.status = ActionStatus::Pending;
        next.available_at = now;
    } else {
        next.status = ActionStatus::FailedRetry;
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        next.available_at = now
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
    }
    next
}

#[derive(Clone)]
pub struct ActionQueue {
    store: Arc<dyn Store>,
    max_attempts: u32,
    retry: RetryPolicy,
}

impl ActionQueue {
    pub fn new(store: Arc<dyn Store>, max_attempts: u32, retry: RetryPolicy) -> Self {
        Self {
            store,
            max_attempts,
            retry,
        }
    }

    pub fn from_config(store: Arc<dyn Store>, config: &Config) -> Self {
        Self::new(store, config.max_attempts, config.retry.clone())
    }

    /// Insert a new `Pending` action, or return the existing record for
    /// `idempotency_key` untouched.
    pub fn enqueue(
        &self,
        action_type: ActionType,
        payload: serde_json::Value,
        idempotency_key: &str,
    ) -> Result<Action> {
        if idempotency_key.trim().is_empty() {
            return Err(TickdError::Config("idempotency key must not be empty".into()));
        }
        let candidate = Action::new(action_type, payload, idempotency_key, self.max_attempts);
        let (action, inserted) = self.store.insert_action(&candidate)?;
        if inserted {
            tracing::info!(action_id = %action.id, %action_type, idempotency_key, "action enqueued");
        } else {
            tracing::debug!(
                action_id = %action.id,
                idempotency_key,
                status = %action.status,
                "duplicate submission, returning existing action"
            );
        }
        Ok(action)
    }

    /// Claim up to `limit` due actions in creation order for `lease`'s owner.
    pub fn claim_batch(&self, limit: usize, lease: &Lease) -> Result<Vec<Action>> {
        let now = Utc::now();
        let claimed = self.store.claim_due(limit, now, &|action| Action {
            status: ActionStatus::Running,
            claimed_by: Some(lease.owner_id.clone()),
            fencing_token: Some(lease.fencing_token),
            updated_at: now,
            ..action.clone()
        })?;
        if !claimed.is_empty() {
            tracing::debug!(
                owner_id = %lease.owner_id,
                fencing_token = lease.fencing_token,
                count = claimed.len(),
                "batch claimed"
            );
        }
        Ok(claimed)
    }

    pub fn mark_success(
        &self,
        claimed: &Action,
        artifact_ref: &str,
        tick_id: Uuid,
    ) -> Result<Option<Action>> {
        let now = Utc::now();
        let updated = self.store.update_action_logged(claimed.id, tick_id, &|current| {
            still_claimed(current, claimed).then(|| Action {
                status: ActionStatus::Success,
                attempts: current.attempts + 1,
                updated_at: now,
                artifact_ref: Some(artifact_ref.to_string()),
                last_error: None,
                ..current.clone()
            })
        })?;
        if updated.is_none() {
            tracing::warn!(action_id = %claimed.id, "success dropped: claim no longer held");
        }
        Ok(updated)
    }

    /// Charge one attempt. Retryable errors go back to the claimable pool
    /// until `max_attempts` is spent; permanent errors dead-letter at once.
    pub fn mark_failed(
        &self,
        claimed: &Action,
        error: &AdapterError,
        tick_id: Uuid,
    ) -> Result<Option<Action>> {
        let now = Utc::now();
        let updated = self.store.update_action_logged(claimed.id, tick_id, &|current| {
            still_claimed(current, claimed).then(|| after_failure(current, error, &self.retry, now))
        })?;
        match &updated {
            Some(a) if a.status == ActionStatus::DeadLetter => tracing::warn!(
                action_id = %a.id,
                attempts = a.attempts,
                error = %error,
                "action dead-lettered"
            ),
            Some(a) => tracing::info!(
                action_id = %a.id,
                attempts = a.attempts,
                available_at = %a.available_at,
                error = %error,
                "action will be retried"
            ),
            None => tracing::warn!(action_id = %claimed.id, "failure dropped: claim no longer held"),
        }
        Ok(updated)
    }

    /// Return an unstarted claim to `Pending` without charging an attempt.
    pub fn release(&self, claimed: &Action) -> Result<Option<Action>> {
        let now = Utc::now();
        self.store.update_action(claimed.id, &|current| {
            still_claimed(current, claimed).then(|| Action {
                status: ActionStatus::Pending,
                claimed_by: None,
                fencing_token: None,
                updated_at: now,
                ..current.clone()
            })
        })
    }

    /// Charge a transient failure to every `Running` row untouched for
    /// `older_than`; their owner died or lost the lease mid-attempt. Each
    /// recovery is logged under `tick_id`.
    pub fn recover_orphans(&self, older_than: Duration, tick_id: Uuid) -> Result<Vec<Action>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| TickdError::Config(format!("orphan window out of range: {e}")))?;
        let error = AdapterError::transient(ORPHANED_ERROR);
        let mut recovered = Vec::new();
        for stale in self
            .store
            .list_actions(Some(ActionStatus::Running), None)?
            .into_iter()
            .filter(|a| a.updated_at <= cutoff)
        {
            let now = Utc::now();
            let updated = self.store.update_action_logged(stale.id, tick_id, &|current| {
                (current.status == ActionStatus::Running && current.updated_at == stale.updated_at)
                    .then(|| after_failure(current, &error, &self.retry, now))
            })?;
            if let Some(action) = updated {
                tracing::warn!(
                    action_id = %action.id,
                    claimed_by = action.claimed_by.as_deref().unwrap_or("-"),
                    status = %action.status,
                    "orphaned action recovered"
                );
                recovered.push(action);
            }
        }
        Ok(recovered)
    }

    /// Operator retry of a dead-lettered action: back to `Pending` with a
    /// fresh attempt budget.
    pub fn requeue(&self, id: Uuid) -> Result<Action> {
        let now = Utc::now();
        let updated = self.store.update_action(id, &|current| {
            (current.status == ActionStatus::DeadLetter).then(|| Action {
                status: ActionStatus::Pending,
                attempts: 0,
                available_at: now,
                updated_at: now,
                claimed_by: None,
                fencing_token: None,
                ..current.clone()
            })
        })?;
        match updated {
            Some(action) => {
                tracing::info!(action_id = %id, "dead-lettered action requeued");
                Ok(action)
            }
            None => {
                let current = self.get(id)?;
                Err(TickdError::InvalidTransition {
                    id: id.to_string(),
                    from: current.status,
                    to: ActionStatus::Pending,
                })
            }
        }
    }

    pub fn get(&self, id: Uuid) -> Result<Action> {
        self.store
            .get_action(id)?
            .ok_or_else(|| TickdError::ActionNotFound(id.to_string()))
    }

    pub fn get_by_key(&self, idempotency_key: &str) -> Result<Option<Action>> {
        self.store.get_action_by_key(idempotency_key)
    }

    pub fn list(&self, status: Option<ActionStatus>, limit: Option<usize>) -> Result<Vec<Action>> {
        self.store.list_actions(status, limit)
    }

    /// Counts per status, zero-filled.
    pub fn depth(&self) -> Result<BTreeMap<ActionStatus, u64>> {
        let mut depth: BTreeMap<ActionStatus, u64> =
            ActionStatus::all().iter().map(|s| (*s, 0)).collect();
        depth.extend(self.store.count_by_status()?);
        Ok(depth)
    }

    /// Execution log for one action, oldest first.
    pub fn history(&self, id: Uuid) -> Result<Vec<ExecutionLogEntry>> {
        self.store.log_for_action(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LogOutcome;
    use crate::store::{RedbStore, SqliteStore};
    use serde_json::json;
    use tempfile::TempDir;

    fn queue(retry: RetryPolicy) -> (TempDir, ActionQueue) {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&dir.path().join("q.db")).unwrap());
        (dir, ActionQueue::new(store, 3, retry))
    }

    fn lease(owner: &str, token: u64) -> Lease {
        let now = Utc::now();
        Lease {
            owner_id: owner.into(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(30),
            fencing_token: token,
        }
    }

    fn tick() -> Uuid {
        Uuid::new_v4()
    }

    fn claim_one(q: &ActionQueue, l: &Lease) -> Action {
        let mut batch = q.claim_batch(1, l).unwrap();
        assert_eq!(batch.len(), 1);
        batch.remove(0)
    }

    #[test]
    fn enqueue_is_idempotent_by_key() {
        let (_dir, q) = queue(RetryPolicy::Immediate);
        let payload = json!({"platform": "x", "message": "hello"});
        let first = q.enqueue(ActionType::PostSocial, payload.clone(), "abc").unwrap();
        let second = q
            .enqueue(ActionType::SendEmail, json!({"different": true}), "abc")
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.action_type, ActionType::PostSocial);
        assert_eq!(second.payload, payload);
        assert_eq!(q.depth().unwrap()[&ActionStatus::Pending], 1);
    }

    #[test]
    fn enqueue_rejects_blank_key() {
        let (_dir, q) = queue(RetryPolicy::Immediate);
        let err = q.enqueue(ActionType::Webhook, json!({}), "  ").unwrap_err();
        assert!(matches!(err, TickdError::Config(_)));
    }

    #[test]
    fn claim_stamps_owner_and_token() {
        let (_dir, q) = queue(RetryPolicy::Immediate);
        q.enqueue(ActionType::Webhook, json!({}), "k").unwrap();
        let action = claim_one(&q, &lease("a", 7));
        assert_eq!(action.status, ActionStatus::Running);
        assert_eq!(action.claimed_by.as_deref(), Some("a"));
        assert_eq!(action.fencing_token, Some(7));
        assert!(q.claim_batch(5, &lease("a", 7)).unwrap().is_empty());
    }

    #[test]
    fn dead_letters_after_exactly_max_attempts() {
        let (_dir, q) = queue(RetryPolicy::Immediate);
        let l = lease("a", 1);
        let enqueued = q.enqueue(ActionType::SendMessage, json!({}), "k").unwrap();
        let err = AdapterError::transient("upstream 503");

        for attempt in 1..=3u32 {
            let claimed = claim_one(&q, &l);
            let after = q.mark_failed(&claimed, &err, tick()).unwrap().unwrap();
            assert_eq!(after.attempts, attempt);
            if attempt < 3 {
                assert_eq!(after.status, ActionStatus::Pending);
            } else {
                assert_eq!(after.status, ActionStatus::DeadLetter);
            }
        }
        let dead = q.get(enqueued.id).unwrap();
        assert_eq!(dead.last_error.as_deref(), Some("[transient] upstream 503"));
        assert!(q.claim_batch(1, &l).unwrap().is_empty());
    }

    #[test]
    fn permanent_failure_dead_letters_immediately() {
        let (_dir, q) = queue(RetryPolicy::Immediate);
        q.enqueue(ActionType::CrmSync, json!({}), "k").unwrap();
        let claimed = claim_one(&q, &lease("a", 1));
        let after = q
            .mark_failed(&claimed, &AdapterError::permanent("schema mismatch"), tick())
            .unwrap()
            .unwrap();
        assert_eq!(after.status, ActionStatus::DeadLetter);
        assert_eq!(after.attempts, 1);
    }

    #[test]
    fn backoff_parks_action_until_available() {
        let (_dir, q) = queue(RetryPolicy::Fixed { delay_ms: 60_000 });
        let l = lease("a", 1);
        q.enqueue(ActionType::SendEmail, json!({}), "k").unwrap();
        let claimed = claim_one(&q, &l);
        let after = q
            .mark_failed(&claimed, &AdapterError::unknown("reset by peer"), tick())
            .unwrap()
            .unwrap();
        assert_eq!(after.status, ActionStatus::FailedRetry);
        assert!(after.available_at > Utc::now() + chrono::Duration::seconds(50));
        assert!(q.claim_batch(1, &l).unwrap().is_empty(), "still backing off");
    }

    #[test]
    fn retried_action_keeps_creation_order() {
        let (_dir, q) = queue(RetryPolicy::Immediate);
        let l = lease("a", 1);
        let first = q.enqueue(ActionType::Webhook, json!({"n": 1}), "k1").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = q.enqueue(ActionType::Webhook, json!({"n": 2}), "k2").unwrap();

        let claimed = claim_one(&q, &l);
        assert_eq!(claimed.id, first.id);
        q.mark_failed(&claimed, &AdapterError::transient("flaky"), tick())
            .unwrap();

        let batch = q.claim_batch(2, &l).unwrap();
        let ids: Vec<Uuid> = batch.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[test]
    fn stale_owner_completion_is_fenced_out() {
        let (_dir, q) = queue(RetryPolicy::Immediate);
        q.enqueue(ActionType::PostSocial, json!({}), "k").unwrap();
        let old = claim_one(&q, &lease("a", 1));

        // Old leader's claim is recovered, then re-claimed by the new leader.
        q.release(&old).unwrap().unwrap();
        let new = claim_one(&q, &lease("b", 2));

        assert!(q.mark_success(&old, "late", tick()).unwrap().is_none());
        let done = q
            .mark_success(&new, "proof:sha256:00", tick())
            .unwrap()
            .unwrap();
        assert_eq!(done.status, ActionStatus::Success);
        assert_eq!(done.artifact_ref.as_deref(), Some("proof:sha256:00"));
    }

    #[test]
    fn release_does_not_charge_an_attempt() {
        let (_dir, q) = queue(RetryPolicy::Immediate);
        q.enqueue(ActionType::PostSocial, json!({}), "k").unwrap();
        let claimed = claim_one(&q, &lease("a", 1));
        let released = q.release(&claimed).unwrap().unwrap();
        assert_eq!(released.status, ActionStatus::Pending);
        assert_eq!(released.attempts, 0);
        assert!(released.claimed_by.is_none());
    }

    #[test]
    fn orphans_are_charged_and_returned() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RedbStore::open(&dir.path().join("o.redb")).unwrap());
        let q = ActionQueue::new(Arc::clone(&store), 3, RetryPolicy::Immediate);
        let action = q.enqueue(ActionType::SendMessage, json!({}), "k").unwrap();
        claim_one(&q, &lease("gone", 1));

        assert!(q
            .recover_orphans(Duration::from_secs(60), tick())
            .unwrap()
            .is_empty());

        // Age the claim past the window.
        store
            .update_action(action.id, &|a| {
                Some(Action {
                    updated_at: a.updated_at - chrono::Duration::minutes(10),
                    ..a.clone()
                })
            })
            .unwrap();
        let sweep = tick();
        let recovered = q.recover_orphans(Duration::from_secs(60), sweep).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].status, ActionStatus::Pending);
        assert_eq!(recovered[0].attempts, 1);
        assert_eq!(
            recovered[0].last_error.as_deref(),
            Some("[transient] orphaned: owner lost before completion")
        );
        let history = q.history(action.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].tick_id, sweep);
        assert_eq!(history[0].outcome, LogOutcome::FailedRetry);
    }

    #[test]
    fn requeue_only_from_dead_letter() {
        let (_dir, q) = queue(RetryPolicy::Immediate);
        let action = q.enqueue(ActionType::PostSocial, json!({}), "k").unwrap();
        assert!(matches!(
            q.requeue(action.id),
            Err(TickdError::InvalidTransition { .. })
        ));

        let claimed = claim_one(&q, &lease("a", 1));
        q.mark_failed(&claimed, &AdapterError::permanent("nope"), tick())
            .unwrap();
        let requeued = q.requeue(action.id).unwrap();
        assert_eq!(requeued.status, ActionStatus::Pending);
        assert_eq!(requeued.attempts, 0);

        assert!(matches!(
            q.requeue(Uuid::new_v4()),
            Err(TickdError::ActionNotFound(_))
        ));
    }

    #[test]
    fn each_charged_attempt_logs_under_its_tick() {
        let (_dir, q) = queue(RetryPolicy::Immediate);
        let l = lease("a", 1);
        let action = q.enqueue(ActionType::Webhook, json!({}), "k").unwrap();
        let first_tick = tick();
        let second_tick = tick();

        let claimed = claim_one(&q, &l);
        q.mark_failed(&claimed, &AdapterError::transient("503"), first_tick)
            .unwrap();
        let claimed = claim_one(&q, &l);
        q.mark_success(&claimed, "proof:sha256:11", second_tick)
            .unwrap();

        // A fenced-out completion writes neither the row nor the log.
        assert!(q.mark_success(&claimed, "again", tick()).unwrap().is_none());

        let history = q.history(action.id).unwrap();
        let seen: Vec<(Uuid, LogOutcome, &str)> = history
            .iter()
            .map(|e| (e.tick_id, e.outcome, e.detail.as_str()))
            .collect();
        assert_eq!(
            seen,
            vec![
                (first_tick, LogOutcome::FailedRetry, "[transient] 503"),
                (second_tick, LogOutcome::Success, "proof:sha256:11"),
            ]
        );
    }
}
