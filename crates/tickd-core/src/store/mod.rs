//! Durable store adapter.
//!
//! Five logical relations (`control_flags`, `lease`, `actions`,
//! `tick_ledger`, `execution_log`) behind one [`Store`] trait. Every
//! correctness-relevant mutation is a conditional write: the caller supplies
//! a closure that sees the current row and returns the replacement (or `None`
//! to decline), and the backend evaluates it inside a single write
//! transaction. Policy stays with the caller; atomicity stays with the store.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::action::{Action, ActionStatus};
use crate::adapter::AdapterError;
use crate::config::{Backend, StoreConfig};
use crate::control::ControlFlags;
use crate::error::Result;
use crate::lease::Lease;
use crate::ledger::{ExecutionLogEntry, TickRecord};

mod redb_store;
mod sqlite_store;

pub use redb_store::RedbStore;
pub use sqlite_store::SqliteStore;

pub trait Store: Send + Sync {
    // -- control_flags ------------------------------------------------------

    fn read_control(&self) -> Result<ControlFlags>;

    /// Conditionally replace the control row. Returns the row as stored
    /// afterwards, whether or not `f` produced a change.
    fn update_control(
        &self,
        f: &dyn Fn(&ControlFlags) -> Option<ControlFlags>,
    ) -> Result<ControlFlags>;

    // -- lease --------------------------------------------------------------

    fn read_lease(&self) -> Result<Option<Lease>>;

    /// Conditionally write the lease row. Returns the written lease, or
    /// `None` when `f` declined.
    fn update_lease(&self, f: &dyn Fn(Option<&Lease>) -> Option<Lease>) -> Result<Option<Lease>>;

    // -- actions ------------------------------------------------------------

    /// Insert `action` unless its idempotency key is already present.
    ///
    /// Returns the stored record and whether this call inserted it.
    fn insert_action(&self, action: &Action) -> Result<(Action, bool)>;

    fn get_action(&self, id: Uuid) -> Result<Option<Action>>;

    fn get_action_by_key(&self, idempotency_key: &str) -> Result<Option<Action>>;

    /// Conditionally replace one action. `ActionNotFound` if `id` is unknown;
    /// `Ok(None)` when `f` declined.
    fn update_action(
        &self,
        id: Uuid,
        f: &dyn Fn(&Action) -> Option<Action>,
    ) -> Result<Option<Action>>;

    /// `update_action`, plus one execution-log entry for the new row under
    /// `tick_id`, committed in the same transaction. Declines write nothing.
    fn update_action_logged(
        &self,
        id: Uuid,
        tick_id: Uuid,
        f: &dyn Fn(&Action) -> Option<Action>,
    ) -> Result<Option<Action>>;

    /// Select up to `limit` actions due at `now` in creation order, rewrite
    /// each through `f`, and persist them, all in one transaction.
    ///
    /// A due row this build cannot decode is dead-lettered in place and
    /// skipped, so it never blocks the rows behind it.
    fn claim_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        f: &dyn Fn(&Action) -> Action,
    ) -> Result<Vec<Action>>;

    /// Actions in creation order, optionally filtered by status. Rows that
    /// cannot be decoded are skipped with a warning.
    fn list_actions(&self, status: Option<ActionStatus>, limit: Option<usize>)
        -> Result<Vec<Action>>;

    /// Counts of actions per status; statuses with no rows are omitted.
    fn count_by_status(&self) -> Result<BTreeMap<ActionStatus, u64>>;

    // -- tick_ledger / execution_log ----------------------------------------

    fn append_tick(&self, record: &TickRecord) -> Result<()>;

    /// Newest first.
    fn recent_ticks(&self, limit: usize) -> Result<Vec<TickRecord>>;

    /// Newest first.
    fn recent_log(&self, limit: usize) -> Result<Vec<ExecutionLogEntry>>;

    /// Every attempt recorded for one action, oldest first.
    fn log_for_action(&self, action_id: Uuid) -> Result<Vec<ExecutionLogEntry>>;
}

/// Open (creating if needed) the configured backend under `root`.
pub fn open_store(root: &Path, config: &StoreConfig) -> Result<Arc<dyn Store>> {
    let path = config.resolve_path(root);
    let store: Arc<dyn Store> = match config.backend {
        Backend::Sqlite => Arc::new(SqliteStore::open(&path)?),
        Backend::Redb => Arc::new(RedbStore::open(&path)?),
    };
    tracing::debug!(backend = ?config.backend, path = %path.display(), "store opened");
    Ok(store)
}

/// Rewrite a stored action body that this build cannot decode (a newer
/// release's `action_type`, say) as `DEAD_LETTER` with a permanent error,
/// leaving every other field as written. `None` when the body is not a JSON
/// object at all; the backend then only moves the row's status.
pub(crate) fn dead_letter_raw(body: &[u8], error: &serde_json::Error) -> Option<String> {
    let mut value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let record = value.as_object_mut()?;
    let reason = AdapterError::permanent(format!("undecodable action record: {error}"));
    record.insert("status".into(), ActionStatus::DeadLetter.as_str().into());
    record.insert("last_error".into(), reason.to_string().into());
    record.insert(
        "updated_at".into(),
        serde_json::to_value(Utc::now()).ok()?,
    );
    tracing::warn!(
        id = record.get("id").and_then(|v| v.as_str()).unwrap_or("-"),
        error = %error,
        "undecodable action dead-lettered"
    );
    serde_json::to_string(&value).ok()
}

/// Microseconds since the epoch, clamped at zero; used for ordering keys.
pub(crate) fn ts_micros(ts: DateTime<Utc>) -> u64 {
    ts.timestamp_micros().max(0) as u64
}

// ---------------------------------------------------------------------------
// Backend-agnostic behaviour checks, run against every backend
// ---------------------------------------------------------------------------
