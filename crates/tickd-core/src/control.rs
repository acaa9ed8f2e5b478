//! Runtime control flags and the operator-facing status projection.
//!
//! The flags live in one versioned store row that the executor re-reads at
//! the top of every tick; nothing here is cached in-process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::action::{Action, ActionStatus};
use crate::error::{Result, TickdError};
use crate::lease::Lease;
use crate::ledger::{ExecutionLogEntry, TickRecord};
use crate::store::Store;

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Simulate every action and emit a deterministic artifact instead.
    #[default]
    Proof,
    /// Perform the real external effect.
    Real,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Proof => f.write_str("proof"),
            Mode::Real => f.write_str("real"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = TickdError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proof" => Ok(Mode::Proof),
            "real" => Ok(Mode::Real),
            _ => Err(TickdError::InvalidMode(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// ControlFlags
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFlags {
    pub paused: bool,
    pub killed: bool,
    pub mode: Mode,
    /// Incremented on every effective write.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl ControlFlags {
    /// The row written at bootstrap: running, not killed, proof mode.
    pub fn bootstrap() -> Self {
        Self {
            paused: false,
            killed: false,
            mode: Mode::Proof,
            version: 1,
            updated_at: Utc::now(),
        }
    }
}

/// Apply `change` to `flags`, returning `None` when nothing would change so
/// repeated setter calls leave the version alone.
fn apply(flags: &ControlFlags, change: impl Fn(&mut ControlFlags)) -> Option<ControlFlags> {
    let mut next = flags.clone();
    change(&mut next);
    if next.paused == flags.paused && next.killed == flags.killed && next.mode == flags.mode {
        return None;
    }
    next.version = flags.version + 1;
    next.updated_at = Utc::now();
    Some(next)
}

// ---------------------------------------------------------------------------
// Status projection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct LeaseStatus {
    pub owner_id: String,
    pub expires_at: DateTime<Utc>,
    pub fencing_token: u64,
    pub active: bool,
}

impl LeaseStatus {
    fn from_lease(lease: Lease, now: DateTime<Utc>) -> Self {
        Self {
            active: !lease.is_expired(now),
            owner_id: lease.owner_id,
            expires_at: lease.expires_at,
            fencing_token: lease.fencing_token,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub control: ControlFlags,
    pub lease: Option<LeaseStatus>,
    /// Every status is present, zero-filled.
    pub queue_depth: BTreeMap<ActionStatus, u64>,
    /// Newest first.
    pub recent_ticks: Vec<TickRecord>,
    /// Newest first.
    pub recent_executions: Vec<ExecutionLogEntry>,
    /// Every dead-lettered action awaiting manual triage, most recently
    /// dead-lettered first.
    pub dead_letters: Vec<Action>,
}

// ---------------------------------------------------------------------------
// ControlSurface
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ControlSurface {
    store: Arc<dyn Store>,
    recent: usize,
}

impl ControlSurface {
    /// `recent` bounds the tick and log lists in [`Status`].
    pub fn new(store: Arc<dyn Store>, recent: usize) -> Self {
        Self { store, recent }
    }

    pub fn flags(&self) -> Result<ControlFlags> {
        self.store.read_control()
    }

    pub fn set_paused(&self, paused: bool) -> Result<ControlFlags> {
        self.update(move |f| f.paused = paused)
    }

    pub fn set_killed(&self, killed: bool) -> Result<ControlFlags> {
        self.update(move |f| f.killed = killed)
    }

    pub fn set_mode(&self, mode: Mode) -> Result<ControlFlags> {
        self.update(move |f| f.mode = mode)
    }

    pub fn pause(&self) -> Result<ControlFlags> {
        self.set_paused(true)
    }

    pub fn resume(&self) -> Result<ControlFlags> {
        self.set_paused(false)
    }

    pub fn kill(&self) -> Result<ControlFlags> {
        self.set_killed(true)
    }

    fn update(&self, change: impl Fn(&mut ControlFlags)) -> Result<ControlFlags> {
        let flags = self.store.update_control(&|current| apply(current, &change))?;
        tracing::info!(
            paused = flags.paused,
            killed = flags.killed,
            mode = %flags.mode,
            version = flags.version,
            "control flags"
        );
        Ok(flags)
    }

    /// Read-only composite of control, lease, queue and ledger state.
    pub fn get_status(&self) -> Result<Status> {
        let now = Utc::now();
        let control = self.store.read_control()?;
        let lease = self
            .store
            .read_lease()?
            .map(|l| LeaseStatus::from_lease(l, now));

        let mut queue_depth: BTreeMap<ActionStatus, u64> =
            ActionStatus::all().iter().map(|s| (*s, 0)).collect();
        queue_depth.extend(self.store.count_by_status()?);

        let mut dead_letters = self
            .store
            .list_actions(Some(ActionStatus::DeadLetter), None)?;
        dead_letters.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        Ok(Status {
            control,
            lease,
            queue_depth,
            recent_ticks: self.store.recent_ticks(self.recent)?,
            recent_executions: self.store.recent_log(self.recent)?,
            dead_letters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionType;
    use crate::store::RedbStore;
    use chrono::Duration;
    use tempfile::TempDir;

    fn surface() -> (TempDir, ControlSurface) {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RedbStore::open(&dir.path().join("c.redb")).unwrap());
        (dir, ControlSurface::new(store, 5))
    }

    #[test]
    fn bootstrap_defaults_to_proof_and_running() {
        let (_dir, control) = surface();
        let flags = control.flags().unwrap();
        assert!(!flags.paused);
        assert!(!flags.killed);
        assert_eq!(flags.mode, Mode::Proof);
    }

    #[test]
    fn setters_are_idempotent() {
        let (_dir, control) = surface();
        let first = control.pause().unwrap();
        let second = control.pause().unwrap();
        assert!(second.paused);
        assert_eq!(first.version, second.version, "no-op write must not bump");

        let resumed = control.resume().unwrap();
        assert!(!resumed.paused);
        assert_eq!(resumed.version, first.version + 1);
    }

    #[test]
    fn mode_switch_round_trips_through_store() {
        let (_dir, control) = surface();
        control.set_mode(Mode::Real).unwrap();
        assert_eq!(control.flags().unwrap().mode, Mode::Real);
        control.set_mode(Mode::Proof).unwrap();
        assert_eq!(control.flags().unwrap().mode, Mode::Proof);
    }

    #[test]
    fn mode_parses() {
        assert_eq!("REAL".parse::<Mode>().unwrap(), Mode::Real);
        assert!(matches!(
            "dry-run".parse::<Mode>(),
            Err(TickdError::InvalidMode(_))
        ));
    }

    #[test]
    fn status_zero_fills_queue_depth() {
        let (_dir, control) = surface();
        let status = control.get_status().unwrap();
        assert_eq!(status.queue_depth.len(), ActionStatus::all().len());
        assert!(status.queue_depth.values().all(|n| *n == 0));
        assert!(status.lease.is_none());
        assert!(status.recent_ticks.is_empty());
    }

    #[test]
    fn status_lists_every_dead_letter_newest_first() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RedbStore::open(&dir.path().join("d.redb")).unwrap());
        let control = ControlSurface::new(Arc::clone(&store), 2);

        // Created oldest-first, dead-lettered in reverse order.
        let base = Utc::now() - Duration::hours(1);
        let mut ids = Vec::new();
        for i in 0..4i64 {
            let mut action = Action::new(
                ActionType::Webhook,
                serde_json::json!({"n": i}),
                format!("k{i}"),
                3,
            );
            action.created_at = base + Duration::seconds(i);
            store.insert_action(&action).unwrap();
            store
                .update_action(action.id, &|a| {
                    Some(Action {
                        status: ActionStatus::DeadLetter,
                        updated_at: base + Duration::minutes(10 - i),
                        ..a.clone()
                    })
                })
                .unwrap();
            ids.push(action.id);
        }

        let status = control.get_status().unwrap();
        assert_eq!(status.queue_depth[&ActionStatus::DeadLetter], 4);
        let listed: Vec<_> = status.dead_letters.iter().map(|a| a.id).collect();
        assert_eq!(listed, vec![ids[0], ids[1], ids[2], ids[3]]);

        // A fresh dead letter on the oldest-created row jumps to the front.
        store
            .update_action(ids[3], &|a| {
                Some(Action {
                    updated_at: Utc::now(),
                    ..a.clone()
                })
            })
            .unwrap();
        let status = control.get_status().unwrap();
        assert_eq!(status.dead_letters[0].id, ids[3]);
        assert_eq!(status.dead_letters.len(), 4);
    }
}
