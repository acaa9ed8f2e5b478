//! Embedded store backed by redb.
//!
//! # Table design
//!
//! `ACTIONS` uses a 16-byte composite key:
//! ```text
//! [ created_at_us: u64 big-endian (8 bytes) | seq: u64 big-endian (8 bytes) ]
//! ```
//!
//! Because the creation timestamp occupies the high bytes in big-endian
//! encoding, byte ordering equals creation ordering, with `seq` breaking
//! ties by insertion. A forward scan is FIFO without any sorting.
//! `ACTION_IDS` and `IDEMPOTENCY` index that key by id and by idempotency key.
//!
//! `ACTIONS_BY_STATUS` holds one empty-valued entry per action under
//! ```text
//! [ status tag (1 byte) | actions key (16 bytes) ]
//! ```
//! so every status is a contiguous, FIFO-ordered key range. Claiming,
//! per-status listing and counting walk those ranges instead of decoding
//! the whole table. Every write to `ACTIONS` goes through [`ActionTables`],
//! which keeps the index in step within the same transaction.
//!
//! The ledger tables are keyed by `seq` alone, so reverse iteration yields
//! the newest records first.
//!
//! redb serializes write transactions, which makes every conditional write
//! below atomic with respect to other threads. The file is locked to a single
//! process; use the SQLite backend when several daemon processes share a store.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{
    Database, ReadTransaction, ReadableTable, ReadableTableMetadata, Table, TableDefinition,
    WriteTransaction,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use uuid::Uuid;

use super::{dead_letter_raw, ts_micros, Store};
use crate::action::{Action, ActionStatus};
use crate::control::ControlFlags;
use crate::error::{Result, TickdError};
use crate::lease::Lease;
use crate::ledger::{ExecutionLogEntry, TickRecord};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

/// Singletons (`control_flags`, `lease`) and the sequence counter.
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
/// Key: 16-byte composite (created_at_us ++ seq). Value: JSON-encoded Action.
const ACTIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("actions");
/// Key: status tag ++ `ACTIONS` key. Value: empty.
const ACTIONS_BY_STATUS: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("actions_by_status");
/// Key: uuid bytes. Value: `ACTIONS` key.
const ACTION_IDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("action_ids");
/// Key: idempotency key. Value: `ACTIONS` key.
const IDEMPOTENCY: TableDefinition<&str, &[u8]> = TableDefinition::new("idempotency");
/// Key: seq. Value: JSON-encoded TickRecord.
const TICK_LEDGER: TableDefinition<&[u8], &[u8]> = TableDefinition::new("tick_ledger");
/// Key: seq. Value: JSON-encoded ExecutionLogEntry.
const EXECUTION_LOG: TableDefinition<&[u8], &[u8]> = TableDefinition::new("execution_log");

const CONTROL_KEY: &str = "control_flags";
const LEASE_KEY: &str = "lease";
const SEQ_KEY: &str = "seq";

const NO_VALUE: &[u8] = &[];

type MetaTable<'txn> = Table<'txn, &'static str, &'static [u8]>;
type BytesTable<'txn> = Table<'txn, &'static [u8], &'static [u8]>;
type SeqTableDef = TableDefinition<'static, &'static [u8], &'static [u8]>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn db_err(e: impl std::fmt::Display) -> TickdError {
    TickdError::Store(e.to_string())
}

fn action_key(created_at: DateTime<Utc>, seq: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&ts_micros(created_at).to_be_bytes());
    key[8..].copy_from_slice(&seq.to_be_bytes());
    key
}

/// Stable on-disk tag for a status. Never renumber.
fn status_tag(status: ActionStatus) -> u8 {
    match status {
        ActionStatus::Pending => 1,
        ActionStatus::Running => 2,
        ActionStatus::Success => 3,
        ActionStatus::FailedRetry => 4,
        ActionStatus::DeadLetter => 5,
    }
}

fn index_key(status: ActionStatus, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len());
    out.push(status_tag(status));
    out.extend_from_slice(key);
    out
}

/// `ACTIONS` keys filed under `status`, oldest first.
fn keys_with_status(
    by_status: &impl ReadableTable<&'static [u8], &'static [u8]>,
    status: ActionStatus,
    limit: Option<usize>,
) -> Result<Vec<Vec<u8>>> {
    let lo = [status_tag(status)];
    let hi = [status_tag(status) + 1];
    let mut keys = Vec::new();
    for entry in by_status
        .range(lo.as_slice()..hi.as_slice())
        .map_err(db_err)?
    {
        if limit.is_some_and(|n| keys.len() >= n) {
            break;
        }
        let (k, _) = entry.map_err(db_err)?;
        keys.push(k.value()[1..].to_vec());
    }
    Ok(keys)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn decode_lenient(bytes: &[u8]) -> Option<Action> {
    match serde_json::from_slice::<Action>(bytes) {
        Ok(action) => Some(action),
        Err(e) => {
            tracing::warn!(error = %e, "skipping undecodable action row");
            None
        }
    }
}

/// Status of a stored row, read without decoding the rest of it.
fn raw_status(bytes: &[u8]) -> ActionStatus {
    #[derive(Deserialize)]
    struct StatusOnly {
        status: ActionStatus,
    }
    serde_json::from_slice::<StatusOnly>(bytes)
        .map(|s| s.status)
        .unwrap_or(ActionStatus::DeadLetter)
}

fn next_seq(meta: &mut MetaTable<'_>) -> Result<u64> {
    let current = meta
        .get(SEQ_KEY)
        .map_err(db_err)?
        .and_then(|g| <[u8; 8]>::try_from(g.value()).ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0);
    let next = current + 1;
    meta.insert(SEQ_KEY, next.to_be_bytes().as_slice())
        .map_err(db_err)?;
    Ok(next)
}

/// Append `value` under the next sequence number inside `wt`.
fn append_in<T: serde::Serialize>(
    wt: &WriteTransaction,
    table: SeqTableDef,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    let mut meta = wt.open_table(META).map_err(db_err)?;
    let seq = next_seq(&mut meta)?;
    let mut t = wt.open_table(table).map_err(db_err)?;
    t.insert(seq.to_be_bytes().as_slice(), bytes.as_slice())
        .map_err(db_err)?;
    Ok(())
}

/// `ACTIONS` and its status index, opened together for one write transaction.
struct ActionTables<'txn> {
    actions: BytesTable<'txn>,
    by_status: BytesTable<'txn>,
}

impl<'txn> ActionTables<'txn> {
    fn open(wt: &'txn WriteTransaction) -> Result<Self> {
        Ok(Self {
            actions: wt.open_table(ACTIONS).map_err(db_err)?,
            by_status: wt.open_table(ACTIONS_BY_STATUS).map_err(db_err)?,
        })
    }

    fn body(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .actions
            .get(key)
            .map_err(db_err)?
            .map(|g| g.value().to_vec()))
    }

    /// Write `action` under `key`, moving its index entry from `prev`.
    fn put(&mut self, key: &[u8], prev: Option<ActionStatus>, action: &Action) -> Result<()> {
        let bytes = serde_json::to_vec(action)?;
        self.put_raw(key, prev, action.status, &bytes)
    }

    fn put_raw(
        &mut self,
        key: &[u8],
        prev: Option<ActionStatus>,
        status: ActionStatus,
        bytes: &[u8],
    ) -> Result<()> {
        self.actions.insert(key, bytes).map_err(db_err)?;
        if prev == Some(status) {
            return Ok(());
        }
        if let Some(prev) = prev {
            self.by_status
                .remove(index_key(prev, key).as_slice())
                .map_err(db_err)?;
        }
        self.by_status
            .insert(index_key(status, key).as_slice(), NO_VALUE)
            .map_err(db_err)?;
        Ok(())
    }

    /// Move an undecodable row filed under `prev` out of the due set.
    fn quarantine(
        &mut self,
        key: &[u8],
        prev: ActionStatus,
        body: &[u8],
        error: &serde_json::Error,
    ) -> Result<()> {
        let patched = dead_letter_raw(body, error);
        let bytes = patched.as_ref().map_or(body, |p| p.as_bytes());
        self.put_raw(key, Some(prev), ActionStatus::DeadLetter, bytes)
    }

    /// Index every row when the index is empty but rows exist, as in a file
    /// written before the index was introduced.
    fn rebuild_index_if_missing(&mut self) -> Result<()> {
        if !self.by_status.is_empty().map_err(db_err)?
            || self.actions.is_empty().map_err(db_err)?
        {
            return Ok(());
        }
        let mut entries = Vec::new();
        for entry in self.actions.iter().map_err(db_err)? {
            let (k, v) = entry.map_err(db_err)?;
            entries.push(index_key(raw_status(v.value()), k.value()));
        }
        tracing::info!(rows = entries.len(), "rebuilding action status index");
        for key in entries {
            self.by_status
                .insert(key.as_slice(), NO_VALUE)
                .map_err(db_err)?;
        }
        Ok(())
    }
}

fn rewrite_action(
    wt: &WriteTransaction,
    id: Uuid,
    f: &dyn Fn(&Action) -> Option<Action>,
) -> Result<Option<Action>> {
    let ids = wt.open_table(ACTION_IDS).map_err(db_err)?;
    let key = ids
        .get(id.as_bytes().as_slice())
        .map_err(db_err)?
        .map(|g| g.value().to_vec())
        .ok_or_else(|| TickdError::ActionNotFound(id.to_string()))?;

    let mut tables = ActionTables::open(wt)?;
    let current: Action = match tables.body(&key)? {
        Some(bytes) => decode(&bytes)?,
        None => return Err(TickdError::ActionNotFound(id.to_string())),
    };
    let Some(next) = f(&current) else {
        return Ok(None);
    };
    // Key derives from created_at; rewrite in place under the same key.
    tables.put(&key, Some(current.status), &next)?;
    Ok(Some(next))
}

// ---------------------------------------------------------------------------
// RedbStore
// ---------------------------------------------------------------------------

pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create the database at `path`, creating every table and the
    /// bootstrap control row if they don't already exist.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        let store = Self { db };
        store.write(|wt| {
            let mut meta = wt.open_table(META).map_err(db_err)?;
            ActionTables::open(wt)?.rebuild_index_if_missing()?;
            wt.open_table(ACTION_IDS).map_err(db_err)?;
            wt.open_table(IDEMPOTENCY).map_err(db_err)?;
            wt.open_table(TICK_LEDGER).map_err(db_err)?;
            wt.open_table(EXECUTION_LOG).map_err(db_err)?;
            let missing = meta.get(CONTROL_KEY).map_err(db_err)?.is_none();
            if missing {
                let flags = serde_json::to_vec(&ControlFlags::bootstrap())?;
                meta.insert(CONTROL_KEY, flags.as_slice()).map_err(db_err)?;
            }
            Ok(())
        })?;
        Ok(store)
    }

    /// Run `f` in a write transaction, committing only if it succeeds.
    fn write<T>(&self, f: impl FnOnce(&WriteTransaction) -> Result<T>) -> Result<T> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let out = f(&wt)?;
        wt.commit().map_err(db_err)?;
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&ReadTransaction) -> Result<T>) -> Result<T> {
        let rt = self.db.begin_read().map_err(db_err)?;
        f(&rt)
    }

    fn recent<T: DeserializeOwned>(
        &self,
        table: SeqTableDef,
        limit: usize,
    ) -> Result<Vec<T>> {
        self.read(|rt| {
            let table = rt.open_table(table).map_err(db_err)?;
            let mut result = Vec::new();
            for entry in table.iter().map_err(db_err)?.rev().take(limit) {
                let (_, v) = entry.map_err(db_err)?;
                result.push(decode(v.value())?);
            }
            Ok(result)
        })
    }
}

impl Store for RedbStore {
    fn read_control(&self) -> Result<ControlFlags> {
        self.read(|rt| {
            let meta = rt.open_table(META).map_err(db_err)?;
            let guard = meta
                .get(CONTROL_KEY)
                .map_err(db_err)?
                .ok_or_else(|| TickdError::Store("control flags row missing".into()))?;
            decode(guard.value())
        })
    }

    fn update_control(
        &self,
        f: &dyn Fn(&ControlFlags) -> Option<ControlFlags>,
    ) -> Result<ControlFlags> {
        self.write(|wt| {
            let mut meta = wt.open_table(META).map_err(db_err)?;
            let current: ControlFlags = match meta.get(CONTROL_KEY).map_err(db_err)? {
                Some(g) => decode(g.value())?,
                None => return Err(TickdError::Store("control flags row missing".into())),
            };
            match f(&current) {
                Some(next) => {
                    let bytes = serde_json::to_vec(&next)?;
                    meta.insert(CONTROL_KEY, bytes.as_slice()).map_err(db_err)?;
                    Ok(next)
                }
                None => Ok(current),
            }
        })
    }

    fn read_lease(&self) -> Result<Option<Lease>> {
        self.read(|rt| {
            let meta = rt.open_table(META).map_err(db_err)?;
            let lease = meta.get(LEASE_KEY).map_err(db_err)?;
            lease.map(|g| decode(g.value())).transpose()
        })
    }

    fn update_lease(&self, f: &dyn Fn(Option<&Lease>) -> Option<Lease>) -> Result<Option<Lease>> {
        self.write(|wt| {
            let mut meta = wt.open_table(META).map_err(db_err)?;
            let current: Option<Lease> = meta
                .get(LEASE_KEY)
                .map_err(db_err)?
                .map(|g| decode(g.value()))
                .transpose()?;
            let next = f(current.as_ref());
            if let Some(lease) = &next {
                let bytes = serde_json::to_vec(lease)?;
                meta.insert(LEASE_KEY, bytes.as_slice()).map_err(db_err)?;
            }
            Ok(next)
        })
    }

    fn insert_action(&self, action: &Action) -> Result<(Action, bool)> {
        self.write(|wt| {
            let mut idempotency = wt.open_table(IDEMPOTENCY).map_err(db_err)?;
            let mut tables = ActionTables::open(wt)?;

            let existing_key = idempotency
                .get(action.idempotency_key.as_str())
                .map_err(db_err)?
                .map(|g| g.value().to_vec());
            if let Some(key) = existing_key {
                let bytes = tables
                    .body(&key)?
                    .ok_or_else(|| TickdError::Store("dangling idempotency index".into()))?;
                return Ok((decode(&bytes)?, false));
            }

            let mut meta = wt.open_table(META).map_err(db_err)?;
            let key = action_key(action.created_at, next_seq(&mut meta)?);
            tables.put(&key, None, action)?;
            idempotency
                .insert(action.idempotency_key.as_str(), key.as_slice())
                .map_err(db_err)?;
            let mut ids = wt.open_table(ACTION_IDS).map_err(db_err)?;
            ids.insert(action.id.as_bytes().as_slice(), key.as_slice())
                .map_err(db_err)?;
            Ok((action.clone(), true))
        })
    }

    fn get_action(&self, id: Uuid) -> Result<Option<Action>> {
        self.read(|rt| {
            let ids = rt.open_table(ACTION_IDS).map_err(db_err)?;
            let Some(key) = ids
                .get(id.as_bytes().as_slice())
                .map_err(db_err)?
                .map(|g| g.value().to_vec())
            else {
                return Ok(None);
            };
            let actions = rt.open_table(ACTIONS).map_err(db_err)?;
            let action = actions.get(key.as_slice()).map_err(db_err)?;
            action.map(|g| decode(g.value())).transpose()
        })
    }

    fn get_action_by_key(&self, idempotency_key: &str) -> Result<Option<Action>> {
        self.read(|rt| {
            let idempotency = rt.open_table(IDEMPOTENCY).map_err(db_err)?;
            let Some(key) = idempotency
                .get(idempotency_key)
                .map_err(db_err)?
                .map(|g| g.value().to_vec())
            else {
                return Ok(None);
            };
            let actions = rt.open_table(ACTIONS).map_err(db_err)?;
            let action = actions.get(key.as_slice()).map_err(db_err)?;
            action.map(|g| decode(g.value())).transpose()
        })
    }

    fn update_action(
        &self,
        id: Uuid,
        f: &dyn Fn(&Action) -> Option<Action>,
    ) -> Result<Option<Action>> {
        self.write(|wt| rewrite_action(wt, id, f))
    }

    fn update_action_logged(
        &self,
        id: Uuid,
        tick_id: Uuid,
        f: &dyn Fn(&Action) -> Option<Action>,
    ) -> Result<Option<Action>> {
        self.write(|wt| {
            let next = rewrite_action(wt, id, f)?;
            if let Some(action) = &next {
                append_in(wt, EXECUTION_LOG, &ExecutionLogEntry::for_attempt(tick_id, action))?;
            }
            Ok(next)
        })
    }

    fn claim_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        f: &dyn Fn(&Action) -> Action,
    ) -> Result<Vec<Action>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.write(|wt| {
            let mut tables = ActionTables::open(wt)?;
            // Merge both claimable ranges back into FIFO order.
            let mut candidates: Vec<(Vec<u8>, ActionStatus)> = Vec::new();
            for status in [ActionStatus::Pending, ActionStatus::FailedRetry] {
                candidates.extend(
                    keys_with_status(&tables.by_status, status, None)?
                        .into_iter()
                        .map(|k| (k, status)),
                );
            }
            candidates.sort();

            let mut claimed = Vec::with_capacity(limit);
            for (key, status) in candidates {
                if claimed.len() >= limit {
                    break;
                }
                let Some(bytes) = tables.body(&key)? else {
                    continue;
                };
                match serde_json::from_slice::<Action>(&bytes) {
                    Ok(action) if action.is_due(now) => {
                        let next = f(&action);
                        tables.put(&key, Some(status), &next)?;
                        claimed.push(next);
                    }
                    Ok(_) => {}
                    Err(e) => tables.quarantine(&key, status, &bytes, &e)?,
                }
            }
            Ok(claimed)
        })
    }

    fn list_actions(
        &self,
        status: Option<ActionStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Action>> {
        self.read(|rt| {
            let actions = rt.open_table(ACTIONS).map_err(db_err)?;
            let mut result = Vec::new();
            match status {
                Some(status) => {
                    let by_status = rt.open_table(ACTIONS_BY_STATUS).map_err(db_err)?;
                    for key in keys_with_status(&by_status, status, limit)? {
                        if let Some(g) = actions.get(key.as_slice()).map_err(db_err)? {
                            result.extend(decode_lenient(g.value()));
                        }
                    }
                }
                None => {
                    for entry in actions.iter().map_err(db_err)? {
                        if limit.is_some_and(|n| result.len() >= n) {
                            break;
                        }
                        let (_, v) = entry.map_err(db_err)?;
                        result.extend(decode_lenient(v.value()));
                    }
                }
            }
            Ok(result)
        })
    }

    fn count_by_status(&self) -> Result<BTreeMap<ActionStatus, u64>> {
        self.read(|rt| {
            let by_status = rt.open_table(ACTIONS_BY_STATUS).map_err(db_err)?;
            let mut counts = BTreeMap::new();
            for &status in ActionStatus::all() {
                let lo = [status_tag(status)];
                let hi = [status_tag(status) + 1];
                let n = by_status
                    .range(lo.as_slice()..hi.as_slice())
                    .map_err(db_err)?
                    .count() as u64;
                if n > 0 {
                    counts.insert(status, n);
                }
            }
            Ok(counts)
        })
    }

    fn append_tick(&self, record: &TickRecord) -> Result<()> {
        self.write(|wt| append_in(wt, TICK_LEDGER, record))
    }

    fn recent_ticks(&self, limit: usize) -> Result<Vec<TickRecord>> {
        self.recent(TICK_LEDGER, limit)
    }

    fn recent_log(&self, limit: usize) -> Result<Vec<ExecutionLogEntry>> {
        self.recent(EXECUTION_LOG, limit)
    }

    fn log_for_action(&self, action_id: Uuid) -> Result<Vec<ExecutionLogEntry>> {
        self.read(|rt| {
            let table = rt.open_table(EXECUTION_LOG).map_err(db_err)?;
            let mut result = Vec::new();
            for entry in table.iter().map_err(db_err)? {
                let (_, v) = entry.map_err(db_err)?;
                let e: ExecutionLogEntry = decode(v.value())?;
                if e.action_id == action_id {
                    result.push(e);
                }
            }
            Ok(result)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
