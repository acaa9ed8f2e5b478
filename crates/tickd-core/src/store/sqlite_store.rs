//! Shared-file store backed by SQLite.
//!
//! Each relation keeps its record as a JSON `body` column plus the handful of
//! columns the queries filter or order on. Every write runs in an `IMMEDIATE`
//! transaction, which takes SQLite's reserved lock up front: two daemon
//! processes racing on the same file are serialized by the database, not by
//! anything in-process.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::{dead_letter_raw, ts_micros, Store};
use crate::action::{Action, ActionStatus};
use crate::control::ControlFlags;
use crate::error::{Result, TickdError};
use crate::lease::Lease;
use crate::ledger::{ExecutionLogEntry, TickRecord};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS control_flags (
    id   INTEGER PRIMARY KEY CHECK (id = 1),
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS lease (
    id   INTEGER PRIMARY KEY CHECK (id = 1),
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS actions (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    id              TEXT NOT NULL UNIQUE,
    idempotency_key TEXT NOT NULL UNIQUE,
    status          TEXT NOT NULL,
    created_us      INTEGER NOT NULL,
    available_us    INTEGER NOT NULL,
    body            TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS actions_due ON actions (status, available_us);
CREATE INDEX IF NOT EXISTS actions_fifo ON actions (created_us, seq);
CREATE TABLE IF NOT EXISTS tick_ledger (
    seq     INTEGER PRIMARY KEY AUTOINCREMENT,
    tick_id TEXT NOT NULL UNIQUE,
    body    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS execution_log (
    seq       INTEGER PRIMARY KEY AUTOINCREMENT,
    action_id TEXT NOT NULL,
    tick_id   TEXT NOT NULL,
    body      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS execution_log_action ON execution_log (action_id);
"#;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn decode<T: DeserializeOwned>(body: &str) -> Result<T> {
    Ok(serde_json::from_str(body)?)
}

fn micros(ts: DateTime<Utc>) -> i64 {
    ts_micros(ts) as i64
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`, applying the schema and the
    /// bootstrap control row.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.write(|tx| {
            tx.execute_batch(SCHEMA)?;
            let body = serde_json::to_string(&ControlFlags::bootstrap())?;
            tx.execute(
                "INSERT OR IGNORE INTO control_flags (id, body) VALUES (1, ?1)",
                params![body],
            )?;
            Ok(())
        })?;
        Ok(store)
    }

    /// Run `f` inside an IMMEDIATE transaction, committing only on success.
    fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| TickdError::Store(format!("connection lock poisoned: {e}")))?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TickdError::Store(format!("connection lock poisoned: {e}")))?;
        f(&conn)
    }

    fn query_bodies<T: DeserializeOwned>(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<T>> {
        let mut stmt = conn.prepare(sql)?;
        let bodies = stmt
            .query_map(params, |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        bodies.iter().map(|b| decode(b)).collect()
    }

    /// Like `query_bodies` for action rows, skipping any this build cannot
    /// decode instead of failing the whole listing.
    fn query_actions(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Action>> {
        let mut stmt = conn.prepare(sql)?;
        let bodies = stmt
            .query_map(params, |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(bodies
            .iter()
            .filter_map(|b| match serde_json::from_str::<Action>(b) {
                Ok(action) => Some(action),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping undecodable action row");
                    None
                }
            })
            .collect())
    }

    /// Move an undecodable row out of the due set as `DEAD_LETTER`.
    fn quarantine(
        tx: &Transaction<'_>,
        seq: i64,
        body: &str,
        error: &serde_json::Error,
    ) -> Result<()> {
        let patched = dead_letter_raw(body.as_bytes(), error);
        tx.execute(
            "UPDATE actions SET status = ?2, body = COALESCE(?3, body) WHERE seq = ?1",
            params![seq, ActionStatus::DeadLetter.as_str(), patched],
        )?;
        Ok(())
    }

    fn insert_log(tx: &Transaction<'_>, entry: &ExecutionLogEntry) -> Result<()> {
        tx.execute(
            "INSERT INTO execution_log (action_id, tick_id, body) VALUES (?1, ?2, ?3)",
            params![
                entry.action_id.to_string(),
                entry.tick_id.to_string(),
                serde_json::to_string(entry)?
            ],
        )?;
        Ok(())
    }

    fn rewrite_action(
        tx: &Transaction<'_>,
        id: Uuid,
        f: &dyn Fn(&Action) -> Option<Action>,
    ) -> Result<Option<Action>> {
        let body: String = tx
            .query_row(
                "SELECT body FROM actions WHERE id = ?1",
                params![id.to_string()],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| TickdError::ActionNotFound(id.to_string()))?;
        let current: Action = decode(&body)?;
        let Some(next) = f(&current) else {
            return Ok(None);
        };
        Self::save_action(tx, &next)?;
        Ok(Some(next))
    }

    fn save_action(tx: &Transaction<'_>, action: &Action) -> Result<()> {
        tx.execute(
            "UPDATE actions SET status = ?2, available_us = ?3, body = ?4 WHERE id = ?1",
            params![
                action.id.to_string(),
                action.status.as_str(),
                micros(action.available_at),
                serde_json::to_string(action)?
            ],
        )?;
        Ok(())
    }
}

impl Store for SqliteStore {
    fn read_control(&self) -> Result<ControlFlags> {
        self.read(|conn| {
            let body: Option<String> = conn
                .query_row("SELECT body FROM control_flags WHERE id = 1", [], |r| {
                    r.get(0)
                })
                .optional()?;
            let body = body.ok_or_else(|| TickdError::Store("control flags row missing".into()))?;
            decode(&body)
        })
    }

    fn update_control(
        &self,
        f: &dyn Fn(&ControlFlags) -> Option<ControlFlags>,
    ) -> Result<ControlFlags> {
        self.write(|tx| {
            let body: String = tx
                .query_row("SELECT body FROM control_flags WHERE id = 1", [], |r| {
                    r.get(0)
                })
                .optional()?
                .ok_or_else(|| TickdError::Store("control flags row missing".into()))?;
            let current: ControlFlags = decode(&body)?;
            match f(&current) {
                Some(next) => {
                    tx.execute(
                        "UPDATE control_flags SET body = ?1 WHERE id = 1",
                        params![serde_json::to_string(&next)?],
                    )?;
                    Ok(next)
                }
                None => Ok(current),
            }
        })
    }

    fn read_lease(&self) -> Result<Option<Lease>> {
        self.read(|conn| {
            let body: Option<String> = conn
                .query_row("SELECT body FROM lease WHERE id = 1", [], |r| r.get(0))
                .optional()?;
            body.map(|b| decode(&b)).transpose()
        })
    }

    fn update_lease(&self, f: &dyn Fn(Option<&Lease>) -> Option<Lease>) -> Result<Option<Lease>> {
        self.write(|tx| {
            let current: Option<Lease> = tx
                .query_row("SELECT body FROM lease WHERE id = 1", [], |r| {
                    r.get::<_, String>(0)
                })
                .optional()?
                .map(|b| decode(&b))
                .transpose()?;
            let next = f(current.as_ref());
            if let Some(lease) = &next {
                tx.execute(
                    "INSERT INTO lease (id, body) VALUES (1, ?1)
                     ON CONFLICT (id) DO UPDATE SET body = excluded.body",
                    params![serde_json::to_string(lease)?],
                )?;
            }
            Ok(next)
        })
    }

    fn insert_action(&self, action: &Action) -> Result<(Action, bool)> {
        self.write(|tx| {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT body FROM actions WHERE idempotency_key = ?1",
                    params![action.idempotency_key],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(body) = existing {
                return Ok((decode(&body)?, false));
            }
            tx.execute(
                "INSERT INTO actions (id, idempotency_key, status, created_us, available_us, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    action.id.to_string(),
                    action.idempotency_key,
                    action.status.as_str(),
                    micros(action.created_at),
                    micros(action.available_at),
                    serde_json::to_string(action)?
                ],
            )?;
            Ok((action.clone(), true))
        })
    }

    fn get_action(&self, id: Uuid) -> Result<Option<Action>> {
        self.read(|conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM actions WHERE id = ?1",
                    params![id.to_string()],
                    |r| r.get(0),
                )
                .optional()?;
            body.map(|b| decode(&b)).transpose()
        })
    }

    fn get_action_by_key(&self, idempotency_key: &str) -> Result<Option<Action>> {
        self.read(|conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM actions WHERE idempotency_key = ?1",
                    params![idempotency_key],
                    |r| r.get(0),
                )
                .optional()?;
            body.map(|b| decode(&b)).transpose()
        })
    }

    fn update_action(
        &self,
        id: Uuid,
        f: &dyn Fn(&Action) -> Option<Action>,
    ) -> Result<Option<Action>> {
        self.write(|tx| Self::rewrite_action(tx, id, f))
    }

    fn update_action_logged(
        &self,
        id: Uuid,
        tick_id: Uuid,
        f: &dyn Fn(&Action) -> Option<Action>,
    ) -> Result<Option<Action>> {
        self.write(|tx| {
            let next = Self::rewrite_action(tx, id, f)?;
            if let Some(action) = &next {
                Self::insert_log(tx, &ExecutionLogEntry::for_attempt(tick_id, action))?;
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
        self.write(|tx| {
            let mut claimed = Vec::with_capacity(limit);
            // Quarantined rows leave the due set, so a short page is refilled.
            loop {
                let mut stmt = tx.prepare(
                    "SELECT seq, body FROM actions
                     WHERE status IN (?1, ?2) AND available_us <= ?3
                     ORDER BY created_us, seq
                     LIMIT ?4",
                )?;
                let rows = stmt
                    .query_map(
                        params![
                            ActionStatus::Pending.as_str(),
                            ActionStatus::FailedRetry.as_str(),
                            micros(now),
                            (limit - claimed.len()) as i64
                        ],
                        |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)),
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                drop(stmt);

                let mut quarantined = false;
                for (seq, body) in rows {
                    match serde_json::from_str::<Action>(&body) {
                        Ok(action) => {
                            let next = f(&action);
                            Self::save_action(tx, &next)?;
                            claimed.push(next);
                        }
                        Err(e) => {
                            Self::quarantine(tx, seq, &body, &e)?;
                            quarantined = true;
                        }
                    }
                }
                if !quarantined || claimed.len() >= limit {
                    return Ok(claimed);
                }
            }
        })
    }

    fn list_actions(
        &self,
        status: Option<ActionStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Action>> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map_or(-1, |n| n as i64);
        self.read(|conn| match status {
            Some(status) => Self::query_actions(
                conn,
                "SELECT body FROM actions WHERE status = ?1 ORDER BY created_us, seq LIMIT ?2",
                params![status.as_str(), limit],
            ),
            None => Self::query_actions(
                conn,
                "SELECT body FROM actions ORDER BY created_us, seq LIMIT ?1",
                params![limit],
            ),
        })
    }

    fn count_by_status(&self) -> Result<BTreeMap<ActionStatus, u64>> {
        self.read(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM actions GROUP BY status")?;
            let rows = stmt
                .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let mut counts = BTreeMap::new();
            for (status, n) in rows {
                counts.insert(status.parse::<ActionStatus>()?, n.max(0) as u64);
            }
            Ok(counts)
        })
    }

    fn append_tick(&self, record: &TickRecord) -> Result<()> {
        self.write(|tx| {
            tx.execute(
                "INSERT INTO tick_ledger (tick_id, body) VALUES (?1, ?2)",
                params![record.tick_id.to_string(), serde_json::to_string(record)?],
            )?;
            Ok(())
        })
    }

    fn recent_ticks(&self, limit: usize) -> Result<Vec<TickRecord>> {
        self.read(|conn| {
            Self::query_bodies(
                conn,
                "SELECT body FROM tick_ledger ORDER BY seq DESC LIMIT ?1",
                params![limit as i64],
            )
        })
    }

    fn recent_log(&self, limit: usize) -> Result<Vec<ExecutionLogEntry>> {
        self.read(|conn| {
            Self::query_bodies(
                conn,
                "SELECT body FROM execution_log ORDER BY seq DESC LIMIT ?1",
                params![limit as i64],
            )
        })
    }

    fn log_for_action(&self, action_id: Uuid) -> Result<Vec<ExecutionLogEntry>> {
        self.read(|conn| {
            Self::query_bodies(
                conn,
                "SELECT body FROM execution_log WHERE action_id = ?1 ORDER BY seq",
                params![action_id.to_string()],
            )
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
