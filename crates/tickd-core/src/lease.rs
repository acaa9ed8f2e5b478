//! Exclusive, time-bounded ownership of the executor role.
//!
//! The lease is a single row. Every acquisition or renewal is one conditional
//! write evaluated inside a store transaction by [`next_lease`], so two
//! daemons racing at the same instant can never both succeed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, TickdError};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Bumped on every change of epoch; never reset, even by `release`.
    pub fencing_token: u64,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_held_by(&self, owner_id: &str, now: DateTime<Utc>) -> bool {
        self.owner_id == owner_id && !self.is_expired(now)
    }
}

/// Decide the lease row that `owner_id` may write at `now`, or `None` when a
/// different owner still holds a live lease.
///
/// - no row: fresh lease with token 1
/// - live row held by `owner_id`: extend `expires_at`, keep the token
/// - expired row (any owner, including `owner_id`): takeover, token + 1
pub fn next_lease(
    current: Option<&Lease>,
    owner_id: &str,
    now: DateTime<Utc>,
    ttl: chrono::Duration,
) -> Option<Lease> {
    match current {
        None => Some(Lease {
            owner_id: owner_id.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
            fencing_token: 1,
        }),
        Some(lease) if lease.is_held_by(owner_id, now) => Some(Lease {
            expires_at: now + ttl,
            ..lease.clone()
        }),
        Some(lease) if lease.is_expired(now) => Some(Lease {
            owner_id: owner_id.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
            fencing_token: lease.fencing_token + 1,
        }),
        Some(_) => None,
    }
}

// ---------------------------------------------------------------------------
// LeaseManager
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn Store>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Acquire, renew, or take over the lease for `owner_id`.
    ///
    /// Returns the lease now held, or `None` when another owner holds a live
    /// one. Losing the race is not an error.
    pub fn acquire_or_renew(&self, owner_id: &str, ttl: Duration) -> Result<Option<Lease>> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| TickdError::Config(format!("lease ttl out of range: {e}")))?;
        let now = Utc::now();
        let written = self
            .store
            .update_lease(&|current| next_lease(current, owner_id, now, ttl))?;
        match &written {
            Some(lease) => tracing::debug!(
                owner_id,
                fencing_token = lease.fencing_token,
                expires_at = %lease.expires_at,
                "lease held"
            ),
            None => tracing::debug!(owner_id, "lease held by another owner"),
        }
        Ok(written)
    }

    /// Expire the lease immediately if `owner_id` holds it. Best-effort: an
    /// unreleased lease is reclaimed by expiry alone.
    pub fn release(&self, owner_id: &str) -> Result<bool> {
        let now = Utc::now();
        let released = self.store.update_lease(&|current| match current {
            Some(lease) if lease.is_held_by(owner_id, now) => Some(Lease {
                expires_at: now,
                ..lease.clone()
            }),
            _ => None,
        })?;
        if released.is_some() {
            tracing::info!(owner_id, "lease released");
        }
        Ok(released.is_some())
    }
}
