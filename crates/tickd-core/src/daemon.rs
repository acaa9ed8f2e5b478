//! The tick executor.
//!
//! One loop iteration ("tick"): read the control row, hold the lease, sweep
//! orphans, claim a bounded batch, run each action through its adapter under
//! the tick's wall-clock ceiling, and record the outcome. Store access is
//! synchronous and goes through `spawn_blocking`; adapters are async.

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::Instrument;
use uuid::Uuid;

use crate::action::{Action, ActionStatus};
use crate::adapter::{AdapterError, AdapterRegistry, ExecutionOutput, ExecutionRequest};
use crate::config::Config;
use crate::control::{ControlSurface, Mode};
use crate::error::{Result, TickdError};
use crate::lease::{Lease, LeaseManager};
use crate::ledger::{TickOutcome, TickRecord};
use crate::queue::ActionQueue;
use crate::store::Store;

pub const DEADLINE_ERROR: &str = "tick deadline exceeded";

/// Run a synchronous store operation on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TickdError::Store(format!("store task failed: {e}")))?
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The shared control row had `killed` set.
    Killed,
    /// `max_ticks` iterations completed.
    MaxTicks,
    /// This process was asked to stop (Ctrl-C or [`ShutdownHandle`]).
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub owner_id: String,
    /// Loop iterations, whether or not this instance held the lease.
    pub iterations: u64,
    /// Iterations that held the lease and appended a tick record.
    pub ticks_led: u64,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone)]
pub enum TickReport {
    Killed,
    /// Another owner holds a live lease; nothing was written.
    NotLeader,
    Ran(TickRecord),
}

/// Process-local stop signal. Does not touch the shared control row.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

pub struct Daemon {
    owner_id: String,
    config: Config,
    store: Arc<dyn Store>,
    leases: LeaseManager,
    queue: ActionQueue,
    control: ControlSurface,
    registry: Arc<AdapterRegistry>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Daemon {
    pub fn new(config: Config, store: Arc<dyn Store>, registry: AdapterRegistry) -> Result<Self> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            owner_id: config.resolved_owner_id(),
            leases: LeaseManager::new(Arc::clone(&store)),
            queue: ActionQueue::from_config(Arc::clone(&store), &config),
            control: ControlSurface::new(Arc::clone(&store), config.status_recent),
            registry: Arc::new(registry),
            shutdown: Arc::new(shutdown),
            store,
            config,
        })
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    pub fn control(&self) -> &ControlSurface {
        &self.control
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown))
    }

    /// Loop until killed, shut down, or `max_ticks` iterations have run.
    ///
    /// Only an unreachable store at startup is an error; failures inside a
    /// tick are logged and the loop carries on.
    pub async fn run(&self, max_ticks: Option<u64>) -> Result<RunSummary> {
        let control = self.control.clone();
        let flags = blocking(move || control.flags()).await?;
        tracing::info!(
            owner_id = %self.owner_id,
            mode = %flags.mode,
            paused = flags.paused,
            batch_size = self.config.batch_size,
            "daemon started"
        );

        let mut shutdown = self.shutdown.subscribe();
        let mut iterations = 0u64;
        let mut ticks_led = 0u64;
        let stop_reason = loop {
            if *shutdown.borrow_and_update() {
                break StopReason::Shutdown;
            }
            if max_ticks.is_some_and(|max| iterations >= max) {
                break StopReason::MaxTicks;
            }
            iterations += 1;

            match self.tick().await {
                Ok(TickReport::Killed) => break StopReason::Killed,
                Ok(TickReport::Ran(_)) => ticks_led += 1,
                Ok(TickReport::NotLeader) => {}
                Err(e) => tracing::warn!(owner_id = %self.owner_id, error = %e, "tick aborted"),
            }

            if max_ticks.is_some_and(|max| iterations >= max) {
                break StopReason::MaxTicks;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval()) => {}
                _ = shutdown.changed() => {}
            }
        };

        let leases = self.leases.clone();
        let owner = self.owner_id.clone();
        if let Err(e) = blocking(move || leases.release(&owner)).await {
            tracing::warn!(owner_id = %self.owner_id, error = %e, "lease release failed; it will expire");
        }
        tracing::info!(
            owner_id = %self.owner_id,
            iterations,
            ticks_led,
            reason = ?stop_reason,
            "daemon stopped"
        );
        Ok(RunSummary {
            owner_id: self.owner_id.clone(),
            iterations,
            ticks_led,
            stop_reason,
        })
    }

    /// One loop iteration.
    pub async fn tick(&self) -> Result<TickReport> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let control = self.control.clone();
        let flags = blocking(move || control.flags()).await?;
        if flags.killed {
            tracing::info!(owner_id = %self.owner_id, "kill flag set, stopping");
            return Ok(TickReport::Killed);
        }

        let Some(lease) = self.renew().await? else {
            return Ok(TickReport::NotLeader);
        };

        let tick_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "tick",
            %tick_id,
            owner_id = %self.owner_id,
            fencing_token = lease.fencing_token
        );
        let mut record = TickRecord {
            tick_id,
            started_at,
            ended_at: started_at,
            owner_id: self.owner_id.clone(),
            fencing_token: lease.fencing_token,
            actions_attempted: 0,
            actions_succeeded: 0,
            actions_failed: 0,
            duration_ms: 0,
            outcome: TickOutcome::Completed,
        };

        if flags.paused {
            record.outcome = TickOutcome::Paused;
        } else if let Err(e) = self
            .work(&mut record, &lease, flags.mode, clock)
            .instrument(span.clone())
            .await
        {
            span.in_scope(|| tracing::error!(error = %e, "tick aborted by store error"));
            record.outcome = TickOutcome::Aborted;
        }

        record.ended_at = Utc::now();
        record.duration_ms = clock.elapsed().as_millis() as u64;
        let store = Arc::clone(&self.store);
        let appended = record.clone();
        blocking(move || store.append_tick(&appended)).await?;
        span.in_scope(|| {
            tracing::info!(
                attempted = record.actions_attempted,
                succeeded = record.actions_succeeded,
                failed = record.actions_failed,
                duration_ms = record.duration_ms,
                outcome = %record.outcome,
                "tick recorded"
            )
        });
        Ok(TickReport::Ran(record))
    }

    async fn renew(&self) -> Result<Option<Lease>> {
        let leases = self.leases.clone();
        let owner = self.owner_id.clone();
        let ttl = self.config.lease_ttl();
        blocking(move || leases.acquire_or_renew(&owner, ttl)).await
    }

    /// Sweep, claim and execute one batch, filling in `record`'s counters.
    ///
    /// On a store error, unstarted claims are released before the error is
    /// returned. The action in flight stays `Running` for the orphan sweep.
    async fn work(
        &self,
        record: &mut TickRecord,
        lease: &Lease,
        mode: Mode,
        clock: Instant,
    ) -> Result<()> {
        let queue = self.queue.clone();
        let orphan_after = self.config.orphan_after();
        let tick_id = record.tick_id;
        blocking(move || queue.recover_orphans(orphan_after, tick_id)).await?;

        let queue = self.queue.clone();
        let batch_size = self.config.batch_size;
        let claim_lease = lease.clone();
        let claimed = blocking(move || queue.claim_batch(batch_size, &claim_lease)).await?;

        let deadline = clock + self.config.tick_ceiling();
        let mut pending = claimed.into_iter();
        while let Some(action) = pending.next() {
            let budget = deadline.saturating_duration_since(Instant::now());
            if budget.is_zero() {
                record.outcome = TickOutcome::DeadlineExceeded;
                self.release(std::iter::once(action).chain(pending)).await;
                break;
            }
            if record.actions_attempted > 0 {
                let renewed = match self.renew().await {
                    Ok(renewed) => renewed,
                    Err(e) => {
                        self.release(std::iter::once(action).chain(pending)).await;
                        return Err(e);
                    }
                };
                if !renewed.is_some_and(|l| l.fencing_token == lease.fencing_token) {
                    tracing::warn!("lease lost mid-batch, releasing remaining claims");
                    record.outcome = TickOutcome::LeaseLost;
                    self.release(std::iter::once(action).chain(pending)).await;
                    break;
                }
            }

            record.actions_attempted += 1;
            let (result, timed_out) = self.execute(&action, mode, budget).await;
            let queue = self.queue.clone();
            let marked = match result {
                Ok(output) => {
                    blocking(move || queue.mark_success(&action, &output.artifact_ref, tick_id))
                        .await
                }
                Err(err) => blocking(move || queue.mark_failed(&action, &err, tick_id)).await,
            };
            let updated = match marked {
                Ok(updated) => updated,
                Err(e) => {
                    self.release(pending).await;
                    return Err(e);
                }
            };

            match updated {
                Some(action) if action.status == ActionStatus::Success => {
                    record.actions_succeeded += 1;
                }
                _ => record.actions_failed += 1,
            }

            if timed_out {
                record.outcome = TickOutcome::DeadlineExceeded;
                self.release(pending).await;
                break;
            }
        }
        Ok(())
    }

    /// Run one action through its adapter, bounded by `budget`. Returns the
    /// classified result and whether the ceiling cut it off.
    async fn execute(
        &self,
        action: &Action,
        mode: Mode,
        budget: std::time::Duration,
    ) -> (std::result::Result<ExecutionOutput, AdapterError>, bool) {
        let adapter = match self.registry.resolve(action.action_type, mode) {
            Ok(adapter) => adapter,
            Err(e) => return (Err(e), false),
        };
        let request = ExecutionRequest::from(action);
        tracing::debug!(
            action_id = %action.id,
            action_type = %action.action_type,
            adapter = adapter.name(),
            %mode,
            "executing action"
        );

        let call = AssertUnwindSafe(adapter.execute(&request, mode)).catch_unwind();
        match tokio::time::timeout(budget, call).await {
            Ok(Ok(result)) => (result, false),
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(action_id = %action.id, panic = %message, "adapter panicked");
                (
                    Err(AdapterError::unknown(format!("adapter panicked: {message}"))),
                    false,
                )
            }
            Err(_) => {
                tracing::warn!(action_id = %action.id, budget_ms = budget.as_millis() as u64, "tick ceiling reached mid-action");
                (Err(AdapterError::transient(DEADLINE_ERROR)), true)
            }
        }
    }

    /// Best effort: a claim that cannot be released is left for the orphan
    /// sweep.
    async fn release(&self, actions: impl Iterator<Item = Action>) {
        let actions: Vec<Action> = actions.collect();
        if actions.is_empty() {
            return;
        }
        let queue = self.queue.clone();
        let released = blocking(move || {
            let mut released = 0usize;
            for action in &actions {
                match queue.release(action) {
                    Ok(Some(_)) => released += 1,
                    Ok(None) => {}
                    Err(e) => tracing::warn!(
                        action_id = %action.id,
                        error = %e,
                        "claim release failed; left for the orphan sweep"
                    ),
                }
            }
            Ok(released)
        })
        .await;
        match released {
            Ok(count) => tracing::info!(count, "unstarted claims released"),
            Err(e) => tracing::warn!(error = %e, "claim release task failed"),
        }
    }
}
