//! Lifecycle steps shared by every provider kind.
//!
//! Every write here is a compare-and-swap. Removal re-reads and retries;
//! the scan only ever writes against the version it evaluated, so a worker
//! that registered in the meantime is left alone until the next scan.

use chrono::{DateTime, Utc};
use fleet_model::{ErrorKind, Versioned, Worker, WorkerPool, WorkerPoolError, WorkerState};
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::{Provider, ProviderContext, ProviderError, ProviderResult, WorkerHealth};
use crate::registry::retry_on_conflict;

const LIVE_STATES: [WorkerState; 3] = [
    WorkerState::Requested,
    WorkerState::Running,
    WorkerState::Stopping,
];

/// Counters from one scan of one provider's workers in one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub checked: usize,
    /// Workers reaped because of a missed deadline or a vanished backend.
    pub reaped: usize,
    /// `stopping` workers confirmed gone and moved to `stopped`.
    pub confirmed: usize,
    /// Writes skipped because the worker changed under us.
    pub skipped: usize,
    pub errors: usize,
}

impl ScanStats {
    pub fn merge(&mut self, other: ScanStats) {
        self.checked += other.checked;
        self.reaped += other.reaped;
        self.confirmed += other.confirmed;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reap {
    RegistrationTimeout,
    Expired,
    Gone,
}

/// Deadline checks that need no backend call.
fn missed_deadline(pool: &WorkerPool, worker: &Worker, now: DateTime<Utc>) -> Option<Reap> {
    match worker.state {
        WorkerState::Requested if now > worker.registration_deadline(&pool.config.lifecycle) => {
            Some(Reap::RegistrationTimeout)
        }
        WorkerState::Requested | WorkerState::Running if worker.is_expired(now) => {
            Some(Reap::Expired)
        }
        _ => None,
    }
}

async fn owned_live_workers<P: Provider + ?Sized>(
    provider: &P,
    ctx: &ProviderContext,
    pool: &WorkerPool,
) -> ProviderResult<Vec<Versioned<Worker>>> {
    let workers = ctx
        .registry()
        .list_workers(&pool.worker_pool_id, &LIVE_STATES)
        .await?;
    Ok(workers
        .into_iter()
        .filter(|w| &w.record.provider_id == provider.id())
        .collect())
}

pub(super) async fn remove_worker<P: Provider + ?Sized>(
    provider: &P,
    ctx: &ProviderContext,
    worker: &Versioned<Worker>,
    now: DateTime<Utc>,
) -> ProviderResult<bool> {
    let key = worker.record.key();
    let key_str = key.to_string();

    let moved = retry_on_conflict::<_, ProviderError, _, _>("worker", &key_str, || {
        let registry = ctx.registry().clone();
        let key = key.clone();
        async move {
            let Some(current) = registry.get_worker(&key).await? else {
                return Ok(None);
            };
            if !current.record.state.counts_toward_capacity() {
                return Ok(None);
            }
            let mut next = current.record.clone();
            next.transition(WorkerState::Stopping, now)?;
            let stored = registry.update_worker(next, current.version).await?;
            Ok(Some(stored))
        }
    })
    .await?;

    let Some(stored) = moved else {
        return Ok(false);
    };
    info!(worker = %key, "Worker stopping");

    // A failed terminate leaves the worker stopping; the scan retries it.
    if let Err(e) = provider.terminate(ctx, &stored.record).await {
        warn!(worker = %key, error = %e, "Failed to release worker resources");
    }
    Ok(true)
}

pub(super) async fn deprovision<P: Provider + ?Sized>(
    provider: &P,
    ctx: &ProviderContext,
    pool: &WorkerPool,
    now: DateTime<Utc>,
) -> ProviderResult<usize> {
    let workers = owned_live_workers(provider, ctx, pool).await?;
    for worker in &workers {
        if let Err(e) = provider.remove_worker(ctx, worker, now).await {
            warn!(
                worker = %worker.record.key(),
                error = %e,
                "Failed to remove worker during deprovision"
            );
        }
    }
    Ok(workers.len())
}

pub(super) async fn scan<P: Provider + ?Sized>(
    provider: &P,
    ctx: &ProviderContext,
    pool: &WorkerPool,
    now: DateTime<Utc>,
) -> ProviderResult<ScanStats> {
    let mut stats = ScanStats::default();

    for worker in owned_live_workers(provider, ctx, pool).await? {
        stats.checked += 1;

        if let Some(reason) = missed_deadline(pool, &worker.record, now) {
            reap(provider, ctx, pool, worker, reason, now, &mut stats).await;
            continue;
        }

        let health = match provider.check_worker(ctx, &worker.record, now).await {
            Ok(health) => health,
            Err(e) => {
                warn!(worker = %worker.record.key(), error = %e, "Worker check failed");
                stats.errors += 1;
                continue;
            }
        };

        match (worker.record.state, health) {
            (WorkerState::Stopping, WorkerHealth::Gone) => {
                let mut next = worker.record.clone();
                next.transition(WorkerState::Stopped, now)?;
                match ctx.registry().update_worker(next, worker.version).await {
                    Ok(_) => {
                        debug!(worker = %worker.record.key(), "Worker stopped");
                        stats.confirmed += 1;
                    }
                    Err(e) if e.is_conflict() => stats.skipped += 1,
                    Err(e) => return Err(e.into()),
                }
            }
            (WorkerState::Stopping, WorkerHealth::Alive) => {
                if let Err(e) = provider.terminate(ctx, &worker.record).await {
                    warn!(worker = %worker.record.key(), error = %e, "Terminate retry failed");
                    stats.errors += 1;
                }
            }
            (_, WorkerHealth::Gone) => {
                reap(provider, ctx, pool, worker, Reap::Gone, now, &mut stats).await;
            }
            (_, WorkerHealth::Alive) => {
                let mut next = worker.record.clone();
                next.last_checked = now;
                match ctx.registry().update_worker(next, worker.version).await {
                    Ok(_) => {}
                    Err(e) if e.is_conflict() => stats.skipped += 1,
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    Ok(stats)
}

#[allow(clippy::too_many_arguments)]
async fn reap<P: Provider + ?Sized>(
    provider: &P,
    ctx: &ProviderContext,
    pool: &WorkerPool,
    worker: Versioned<Worker>,
    reason: Reap,
    now: DateTime<Utc>,
    stats: &mut ScanStats,
) {
    let key = worker.record.key();
    let mut next = worker.record.clone();
    if let Err(e) = next.transition(WorkerState::Stopped, now) {
        error!(worker = %key, error = %e, "Cannot reap worker");
        stats.errors += 1;
        return;
    }

    match ctx.registry().update_worker(next, worker.version).await {
        Ok(_) => {}
        Err(e) if e.is_conflict() => {
            debug!(worker = %key, "Worker changed since it was checked; leaving it");
            stats.skipped += 1;
            return;
        }
        Err(e) => {
            warn!(worker = %key, error = %e, "Failed to reap worker");
            stats.errors += 1;
            return;
        }
    }
    stats.reaped += 1;
    info!(worker = %key, reason = ?reason, "Worker reaped");

    if reason != Reap::Gone {
        if let Err(e) = provider.terminate(ctx, &worker.record).await {
            warn!(worker = %key, error = %e, "Failed to release reaped worker resources");
        }
    }

    let error = match reason {
        Reap::RegistrationTimeout => Some(WorkerPoolError::new(
            pool.worker_pool_id.clone(),
            ErrorKind::RegistrationTimeout,
            "Registration Timeout",
            format!(
                "worker {} did not register within {} seconds",
                key, pool.config.lifecycle.registration_timeout
            ),
        )),
        Reap::Expired => Some(WorkerPoolError::new(
            pool.worker_pool_id.clone(),
            ErrorKind::WorkerExpired,
            "Worker Expired",
            format!("worker {} expired at {}", key, worker.record.expires.to_rfc3339()),
        )),
        Reap::Gone => None,
    };
    if let Some(error) = error {
        let error = error.with_extra(json!({
            "workerGroup": key.worker_group,
            "workerId": key.worker_id,
            "state": worker.record.state,
        }));
        ctx.report_error(pool, error).await;
    }
}
