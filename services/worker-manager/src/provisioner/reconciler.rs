//! Per-pool provisioning pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_id::{ProviderId, WorkerPoolId};
use fleet_model::{
    ErrorKind, Versioned, Worker, WorkerPool, WorkerPoolError, WorkerState, NULL_PROVIDER,
};
use fleet_reconcile::{
    estimate, select_for_drain, take_capacity, DrainPriority, EstimatorError, EstimatorInput,
};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::demand::DemandSignal;
use crate::providers::{Provider, ProviderContext, ProviderError, Providers, ScanStats};
use crate::registry::{retry_on_conflict, ConflictAware, RegistryError};
use crate::scanner::Scanner;

/// Result type for provisioning operations.
pub type ProvisionerResult<T> = Result<T, ProvisionerError>;

/// Errors that can occur while provisioning a pool.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionerError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("cannot estimate capacity: {0}")]
    Estimator(#[from] EstimatorError),

    #[error("provider {0} is not available")]
    ProviderUnavailable(ProviderId),
}

impl ConflictAware for ProvisionerError {
    fn is_conflict(&self) -> bool {
        match self {
            Self::Registry(e) => e.is_conflict(),
            Self::Provider(e) => e.is_conflict(),
            _ => false,
        }
    }
}

/// Counters for one pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity_requested: u64,
    pub workers_created: usize,
    pub workers_removed: usize,
    pub providers_retired: usize,
    pub pool_removed: bool,
    pub scan: ScanStats,
}

/// Counters for a whole pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionStats {
    pub pools_processed: usize,
    pub pools_failed: usize,
    pub pools_removed: usize,
    pub workers_created: usize,
    pub workers_removed: usize,
    pub providers_retired: usize,
    pub scan: ScanStats,
}

impl ProvisionStats {
    fn add(&mut self, pool: &PoolStats) {
        self.pools_processed += 1;
        self.workers_created += pool.workers_created;
        self.workers_removed += pool.workers_removed;
        self.providers_retired += pool.providers_retired;
        self.scan.merge(pool.scan);
        if pool.pool_removed {
            self.pools_removed += 1;
        }
    }
}

const COUNTED_STATES: [WorkerState; 2] = [WorkerState::Requested, WorkerState::Running];

const LIVE_STATES: [WorkerState; 3] = [
    WorkerState::Requested,
    WorkerState::Running,
    WorkerState::Stopping,
];

/// Drain order: dead first, then never-registered, then short leases.
fn drain_priority(pool: &WorkerPool, worker: &Worker, now: DateTime<Utc>) -> DrainPriority {
    if worker.is_expired(now) {
        return DrainPriority::Gone;
    }
    match worker.state {
        WorkerState::Requested => DrainPriority::Unregistered,
        _ if worker.expires - now < pool.config.lifecycle.reregistration_timeout() / 4 => {
            DrainPriority::Expiring
        }
        _ => DrainPriority::Healthy,
    }
}

/// The provisioner.
pub struct Provisioner {
    ctx: Arc<ProviderContext>,
    providers: Arc<Providers>,
    scanner: Scanner,
    demand: Arc<dyn DemandSignal>,
    pool_budget: Duration,
}

impl Provisioner {
    pub fn new(
        ctx: Arc<ProviderContext>,
        providers: Arc<Providers>,
        demand: Arc<dyn DemandSignal>,
        pool_budget: Duration,
    ) -> Self {
        let scanner = Scanner::new(ctx.clone(), providers.clone());
        Self {
            ctx,
            providers,
            scanner,
            demand,
            pool_budget,
        }
    }

    /// Run a single provisioning pass over every pool.
    #[instrument(skip(self))]
    pub async fn provision_all(self: &Arc<Self>, now: DateTime<Utc>) -> ProvisionerResult<ProvisionStats> {
        let mut stats = ProvisionStats::default();
        let pools = self.ctx.registry().list_worker_pools().await?;
        debug!(pool_count = pools.len(), "Found pools to provision");

        let mut tasks = JoinSet::new();
        for pool in pools {
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let id = pool.record.worker_pool_id.clone();
                let result =
                    tokio::time::timeout(this.pool_budget, this.provision_pool(pool, now)).await;
                (id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Ok(pool_stats)))) => stats.add(&pool_stats),
                Ok((id, Ok(Err(e)))) => {
                    warn!(worker_pool_id = %id, error = %e, "Failed to provision pool");
                    stats.pools_failed += 1;
                }
                Ok((id, Err(_))) => {
                    warn!(
                        worker_pool_id = %id,
                        budget_secs = self.pool_budget.as_secs(),
                        "Provisioning pool timed out"
                    );
                    stats.pools_failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "Provisioning task panicked");
                    stats.pools_failed += 1;
                }
            }
        }

        info!(
            pools_processed = stats.pools_processed,
            pools_failed = stats.pools_failed,
            workers_created = stats.workers_created,
            workers_removed = stats.workers_removed,
            workers_reaped = stats.scan.reaped,
            "Provisioning pass complete"
        );

        Ok(stats)
    }

    /// Provision one pool: converge, drain previous providers, scan, and
    /// remove the pool if it is retired and empty. Steps run in order.
    #[instrument(skip(self, pool), fields(worker_pool_id = %pool.record.worker_pool_id))]
    pub async fn provision_pool(
        &self,
        pool: Versioned<WorkerPool>,
        now: DateTime<Utc>,
    ) -> ProvisionerResult<PoolStats> {
        let mut stats = PoolStats::default();
        let pool = pool.record;

        if !pool.is_retired() {
            match self.providers.get(&pool.provider_id).await {
                Some(provider) => self.converge(provider.as_ref(), &pool, now, &mut stats).await?,
                None => {
                    let error = WorkerPoolError::new(
                        pool.worker_pool_id.clone(),
                        ErrorKind::Permanent,
                        "Provider Unavailable",
                        format!("provider {} is not configured or failed to start", pool.provider_id),
                    );
                    self.ctx.report_error(&pool, error).await;
                }
            }
        }

        for previous in &pool.previous_provider_ids {
            if previous.as_str() == NULL_PROVIDER {
                self.forget_provider(&pool.worker_pool_id, previous, now).await?;
                continue;
            }
            let Some(provider) = self.providers.get(previous).await else {
                warn!(provider_id = %previous, "Previous provider unavailable; its workers stay put");
                continue;
            };
            let remaining = provider.deprovision(&self.ctx, &pool, now).await?;
            if remaining == 0 {
                self.forget_provider(&pool.worker_pool_id, previous, now).await?;
                stats.providers_retired += 1;
            }
        }

        match self.scanner.scan_pool(&pool, now).await {
            Some(scan) => stats.scan = scan,
            None => warn!("Scan incomplete; retrying next pass"),
        }

        if pool.is_retired() {
            stats.pool_removed = self.remove_if_drained(&pool.worker_pool_id).await?;
        }
        Ok(stats)
    }

    async fn converge(
        &self,
        provider: &dyn Provider,
        pool: &WorkerPool,
        now: DateTime<Utc>,
        stats: &mut PoolStats,
    ) -> ProvisionerResult<()> {
        let workers: Vec<_> = self
            .ctx
            .registry()
            .list_workers(&pool.worker_pool_id, &COUNTED_STATES)
            .await?
            .into_iter()
            .filter(|w| w.record.provider_id == pool.provider_id)
            .collect();
        let existing: u64 = workers
            .iter()
            .map(|w| u64::from(w.record.effective_capacity(now)))
            .sum();

        let pending = match self.demand.pending_tasks(&pool.worker_pool_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Demand signal unavailable; assuming no pending work");
                0
            }
        };

        let est = estimate(&EstimatorInput {
            existing_capacity: existing,
            pending_demand: pending,
            min_capacity: pool.config.min_capacity,
            max_capacity: pool.config.max_capacity,
            scaling_ratio: pool.config.scaling_ratio,
            step: pool.config.capacity_per_instance,
        })?;
        debug!(
            existing,
            pending,
            desired = est.desired_capacity,
            delta = est.delta,
            "Estimated capacity"
        );

        if est.is_growth() {
            let capacity = est.delta.unsigned_abs();
            let outcome = provider.provision(&self.ctx, pool, capacity, now).await?;
            stats.capacity_requested = capacity;
            stats.workers_created = outcome.created.len();
            if outcome.failed == 0 {
                self.ctx.clear_failures(&pool.worker_pool_id).await;
            }
        } else {
            if est.is_shrink() {
                stats.workers_removed = self
                    .shrink(provider, pool, workers, est.delta.unsigned_abs(), now)
                    .await;
            }
            self.ctx.clear_failures(&pool.worker_pool_id).await;
        }
        Ok(())
    }

    /// Remove at most `excess` capacity, least useful workers first.
    async fn shrink(
        &self,
        provider: &dyn Provider,
        pool: &WorkerPool,
        mut workers: Vec<Versioned<Worker>>,
        excess: u64,
        now: DateTime<Utc>,
    ) -> usize {
        // Newest first within a priority.
        workers.sort_by(|a, b| b.record.created.cmp(&a.record.created));
        let ordered = select_for_drain(workers, |w| drain_priority(pool, &w.record, now));
        let picked = take_capacity(ordered, excess, |w| {
            u64::from(w.record.effective_capacity(now))
        });

        let mut removed = 0;
        for worker in &picked {
            match provider.remove_worker(&self.ctx, worker, now).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    worker = %worker.record.key(),
                    error = %e,
                    "Failed to remove surplus worker"
                ),
            }
        }
        info!(excess, removed, "Shrunk pool");
        removed
    }

    async fn forget_provider(
        &self,
        pool_id: &WorkerPoolId,
        provider_id: &ProviderId,
        now: DateTime<Utc>,
    ) -> ProvisionerResult<()> {
        let id = pool_id.to_string();
        retry_on_conflict::<_, ProvisionerError, _, _>("worker pool", &id, || {
            let registry = self.ctx.registry().clone();
            let pool_id = pool_id.clone();
            let provider_id = provider_id.clone();
            async move {
                let Some(current) = registry.get_worker_pool(&pool_id).await? else {
                    return Ok(());
                };
                if !current.record.previous_provider_ids.contains(&provider_id) {
                    return Ok(());
                }
                let mut next = current.record.clone();
                next.forget_previous_provider(&provider_id, now);
                registry.update_worker_pool(next, current.version).await?;
                info!(provider_id = %provider_id, "Previous provider drained; forgotten");
                Ok(())
            }
        })
        .await
    }

    async fn remove_if_drained(&self, pool_id: &WorkerPoolId) -> ProvisionerResult<bool> {
        let id = pool_id.to_string();
        retry_on_conflict::<_, ProvisionerError, _, _>("worker pool", &id, || {
            let registry = self.ctx.registry().clone();
            let pool_id = pool_id.clone();
            async move {
                let Some(current) = registry.get_worker_pool(&pool_id).await? else {
                    return Ok(false);
                };
                if !current.record.is_retired() || !current.record.previous_provider_ids.is_empty()
                {
                    return Ok(false);
                }
                if !registry.list_workers(&pool_id, &LIVE_STATES).await?.is_empty() {
                    return Ok(false);
                }
                match registry.delete_worker_pool(&pool_id, current.version).await {
                    Ok(()) => {
                        info!("Retired pool drained; removed");
                        Ok(true)
                    }
                    Err(RegistryError::PoolNotEmpty(_)) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
        })
        .await
    }
}
