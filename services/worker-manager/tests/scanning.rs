//! Scanner: deadline reaping, vanished backends, and the register/reap race.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fleet_id::ProviderId;
use fleet_model::{ErrorKind, Worker, WorkerPool, WorkerState};
use fleet_worker_manager::providers::{
    IdentityProof, Provider, ProviderContext, ProviderKind, ProviderResult, ProvisionOutcome,
    RegistrationError, ScanStats, WorkerHealth,
};
use fleet_worker_manager::registry::Registry;
use fleet_worker_manager::scanner::{PurgeConfig, PurgeWorker, Scanner};

use common::*;

fn scanner(h: &Harness) -> Scanner {
    Scanner::new(h.ctx.clone(), h.providers.clone())
}

async fn scan(h: &Harness, now: DateTime<Utc>) -> ScanStats {
    let pool = h.pool().await.unwrap();
    scanner(h).scan_pool(&pool.record, now).await.unwrap()
}

#[tokio::test]
async fn unregistered_worker_is_reaped_after_registration_timeout() {
    let h = Harness::new().await;
    let now = Utc::now();
    h.create_pool(pool("stat", 0, 0)).await;
    h.registry
        .create_worker(static_worker("abc123", "good", now, 7200))
        .await
        .unwrap();
    let key = worker_key("stat", "abc123");

    let stats = scan(&h, now + Duration::seconds(899)).await;
    assert_eq!(stats.reaped, 0);
    assert_eq!(h.worker(&key).await.record.state, WorkerState::Requested);

    let stats = scan(&h, now + Duration::seconds(901)).await;
    assert_eq!(stats.reaped, 1);
    assert_eq!(h.worker(&key).await.record.state, WorkerState::Stopped);

    let errors = h.registry.list_errors(&key.worker_pool_id).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ErrorKind::RegistrationTimeout);
    assert_eq!(errors[0].extra["workerId"], "abc123");
}

#[tokio::test]
async fn running_worker_is_reaped_when_its_lease_runs_out() {
    let h = Harness::new().await;
    let now = Utc::now();
    h.create_pool(pool("stat", 0, 0)).await;
    h.registry
        .create_worker(static_worker("abc123", "good", now, 90))
        .await
        .unwrap();
    let key = worker_key("stat", "abc123");
    let registered = h
        .registrar()
        .register(&request(&key, static_proof("good")), now)
        .await
        .unwrap();

    scan(&h, now + Duration::seconds(1800)).await;
    assert_eq!(h.worker(&key).await.record.state, WorkerState::Running);

    scan(&h, registered.expires + Duration::seconds(1)).await;
    assert_eq!(h.worker(&key).await.record.state, WorkerState::Stopped);
    let errors = h.registry.list_errors(&key.worker_pool_id).await.unwrap();
    assert_eq!(errors[0].kind, ErrorKind::WorkerExpired);
}

#[tokio::test]
async fn vanished_cloud_instance_is_reaped_without_terminate() {
    let h = Harness::new().await;
    let now = Utc::now();
    let pool = h.create_pool(pool("cloud", 0, 10)).await;
    let provider = h.providers.get(&pid("cloud")).await.unwrap();
    let outcome = provider.provision(&h.ctx, &pool.record, 2, now).await.unwrap();
    let gone = outcome.created[0].clone();
    let alive = outcome.created[1].clone();

    h.cloud.vanish(&cloud_instance_id(&h.worker(&gone).await.record));

    let later = now + Duration::seconds(60);
    let stats = scan(&h, later).await;
    assert_eq!(stats.checked, 2);
    assert_eq!(stats.reaped, 1);

    assert_eq!(h.worker(&gone).await.record.state, WorkerState::Stopped);
    let survivor = h.worker(&alive).await.record;
    assert_eq!(survivor.state, WorkerState::Requested);
    assert_eq!(survivor.last_checked, later);
    assert!(h.cloud.terminated().is_empty());
    assert!(h
        .registry
        .list_errors(&pool.record.worker_pool_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn timed_out_cloud_instance_is_terminated() {
    let h = Harness::new().await;
    let now = Utc::now();
    let pool = h.create_pool(pool("cloud", 0, 10)).await;
    let provider = h.providers.get(&pid("cloud")).await.unwrap();
    let outcome = provider.provision(&h.ctx, &pool.record, 1, now).await.unwrap();
    let key = outcome.created[0].clone();
    let instance_id = cloud_instance_id(&h.worker(&key).await.record);

    scan(&h, now + Duration::seconds(901)).await;

    assert_eq!(h.worker(&key).await.record.state, WorkerState::Stopped);
    assert_eq!(h.cloud.terminated(), vec![instance_id]);
    assert!(h.cloud.live_instances().is_empty());
}

#[tokio::test]
async fn removed_cloud_worker_is_confirmed_stopped() {
    let h = Harness::new().await;
    let now = Utc::now();
    let pool = h.create_pool(pool("cloud", 0, 10)).await;
    let provider = h.providers.get(&pid("cloud")).await.unwrap();
    let outcome = provider.provision(&h.ctx, &pool.record, 1, now).await.unwrap();
    let key = outcome.created[0].clone();

    let worker = h.worker(&key).await;
    assert!(provider.remove_worker(&h.ctx, &worker, now).await.unwrap());
    assert_eq!(h.worker(&key).await.record.state, WorkerState::Stopping);
    assert_eq!(h.cloud.terminated().len(), 1);

    // Removing twice is a no-op.
    let worker = h.worker(&key).await;
    assert!(!provider.remove_worker(&h.ctx, &worker, now).await.unwrap());

    let stats = scan(&h, now).await;
    assert_eq!(stats.confirmed, 1);
    assert_eq!(h.worker(&key).await.record.state, WorkerState::Stopped);
}

#[tokio::test]
async fn purge_drops_stopped_workers_past_retention() {
    let h = Harness::new().await;
    let now = Utc::now();
    h.create_pool(pool("stat", 0, 0)).await;

    let long_ago = now - Duration::days(3);
    for (id, created) in [("old", long_ago), ("recent", now)] {
        h.registry
            .create_worker(static_worker(id, "good", created, 7200))
            .await
            .unwrap();
    }
    scan(&h, long_ago + Duration::seconds(901)).await;
    scan(&h, now + Duration::seconds(901)).await;
    assert_eq!(h.worker(&worker_key("stat", "old")).await.record.state, WorkerState::Stopped);
    assert_eq!(h.worker(&worker_key("stat", "recent")).await.record.state, WorkerState::Stopped);

    PurgeWorker::new(h.ctx.clone(), PurgeConfig::default())
        .purge()
        .await;

    let key = worker_key("stat", "old");
    assert!(h.registry.get_worker(&key).await.unwrap().is_none());
    assert!(h
        .registry
        .get_worker(&worker_key("stat", "recent"))
        .await
        .unwrap()
        .is_some());
}

/// Static-like provider whose health check races a registration.
///
/// While the scanner holds its snapshot of the worker, the worker registers;
/// the check then reports the backend gone.
struct RacingProvider {
    id: ProviderId,
}

#[async_trait]
impl Provider for RacingProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Static
    }

    async fn prepare(&self, _ctx: &ProviderContext) -> ProviderResult<()> {
        Ok(())
    }

    async fn provision(
        &self,
        _ctx: &ProviderContext,
        _pool: &WorkerPool,
        capacity: u64,
        _now: DateTime<Utc>,
    ) -> ProviderResult<ProvisionOutcome> {
        Ok(ProvisionOutcome {
            requested: capacity,
            ..Default::default()
        })
    }

    async fn register_worker(
        &self,
        _ctx: &ProviderContext,
        pool: &WorkerPool,
        _worker: &Worker,
        _proof: &IdentityProof,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, RegistrationError> {
        Ok(now + pool.config.lifecycle.reregistration_timeout())
    }

    async fn check_worker(
        &self,
        ctx: &ProviderContext,
        worker: &Worker,
        now: DateTime<Utc>,
    ) -> ProviderResult<WorkerHealth> {
        let current = ctx.registry().get_worker(&worker.key()).await?.unwrap();
        let mut next = current.record.clone();
        next.mark_registered(now + Duration::seconds(3600), now)?;
        ctx.registry().update_worker(next, current.version).await?;
        Ok(WorkerHealth::Gone)
    }

    async fn terminate(&self, _ctx: &ProviderContext, _worker: &Worker) -> ProviderResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn scan_never_reaps_a_worker_that_registered_meanwhile() {
    let h = Harness::new().await;
    let now = Utc::now();
    let racing = Arc::new(RacingProvider { id: pid("racing") });
    racing.prepare(&h.ctx).await.unwrap();
    h.create_pool(pool("racing", 0, 0)).await;

    let mut worker = static_worker("abc123", "good", now, 600);
    worker.provider_id = pid("racing");
    h.registry.create_worker(worker).await.unwrap();
    let key = worker_key("stat", "abc123");

    let pool = h.pool().await.unwrap();
    let stats = racing.scan_cleanup(&h.ctx, &pool.record, now).await.unwrap();

    assert_eq!(stats.reaped, 0);
    assert_eq!(stats.skipped, 1);
    let stored = h.worker(&key).await.record;
    assert_eq!(stored.state, WorkerState::Running);
    assert!(h
        .registry
        .list_errors(&key.worker_pool_id)
        .await
        .unwrap()
        .is_empty());
}
