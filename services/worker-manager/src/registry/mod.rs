//! Worker registry.
//!
//! The registry is the single source of truth for pools, workers, pool
//! errors and issued credentials. Every mutation of a pool or worker is a
//! compare-and-swap against the version the caller read: a stale write
//! fails with [`RegistryError::Conflict`] and the caller re-reads and
//! re-decides. Two backends exist:
//! - [`MemoryRegistry`] for development and tests
//! - [`PgRegistry`] backed by Postgres via SQLx

mod error;
mod memory;
mod postgres;

pub use error::{ConflictAware, RegistryError};
pub use memory::MemoryRegistry;
pub use postgres::{Database, DbConfig, PgRegistry};

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::WorkerPoolId;
use fleet_model::{
    Versioned, Worker, WorkerCredential, WorkerKey, WorkerPool, WorkerPoolError, WorkerState,
};
use tracing::debug;

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Attempts made by [`retry_on_conflict`] before giving up.
pub const MAX_CONFLICT_RETRIES: u32 = 5;

/// Storage for pools, workers, errors and credentials.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Check the backing store is reachable.
    async fn health_check(&self) -> RegistryResult<()>;

    async fn get_worker_pool(
        &self,
        id: &WorkerPoolId,
    ) -> RegistryResult<Option<Versioned<WorkerPool>>>;

    async fn list_worker_pools(&self) -> RegistryResult<Vec<Versioned<WorkerPool>>>;

    /// Insert a new pool. Fails with `AlreadyExists` if the id is taken.
    async fn create_worker_pool(&self, pool: WorkerPool) -> RegistryResult<Versioned<WorkerPool>>;

    /// Replace a pool if its stored version still equals `expected_version`.
    async fn update_worker_pool(
        &self,
        pool: WorkerPool,
        expected_version: i64,
    ) -> RegistryResult<Versioned<WorkerPool>>;

    /// Remove a pool. Refused while any of its workers is not `stopped`.
    async fn delete_worker_pool(
        &self,
        id: &WorkerPoolId,
        expected_version: i64,
    ) -> RegistryResult<()>;

    async fn get_worker(&self, key: &WorkerKey) -> RegistryResult<Option<Versioned<Worker>>>;

    /// Insert a new worker into an existing pool.
    async fn create_worker(&self, worker: Worker) -> RegistryResult<Versioned<Worker>>;

    /// Replace a worker if its stored version still equals `expected_version`.
    async fn update_worker(
        &self,
        worker: Worker,
        expected_version: i64,
    ) -> RegistryResult<Versioned<Worker>>;

    /// List a pool's workers, restricted to `states` unless it is empty.
    async fn list_workers(
        &self,
        pool: &WorkerPoolId,
        states: &[WorkerState],
    ) -> RegistryResult<Vec<Versioned<Worker>>>;

    /// Delete `stopped` workers last modified before `before`.
    async fn purge_stopped_workers(&self, before: DateTime<Utc>) -> RegistryResult<u64>;

    async fn record_error(&self, error: WorkerPoolError) -> RegistryResult<()>;

    /// A pool's errors, newest first.
    async fn list_errors(&self, pool: &WorkerPoolId) -> RegistryResult<Vec<WorkerPoolError>>;

    async fn insert_credential(&self, credential: WorkerCredential) -> RegistryResult<()>;

    async fn find_credential(&self, token_hash: &str) -> RegistryResult<Option<WorkerCredential>>;

    /// Delete credentials that expired before `before`.
    async fn purge_expired_credentials(&self, before: DateTime<Utc>) -> RegistryResult<u64>;
}

/// Run a read-modify-write attempt until it stops losing version races.
///
/// `attempt` must re-read the record it writes on every call. Any error other
/// than a conflict is returned as-is; after [`MAX_CONFLICT_RETRIES`] conflicts
/// the call fails with [`RegistryError::Contention`].
pub async fn retry_on_conflict<T, E, F, Fut>(
    kind: &'static str,
    id: &str,
    mut attempt: F,
) -> Result<T, E>
where
    E: ConflictAware + From<RegistryError>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    for n in 1..=MAX_CONFLICT_RETRIES {
        match attempt().await {
            Err(e) if e.is_conflict() => {
                debug!(kind, id, attempt = n, "Version conflict, retrying");
            }
            other => return other,
        }
    }
    Err(RegistryError::Contention {
        kind,
        id: id.to_string(),
        attempts: MAX_CONFLICT_RETRIES,
    }
    .into())
}
