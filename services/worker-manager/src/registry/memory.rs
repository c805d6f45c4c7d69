//! In-memory registry.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::WorkerPoolId;
use fleet_model::{
    ModelError, Versioned, Worker, WorkerCredential, WorkerKey, WorkerPool, WorkerPoolError,
    WorkerState, INITIAL_VERSION,
};
use tokio::sync::RwLock;

use super::{Registry, RegistryError, RegistryResult};

#[derive(Default)]
struct Tables {
    pools: BTreeMap<WorkerPoolId, Versioned<WorkerPool>>,
    workers: BTreeMap<WorkerKey, Versioned<Worker>>,
    errors: Vec<WorkerPoolError>,
    credentials: HashMap<String, WorkerCredential>,
}

/// Registry held entirely in process memory.
///
/// All state is lost on restart; used when no `DATABASE_URL` is configured
/// and throughout the tests.
#[derive(Default)]
pub struct MemoryRegistry {
    tables: RwLock<Tables>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) fn check_new_worker(worker: &Worker) -> RegistryResult<()> {
    if worker.capacity == 0 {
        return Err(ModelError::InvalidCapacity(0).into());
    }
    if worker.state.counts_toward_capacity() && worker.expires <= worker.created {
        return Err(ModelError::ExpiresInPast(worker.expires.to_rfc3339()).into());
    }
    Ok(())
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn health_check(&self) -> RegistryResult<()> {
        Ok(())
    }

    async fn get_worker_pool(
        &self,
        id: &WorkerPoolId,
    ) -> RegistryResult<Option<Versioned<WorkerPool>>> {
        Ok(self.tables.read().await.pools.get(id).cloned())
    }

    async fn list_worker_pools(&self) -> RegistryResult<Vec<Versioned<WorkerPool>>> {
        Ok(self.tables.read().await.pools.values().cloned().collect())
    }

    async fn create_worker_pool(&self, pool: WorkerPool) -> RegistryResult<Versioned<WorkerPool>> {
        pool.validate()?;
        let mut tables = self.tables.write().await;
        if tables.pools.contains_key(&pool.worker_pool_id) {
            return Err(RegistryError::already_exists(
                "worker pool",
                &pool.worker_pool_id,
            ));
        }
        let stored = Versioned::new(INITIAL_VERSION, pool);
        tables
            .pools
            .insert(stored.record.worker_pool_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn update_worker_pool(
        &self,
        pool: WorkerPool,
        expected_version: i64,
    ) -> RegistryResult<Versioned<WorkerPool>> {
        pool.validate()?;
        let mut tables = self.tables.write().await;
        let Some(current) = tables.pools.get_mut(&pool.worker_pool_id) else {
            return Err(RegistryError::not_found("worker pool", &pool.worker_pool_id));
        };
        if current.version != expected_version {
            return Err(RegistryError::conflict(
                "worker pool",
                &pool.worker_pool_id,
                expected_version,
                current.version,
            ));
        }
        *current = Versioned::new(current.version + 1, pool);
        Ok(current.clone())
    }

    async fn delete_worker_pool(
        &self,
        id: &WorkerPoolId,
        expected_version: i64,
    ) -> RegistryResult<()> {
        let mut tables = self.tables.write().await;
        let Some(current) = tables.pools.get(id) else {
            return Err(RegistryError::not_found("worker pool", id));
        };
        if current.version != expected_version {
            return Err(RegistryError::conflict(
                "worker pool",
                id,
                expected_version,
                current.version,
            ));
        }
        let has_live = tables
            .workers
            .values()
            .any(|w| &w.record.worker_pool_id == id && w.record.state.is_live());
        if has_live {
            return Err(RegistryError::PoolNotEmpty(id.to_string()));
        }
        tables.pools.remove(id);
        tables.workers.retain(|k, _| &k.worker_pool_id != id);
        Ok(())
    }

    async fn get_worker(&self, key: &WorkerKey) -> RegistryResult<Option<Versioned<Worker>>> {
        Ok(self.tables.read().await.workers.get(key).cloned())
    }

    async fn create_worker(&self, worker: Worker) -> RegistryResult<Versioned<Worker>> {
        check_new_worker(&worker)?;
        let key = worker.key();
        let mut tables = self.tables.write().await;
        if !tables.pools.contains_key(&key.worker_pool_id) {
            return Err(RegistryError::not_found(
                "worker pool",
                &key.worker_pool_id,
            ));
        }
        if tables.workers.contains_key(&key) {
            return Err(RegistryError::already_exists("worker", &key));
        }
        let stored = Versioned::new(INITIAL_VERSION, worker);
        tables.workers.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update_worker(
        &self,
        worker: Worker,
        expected_version: i64,
    ) -> RegistryResult<Versioned<Worker>> {
        let key = worker.key();
        let mut tables = self.tables.write().await;
        let Some(current) = tables.workers.get_mut(&key) else {
            return Err(RegistryError::not_found("worker", &key));
        };
        if current.version != expected_version {
            return Err(RegistryError::conflict(
                "worker",
                &key,
                expected_version,
                current.version,
            ));
        }
        *current = Versioned::new(current.version + 1, worker);
        Ok(current.clone())
    }

    async fn list_workers(
        &self,
        pool: &WorkerPoolId,
        states: &[WorkerState],
    ) -> RegistryResult<Vec<Versioned<Worker>>> {
        let tables = self.tables.read().await;
        Ok(tables
            .workers
            .values()
            .filter(|w| &w.record.worker_pool_id == pool)
            .filter(|w| states.is_empty() || states.contains(&w.record.state))
            .cloned()
            .collect())
    }

    async fn purge_stopped_workers(&self, before: DateTime<Utc>) -> RegistryResult<u64> {
        let mut tables = self.tables.write().await;
        let len = tables.workers.len();
        tables.workers.retain(|_, w| {
            !(w.record.state == WorkerState::Stopped && w.record.last_modified < before)
        });
        Ok((len - tables.workers.len()) as u64)
    }

    async fn record_error(&self, error: WorkerPoolError) -> RegistryResult<()> {
        self.tables.write().await.errors.push(error);
        Ok(())
    }

    async fn list_errors(&self, pool: &WorkerPoolId) -> RegistryResult<Vec<WorkerPoolError>> {
        let tables = self.tables.read().await;
        let mut errors: Vec<_> = tables
            .errors
            .iter()
            .filter(|e| &e.worker_pool_id == pool)
            .cloned()
            .collect();
        errors.sort_by(|a, b| b.reported_at.cmp(&a.reported_at));
        Ok(errors)
    }

    async fn insert_credential(&self, credential: WorkerCredential) -> RegistryResult<()> {
        let mut tables = self.tables.write().await;
        if tables.credentials.contains_key(&credential.token_hash) {
            return Err(RegistryError::already_exists(
                "credential",
                &credential.credential_id,
            ));
        }
        tables
            .credentials
            .insert(credential.token_hash.clone(), credential);
        Ok(())
    }

    async fn find_credential(&self, token_hash: &str) -> RegistryResult<Option<WorkerCredential>> {
        Ok(self.tables.read().await.credentials.get(token_hash).cloned())
    }

    async fn purge_expired_credentials(&self, before: DateTime<Utc>) -> RegistryResult<u64> {
        let mut tables = self.tables.write().await;
        let len = tables.credentials.len();
        tables.credentials.retain(|_, c| c.expires_at >= before);
        Ok((len - tables.credentials.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fleet_model::{ProviderData, WorkerPoolConfig};

    fn pool(id: &str) -> WorkerPool {
        let now = Utc::now();
        WorkerPool {
            worker_pool_id: id.parse().unwrap(),
            provider_id: "stat".parse().unwrap(),
            previous_provider_ids: vec![],
            description: String::new(),
            config: WorkerPoolConfig::default(),
            owner: "owner@example.com".to_string(),
            email_on_error: false,
            created: now,
            last_modified: now,
        }
    }

    fn worker(pool: &str, id: &str) -> Worker {
        let now = Utc::now();
        Worker::requested(
            WorkerKey::new(pool.parse().unwrap(), "grp".parse().unwrap(), id.parse().unwrap()),
            "stat".parse().unwrap(),
            1,
            now + Duration::seconds(90),
            ProviderData::Static {
                static_secret: "good".to_string(),
            },
            now,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_pool_create_and_duplicate() {
        let reg = MemoryRegistry::new();
        let created = reg.create_worker_pool(pool("foo/bar")).await.unwrap();
        assert_eq!(created.version, INITIAL_VERSION);
        let err = reg.create_worker_pool(pool("foo/bar")).await.unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_stale_worker_update_conflicts() {
        let reg = MemoryRegistry::new();
        reg.create_worker_pool(pool("foo/bar")).await.unwrap();
        let stored = reg.create_worker(worker("foo/bar", "w1")).await.unwrap();

        let mut first = stored.record.clone();
        first.transition(WorkerState::Running, Utc::now()).unwrap();
        let updated = reg.update_worker(first, stored.version).await.unwrap();
        assert_eq!(updated.version, stored.version + 1);

        let mut second = stored.record.clone();
        second.transition(WorkerState::Stopped, Utc::now()).unwrap();
        let err = reg.update_worker(second, stored.version).await.unwrap_err();
        assert!(err.is_conflict());

        let current = reg.get_worker(&stored.record.key()).await.unwrap().unwrap();
        assert_eq!(current.record.state, WorkerState::Running);
    }

    #[tokio::test]
    async fn test_create_worker_requires_pool() {
        let reg = MemoryRegistry::new();
        let err = reg.create_worker(worker("foo/bar", "w1")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_workers_filters_by_state() {
        let reg = MemoryRegistry::new();
        reg.create_worker_pool(pool("foo/bar")).await.unwrap();
        reg.create_worker_pool(pool("foo/baz")).await.unwrap();
        reg.create_worker(worker("foo/bar", "w1")).await.unwrap();
        let w2 = reg.create_worker(worker("foo/bar", "w2")).await.unwrap();
        reg.create_worker(worker("foo/baz", "w3")).await.unwrap();

        let mut stopped = w2.record.clone();
        stopped.transition(WorkerState::Stopped, Utc::now()).unwrap();
        reg.update_worker(stopped, w2.version).await.unwrap();

        let pool_id: WorkerPoolId = "foo/bar".parse().unwrap();
        assert_eq!(reg.list_workers(&pool_id, &[]).await.unwrap().len(), 2);
        let requested = reg
            .list_workers(&pool_id, &[WorkerState::Requested])
            .await
            .unwrap();
        assert_eq!(requested.len(), 1);
        assert_eq!(requested[0].record.worker_id.as_str(), "w1");
    }

    #[tokio::test]
    async fn test_delete_pool_refused_while_workers_live() {
        let reg = MemoryRegistry::new();
        let p = reg.create_worker_pool(pool("foo/bar")).await.unwrap();
        let w = reg.create_worker(worker("foo/bar", "w1")).await.unwrap();
        let id = p.record.worker_pool_id.clone();

        let err = reg.delete_worker_pool(&id, p.version).await.unwrap_err();
        assert!(matches!(err, RegistryError::PoolNotEmpty(_)));

        let mut stopped = w.record.clone();
        stopped.transition(WorkerState::Stopped, Utc::now()).unwrap();
        reg.update_worker(stopped, w.version).await.unwrap();
        reg.delete_worker_pool(&id, p.version).await.unwrap();
        assert!(reg.get_worker_pool(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_stopped_workers() {
        let reg = MemoryRegistry::new();
        reg.create_worker_pool(pool("foo/bar")).await.unwrap();
        let w = reg.create_worker(worker("foo/bar", "w1")).await.unwrap();
        reg.create_worker(worker("foo/bar", "w2")).await.unwrap();
        let mut stopped = w.record.clone();
        stopped.transition(WorkerState::Stopped, Utc::now()).unwrap();
        reg.update_worker(stopped, w.version).await.unwrap();

        let purged = reg
            .purge_stopped_workers(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        let pool_id: WorkerPoolId = "foo/bar".parse().unwrap();
        assert_eq!(reg.list_workers(&pool_id, &[]).await.unwrap().len(), 1);
    }
}
