//! Worker providers.
//!
//! A provider turns capacity requests into workers on some backend and
//! vouches for those workers when they register. Two kinds exist:
//!
//! - [`StaticProvider`]: workers are created by an operator and prove their
//!   identity with a shared secret
//! - [`CloudProvider`]: workers are instances created through a [`CloudApi`]
//!   and prove their identity with a signed attestation document
//!
//! Lifecycle steps that every provider shares (removing a worker, draining a
//! pool, reaping dead workers) are default methods on [`Provider`], built on
//! the backend hooks each kind implements.

mod cloud;
pub mod cloud_api;
mod error;
mod lifecycle;
mod static_provider;

pub use cloud::CloudProvider;
pub use cloud_api::{
    AttestedIdentity, CloudApi, CloudApiError, CreateInstance, FakeCloudApi, HttpCloudApi,
    Instance, InstanceStatus,
};
pub use error::{ProviderError, ProviderResult, RegistrationError};
pub use lifecycle::ScanStats;
pub use static_provider::{create_static_worker, StaticProvider, StaticWorkerSpec};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::{ProviderId, WorkerPoolId};
use fleet_model::{Versioned, Worker, WorkerKey, WorkerPool, WorkerPoolError};
use fleet_reconcile::{RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::notify::Notifier;
use crate::registry::Registry;

/// Provider-specific identity proof presented at registration.
///
/// Each provider kind decodes its own shape from this value.
pub type IdentityProof = serde_json::Value;

/// Provider kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Static,
    Cloud,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Cloud => "cloud",
        }
    }
}

/// What the backend says about a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerHealth {
    Alive,
    Gone,
}

/// Result of one `provision` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionOutcome {
    /// Capacity the caller asked for.
    pub requested: u64,
    /// Workers recorded as `requested`.
    pub created: Vec<WorkerKey>,
    pub created_capacity: u64,
    /// Instances the backend refused or that could not be recorded.
    pub failed: u64,
}

/// A worker provider.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &ProviderId;

    fn kind(&self) -> ProviderKind;

    /// Acquire whatever the provider needs (backend clients) before use.
    async fn prepare(&self, ctx: &ProviderContext) -> ProviderResult<()>;

    /// Create workers for up to `capacity` additional capacity.
    ///
    /// Partial success is normal: created workers are recorded, failures are
    /// reported on the pool and counted in the outcome.
    async fn provision(
        &self,
        ctx: &ProviderContext,
        pool: &WorkerPool,
        capacity: u64,
        now: DateTime<Utc>,
    ) -> ProviderResult<ProvisionOutcome>;

    /// Check `proof` against the worker's provider data.
    ///
    /// Returns the new worker expiry on success. Never writes the registry.
    async fn register_worker(
        &self,
        ctx: &ProviderContext,
        pool: &WorkerPool,
        worker: &Worker,
        proof: &IdentityProof,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, RegistrationError>;

    /// Ask the backend whether the worker's resources still exist.
    async fn check_worker(
        &self,
        ctx: &ProviderContext,
        worker: &Worker,
        now: DateTime<Utc>,
    ) -> ProviderResult<WorkerHealth>;

    /// Release the worker's backend resources. Idempotent.
    async fn terminate(&self, ctx: &ProviderContext, worker: &Worker) -> ProviderResult<()>;

    /// Move a live worker to `stopping` and release its backend resources.
    ///
    /// Returns false if the worker was already on its way out.
    async fn remove_worker(
        &self,
        ctx: &ProviderContext,
        worker: &Versioned<Worker>,
        now: DateTime<Utc>,
    ) -> ProviderResult<bool> {
        lifecycle::remove_worker(self, ctx, worker, now).await
    }

    /// Remove every worker this provider owns in `pool`.
    ///
    /// Returns how many of them are not yet `stopped`.
    async fn deprovision(
        &self,
        ctx: &ProviderContext,
        pool: &WorkerPool,
        now: DateTime<Utc>,
    ) -> ProviderResult<usize> {
        lifecycle::deprovision(self, ctx, pool, now).await
    }

    /// Reap this provider's dead workers in `pool`.
    async fn scan_cleanup(
        &self,
        ctx: &ProviderContext,
        pool: &WorkerPool,
        now: DateTime<Utc>,
    ) -> ProviderResult<ScanStats> {
        lifecycle::scan(self, ctx, pool, now).await
    }
}

/// Shared services handed to every provider operation.
pub struct ProviderContext {
    registry: Arc<dyn Registry>,
    notifier: Arc<dyn Notifier>,
    cloud_clients: RwLock<HashMap<ProviderId, Arc<dyn CloudApi>>>,
    failures: Mutex<RetryTracker>,
}

impl ProviderContext {
    pub fn new(registry: Arc<dyn Registry>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            registry,
            notifier,
            cloud_clients: RwLock::new(HashMap::new()),
            failures: Mutex::new(RetryTracker::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW)),
        }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Register the backend client a cloud provider will use.
    pub async fn install_cloud_client(&self, provider_id: ProviderId, client: Arc<dyn CloudApi>) {
        self.cloud_clients.write().await.insert(provider_id, client);
    }

    pub async fn cloud_client(&self, provider_id: &ProviderId) -> Option<Arc<dyn CloudApi>> {
        self.cloud_clients.read().await.get(provider_id).cloned()
    }

    /// Record an error against a pool.
    ///
    /// Recording failures are logged, never propagated. Owners who asked for
    /// it hear about every error; a pool that keeps failing is escalated.
    pub async fn report_error(&self, pool: &WorkerPool, error: WorkerPoolError) {
        warn!(
            worker_pool_id = %pool.worker_pool_id,
            kind = %error.kind,
            title = %error.title,
            description = %error.description,
            "Worker pool error"
        );
        if let Err(e) = self.registry.record_error(error.clone()).await {
            warn!(
                worker_pool_id = %pool.worker_pool_id,
                error = %e,
                "Failed to record worker pool error"
            );
        }
        let exhausted = self
            .failures
            .lock()
            .await
            .record_failure(&pool.worker_pool_id.to_string());
        if exhausted {
            warn!(
                worker_pool_id = %pool.worker_pool_id,
                "Worker pool keeps failing; retries exhausted for this window"
            );
        }
        if pool.email_on_error {
            self.notifier.pool_error(pool, &error).await;
        }
    }

    /// Forget a pool's failure streak after a clean pass.
    pub async fn clear_failures(&self, pool: &WorkerPoolId) {
        let mut failures = self.failures.lock().await;
        failures.clear(&pool.to_string());
        failures.prune();
    }
}

/// Provider configuration, keyed by provider id.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "providerType", rename_all = "lowercase")]
pub enum ProviderConfig {
    Static,
    Cloud(cloud::CloudProviderConfig),
}

pub type ProvidersConfig = BTreeMap<String, ProviderConfig>;

/// The configured providers and which of them are ready.
#[derive(Default)]
pub struct Providers {
    entries: BTreeMap<ProviderId, Arc<dyn Provider>>,
    ready: RwLock<HashSet<ProviderId>>,
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider. It stays unavailable until prepared.
    pub fn with(mut self, provider: Arc<dyn Provider>) -> Self {
        self.entries.insert(provider.id().clone(), provider);
        self
    }

    /// Build providers from configuration.
    pub fn from_config(config: &ProvidersConfig) -> ProviderResult<Self> {
        let mut providers = Self::new();
        for (name, entry) in config {
            let id = ProviderId::parse(name)
                .map_err(|e| ProviderError::Config(format!("provider id {name:?}: {e}")))?;
            let provider: Arc<dyn Provider> = match entry {
                ProviderConfig::Static => Arc::new(StaticProvider::new(id)),
                ProviderConfig::Cloud(cfg) => Arc::new(CloudProvider::new(id, cfg.clone())?),
            };
            providers = providers.with(provider);
        }
        Ok(providers)
    }

    /// Prepare every provider. A provider that fails stays unavailable.
    ///
    /// Returns the number of providers ready for use.
    pub async fn prepare_all(&self, ctx: &ProviderContext) -> usize {
        let mut ready = self.ready.write().await;
        for (id, provider) in &self.entries {
            match provider.prepare(ctx).await {
                Ok(()) => {
                    info!(provider_id = %id, kind = provider.kind().as_str(), "Provider ready");
                    ready.insert(id.clone());
                }
                Err(e) => {
                    warn!(provider_id = %id, error = %e, "Provider failed to prepare; disabled");
                    ready.remove(id);
                }
            }
        }
        ready.len()
    }

    /// Look up a ready provider.
    pub async fn get(&self, id: &ProviderId) -> Option<Arc<dyn Provider>> {
        if !self.ready.read().await.contains(id) {
            return None;
        }
        self.entries.get(id).cloned()
    }

    /// Look up a configured provider whether or not it is ready.
    pub fn configured(&self, id: &ProviderId) -> Option<Arc<dyn Provider>> {
        self.entries.get(id).cloned()
    }

    pub async fn ready_count(&self) -> usize {
        self.ready.read().await.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ProviderId> {
        self.entries.keys()
    }
}
