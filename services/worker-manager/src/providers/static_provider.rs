//! Static provider.
//!
//! Static workers run on hardware nobody provisions for us. An operator
//! creates the worker record with a shared secret; the worker later proves
//! itself by presenting that secret. There is no backend to grow, so
//! `provision` does nothing and a `stopping` worker is gone as soon as the
//! scan sees it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::{ProviderId, WorkerGroup, WorkerId};
use fleet_model::{ProviderData, Versioned, Worker, WorkerKey, WorkerPool, WorkerState};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{
    IdentityProof, Provider, ProviderContext, ProviderKind, ProviderResult, ProvisionOutcome,
    RegistrationError, WorkerHealth,
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StaticProof {
    static_secret: Option<String>,
}

/// Compare two secrets without leaking where they differ.
fn secrets_match(given: &str, expected: &str) -> bool {
    let given = Sha256::digest(given.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    given
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

pub struct StaticProvider {
    id: ProviderId,
}

impl StaticProvider {
    pub fn new(id: ProviderId) -> Self {
        Self { id }
    }
}

#[async_trait]
impl Provider for StaticProvider {
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
        pool: &WorkerPool,
        capacity: u64,
        _now: DateTime<Utc>,
    ) -> ProviderResult<ProvisionOutcome> {
        debug!(
            worker_pool_id = %pool.worker_pool_id,
            capacity,
            "Static pools are sized by their operator"
        );
        Ok(ProvisionOutcome {
            requested: capacity,
            ..Default::default()
        })
    }

    async fn register_worker(
        &self,
        _ctx: &ProviderContext,
        pool: &WorkerPool,
        worker: &Worker,
        proof: &IdentityProof,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, RegistrationError> {
        let given = serde_json::from_value::<StaticProof>(proof.clone())
            .ok()
            .and_then(|p| p.static_secret)
            .ok_or(RegistrationError::MissingStaticSecret)?;

        let ProviderData::Static { static_secret } = &worker.provider_data else {
            return Err(RegistrationError::InvalidProof(
                "worker was not created by a static provider".to_string(),
            ));
        };
        if !secrets_match(&given, static_secret) {
            return Err(RegistrationError::BadStaticSecret);
        }

        Ok(now + pool.config.lifecycle.reregistration_timeout())
    }

    async fn check_worker(
        &self,
        _ctx: &ProviderContext,
        worker: &Worker,
        _now: DateTime<Utc>,
    ) -> ProviderResult<WorkerHealth> {
        Ok(match worker.state {
            WorkerState::Stopping | WorkerState::Stopped => WorkerHealth::Gone,
            WorkerState::Requested | WorkerState::Running => WorkerHealth::Alive,
        })
    }

    async fn terminate(&self, _ctx: &ProviderContext, _worker: &Worker) -> ProviderResult<()> {
        Ok(())
    }
}

/// Operator input for creating a static worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticWorkerSpec {
    pub static_secret: String,

    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// Defaults to the pool's registration timeout from now.
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

fn default_capacity() -> u32 {
    1
}

/// Record a static worker in `requested` state under the pool's provider.
pub async fn create_static_worker(
    ctx: &ProviderContext,
    pool: &WorkerPool,
    worker_group: WorkerGroup,
    worker_id: WorkerId,
    spec: StaticWorkerSpec,
    now: DateTime<Utc>,
) -> ProviderResult<Versioned<Worker>> {
    let expires = spec
        .expires
        .unwrap_or_else(|| now + pool.config.lifecycle.registration_timeout());
    let worker = Worker::requested(
        WorkerKey::new(pool.worker_pool_id.clone(), worker_group, worker_id),
        pool.provider_id.clone(),
        spec.capacity,
        expires,
        ProviderData::Static {
            static_secret: spec.static_secret,
        },
        now,
    )?;
    Ok(ctx.registry().create_worker(worker).await?)
}
