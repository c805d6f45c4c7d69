//! Worker registration.
//!
//! A worker calls in with its identity tuple and a provider-specific proof.
//! The provider that created the worker checks the proof; only then is the
//! worker moved to `running` with a fresh expiry and handed credentials that
//! expire with it. A refused registration writes nothing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleet_id::{WorkerGroup, WorkerId, WorkerPoolId};
use fleet_model::{Versioned, Worker, WorkerKey};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::credentials::{CredentialIssuer, IssuedCredentials};
use crate::providers::{IdentityProof, ProviderContext, Providers, RegistrationError};
use crate::registry::retry_on_conflict;

/// Registration request, as sent by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub worker_pool_id: WorkerPoolId,
    pub worker_group: WorkerGroup,
    pub worker_id: WorkerId,
    #[serde(default)]
    pub worker_identity_proof: IdentityProof,
}

impl RegistrationRequest {
    pub fn key(&self) -> WorkerKey {
        WorkerKey::new(
            self.worker_pool_id.clone(),
            self.worker_group.clone(),
            self.worker_id.clone(),
        )
    }
}

/// Successful registration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registered {
    pub expires: DateTime<Utc>,
    pub credentials: IssuedCredentials,
}

/// Refuse workers that are on their way out or past their expiry.
fn ensure_registrable(worker: &Worker, now: DateTime<Utc>) -> Result<(), RegistrationError> {
    if !worker.state.counts_toward_capacity() {
        return Err(RegistrationError::WorkerStopped {
            key: worker.key().to_string(),
            state: worker.state,
        });
    }
    if worker.is_expired(now) {
        return Err(RegistrationError::WorkerExpired(worker.key().to_string()));
    }
    Ok(())
}

/// Handles worker registration.
#[derive(Clone)]
pub struct Registrar {
    ctx: Arc<ProviderContext>,
    providers: Arc<Providers>,
    issuer: CredentialIssuer,
}

impl Registrar {
    pub fn new(ctx: Arc<ProviderContext>, providers: Arc<Providers>) -> Self {
        let issuer = CredentialIssuer::new(ctx.registry().clone());
        Self {
            ctx,
            providers,
            issuer,
        }
    }

    pub fn issuer(&self) -> &CredentialIssuer {
        &self.issuer
    }

    /// Register (or re-register) a worker.
    #[instrument(skip(self, request), fields(worker = %request.key()))]
    pub async fn register(
        &self,
        request: &RegistrationRequest,
        now: DateTime<Utc>,
    ) -> Result<Registered, RegistrationError> {
        let registry = self.ctx.registry();
        let key = request.key();

        let pool = registry
            .get_worker_pool(&request.worker_pool_id)
            .await?
            .ok_or_else(|| RegistrationError::WorkerPoolNotFound(request.worker_pool_id.to_string()))?;
        let worker = registry
            .get_worker(&key)
            .await?
            .ok_or_else(|| RegistrationError::WorkerNotFound(key.to_string()))?;
        ensure_registrable(&worker.record, now)?;

        let provider_id = &worker.record.provider_id;
        if !pool.record.knows_provider(provider_id) {
            return Err(RegistrationError::ProviderUnavailable(provider_id.to_string()));
        }
        let provider = self
            .providers
            .get(provider_id)
            .await
            .ok_or_else(|| RegistrationError::ProviderUnavailable(provider_id.to_string()))?;

        let expires = provider
            .register_worker(
                &self.ctx,
                &pool.record,
                &worker.record,
                &request.worker_identity_proof,
                now,
            )
            .await?;

        let stored = self.mark_running(&key, expires, now).await?;

        let credentials = self.issuer.issue(&key, stored.record.expires, now).await?;
        info!(
            provider_id = %stored.record.provider_id,
            expires = %stored.record.expires,
            "Worker registered"
        );
        Ok(Registered {
            expires: stored.record.expires,
            credentials,
        })
    }

    /// Apply the registration, re-reading on every version conflict.
    ///
    /// Each retry re-checks the worker, so a concurrent reap wins and the
    /// registration fails. The stored expiry is exactly the granted lease.
    async fn mark_running(
        &self,
        key: &WorkerKey,
        expires: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Versioned<Worker>, RegistrationError> {
        let key_str = key.to_string();
        retry_on_conflict::<_, RegistrationError, _, _>("worker", &key_str, || {
            let registry = self.ctx.registry().clone();
            let key = key.clone();
            async move {
                let current = registry
                    .get_worker(&key)
                    .await?
                    .ok_or_else(|| RegistrationError::WorkerNotFound(key.to_string()))?;
                ensure_registrable(&current.record, now)?;

                let mut next = current.record.clone();
                next.mark_registered(expires, now)
                    .map_err(|e| RegistrationError::WorkerStopped {
                        key: key.to_string(),
                        state: e.from,
                    })?;
                Ok(registry.update_worker(next, current.version).await?)
            }
        })
        .await
    }
}
