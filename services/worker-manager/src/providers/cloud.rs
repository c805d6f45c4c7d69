//! Cloud provider.
//!
//! Creates one backend instance per `capacityPerInstance` of requested
//! capacity and admits an instance once the backend verifies the signed
//! identity document it presents.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::{ProviderId, Ulid, WorkerGroup, WorkerId};
use fleet_model::{ProviderData, Worker, WorkerKey, WorkerPool, WorkerPoolError, WorkerState};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::cloud_api::{
    CloudApi, CloudApiError, CreateInstance, HttpCloudApi, Instance, InstanceStatus,
};
use super::{
    IdentityProof, Provider, ProviderContext, ProviderError, ProviderKind, ProviderResult,
    ProvisionOutcome, RegistrationError, WorkerHealth,
};
use crate::registry::retry_on_conflict;

/// Configuration of a cloud provider.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudProviderConfig {
    pub api_url: String,
    pub project: String,
    /// Zone new instances are created in; also their worker group.
    pub zone: String,
    #[serde(default)]
    pub credentials: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl std::fmt::Debug for CloudProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudProviderConfig")
            .field("api_url", &self.api_url)
            .field("project", &self.project)
            .field("zone", &self.zone)
            .field("credentials", &self.credentials.as_ref().map(|_| "<redacted>"))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct CloudProof {
    document: String,
    signature: String,
}

pub struct CloudProvider {
    id: ProviderId,
    group: WorkerGroup,
    config: CloudProviderConfig,
}

impl CloudProvider {
    pub fn new(id: ProviderId, config: CloudProviderConfig) -> ProviderResult<Self> {
        let group = WorkerGroup::parse(&config.zone)
            .map_err(|e| ProviderError::Config(format!("zone {:?}: {e}", config.zone)))?;
        Ok(Self { id, group, config })
    }

    async fn api(&self, ctx: &ProviderContext) -> ProviderResult<Arc<dyn CloudApi>> {
        ctx.cloud_client(&self.id)
            .await
            .ok_or_else(|| ProviderError::NotPrepared(self.id.clone()))
    }

    fn zone_of<'a>(&self, worker: &'a Worker) -> ProviderResult<(Option<&'a str>, &'a str)> {
        match &worker.provider_data {
            ProviderData::Cloud {
                instance_id, zone, ..
            } => Ok((instance_id.as_deref(), zone.as_str())),
            ProviderData::Static { .. } => Err(ProviderError::Permanent(format!(
                "worker {} has no cloud instance",
                worker.key()
            ))),
        }
    }

    /// The backend instance behind a worker, looked up by name if the
    /// record never got its instance id.
    async fn instance_of(
        &self,
        api: &dyn CloudApi,
        worker: &Worker,
    ) -> ProviderResult<Option<Instance>> {
        let (instance_id, zone) = self.zone_of(worker)?;
        let found = match instance_id {
            Some(id) => api.describe_instance(zone, id).await?,
            None => api.find_instance(zone, worker.worker_id.as_str()).await?,
        };
        Ok(found)
    }

    /// Record a requested worker, then create its instance.
    ///
    /// The record is written first. A create that fails after the backend
    /// acted, or a pass cancelled mid-call, still leaves a record the scan
    /// finds by instance name and reaps.
    async fn launch_one(
        &self,
        ctx: &ProviderContext,
        api: &dyn CloudApi,
        pool: &WorkerPool,
        now: DateTime<Utc>,
    ) -> ProviderResult<WorkerKey> {
        let worker_id = WorkerId::parse(&format!("w{}", Ulid::new().to_string().to_lowercase()))
            .map_err(|e| ProviderError::Config(e.to_string()))?;
        let key = WorkerKey::new(pool.worker_pool_id.clone(), self.group.clone(), worker_id);

        let worker = Worker::requested(
            key.clone(),
            self.id.clone(),
            pool.config.capacity_per_instance,
            now + pool.config.lifecycle.registration_timeout(),
            ProviderData::Cloud {
                instance_id: None,
                zone: self.config.zone.clone(),
                image_id: None,
            },
            now,
        )?;
        ctx.registry().create_worker(worker).await?;

        let labels = BTreeMap::from([
            ("worker-pool-id".to_string(), pool.worker_pool_id.to_string()),
            ("worker-group".to_string(), key.worker_group.to_string()),
            ("worker-id".to_string(), key.worker_id.to_string()),
            ("provider-id".to_string(), self.id.to_string()),
        ]);
        let instance = api
            .create_instance(&CreateInstance {
                name: key.worker_id.to_string(),
                zone: self.config.zone.clone(),
                launch: pool.config.launch.clone(),
                labels,
            })
            .await?;

        self.record_instance(ctx, api, &key, &instance).await?;
        Ok(key)
    }

    /// Store the backend's instance id on the worker record.
    async fn record_instance(
        &self,
        ctx: &ProviderContext,
        api: &dyn CloudApi,
        key: &WorkerKey,
        instance: &Instance,
    ) -> ProviderResult<()> {
        let key_str = key.to_string();
        let recorded = retry_on_conflict::<_, ProviderError, _, _>("worker", &key_str, || {
            let registry = ctx.registry().clone();
            let key = key.clone();
            let instance = instance.clone();
            async move {
                let Some(current) = registry.get_worker(&key).await? else {
                    return Ok(false);
                };
                if current.record.state == WorkerState::Stopped {
                    return Ok(false);
                }
                let mut next = current.record.clone();
                next.provider_data = ProviderData::Cloud {
                    instance_id: Some(instance.instance_id),
                    zone: instance.zone,
                    image_id: instance.image_id,
                };
                registry.update_worker(next, current.version).await?;
                Ok(true)
            }
        })
        .await?;

        if !recorded {
            // The worker was reaped while its instance was being created.
            warn!(worker = %key, instance_id = %instance.instance_id, "Worker gone; terminating its instance");
            api.terminate_instance(&instance.zone, &instance.instance_id)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for CloudProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Cloud
    }

    async fn prepare(&self, ctx: &ProviderContext) -> ProviderResult<()> {
        if ctx.cloud_client(&self.id).await.is_some() {
            return Ok(());
        }
        let api = HttpCloudApi::new(&self.config)?;
        ctx.install_cloud_client(self.id.clone(), Arc::new(api))
            .await;
        Ok(())
    }

    async fn provision(
        &self,
        ctx: &ProviderContext,
        pool: &WorkerPool,
        capacity: u64,
        now: DateTime<Utc>,
    ) -> ProviderResult<ProvisionOutcome> {
        let api = self.api(ctx).await?;
        let per_instance = u64::from(pool.config.capacity_per_instance.max(1));
        // Never overshoot: a remainder smaller than one instance is dropped.
        let count = capacity / per_instance;
        let mut outcome = ProvisionOutcome {
            requested: capacity,
            ..Default::default()
        };

        for launched in 0..count {
            match self.launch_one(ctx, api.as_ref(), pool, now).await {
                Ok(key) => {
                    outcome.created.push(key);
                    outcome.created_capacity += per_instance;
                }
                Err(e) => {
                    outcome.failed = count - launched;
                    let error = WorkerPoolError::new(
                        pool.worker_pool_id.clone(),
                        e.error_kind(),
                        "Instance Creation Error",
                        e.to_string(),
                    )
                    .with_extra(json!({
                        "providerId": self.id,
                        "requestedInstances": count,
                        "createdInstances": launched,
                    }));
                    ctx.report_error(pool, error).await;
                    break;
                }
            }
        }

        info!(
            worker_pool_id = %pool.worker_pool_id,
            provider_id = %self.id,
            requested = capacity,
            created = outcome.created.len(),
            failed = outcome.failed,
            "Provisioned instances"
        );
        Ok(outcome)
    }

    async fn register_worker(
        &self,
        ctx: &ProviderContext,
        pool: &WorkerPool,
        worker: &Worker,
        proof: &IdentityProof,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, RegistrationError> {
        let proof: CloudProof = serde_json::from_value(proof.clone()).map_err(|e| {
            RegistrationError::InvalidProof(format!("expected document and signature: {e}"))
        })?;
        let (recorded_id, zone) = self
            .zone_of(worker)
            .map_err(|e| RegistrationError::InvalidProof(e.to_string()))?;

        let api = self.api(ctx).await?;
        let instance_id = match recorded_id {
            Some(id) => id.to_string(),
            None => self
                .instance_of(api.as_ref(), worker)
                .await?
                .map(|instance| instance.instance_id)
                .ok_or_else(|| {
                    RegistrationError::InvalidProof(format!(
                        "no instance exists for worker {}",
                        worker.key()
                    ))
                })?,
        };
        let identity = api
            .verify_attestation(&proof.document, &proof.signature)
            .await
            .map_err(|e| match e {
                CloudApiError::Rejected(msg) => RegistrationError::InvalidProof(msg),
                other => RegistrationError::Provider(other.into()),
            })?;

        if identity.instance_id != instance_id {
            return Err(RegistrationError::InvalidProof(format!(
                "document is for instance {}, not {}",
                identity.instance_id, instance_id
            )));
        }
        if identity.zone != zone {
            return Err(RegistrationError::InvalidProof(format!(
                "document is for zone {}, not {}",
                identity.zone, zone
            )));
        }
        if identity.project != self.config.project {
            return Err(RegistrationError::InvalidProof(format!(
                "document is for project {}",
                identity.project
            )));
        }

        Ok(now + pool.config.lifecycle.reregistration_timeout())
    }

    async fn check_worker(
        &self,
        ctx: &ProviderContext,
        worker: &Worker,
        _now: DateTime<Utc>,
    ) -> ProviderResult<WorkerHealth> {
        let api = self.api(ctx).await?;
        Ok(match self.instance_of(api.as_ref(), worker).await? {
            Some(instance) if instance.status != InstanceStatus::Terminated => WorkerHealth::Alive,
            _ => WorkerHealth::Gone,
        })
    }

    async fn terminate(&self, ctx: &ProviderContext, worker: &Worker) -> ProviderResult<()> {
        let api = self.api(ctx).await?;
        let (instance_id, zone) = self.zone_of(worker)?;
        let instance_id = match instance_id {
            Some(id) => id.to_string(),
            None => match self.instance_of(api.as_ref(), worker).await? {
                Some(instance) => instance.instance_id,
                None => return Ok(()),
            },
        };
        api.terminate_instance(zone, &instance_id).await?;
        Ok(())
    }
}
