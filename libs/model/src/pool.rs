//! Worker pool records and configuration.

use chrono::{DateTime, Duration, Utc};
use fleet_id::{ProviderId, WorkerPoolId};
use serde::{Deserialize, Serialize};

use crate::ModelError;

/// Provider id assigned to pools that are being retired.
///
/// A pool with this provider gets no new capacity; once all of its workers
/// have drained, the provisioning loop removes the pool record.
pub const NULL_PROVIDER: &str = "null-provider";

/// Default registration timeout (30 minutes).
pub const DEFAULT_REGISTRATION_TIMEOUT_SECS: u64 = 30 * 60;

/// Default re-registration timeout (4 days).
pub const DEFAULT_REREGISTRATION_TIMEOUT_SECS: u64 = 4 * 24 * 60 * 60;

/// Deadlines governing a worker's lifecycle, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleConfig {
    /// Time a requested worker has to call in before it is reaped.
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout: u64,

    /// Lease granted on each successful registration.
    #[serde(default = "default_reregistration_timeout")]
    pub reregistration_timeout: u64,
}

fn default_registration_timeout() -> u64 {
    DEFAULT_REGISTRATION_TIMEOUT_SECS
}

fn default_reregistration_timeout() -> u64 {
    DEFAULT_REREGISTRATION_TIMEOUT_SECS
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT_SECS,
            reregistration_timeout: DEFAULT_REREGISTRATION_TIMEOUT_SECS,
        }
    }
}

impl LifecycleConfig {
    /// Registration timeout as a chrono duration.
    pub fn registration_timeout(&self) -> Duration {
        Duration::seconds(clamp_secs(self.registration_timeout))
    }

    /// Re-registration lease as a chrono duration.
    pub fn reregistration_timeout(&self) -> Duration {
        Duration::seconds(clamp_secs(self.reregistration_timeout))
    }
}

fn clamp_secs(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX / 1_000)
}

/// Pool configuration: lifecycle deadlines, sizing, and the provider-specific
/// launch block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPoolConfig {
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub min_capacity: u32,

    #[serde(default)]
    pub max_capacity: u32,

    /// Capacity requested per unit of pending demand.
    #[serde(default = "default_scaling_ratio")]
    pub scaling_ratio: f64,

    /// Capacity contributed by each backend instance; also the estimator step.
    #[serde(default = "default_capacity_per_instance")]
    pub capacity_per_instance: u32,

    /// Provider-specific launch parameters (machine type, image, ...).
    #[serde(default)]
    pub launch: serde_json::Value,
}

fn default_scaling_ratio() -> f64 {
    1.0
}

fn default_capacity_per_instance() -> u32 {
    1
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleConfig::default(),
            min_capacity: 0,
            max_capacity: 0,
            scaling_ratio: default_scaling_ratio(),
            capacity_per_instance: default_capacity_per_instance(),
            launch: serde_json::Value::Null,
        }
    }
}

impl WorkerPoolConfig {
    /// Check sizing and lifecycle parameters for consistency.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.min_capacity > self.max_capacity {
            return Err(ModelError::InvalidConfig(format!(
                "minCapacity {} exceeds maxCapacity {}",
                self.min_capacity, self.max_capacity
            )));
        }
        if !self.scaling_ratio.is_finite() || self.scaling_ratio < 0.0 {
            return Err(ModelError::InvalidConfig(format!(
                "scalingRatio must be a non-negative number, got {}",
                self.scaling_ratio
            )));
        }
        if self.capacity_per_instance == 0 {
            return Err(ModelError::InvalidConfig(
                "capacityPerInstance must be at least 1".to_string(),
            ));
        }
        if self.lifecycle.registration_timeout == 0 || self.lifecycle.reregistration_timeout == 0
        {
            return Err(ModelError::InvalidConfig(
                "lifecycle timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPool {
    pub worker_pool_id: WorkerPoolId,
    pub provider_id: ProviderId,

    /// Providers that may still own workers in this pool, oldest first.
    #[serde(default)]
    pub previous_provider_ids: Vec<ProviderId>,

    #[serde(default)]
    pub description: String,

    pub config: WorkerPoolConfig,
    pub owner: String,

    #[serde(default)]
    pub email_on_error: bool,

    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl WorkerPool {
    /// Check the pool's own invariants.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.previous_provider_ids.contains(&self.provider_id) {
            return Err(ModelError::ProviderInPrevious(self.provider_id.to_string()));
        }
        self.config.validate()
    }

    /// Switch the pool to a new provider.
    ///
    /// The old provider is appended to `previous_provider_ids` so its workers
    /// can drain; the new provider is removed from that list if present. The
    /// null provider owns no workers and is never recorded as previous.
    pub fn change_provider(&mut self, provider_id: ProviderId, now: DateTime<Utc>) {
        if provider_id == self.provider_id {
            return;
        }
        let old = std::mem::replace(&mut self.provider_id, provider_id);
        self.previous_provider_ids.retain(|p| p != &self.provider_id);
        if old.as_str() != NULL_PROVIDER && !self.previous_provider_ids.contains(&old) {
            self.previous_provider_ids.push(old);
        }
        self.last_modified = now;
    }

    /// Drop a previous provider once it owns no more workers.
    pub fn forget_previous_provider(&mut self, provider_id: &ProviderId, now: DateTime<Utc>) {
        let before = self.previous_provider_ids.len();
        self.previous_provider_ids.retain(|p| p != provider_id);
        if self.previous_provider_ids.len() != before {
            self.last_modified = now;
        }
    }

    /// Whether the given provider still has a claim on this pool.
    pub fn knows_provider(&self, provider_id: &ProviderId) -> bool {
        &self.provider_id == provider_id || self.previous_provider_ids.contains(provider_id)
    }

    /// Whether this pool is being retired.
    pub fn is_retired(&self) -> bool {
        self.provider_id.as_str() == NULL_PROVIDER
    }
}
