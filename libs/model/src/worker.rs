//! Worker records and the worker lifecycle state machine.

use chrono::{DateTime, Utc};
use fleet_id::{ProviderId, WorkerGroup, WorkerId, WorkerPoolId};
use serde::{Deserialize, Serialize};

use crate::{LifecycleConfig, ModelError, TransitionError};

/// Worker lifecycle state.
///
/// ```text
/// requested ──register──▶ running ──register──▶ running
///     │                      │
///     ├──────────┬───────────┘
///     ▼          ▼
///  stopping ──▶ stopped
/// ```
///
/// `requested` and `running` may also go straight to `stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Requested,
    Running,
    Stopping,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(Self::Requested),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// `running -> running` (re-registration) is legal; every other
    /// self-transition is not.
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Requested, Running)
                | (Running, Running)
                | (Requested, Stopping)
                | (Running, Stopping)
                | (Requested, Stopped)
                | (Running, Stopped)
                | (Stopping, Stopped)
        )
    }

    /// Workers in these states count toward a pool's existing capacity.
    pub fn counts_toward_capacity(&self) -> bool {
        matches!(self, Self::Requested | Self::Running)
    }

    /// Workers that still hold (or may hold) backend resources.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity tuple of a worker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerKey {
    pub worker_pool_id: WorkerPoolId,
    pub worker_group: WorkerGroup,
    pub worker_id: WorkerId,
}

impl WorkerKey {
    pub fn new(worker_pool_id: WorkerPoolId, worker_group: WorkerGroup, worker_id: WorkerId) -> Self {
        Self {
            worker_pool_id,
            worker_group,
            worker_id,
        }
    }
}

impl std::fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.worker_pool_id, self.worker_group, self.worker_id
        )
    }
}

/// Provider-owned data stored on a worker, one shape per provider kind.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderData {
    /// Manually managed worker that proves itself with a shared secret.
    Static {
        #[serde(rename = "staticSecret")]
        static_secret: String,
    },

    /// Cloud instance created by the provider.
    ///
    /// The record is written before the instance exists, so `instance_id`
    /// is unset until the backend assigns one. The instance is named after
    /// the worker id and can always be found by that name.
    Cloud {
        #[serde(rename = "instanceId", default, skip_serializing_if = "Option::is_none")]
        instance_id: Option<String>,
        zone: String,
        #[serde(rename = "imageId", default, skip_serializing_if = "Option::is_none")]
        image_id: Option<String>,
    },
}

// Secrets never reach logs.
impl std::fmt::Debug for ProviderData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static { .. } => f
                .debug_struct("Static")
                .field("static_secret", &"<redacted>")
                .finish(),
            Self::Cloud {
                instance_id,
                zone,
                image_id,
            } => f
                .debug_struct("Cloud")
                .field("instance_id", instance_id)
                .field("zone", zone)
                .field("image_id", image_id)
                .finish(),
        }
    }
}

/// A worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub worker_pool_id: WorkerPoolId,
    pub worker_group: WorkerGroup,
    pub worker_id: WorkerId,

    /// Provider that created this worker; fixed for its lifetime.
    pub provider_id: ProviderId,

    pub state: WorkerState,
    pub capacity: u32,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub last_checked: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub provider_data: ProviderData,
}

impl Worker {
    /// Build a new worker in the `requested` state.
    pub fn requested(
        key: WorkerKey,
        provider_id: ProviderId,
        capacity: u32,
        expires: DateTime<Utc>,
        provider_data: ProviderData,
        now: DateTime<Utc>,
    ) -> Result<Self, ModelError> {
        if capacity == 0 {
            return Err(ModelError::InvalidCapacity(capacity));
        }
        if expires <= now {
            return Err(ModelError::ExpiresInPast(expires.to_rfc3339()));
        }
        Ok(Self {
            worker_pool_id: key.worker_pool_id,
            worker_group: key.worker_group,
            worker_id: key.worker_id,
            provider_id,
            state: WorkerState::Requested,
            capacity,
            created: now,
            last_modified: now,
            last_checked: now,
            expires,
            provider_data,
        })
    }

    pub fn key(&self) -> WorkerKey {
        WorkerKey {
            worker_pool_id: self.worker_pool_id.clone(),
            worker_group: self.worker_group.clone(),
            worker_id: self.worker_id.clone(),
        }
    }

    /// Move the worker to `next`, stamping `last_modified`.
    pub fn transition(
        &mut self,
        next: WorkerState,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.last_modified = now;
        Ok(())
    }

    /// Mark the worker running with a fresh lease.
    pub fn mark_registered(
        &mut self,
        expires: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(WorkerState::Running, now)?;
        self.expires = expires;
        self.last_checked = now;
        Ok(())
    }

    /// A worker past its expiry is logically dead, whatever its state.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires <= now
    }

    /// Deadline by which a requested worker must register.
    pub fn registration_deadline(&self, lifecycle: &LifecycleConfig) -> DateTime<Utc> {
        self.created + lifecycle.registration_timeout()
    }

    /// Capacity this worker contributes to its pool right now.
    pub fn effective_capacity(&self, now: DateTime<Utc>) -> u32 {
        if self.state.counts_toward_capacity() && !self.is_expired(now) {
            self.capacity
        } else {
            0
        }
    }
}
