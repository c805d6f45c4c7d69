//! Provider and registration error types.

use fleet_id::ProviderId;
use fleet_model::{ErrorKind, ModelError, TransitionError, WorkerState};
use thiserror::Error;

use super::cloud_api::CloudApiError;
use crate::registry::{ConflictAware, RegistryError};

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Failures of provider operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// `prepare` has not completed for this provider.
    #[error("provider {0} has not been prepared")]
    NotPrepared(ProviderId),

    #[error("invalid provider configuration: {0}")]
    Config(String),

    /// Backend failure expected to clear on its own (throttling, quota, 5xx).
    #[error("backend temporarily unavailable: {0}")]
    Transient(String),

    /// Backend failure that needs an operator (bad credentials, missing project).
    #[error("backend rejected the request: {0}")]
    Permanent(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl ProviderError {
    /// Classification recorded on the pool when this error is reported.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) | Self::Registry(_) => ErrorKind::Transient,
            Self::NotPrepared(_) | Self::Config(_) | Self::Permanent(_) => ErrorKind::Permanent,
            Self::Model(_) | Self::Transition(_) => ErrorKind::InvariantViolation,
        }
    }
}

impl From<CloudApiError> for ProviderError {
    fn from(err: CloudApiError) -> Self {
        match err {
            CloudApiError::Transient(msg) => Self::Transient(msg),
            CloudApiError::Permanent(msg) | CloudApiError::Rejected(msg) => Self::Permanent(msg),
        }
    }
}

impl ConflictAware for ProviderError {
    fn is_conflict(&self) -> bool {
        matches!(self, Self::Registry(e) if e.is_conflict())
    }
}

/// Reasons a registration attempt is refused.
///
/// A refused registration leaves the worker record untouched.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("missing staticSecret")]
    MissingStaticSecret,

    #[error("bad staticSecret")]
    BadStaticSecret,

    #[error("invalid identity proof: {0}")]
    InvalidProof(String),

    #[error("worker pool {0} not found")]
    WorkerPoolNotFound(String),

    #[error("worker {0} not found")]
    WorkerNotFound(String),

    #[error("worker {0} has expired")]
    WorkerExpired(String),

    #[error("worker {key} is {state}")]
    WorkerStopped { key: String, state: WorkerState },

    #[error("provider {0} is not available")]
    ProviderUnavailable(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ConflictAware for RegistrationError {
    fn is_conflict(&self) -> bool {
        match self {
            Self::Registry(e) => e.is_conflict(),
            Self::Provider(e) => e.is_conflict(),
            _ => false,
        }
    }
}
