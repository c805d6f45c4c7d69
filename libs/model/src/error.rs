//! Error types for record validation and lifecycle transitions.

use thiserror::Error;

use crate::WorkerState;

/// A record failed validation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    /// Pool configuration is inconsistent.
    #[error("invalid worker pool config: {0}")]
    InvalidConfig(String),

    /// The pool's current provider also appears among its previous providers.
    #[error("provider {0} is both current and previous")]
    ProviderInPrevious(String),

    /// Worker capacity must be at least 1.
    #[error("worker capacity must be at least 1, got {0}")]
    InvalidCapacity(u32),

    /// A live worker was created with an expiry that is not in the future.
    #[error("worker expires at {0}, which is not in the future")]
    ExpiresInPast(String),
}

/// An illegal lifecycle transition was attempted.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("illegal worker transition {from} -> {to}")]
pub struct TransitionError {
    pub from: WorkerState,
    pub to: WorkerState,
}
