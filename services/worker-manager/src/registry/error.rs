//! Registry error types.

use fleet_model::ModelError;
use thiserror::Error;

/// Registry operation errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The record does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// A record with this identity already exists.
    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },

    /// The stored version moved on since the caller read the record.
    #[error("version conflict on {kind} {id}: expected {expected}, found {actual}")]
    Conflict {
        kind: &'static str,
        id: String,
        expected: i64,
        actual: i64,
    },

    /// Every retry of a read-modify-write lost the race.
    #[error("gave up on {kind} {id} after {attempts} conflicting writes")]
    Contention {
        kind: &'static str,
        id: String,
        attempts: u32,
    },

    /// A pool cannot be deleted while it still owns live workers.
    #[error("worker pool {0} still owns live workers")]
    PoolNotEmpty(String),

    /// The record breaks a model invariant.
    #[error("invalid record: {0}")]
    Invalid(#[from] ModelError),

    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}. Run from repo root or services/worker-manager.")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RegistryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn already_exists(kind: &'static str, id: impl ToString) -> Self {
        Self::AlreadyExists {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn conflict(kind: &'static str, id: impl ToString, expected: i64, actual: i64) -> Self {
        Self::Conflict {
            kind,
            id: id.to_string(),
            expected,
            actual,
        }
    }
}

/// Errors that may wrap a version conflict worth retrying.
pub trait ConflictAware {
    fn is_conflict(&self) -> bool;
}

impl ConflictAware for RegistryError {
    fn is_conflict(&self) -> bool {
        RegistryError::is_conflict(self)
    }
}
