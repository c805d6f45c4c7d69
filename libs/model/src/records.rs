//! Pool errors, issued credentials, and the versioned record wrapper.

use chrono::{DateTime, Utc};
use fleet_id::{CredentialId, ErrorId, WorkerGroup, WorkerId, WorkerPoolId};
use serde::{Deserialize, Serialize};

use crate::WorkerKey;

/// Classification of a pool error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Backend rejected a request for a reason expected to clear (quota, timeout).
    Transient,
    /// Backend is misconfigured or gone; growth stalls until fixed.
    Permanent,
    /// A requested worker never called in.
    RegistrationTimeout,
    /// A worker was reaped after its lease ran out.
    WorkerExpired,
    /// A record or transition broke an invariant.
    InvariantViolation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::RegistrationTimeout => "registration_timeout",
            Self::WorkerExpired => "worker_expired",
            Self::InvariantViolation => "invariant_violation",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only diagnostic attached to a pool. Never blocks provisioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPoolError {
    pub error_id: ErrorId,
    pub worker_pool_id: WorkerPoolId,
    pub reported_at: DateTime<Utc>,
    pub kind: ErrorKind,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl WorkerPoolError {
    pub fn new(
        worker_pool_id: WorkerPoolId,
        kind: ErrorKind,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            error_id: ErrorId::new(),
            worker_pool_id,
            reported_at: Utc::now(),
            kind,
            title: title.into(),
            description: description.into(),
            extra: serde_json::Value::Null,
        }
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = extra;
        self
    }
}

/// A credential issued to a registered worker. Only the token hash is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCredential {
    pub credential_id: CredentialId,
    pub worker_pool_id: WorkerPoolId,
    pub worker_group: WorkerGroup,
    pub worker_id: WorkerId,
    pub scopes: Vec<String>,
    pub token_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl WorkerCredential {
    pub fn key(&self) -> WorkerKey {
        WorkerKey::new(
            self.worker_pool_id.clone(),
            self.worker_group.clone(),
            self.worker_id.clone(),
        )
    }
}

/// A record together with the version token it was read at.
///
/// Writers hand the version back; the registry rejects the write if the
/// stored version has moved on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: i64,
    pub record: T,
}

/// Version assigned to freshly created records.
pub const INITIAL_VERSION: i64 = 1;

impl<T> Versioned<T> {
    pub fn new(version: i64, record: T) -> Self {
        Self { version, record }
    }
}
