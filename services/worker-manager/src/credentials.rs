//! Worker credential issuance and validation.
//!
//! Token format: `fwm_wt_<32 random bytes base64>`. Only the SHA-256 hash
//! of a token is stored; the plaintext is handed to the worker exactly once,
//! in the registration response.
//!
//! A credential never outlives the worker expiry it was issued against.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use fleet_id::CredentialId;
use fleet_model::{WorkerCredential, WorkerKey};
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::registry::{Registry, RegistryError};

/// Prefix of every worker token.
pub const WORKER_TOKEN_PREFIX: &str = "fwm_wt_";

/// Token bytes (32 bytes = 256 bits of entropy).
const TOKEN_BYTES: usize = 32;

/// Generate a new worker token.
pub fn generate_worker_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    format!("{}{}", WORKER_TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a token for storage using SHA-256, as lowercase hex.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Scopes granted to a registered worker.
///
/// They allow re-registering as the same worker and claiming work from the
/// worker's own pool, nothing else.
pub fn worker_scopes(key: &WorkerKey) -> Vec<String> {
    vec![
        format!("worker-manager:reregister-worker:{}", key),
        format!("queue:claim-work:{}", key.worker_pool_id),
        format!(
            "queue:worker-id:{}/{}",
            key.worker_group, key.worker_id
        ),
    ]
}

/// Credentials handed to a worker at registration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCredentials {
    pub credential_id: CredentialId,
    pub access_token: String,
    pub scopes: Vec<String>,
    pub expires: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("malformed worker token")]
    Malformed,

    #[error("unknown worker token")]
    Unknown,

    #[error("worker token expired at {0}")]
    Expired(DateTime<Utc>),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Issues and validates worker credentials.
#[derive(Clone)]
pub struct CredentialIssuer {
    registry: Arc<dyn Registry>,
}

impl CredentialIssuer {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }

    /// Mint a credential for `key` that expires exactly at `expires`.
    pub async fn issue(
        &self,
        key: &WorkerKey,
        expires: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<IssuedCredentials, RegistryError> {
        let token = generate_worker_token();
        let credential = WorkerCredential {
            credential_id: CredentialId::new(),
            worker_pool_id: key.worker_pool_id.clone(),
            worker_group: key.worker_group.clone(),
            worker_id: key.worker_id.clone(),
            scopes: worker_scopes(key),
            token_hash: hash_token(&token),
            issued_at: now,
            expires_at: expires,
        };
        let issued = IssuedCredentials {
            credential_id: credential.credential_id,
            access_token: token,
            scopes: credential.scopes.clone(),
            expires,
        };
        self.registry.insert_credential(credential).await?;
        Ok(issued)
    }

    /// Resolve a presented token to the credential it was issued as.
    pub async fn validate(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<WorkerCredential, CredentialError> {
        if !token.starts_with(WORKER_TOKEN_PREFIX) {
            return Err(CredentialError::Malformed);
        }
        let credential = self
            .registry
            .find_credential(&hash_token(token))
            .await?
            .ok_or(CredentialError::Unknown)?;
        if credential.expires_at <= now {
            return Err(CredentialError::Expired(credential.expires_at));
        }
        Ok(credential)
    }
}
