use axum::{
    extract::rejection::JsonRejection,
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::credentials::CredentialError;
use crate::providers::{ProviderError, RegistrationError};
use crate::registry::RegistryError;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
    pub retry_after_seconds: u32,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://fleet-wm.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: "unknown".to_string(),
            retryable: false,
            retry_after_seconds: 0,
        }
    }

    fn set_request_id(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.request_id = request_id.clone();
        if self.instance.is_none() {
            self.instance = Some(request_id);
        }
    }

    fn set_retry_after_seconds(&mut self, seconds: u32) {
        self.retry_after_seconds = seconds;
        if seconds > 0 {
            self.retryable = true;
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::UNAUTHORIZED, code, message)
    }

    pub fn forbidden(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::FORBIDDEN, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn bad_gateway(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_GATEWAY, code, message)
    }

    pub fn service_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::SERVICE_UNAVAILABLE, code, message)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.set_request_id(request_id);
        self
    }

    pub fn with_retry_after_seconds(mut self, seconds: u32) -> Self {
        self.problem.set_retry_after_seconds(seconds);
        self
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match &err {
            RegistryError::NotFound { .. } => Self::not_found("not_found", err.to_string()),
            RegistryError::AlreadyExists { .. } => {
                Self::conflict("already_exists", err.to_string())
            }
            RegistryError::Conflict { .. } | RegistryError::Contention { .. } => {
                Self::conflict("conflict", err.to_string()).with_retry_after_seconds(1)
            }
            RegistryError::PoolNotEmpty(_) => Self::conflict("pool_not_empty", err.to_string()),
            RegistryError::Invalid(_) => Self::bad_request("invalid_request", err.to_string()),
            _ => {
                error!(error = %err, "Registry failure");
                Self::internal("internal_error", "registry unavailable")
            }
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Registry(e) => e.into(),
            ProviderError::Transient(_) => {
                Self::service_unavailable("provider_unavailable", err.to_string())
                    .with_retry_after_seconds(5)
            }
            ProviderError::NotPrepared(_) => {
                Self::service_unavailable("provider_unavailable", err.to_string())
            }
            ProviderError::Permanent(_) | ProviderError::Config(_) => {
                Self::bad_gateway("provider_error", err.to_string())
            }
            ProviderError::Model(_) => Self::bad_request("invalid_request", err.to_string()),
            ProviderError::Transition(_) => Self::conflict("conflict", err.to_string()),
        }
    }
}

impl From<RegistrationError> for ApiError {
    fn from(err: RegistrationError) -> Self {
        match err {
            RegistrationError::MissingStaticSecret => {
                Self::bad_request("missing_static_secret", err.to_string())
            }
            RegistrationError::BadStaticSecret => {
                Self::forbidden("bad_static_secret", err.to_string())
            }
            RegistrationError::InvalidProof(_) => {
                Self::forbidden("invalid_identity_proof", err.to_string())
            }
            RegistrationError::WorkerPoolNotFound(_) => {
                Self::not_found("worker_pool_not_found", err.to_string())
            }
            RegistrationError::WorkerNotFound(_) => {
                Self::not_found("worker_not_found", err.to_string())
            }
            RegistrationError::WorkerExpired(_) => {
                Self::conflict("worker_expired", err.to_string())
            }
            RegistrationError::WorkerStopped { .. } => {
                Self::conflict("worker_stopped", err.to_string())
            }
            RegistrationError::ProviderUnavailable(_) => {
                Self::service_unavailable("provider_unavailable", err.to_string())
            }
            RegistrationError::Provider(e) => e.into(),
            RegistrationError::Registry(e) => e.into(),
        }
    }
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Registry(e) => e.into(),
            other => Self::unauthorized("invalid_token", other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request("invalid_request", rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use fleet_model::WorkerState;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::missing_secret(RegistrationError::MissingStaticSecret, StatusCode::BAD_REQUEST, "missing_static_secret")]
    #[case::bad_secret(RegistrationError::BadStaticSecret, StatusCode::FORBIDDEN, "bad_static_secret")]
    #[case::bad_proof(RegistrationError::InvalidProof("sig".into()), StatusCode::FORBIDDEN, "invalid_identity_proof")]
    #[case::no_pool(RegistrationError::WorkerPoolNotFound("foo/bar".into()), StatusCode::NOT_FOUND, "worker_pool_not_found")]
    #[case::no_worker(RegistrationError::WorkerNotFound("foo/bar/g/w".into()), StatusCode::NOT_FOUND, "worker_not_found")]
    #[case::expired(RegistrationError::WorkerExpired("foo/bar/g/w".into()), StatusCode::CONFLICT, "worker_expired")]
    #[case::stopped(
        RegistrationError::WorkerStopped { key: "foo/bar/g/w".into(), state: WorkerState::Stopped },
        StatusCode::CONFLICT,
        "worker_stopped"
    )]
    #[case::provider_gone(RegistrationError::ProviderUnavailable("cloud".into()), StatusCode::SERVICE_UNAVAILABLE, "provider_unavailable")]
    fn test_registration_errors_map_to_codes(
        #[case] error: RegistrationError,
        #[case] status: StatusCode,
        #[case] code: &str,
    ) {
        let detail = error.to_string();
        let err = ApiError::from(error);
        assert_eq!(err.status, status);
        assert_eq!(err.problem.code, code);
        assert_eq!(err.problem.detail, detail);
    }

    #[test]
    fn test_conflicts_are_retryable() {
        let err = ApiError::from(RegistryError::Contention {
            kind: "worker",
            id: "w".to_string(),
            attempts: 5,
        });
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert!(err.problem.retryable);
    }

    #[test]
    fn test_request_id_sets_instance() {
        let err = ApiError::not_found("worker_not_found", "nope").with_request_id("req_1");
        assert_eq!(err.problem.request_id, "req_1");
        assert_eq!(err.problem.instance.as_deref(), Some("req_1"));
    }
}
