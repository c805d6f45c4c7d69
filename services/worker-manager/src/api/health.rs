//! Health check endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

const SERVICE_NAME: &str = "worker-manager";

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentHealth>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentHealth {
    pub registry: ComponentStatus,
    pub providers: ComponentStatus,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentStatus {
    /// "ok", "degraded", or "unavailable".
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

/// Liveness without dependency checks.
async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: None,
    })
}

/// Readiness: the registry answers and at least one provider is usable.
///
/// Returns 503 when the registry is down. Providers that failed to prepare
/// only degrade the status.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let registry_result = state.registry().health_check().await;
    let registry_ok = registry_result.is_ok();

    let configured = state.providers().ids().count();
    let ready = state.providers().ready_count().await;
    let providers_ok = ready == configured;

    let components = ComponentHealth {
        registry: ComponentStatus {
            status: if registry_ok { "ok" } else { "unavailable" }.to_string(),
            message: registry_result.err().map(|e| e.to_string()),
        },
        providers: ComponentStatus {
            status: if providers_ok { "ok" } else { "degraded" }.to_string(),
            message: (!providers_ok)
                .then(|| format!("{ready} of {configured} providers ready")),
        },
    };

    let response = HealthResponse {
        status: if registry_ok && providers_ok { "ok" } else { "degraded" }.to_string(),
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: Some(components),
    };

    if registry_ok {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
