//! Worker-facing endpoints.
//!
//! Workers call these with their own identity: registration with an
//! identity proof, and a credential self-check with the token it returned.

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use fleet_id::{CredentialId, WorkerGroup, WorkerId, WorkerPoolId};
use serde::Serialize;
use tracing::info;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::registration::{Registered, RegistrationRequest};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/worker/register", post(register_worker))
        .route("/credentials/self", get(current_credential))
}

/// The credential a bearer token resolves to. The token itself is never echoed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialResponse {
    pub credential_id: CredentialId,
    pub worker_pool_id: WorkerPoolId,
    pub worker_group: WorkerGroup,
    pub worker_id: WorkerId,
    pub scopes: Vec<String>,
    pub expires: DateTime<Utc>,
}

async fn register_worker(
    State(state): State<AppState>,
    ctx: RequestContext,
    payload: Result<Json<RegistrationRequest>, JsonRejection>,
) -> Result<Json<Registered>, ApiError> {
    let Json(request) = payload.map_err(|e| ctx.error(e))?;

    match state.registrar().register(&request, Utc::now()).await {
        Ok(registered) => Ok(Json(registered)),
        Err(e) => {
            info!(
                request_id = %ctx.request_id,
                worker = %request.key(),
                error = %e,
                "Registration refused"
            );
            Err(ctx.error(e))
        }
    }
}

async fn current_credential(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Json<CredentialResponse>, ApiError> {
    let token = ctx.require_bearer()?;
    let credential = state
        .registrar()
        .issuer()
        .validate(token, Utc::now())
        .await
        .map_err(|e| ctx.error(e))?;

    Ok(Json(CredentialResponse {
        credential_id: credential.credential_id,
        worker_pool_id: credential.worker_pool_id,
        worker_group: credential.worker_group,
        worker_id: credential.worker_id,
        scopes: credential.scopes,
        expires: credential.expires_at,
    }))
}
