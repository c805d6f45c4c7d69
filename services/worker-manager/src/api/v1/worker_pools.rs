//! Worker pool endpoints.
//!
//! Pools are addressed as `/v1/worker-pools/{provisioner}/{worker_type}`.
//! Deleting a pool only retires it: the pool moves to the null provider and
//! the provisioning loop removes the record once its workers have drained.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use fleet_id::{ProviderId, WorkerGroup, WorkerId, WorkerPoolId};
use fleet_model::{
    Versioned, Worker, WorkerKey, WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerState,
    NULL_PROVIDER,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::providers::{create_static_worker, ProviderKind, StaticWorkerSpec};
use crate::registry::{retry_on_conflict, RegistryError};
use crate::state::AppState;

const POOL_PATH: &str = "/worker-pools/{provisioner}/{worker_type}";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/worker-pools", get(list_worker_pools))
        .route(
            POOL_PATH,
            get(get_worker_pool)
                .put(put_worker_pool)
                .delete(retire_worker_pool),
        )
        .route(&format!("{POOL_PATH}/workers"), get(list_workers))
        .route(
            &format!("{POOL_PATH}/workers/{{worker_group}}/{{worker_id}}"),
            get(get_worker).put(create_worker).delete(remove_worker),
        )
        .route(&format!("{POOL_PATH}/errors"), get(list_errors))
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Create or update a pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPoolRequest {
    pub provider_id: ProviderId,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub config: WorkerPoolConfig,

    pub owner: String,

    #[serde(default)]
    pub email_on_error: bool,
}

impl WorkerPoolRequest {
    fn apply(self, pool: &mut WorkerPool, now: DateTime<Utc>) {
        pool.change_provider(self.provider_id, now);
        pool.description = self.description;
        pool.config = self.config;
        pool.owner = self.owner;
        pool.email_on_error = self.email_on_error;
        pool.last_modified = now;
    }

    fn into_pool(self, worker_pool_id: WorkerPoolId, now: DateTime<Utc>) -> WorkerPool {
        WorkerPool {
            worker_pool_id,
            provider_id: self.provider_id,
            previous_provider_ids: Vec::new(),
            description: self.description,
            config: self.config,
            owner: self.owner,
            email_on_error: self.email_on_error,
            created: now,
            last_modified: now,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPoolResponse {
    #[serde(flatten)]
    pub pool: WorkerPool,

    /// Record version; changes on every write.
    pub version: i64,
}

impl From<Versioned<WorkerPool>> for WorkerPoolResponse {
    fn from(v: Versioned<WorkerPool>) -> Self {
        Self {
            pool: v.record,
            version: v.version,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
}

/// A worker as shown to operators. Provider secrets are left out.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResponse {
    pub worker_pool_id: WorkerPoolId,
    pub worker_group: WorkerGroup,
    pub worker_id: WorkerId,
    pub provider_id: ProviderId,
    pub state: WorkerState,
    pub capacity: u32,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub last_checked: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub version: i64,
}

impl From<Versioned<Worker>> for WorkerResponse {
    fn from(v: Versioned<Worker>) -> Self {
        let w = v.record;
        Self {
            worker_pool_id: w.worker_pool_id,
            worker_group: w.worker_group,
            worker_id: w.worker_id,
            provider_id: w.provider_id,
            state: w.state,
            capacity: w.capacity,
            created: w.created,
            last_modified: w.last_modified,
            last_checked: w.last_checked,
            expires: w.expires,
            version: v.version,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListWorkersQuery {
    #[serde(default)]
    pub state: Option<String>,
}

// =============================================================================
// Helpers
// =============================================================================

fn pool_id(ctx: &RequestContext, provisioner: &str, worker_type: &str) -> Result<WorkerPoolId, ApiError> {
    WorkerPoolId::new(provisioner, worker_type)
        .map_err(|e| ctx.error(ApiError::bad_request("invalid_worker_pool_id", e.to_string())))
}

fn worker_key(
    ctx: &RequestContext,
    pool: WorkerPoolId,
    group: &str,
    id: &str,
) -> Result<WorkerKey, ApiError> {
    let group = WorkerGroup::parse(group)
        .map_err(|e| ctx.error(ApiError::bad_request("invalid_worker_group", e.to_string())))?;
    let id = WorkerId::parse(id)
        .map_err(|e| ctx.error(ApiError::bad_request("invalid_worker_id", e.to_string())))?;
    Ok(WorkerKey::new(pool, group, id))
}

async fn load_pool(
    state: &AppState,
    ctx: &RequestContext,
    id: &WorkerPoolId,
) -> Result<Versioned<WorkerPool>, ApiError> {
    state
        .registry()
        .get_worker_pool(id)
        .await
        .map_err(|e| ctx.error(e))?
        .ok_or_else(|| {
            ctx.error(ApiError::not_found(
                "worker_pool_not_found",
                format!("worker pool {id} not found"),
            ))
        })
}

async fn load_worker(
    state: &AppState,
    ctx: &RequestContext,
    key: &WorkerKey,
) -> Result<Versioned<Worker>, ApiError> {
    state
        .registry()
        .get_worker(key)
        .await
        .map_err(|e| ctx.error(e))?
        .ok_or_else(|| {
            ctx.error(ApiError::not_found(
                "worker_not_found",
                format!("worker {key} not found"),
            ))
        })
}

// =============================================================================
// Pools
// =============================================================================

async fn list_worker_pools(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Json<ListResponse<WorkerPoolResponse>>, ApiError> {
    let pools = state
        .registry()
        .list_worker_pools()
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse {
        items: pools.into_iter().map(Into::into).collect(),
    }))
}

async fn get_worker_pool(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((provisioner, worker_type)): Path<(String, String)>,
) -> Result<Json<WorkerPoolResponse>, ApiError> {
    let id = pool_id(&ctx, &provisioner, &worker_type)?;
    Ok(Json(load_pool(&state, &ctx, &id).await?.into()))
}

/// Create the pool, or update it in place.
///
/// A provider change keeps the old provider on the pool's previous list
/// until its workers are gone.
async fn put_worker_pool(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((provisioner, worker_type)): Path<(String, String)>,
    payload: Result<Json<WorkerPoolRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let id = pool_id(&ctx, &provisioner, &worker_type)?;
    let Json(request) = payload.map_err(|e| ctx.error(e))?;

    if request.provider_id.as_str() != NULL_PROVIDER
        && state.providers().configured(&request.provider_id).is_none()
    {
        return Err(ctx.error(ApiError::bad_request(
            "unknown_provider",
            format!("provider {} is not configured", request.provider_id),
        )));
    }

    let registry = state.registry().clone();
    let now = Utc::now();
    let id_str = id.to_string();
    let (status, stored) = retry_on_conflict::<_, RegistryError, _, _>(
        "worker pool",
        &id_str,
        || {
            let registry = registry.clone();
            let id = id.clone();
            let request = request.clone();
            async move {
                match registry.get_worker_pool(&id).await? {
                    None => {
                        let pool = request.into_pool(id, now);
                        pool.validate()?;
                        Ok((StatusCode::CREATED, registry.create_worker_pool(pool).await?))
                    }
                    Some(current) => {
                        let mut pool = current.record;
                        request.apply(&mut pool, now);
                        pool.validate()?;
                        let stored = registry.update_worker_pool(pool, current.version).await?;
                        Ok((StatusCode::OK, stored))
                    }
                }
            }
        },
    )
    .await
    .map_err(|e| ctx.error(e))?;

    info!(
        request_id = %ctx.request_id,
        worker_pool_id = %id,
        provider_id = %stored.record.provider_id,
        version = stored.version,
        "Worker pool saved"
    );
    Ok((status, Json(WorkerPoolResponse::from(stored))))
}

/// Retire the pool. Its workers drain and the record disappears afterwards.
async fn retire_worker_pool(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((provisioner, worker_type)): Path<(String, String)>,
) -> Result<Json<WorkerPoolResponse>, ApiError> {
    let id = pool_id(&ctx, &provisioner, &worker_type)?;
    let null_provider = ProviderId::parse(NULL_PROVIDER)
        .map_err(|e| ctx.error(ApiError::internal("internal_error", e.to_string())))?;

    let registry = state.registry().clone();
    let now = Utc::now();
    let id_str = id.to_string();
    let stored = retry_on_conflict::<_, RegistryError, _, _>("worker pool", &id_str, || {
        let registry = registry.clone();
        let id = id.clone();
        let null_provider = null_provider.clone();
        async move {
            let current = registry
                .get_worker_pool(&id)
                .await?
                .ok_or_else(|| RegistryError::not_found("worker pool", &id))?;
            if current.record.is_retired() {
                return Ok(current);
            }
            let mut pool = current.record;
            pool.change_provider(null_provider, now);
            registry.update_worker_pool(pool, current.version).await
        }
    })
    .await
    .map_err(|e| {
        if e.is_not_found() {
            ctx.error(ApiError::not_found(
                "worker_pool_not_found",
                format!("worker pool {id} not found"),
            ))
        } else {
            ctx.error(e)
        }
    })?;

    info!(request_id = %ctx.request_id, worker_pool_id = %id, "Worker pool retired");
    Ok(Json(stored.into()))
}

async fn list_errors(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((provisioner, worker_type)): Path<(String, String)>,
) -> Result<Json<ListResponse<WorkerPoolError>>, ApiError> {
    let id = pool_id(&ctx, &provisioner, &worker_type)?;
    load_pool(&state, &ctx, &id).await?;
    let errors = state
        .registry()
        .list_errors(&id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse { items: errors }))
}

// =============================================================================
// Workers
// =============================================================================

async fn list_workers(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((provisioner, worker_type)): Path<(String, String)>,
    Query(query): Query<ListWorkersQuery>,
) -> Result<Json<ListResponse<WorkerResponse>>, ApiError> {
    let id = pool_id(&ctx, &provisioner, &worker_type)?;
    let states = match query.state.as_deref() {
        None => Vec::new(),
        Some(s) => vec![WorkerState::parse(s).ok_or_else(|| {
            ctx.error(ApiError::bad_request(
                "invalid_state",
                format!("unknown worker state {s:?}"),
            ))
        })?],
    };
    load_pool(&state, &ctx, &id).await?;
    let workers = state
        .registry()
        .list_workers(&id, &states)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse {
        items: workers.into_iter().map(Into::into).collect(),
    }))
}

async fn get_worker(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((provisioner, worker_type, group, worker_id)): Path<(String, String, String, String)>,
) -> Result<Json<WorkerResponse>, ApiError> {
    let key = worker_key(&ctx, pool_id(&ctx, &provisioner, &worker_type)?, &group, &worker_id)?;
    Ok(Json(load_worker(&state, &ctx, &key).await?.into()))
}

/// Record a static worker. Only pools on a static provider accept these.
async fn create_worker(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((provisioner, worker_type, group, worker_id)): Path<(String, String, String, String)>,
    payload: Result<Json<StaticWorkerSpec>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let key = worker_key(&ctx, pool_id(&ctx, &provisioner, &worker_type)?, &group, &worker_id)?;
    let Json(spec) = payload.map_err(|e| ctx.error(e))?;
    let pool = load_pool(&state, &ctx, &key.worker_pool_id).await?;

    let provider = state.providers().configured(&pool.record.provider_id);
    if !matches!(provider.map(|p| p.kind()), Some(ProviderKind::Static)) {
        return Err(ctx.error(ApiError::bad_request(
            "unsupported_provider",
            format!(
                "workers can only be created directly in pools with a static provider, not {}",
                pool.record.provider_id
            ),
        )));
    }

    let stored = create_static_worker(
        state.ctx(),
        &pool.record,
        key.worker_group.clone(),
        key.worker_id.clone(),
        spec,
        Utc::now(),
    )
    .await
    .map_err(|e| ctx.error(e))?;

    info!(request_id = %ctx.request_id, worker = %key, "Static worker created");
    Ok((StatusCode::CREATED, Json(WorkerResponse::from(stored))))
}

/// Stop a worker and release its backend resources.
async fn remove_worker(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((provisioner, worker_type, group, worker_id)): Path<(String, String, String, String)>,
) -> Result<Json<WorkerResponse>, ApiError> {
    let key = worker_key(&ctx, pool_id(&ctx, &provisioner, &worker_type)?, &group, &worker_id)?;
    let worker = load_worker(&state, &ctx, &key).await?;

    let provider_id = &worker.record.provider_id;
    let provider = state.providers().get(provider_id).await.ok_or_else(|| {
        ctx.error(ApiError::service_unavailable(
            "provider_unavailable",
            format!("provider {provider_id} is not available"),
        ))
    })?;

    let removed = provider
        .remove_worker(state.ctx(), &worker, Utc::now())
        .await
        .map_err(|e| ctx.error(e))?;
    if removed {
        info!(request_id = %ctx.request_id, worker = %key, "Worker removal requested");
    }

    Ok(Json(load_worker(&state, &ctx, &key).await?.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_request_defaults() {
        let req: WorkerPoolRequest = serde_json::from_str(
            r#"{"providerId": "stat", "owner": "me@example.com"}"#,
        )
        .unwrap();
        assert_eq!(req.provider_id.as_str(), "stat");
        assert!(!req.email_on_error);
        assert_eq!(req.config, WorkerPoolConfig::default());
    }

    #[test]
    fn test_worker_response_omits_provider_data() {
        let now = Utc::now();
        let worker = Worker::requested(
            WorkerKey::new(
                "foo/bar".parse().unwrap(),
                "stat".parse().unwrap(),
                "abc123".parse().unwrap(),
            ),
            "stat".parse().unwrap(),
            1,
            now + chrono::Duration::seconds(90),
            fleet_model::ProviderData::Static {
                static_secret: "good".to_string(),
            },
            now,
        )
        .unwrap();
        let json =
            serde_json::to_string(&WorkerResponse::from(Versioned::new(1, worker))).unwrap();
        assert!(json.contains("\"workerId\":\"abc123\""));
        assert!(!json.contains("good"));
    }
}
