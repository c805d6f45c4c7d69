//! API v1 routes.

mod worker_pools;
mod workers;

use axum::Router;

use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        // Called by workers: /v1/worker/register, /v1/credentials/self
        .merge(workers::routes())
        // Operator surface: /v1/worker-pools/{provisioner}/{worker_type}/...
        .merge(worker_pools::routes())
}
