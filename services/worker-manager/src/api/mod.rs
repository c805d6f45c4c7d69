//! HTTP API handlers and routing.

pub mod error;
mod health;
pub mod request_context;
mod v1;

use axum::{
    http::{header, HeaderName, HeaderValue, Method, Request},
    Router,
};
use fleet_id::RequestId as RequestUlid;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Stamps requests that arrive without an `x-request-id` with a `req_` id.
#[derive(Clone, Copy, Default)]
struct MakeRequestUlid;

impl MakeRequestId for MakeRequestUlid {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&RequestUlid::new().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(Any);
    let request_id = HeaderName::from_static(request_context::REQUEST_ID_HEADER);

    Router::new()
        .merge(health::routes())
        .nest("/v1", v1::routes())
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUlid))
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::StatusCode;
    use tower::ServiceExt;

    use super::*;
    use crate::notify::LogNotifier;
    use crate::providers::{ProviderContext, Providers};
    use crate::registry::MemoryRegistry;

    fn app() -> Router {
        let ctx = Arc::new(ProviderContext::new(
            Arc::new(MemoryRegistry::new()),
            Arc::new(LogNotifier),
        ));
        create_router(AppState::new(ctx, Arc::new(Providers::new())))
    }

    #[tokio::test]
    async fn test_generates_request_id() {
        let response = app()
            .oneshot(Request::get("/livez").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let id = response.headers()["x-request-id"].to_str().unwrap();
        assert!(id.starts_with("req_"));
    }

    #[tokio::test]
    async fn test_malformed_registration_is_problem_json() {
        let request = Request::post("/v1/worker/register")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-request-id", "req_test")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/problem+json"
        );
        assert_eq!(response.headers()["x-request-id"], "req_test");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let problem: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(problem["code"], "invalid_request");
    }
}
