//! Request-scoped context extracted from HTTP requests.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use fleet_id::RequestId;

use crate::api::error::ApiError;

pub const AUTHORIZATION_HEADER: &str = "Authorization";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    /// Bearer token, if the caller sent one. Never logged.
    pub bearer: Option<String>,
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn bearer_from_authorization_header(
    headers: &HeaderMap,
    request_id: &str,
) -> Result<Option<String>, ApiError> {
    let Some(auth_value) = header_string(headers, AUTHORIZATION_HEADER) else {
        return Ok(None);
    };

    let Some(token) = auth_value.trim().strip_prefix("Bearer ") else {
        return Err(ApiError::unauthorized(
            "invalid_authorization",
            "Authorization must be a Bearer token",
        )
        .with_request_id(request_id.to_string()));
    };

    let token = token.trim();
    if token.is_empty() {
        return Err(ApiError::unauthorized(
            "invalid_authorization",
            "Authorization Bearer token cannot be empty",
        )
        .with_request_id(request_id.to_string()));
    }
    Ok(Some(token.to_string()))
}

impl RequestContext {
    /// The bearer token, or a 401 if none was sent.
    pub fn require_bearer(&self) -> Result<&str, ApiError> {
        self.bearer.as_deref().ok_or_else(|| {
            ApiError::unauthorized("missing_authorization", "a Bearer token is required")
                .with_request_id(self.request_id.clone())
        })
    }

    /// Attach this request's id to an error.
    pub fn error(&self, err: impl Into<ApiError>) -> ApiError {
        err.into().with_request_id(self.request_id.clone())
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = header_string(&parts.headers, REQUEST_ID_HEADER)
            .unwrap_or_else(|| RequestId::new().to_string());
        let bearer = bearer_from_authorization_header(&parts.headers, &request_id)?;
        Ok(Self { request_id, bearer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_from_authorization_header(&headers, "r").unwrap(), None);

        headers.insert("authorization", HeaderValue::from_static("Bearer fwm_wt_abc"));
        assert_eq!(
            bearer_from_authorization_header(&headers, "r").unwrap().as_deref(),
            Some("fwm_wt_abc")
        );

        headers.insert("authorization", HeaderValue::from_static("Basic xyz"));
        assert!(bearer_from_authorization_header(&headers, "r").is_err());

        headers.insert("authorization", HeaderValue::from_static("Bearer   "));
        assert!(bearer_from_authorization_header(&headers, "r").is_err());
    }
}
