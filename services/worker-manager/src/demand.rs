//! Pending-demand signal consumed by the provisioning loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_id::WorkerPoolId;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum DemandError {
    #[error("queue request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("queue returned HTTP {0}")]
    Status(u16),
}

/// Source of "how much work is waiting" per pool.
#[async_trait]
pub trait DemandSignal: Send + Sync {
    async fn pending_tasks(&self, pool: &WorkerPoolId) -> Result<u64, DemandError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingResponse {
    pending_tasks: u64,
}

/// Reads pending counts from the task queue over HTTP.
///
/// `GET {base}/v1/pending/{provisioner}/{workerType}` answers
/// `{"pendingTasks": n}`.
#[derive(Clone)]
pub struct QueueDemand {
    http: reqwest::Client,
    base_url: String,
}

impl QueueDemand {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DemandError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl DemandSignal for QueueDemand {
    async fn pending_tasks(&self, pool: &WorkerPoolId) -> Result<u64, DemandError> {
        let url = format!(
            "{}/v1/pending/{}/{}",
            self.base_url,
            pool.provisioner(),
            pool.worker_type()
        );
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(DemandError::Status(response.status().as_u16()));
        }
        let body: PendingResponse = response.json().await?;
        Ok(body.pending_tasks)
    }
}

/// Demand set by hand; pools without an entry have none.
#[derive(Debug, Default, Clone)]
pub struct FixedDemand {
    counts: Arc<RwLock<HashMap<WorkerPoolId, u64>>>,
}

impl FixedDemand {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, pool: WorkerPoolId, pending: u64) {
        self.counts.write().await.insert(pool, pending);
    }
}

#[async_trait]
impl DemandSignal for FixedDemand {
    async fn pending_tasks(&self, pool: &WorkerPoolId) -> Result<u64, DemandError> {
        Ok(self.counts.read().await.get(pool).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_queue_demand_reads_pending_count() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/pending/foo/bar"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "pendingTasks": 7
            })))
            .mount(&server)
            .await;

        let demand = QueueDemand::new(server.uri(), Duration::from_secs(5)).unwrap();
        let pending = demand
            .pending_tasks(&"foo/bar".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(pending, 7);
    }

    #[tokio::test]
    async fn test_queue_demand_surfaces_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let demand = QueueDemand::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = demand
            .pending_tasks(&"foo/bar".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DemandError::Status(503)));
    }

    #[tokio::test]
    async fn test_fixed_demand_defaults_to_zero() {
        let demand = FixedDemand::new();
        let pool: WorkerPoolId = "foo/bar".parse().unwrap();
        assert_eq!(demand.pending_tasks(&pool).await.unwrap(), 0);
        demand.set(pool.clone(), 4).await;
        assert_eq!(demand.pending_tasks(&pool).await.unwrap(), 4);
    }
}
