//! Compute backend client used by the cloud provider.
//!
//! The backend exposes instances per project and zone, and a verifier for
//! the signed identity documents instances obtain from their metadata
//! service:
//!
//! - `POST   {api}/v1/projects/{project}/zones/{zone}/instances`
//! - `GET    {api}/v1/projects/{project}/zones/{zone}/instances?name={name}`
//! - `GET    {api}/v1/projects/{project}/zones/{zone}/instances/{id}`
//! - `DELETE {api}/v1/projects/{project}/zones/{zone}/instances/{id}`
//! - `POST   {api}/v1/attestations:verify`

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::cloud::CloudProviderConfig;

/// Backend failure, classified by whether retrying later can help.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudApiError {
    /// Throttling, quota, timeouts and server errors.
    #[error("transient: {0}")]
    Transient(String),

    /// Authentication, authorization and missing project or zone.
    #[error("permanent: {0}")]
    Permanent(String),

    /// The attestation document or its signature did not verify.
    #[error("attestation rejected: {0}")]
    Rejected(String),
}

impl CloudApiError {
    fn from_status(status: StatusCode, body: String) -> Self {
        let msg = format!("HTTP {}: {}", status.as_u16(), body);
        match status {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::CONFLICT | StatusCode::REQUEST_TIMEOUT => {
                Self::Transient(msg)
            }
            s if s.is_server_error() => Self::Transient(msg),
            _ => Self::Permanent(msg),
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Transient(err.to_string())
        } else {
            Self::Permanent(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Running,
    Stopping,
    Terminated,
}

/// An instance as the backend reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub instance_id: String,
    pub zone: String,
    #[serde(default)]
    pub image_id: Option<String>,
    pub status: InstanceStatus,
}

/// Instance creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstance {
    pub name: String,
    pub zone: String,
    /// The pool's launch parameters, passed through untouched.
    pub launch: serde_json::Value,
    pub labels: BTreeMap<String, String>,
}

/// Identity the backend vouches for after verifying a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestedIdentity {
    pub instance_id: String,
    pub zone: String,
    pub project: String,
}

#[derive(Debug, Deserialize)]
struct InstanceList {
    #[serde(default)]
    items: Vec<Instance>,
}

/// Compute backend operations.
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn create_instance(&self, request: &CreateInstance) -> Result<Instance, CloudApiError>;

    /// Look an instance up by the name it was created with.
    async fn find_instance(&self, zone: &str, name: &str) -> Result<Option<Instance>, CloudApiError>;

    /// Terminate an instance. Terminating a missing instance succeeds.
    async fn terminate_instance(&self, zone: &str, instance_id: &str) -> Result<(), CloudApiError>;

    /// Returns `None` if the backend has no such instance.
    async fn describe_instance(
        &self,
        zone: &str,
        instance_id: &str,
    ) -> Result<Option<Instance>, CloudApiError>;

    async fn verify_attestation(
        &self,
        document: &str,
        signature: &str,
    ) -> Result<AttestedIdentity, CloudApiError>;
}

/// HTTP client for the compute backend.
pub struct HttpCloudApi {
    http: reqwest::Client,
    base_url: String,
    project: String,
    credentials: Option<String>,
}

impl HttpCloudApi {
    pub fn new(config: &CloudProviderConfig) -> Result<Self, CloudApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| CloudApiError::Permanent(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            project: config.project.clone(),
            credentials: config.credentials.clone(),
        })
    }

    fn instances_url(&self, zone: &str) -> String {
        format!(
            "{}/v1/projects/{}/zones/{}/instances",
            self.base_url, self.project, zone
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, CloudApiError> {
        self.authorize(request)
            .send()
            .await
            .map_err(CloudApiError::from_reqwest)
    }

    async fn fail(response: reqwest::Response) -> CloudApiError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        CloudApiError::from_status(status, body)
    }
}

#[async_trait]
impl CloudApi for HttpCloudApi {
    async fn create_instance(&self, request: &CreateInstance) -> Result<Instance, CloudApiError> {
        let response = self
            .send(self.http.post(self.instances_url(&request.zone)).json(request))
            .await?;
        if !response.status().is_success() {
            return Err(Self::fail(response).await);
        }
        response.json().await.map_err(CloudApiError::from_reqwest)
    }

    async fn find_instance(&self, zone: &str, name: &str) -> Result<Option<Instance>, CloudApiError> {
        let request = self.http.get(self.instances_url(zone)).query(&[("name", name)]);
        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(Self::fail(response).await);
        }
        let list: InstanceList = response.json().await.map_err(CloudApiError::from_reqwest)?;
        Ok(list.items.into_iter().next())
    }

    async fn terminate_instance(&self, zone: &str, instance_id: &str) -> Result<(), CloudApiError> {
        let url = format!("{}/{}", self.instances_url(zone), instance_id);
        let response = self.send(self.http.delete(url)).await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(instance_id, "Instance already gone");
                Ok(())
            }
            _ => Err(Self::fail(response).await),
        }
    }

    async fn describe_instance(
        &self,
        zone: &str,
        instance_id: &str,
    ) -> Result<Option<Instance>, CloudApiError> {
        let url = format!("{}/{}", self.instances_url(zone), instance_id);
        let response = self.send(self.http.get(url)).await?;
        match response.status() {
            s if s.is_success() => response
                .json()
                .await
                .map(Some)
                .map_err(CloudApiError::from_reqwest),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(Self::fail(response).await),
        }
    }

    async fn verify_attestation(
        &self,
        document: &str,
        signature: &str,
    ) -> Result<AttestedIdentity, CloudApiError> {
        let url = format!("{}/v1/attestations:verify", self.base_url);
        let body = serde_json::json!({ "document": document, "signature": signature });
        let response = self.send(self.http.post(url).json(&body)).await?;
        match response.status() {
            s if s.is_success() => response.json().await.map_err(CloudApiError::from_reqwest),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                let body = response.text().await.unwrap_or_default();
                Err(CloudApiError::Rejected(body))
            }
            _ => Err(Self::fail(response).await),
        }
    }
}

#[derive(Default)]
struct FakeState {
    instances: BTreeMap<String, Instance>,
    names: HashMap<String, String>,
    terminated: Vec<String>,
    next_id: u64,
    creates_left: Option<usize>,
    create_error: Option<CloudApiError>,
    describe_error: Option<CloudApiError>,
    attestations: HashMap<(String, String), AttestedIdentity>,
}

/// In-process backend for tests and local development.
#[derive(Default)]
pub struct FakeCloudApi {
    state: Mutex<FakeState>,
}

impl FakeCloudApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Let `n` more creates succeed, then fail every create with `error`.
    pub fn fail_creates_after(&self, n: usize, error: CloudApiError) {
        let mut state = self.state();
        state.creates_left = Some(n);
        state.create_error = Some(error);
    }

    /// Make every describe call fail with `error`.
    pub fn fail_describes(&self, error: CloudApiError) {
        self.state().describe_error = Some(error);
    }

    /// Accept `(document, signature)` as proof of `identity`.
    pub fn add_attestation(&self, document: &str, signature: &str, identity: AttestedIdentity) {
        self.state()
            .attestations
            .insert((document.to_string(), signature.to_string()), identity);
    }

    /// Instances that exist and are not terminated.
    pub fn live_instances(&self) -> Vec<Instance> {
        self.state().instances.values().cloned().collect()
    }

    /// Ids passed to `terminate_instance`, in order.
    pub fn terminated(&self) -> Vec<String> {
        self.state().terminated.clone()
    }

    /// Drop an instance as if it died outside our control.
    pub fn vanish(&self, instance_id: &str) {
        self.state().instances.remove(instance_id);
    }
}

#[async_trait]
impl CloudApi for FakeCloudApi {
    async fn create_instance(&self, request: &CreateInstance) -> Result<Instance, CloudApiError> {
        let mut state = self.state();
        if let Some(left) = state.creates_left.as_mut() {
            if *left == 0 {
                return Err(state
                    .create_error
                    .clone()
                    .unwrap_or_else(|| CloudApiError::Transient("quota exceeded".to_string())));
            }
            *left -= 1;
        }
        state.next_id += 1;
        let instance = Instance {
            instance_id: format!("i-{:06}", state.next_id),
            zone: request.zone.clone(),
            image_id: request
                .launch
                .get("image")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            status: InstanceStatus::Running,
        };
        state
            .instances
            .insert(instance.instance_id.clone(), instance.clone());
        state
            .names
            .insert(request.name.clone(), instance.instance_id.clone());
        Ok(instance)
    }

    async fn find_instance(&self, _zone: &str, name: &str) -> Result<Option<Instance>, CloudApiError> {
        let state = self.state();
        if let Some(err) = &state.describe_error {
            return Err(err.clone());
        }
        Ok(state
            .names
            .get(name)
            .and_then(|id| state.instances.get(id))
            .cloned())
    }

    async fn terminate_instance(&self, _zone: &str, instance_id: &str) -> Result<(), CloudApiError> {
        let mut state = self.state();
        state.instances.remove(instance_id);
        state.terminated.push(instance_id.to_string());
        Ok(())
    }

    async fn describe_instance(
        &self,
        _zone: &str,
        instance_id: &str,
    ) -> Result<Option<Instance>, CloudApiError> {
        let state = self.state();
        if let Some(err) = &state.describe_error {
            return Err(err.clone());
        }
        Ok(state.instances.get(instance_id).cloned())
    }

    async fn verify_attestation(
        &self,
        document: &str,
        signature: &str,
    ) -> Result<AttestedIdentity, CloudApiError> {
        self.state()
            .attestations
            .get(&(document.to_string(), signature.to_string()))
            .cloned()
            .ok_or_else(|| CloudApiError::Rejected("signature does not verify".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(api_url: String) -> CloudProviderConfig {
        CloudProviderConfig {
            api_url,
            project: "proj".to_string(),
            zone: "us-east1-b".to_string(),
            credentials: Some("sekrit".to_string()),
            request_timeout_secs: 5,
        }
    }

    fn create_request() -> CreateInstance {
        CreateInstance {
            name: "w1".to_string(),
            zone: "us-east1-b".to_string(),
            launch: serde_json::json!({"machineType": "small"}),
            labels: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_instance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/proj/zones/us-east1-b/instances"))
            .and(bearer_token("sekrit"))
            .and(body_partial_json(serde_json::json!({"name": "w1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "instanceId": "i-1",
                "zone": "us-east1-b",
                "status": "pending"
            })))
            .mount(&server)
            .await;

        let api = HttpCloudApi::new(&config(server.uri())).unwrap();
        let instance = api.create_instance(&create_request()).await.unwrap();
        assert_eq!(instance.instance_id, "i-1");
        assert_eq!(instance.status, InstanceStatus::Pending);
    }

    #[tokio::test]
    async fn test_error_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;
        let api = HttpCloudApi::new(&config(server.uri())).unwrap();
        let err = api.create_instance(&create_request()).await.unwrap_err();
        assert!(matches!(err, CloudApiError::Transient(_)));

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;
        let api = HttpCloudApi::new(&config(server.uri())).unwrap();
        let err = api.create_instance(&create_request()).await.unwrap_err();
        assert!(matches!(err, CloudApiError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_describe_and_terminate_missing_instance() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let api = HttpCloudApi::new(&config(server.uri())).unwrap();
        assert_eq!(api.describe_instance("us-east1-b", "i-9").await.unwrap(), None);
        api.terminate_instance("us-east1-b", "i-9").await.unwrap();
    }

    #[tokio::test]
    async fn test_find_instance_by_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/projects/proj/zones/us-east1-b/instances"))
            .and(query_param("name", "w1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"instanceId": "i-1", "zone": "us-east1-b", "status": "running"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/projects/proj/zones/us-east1-b/instances"))
            .and(query_param("name", "w2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"items": []})))
            .mount(&server)
            .await;

        let api = HttpCloudApi::new(&config(server.uri())).unwrap();
        let found = api.find_instance("us-east1-b", "w1").await.unwrap().unwrap();
        assert_eq!(found.instance_id, "i-1");
        assert_eq!(api.find_instance("us-east1-b", "w2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_verify_attestation_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/attestations:verify"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad signature"))
            .mount(&server)
            .await;

        let api = HttpCloudApi::new(&config(server.uri())).unwrap();
        let err = api.verify_attestation("doc", "sig").await.unwrap_err();
        assert_eq!(err, CloudApiError::Rejected("bad signature".to_string()));
    }

    #[tokio::test]
    async fn test_fake_create_budget() {
        let fake = FakeCloudApi::new();
        fake.fail_creates_after(1, CloudApiError::Transient("quota".to_string()));
        assert!(fake.create_instance(&create_request()).await.is_ok());
        assert!(fake.create_instance(&create_request()).await.is_err());
        assert_eq!(fake.live_instances().len(), 1);

        let found = fake.find_instance("us-east1-b", "w1").await.unwrap().unwrap();
        assert_eq!(fake.live_instances(), vec![found]);
    }
}
