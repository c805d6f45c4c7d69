#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use fleet_id::ProviderId;
use fleet_model::{
    LifecycleConfig, ProviderData, Versioned, Worker, WorkerKey, WorkerPool, WorkerPoolConfig,
};
use fleet_worker_manager::{
    config::parse_providers,
    notify::LogNotifier,
    providers::{CloudApi, FakeCloudApi, ProviderContext, Providers},
    registration::{Registrar, RegistrationRequest},
    registry::{MemoryRegistry, Registry},
};
use serde_json::{json, Value};

pub const ZONE: &str = "us-east1-b";
pub const PROJECT: &str = "proj-ci";

/// `stat` is a static provider, `cloud` runs against an in-process backend.
pub const PROVIDERS: &str = r#"{
    "stat": {"providerType": "static"},
    "cloud": {
        "providerType": "cloud",
        "apiUrl": "http://127.0.0.1:9",
        "project": "proj-ci",
        "zone": "us-east1-b"
    }
}"#;

pub struct Harness {
    pub registry: Arc<MemoryRegistry>,
    pub ctx: Arc<ProviderContext>,
    pub providers: Arc<Providers>,
    pub cloud: Arc<FakeCloudApi>,
}

impl Harness {
    pub async fn new() -> Self {
        let cloud = Arc::new(FakeCloudApi::new());
        Self::with_cloud_client(cloud.clone(), cloud).await
    }

    /// Harness whose cloud provider talks to `client`, which is expected to
    /// front `cloud`.
    pub async fn with_cloud_client(client: Arc<dyn CloudApi>, cloud: Arc<FakeCloudApi>) -> Self {
        let registry = Arc::new(MemoryRegistry::new());
        let ctx = Arc::new(ProviderContext::new(registry.clone(), Arc::new(LogNotifier)));
        ctx.install_cloud_client(pid("cloud"), client).await;

        let providers = Providers::from_config(&parse_providers(PROVIDERS).unwrap()).unwrap();
        assert_eq!(providers.prepare_all(&ctx).await, 2);

        Self {
            registry,
            ctx,
            providers: Arc::new(providers),
            cloud,
        }
    }

    pub fn registrar(&self) -> Registrar {
        Registrar::new(self.ctx.clone(), self.providers.clone())
    }

    pub async fn create_pool(&self, pool: WorkerPool) -> Versioned<WorkerPool> {
        self.registry.create_worker_pool(pool).await.unwrap()
    }

    pub async fn pool(&self) -> Option<Versioned<WorkerPool>> {
        self.registry
            .get_worker_pool(&"foo/bar".parse().unwrap())
            .await
            .unwrap()
    }

    pub async fn worker(&self, key: &WorkerKey) -> Versioned<Worker> {
        self.registry.get_worker(key).await.unwrap().unwrap()
    }
}

pub fn pid(s: &str) -> ProviderId {
    s.parse().unwrap()
}

/// Pool `foo/bar` with a 900s registration timeout and a 3600s lease.
pub fn pool(provider: &str, min_capacity: u32, max_capacity: u32) -> WorkerPool {
    let now = Utc::now();
    WorkerPool {
        worker_pool_id: "foo/bar".parse().unwrap(),
        provider_id: pid(provider),
        previous_provider_ids: vec![],
        description: "test pool".to_string(),
        config: WorkerPoolConfig {
            lifecycle: LifecycleConfig {
                registration_timeout: 900,
                reregistration_timeout: 3600,
            },
            min_capacity,
            max_capacity,
            ..Default::default()
        },
        owner: "owner@example.com".to_string(),
        email_on_error: false,
        created: now,
        last_modified: now,
    }
}

pub fn worker_key(group: &str, id: &str) -> WorkerKey {
    WorkerKey::new(
        "foo/bar".parse().unwrap(),
        group.parse().unwrap(),
        id.parse().unwrap(),
    )
}

/// Static worker `stat/{id}` created at `now`, expiring `expires_in` seconds later.
pub fn static_worker(id: &str, secret: &str, now: DateTime<Utc>, expires_in: i64) -> Worker {
    Worker::requested(
        worker_key("stat", id),
        pid("stat"),
        1,
        now + Duration::seconds(expires_in),
        ProviderData::Static {
            static_secret: secret.to_string(),
        },
        now,
    )
    .unwrap()
}

pub fn request(key: &WorkerKey, proof: Value) -> RegistrationRequest {
    RegistrationRequest {
        worker_pool_id: key.worker_pool_id.clone(),
        worker_group: key.worker_group.clone(),
        worker_id: key.worker_id.clone(),
        worker_identity_proof: proof,
    }
}

pub fn static_proof(secret: &str) -> Value {
    json!({ "staticSecret": secret })
}

pub fn cloud_instance_id(worker: &Worker) -> String {
    match &worker.provider_data {
        ProviderData::Cloud {
            instance_id: Some(instance_id),
            ..
        } => instance_id.clone(),
        other => panic!("not a cloud worker: {other:?}"),
    }
}
