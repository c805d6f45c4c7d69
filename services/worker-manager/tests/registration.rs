//! Worker registration against the in-memory registry.

mod common;

use chrono::{Duration, Utc};
use fleet_model::WorkerState;
use fleet_worker_manager::credentials::{hash_token, CredentialError};
use fleet_worker_manager::providers::{AttestedIdentity, Provider, RegistrationError};
use fleet_worker_manager::registry::Registry;
use serde_json::json;

use common::*;

#[tokio::test]
async fn static_worker_registers_with_good_secret() {
    let h = Harness::new().await;
    let now = Utc::now();
    h.create_pool(pool("stat", 0, 0)).await;
    h.registry
        .create_worker(static_worker("abc123", "good", now, 90))
        .await
        .unwrap();
    let key = worker_key("stat", "abc123");

    let registered = h
        .registrar()
        .register(&request(&key, static_proof("good")), now)
        .await
        .unwrap();

    let expected = now + Duration::seconds(3600);
    assert!((registered.expires - expected).num_seconds().abs() <= 10);
    assert_eq!(registered.credentials.expires, registered.expires);
    assert!(registered
        .credentials
        .scopes
        .contains(&"worker-manager:reregister-worker:foo/bar/stat/abc123".to_string()));

    let stored = h.worker(&key).await;
    assert_eq!(stored.record.state, WorkerState::Running);
    assert_eq!(stored.record.expires, registered.expires);

    // Only the hash of the token is kept.
    let credential = h
        .registry
        .find_credential(&hash_token(&registered.credentials.access_token))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(credential.key(), key);
    assert_eq!(credential.expires_at, registered.expires);
}

#[tokio::test]
async fn refused_registrations_leave_the_worker_untouched() {
    let h = Harness::new().await;
    let now = Utc::now();
    h.create_pool(pool("stat", 0, 0)).await;
    let created = h
        .registry
        .create_worker(static_worker("abc123", "good", now, 90))
        .await
        .unwrap();
    let key = worker_key("stat", "abc123");
    let registrar = h.registrar();

    let err = registrar
        .register(&request(&key, json!({})), now)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistrationError::MissingStaticSecret));
    assert_eq!(err.to_string(), "missing staticSecret");

    let err = registrar
        .register(&request(&key, static_proof("bad")), now)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistrationError::BadStaticSecret));
    assert_eq!(err.to_string(), "bad staticSecret");

    let stored = h.worker(&key).await;
    assert_eq!(stored, created);
    assert_eq!(stored.record.state, WorkerState::Requested);
}

#[tokio::test]
async fn unknown_worker_and_pool_are_not_found() {
    let h = Harness::new().await;
    let now = Utc::now();
    let key = worker_key("stat", "abc123");

    let err = h
        .registrar()
        .register(&request(&key, static_proof("good")), now)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistrationError::WorkerPoolNotFound(_)));

    h.create_pool(pool("stat", 0, 0)).await;
    let err = h
        .registrar()
        .register(&request(&key, static_proof("good")), now)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistrationError::WorkerNotFound(_)));
}

#[tokio::test]
async fn reregistration_extends_the_lease_and_issues_new_credentials() {
    let h = Harness::new().await;
    let now = Utc::now();
    h.create_pool(pool("stat", 0, 0)).await;
    h.registry
        .create_worker(static_worker("abc123", "good", now, 90))
        .await
        .unwrap();
    let key = worker_key("stat", "abc123");
    let registrar = h.registrar();

    let first = registrar
        .register(&request(&key, static_proof("good")), now)
        .await
        .unwrap();
    let later = now + Duration::seconds(600);
    let second = registrar
        .register(&request(&key, static_proof("good")), later)
        .await
        .unwrap();

    assert!(second.expires > first.expires);
    assert_ne!(
        second.credentials.access_token,
        first.credentials.access_token
    );
    let stored = h.worker(&key).await;
    assert_eq!(stored.record.state, WorkerState::Running);
    assert_eq!(stored.record.expires, second.expires);
}

#[tokio::test]
async fn reregistration_grants_exactly_the_current_lease() {
    let h = Harness::new().await;
    let now = Utc::now();
    h.create_pool(pool("stat", 0, 0)).await;
    h.registry
        .create_worker(static_worker("abc123", "good", now, 90))
        .await
        .unwrap();
    let key = worker_key("stat", "abc123");
    let registrar = h.registrar();

    let first = registrar
        .register(&request(&key, static_proof("good")), now)
        .await
        .unwrap();
    assert_eq!(first.expires, now + Duration::seconds(3600));

    // Operator shortens the lease while the worker runs.
    let current = h.pool().await.unwrap();
    let mut next = current.record.clone();
    next.config.lifecycle.reregistration_timeout = 60;
    h.registry
        .update_worker_pool(next, current.version)
        .await
        .unwrap();

    let later = now + Duration::seconds(10);
    let second = registrar
        .register(&request(&key, static_proof("good")), later)
        .await
        .unwrap();

    assert_eq!(second.expires, later + Duration::seconds(60));
    assert_eq!(second.credentials.expires, second.expires);
    assert_eq!(h.worker(&key).await.record.expires, second.expires);

    let credential = h
        .registry
        .find_credential(&hash_token(&second.credentials.access_token))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(credential.expires_at, later + Duration::seconds(60));
}

#[tokio::test]
async fn expired_and_stopped_workers_cannot_register() {
    let h = Harness::new().await;
    let now = Utc::now();
    h.create_pool(pool("stat", 0, 0)).await;
    h.registry
        .create_worker(static_worker("abc123", "good", now, 90))
        .await
        .unwrap();
    let key = worker_key("stat", "abc123");

    let err = h
        .registrar()
        .register(
            &request(&key, static_proof("good")),
            now + Duration::seconds(91),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RegistrationError::WorkerExpired(_)));

    let provider = h.providers.get(&pid("stat")).await.unwrap();
    let current = h.worker(&key).await;
    assert!(provider.remove_worker(&h.ctx, &current, now).await.unwrap());

    let err = h
        .registrar()
        .register(&request(&key, static_proof("good")), now)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegistrationError::WorkerStopped {
            state: WorkerState::Stopping,
            ..
        }
    ));
}

#[tokio::test]
async fn credentials_validate_until_the_worker_expires() {
    let h = Harness::new().await;
    let now = Utc::now();
    h.create_pool(pool("stat", 0, 0)).await;
    h.registry
        .create_worker(static_worker("abc123", "good", now, 90))
        .await
        .unwrap();
    let key = worker_key("stat", "abc123");
    let registrar = h.registrar();

    let registered = registrar
        .register(&request(&key, static_proof("good")), now)
        .await
        .unwrap();
    let token = &registered.credentials.access_token;

    let credential = registrar.issuer().validate(token, now).await.unwrap();
    assert_eq!(credential.key(), key);

    let err = registrar
        .issuer()
        .validate(token, registered.expires)
        .await
        .unwrap_err();
    assert!(matches!(err, CredentialError::Expired(_)));
}

#[tokio::test]
async fn workers_of_a_previous_provider_can_still_register() {
    let h = Harness::new().await;
    let now = Utc::now();
    let mut p = pool("stat", 0, 0);
    p.change_provider(pid("cloud"), now);
    h.create_pool(p).await;
    h.registry
        .create_worker(static_worker("abc123", "good", now, 90))
        .await
        .unwrap();
    let key = worker_key("stat", "abc123");

    h.registrar()
        .register(&request(&key, static_proof("good")), now)
        .await
        .unwrap();

    // Once the pool forgets the provider, its workers are orphaned.
    let current = h.pool().await.unwrap();
    let mut next = current.record.clone();
    next.forget_previous_provider(&pid("stat"), now);
    h.registry
        .update_worker_pool(next, current.version)
        .await
        .unwrap();

    let err = h
        .registrar()
        .register(&request(&key, static_proof("good")), now)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistrationError::ProviderUnavailable(_)));
}

#[tokio::test]
async fn cloud_worker_registers_with_attested_identity() {
    let h = Harness::new().await;
    let now = Utc::now();
    let pool = h.create_pool(pool("cloud", 0, 10)).await;
    let provider = h.providers.get(&pid("cloud")).await.unwrap();

    let outcome = provider.provision(&h.ctx, &pool.record, 1, now).await.unwrap();
    assert_eq!(outcome.created.len(), 1);
    let key = outcome.created[0].clone();
    assert_eq!(key.worker_group.as_str(), ZONE);
    let instance_id = cloud_instance_id(&h.worker(&key).await.record);

    h.cloud.add_attestation(
        "doc-good",
        "sig",
        AttestedIdentity {
            instance_id: instance_id.clone(),
            zone: ZONE.to_string(),
            project: PROJECT.to_string(),
        },
    );
    h.cloud.add_attestation(
        "doc-other-project",
        "sig",
        AttestedIdentity {
            instance_id: instance_id.clone(),
            zone: ZONE.to_string(),
            project: "someone-else".to_string(),
        },
    );
    h.cloud.add_attestation(
        "doc-other-instance",
        "sig",
        AttestedIdentity {
            instance_id: "i-someone-else".to_string(),
            zone: ZONE.to_string(),
            project: PROJECT.to_string(),
        },
    );
    h.cloud.add_attestation(
        "doc-other-zone",
        "sig",
        AttestedIdentity {
            instance_id: instance_id.clone(),
            zone: "europe-west4-a".to_string(),
            project: PROJECT.to_string(),
        },
    );
    let registrar = h.registrar();
    let before = h.worker(&key).await;

    for document in ["doc-other-instance", "doc-other-zone"] {
        let err = registrar
            .register(
                &request(&key, json!({"document": document, "signature": "sig"})),
                now,
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, RegistrationError::InvalidProof(_)),
            "{document}: {err}"
        );
        assert_eq!(h.worker(&key).await, before);
    }

    let err = registrar
        .register(
            &request(&key, json!({"document": "doc-other-project", "signature": "sig"})),
            now,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RegistrationError::InvalidProof(_)));

    let err = registrar
        .register(
            &request(&key, json!({"document": "forged", "signature": "sig"})),
            now,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RegistrationError::InvalidProof(_)));
    assert_eq!(h.worker(&key).await.record.state, WorkerState::Requested);

    let registered = registrar
        .register(
            &request(&key, json!({"document": "doc-good", "signature": "sig"})),
            now,
        )
        .await
        .unwrap();
    assert_eq!(registered.expires, now + Duration::seconds(3600));
    assert_eq!(h.worker(&key).await.record.state, WorkerState::Running);
}
