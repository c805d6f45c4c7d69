//! Operator notification of pool errors.

use async_trait::async_trait;
use fleet_model::{WorkerPool, WorkerPoolError};
use tracing::warn;

/// Delivers pool errors to the pool owner.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn pool_error(&self, pool: &WorkerPool, error: &WorkerPoolError);
}

/// Notifier that writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn pool_error(&self, pool: &WorkerPool, error: &WorkerPoolError) {
        warn!(
            worker_pool_id = %pool.worker_pool_id,
            owner = %pool.owner,
            error_id = %error.error_id,
            kind = %error.kind,
            title = %error.title,
            "Notifying pool owner"
        );
    }
}
