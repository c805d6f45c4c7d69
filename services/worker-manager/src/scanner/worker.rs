//! Retention purge background worker.
//!
//! Deletes `stopped` workers past their retention and credentials past
//! their expiry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::providers::ProviderContext;

#[derive(Debug, Clone)]
pub struct PurgeConfig {
    pub interval: Duration,
    /// How long `stopped` workers are kept for inspection.
    pub stopped_retention: Duration,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            stopped_retention: Duration::from_secs(24 * 3600),
        }
    }
}

pub struct PurgeWorker {
    ctx: Arc<ProviderContext>,
    config: PurgeConfig,
}

impl PurgeWorker {
    pub fn new(ctx: Arc<ProviderContext>, config: PurgeConfig) -> Self {
        Self { ctx, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            stopped_retention_secs = self.config.stopped_retention.as_secs(),
            "Starting purge worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.purge().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Purge worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run one purge. Failures are logged and retried on the next tick.
    pub async fn purge(&self) {
        let now = Utc::now();
        let retention = chrono::Duration::from_std(self.config.stopped_retention)
            .unwrap_or_else(|_| chrono::Duration::days(1));

        match self
            .ctx
            .registry()
            .purge_stopped_workers(now - retention)
            .await
        {
            Ok(count) if count > 0 => info!(deleted = count, "Purged stopped workers"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to purge stopped workers"),
        }

        match self.ctx.registry().purge_expired_credentials(now).await {
            Ok(count) if count > 0 => info!(deleted = count, "Purged expired credentials"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to purge expired credentials"),
        }
    }
}
