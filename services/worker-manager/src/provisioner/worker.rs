//! Provisioning background worker.
//!
//! Runs the provisioning pass on a periodic interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, instrument};

use super::Provisioner;

/// Background worker that runs the provisioning loop.
pub struct ProvisionerWorker {
    provisioner: Arc<Provisioner>,
    interval: Duration,
}

impl ProvisionerWorker {
    pub fn new(provisioner: Arc<Provisioner>, interval: Duration) -> Self {
        Self {
            provisioner,
            interval,
        }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting provisioner worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.provisioner.provision_all(Utc::now()).await {
                        error!(error = %e, "Provisioning pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Provisioner worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
