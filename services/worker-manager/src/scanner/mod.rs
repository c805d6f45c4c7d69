//! Worker scanner.
//!
//! Lets every provider with a claim on a pool (current and previous) reap
//! its dead workers. The provisioning pass runs the scan as the last step
//! for each pool, so a pool's provision, deprovision and cleanup steps
//! never race each other. The retention purge runs on its own loop.

mod worker;

pub use worker::{PurgeConfig, PurgeWorker};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleet_model::WorkerPool;
use tracing::{debug, warn};

use crate::providers::{ProviderContext, Providers, ScanStats};

pub struct Scanner {
    ctx: Arc<ProviderContext>,
    providers: Arc<Providers>,
}

impl Scanner {
    pub fn new(ctx: Arc<ProviderContext>, providers: Arc<Providers>) -> Self {
        Self { ctx, providers }
    }

    /// Scan one pool with every provider that may own workers in it.
    ///
    /// Returns `None` if any provider's scan failed outright.
    pub async fn scan_pool(&self, pool: &WorkerPool, now: DateTime<Utc>) -> Option<ScanStats> {
        let mut stats = ScanStats::default();
        let mut failed = false;

        let claimants = std::iter::once(&pool.provider_id).chain(pool.previous_provider_ids.iter());
        for provider_id in claimants {
            let Some(provider) = self.providers.get(provider_id).await else {
                debug!(provider_id = %provider_id, "No provider to scan with");
                continue;
            };
            match provider.scan_cleanup(&self.ctx, pool, now).await {
                Ok(s) => stats.merge(s),
                Err(e) => {
                    warn!(
                        worker_pool_id = %pool.worker_pool_id,
                        provider_id = %provider_id,
                        error = %e,
                        "Scan failed"
                    );
                    failed = true;
                }
            }
        }

        (!failed).then_some(stats)
    }
}
