//! Provisioning loop.
//!
//! Each pass lists every pool and, concurrently per pool:
//! - estimates how much capacity the pool should add or shed
//! - asks the pool's provider to create workers, or drains the surplus
//! - deprovisions the pool's previous providers and forgets them once empty
//! - scans the pool, reaping dead workers
//! - removes retired pools that have fully drained
//!
//! A failing pool is logged and skipped; it never blocks the others.

mod reconciler;
mod worker;

pub use reconciler::{
    PoolStats, ProvisionStats, Provisioner, ProvisionerError, ProvisionerResult,
};
pub use worker::ProvisionerWorker;
