//! Reconciliation primitives for the provisioning loop.
//!
//! This library provides helpers for loops that converge a pool's actual
//! capacity toward the capacity its demand calls for. Key concepts:
//!
//! - **Existing capacity**: what the registry says the pool has now.
//! - **Desired capacity**: what the estimator says it should have.
//! - **Convergence**: creating or draining workers to close the gap.
//!
//! # Invariants
//!
//! - Estimates are deterministic given the same inputs
//! - Retry accounting is per resource key and bounded by a window

mod estimator;

pub use estimator::{estimate, Estimate, EstimatorError, EstimatorInput};

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Drain selection priority for workers.
///
/// Lower priority values are drained first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DrainPriority {
    /// Backend no longer reports the worker (drain first).
    Gone = 0,

    /// Worker has not called in yet.
    Unregistered = 1,

    /// Worker registered but its lease is close to running out.
    Expiring = 2,

    /// Worker is registered and healthy (drain last).
    Healthy = 3,
}

/// Select workers to drain based on priority.
///
/// Returns workers sorted by drain priority (first to drain first). The sort
/// is stable, so callers can pre-order ties (e.g. newest first).
pub fn select_for_drain<T, F>(instances: Vec<T>, get_priority: F) -> Vec<T>
where
    F: Fn(&T) -> DrainPriority,
{
    let mut with_priority: Vec<_> = instances
        .into_iter()
        .map(|i| {
            let p = get_priority(&i);
            (p, i)
        })
        .collect();

    with_priority.sort_by_key(|(p, _)| *p);
    with_priority.into_iter().map(|(_, i)| i).collect()
}

/// Pick workers whose combined capacity removes at most `excess` capacity.
///
/// Walks `ordered` (already in drain order) and takes each worker that still
/// fits, so the pool never drops below its target.
pub fn take_capacity<T, F>(ordered: Vec<T>, excess: u64, capacity: F) -> Vec<T>
where
    F: Fn(&T) -> u64,
{
    let mut removed = 0u64;
    let mut picked = Vec::new();
    for item in ordered {
        let c = capacity(&item);
        if c == 0 || removed + c > excess {
            continue;
        }
        removed += c;
        picked.push(item);
        if removed == excess {
            break;
        }
    }
    picked
}

/// Retry tracker for failed operations.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per resource.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

/// Default provisioning interval.
pub const DEFAULT_PROVISION_INTERVAL: Duration = Duration::from_secs(30);

/// Default failures per pool before escalating to the pool owner.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(60 * 60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_for_drain_orders_by_priority() {
        let workers = vec![
            ("w1", DrainPriority::Healthy),
            ("w2", DrainPriority::Unregistered),
            ("w3", DrainPriority::Gone),
            ("w4", DrainPriority::Expiring),
        ];

        let ordered = select_for_drain(workers, |(_, p)| *p);
        let names: Vec<_> = ordered.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["w3", "w2", "w4", "w1"]);
    }

    #[test]
    fn test_take_capacity_never_overshoots() {
        let workers = vec![("a", 4u64), ("b", 2), ("c", 1), ("d", 1)];
        let picked = take_capacity(workers, 3, |(_, c)| *c);
        let names: Vec<_> = picked.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn test_take_capacity_nothing_fits() {
        let workers = vec![("a", 4u64)];
        assert!(take_capacity(workers, 3, |(_, c)| *c).is_empty());
    }

    #[test]
    fn test_retry_tracker() {
        let mut tracker = RetryTracker::new(3, Duration::from_secs(60));

        assert!(!tracker.record_failure("foo/bar")); // 1st
        assert!(!tracker.record_failure("foo/bar")); // 2nd
        assert!(!tracker.record_failure("foo/bar")); // 3rd
        assert!(tracker.record_failure("foo/bar")); // 4th - exhausted
        assert!(!tracker.record_failure("foo/baz"));

        tracker.clear("foo/bar");
        assert!(!tracker.record_failure("foo/bar"));
    }
}
