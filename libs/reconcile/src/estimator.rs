//! Capacity estimation.
//!
//! Pure computation over supplied state: no clock, no I/O. Given what a pool
//! already has and how much work is waiting, decide how much capacity to add
//! (positive delta) or remove (negative delta).
//!
//! # Guarantees
//!
//! - `min_capacity <= existing + delta <= max_capacity`
//! - More pending demand at equal existing capacity never yields a smaller delta
//! - Growth is rounded up to whole `step`s unless that would overshoot `max_capacity`

use thiserror::Error;

/// Invalid estimator input.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EstimatorError {
    #[error("minCapacity {min} exceeds maxCapacity {max}")]
    MinAboveMax { min: u32, max: u32 },

    #[error("scaling ratio must be finite and non-negative, got {0}")]
    InvalidScalingRatio(f64),

    #[error("step must be at least 1")]
    ZeroStep,
}

/// Inputs to one estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorInput {
    /// Capacity of live (requested or running, unexpired) workers.
    pub existing_capacity: u64,

    /// Runnable but unclaimed units of work.
    pub pending_demand: u64,

    pub min_capacity: u32,
    pub max_capacity: u32,

    /// Capacity requested per unit of pending demand.
    pub scaling_ratio: f64,

    /// Granularity of growth (capacity per backend instance).
    pub step: u32,
}

/// Result of an estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Estimate {
    pub existing_capacity: u64,
    pub desired_capacity: u64,
    pub delta: i64,
}

impl Estimate {
    pub fn is_growth(&self) -> bool {
        self.delta > 0
    }

    pub fn is_shrink(&self) -> bool {
        self.delta < 0
    }
}

/// Compute the capacity delta for a pool.
pub fn estimate(input: &EstimatorInput) -> Result<Estimate, EstimatorError> {
    if input.min_capacity > input.max_capacity {
        return Err(EstimatorError::MinAboveMax {
            min: input.min_capacity,
            max: input.max_capacity,
        });
    }
    if !input.scaling_ratio.is_finite() || input.scaling_ratio < 0.0 {
        return Err(EstimatorError::InvalidScalingRatio(input.scaling_ratio));
    }
    if input.step == 0 {
        return Err(EstimatorError::ZeroStep);
    }

    let min = u64::from(input.min_capacity);
    let max = u64::from(input.max_capacity);
    let step = u64::from(input.step);
    let existing = input.existing_capacity;

    // Float-to-int `as` saturates, so huge demand lands on u64::MAX.
    let demanded = (input.pending_demand as f64 * input.scaling_ratio).ceil() as u64;
    let growth = round_up_to_step(demanded, step);

    let mut desired = existing.saturating_add(growth).clamp(min, max);

    // Growth forced by min_capacity is rounded too, as long as it fits.
    if desired > existing {
        let rounded = existing.saturating_add(round_up_to_step(desired - existing, step));
        if rounded <= max {
            desired = rounded;
        }
    }

    let delta = if desired >= existing {
        i64::try_from(desired - existing).unwrap_or(i64::MAX)
    } else {
        i64::try_from(existing - desired).map_or(i64::MIN, |d| -d)
    };

    Ok(Estimate {
        existing_capacity: existing,
        desired_capacity: desired,
        delta,
    })
}

fn round_up_to_step(value: u64, step: u64) -> u64 {
    match value % step {
        0 => value,
        rem => value.saturating_add(step - rem),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn input(existing: u64, pending: u64) -> EstimatorInput {
        EstimatorInput {
            existing_capacity: existing,
            pending_demand: pending,
            min_capacity: 0,
            max_capacity: 100,
            scaling_ratio: 1.0,
            step: 1,
        }
    }

    #[rstest]
    #[case::idle(0, 0, 0)]
    #[case::grow_to_demand(0, 10, 10)]
    #[case::grow_on_top_of_existing(5, 10, 10)]
    #[case::cap_at_max(90, 50, 10)]
    #[case::shrink_above_max(120, 0, -20)]
    fn test_basic_estimates(#[case] existing: u64, #[case] pending: u64, #[case] delta: i64) {
        let est = estimate(&input(existing, pending)).unwrap();
        assert_eq!(est.delta, delta);
    }

    #[test]
    fn test_never_below_min_with_zero_demand() {
        let mut i = input(0, 0);
        i.min_capacity = 3;
        let est = estimate(&i).unwrap();
        assert_eq!(est.delta, 3);
        assert_eq!(est.desired_capacity, 3);
    }

    #[test]
    fn test_scaling_ratio_rounds_up() {
        let mut i = input(0, 5);
        i.scaling_ratio = 0.5;
        assert_eq!(estimate(&i).unwrap().delta, 3);
    }

    #[test]
    fn test_growth_rounds_to_step() {
        let mut i = input(0, 5);
        i.step = 4;
        assert_eq!(estimate(&i).unwrap().delta, 8);
    }

    #[test]
    fn test_step_rounding_never_overshoots_max() {
        let mut i = input(0, 5);
        i.step = 4;
        i.max_capacity = 6;
        assert_eq!(estimate(&i).unwrap().delta, 6);
    }

    #[test]
    fn test_min_growth_rounds_to_step_when_it_fits() {
        let mut i = input(0, 0);
        i.min_capacity = 3;
        i.step = 2;
        assert_eq!(estimate(&i).unwrap().delta, 4);
    }

    #[test]
    fn test_invalid_inputs() {
        let mut i = input(0, 0);
        i.min_capacity = 10;
        i.max_capacity = 5;
        assert!(matches!(
            estimate(&i),
            Err(EstimatorError::MinAboveMax { .. })
        ));

        let mut i = input(0, 0);
        i.scaling_ratio = -1.0;
        assert!(matches!(
            estimate(&i),
            Err(EstimatorError::InvalidScalingRatio(_))
        ));

        let mut i = input(0, 0);
        i.step = 0;
        assert_eq!(estimate(&i), Err(EstimatorError::ZeroStep));
    }

    #[test]
    fn test_unbounded_demand_stays_within_max() {
        let mut i = input(0, u64::MAX);
        i.scaling_ratio = 1e9;
        let est = estimate(&i).unwrap();
        assert_eq!(est.desired_capacity, 100);
    }

    fn arb_input() -> impl Strategy<Value = EstimatorInput> {
        (
            0u64..10_000,
            0u64..10_000,
            0u32..500,
            0u32..500,
            0.0f64..4.0,
            1u32..16,
        )
            .prop_map(|(existing, pending, a, b, ratio, step)| EstimatorInput {
                existing_capacity: existing,
                pending_demand: pending,
                min_capacity: a.min(b),
                max_capacity: a.max(b),
                scaling_ratio: ratio,
                step,
            })
    }

    proptest! {
        #[test]
        fn prop_result_within_bounds(i in arb_input()) {
            let est = estimate(&i).unwrap();
            let total = i.existing_capacity as i64 + est.delta;
            prop_assert!(total >= i64::from(i.min_capacity));
            prop_assert!(total <= i64::from(i.max_capacity));
        }

        #[test]
        fn prop_monotonic_in_demand(i in arb_input(), extra in 1u64..10_000) {
            let lower = estimate(&i).unwrap();
            let mut more = i.clone();
            more.pending_demand += extra;
            let higher = estimate(&more).unwrap();
            prop_assert!(higher.delta >= lower.delta);
        }
    }
}
