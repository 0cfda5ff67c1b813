//! # Motion Extrapolation Predicate
//!
//! Decides *when* a fresh location update must be transmitted. The predicate
//! holds the last announced motion vector, extrapolates it forward under the
//! constant-velocity model, and compares the predicted position against the
//! observed truth; only a divergence beyond the threshold forces an update
//! onto the wire.
//!
//! This is the sole throttle between an entity's true motion and the number
//! of update messages the cluster generates for it.

use crate::types::{SimTime, TimedMotionVector, Vec3};

/// Default divergence threshold, in world distance units.
pub const DEFAULT_MAX_DIST: f64 = 3.0;

/// Maximum-distance update predicate.
///
/// A pure, deterministic function of (last announced state, elapsed time,
/// observed state); the only state held is the last announced vector.
///
/// Before the first [`update_value`](Self::update_value) call, the baseline
/// is the construction-time motion vector, so the very first observation is
/// compared against the entity's initial state.
#[derive(Debug, Clone)]
pub struct MaxDistExtrapolator {
    announced: TimedMotionVector,
    max_dist: f64,
}

impl MaxDistExtrapolator {
    /// Creates a predicate with the domain-default threshold.
    pub fn new(initial: TimedMotionVector) -> Self {
        Self::with_threshold(initial, DEFAULT_MAX_DIST)
    }

    /// Creates a predicate with an explicit divergence threshold.
    pub fn with_threshold(initial: TimedMotionVector, max_dist: f64) -> Self {
        Self {
            announced: initial,
            max_dist,
        }
    }

    /// Returns true when the observed position has diverged from the
    /// extrapolated announced state by more than the threshold, meaning a
    /// fresh update must be broadcast.
    ///
    /// Callers that transmit must follow up with
    /// [`update_value`](Self::update_value) to reset the baseline.
    pub fn needs_update(&self, current_time: SimTime, observed: &Vec3) -> bool {
        let predicted = self.announced.extrapolate(current_time);
        predicted.distance(*observed) > self.max_dist
    }

    /// Resets the announced baseline after an update has been transmitted.
    pub fn update_value(&mut self, time: SimTime, value: TimedMotionVector) {
        self.announced = TimedMotionVector::new(time, value.position, value.velocity);
    }

    /// The last announced motion vector.
    pub fn announced(&self) -> &TimedMotionVector {
        &self.announced
    }

    /// The divergence threshold.
    pub fn threshold(&self) -> f64 {
        self.max_dist
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stationary_at_origin() -> MaxDistExtrapolator {
        MaxDistExtrapolator::new(TimedMotionVector::stationary(SimTime::ZERO, Vec3::zero()))
    }

    #[test]
    fn test_below_threshold_needs_no_update() {
        let pred = stationary_at_origin();
        let observed = Vec3::new(2.9, 0.0, 0.0);
        assert!(!pred.needs_update(SimTime::from_seconds(1.0), &observed));
    }

    #[test]
    fn test_above_threshold_needs_update() {
        let pred = stationary_at_origin();
        let observed = Vec3::new(3.1, 0.0, 0.0);
        assert!(pred.needs_update(SimTime::from_seconds(1.0), &observed));
    }

    #[test]
    fn test_extrapolated_baseline_tracks_velocity() {
        // Announced state moves at 1 u/s along x; the true position matching
        // the prediction exactly should never force an update.
        let pred = MaxDistExtrapolator::new(TimedMotionVector::new(
            SimTime::ZERO,
            Vec3::zero(),
            Vec3::new(1.0, 0.0, 0.0),
        ));

        let observed = Vec3::new(10.0, 0.0, 0.0);
        assert!(!pred.needs_update(SimTime::from_seconds(10.0), &observed));

        // Diverge past the threshold relative to the *extrapolated* position.
        let diverged = Vec3::new(10.0, 3.5, 0.0);
        assert!(pred.needs_update(SimTime::from_seconds(10.0), &diverged));
    }

    #[test]
    fn test_update_value_resets_baseline() {
        let mut pred = stationary_at_origin();
        let t1 = SimTime::from_seconds(1.0);
        let moved = TimedMotionVector::stationary(t1, Vec3::new(5.0, 0.0, 0.0));

        assert!(pred.needs_update(t1, &moved.position));
        pred.update_value(t1, moved);

        // Baseline is now the announced position, small drift is quiet again.
        let nearby = Vec3::new(6.0, 0.0, 0.0);
        assert!(!pred.needs_update(SimTime::from_seconds(2.0), &nearby));
    }

    #[test]
    fn test_first_observation_compares_against_initial_state() {
        let initial = TimedMotionVector::stationary(SimTime::ZERO, Vec3::new(100.0, 0.0, 0.0));
        let pred = MaxDistExtrapolator::new(initial);

        // No update_value has been called; the construction-time state is
        // the baseline.
        assert!(!pred.needs_update(SimTime::ZERO, &Vec3::new(101.0, 0.0, 0.0)));
        assert!(pred.needs_update(SimTime::ZERO, &Vec3::new(104.0, 0.0, 0.0)));
    }
}
