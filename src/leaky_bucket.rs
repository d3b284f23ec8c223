use crate::algorithms::{Algorithm, AlgorithmEngine, BucketLimits, BucketState};

/// Leaky bucket: `level` is the queue length, one unit drains per elapsed
/// period, and adding `n` units succeeds while the queue stays within capacity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeakyBucket;

impl AlgorithmEngine for LeakyBucket {
    fn algorithm(&self) -> Algorithm {
        Algorithm::LeakyBucket
    }

    fn fresh(&self, limits: &BucketLimits, now_nanos: u64) -> BucketState {
        BucketState {
            algorithm: Algorithm::LeakyBucket,
            capacity: limits.capacity,
            level: 0,
            period_nanos: limits.period_nanos(),
            anchor_nanos: now_nanos,
        }
    }

    fn advance(&self, state: &mut BucketState, now_nanos: u64) {
        let periods = state.elapsed_periods(now_nanos);
        if periods == 0 {
            return;
        }

        // The anchor only moves by the periods that actually drained a unit.
        let drained = periods.min(state.level);
        state.level -= drained;
        state.anchor_nanos += drained * state.period_nanos;
    }

    fn admit(&self, state: &mut BucketState, permits: u64) -> bool {
        match state.level.checked_add(permits) {
            Some(queued) if queued <= state.capacity => {
                state.level = queued;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MS: u64 = 1_000_000;

    fn bucket(capacity: u64, period_ms: u64) -> BucketState {
        LeakyBucket.fresh(
            &BucketLimits::new(capacity, Duration::from_millis(period_ms)),
            0,
        )
    }

    #[test]
    fn test_starts_empty() {
        let state = bucket(5, 200);
        assert_eq!(state.level, 0);
        assert_eq!(state.tokens_left(), 5);
        assert!(!state.is_blocked());
    }

    #[test]
    fn test_overflow_is_refused() {
        let state = LeakyBucket.apply(&bucket(5, 200), 5, 0).state;
        let overflow = LeakyBucket.apply(&state, 1, 0);
        assert!(!overflow.admitted);
        assert!(overflow.persist);
        assert_eq!(overflow.state.level, 5);
        assert!(overflow.state.is_blocked());
    }

    #[test]
    fn test_drain_is_exact_in_whole_periods() {
        // add k, wait m periods, expect max(0, k - m) queued
        for (k, m) in [(5u64, 2u64), (3, 3), (4, 9), (2, 0)] {
            let state = LeakyBucket.apply(&bucket(5, 200), k as i64, 0).state;
            let view = LeakyBucket.peek(&state, m * 200 * MS);
            assert_eq!(view.level, k.saturating_sub(m), "k={} m={}", k, m);
        }
    }

    #[test]
    fn test_partial_drain_keeps_remainder() {
        let state = LeakyBucket.apply(&bucket(5, 200), 5, 0).state;
        let view = LeakyBucket.peek(&state, 450 * MS);
        assert_eq!(view.level, 3);
        assert_eq!(view.anchor_nanos, 400 * MS);
    }

    #[test]
    fn test_anchor_moves_by_drained_periods_only() {
        let state = LeakyBucket.apply(&bucket(5, 200), 1, 0).state;

        let view = LeakyBucket.peek(&state, 1_000 * MS);
        assert_eq!(view.level, 0);
        assert_eq!(view.anchor_nanos, 200 * MS);
    }

    #[test]
    fn test_idle_periods_drain_a_later_burst() {
        let state = LeakyBucket.apply(&bucket(5, 200), 1, 0).state;

        // One unit drains at 200ms; the remaining idle periods still count
        // against the anchor and drain the burst added at 10s.
        let burst = LeakyBucket.apply(&state, 5, 10_000 * MS);
        assert!(burst.admitted);
        assert_eq!(burst.state.level, 5);
        assert_eq!(burst.state.anchor_nanos, 200 * MS);

        let view = LeakyBucket.peek(&burst.state, 10_000 * MS);
        assert_eq!(view.level, 0);
        assert_eq!(view.anchor_nanos, 1_200 * MS);
    }

    #[test]
    fn test_negative_and_zero_units() {
        let state = LeakyBucket.apply(&bucket(5, 200), 2, 0).state;
        let negative = LeakyBucket.apply(&state, -3, 0);
        assert!(!negative.admitted);
        assert_eq!(negative.state, state);

        let zero = LeakyBucket.apply(&state, 0, 10_000 * MS);
        assert!(zero.admitted);
        assert!(!zero.persist);
        assert_eq!(zero.state, state);
    }

    #[test]
    fn test_documented_scenario() {
        let state = bucket(5, 200);
        let t = LeakyBucket.apply(&state, 5, 0);
        assert!(t.admitted);
        assert_eq!(t.state.level, 5);

        let t = LeakyBucket.apply(&t.state, 1, 0);
        assert!(!t.admitted);
        assert_eq!(t.state.level, 5);

        let view = LeakyBucket.peek(&t.state, 400 * MS);
        assert_eq!(view.level, 3);
        assert_eq!(view.tokens_left(), 2);
    }
}
