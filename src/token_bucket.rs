use crate::algorithms::{Algorithm, AlgorithmEngine, BucketLimits, BucketState};

/// Token bucket: one token is added per elapsed period up to capacity, and a
/// request for `n` permits succeeds when at least `n` tokens are present.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenBucket;

impl AlgorithmEngine for TokenBucket {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    fn fresh(&self, limits: &BucketLimits, now_nanos: u64) -> BucketState {
        BucketState {
            algorithm: Algorithm::TokenBucket,
            capacity: limits.capacity,
            level: limits.capacity,
            period_nanos: limits.period_nanos(),
            anchor_nanos: now_nanos,
        }
    }

    fn advance(&self, state: &mut BucketState, now_nanos: u64) {
        let periods = state.elapsed_periods(now_nanos);
        if periods == 0 {
            return;
        }

        state.level = state.level.saturating_add(periods).min(state.capacity);
        // Only whole periods are consumed; the remainder carries into the next call.
        state.anchor_nanos += periods * state.period_nanos;
    }

    fn admit(&self, state: &mut BucketState, permits: u64) -> bool {
        if state.level >= permits {
            state.level -= permits;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SECOND: u64 = 1_000_000_000;

    fn bucket(capacity: u64) -> BucketState {
        TokenBucket.fresh(&BucketLimits::new(capacity, Duration::from_secs(1)), 0)
    }

    #[test]
    fn test_token_bucket_creation() {
        let state = bucket(10);
        assert_eq!(state.capacity, 10);
        assert_eq!(state.level, 10);
        assert_eq!(state.period_nanos, SECOND);
        assert_eq!(state.anchor_nanos, 0);
    }

    #[test]
    fn test_token_consumption() {
        let state = bucket(10);
        let first = TokenBucket.apply(&state, 5, 0);
        assert!(first.admitted);
        assert_eq!(first.state.level, 5);

        let second = TokenBucket.apply(&first.state, 5, 0);
        assert!(second.admitted);
        assert_eq!(second.state.level, 0);

        let third = TokenBucket.apply(&second.state, 1, 0);
        assert!(!third.admitted);
        assert!(third.persist);
        assert_eq!(third.state.level, 0);
    }

    #[test]
    fn test_failed_request_leaves_level_unchanged() {
        let state = TokenBucket.apply(&bucket(10), 5, 0).state;
        let denied = TokenBucket.apply(&state, 6, 0);
        assert!(!denied.admitted);
        assert_eq!(denied.state.level, 5);
    }

    #[test]
    fn test_refill_is_exact_in_whole_periods() {
        // consume k, wait m periods, expect min(C, C - k + m)
        for (k, m) in [(3u64, 1u64), (7, 2), (9, 20), (4, 0)] {
            let state = TokenBucket.apply(&bucket(10), k as i64, 0).state;
            let view = TokenBucket.peek(&state, m * SECOND);
            assert_eq!(view.level, 10.min(10 - k + m), "k={} m={}", k, m);
        }
    }

    #[test]
    fn test_fractional_progress_is_kept() {
        let mut state = TokenBucket.apply(&bucket(10), 10, 0).state;

        // Ten calls 0.3s apart: 3s elapsed, so exactly three tokens.
        for step in 1..=10u64 {
            TokenBucket.advance(&mut state, step * 300_000_000);
        }
        assert_eq!(state.level, 3);
        assert_eq!(state.anchor_nanos, 3 * SECOND);
    }

    #[test]
    fn test_capacity_overflow_prevention() {
        let state = TokenBucket.apply(&bucket(5), 3, 0).state;
        let view = TokenBucket.peek(&state, 1_000 * SECOND);
        assert_eq!(view.level, 5);
        // anchor still moves by whole periods only
        assert_eq!(view.anchor_nanos, 1_000 * SECOND);
    }

    #[test]
    fn test_negative_and_zero_permits() {
        let state = TokenBucket.apply(&bucket(10), 4, 0).state;

        let negative = TokenBucket.apply(&state, -1, 5 * SECOND);
        assert!(!negative.admitted);
        assert!(!negative.persist);
        assert_eq!(negative.state, state);

        let zero = TokenBucket.apply(&state, 0, 5 * SECOND);
        assert!(zero.admitted);
        assert!(!zero.persist);
        assert_eq!(zero.state, state);
    }

    #[test]
    fn test_request_larger_than_capacity_never_succeeds() {
        let state = bucket(3);
        let attempt = TokenBucket.apply(&state, 4, 100 * SECOND);
        assert!(!attempt.admitted);
        assert_eq!(attempt.state.level, 3);
    }

    #[test]
    fn test_documented_scenario() {
        let state = bucket(10);
        let t = TokenBucket.apply(&state, 5, 0);
        assert!(t.admitted);
        assert_eq!(t.state.level, 5);

        let t = TokenBucket.apply(&t.state, 6, 0);
        assert!(!t.admitted);
        assert_eq!(t.state.level, 5);

        assert_eq!(TokenBucket.peek(&t.state, 3 * SECOND).tokens_left(), 8);

        let t = TokenBucket.apply(&t.state, 8, 3 * SECOND);
        assert!(t.admitted);
        assert_eq!(t.state.level, 0);
    }
}
