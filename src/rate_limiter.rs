use dashmap::DashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::algorithms::{Algorithm, BucketLimits, BucketState};
use crate::clock::Clock;
use crate::error::{ThrottlerError, ThrottlerResult};

type BucketMap = DashMap<String, Arc<RwLock<BucketState>>>;

/// In-process buckets used when a key's shard cannot be reached.
///
/// One map per algorithm. The map guards creation and lookup only; each
/// bucket has its own lock, so keys never contend with each other.
#[derive(Debug)]
pub struct LocalFallback {
    clock: Arc<dyn Clock>,
    token_buckets: BucketMap,
    leaky_buckets: BucketMap,
}

/// Bucket counts per algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FallbackSizes {
    pub token_buckets: usize,
    pub leaky_buckets: usize,
}

impl LocalFallback {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            token_buckets: DashMap::new(),
            leaky_buckets: DashMap::new(),
        }
    }

    fn buckets(&self, algorithm: Algorithm) -> &BucketMap {
        match algorithm {
            Algorithm::TokenBucket => &self.token_buckets,
            Algorithm::LeakyBucket => &self.leaky_buckets,
        }
    }

    /// Leave the bucket for `key` with a poisoned lock.
    #[cfg(test)]
    pub(crate) fn poison(&self, algorithm: Algorithm, key: &str, limits: &BucketLimits) {
        let _ = self.apply(algorithm, key, 1, limits);
        if let Some(bucket) = self.buckets(algorithm).get(key).map(|b| b.value().clone()) {
            let _ = std::thread::spawn(move || {
                let _guard = bucket.write();
                panic!("bucket poisoned on purpose");
            })
            .join();
        }
    }

    /// Run one admission cycle against the local bucket for `key`.
    pub fn apply(
        &self,
        algorithm: Algorithm,
        key: &str,
        permits: i64,
        limits: &BucketLimits,
    ) -> ThrottlerResult<bool> {
        if permits <= 0 {
            return Ok(permits == 0);
        }

        let engine = algorithm.engine();
        // Clone the handle and let go of the map shard before locking the bucket.
        let bucket = self
            .buckets(algorithm)
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(key, %algorithm, "creating local bucket");
                Arc::new(RwLock::new(engine.fresh(limits, self.clock.now_nanos())))
            })
            .value()
            .clone();

        let mut state = bucket
            .write()
            .map_err(|_| ThrottlerError::InternalError("local bucket lock poisoned".to_string()))?;
        let now = self.clock.now_nanos();
        let transition = engine.apply(&state.with_limits(limits), permits, now);
        *state = transition.state;
        Ok(transition.admitted)
    }

    pub fn try_consume(&self, key: &str, permits: i64, limits: &BucketLimits) -> ThrottlerResult<bool> {
        self.apply(Algorithm::TokenBucket, key, permits, limits)
    }

    pub fn try_add(&self, key: &str, units: i64, limits: &BucketLimits) -> ThrottlerResult<bool> {
        self.apply(Algorithm::LeakyBucket, key, units, limits)
    }

    /// Current state of a local bucket, advanced to now. `None` if the key
    /// was never seen.
    pub fn status(&self, algorithm: Algorithm, key: &str) -> ThrottlerResult<Option<BucketState>> {
        let bucket = match self.buckets(algorithm).get(key) {
            Some(entry) => entry.value().clone(),
            None => return Ok(None),
        };

        let state = bucket
            .read()
            .map_err(|_| ThrottlerError::InternalError("local bucket lock poisoned".to_string()))?;
        Ok(Some(algorithm.engine().peek(&state, self.clock.now_nanos())))
    }

    pub fn sizes(&self) -> FallbackSizes {
        FallbackSizes {
            token_buckets: self.token_buckets.len(),
            leaky_buckets: self.leaky_buckets.len(),
        }
    }

    /// Drop buckets that are back at their fresh level and have not been
    /// written for `max_idle_periods` periods. Returns how many were removed.
    pub fn sweep_idle(&self, max_idle_periods: u64) -> usize {
        let now = self.clock.now_nanos();
        let mut removed = 0;

        for map in [&self.token_buckets, &self.leaky_buckets] {
            map.retain(|_, bucket| {
                // Someone is mid-cycle on this bucket.
                if Arc::strong_count(bucket) > 1 {
                    return true;
                }
                let state = match bucket.read() {
                    Ok(state) => *state,
                    Err(_) => return true,
                };
                let idle_for = now.saturating_sub(state.anchor_nanos);
                let limit = state.period_nanos.saturating_mul(max_idle_periods);
                let evict = idle_for > limit && state.algorithm.engine().peek(&state, now).is_idle();
                if evict {
                    removed += 1;
                }
                !evict
            });
        }

        if removed > 0 {
            debug!(removed, "swept idle local buckets");
        }
        removed
    }

    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, max_idle_periods: u64) -> JoinHandle<()> {
        info!(?interval, max_idle_periods, "starting local bucket sweeper");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep_idle(max_idle_periods);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn fallback() -> (LocalFallback, ManualClock) {
        let clock = ManualClock::default();
        (LocalFallback::new(Arc::new(clock.clone())), clock)
    }

    fn limits(capacity: u64, period: Duration) -> BucketLimits {
        BucketLimits::new(capacity, period)
    }

    #[test]
    fn test_token_bucket_scenario() {
        let (fallback, clock) = fallback();
        let l = limits(10, Duration::from_secs(1));

        assert!(fallback.try_consume("user", 5, &l).unwrap());
        assert!(!fallback.try_consume("user", 6, &l).unwrap());
        clock.advance(Duration::from_secs(3));

        let status = fallback.status(Algorithm::TokenBucket, "user").unwrap().unwrap();
        assert_eq!(status.tokens_left(), 8);
        assert!(fallback.try_consume("user", 8, &l).unwrap());
        assert!(!fallback.try_consume("user", 1, &l).unwrap());
    }

    #[test]
    fn test_leaky_bucket_scenario() {
        let (fallback, clock) = fallback();
        let l = limits(5, Duration::from_millis(200));

        assert!(fallback.try_add("queue", 5, &l).unwrap());
        assert!(!fallback.try_add("queue", 1, &l).unwrap());
        clock.advance(Duration::from_millis(400));

        let status = fallback.status(Algorithm::LeakyBucket, "queue").unwrap().unwrap();
        assert_eq!(status.level, 3);
        assert_eq!(status.tokens_left(), 2);
    }

    #[test]
    fn test_algorithms_are_independent() {
        let (fallback, _clock) = fallback();
        let l = limits(1, Duration::from_secs(60));

        assert!(fallback.try_consume("k", 1, &l).unwrap());
        assert!(fallback.try_add("k", 1, &l).unwrap());
        assert!(!fallback.try_consume("k", 1, &l).unwrap());
        assert_eq!(
            fallback.sizes(),
            FallbackSizes {
                token_buckets: 1,
                leaky_buckets: 1
            }
        );
    }

    #[test]
    fn test_zero_and_negative_do_not_create_buckets() {
        let (fallback, _clock) = fallback();
        let l = limits(1, Duration::from_secs(1));

        assert!(fallback.try_consume("k", 0, &l).unwrap());
        assert!(!fallback.try_consume("k", -2, &l).unwrap());
        assert_eq!(fallback.sizes(), FallbackSizes::default());
        assert!(fallback.status(Algorithm::TokenBucket, "k").unwrap().is_none());
    }

    #[test]
    fn test_sweep_only_removes_idle_fresh_buckets() {
        let (fallback, clock) = fallback();
        let l = limits(10, Duration::from_secs(1));

        assert!(fallback.try_consume("refilled", 3, &l).unwrap());
        assert!(fallback.try_add("still-queued", 10, &l).unwrap());

        clock.advance(Duration::from_secs(5));
        assert_eq!(fallback.sweep_idle(60), 0);

        // long enough to refill the token bucket; the 10-deep queue also drains
        clock.advance(Duration::from_secs(120));
        assert_eq!(fallback.sweep_idle(60), 2);
        assert_eq!(fallback.sizes(), FallbackSizes::default());
    }

    #[test]
    fn test_sweep_keeps_busy_bucket() {
        let (fallback, clock) = fallback();
        let l = limits(10, Duration::from_secs(1));

        assert!(fallback.try_add("busy", 10, &l).unwrap());
        clock.advance(Duration::from_secs(4));
        assert_eq!(fallback.sweep_idle(1), 0);
        assert_eq!(fallback.sizes().leaky_buckets, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumers_never_overshoot() {
        let fallback = Arc::new(LocalFallback::new(Arc::new(ManualClock::default())));
        let l = limits(50, Duration::from_secs(3600));

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let fallback = fallback.clone();
                tokio::spawn(async move { fallback.try_consume("shared", 1, &l).unwrap() })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 50);
    }
}
