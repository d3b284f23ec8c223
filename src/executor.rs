//! Atomic read-modify-write of one bucket on a shard.
//!
//! Shards that can run the whole cycle server-side get a single
//! [`Shard::run_cycle`] call. Everything else goes through an optimistic
//! loop: read the raw record, run the engine locally, and write back only if
//! the record is unchanged, retrying a bounded number of times with jittered
//! backoff.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::algorithms::record::storage_key;
use crate::algorithms::{Algorithm, BucketLimits, BucketState, StoredRecord};
use crate::clock::Clock;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::metrics::MetricsCollector;
use crate::shard::{CycleRequest, Shard};

const BACKOFF_BASE: Duration = Duration::from_micros(500);
const BACKOFF_CAP: Duration = Duration::from_millis(50);

/// Full-jitter exponential delay before the attempt after `attempt`.
fn backoff(attempt: u32) -> Duration {
    let ceiling = BACKOFF_BASE
        .saturating_mul(1u32 << attempt.min(16))
        .min(BACKOFF_CAP);
    let micros = u64::try_from(ceiling.as_micros()).unwrap_or(u64::MAX);
    Duration::from_micros(rand::rng().random_range(0..=micros))
}

#[derive(Debug, Clone)]
pub struct RemoteExecutor {
    timeout: Duration,
    key_ttl: Duration,
    cas_retries: u32,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
}

impl RemoteExecutor {
    pub fn new(
        timeout: Duration,
        key_ttl: Duration,
        cas_retries: u32,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            timeout,
            key_ttl,
            cas_retries: cas_retries.max(1),
            clock,
            metrics,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one admission cycle for `key` on `shard`.
    ///
    /// Zero permits succeed and negative permits fail without contacting the
    /// shard. Any error returned means the outcome is unknown and the caller
    /// should decide locally.
    pub async fn apply(
        &self,
        shard: &dyn Shard,
        key: &str,
        algorithm: Algorithm,
        limits: &BucketLimits,
        permits: i64,
    ) -> ThrottlerResult<bool> {
        if permits <= 0 {
            return Ok(permits == 0);
        }

        let storage_key = storage_key(algorithm, key);
        let started = Instant::now();
        let result = if shard.supports_scripting() {
            let cycle = CycleRequest {
                storage_key,
                algorithm,
                limits: *limits,
                permits: permits.unsigned_abs(),
                now_nanos: self.clock.now_nanos(),
                ttl: self.key_ttl,
            };
            self.bounded(shard.run_cycle(&cycle)).await
        } else {
            self.compare_and_set_loop(shard, &storage_key, algorithm, limits, permits)
                .await
        };
        self.observe(shard, started, &result);
        result
    }

    /// Current state of `key` on `shard`, advanced to now. `None` when the
    /// shard holds no usable record.
    pub async fn load(
        &self,
        shard: &dyn Shard,
        key: &str,
        algorithm: Algorithm,
        limits: &BucketLimits,
    ) -> ThrottlerResult<Option<BucketState>> {
        let storage_key = storage_key(algorithm, key);
        let started = Instant::now();
        let result = self.bounded(shard.get(&storage_key)).await;
        self.observe(shard, started, &result);

        let now = self.clock.now_nanos();
        Ok(result?
            .and_then(|raw| StoredRecord::decode(&raw, algorithm))
            .map(|record| algorithm.engine().peek(&record.into_state().with_limits(limits), now)))
    }

    async fn compare_and_set_loop(
        &self,
        shard: &dyn Shard,
        storage_key: &str,
        algorithm: Algorithm,
        limits: &BucketLimits,
        permits: i64,
    ) -> ThrottlerResult<bool> {
        let engine = algorithm.engine();

        for attempt in 1..=self.cas_retries {
            let raw = self.bounded(shard.get(storage_key)).await?;
            let now = self.clock.now_nanos();
            let current = raw
                .as_deref()
                .and_then(|raw| StoredRecord::decode(raw, algorithm))
                .map(|record| record.into_state().with_limits(limits))
                .unwrap_or_else(|| engine.fresh(limits, now));

            let transition = engine.apply(&current, permits, now);
            let value = StoredRecord::from_state(&transition.state, now).encode()?;

            let written = self
                .bounded(shard.compare_and_set(storage_key, raw.as_deref(), &value, self.key_ttl))
                .await?;
            if written {
                return Ok(transition.admitted);
            }
            // A refusal already holds for the record we read.
            if !transition.admitted {
                return Ok(false);
            }
            debug!(shard = shard.name(), key = storage_key, attempt, "compare-and-set lost a race");
            if attempt < self.cas_retries {
                tokio::time::sleep(backoff(attempt)).await;
            }
        }

        Err(ThrottlerError::ContentionExhausted(self.cas_retries))
    }

    async fn bounded<T>(&self, call: impl Future<Output = ThrottlerResult<T>>) -> ThrottlerResult<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| ThrottlerError::Timeout(self.timeout))?
    }

    fn observe<T>(&self, shard: &dyn Shard, started: Instant, result: &ThrottlerResult<T>) {
        self.metrics.record_remote_latency(started.elapsed());
        if let Err(e) = result {
            self.metrics.record_remote_error();
            warn!(shard = shard.name(), error = %e, "remote call failed");
        }
    }
}
