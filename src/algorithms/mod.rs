//! Rate limiting algorithms module
//!
//! Both algorithms operate on the same [`BucketState`] tuple and are
//! reached through [`AlgorithmEngine`], selected once from an [`Algorithm`]
//! tag. The same engines run behind the in-process fallback and the
//! in-memory shard, and `scripts/bucket.lua` mirrors them on Redis.

pub mod record;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use crate::leaky_bucket::LeakyBucket;
pub use crate::token_bucket::TokenBucket;
pub use record::StoredRecord;

/// Which admission algorithm a bucket follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    TokenBucket,
    LeakyBucket,
}

static TOKEN_BUCKET: TokenBucket = TokenBucket;
static LEAKY_BUCKET: LeakyBucket = LeakyBucket;

impl Algorithm {
    pub const ALL: [Algorithm; 2] = [Algorithm::TokenBucket, Algorithm::LeakyBucket];

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::LeakyBucket => "leaky_bucket",
        }
    }

    /// Parse an algorithm name, falling back to the token bucket for empty
    /// or unrecognised input.
    pub fn parse_or_default(name: &str) -> Self {
        name.parse().unwrap_or_default()
    }

    pub fn engine(&self) -> &'static dyn AlgorithmEngine {
        match self {
            Algorithm::TokenBucket => &TOKEN_BUCKET,
            Algorithm::LeakyBucket => &LEAKY_BUCKET,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "token_bucket" => Ok(Algorithm::TokenBucket),
            "leaky_bucket" => Ok(Algorithm::LeakyBucket),
            other => Err(format!("unknown algorithm '{}'", other)),
        }
    }
}

/// Capacity and period applied to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketLimits {
    pub capacity: u64,
    #[serde(with = "humantime_serde")]
    pub period: Duration,
}

impl BucketLimits {
    pub fn new(capacity: u64, period: Duration) -> Self {
        Self { capacity, period }
    }

    pub fn period_nanos(&self) -> u64 {
        u64::try_from(self.period.as_nanos()).unwrap_or(u64::MAX).max(1)
    }
}

/// Per-key, per-algorithm bucket state.
///
/// `level` is tokens available for a token bucket and queued units for a
/// leaky bucket; `0 <= level <= capacity` always holds. `anchor_nanos` is the
/// boundary of the last fully applied period and only moves forward in whole
/// multiples of `period_nanos`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    pub algorithm: Algorithm,
    pub capacity: u64,
    pub level: u64,
    pub period_nanos: u64,
    pub anchor_nanos: u64,
}

impl BucketState {
    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.period_nanos)
    }

    /// Re-apply configured limits to a state loaded from elsewhere.
    pub fn with_limits(mut self, limits: &BucketLimits) -> Self {
        self.capacity = limits.capacity;
        self.period_nanos = limits.period_nanos();
        self.level = self.level.min(self.capacity);
        self
    }

    /// Whole periods elapsed since the anchor. Clock skew never counts.
    pub fn elapsed_periods(&self, now_nanos: u64) -> u64 {
        now_nanos.saturating_sub(self.anchor_nanos) / self.period_nanos.max(1)
    }

    pub fn next_refill_nanos(&self) -> u64 {
        self.anchor_nanos.saturating_add(self.period_nanos)
    }

    /// Units a caller could still take right now.
    pub fn tokens_left(&self) -> u64 {
        match self.algorithm {
            Algorithm::TokenBucket => self.level,
            Algorithm::LeakyBucket => self.capacity.saturating_sub(self.level),
        }
    }

    pub fn is_blocked(&self) -> bool {
        match self.algorithm {
            Algorithm::TokenBucket => self.level == 0,
            Algorithm::LeakyBucket => self.level >= self.capacity,
        }
    }

    /// True when the bucket is indistinguishable from a freshly created one.
    pub fn is_idle(&self) -> bool {
        match self.algorithm {
            Algorithm::TokenBucket => self.level >= self.capacity,
            Algorithm::LeakyBucket => self.level == 0,
        }
    }
}

/// Result of one admission attempt against a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: BucketState,
    pub admitted: bool,
    /// Whether the state has to be written back.
    pub persist: bool,
}

/// State-transition logic shared by every state source.
pub trait AlgorithmEngine: Send + Sync {
    fn algorithm(&self) -> Algorithm;

    /// State of a bucket that has never been touched.
    fn fresh(&self, limits: &BucketLimits, now_nanos: u64) -> BucketState;

    /// Apply whole elapsed periods (refill or drain) in place.
    fn advance(&self, state: &mut BucketState, now_nanos: u64);

    /// Try to take `permits` from an already advanced state.
    fn admit(&self, state: &mut BucketState, permits: u64) -> bool;

    /// Run a full admission cycle.
    ///
    /// Negative requests are refused and zero-permit requests are admitted,
    /// both without touching the state. Otherwise the state is persisted
    /// whether or not the request was admitted.
    fn apply(&self, state: &BucketState, permits: i64, now_nanos: u64) -> Transition {
        if permits <= 0 {
            return Transition {
                state: *state,
                admitted: permits == 0,
                persist: false,
            };
        }

        let mut next = *state;
        self.advance(&mut next, now_nanos);
        let admitted = self.admit(&mut next, permits.unsigned_abs());
        Transition {
            state: next,
            admitted,
            persist: true,
        }
    }

    /// Current view of a state without committing it anywhere.
    fn peek(&self, state: &BucketState, now_nanos: u64) -> BucketState {
        let mut view = *state;
        self.advance(&mut view, now_nanos);
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_parsing_defaults_to_token_bucket() {
        assert_eq!(Algorithm::parse_or_default("leaky_bucket"), Algorithm::LeakyBucket);
        assert_eq!(Algorithm::parse_or_default(" Token_Bucket "), Algorithm::TokenBucket);
        assert_eq!(Algorithm::parse_or_default(""), Algorithm::TokenBucket);
        assert_eq!(Algorithm::parse_or_default("sliding_window"), Algorithm::TokenBucket);
    }

    #[test]
    fn test_engine_selection() {
        for algorithm in Algorithm::ALL {
            assert_eq!(algorithm.engine().algorithm(), algorithm);
        }
    }

    #[test]
    fn test_with_limits_clamps_level() {
        let state = BucketState {
            algorithm: Algorithm::TokenBucket,
            capacity: 10,
            level: 9,
            period_nanos: 1_000,
            anchor_nanos: 0,
        };
        let clamped = state.with_limits(&BucketLimits::new(4, Duration::from_nanos(500)));
        assert_eq!(clamped.capacity, 4);
        assert_eq!(clamped.level, 4);
        assert_eq!(clamped.period_nanos, 500);
    }

    #[test]
    fn test_elapsed_periods_ignores_clock_going_backwards() {
        let state = BucketState {
            algorithm: Algorithm::LeakyBucket,
            capacity: 1,
            level: 0,
            period_nanos: 10,
            anchor_nanos: 100,
        };
        assert_eq!(state.elapsed_periods(50), 0);
        assert_eq!(state.elapsed_periods(129), 2);
    }
}
