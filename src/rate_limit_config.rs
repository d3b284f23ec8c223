use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::algorithms::BucketLimits;

/// Limits applied per caller key: one default rule plus explicit overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub rules: HashMap<String, RateLimitRule>,
    pub default_rule: RateLimitRule,
}

/// Capacity and period for a key. The same rule drives both algorithms:
/// one token refilled, or one queued unit drained, per period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub capacity: u64,
    #[serde(with = "humantime_serde")]
    pub period: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::with_default(RateLimitRule::default())
    }
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            capacity: 100,
            period: Duration::from_secs(1),
        }
    }
}

impl RateLimitConfig {
    pub fn with_default(default_rule: RateLimitRule) -> Self {
        Self {
            rules: HashMap::new(),
            default_rule,
        }
    }

    /// Get rate limit rule for a specific key, falling back to default
    pub fn get_rule(&self, key: &str) -> &RateLimitRule {
        self.rules.get(key).unwrap_or(&self.default_rule)
    }

    pub fn set_rule(&mut self, key: String, rule: RateLimitRule) {
        self.rules.insert(key, rule);
    }

    pub fn remove_rule(&mut self, key: &str) -> Option<RateLimitRule> {
        self.rules.remove(key)
    }
}

impl RateLimitRule {
    pub fn new(capacity: u64, period: Duration) -> Self {
        Self { capacity, period }
    }

    pub fn limits(&self) -> BucketLimits {
        BucketLimits::new(self.capacity, self.period)
    }

    /// Validate rule parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.capacity == 0 {
            return Err("Capacity must be greater than 0".to_string());
        }
        if self.period.is_zero() {
            return Err("Period must be greater than 0".to_string());
        }
        Ok(())
    }
}
