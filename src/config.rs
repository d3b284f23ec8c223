use clap::{Parser, ValueEnum};
use std::time::Duration;

use crate::algorithms::Algorithm;
use crate::rate_limit_config::RateLimitRule;

/// How a Redis shard performs the read-modify-write of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum AtomicMode {
    /// Server-side Lua script.
    #[default]
    Script,
    /// WATCH/MULTI/EXEC with bounded client-side retries.
    CompareAndSet,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "sharded-throttler", version, about)]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:8080")]
    pub bind_addr: String,

    /// Redis shard endpoints, comma separated; order fixes shard numbering
    #[arg(
        long,
        env = "REDIS_INSTANCES",
        value_delimiter = ',',
        default_value = "redis://127.0.0.1:6379,redis://127.0.0.1:6380"
    )]
    pub redis_instances: Vec<String>,

    #[arg(long, env = "REDIS_PASSWORD")]
    pub redis_password: Option<String>,

    /// Logical Redis database used on every shard
    #[arg(long, env = "REDIS_DB", default_value_t = 0)]
    pub redis_db: i64,

    #[arg(long, env = "DEFAULT_CAPACITY", default_value_t = 100)]
    pub default_capacity: u64,

    /// Time to refill one token or drain one queued unit
    #[arg(long, env = "DEFAULT_REFILL_RATE", default_value = "1s", value_parser = humantime::parse_duration)]
    pub default_refill_rate: Duration,

    /// Algorithm used when a request names none (or an unknown one)
    #[arg(long, env = "ALGORITHM", default_value = "token_bucket")]
    pub algorithm: String,

    #[arg(long, env = "REMOTE_TIMEOUT", default_value = "2s", value_parser = humantime::parse_duration)]
    pub remote_timeout: Duration,

    #[arg(long, env = "HEALTH_TIMEOUT", default_value = "2s", value_parser = humantime::parse_duration)]
    pub health_timeout: Duration,

    /// Expiry of bucket records on the shards, refreshed on every write
    #[arg(long, env = "KEY_TTL", default_value = "1h", value_parser = humantime::parse_duration)]
    pub key_ttl: Duration,

    #[arg(long, env = "ATOMIC_MODE", value_enum, default_value_t = AtomicMode::Script)]
    pub atomic_mode: AtomicMode,

    #[arg(long, env = "CAS_RETRIES", default_value_t = 8)]
    pub cas_retries: u32,

    /// Fallback buckets untouched for this many periods are swept
    #[arg(long, env = "FALLBACK_IDLE_PERIODS", default_value_t = 3600)]
    pub fallback_idle_periods: u64,

    #[arg(long, env = "SWEEP_INTERVAL", default_value = "60s", value_parser = humantime::parse_duration)]
    pub sweep_interval: Duration,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn default_rule(&self) -> RateLimitRule {
        RateLimitRule::new(self.default_capacity, self.default_refill_rate)
    }

    pub fn default_algorithm(&self) -> Algorithm {
        Algorithm::parse_or_default(&self.algorithm)
    }

    /// Shard endpoints with blanks removed.
    pub fn endpoints(&self) -> Vec<String> {
        self.redis_instances
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_from(["sharded-throttler"])
    }
}
