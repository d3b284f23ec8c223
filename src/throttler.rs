use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::algorithms::{Algorithm, BucketLimits, BucketState};
use crate::clock::{to_system_time, Clock, SystemClock};
use crate::config::Config;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::executor::RemoteExecutor;
use crate::metrics::{MetricsCollector, MetricsReport, ProcessStats, ReportContext, RequestOutcome};
use crate::rate_limit_config::{RateLimitConfig, RateLimitRule};
use crate::rate_limiter::LocalFallback;
use crate::redis::shards_from_endpoints;
use crate::router::ShardRouter;
use crate::shard::Shard;

/// Tunables for the orchestrator, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct ThrottlerSettings {
    pub default_rule: RateLimitRule,
    pub default_algorithm: Algorithm,
    pub remote_timeout: Duration,
    pub health_timeout: Duration,
    pub key_ttl: Duration,
    pub cas_retries: u32,
}

impl Default for ThrottlerSettings {
    fn default() -> Self {
        Self {
            default_rule: RateLimitRule::default(),
            default_algorithm: Algorithm::TokenBucket,
            remote_timeout: Duration::from_secs(2),
            health_timeout: Duration::from_secs(2),
            key_ttl: Duration::from_secs(3600),
            cas_retries: 8,
        }
    }
}

impl From<&Config> for ThrottlerSettings {
    fn from(config: &Config) -> Self {
        Self {
            default_rule: config.default_rule(),
            default_algorithm: config.default_algorithm(),
            remote_timeout: config.remote_timeout,
            health_timeout: config.health_timeout,
            key_ttl: config.key_ttl,
            cas_retries: config.cas_retries,
        }
    }
}

/// Which state source decided an admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    /// Index of the shard that ran the cycle.
    Shard(usize),
    Fallback,
    /// Zero permits; nothing was consulted.
    Unchecked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionOutcome {
    pub allowed: bool,
    pub source: DecisionSource,
}

/// Per-algorithm status for one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlgorithmStatus {
    pub algorithm: Algorithm,
    pub tokens_left: u64,
    pub capacity: u64,
    #[serde(with = "humantime_serde")]
    pub refill_period: Duration,
    #[serde(with = "humantime_serde")]
    pub next_refill_time: SystemTime,
    pub is_blocked: bool,
    pub has_state: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_length: Option<u64>,
}

impl AlgorithmStatus {
    fn from_state(state: &BucketState, has_state: bool) -> Self {
        Self {
            algorithm: state.algorithm,
            tokens_left: state.tokens_left(),
            capacity: state.capacity,
            refill_period: state.period(),
            next_refill_time: to_system_time(state.next_refill_nanos()),
            is_blocked: state.is_blocked(),
            has_state,
            queue_length: (state.algorithm == Algorithm::LeakyBucket).then_some(state.level),
        }
    }

    /// Headroom below capacity means the bucket has seen traffic.
    fn is_active(&self) -> bool {
        self.tokens_left < self.capacity
    }
}

/// Status of a key across both algorithms, built fresh on every call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub key: String,
    pub algorithm: Algorithm,
    pub tokens_left: u64,
    pub capacity: u64,
    #[serde(with = "humantime_serde")]
    pub refill_period: Duration,
    #[serde(with = "humantime_serde")]
    pub next_refill_time: SystemTime,
    pub is_blocked: bool,
    pub has_state: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_bucket_status: Option<AlgorithmStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaky_bucket_status: Option<AlgorithmStatus>,
}

impl StatusView {
    fn build(key: &str, token: AlgorithmStatus, leaky: AlgorithmStatus) -> Self {
        let primary = match (token.has_state, leaky.has_state) {
            (true, true) if token.is_active() => &token,
            (true, true) if leaky.is_active() => &leaky,
            (false, true) => &leaky,
            _ => &token,
        };

        Self {
            key: key.to_string(),
            algorithm: primary.algorithm,
            tokens_left: primary.tokens_left,
            capacity: primary.capacity,
            refill_period: primary.refill_period,
            next_refill_time: primary.next_refill_time,
            is_blocked: primary.is_blocked,
            has_state: primary.has_state,
            token_bucket_status: token.has_state.then(|| token.clone()),
            leaky_bucket_status: leaky.has_state.then(|| leaky.clone()),
        }
    }

    pub fn is_multi_algorithm(&self) -> bool {
        self.token_bucket_status.is_some() && self.leaky_bucket_status.is_some()
    }

    pub fn active_algorithms(&self) -> Vec<Algorithm> {
        [&self.token_bucket_status, &self.leaky_bucket_status]
            .into_iter()
            .flatten()
            .map(|s| s.algorithm)
            .collect()
    }
}

/// Admission orchestrator: routes each decision to the key's shard and
/// falls back to in-process buckets when that shard cannot be used.
pub struct Throttler {
    router: ShardRouter,
    executor: RemoteExecutor,
    fallback: Arc<LocalFallback>,
    metrics: Arc<MetricsCollector>,
    config: RwLock<RateLimitConfig>,
    default_algorithm: Algorithm,
    clock: Arc<dyn Clock>,
}

impl Throttler {
    /// Build a throttler over the Redis shards named in `config`.
    pub fn from_config(config: &Config) -> ThrottlerResult<Self> {
        let shards = shards_from_endpoints(
            &config.endpoints(),
            config.redis_password.as_deref(),
            config.redis_db,
            config.atomic_mode,
        )?
        .into_iter()
        .map(|shard| Arc::new(shard) as Arc<dyn Shard>)
        .collect();

        info!(
            shards = config.endpoints().len(),
            mode = ?config.atomic_mode,
            "configured Redis shards"
        );
        Self::new(shards, ThrottlerSettings::from(config), Arc::new(SystemClock))
    }

    pub fn new(
        shards: Vec<Arc<dyn Shard>>,
        settings: ThrottlerSettings,
        clock: Arc<dyn Clock>,
    ) -> ThrottlerResult<Self> {
        settings
            .default_rule
            .validate()
            .map_err(ThrottlerError::ConfigurationError)?;

        let metrics = Arc::new(MetricsCollector::new()?);
        let router = ShardRouter::new(shards, settings.health_timeout)?;
        let executor = RemoteExecutor::new(
            settings.remote_timeout,
            settings.key_ttl,
            settings.cas_retries,
            clock.clone(),
            metrics.clone(),
        );

        Ok(Self {
            router,
            executor,
            fallback: Arc::new(LocalFallback::new(clock.clone())),
            metrics,
            config: RwLock::new(RateLimitConfig::with_default(settings.default_rule)),
            default_algorithm: settings.default_algorithm,
            clock,
        })
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    pub fn fallback(&self) -> Arc<LocalFallback> {
        self.fallback.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    pub fn default_algorithm(&self) -> Algorithm {
        self.default_algorithm
    }

    /// Map a requested algorithm name to an algorithm, using the configured
    /// default for missing, empty or unknown names.
    pub fn resolve_algorithm(&self, name: Option<&str>) -> Algorithm {
        match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.parse().unwrap_or_else(|e| {
                debug!(error = %e, default = %self.default_algorithm, "using default algorithm");
                self.default_algorithm
            }),
            None => self.default_algorithm,
        }
    }

    pub async fn limits_for(&self, key: &str) -> BucketLimits {
        self.config.read().await.get_rule(key).limits()
    }

    /// Decide one request. An unreachable, slow or contended shard is absorbed
    /// by deciding locally; anything else is returned as an error.
    pub async fn admit(
        &self,
        key: &str,
        permits: i64,
        algorithm: Algorithm,
    ) -> ThrottlerResult<AdmissionOutcome> {
        let started = Instant::now();

        if permits < 0 {
            self.metrics.record_request(RequestOutcome::Error, started.elapsed());
            return Err(ThrottlerError::InvalidRequest(format!(
                "permit count must not be negative, got {}",
                permits
            )));
        }
        if permits == 0 {
            self.metrics.record_request(RequestOutcome::Allowed, started.elapsed());
            return Ok(AdmissionOutcome {
                allowed: true,
                source: DecisionSource::Unchecked,
            });
        }

        let limits = self.limits_for(key).await;
        let remote = match self.router.resolve(key) {
            Some(resolved) => match self
                .executor
                .apply(resolved.shard.as_ref(), key, algorithm, &limits, permits)
                .await
            {
                Ok(allowed) => Some(AdmissionOutcome {
                    allowed,
                    source: DecisionSource::Shard(resolved.index),
                }),
                Err(e) if e.is_unreachable() => {
                    warn!(key, shard = resolved.shard.name(), %algorithm, error = %e, "falling back to local bucket");
                    None
                }
                Err(e) => {
                    self.metrics.record_request(RequestOutcome::Error, started.elapsed());
                    return Err(e);
                }
            },
            None => None,
        };

        let outcome = match remote {
            Some(outcome) => outcome,
            None => {
                self.metrics.record_fallback();
                let allowed = match self.fallback.apply(algorithm, key, permits, &limits) {
                    Ok(allowed) => allowed,
                    Err(e) => {
                        self.metrics.record_request(RequestOutcome::Error, started.elapsed());
                        return Err(e);
                    }
                };
                AdmissionOutcome {
                    allowed,
                    source: DecisionSource::Fallback,
                }
            }
        };

        let recorded = if outcome.allowed {
            RequestOutcome::Allowed
        } else {
            RequestOutcome::RateLimited
        };
        self.metrics.record_request(recorded, started.elapsed());
        debug!(key, permits, %algorithm, allowed = outcome.allowed, source = ?outcome.source, "admission decided");

        Ok(outcome)
    }

    /// Boolean admission: `false` for refusals and for invalid input alike.
    pub async fn acquire(&self, key: &str, permits: i64, algorithm: &str) -> bool {
        let algorithm = self.resolve_algorithm(Some(algorithm));
        match self.admit(key, permits, algorithm).await {
            Ok(outcome) => outcome.allowed,
            Err(e) => {
                debug!(key, error = %e, "request rejected");
                false
            }
        }
    }

    async fn algorithm_status(&self, key: &str, algorithm: Algorithm, limits: &BucketLimits) -> AlgorithmStatus {
        let remote = match self.router.resolve(key) {
            Some(resolved) => match self
                .executor
                .load(resolved.shard.as_ref(), key, algorithm, limits)
                .await
            {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(key, shard = resolved.shard.name(), %algorithm, error = %e, "reading local status instead");
                    None
                }
            },
            None => None,
        };

        let state = match remote {
            Some(state) => state,
            None => self.fallback.status(algorithm, key).unwrap_or_else(|e| {
                warn!(key, %algorithm, error = %e, "local status unavailable");
                None
            }),
        };

        match state {
            Some(state) => AlgorithmStatus::from_state(&state, true),
            None => {
                let fresh = algorithm.engine().fresh(limits, self.clock.now_nanos());
                AlgorithmStatus::from_state(&fresh, false)
            }
        }
    }

    pub async fn get_status(&self, key: &str) -> StatusView {
        let limits = self.limits_for(key).await;
        let (token, leaky) = tokio::join!(
            self.algorithm_status(key, Algorithm::TokenBucket, &limits),
            self.algorithm_status(key, Algorithm::LeakyBucket, &limits),
        );
        StatusView::build(key, token, leaky)
    }

    /// Ping every shard and record the aggregate in the metrics collector.
    pub async fn health_snapshot(&self) -> std::collections::BTreeMap<String, bool> {
        let health = self.router.health_snapshot().await;
        let any_healthy = health.values().any(|&h| h);
        self.metrics.update_remote_health(any_healthy, self.clock.as_ref());
        health
    }

    pub async fn get_metrics(&self) -> MetricsReport {
        let shard_health = self.health_snapshot().await;
        let default_rule = self.config.read().await.default_rule;
        let sizes = self.fallback.sizes();

        MetricsReport::build(
            &self.metrics.snapshot(),
            ReportContext {
                shard_health,
                default_algorithm: self.default_algorithm.to_string(),
                default_capacity: default_rule.capacity,
                default_period: default_rule.period,
                fallback_token_buckets: sizes.token_buckets,
                fallback_leaky_buckets: sizes.leaky_buckets,
                process: ProcessStats::sample(),
                now: SystemTime::now(),
            },
        )
    }

    pub async fn get_prometheus_metrics(&self) -> ThrottlerResult<String> {
        let report = self.get_metrics().await;
        Ok(self.metrics.encode(&report)?)
    }

    /// Add or update a specific rate limit rule
    pub async fn set_rule(&self, key: String, rule: RateLimitRule) -> ThrottlerResult<()> {
        rule.validate().map_err(ThrottlerError::ValidationError)?;

        let mut config = self.config.write().await;
        config.set_rule(key, rule);
        Ok(())
    }

    /// Remove a rate limit rule
    pub async fn remove_rule(&self, key: &str) -> ThrottlerResult<Option<RateLimitRule>> {
        let mut config = self.config.write().await;
        Ok(config.remove_rule(key))
    }

    /// Get all configured rules
    pub async fn get_all_rules(&self) -> ThrottlerResult<HashMap<String, RateLimitRule>> {
        let config = self.config.read().await;
        Ok(config.rules.clone())
    }
}
