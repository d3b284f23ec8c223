use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};
use sysinfo::{Pid, System};

use crate::clock::{to_system_time, Clock};

/// How a single admission request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Allowed,
    RateLimited,
    Error,
}

const LATENCY_BUCKETS: [f64; 11] = [
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5,
];

/// Process-wide counters on the admission hot path, held in a private
/// Prometheus registry so several throttlers can live in one process.
///
/// Averages and rates are derived from the histograms when a snapshot is taken.
#[derive(Debug)]
pub struct MetricsCollector {
    registry: Registry,
    started: Instant,
    started_at: SystemTime,
    requests: IntCounter,
    successful: IntCounter,
    rate_limited: IntCounter,
    errors: IntCounter,
    request_duration: Histogram,
    redis_duration: Histogram,
    redis_errors: IntCounter,
    fallback_decisions: IntCounter,
    redis_up: IntGauge,
    last_health_check_nanos: AtomicU64,
    // refreshed from the report on every scrape
    shard_healthy: IntGaugeVec,
    fallback_buckets: IntGaugeVec,
    requests_per_second: Gauge,
    uptime_seconds: IntGauge,
    resident_bytes: IntGauge,
    virtual_bytes: IntGauge,
    alive_tasks: IntGauge,
}

impl MetricsCollector {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let gauge = |name: &str, help: &str| -> Result<IntGauge, prometheus::Error> {
            let g = IntGauge::new(name, help)?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };
        let histogram = |name: &str, help: &str| -> Result<Histogram, prometheus::Error> {
            let h = Histogram::with_opts(
                HistogramOpts::new(name, help).buckets(LATENCY_BUCKETS.to_vec()),
            )?;
            registry.register(Box::new(h.clone()))?;
            Ok(h)
        };
        let gauge_vec = |name: &str, help: &str, label: &str| -> Result<IntGaugeVec, prometheus::Error> {
            let v = IntGaugeVec::new(Opts::new(name, help), &[label])?;
            registry.register(Box::new(v.clone()))?;
            Ok(v)
        };

        let requests = counter("rate_limiter_requests_total", "Total number of admission requests")?;
        let successful = counter("rate_limiter_requests_successful_total", "Requests admitted")?;
        let rate_limited = counter(
            "rate_limiter_requests_rate_limited_total",
            "Requests refused for lack of capacity",
        )?;
        let errors = counter("rate_limiter_requests_errors_total", "Requests rejected as invalid or failed")?;
        let request_duration = histogram(
            "rate_limiter_request_duration_seconds",
            "Admission decision latency in seconds",
        )?;
        let redis_duration = histogram(
            "rate_limiter_redis_duration_seconds",
            "Redis call latency in seconds",
        )?;
        let redis_errors = counter("rate_limiter_redis_errors_total", "Redis calls that failed or timed out")?;
        let fallback_decisions = counter(
            "rate_limiter_fallback_decisions_total",
            "Admission decisions taken without Redis",
        )?;
        let redis_up = gauge("rate_limiter_redis_up", "Whether any Redis shard answered the last health check")?;
        redis_up.set(1);

        let shard_healthy = gauge_vec(
            "rate_limiter_redis_healthy",
            "Whether a Redis shard answered its last health check",
            "shard",
        )?;
        let fallback_buckets = gauge_vec(
            "rate_limiter_fallback_buckets",
            "Buckets held by the in-process fallback",
            "algorithm",
        )?;
        let requests_per_second = Gauge::new(
            "rate_limiter_requests_per_second",
            "Average request rate since start",
        )?;
        registry.register(Box::new(requests_per_second.clone()))?;
        let uptime_seconds = gauge("rate_limiter_uptime_seconds", "Seconds since the service started")?;
        let resident_bytes = gauge("rate_limiter_memory_resident_bytes", "Resident set size in bytes")?;
        let virtual_bytes = gauge("rate_limiter_memory_virtual_bytes", "Virtual memory size in bytes")?;
        let alive_tasks = gauge("rate_limiter_alive_tasks", "Tasks alive on the async runtime")?;

        Ok(Self {
            registry,
            started: Instant::now(),
            started_at: SystemTime::now(),
            requests,
            successful,
            rate_limited,
            errors,
            request_duration,
            redis_duration,
            redis_errors,
            fallback_decisions,
            redis_up,
            last_health_check_nanos: AtomicU64::new(0),
            shard_healthy,
            fallback_buckets,
            requests_per_second,
            uptime_seconds,
            resident_bytes,
            virtual_bytes,
            alive_tasks,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_request(&self, outcome: RequestOutcome, elapsed: Duration) {
        self.requests.inc();
        match outcome {
            RequestOutcome::Allowed => self.successful.inc(),
            RequestOutcome::RateLimited => self.rate_limited.inc(),
            RequestOutcome::Error => self.errors.inc(),
        }
        self.request_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_remote_latency(&self, elapsed: Duration) {
        self.redis_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_remote_error(&self) {
        self.redis_errors.inc();
    }

    /// A decision was taken by the in-process fallback.
    pub fn record_fallback(&self) {
        self.fallback_decisions.inc();
    }

    pub fn update_remote_health(&self, healthy: bool, clock: &dyn Clock) {
        self.redis_up.set(i64::from(healthy));
        self.last_health_check_nanos
            .store(clock.now_nanos(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self.started.elapsed();
        let total = self.requests.get();
        let last_check = self.last_health_check_nanos.load(Ordering::Relaxed);

        let secs = uptime.as_secs_f64();
        let requests_per_sec = if secs > 0.0 { total as f64 / secs } else { 0.0 };

        MetricsSnapshot {
            started_at: self.started_at,
            uptime,
            total_requests: total,
            successful_requests: self.successful.get(),
            rate_limited_requests: self.rate_limited.get(),
            error_requests: self.errors.get(),
            requests_per_sec,
            avg_response_time_ms: average_ms(&self.request_duration),
            remote_requests: self.redis_duration.get_sample_count(),
            remote_errors: self.redis_errors.get(),
            avg_remote_latency_ms: average_ms(&self.redis_duration),
            remote_healthy: self.redis_up.get() != 0,
            last_health_check: (last_check > 0).then(|| to_system_time(last_check)),
            fallback_decisions: self.fallback_decisions.get(),
        }
    }

    /// Prometheus text exposition of the registry, with the scrape-time
    /// gauges taken from `report`.
    pub fn encode(&self, report: &MetricsReport) -> Result<String, prometheus::Error> {
        self.shard_healthy.reset();
        for (shard, healthy) in &report.redis.instances {
            self.shard_healthy
                .with_label_values(&[shard.as_str()])
                .set(i64::from(*healthy));
        }
        self.fallback_buckets
            .with_label_values(&["token_bucket"])
            .set(saturating_i64(report.rate_limiter.fallback_token_buckets as u64));
        self.fallback_buckets
            .with_label_values(&["leaky_bucket"])
            .set(saturating_i64(report.rate_limiter.fallback_leaky_buckets as u64));
        self.requests_per_second.set(report.requests.rate_per_sec);
        self.uptime_seconds
            .set(saturating_i64(report.service.uptime.as_secs()));
        if let Some(bytes) = report.memory.resident_bytes {
            self.resident_bytes.set(saturating_i64(bytes));
        }
        if let Some(bytes) = report.memory.virtual_bytes {
            self.virtual_bytes.set(saturating_i64(bytes));
        }
        if let Some(tasks) = report.performance.alive_tasks {
            self.alive_tasks.set(saturating_i64(tasks as u64));
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn average_ms(histogram: &Histogram) -> f64 {
    let count = histogram.get_sample_count();
    if count == 0 {
        0.0
    } else {
        histogram.get_sample_sum() / count as f64 * 1000.0
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Point-in-time view of the collector with derived values filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub started_at: SystemTime,
    pub uptime: Duration,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub rate_limited_requests: u64,
    pub error_requests: u64,
    pub requests_per_sec: f64,
    pub avg_response_time_ms: f64,
    pub remote_requests: u64,
    pub remote_errors: u64,
    pub avg_remote_latency_ms: f64,
    pub remote_healthy: bool,
    pub last_health_check: Option<SystemTime>,
    pub fallback_decisions: u64,
}

/// Memory and scheduler figures for this process.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessStats {
    pub resident_bytes: Option<u64>,
    pub virtual_bytes: Option<u64>,
    /// Always zero; kept so dashboards built on the field keep working.
    pub gc_runs: u64,
    pub runtime_workers: Option<usize>,
    pub alive_tasks: Option<usize>,
}

impl ProcessStats {
    pub fn sample() -> Self {
        let mut system = System::new();
        let pid = Pid::from(std::process::id() as usize);
        system.refresh_process(pid);
        let memory = system
            .process(pid)
            .map(|process| (process.memory(), process.virtual_memory()));

        let runtime = tokio::runtime::Handle::try_current().ok().map(|h| h.metrics());

        Self {
            resident_bytes: memory.map(|(resident, _)| resident),
            virtual_bytes: memory.map(|(_, virt)| virt),
            gc_runs: 0,
            runtime_workers: runtime.as_ref().map(|m| m.num_workers()),
            alive_tasks: runtime.as_ref().map(|m| m.num_alive_tasks()),
        }
    }
}

fn to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceSection {
    pub name: String,
    pub version: String,
    #[serde(with = "humantime_serde")]
    pub started_at: SystemTime,
    #[serde(with = "humantime_serde")]
    pub uptime: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestSection {
    pub total: u64,
    pub successful: u64,
    pub rate_limited: u64,
    pub errors: u64,
    pub rate_per_sec: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSection {
    pub avg_response_time_ms: f64,
    pub runtime_workers: Option<usize>,
    pub alive_tasks: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedisSection {
    pub healthy: bool,
    #[serde(with = "humantime_serde")]
    pub last_health_check: Option<SystemTime>,
    pub avg_latency_ms: f64,
    pub total_redis_requests: u64,
    pub redis_errors: u64,
    pub instances: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSection {
    pub instances: usize,
    pub healthy_instances: usize,
    pub using_fallback: bool,
    pub default_algorithm: String,
    pub default_capacity: u64,
    #[serde(with = "humantime_serde")]
    pub default_period: Duration,
    pub fallback_token_buckets: usize,
    pub fallback_leaky_buckets: usize,
    pub fallback_decisions: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemorySection {
    pub resident_mb: Option<f64>,
    pub virtual_mb: Option<f64>,
    #[serde(skip)]
    pub resident_bytes: Option<u64>,
    #[serde(skip)]
    pub virtual_bytes: Option<u64>,
    pub gc_runs: u64,
}

/// Full metrics document served as JSON and rendered as Prometheus text.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub service: ServiceSection,
    pub requests: RequestSection,
    pub performance: PerformanceSection,
    pub redis: RedisSection,
    pub rate_limiter: RateLimiterSection,
    pub memory: MemorySection,
    #[serde(with = "humantime_serde")]
    pub timestamp: SystemTime,
}

/// Everything outside the collector that goes into a report.
#[derive(Debug, Clone)]
pub struct ReportContext {
    pub shard_health: BTreeMap<String, bool>,
    pub default_algorithm: String,
    pub default_capacity: u64,
    pub default_period: Duration,
    pub fallback_token_buckets: usize,
    pub fallback_leaky_buckets: usize,
    pub process: ProcessStats,
    pub now: SystemTime,
}

impl MetricsReport {
    pub fn build(snapshot: &MetricsSnapshot, ctx: ReportContext) -> Self {
        let healthy_instances = ctx.shard_health.values().filter(|&&h| h).count();
        let instances = ctx.shard_health.len();

        Self {
            service: ServiceSection {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                started_at: snapshot.started_at,
                uptime: Duration::from_secs(snapshot.uptime.as_secs()),
            },
            requests: RequestSection {
                total: snapshot.total_requests,
                successful: snapshot.successful_requests,
                rate_limited: snapshot.rate_limited_requests,
                errors: snapshot.error_requests,
                rate_per_sec: snapshot.requests_per_sec,
            },
            performance: PerformanceSection {
                avg_response_time_ms: snapshot.avg_response_time_ms,
                runtime_workers: ctx.process.runtime_workers,
                alive_tasks: ctx.process.alive_tasks,
            },
            redis: RedisSection {
                healthy: snapshot.remote_healthy,
                last_health_check: snapshot.last_health_check,
                avg_latency_ms: snapshot.avg_remote_latency_ms,
                total_redis_requests: snapshot.remote_requests,
                redis_errors: snapshot.remote_errors,
                instances: ctx.shard_health,
            },
            rate_limiter: RateLimiterSection {
                instances,
                healthy_instances,
                using_fallback: healthy_instances == 0,
                default_algorithm: ctx.default_algorithm,
                default_capacity: ctx.default_capacity,
                default_period: ctx.default_period,
                fallback_token_buckets: ctx.fallback_token_buckets,
                fallback_leaky_buckets: ctx.fallback_leaky_buckets,
                fallback_decisions: snapshot.fallback_decisions,
            },
            memory: MemorySection {
                resident_mb: ctx.process.resident_bytes.map(to_mb),
                virtual_mb: ctx.process.virtual_bytes.map(to_mb),
                resident_bytes: ctx.process.resident_bytes,
                virtual_bytes: ctx.process.virtual_bytes,
                gc_runs: ctx.process.gc_runs,
            },
            timestamp: ctx.now,
        }
    }
}
