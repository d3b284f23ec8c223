use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::throttler::Throttler;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub redis: ServiceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
    pub instances: BTreeMap<String, bool>,
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

pub struct HealthChecker {
    throttler: Arc<Throttler>,
}

impl HealthChecker {
    pub fn new(throttler: Arc<Throttler>) -> Self {
        // uptime counts from here
        let _ = *START_TIME;
        Self { throttler }
    }

    /// Admission keeps working while shards are down, so a partial or total
    /// shard outage is reported as "degraded", never as unhealthy.
    pub async fn check_health(&self) -> HealthStatus {
        let redis_status = self.check_redis().await;

        let overall_status = if redis_status.status == "healthy" {
            "healthy"
        } else {
            "degraded"
        };

        let now = SystemTime::now();
        HealthStatus {
            status: overall_status.to_string(),
            timestamp: now
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: now.duration_since(*START_TIME).unwrap_or_default().as_secs(),
            dependencies: DependencyStatus {
                redis: redis_status,
            },
        }
    }

    async fn check_redis(&self) -> ServiceStatus {
        let start = Instant::now();
        let instances = self.throttler.health_snapshot().await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        let down: Vec<&str> = instances
            .iter()
            .filter(|(_, healthy)| !**healthy)
            .map(|(name, _)| name.as_str())
            .collect();

        let (status, error) = if down.is_empty() {
            ("healthy", None)
        } else if down.len() == instances.len() {
            ("unavailable", Some("no Redis shard reachable; using local fallback".to_string()))
        } else {
            ("partial", Some(format!("unreachable shards: {}", down.join(", "))))
        };

        ServiceStatus {
            status: status.to_string(),
            response_time_ms,
            error,
            instances,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::shard::{MemoryShard, Shard};
    use crate::throttler::ThrottlerSettings;

    fn checker(shards: &[Arc<MemoryShard>]) -> HealthChecker {
        let shards = shards.iter().map(|s| s.clone() as Arc<dyn Shard>).collect();
        let throttler = Throttler::new(shards, ThrottlerSettings::default(), Arc::new(ManualClock::default())).unwrap();
        HealthChecker::new(Arc::new(throttler))
    }

    #[tokio::test]
    async fn test_all_shards_up() {
        let shards = vec![Arc::new(MemoryShard::scripted("redis-1"))];
        let status = checker(&shards).check_health().await;
        assert_eq!(status.status, "healthy");
        assert_eq!(status.dependencies.redis.instances.get("redis-1"), Some(&true));
        assert!(status.dependencies.redis.error.is_none());
    }

    #[tokio::test]
    async fn test_partial_outage_is_degraded() {
        let shards = vec![
            Arc::new(MemoryShard::scripted("redis-1")),
            Arc::new(MemoryShard::scripted("redis-2")),
        ];
        shards[1].set_available(false);

        let status = checker(&shards).check_health().await;
        assert_eq!(status.status, "degraded");
        assert_eq!(status.dependencies.redis.status, "partial");
        assert!(status.dependencies.redis.error.unwrap().contains("redis-2"));
    }

    #[tokio::test]
    async fn test_total_outage_is_still_degraded() {
        let shards = vec![Arc::new(MemoryShard::scripted("redis-1"))];
        shards[0].set_available(false);

        let status = checker(&shards).check_health().await;
        assert_eq!(status.status, "degraded");
        assert_eq!(status.dependencies.redis.status, "unavailable");
    }

    #[test]
    fn test_health_status_serialization() {
        let status = HealthStatus {
            status: "healthy".to_string(),
            timestamp: 1234567890,
            version: "1.0.0".to_string(),
            uptime_seconds: 3600,
            dependencies: DependencyStatus {
                redis: ServiceStatus {
                    status: "healthy".to_string(),
                    response_time_ms: 5,
                    error: None,
                    instances: BTreeMap::new(),
                },
            },
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("healthy"));
        assert!(json.contains("1234567890"));
    }
}
