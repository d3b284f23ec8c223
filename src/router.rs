use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ThrottlerError, ThrottlerResult};
use crate::shard::Shard;

/// A key's shard, as picked by [`ShardRouter::resolve`].
#[derive(Clone)]
pub struct ResolvedShard {
    pub index: usize,
    pub shard: Arc<dyn Shard>,
}

/// Fixed-slot router: `crc32(key) mod N` over a shard list that never
/// changes after startup. Changing N remaps keys wholesale.
#[derive(Clone)]
pub struct ShardRouter {
    shards: Vec<Arc<dyn Shard>>,
    health_timeout: Duration,
}

impl ShardRouter {
    pub fn new(shards: Vec<Arc<dyn Shard>>, health_timeout: Duration) -> ThrottlerResult<Self> {
        if shards.is_empty() {
            return Err(ThrottlerError::ConfigurationError(
                "at least one shard is required".to_string(),
            ));
        }
        Ok(Self {
            shards,
            health_timeout,
        })
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn shards(&self) -> &[Arc<dyn Shard>] {
        &self.shards
    }

    pub fn shard_index(&self, key: &str) -> usize {
        crc32fast::hash(key.as_bytes()) as usize % self.shards.len()
    }

    pub fn resolve(&self, key: &str) -> Option<ResolvedShard> {
        let index = self.shard_index(key);
        let shard = self.shards.get(index)?.clone();
        debug!(key, shard = shard.name(), "resolved shard");
        Some(ResolvedShard { index, shard })
    }

    /// Ping every shard concurrently. Not cached; each call hits the network.
    pub async fn health_snapshot(&self) -> BTreeMap<String, bool> {
        let pings = self.shards.iter().map(|shard| async move {
            let healthy = match tokio::time::timeout(self.health_timeout, shard.ping()).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!(shard = shard.name(), error = %e, "shard health check failed");
                    false
                }
                Err(_) => {
                    warn!(shard = shard.name(), timeout = ?self.health_timeout, "shard health check timed out");
                    false
                }
            };
            (shard.name().to_string(), healthy)
        });

        join_all(pings).await.into_iter().collect()
    }

    /// How many of `keys` land on each shard.
    pub fn distribution<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = self
            .shards
            .iter()
            .map(|shard| (shard.name().to_string(), 0))
            .collect();
        for key in keys {
            let name = self.shards[self.shard_index(key)].name();
            if let Some(count) = counts.get_mut(name) {
                *count += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::MemoryShard;

    fn router(n: usize) -> (ShardRouter, Vec<Arc<MemoryShard>>) {
        let shards: Vec<Arc<MemoryShard>> = (1..=n)
            .map(|i| Arc::new(MemoryShard::scripted(format!("redis-{}", i))))
            .collect();
        let dyn_shards = shards.iter().map(|s| s.clone() as Arc<dyn Shard>).collect();
        (ShardRouter::new(dyn_shards, Duration::from_millis(100)).unwrap(), shards)
    }

    #[test]
    fn test_empty_shard_list_is_rejected() {
        let err = ShardRouter::new(Vec::new(), Duration::from_secs(1)).err().unwrap();
        assert!(matches!(err, ThrottlerError::ConfigurationError(_)));
    }

    #[test]
    fn test_hash_is_crc32_ieee() {
        // check value of the IEEE polynomial
        assert_eq!(crc32fast::hash(b"123456789"), 0xCBF4_3926);
        let (two, _) = router(2);
        let (three, _) = router(3);
        assert_eq!(two.shard_index("123456789"), 0);
        assert_eq!(three.shard_index("123456789"), 2);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let (router, _) = router(3);
        for key in ["alice", "bob", "tenant:42", ""] {
            let first = router.resolve(key).unwrap().index;
            for _ in 0..10 {
                assert_eq!(router.resolve(key).unwrap().index, first);
            }
        }
    }

    #[test]
    fn test_distribution_covers_every_shard() {
        let (router, _) = router(3);
        let keys: Vec<String> = (0..300).map(|i| format!("user-{}", i)).collect();
        let counts = router.distribution(keys.iter().map(String::as_str));
        assert_eq!(counts.len(), 3);
        assert_eq!(counts.values().sum::<usize>(), 300);
        assert!(counts.values().all(|&c| c > 0));
    }

    #[tokio::test]
    async fn test_health_snapshot_reports_each_shard() {
        let (router, shards) = router(3);
        shards[1].set_available(false);
        shards[2].set_delay(Duration::from_secs(2));

        let health = router.health_snapshot().await;
        assert_eq!(health.get("redis-1"), Some(&true));
        assert_eq!(health.get("redis-2"), Some(&false));
        assert_eq!(health.get("redis-3"), Some(&false));
    }
}
