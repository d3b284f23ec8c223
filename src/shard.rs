//! Backend shard abstraction.
//!
//! A shard is one instance of the shared store. It must offer either a
//! server-side atomic cycle (`run_cycle`) or a conditional write
//! (`compare_and_set`); the executor picks whichever the shard supports.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::algorithms::{Algorithm, BucketLimits, StoredRecord};
use crate::error::{ThrottlerError, ThrottlerResult};

/// One admission cycle, shipped to a shard to run atomically.
#[derive(Debug, Clone)]
pub struct CycleRequest {
    pub storage_key: String,
    pub algorithm: Algorithm,
    pub limits: BucketLimits,
    pub permits: u64,
    pub now_nanos: u64,
    pub ttl: Duration,
}

#[async_trait]
pub trait Shard: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `run_cycle` is available on this shard.
    fn supports_scripting(&self) -> bool;

    async fn ping(&self) -> ThrottlerResult<()>;

    async fn get(&self, key: &str) -> ThrottlerResult<Option<String>>;

    /// Read, transition and write one bucket as a single indivisible step.
    /// Returns whether the request was admitted.
    async fn run_cycle(&self, cycle: &CycleRequest) -> ThrottlerResult<bool>;

    /// Write `value` only if the key still holds `expected` (`None` = absent).
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> ThrottlerResult<bool>;
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    ttl: Duration,
}

/// Shard held in process memory.
///
/// Behaves like a Redis instance for the purposes of the executor: it can be
/// taken down, slowed down, and told to lose compare-and-set races.
#[derive(Debug)]
pub struct MemoryShard {
    name: String,
    scripting: bool,
    entries: Mutex<HashMap<String, MemoryEntry>>,
    available: AtomicBool,
    delay_nanos: AtomicU64,
    forced_conflicts: AtomicU32,
}

impl MemoryShard {
    /// Shard that runs whole cycles under one lock.
    pub fn scripted(name: impl Into<String>) -> Self {
        Self::with_mode(name, true)
    }

    /// Shard that only offers get and compare-and-set.
    pub fn compare_and_set_only(name: impl Into<String>) -> Self {
        Self::with_mode(name, false)
    }

    fn with_mode(name: impl Into<String>, scripting: bool) -> Self {
        Self {
            name: name.into(),
            scripting,
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            delay_nanos: AtomicU64::new(0),
            forced_conflicts: AtomicU32::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every operation, to exercise caller timeouts.
    pub fn set_delay(&self, delay: Duration) {
        let nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
        self.delay_nanos.store(nanos, Ordering::SeqCst);
    }

    /// Make the next `count` compare-and-set calls report a lost race.
    pub fn force_conflicts(&self, count: u32) {
        self.forced_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.lock().ok()?.get(key).map(|e| e.value.clone())
    }

    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.lock().ok()?.get(key).map(|e| e.ttl)
    }

    pub fn insert_raw(&self, key: &str, value: &str) {
        if let Ok(mut entries) = self.lock() {
            entries.insert(
                key.to_string(),
                MemoryEntry {
                    value: value.to_string(),
                    ttl: Duration::ZERO,
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn enter(&self) -> ThrottlerResult<()> {
        let delay = self.delay_nanos.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_nanos(delay)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(ThrottlerError::Redis(format!(
                "{}: connection refused",
                self.name
            )));
        }
        Ok(())
    }

    fn lock(&self) -> ThrottlerResult<std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>>> {
        self.entries
            .lock()
            .map_err(|_| ThrottlerError::InternalError("memory shard lock poisoned".into()))
    }
}

#[async_trait]
impl Shard for MemoryShard {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_scripting(&self) -> bool {
        self.scripting
    }

    async fn ping(&self) -> ThrottlerResult<()> {
        self.enter().await
    }

    async fn get(&self, key: &str) -> ThrottlerResult<Option<String>> {
        self.enter().await?;
        Ok(self.lock()?.get(key).map(|e| e.value.clone()))
    }

    async fn run_cycle(&self, cycle: &CycleRequest) -> ThrottlerResult<bool> {
        if !self.scripting {
            return Err(ThrottlerError::InternalError(format!(
                "{} does not support scripted cycles",
                self.name
            )));
        }
        self.enter().await?;

        let engine = cycle.algorithm.engine();
        let mut entries = self.lock()?;
        let current = entries
            .get(&cycle.storage_key)
            .and_then(|e| StoredRecord::decode(&e.value, cycle.algorithm))
            .map(|r| r.into_state().with_limits(&cycle.limits))
            .unwrap_or_else(|| engine.fresh(&cycle.limits, cycle.now_nanos));

        let transition = engine.apply(&current, cycle.permits as i64, cycle.now_nanos);
        if transition.persist {
            let value = StoredRecord::from_state(&transition.state, cycle.now_nanos).encode()?;
            entries.insert(
                cycle.storage_key.clone(),
                MemoryEntry {
                    value,
                    ttl: cycle.ttl,
                },
            );
        }
        Ok(transition.admitted)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> ThrottlerResult<bool> {
        self.enter().await?;

        let pending = self.forced_conflicts.load(Ordering::SeqCst);
        if pending > 0 {
            self.forced_conflicts.store(pending - 1, Ordering::SeqCst);
            return Ok(false);
        }

        let mut entries = self.lock()?;
        let current = entries.get(key).map(|e| e.value.as_str());
        if current != expected {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                ttl,
            },
        );
        Ok(true)
    }
}
