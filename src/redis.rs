use async_trait::async_trait;
use redis::aio::{Connection, MultiplexedConnection};
use redis::{Client, IntoConnectionInfo, RedisError, Script};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::config::AtomicMode;
use crate::config_validator::ConfigValidator;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::shard::{CycleRequest, Shard};

const CYCLE_SCRIPT: &str = include_str!("../scripts/bucket.lua");

/// One Redis instance acting as a shard.
///
/// The multiplexed connection is opened lazily and dropped after I/O errors,
/// so a shard that is down at startup is picked up once it comes back.
/// Compare-and-set runs on a second, dedicated connection because WATCH
/// state belongs to the connection; the lock around it keeps one
/// WATCH/MULTI/EXEC sequence on the wire at a time.
pub struct RedisShard {
    name: String,
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    transaction_connection: Mutex<Option<Connection>>,
    cycle_script: Script,
    mode: AtomicMode,
}

impl RedisShard {
    pub fn new(
        name: impl Into<String>,
        endpoint: &str,
        password: Option<&str>,
        db: i64,
        mode: AtomicMode,
    ) -> ThrottlerResult<Self> {
        let url = ConfigValidator::normalize_redis_url(endpoint);
        let mut info = url
            .as_str()
            .into_connection_info()
            .map_err(|e| ThrottlerError::ConfigurationError(format!("{}: {}", endpoint, e)))?;
        if let Some(password) = password.filter(|p| !p.is_empty()) {
            info.redis.password = Some(password.to_string());
        }
        info.redis.db = db;

        let client = Client::open(info)
            .map_err(|e| ThrottlerError::Redis(format!("Failed to create Redis client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            client,
            connection: Mutex::new(None),
            transaction_connection: Mutex::new(None),
            cycle_script: Script::new(CYCLE_SCRIPT),
            mode,
        })
    }

    async fn connection(&self) -> ThrottlerResult<MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        debug!(shard = %self.name, "opening Redis connection");
        let conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| ThrottlerError::Redis(format!("{}: failed to connect: {}", self.name, e)))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn open_transaction_connection(&self) -> ThrottlerResult<Connection> {
        debug!(shard = %self.name, "opening Redis transaction connection");
        self.client
            .get_async_connection()
            .await
            .map_err(|e| ThrottlerError::Redis(format!("{}: failed to connect: {}", self.name, e)))
    }

    async fn transact(
        &self,
        conn: &mut Connection,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, (&'static str, RedisError)> {
        redis::cmd("WATCH")
            .arg(key)
            .query_async::<_, ()>(conn)
            .await
            .map_err(|e| ("WATCH", e))?;

        let current: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(conn)
            .await
            .map_err(|e| ("GET", e))?;
        if current.as_deref() != expected {
            redis::cmd("UNWATCH")
                .query_async::<_, ()>(conn)
                .await
                .map_err(|e| ("UNWATCH", e))?;
            return Ok(false);
        }

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .ignore()
            .cmd("GET")
            .arg(key);

        // EXEC replies nil when the watched key changed underneath us.
        let committed: Option<(String,)> = pipe.query_async(conn).await.map_err(|e| ("EXEC", e))?;
        Ok(committed.is_some())
    }

    async fn fail(&self, op: &str, err: RedisError) -> ThrottlerError {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            warn!(shard = %self.name, op, error = %err, "dropping Redis connection");
            *self.connection.lock().await = None;
        }
        ThrottlerError::Redis(format!("{}: {} failed: {}", self.name, op, err))
    }
}

#[async_trait]
impl Shard for RedisShard {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_scripting(&self) -> bool {
        self.mode == AtomicMode::Script
    }

    async fn ping(&self) -> ThrottlerResult<()> {
        let mut conn = self.connection().await?;
        let pong: Result<String, RedisError> = redis::cmd("PING").query_async(&mut conn).await;
        match pong {
            Ok(reply) if reply == "PONG" => Ok(()),
            Ok(reply) => Err(ThrottlerError::Redis(format!(
                "{}: unexpected PING reply {}",
                self.name, reply
            ))),
            Err(e) => Err(self.fail("PING", e).await),
        }
    }

    async fn get(&self, key: &str) -> ThrottlerResult<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Result<Option<String>, RedisError> =
            redis::cmd("GET").arg(key).query_async(&mut conn).await;
        match value {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail("GET", e).await),
        }
    }

    async fn run_cycle(&self, cycle: &CycleRequest) -> ThrottlerResult<bool> {
        let mut conn = self.connection().await?;

        let mut invocation = self.cycle_script.prepare_invoke();
        invocation
            .key(&cycle.storage_key)
            .arg(cycle.algorithm.as_str())
            .arg(cycle.permits)
            .arg(cycle.limits.capacity)
            .arg(cycle.limits.period_nanos())
            .arg(cycle.now_nanos.to_string())
            .arg(cycle.ttl.as_secs().max(1));

        let reply: Result<(i64, i64), RedisError> = invocation.invoke_async(&mut conn).await;
        match reply {
            Ok((admitted, level)) => {
                debug!(
                    shard = %self.name,
                    key = %cycle.storage_key,
                    admitted,
                    level,
                    "bucket script executed"
                );
                Ok(admitted == 1)
            }
            Err(e) => {
                error!(shard = %self.name, key = %cycle.storage_key, error = %e, "bucket script failed");
                Err(self.fail("EVALSHA", e).await)
            }
        }
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> ThrottlerResult<bool> {
        let mut slot = self.transaction_connection.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.open_transaction_connection().await?,
        };

        match self.transact(&mut conn, key, expected, value, ttl).await {
            Ok(committed) => {
                *slot = Some(conn);
                Ok(committed)
            }
            Err((op, e)) => {
                // May still hold a WATCH or an open MULTI.
                warn!(shard = %self.name, op, error = %e, "dropping Redis transaction connection");
                Err(ThrottlerError::Redis(format!("{}: {} failed: {}", self.name, op, e)))
            }
        }
    }
}

/// Build one shard per configured endpoint, named `redis-1..redis-N`.
pub fn shards_from_endpoints(
    endpoints: &[String],
    password: Option<&str>,
    db: i64,
    mode: AtomicMode,
) -> ThrottlerResult<Vec<RedisShard>> {
    endpoints
        .iter()
        .enumerate()
        .map(|(i, endpoint)| RedisShard::new(format!("redis-{}", i + 1), endpoint, password, db, mode))
        .collect()
}
