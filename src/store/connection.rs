//! Pipelined store connections
//!
//! The engine's whole write path is built on explicit pipelining: queue
//! commands with `send`, transmit with `flush`, read replies in order with
//! `receive`. A connection is borrowed from the pool for one logical batch
//! and released when dropped; draining residual replies is the documented
//! precondition of starting a batch.
//!
//! The first error on a connection is sticky. Every later operation returns
//! the stored error without touching the wire, so batch code can ignore
//! intermediate errors and check once at the end.

use crate::error::StoreError;
use crate::store::command::{int_reply, Command, Reply};
use crate::store::util::{connection_error, describe_redis_error, sanitize_url};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::debug;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the store connection pool
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Store URL, e.g. `redis://:password@host:6379`
    pub url: String,

    /// Maximum concurrently borrowed connections
    /// Default: 1000
    pub max_active: usize,

    /// Timeout for establishing the connection
    /// Default: 10 seconds
    pub connect_timeout: Duration,

    /// Timeout for one pipelined round trip
    /// Default: 10 seconds
    pub command_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            max_active: 1000,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(10),
        }
    }
}

impl StoreConfig {
    /// Build a config from a bare `host:port` address and optional password
    pub fn for_addr(addr: &str, password: Option<&str>) -> Self {
        let url = match password {
            Some(pass) if !pass.is_empty() => format!("redis://:{pass}@{addr}"),
            _ => format!("redis://{addr}"),
        };
        Self {
            url,
            ..Default::default()
        }
    }

    /// Set the maximum number of concurrently borrowed connections
    pub fn max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active;
        self
    }

    /// Set the per-round-trip command timeout
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("store URL cannot be empty".to_string());
        }
        if self.max_active == 0 {
            return Err("max_active must be greater than 0".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Pipeline trait
// ============================================================================

/// One borrowed, exclusively owned pipelined connection.
///
/// Replies arrive in request order; callers materialize their iteration
/// order before queuing and use the same order when receiving.
#[async_trait]
pub trait Pipeline: Send {
    /// Append a command to the outbound batch.
    ///
    /// Queuing never fails; a sticky error surfaces at the next `flush`,
    /// `receive` or `drain`.
    fn send(&mut self, cmd: Command);

    /// Transmit the queued batch and buffer its replies
    async fn flush(&mut self) -> Result<(), StoreError>;

    /// Take the next buffered reply
    async fn receive(&mut self) -> Result<Reply, StoreError>;

    /// Transmit anything still queued and discard every buffered reply.
    ///
    /// Batches call this first so an earlier aborted batch cannot misalign
    /// this one's request/reply pairing.
    async fn drain(&mut self) -> Result<(), StoreError>;

    /// Send one command and return its reply
    async fn do_cmd(&mut self, cmd: Command) -> Result<Reply, StoreError> {
        self.send(cmd);
        self.flush().await?;
        self.receive().await
    }

    /// Take the next reply decoded as `(value, found)`
    async fn receive_int(&mut self) -> Result<(i64, bool), StoreError> {
        int_reply(self.receive().await?)
    }
}

/// Hands out pipelined connections
#[async_trait]
pub trait Store: Send + Sync {
    /// Borrow a connection for one logical batch
    async fn pipeline(&self) -> Result<Box<dyn Pipeline>, StoreError>;
}

// ============================================================================
// Redis-backed store
// ============================================================================

/// Connection pool over one multiplexed store connection.
///
/// The client multiplexes requests internally; the semaphore bounds how many
/// batches may be in flight, standing in for a max-active connection count.
pub struct RedisStore {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    semaphore: Arc<Semaphore>,
    config: StoreConfig,
}

impl RedisStore {
    /// Connect and authenticate, failing fast when the store is unreachable.
    ///
    /// Initialisation performs the first dial and a `PING`; startup treats
    /// any failure here as fatal.
    pub async fn connect(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate().map_err(StoreError::Connection)?;

        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::Connection(connection_error(&config.url, describe_redis_error(&e))))?;

        let store = Self {
            client,
            connection: RwLock::new(None),
            semaphore: Arc::new(Semaphore::new(config.max_active)),
            config,
        };

        store.establish().await?;
        store.ping().await?;
        debug!(url = %sanitize_url(&store.config.url), "store connection established");
        Ok(store)
    }

    /// Dial a fresh multiplexed connection and install it
    async fn establish(&self) -> Result<MultiplexedConnection, StoreError> {
        let dial = self.client.get_multiplexed_async_connection();
        let conn = tokio::time::timeout(self.config.connect_timeout, dial)
            .await
            .map_err(|_| StoreError::Timeout("connect".to_string()))?
            .map_err(|e| self.classify(e))?;

        let mut guard = self.connection.write().await;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Current connection, dialing if none is installed
    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        if let Some(conn) = self.connection.read().await.clone() {
            return Ok(conn);
        }
        self.establish().await
    }

    /// Health-check the connection with a `PING`
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut pipe = self.pipeline().await?;
        match pipe.do_cmd(Command::Ping).await? {
            Reply::Status(s) if s == "PONG" => Ok(()),
            other => Err(StoreError::Protocol(format!(
                "unexpected PING reply: {other:?}"
            ))),
        }
    }

    fn classify(&self, err: redis::RedisError) -> StoreError {
        if err.kind() == redis::ErrorKind::AuthenticationFailed {
            StoreError::Auth(connection_error(&self.config.url, "authentication failed"))
        } else if err.is_timeout() {
            StoreError::Timeout(describe_redis_error(&err).to_string())
        } else if err.is_connection_dropped() || err.is_io_error() {
            StoreError::Connection(connection_error(
                &self.config.url,
                describe_redis_error(&err),
            ))
        } else {
            StoreError::Protocol(describe_redis_error(&err).to_string())
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn pipeline(&self) -> Result<Box<dyn Pipeline>, StoreError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Connection("connection pool closed".to_string()))?;
        let conn = self.connection().await?;
        Ok(Box::new(RedisPipeline {
            conn,
            _permit: permit,
            pending: Vec::new(),
            replies: VecDeque::new(),
            err: None,
            command_timeout: self.config.command_timeout,
            url: self.config.url.clone(),
        }))
    }
}

// ============================================================================
// Redis pipeline
// ============================================================================

struct RedisPipeline {
    conn: MultiplexedConnection,
    _permit: OwnedSemaphorePermit,
    pending: Vec<Command>,
    replies: VecDeque<Reply>,
    err: Option<StoreError>,
    command_timeout: Duration,
    url: String,
}

impl RedisPipeline {
    fn sticky(&mut self, err: StoreError) -> StoreError {
        if self.err.is_none() {
            self.err = Some(err.clone());
        }
        err
    }

    fn convert(value: redis::Value) -> Result<Reply, StoreError> {
        use redis::Value;
        Ok(match value {
            Value::Nil => Reply::Nil,
            Value::Int(v) => Reply::Int(v),
            Value::BulkString(bytes) => Reply::Data(bytes),
            Value::SimpleString(s) => Reply::Status(s),
            Value::Okay => Reply::Status("OK".to_string()),
            Value::Array(items) | Value::Set(items) => Reply::Array(
                items
                    .into_iter()
                    .map(Self::convert)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            other => {
                return Err(StoreError::Decode(format!(
                    "value of unknown type returned from store: {other:?}"
                )))
            }
        })
    }

    fn build(commands: &[Command]) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        for cmd in commands {
            match cmd {
                Command::Get(key) => pipe.cmd("GET").arg(key),
                Command::GetSet(key, val) => pipe.cmd("GETSET").arg(key).arg(val),
                Command::Set(key, val) => pipe.cmd("SET").arg(key).arg(val),
                Command::IncrBy(key, delta) => pipe.cmd("INCRBY").arg(key).arg(delta),
                Command::ExpireAt(key, at) => pipe.cmd("EXPIREAT").arg(key).arg(at),
                Command::SAdd(key, members) => pipe.cmd("SADD").arg(key).arg(members),
                Command::SRem(key, members) => pipe.cmd("SREM").arg(key).arg(members),
                Command::SMembers(key) => pipe.cmd("SMEMBERS").arg(key),
                Command::SCard(key) => pipe.cmd("SCARD").arg(key),
                Command::Ping => pipe.cmd("PING"),
            };
        }
        pipe
    }
}

#[async_trait]
impl Pipeline for RedisPipeline {
    fn send(&mut self, cmd: Command) {
        if self.err.is_some() {
            return;
        }
        self.pending.push(cmd);
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if self.pending.is_empty() {
            return Ok(());
        }

        let pipe = Self::build(&self.pending);
        let query = pipe.query_async::<Vec<redis::Value>>(&mut self.conn);
        let values = match tokio::time::timeout(self.command_timeout, query).await {
            Err(_) => {
                return Err(self.sticky(StoreError::Timeout("pipeline flush".to_string())));
            }
            Ok(Err(e)) => {
                let err = if e.is_timeout() {
                    StoreError::Timeout(describe_redis_error(&e).to_string())
                } else if e.is_connection_dropped() || e.is_io_error() {
                    StoreError::Connection(connection_error(&self.url, describe_redis_error(&e)))
                } else {
                    StoreError::Protocol(describe_redis_error(&e).to_string())
                };
                return Err(self.sticky(err));
            }
            Ok(Ok(values)) => values,
        };

        self.pending.clear();
        for value in values {
            match Self::convert(value) {
                Ok(reply) => self.replies.push_back(reply),
                Err(e) => return Err(self.sticky(e)),
            }
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Reply, StoreError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        match self.replies.pop_front() {
            Some(reply) => Ok(reply),
            None => Err(self.sticky(StoreError::Protocol(
                "receive with no buffered reply".to_string(),
            ))),
        }
    }

    async fn drain(&mut self) -> Result<(), StoreError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        self.flush().await?;
        self.replies.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.max_active, 1000);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_for_addr_embeds_password() {
        let config = StoreConfig::for_addr("stats.example.com:6379", Some("sekret"));
        assert_eq!(config.url, "redis://:sekret@stats.example.com:6379");

        let config = StoreConfig::for_addr("localhost:6379", None);
        assert_eq!(config.url, "redis://localhost:6379");
    }

    #[test]
    fn config_validation() {
        let config = StoreConfig {
            url: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = StoreConfig::default().max_active(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn pipeline_builds_expected_commands() {
        // Spot-check that command construction does not panic and keeps order
        let pipe = RedisPipeline::build(&[
            Command::GetSet("counter:detail:id1:counterA".into(), 50),
            Command::ExpireAt("gauge:detail:id1:gaugeA:60".into(), 1000),
            Command::SAdd("key:counter".into(), vec!["counterA".into()]),
        ]);
        assert_eq!(pipe.cmd_iter().count(), 3);
    }

    #[test]
    fn convert_maps_reply_shapes() {
        use redis::Value;
        assert_eq!(RedisPipeline::convert(Value::Nil).unwrap(), Reply::Nil);
        assert_eq!(RedisPipeline::convert(Value::Int(3)).unwrap(), Reply::Int(3));
        assert_eq!(
            RedisPipeline::convert(Value::BulkString(b"50".to_vec())).unwrap(),
            Reply::Data(b"50".to_vec())
        );
        assert_eq!(
            RedisPipeline::convert(Value::Okay).unwrap(),
            Reply::Status("OK".to_string())
        );
        assert!(RedisPipeline::convert(Value::Double(1.5)).is_err());
    }
}
