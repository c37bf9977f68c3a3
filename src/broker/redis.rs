//! Redis-backed broker store.

use super::CacheStore;
use crate::error::BrokerError;
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::Client;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    manager: Arc<Mutex<Option<ConnectionManager>>>,
    /// Idle connections reserved for BLPOP, one per concurrent blocking pop.
    blocking: Arc<std::sync::Mutex<Vec<MultiplexedConnection>>>,
    connect_timeout: Duration,
}

impl RedisStore {
    /// Parses the URL only; the connection is opened lazily on first use.
    pub fn new(redis_url: &str, connect_timeout: Duration) -> Result<Self, BrokerError> {
        let client = Client::open(redis_url)?;
        Ok(Self {
            client,
            manager: Default::default(),
            blocking: Default::default(),
            connect_timeout,
        })
    }

    async fn conn(&self) -> Result<ConnectionManager, BrokerError> {
        let mut manager = self.manager.lock().await;
        if let Some(conn) = manager.as_ref() {
            return Ok(conn.clone());
        }
        let conn = timeout(self.connect_timeout, ConnectionManager::new(self.client.clone()))
            .await
            .map_err(|_| {
                BrokerError::Unavailable(format!(
                    "timed out after {:?} connecting to redis",
                    self.connect_timeout
                ))
            })??;
        info!("Connected to redis");
        *manager = Some(conn.clone());
        Ok(conn)
    }

    /// A blocked BLPOP stalls every command pipelined behind it, so blocking
    /// pops never share the command connection.
    async fn blocking_conn(&self) -> Result<MultiplexedConnection, BrokerError> {
        let idle = self
            .blocking
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        if let Some(conn) = idle {
            return Ok(conn);
        }
        let conn = timeout(
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            BrokerError::Unavailable(format!(
                "timed out after {:?} connecting to redis",
                self.connect_timeout
            ))
        })??;
        debug!("Opened blocking redis connection");
        Ok(conn)
    }

    fn release_blocking_conn(&self, conn: MultiplexedConnection) {
        self.blocking
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(conn);
    }
}

/// Escapes glob metacharacters for a SCAN `MATCH` pattern.
fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("client", &"<Client>")
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn supports_blocking(&self) -> bool {
        true
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn delete(&self, key: &str) -> Result<bool, BrokerError> {
        let mut conn = self.conn().await?;
        let removed: u64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, BrokerError> {
        let mut conn = self.conn().await?;
        let found: u64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(found > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BrokerError> {
        let mut conn = self.conn().await?;
        let applied: u64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn push(&self, key: &str, value: &str) -> Result<u64, BrokerError> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?)
    }

    async fn pop(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("LPOP").arg(key).query_async(&mut conn).await?)
    }

    async fn blocking_pop(
        &self,
        keys: &[String],
        wait: Duration,
    ) -> Result<Option<(String, String)>, BrokerError> {
        if keys.is_empty() {
            return Ok(None);
        }
        // BLPOP with a zero timeout would wait forever.
        if wait.is_zero() {
            for key in keys {
                if let Some(value) = self.pop(key).await? {
                    return Ok(Some((key.clone(), value)));
                }
            }
            return Ok(None);
        }
        let mut conn = self.blocking_conn().await?;
        debug!(?keys, ?wait, "BLPOP");
        let mut cmd = redis::cmd("BLPOP");
        cmd.arg(keys).arg(wait.as_secs_f64());
        // The server gives up after `wait`; anything longer is a dead link.
        let reply = timeout(
            wait + self.connect_timeout,
            cmd.query_async::<_, Option<(String, String)>>(&mut conn),
        )
        .await;
        match reply {
            Ok(Ok(popped)) => {
                self.release_blocking_conn(conn);
                Ok(popped)
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(BrokerError::Unavailable(format!(
                "BLPOP got no reply within {:?}",
                wait + self.connect_timeout
            ))),
        }
    }

    async fn length(&self, key: &str) -> Result<u64, BrokerError> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("LLEN").arg(key).query_async(&mut conn).await?)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn().await?;
        let pattern = format!("{}*", glob_escape(prefix));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .arg("TYPE")
                .arg("list")
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may report a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, BrokerError> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await?)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let _: u64 = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, BrokerError> {
        let mut conn = self.conn().await?;
        let removed: u64 = redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn purge_expired(&self) -> Result<u64, BrokerError> {
        // Redis evicts expired keys on its own.
        Ok(0)
    }
}
