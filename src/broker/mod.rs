//! Key/list/hash primitives with transparent fallback.
//!
//! The [`Broker`] routes every call to the fast backend (Redis) while it is
//! reachable and to the fallback backend (PostgreSQL tables) otherwise. Callers
//! never see the fast backend going away: the failure is logged, the connected
//! flag drops, and the same call is replayed against the fallback. The fast
//! backend is pinged again at most once per reconnect interval; once it answers,
//! list items queued on the fallback meanwhile are moved over before traffic
//! switches back. Command errors (wrong type, not an integer) are not outages
//! and reach the caller unchanged.
//!
//! Blocking pops only block on backends that support it. On the PostgreSQL
//! fallback a "blocking" pop is a single non-blocking check, so consumers
//! running in fallback mode must sleep between empty polls themselves
//! (see [`Broker::blocking_available`]).

use crate::error::BrokerError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub mod memory;
pub mod postgres;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::postgres::PgCacheStore;
pub use self::redis::RedisStore;

/// Primitive operations shared by every broker backend.
///
/// Keys handed to a store are already namespaced by the [`Broker`].
#[async_trait]
pub trait CacheStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether `blocking_pop` actually waits for an item.
    fn supports_blocking(&self) -> bool;

    async fn ping(&self) -> Result<(), BrokerError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BrokerError>;
    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError>;
    async fn delete(&self, key: &str) -> Result<bool, BrokerError>;
    async fn exists(&self, key: &str) -> Result<bool, BrokerError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BrokerError>;

    /// Appends to the tail of a list, returning its new length.
    async fn push(&self, key: &str, value: &str) -> Result<u64, BrokerError>;
    /// Removes from the head of a list without waiting.
    async fn pop(&self, key: &str) -> Result<Option<String>, BrokerError>;
    /// Pops from the first non-empty list in `keys`, waiting up to `timeout` where supported.
    async fn blocking_pop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, BrokerError>;
    async fn length(&self, key: &str) -> Result<u64, BrokerError>;
    /// Keys of the non-empty lists starting with `prefix`.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BrokerError>;

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, BrokerError>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), BrokerError>;
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError>;
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, BrokerError>;
    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, BrokerError>;

    /// Deletes entries past their expiry, returning how many were removed.
    async fn purge_expired(&self) -> Result<u64, BrokerError>;
}

macro_rules! route {
    ($self:ident, $op:expr, |$store:ident| $call:expr) => {{
        if let Some($store) = $self.primary().await {
            match $call.await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_unavailable() => $self.degrade($op, &err),
                Err(err) => return Err(err),
            }
        }
        let $store = &$self.fallback;
        $call.await
    }};
}

pub struct Broker {
    primary: Option<Arc<dyn CacheStore>>,
    fallback: Arc<dyn CacheStore>,
    prefix: String,
    reconnect_interval: Duration,
    connected: AtomicBool,
    last_ping: Mutex<Option<Instant>>,
}

impl Broker {
    pub fn new(
        primary: Option<Arc<dyn CacheStore>>,
        fallback: Arc<dyn CacheStore>,
        prefix: impl Into<String>,
        reconnect_interval: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            prefix: prefix.into(),
            reconnect_interval,
            connected: AtomicBool::new(false),
            last_ping: Mutex::new(None),
        }
    }

    /// A broker that only ever talks to `store`.
    pub fn single(store: Arc<dyn CacheStore>, prefix: impl Into<String>) -> Self {
        Self::new(None, store, prefix, Duration::ZERO)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Last known state of the fast backend. Does not ping it.
    pub fn is_connected(&self) -> bool {
        self.primary.is_some() && self.connected.load(Ordering::Acquire)
    }

    /// Whether `blocking_pop` currently waits, or returns after a single check.
    pub fn blocking_available(&self) -> bool {
        match &self.primary {
            Some(primary) if self.is_connected() => primary.supports_blocking(),
            _ => self.fallback.supports_blocking(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    fn strip<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.prefix.as_str())
            .and_then(|k| k.strip_prefix(':'))
            .unwrap_or(key)
    }

    /// The fast backend, if it is believed to be up. Pings it lazily when it is not.
    async fn primary(&self) -> Option<Arc<dyn CacheStore>> {
        let primary = self.primary.as_ref()?;
        if self.connected.load(Ordering::Acquire) {
            return Some(primary.clone());
        }
        if !self.ping_due() {
            return None;
        }
        if let Err(err) = primary.ping().await {
            debug!(backend = primary.name(), error = %err, "Liveness ping failed");
            return None;
        }
        match self.drain_fallback(primary).await {
            Ok(moved) => {
                self.connected.store(true, Ordering::Release);
                info!(
                    backend = primary.name(),
                    moved,
                    "Fast broker backend is reachable"
                );
                Some(primary.clone())
            }
            Err(err) => {
                warn!(
                    backend = primary.name(),
                    error = %err,
                    "Failed to move queued items off the fallback, staying on it"
                );
                None
            }
        }
    }

    /// Moves list items queued on the fallback while the fast backend was down
    /// onto the fast backend, keeping their order.
    async fn drain_fallback(&self, primary: &Arc<dyn CacheStore>) -> Result<u64, BrokerError> {
        let keys = self.fallback.list_keys(&self.key("")).await?;
        let mut moved = 0;
        for key in keys {
            while let Some(value) = self.fallback.pop(&key).await? {
                if let Err(err) = primary.push(&key, &value).await {
                    self.fallback.push(&key, &value).await?;
                    return Err(err);
                }
                moved += 1;
            }
        }
        Ok(moved)
    }

    fn ping_due(&self) -> bool {
        let mut last_ping = self.last_ping.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match *last_ping {
            Some(at) if now.duration_since(at) < self.reconnect_interval => false,
            _ => {
                *last_ping = Some(now);
                true
            }
        }
    }

    fn degrade(&self, op: &str, err: &BrokerError) {
        if self.connected.swap(false, Ordering::AcqRel) {
            *self.last_ping.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        }
        warn!(
            operation = op,
            error = %err,
            fallback = self.fallback.name(),
            "Fast broker backend failed, using fallback"
        );
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BrokerError> {
        let key = self.key(key);
        route!(self, "set", |store| store.set(&key, value, ttl))
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let key = self.key(key);
        route!(self, "get", |store| store.get(&key))
    }

    pub async fn delete(&self, key: &str) -> Result<bool, BrokerError> {
        let key = self.key(key);
        route!(self, "delete", |store| store.delete(&key))
    }

    pub async fn exists(&self, key: &str) -> Result<bool, BrokerError> {
        let key = self.key(key);
        route!(self, "exists", |store| store.exists(&key))
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BrokerError> {
        let key = self.key(key);
        route!(self, "expire", |store| store.expire(&key, ttl))
    }

    pub async fn push(&self, key: &str, value: &str) -> Result<u64, BrokerError> {
        let key = self.key(key);
        route!(self, "push", |store| store.push(&key, value))
    }

    pub async fn pop(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let key = self.key(key);
        route!(self, "pop", |store| store.pop(&key))
    }

    /// Pops from the first non-empty list, in the order given. Returns the un-prefixed key.
    pub async fn blocking_pop<S: AsRef<str>>(
        &self,
        keys: &[S],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, BrokerError> {
        let keys: Vec<String> = keys.iter().map(|k| self.key(k.as_ref())).collect();
        let popped = self.routed_blocking_pop(&keys, timeout).await?;
        Ok(popped.map(|(key, value)| (self.strip(&key).to_string(), value)))
    }

    async fn routed_blocking_pop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, BrokerError> {
        route!(self, "blocking_pop", |store| store.blocking_pop(keys, timeout))
    }

    pub async fn length(&self, key: &str) -> Result<u64, BrokerError> {
        let key = self.key(key);
        route!(self, "length", |store| store.length(&key))
    }

    pub async fn incr(&self, key: &str) -> Result<i64, BrokerError> {
        let key = self.key(key);
        route!(self, "incr", |store| store.incr_by(&key, 1))
    }

    pub async fn decr(&self, key: &str) -> Result<i64, BrokerError> {
        let key = self.key(key);
        route!(self, "decr", |store| store.incr_by(&key, -1))
    }

    pub async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), BrokerError> {
        let key = self.key(key);
        route!(self, "hash_set", |store| store.hash_set(&key, field, value))
    }

    pub async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError> {
        let key = self.key(key);
        route!(self, "hash_get", |store| store.hash_get(&key, field))
    }

    pub async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        let key = self.key(key);
        route!(self, "hash_get_all", |store| store.hash_get_all(&key))
    }

    pub async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, BrokerError> {
        let key = self.key(key);
        route!(self, "hash_delete", |store| store.hash_delete(&key, field))
    }

    /// Sweeps expired entries from the fallback backend.
    pub async fn purge_expired(&self) -> Result<u64, BrokerError> {
        self.fallback.purge_expired().await
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("primary", &self.primary.as_ref().map(|p| p.name()))
            .field("fallback", &self.fallback.name())
            .field("prefix", &self.prefix)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}
