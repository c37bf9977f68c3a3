//! In-process broker backend.
//!
//! Mirrors the Redis data model (strings, lists, hashes, per-key expiry) inside
//! a single mutex-guarded map. Blocking pops really block, woken by pushes.
//! Useful for development and tests; nothing survives a restart.

use super::CacheStore;
use crate::error::BrokerError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
enum Value {
    Text(String),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the map after dropping whatever expired under `key`.
    fn live(&self, key: &str) -> MutexGuard<'_, HashMap<String, Entry>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.get(key).is_some_and(|e| e.is_expired(Instant::now())) {
            entries.remove(key);
        }
        entries
    }

    fn pop_first(&self, keys: &[String]) -> Result<Option<(String, String)>, BrokerError> {
        for key in keys {
            let mut entries = self.live(key);
            if let Some(value) = pop_front(&mut entries, key)? {
                return Ok(Some((key.clone(), value)));
            }
        }
        Ok(None)
    }
}

fn wrong_type(key: &str) -> BrokerError {
    BrokerError::InvalidData(format!("key '{key}' holds a value of another type"))
}

fn pop_front(
    entries: &mut HashMap<String, Entry>,
    key: &str,
) -> Result<Option<String>, BrokerError> {
    let Some(entry) = entries.get_mut(key) else {
        return Ok(None);
    };
    let Value::List(list) = &mut entry.value else {
        return Err(wrong_type(key));
    };
    let value = list.pop_front();
    if list.is_empty() {
        entries.remove(key);
    }
    Ok(value)
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn supports_blocking(&self) -> bool {
        true
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BrokerError> {
        let mut entries = self.live(key);
        let mut entry = Entry::new(Value::Text(value.to_string()));
        entry.expires_at = ttl.map(|ttl| Instant::now() + ttl);
        entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let entries = self.live(key);
        match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Text(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, BrokerError> {
        Ok(self.live(key).remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, BrokerError> {
        Ok(self.live(key).contains_key(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BrokerError> {
        let mut entries = self.live(key);
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn push(&self, key: &str, value: &str) -> Result<u64, BrokerError> {
        let len = {
            let mut entries = self.live(key);
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
            let Value::List(list) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            list.push_back(value.to_string());
            list.len() as u64
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn pop(&self, key: &str) -> Result<Option<String>, BrokerError> {
        pop_front(&mut self.live(key), key)
    }

    async fn blocking_pop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(hit) = self.pop_first(keys)? {
                return Ok(Some(hit));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pop_first(keys);
            }
        }
    }

    async fn length(&self, key: &str) -> Result<u64, BrokerError> {
        let entries = self.live(key);
        match entries.get(key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BrokerError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| {
                key.starts_with(prefix)
                    && !entry.is_expired(now)
                    && matches!(&entry.value, Value::List(list) if !list.is_empty())
            })
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, BrokerError> {
        let mut entries = self.live(key);
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Text("0".to_string())));
        let Value::Text(text) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        let current: i64 = text
            .parse()
            .map_err(|_| BrokerError::InvalidData(format!("key '{key}' is not an integer")))?;
        let next = current
            .checked_add(delta)
            .ok_or_else(|| BrokerError::InvalidData(format!("increment of '{key}' overflows")))?;
        *text = next.to_string();
        Ok(next)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), BrokerError> {
        let mut entries = self.live(key);
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        let Value::Hash(hash) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        hash.insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError> {
        let entries = self.live(key);
        match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        let entries = self.live(key);
        match entries.get(key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, BrokerError> {
        let mut entries = self.live(key);
        let Some(entry) = entries.get_mut(key) else {
            return Ok(false);
        };
        let Value::Hash(hash) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        let removed = hash.remove(field).is_some();
        if hash.is_empty() {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn purge_expired(&self) -> Result<u64, BrokerError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        Ok((before - entries.len()) as u64)
    }
}
