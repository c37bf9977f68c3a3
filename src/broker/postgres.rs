//! PostgreSQL fallback for the broker primitives.
//!
//! Plain values live in `broker_cache`, one row per key with an optional
//! expiry. Lists are normalized into `broker_list_items`, one row per element
//! ordered by a sequence column, so pushes and pops from concurrent workers
//! never rewrite each other's data; a pop claims its row with
//! `FOR UPDATE SKIP LOCKED`. Hash fields get one row each in
//! `broker_hash_fields`.
//!
//! Expiry applies to plain values only. There is no blocking pop: a
//! `blocking_pop` is a single non-blocking check over the given lists.

use super::CacheStore;
use crate::error::BrokerError;
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct PgCacheStore {
    pool: Arc<PgPool>,
}

impl PgCacheStore {
    /// The tables are created by [`DbHandle::new`](crate::db::DbHandle::new).
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

fn millis(ttl: Duration) -> i64 {
    ttl.as_millis().min(i64::MAX as u128) as i64
}

#[async_trait]
impl CacheStore for PgCacheStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn supports_blocking(&self) -> bool {
        false
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        sqlx::query("SELECT 1").execute(&*self.pool).await?;
        Ok(())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BrokerError> {
        sqlx::query(
            "INSERT INTO broker_cache (cache_key, cache_value, expires_at, updated_at) \
            VALUES ($1, $2, now() + $3::bigint * interval '1 millisecond', now()) \
            ON CONFLICT (cache_key) DO UPDATE \
                SET cache_value = EXCLUDED.cache_value, \
                expires_at = EXCLUDED.expires_at, \
                updated_at = now()",
        )
        .bind(key)
        .bind(value)
        .bind(ttl.map(millis))
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let row: Option<(String, bool)> = sqlx::query_as(
            "SELECT cache_value, (expires_at IS NOT NULL AND expires_at <= now()) \
            FROM broker_cache \
            WHERE cache_key = $1",
        )
        .bind(key)
        .fetch_optional(&*self.pool)
        .await?;

        match row {
            Some((_, true)) => {
                debug!(key, "Dropping expired cache entry");
                sqlx::query(
                    "DELETE FROM broker_cache \
                    WHERE cache_key = $1 AND expires_at <= now()",
                )
                .bind(key)
                .execute(&*self.pool)
                .await?;
                Ok(None)
            }
            Some((value, false)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, BrokerError> {
        let removed: i64 = sqlx::query_scalar(
            "WITH c AS (DELETE FROM broker_cache WHERE cache_key = $1 RETURNING 1), \
                l AS (DELETE FROM broker_list_items WHERE list_key = $1 RETURNING 1), \
                h AS (DELETE FROM broker_hash_fields WHERE hash_key = $1 RETURNING 1) \
            SELECT (SELECT count(*) FROM c) + (SELECT count(*) FROM l) + (SELECT count(*) FROM h)",
        )
        .bind(key)
        .fetch_one(&*self.pool)
        .await?;

        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, BrokerError> {
        Ok(sqlx::query_scalar(
            "SELECT EXISTS ( \
                SELECT 1 FROM broker_cache \
                WHERE cache_key = $1 AND (expires_at IS NULL OR expires_at > now()) \
            ) \
            OR EXISTS (SELECT 1 FROM broker_list_items WHERE list_key = $1) \
            OR EXISTS (SELECT 1 FROM broker_hash_fields WHERE hash_key = $1)",
        )
        .bind(key)
        .fetch_one(&*self.pool)
        .await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BrokerError> {
        let result = sqlx::query(
            "UPDATE broker_cache \
                SET expires_at = now() + $2::bigint * interval '1 millisecond', \
                updated_at = now() \
            WHERE cache_key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .bind(millis(ttl))
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn push(&self, key: &str, value: &str) -> Result<u64, BrokerError> {
        let len: i64 = sqlx::query_scalar(
            "WITH pushed AS ( \
                INSERT INTO broker_list_items (list_key, item_value) VALUES ($1, $2) RETURNING id \
            ) \
            SELECT count(*) + 1 FROM broker_list_items WHERE list_key = $1",
        )
        .bind(key)
        .bind(value)
        .fetch_one(&*self.pool)
        .await?;

        Ok(len as u64)
    }

    async fn pop(&self, key: &str) -> Result<Option<String>, BrokerError> {
        Ok(sqlx::query_scalar(
            "DELETE FROM broker_list_items \
            WHERE id = ( \
                SELECT id FROM broker_list_items \
                WHERE list_key = $1 \
                ORDER BY id \
                LIMIT 1 \
                FOR UPDATE SKIP LOCKED \
            ) \
            RETURNING item_value",
        )
        .bind(key)
        .fetch_optional(&*self.pool)
        .await?)
    }

    async fn blocking_pop(
        &self,
        keys: &[String],
        _timeout: Duration,
    ) -> Result<Option<(String, String)>, BrokerError> {
        if keys.is_empty() {
            return Ok(None);
        }
        Ok(sqlx::query_as(
            "DELETE FROM broker_list_items \
            WHERE id = ( \
                SELECT id FROM broker_list_items \
                WHERE list_key = ANY($1) \
                ORDER BY array_position($1, list_key), id \
                LIMIT 1 \
                FOR UPDATE SKIP LOCKED \
            ) \
            RETURNING list_key, item_value",
        )
        .bind(keys)
        .fetch_optional(&*self.pool)
        .await?)
    }

    async fn length(&self, key: &str) -> Result<u64, BrokerError> {
        let len: i64 =
            sqlx::query_scalar("SELECT count(*) FROM broker_list_items WHERE list_key = $1")
                .bind(key)
                .fetch_one(&*self.pool)
                .await?;
        Ok(len as u64)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BrokerError> {
        Ok(sqlx::query_scalar(
            "SELECT DISTINCT list_key FROM broker_list_items \
            WHERE left(list_key, length($1)) = $1 \
            ORDER BY list_key",
        )
        .bind(prefix)
        .fetch_all(&*self.pool)
        .await?)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, BrokerError> {
        Ok(sqlx::query_scalar(
            "INSERT INTO broker_cache (cache_key, cache_value, expires_at, updated_at) \
            VALUES ($1, $2::bigint::text, NULL, now()) \
            ON CONFLICT (cache_key) DO UPDATE \
                SET cache_value = ( \
                    CASE WHEN broker_cache.expires_at <= now() THEN 0 \
                    ELSE broker_cache.cache_value::bigint END + $2::bigint \
                )::text, \
                expires_at = CASE WHEN broker_cache.expires_at <= now() THEN NULL \
                    ELSE broker_cache.expires_at END, \
                updated_at = now() \
            RETURNING cache_value::bigint",
        )
        .bind(key)
        .bind(delta)
        .fetch_one(&*self.pool)
        .await?)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), BrokerError> {
        sqlx::query(
            "INSERT INTO broker_hash_fields (hash_key, field, field_value, updated_at) \
            VALUES ($1, $2, $3, now()) \
            ON CONFLICT (hash_key, field) DO UPDATE \
                SET field_value = EXCLUDED.field_value, \
                updated_at = now()",
        )
        .bind(key)
        .bind(field)
        .bind(value)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError> {
        Ok(sqlx::query_scalar(
            "SELECT field_value FROM broker_hash_fields WHERE hash_key = $1 AND field = $2",
        )
        .bind(key)
        .bind(field)
        .fetch_optional(&*self.pool)
        .await?)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT field, field_value FROM broker_hash_fields WHERE hash_key = $1",
        )
        .bind(key)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, BrokerError> {
        let result =
            sqlx::query("DELETE FROM broker_hash_fields WHERE hash_key = $1 AND field = $2")
                .bind(key)
                .bind(field)
                .execute(&*self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self) -> Result<u64, BrokerError> {
        let result = sqlx::query(
            "DELETE FROM broker_cache WHERE expires_at IS NOT NULL AND expires_at <= now()",
        )
        .execute(&*self.pool)
        .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            debug!(purged, "Purged expired cache entries");
        }
        Ok(purged)
    }
}
