use super::{SqliteStore, query_failed};
use async_trait::async_trait;
use chrono::Utc;
use nestling_core::cache::CacheStore;
use nestling_core::error::StoreError;
use sqlx::Row;
use std::time::Duration;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry(ttl: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

impl SqliteStore {
    /// Drop expired cache rows. Reads already ignore them; this only reclaims space.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(now_ms())
            .execute(&self.pool)
            .await
            .map_err(query_failed("purge cache"))?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl CacheStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query("SELECT value FROM cache_entries WHERE key = ? AND expires_at > ?")
            .bind(key.to_string())
            .bind(now_ms())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed("cache get"))?;
        row.map(|r| r.try_get::<Vec<u8>, _>("value"))
            .transpose()
            .map_err(query_failed("value column"))
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        scope: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, scope, expires_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                scope = excluded.scope,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key.to_string())
        .bind(value)
        .bind(scope.map(String::from))
        .bind(expiry(ttl))
        .execute(&self.pool)
        .await
        .map_err(query_failed("cache put"))?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        scope: Option<&str>,
    ) -> Result<Vec<u8>, StoreError> {
        let now = now_ms();
        let mut tx = self.pool.begin().await.map_err(query_failed("begin"))?;
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, scope, expires_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                scope = excluded.scope,
                expires_at = excluded.expires_at
            WHERE cache_entries.expires_at <= ?
            "#,
        )
        .bind(key.to_string())
        .bind(value)
        .bind(scope.map(String::from))
        .bind(expiry(ttl))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(query_failed("cache put_if_absent"))?;

        let row = sqlx::query("SELECT value FROM cache_entries WHERE key = ?")
            .bind(key.to_string())
            .fetch_one(&mut *tx)
            .await
            .map_err(query_failed("cache read back"))?;
        let stored: Vec<u8> = row.try_get("value").map_err(query_failed("value column"))?;
        tx.commit().await.map_err(query_failed("commit"))?;
        Ok(stored)
    }

    async fn invalidate_scope(&self, scope: &str) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE scope = ?")
            .bind(scope.to_string())
            .execute(&self.pool)
            .await
            .map_err(query_failed("invalidate scope"))?;
        Ok(result.rows_affected() as usize)
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM cache_entries")
            .execute(&self.pool)
            .await
            .map_err(query_failed("clear cache"))?;
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    async fn store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn put_get_and_first_writer_wins() {
        let store = store().await;
        assert!(store.get("k").await.unwrap().is_none());

        let first = store.put_if_absent("k", b"one".to_vec(), HOUR, Some("c1")).await.unwrap();
        let second = store.put_if_absent("k", b"two".to_vec(), HOUR, Some("c1")).await.unwrap();
        assert_eq!(first, b"one");
        assert_eq!(second, b"one");
        assert_eq!(store.get("k").await.unwrap(), Some(b"one".to_vec()));
    }

    #[tokio::test]
    async fn expired_rows_are_invisible_and_replaceable() {
        let store = store().await;
        store.put("k", b"old".to_vec(), Duration::ZERO, None).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());

        let stored = store.put_if_absent("k", b"new".to_vec(), HOUR, None).await.unwrap();
        assert_eq!(stored, b"new");

        store.put("gone", vec![1], Duration::ZERO, None).await.unwrap();
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scoped_invalidation() {
        let store = store().await;
        store.put("a", vec![1], HOUR, Some("child-a")).await.unwrap();
        store.put("b", vec![2], HOUR, Some("child-b")).await.unwrap();
        assert_eq!(store.invalidate_scope("child-a").await.unwrap(), 1);
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("b").await.unwrap().is_some());
        assert_eq!(store.clear().await.unwrap(), 1);
    }
}
