//! Key-value cache store with TTL and scope tags.
//!
//! Values are opaque bytes; the response cache serializes its own payloads and
//! treats anything it cannot decode as a miss. Entries carry an optional
//! scope tag (a child id) so all answers about one child can be invalidated
//! at once.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a live (unexpired) value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Insert or overwrite.
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        scope: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Insert only if no live value exists. Returns the value now stored:
    /// either `value` or the one that was already there.
    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        scope: Option<&str>,
    ) -> Result<Vec<u8>, StoreError>;

    /// Remove every entry tagged with `scope`. Returns how many were removed.
    async fn invalidate_scope(&self, scope: &str) -> Result<usize, StoreError>;

    /// Remove every entry.
    async fn clear(&self) -> Result<usize, StoreError>;
}
