//! In-process TTL cache store.
//!
//! Expiry uses `tokio::time::Instant`, so paused-clock tests can advance past
//! a TTL without sleeping.

use async_trait::async_trait;
use nestling_core::cache::CacheStore;
use nestling_core::error::StoreError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct Slot {
    value: Vec<u8>,
    scope: Option<String>,
    expires_at: Instant,
}

impl Slot {
    fn live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Clone, Default)]
pub struct InMemoryCacheStore {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.slots.lock().await.values().filter(|s| s.live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Overwrite a raw value, keeping its scope and expiry. Test hook for
    /// simulating a corrupted payload.
    pub async fn corrupt(&self, key: &str, value: Vec<u8>) -> bool {
        match self.slots.lock().await.get_mut(key) {
            Some(slot) => {
                slot.value = value;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = Instant::now();
        let mut slots = self.slots.lock().await;
        match slots.get(key) {
            Some(slot) if slot.live(now) => Ok(Some(slot.value.clone())),
            Some(_) => {
                slots.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        scope: Option<&str>,
    ) -> Result<(), StoreError> {
        self.slots.lock().await.insert(
            key.to_string(),
            Slot {
                value,
                scope: scope.map(String::from),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        scope: Option<&str>,
    ) -> Result<Vec<u8>, StoreError> {
        let now = Instant::now();
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get(key).filter(|s| s.live(now)) {
            return Ok(slot.value.clone());
        }
        slots.insert(
            key.to_string(),
            Slot {
                value: value.clone(),
                scope: scope.map(String::from),
                expires_at: now + ttl,
            },
        );
        Ok(value)
    }

    async fn invalidate_scope(&self, scope: &str) -> Result<usize, StoreError> {
        let mut slots = self.slots.lock().await;
        let before = slots.len();
        slots.retain(|_, s| s.scope.as_deref() != Some(scope));
        Ok(before - slots.len())
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        let mut slots = self.slots.lock().await;
        let n = slots.len();
        slots.clear();
        Ok(n)
    }
}
