//! Answer cache with single-flight coalescing.
//!
//! Entries are keyed by a fingerprint of the normalized question, the scope,
//! the context digest and the model, and tagged with that scope for bulk
//! invalidation. Answers about a child live in `child:<id>`; answers without a
//! child are kept per asking user in `user:<id>`, since their prompt carries
//! that user's conversation.
//!
//! Concurrent callers with the same fingerprint share one computation. The
//! in-flight table holds weak handles, so when every caller waiting on a
//! computation goes away (cancelled request) the computation is dropped and
//! the next caller starts fresh.
//!
//! Each scope carries an epoch. A computation snapshots the epoch when it
//! starts and only writes its result if no invalidation happened meanwhile,
//! so an answer generated from pre-mutation context is never stored after
//! the mutation's invalidation.

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use nestling_config::CacheConfig;
use nestling_core::cache::CacheStore;
use nestling_core::child::{ChildId, UserId};
use nestling_core::error::Error;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// The cached payload: a finalized answer and its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAnswer {
    pub answer: String,
    pub citations: Vec<String>,
    pub model: String,
    #[serde(default)]
    pub context_limited: bool,
}

/// How [`ResponseCache::get_or_compute`] produced its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Computed,
    /// Joined a computation another caller started.
    Coalesced,
}

type Computation = Shared<BoxFuture<'static, Result<CachedAnswer, Arc<Error>>>>;
type PendingComputation = WeakShared<BoxFuture<'static, Result<CachedAnswer, Arc<Error>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Epoch {
    global: u64,
    scope: u64,
}

#[derive(Default)]
struct Epochs {
    global: u64,
    scopes: HashMap<String, u64>,
}

struct Inner {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    enabled: bool,
    inflight: Mutex<HashMap<String, PendingComputation>>,
    epochs: Mutex<Epochs>,
}

impl Inner {
    fn epoch(&self, scope: &str) -> Epoch {
        let epochs = self.epochs.lock().unwrap_or_else(|e| e.into_inner());
        Epoch {
            global: epochs.global,
            scope: epochs.scopes.get(scope).copied().unwrap_or(0),
        }
    }

    /// Write `answer` unless `scope` was invalidated since `started`. Returns
    /// the value that ends up cached, which may be an earlier writer's.
    async fn store(&self, key: &str, scope: &str, started: Epoch, answer: CachedAnswer) -> CachedAnswer {
        if self.epoch(scope) != started {
            debug!(scope, "Scope invalidated during generation, answer not cached");
            return answer;
        }
        let bytes = match serde_json::to_vec(&answer) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cache encode failed, answer not cached: {e}");
                return answer;
            }
        };
        match self.store.put_if_absent(key, bytes, self.ttl, Some(scope)).await {
            Ok(stored) => serde_json::from_slice(&stored).unwrap_or(answer),
            Err(e) => {
                warn!(scope, "Cache write failed: {e}");
                answer
            }
        }
    }
}

/// Cheap to clone; clones share the store and in-flight table.
#[derive(Clone)]
pub struct ResponseCache {
    inner: Arc<Inner>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self::build(store, ttl, true)
    }

    pub fn from_config(store: Arc<dyn CacheStore>, config: &CacheConfig) -> Self {
        Self::build(store, config.ttl(), config.enabled)
    }

    fn build(store: Arc<dyn CacheStore>, ttl: Duration, enabled: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                ttl,
                enabled,
                inflight: Mutex::new(HashMap::new()),
                epochs: Mutex::new(Epochs::default()),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// Stable hash of (normalized question, scope, context digest, model).
    /// The scope names the child, or the user when there is none.
    pub fn fingerprint(question: &str, scope: &str, context_digest: &str, model: &str) -> String {
        let mut hasher = Sha256::new();
        for part in [normalize_question(question).as_str(), scope, context_digest, model] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// The scope of an answer asked by `user_id`, about `child_id` if given.
    pub fn scope_for(child_id: Option<ChildId>, user_id: UserId) -> String {
        match child_id {
            Some(id) => Self::child_scope(id),
            None => format!("user:{user_id}"),
        }
    }

    pub fn child_scope(child_id: ChildId) -> String {
        format!("child:{child_id}")
    }

    /// Cached answer for `fingerprint`. Unreadable entries are misses.
    pub async fn lookup(&self, fingerprint: &str) -> Option<CachedAnswer> {
        if !self.inner.enabled {
            return None;
        }
        match self.inner.store.get(fingerprint).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(answer) => Some(answer),
                Err(e) => {
                    warn!(fingerprint, "Corrupt cache entry treated as miss: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(fingerprint, "Cache read failed, treating as miss: {e}");
                None
            }
        }
    }

    /// Return the cached answer, or run `compute` once for all concurrent
    /// callers with this fingerprint and cache its success.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: &str,
        scope: &str,
        compute: F,
    ) -> Result<(CachedAnswer, CacheStatus), Arc<Error>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<CachedAnswer, Error>> + Send + 'static,
    {
        if let Some(answer) = self.lookup(fingerprint).await {
            debug!(fingerprint, "Cache hit");
            return Ok((answer, CacheStatus::Hit));
        }

        let (computation, status) = {
            let mut inflight = self.inner.inflight.lock().unwrap_or_else(|e| e.into_inner());
            // Computations whose callers all gave up never reach their own cleanup.
            inflight.retain(|_, pending| pending.upgrade().is_some());
            match inflight.get(fingerprint).and_then(WeakShared::upgrade) {
                Some(running) => (running, CacheStatus::Coalesced),
                None => {
                    let computation = self.start(fingerprint, scope, compute());
                    if let Some(weak) = computation.downgrade() {
                        inflight.insert(fingerprint.to_string(), weak);
                    }
                    (computation, CacheStatus::Computed)
                }
            }
        };

        if status == CacheStatus::Coalesced {
            debug!(fingerprint, "Joined in-flight generation");
        }
        computation.await.map(|answer| (answer, status))
    }

    fn start<Fut>(&self, fingerprint: &str, scope: &str, work: Fut) -> Computation
    where
        Fut: Future<Output = Result<CachedAnswer, Error>> + Send + 'static,
    {
        let inner = self.inner.clone();
        let key = fingerprint.to_string();
        let scope = scope.to_string();
        let started = inner.epoch(&scope);

        async move {
            let result = match work.await {
                Ok(answer) if inner.enabled => Ok(inner.store(&key, &scope, started, answer).await),
                Ok(answer) => Ok(answer),
                Err(e) => Err(Arc::new(e)),
            };
            inner
                .inflight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
            result
        }
        .boxed()
        .shared()
    }

    /// Drop every answer scoped to `child_id` and fence off in-flight ones.
    pub async fn invalidate_child(&self, child_id: ChildId) -> usize {
        let scope = Self::child_scope(child_id);
        {
            let mut epochs = self.inner.epochs.lock().unwrap_or_else(|e| e.into_inner());
            *epochs.scopes.entry(scope.clone()).or_default() += 1;
        }
        match self.inner.store.invalidate_scope(&scope).await {
            Ok(removed) => {
                debug!(child_id = %child_id, removed, "Cache invalidated for child");
                removed
            }
            Err(e) => {
                warn!(child_id = %child_id, "Cache invalidation failed: {e}");
                0
            }
        }
    }

    /// Drop every cached answer. Used when shared knowledge changes.
    pub async fn invalidate_all(&self) -> usize {
        {
            let mut epochs = self.inner.epochs.lock().unwrap_or_else(|e| e.into_inner());
            epochs.global += 1;
        }
        match self.inner.store.clear().await {
            Ok(removed) => {
                info!(removed, "Response cache cleared");
                removed
            }
            Err(e) => {
                warn!("Cache clear failed: {e}");
                0
            }
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.inner.inflight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Fingerprints with a computation currently running.
    pub fn inflight(&self) -> usize {
        self.inner
            .inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|w| w.upgrade().is_some())
            .count()
    }
}

/// Trim, lowercase and collapse internal whitespace.
pub fn normalize_question(question: &str) -> String {
    question
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}
