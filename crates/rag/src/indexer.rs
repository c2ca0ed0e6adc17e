//! Keeps the vector index in step with child-detail mutations.
//!
//! Every operation on a given detail runs under that detail's lock, so an
//! update's remove+upsert pair never interleaves with another mutation of the
//! same detail. Different details index in parallel.

use nestling_core::child::{ChildDetail, DetailId};
use nestling_core::embedding::Embedder;
use nestling_core::error::{Error, IndexError};
use nestling_core::store::{IndexMapping, MappedEntry};
use nestling_core::vector::{EntryMetadata, VectorEntry, VectorIndex};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

/// Per-key async locks. Entries nobody holds are pruned on the next acquire.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let slot = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(key.clone()).or_default().clone()
        };
        slot.lock_owned().await
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// What an indexing call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    /// A fresh entry was written (and any previous one removed).
    Indexed { entry_id: String },
    /// The mapped entry already holds this revision; nothing was written.
    Current { entry_id: String },
}

impl IndexOutcome {
    pub fn entry_id(&self) -> &str {
        match self {
            Self::Indexed { entry_id } | Self::Current { entry_id } => entry_id,
        }
    }
}

/// Render a detail as the retrieval document stored in the index.
pub fn render_document(detail: &ChildDetail) -> String {
    let mut doc = format!(
        "Child Detail - Type: {}\nContent: {}\n",
        detail.detail_type, detail.content
    );
    if !detail.tags.is_empty() {
        doc.push_str(&format!("Tags: {}\n", detail.tags.join(", ")));
    }
    doc.push_str(&format!(
        "Importance: {}\nRecorded: {}\n",
        detail.importance,
        detail.recorded_at.format("%Y-%m-%d")
    ));
    doc
}

/// Entry ids are derived from (detail, revision), so re-running the same
/// revision upserts the same entry instead of adding a second one.
pub fn entry_id_for(detail: &ChildDetail) -> String {
    format!("detail-{}-r{}", detail.id, detail.revision)
}

pub struct DetailIndexer {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    mapping: Arc<dyn IndexMapping>,
    locks: KeyedLocks<DetailId>,
}

impl DetailIndexer {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        mapping: Arc<dyn IndexMapping>,
    ) -> Self {
        Self {
            embedder,
            index,
            mapping,
            locks: KeyedLocks::new(),
        }
    }

    pub fn index_name(&self) -> &str {
        self.index.name()
    }

    /// Embed and upsert `detail`, recording the entry in the mapping table.
    ///
    /// A no-op when the mapping already covers this revision.
    pub async fn index(&self, detail: &ChildDetail) -> Result<IndexOutcome, Error> {
        let _guard = self.locks.lock(&detail.id).await;
        if let Some(mapped) = self.mapping.entry_for(detail.id).await?
            && mapped.revision >= detail.revision
        {
            debug!(detail_id = %detail.id, revision = detail.revision, "Detail already indexed");
            return Ok(IndexOutcome::Current {
                entry_id: mapped.entry_id,
            });
        }
        self.write(detail).await
    }

    /// Replace the detail's entry unconditionally.
    pub async fn reindex(&self, detail: &ChildDetail) -> Result<IndexOutcome, Error> {
        let _guard = self.locks.lock(&detail.id).await;
        self.write(detail).await
    }

    /// Delete the detail's entry and forget its mapping. Returns `false` when
    /// nothing was indexed.
    pub async fn remove(&self, detail_id: DetailId) -> Result<bool, Error> {
        let _guard = self.locks.lock(&detail_id).await;
        let Some(mapped) = self.mapping.entry_for(detail_id).await? else {
            return Ok(false);
        };
        self.index.delete(&mapped.entry_id).await?;
        self.mapping.forget(detail_id).await?;
        info!(detail_id = %detail_id, entry_id = %mapped.entry_id, "Removed detail from index");
        Ok(true)
    }

    // Caller holds the detail lock.
    async fn write(&self, detail: &ChildDetail) -> Result<IndexOutcome, Error> {
        let document = render_document(detail);

        // Embed before touching the index so an embedding outage leaves the
        // previous entry serving.
        let embedding = self.embedder.embed_one(&document).await?;
        if embedding.is_empty() {
            return Err(IndexError::EmbeddingFailed("embedder returned an empty vector".into()).into());
        }

        let entry_id = entry_id_for(detail);
        let previous = self.mapping.entry_for(detail.id).await?;
        if let Some(old) = previous.as_ref().filter(|m| m.entry_id != entry_id) {
            self.index.delete(&old.entry_id).await?;
        }

        self.index
            .upsert(VectorEntry {
                id: entry_id.clone(),
                document,
                metadata: EntryMetadata::ChildDetail {
                    detail_id: detail.id,
                    child_id: detail.child_id,
                    detail_type: detail.detail_type,
                    tags: detail.tags.clone(),
                    importance: detail.importance,
                    recorded_at: detail.recorded_at,
                    revision: detail.revision,
                },
                embedding,
            })
            .await?;

        self.mapping
            .record(MappedEntry {
                detail_id: detail.id,
                child_id: detail.child_id,
                entry_id: entry_id.clone(),
                revision: detail.revision,
            })
            .await?;

        info!(
            detail_id = %detail.id,
            child_id = %detail.child_id,
            revision = detail.revision,
            replaced = previous.is_some(),
            "Indexed detail"
        );
        Ok(IndexOutcome::Indexed { entry_id })
    }
}
