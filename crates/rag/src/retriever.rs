//! Tenant-scoped similarity search over child details and shared knowledge.

use nestling_core::cancel::CancelToken;
use nestling_core::child::ChildId;
use nestling_core::embedding::Embedder;
use nestling_core::error::{Error, IndexError};
use nestling_core::vector::{ScopeFilter, ScoredEntry, VectorIndex};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Output of [`Retriever::retrieve`].
#[derive(Debug, Clone, Default)]
pub struct Retrieved {
    /// Details owned by the scoped child, best first.
    pub details: Vec<ScoredEntry>,
    /// Shared knowledge segments, best first.
    pub knowledge: Vec<ScoredEntry>,
    /// Retrieval failed or timed out and the lists above are empty.
    pub degraded: bool,
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    timeout: Duration,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>, timeout: Duration) -> Self {
        Self {
            embedder,
            index,
            timeout,
        }
    }

    /// Ranked search within `scope`. Errors propagate; callers that want the
    /// degrading behaviour use [`Retriever::retrieve`].
    pub async fn search(
        &self,
        scope: &ScopeFilter,
        query: &str,
        k: usize,
        token: &CancelToken,
    ) -> Result<Vec<ScoredEntry>, Error> {
        let token = token.narrowed(self.timeout);
        let embedding = token.run(self.embedder.embed_one(query)).await??;
        let hits = token.run(self.index.query(&embedding, scope, k)).await??;
        Ok(enforce_scope(scope, hits, k))
    }

    /// Fetch detail facts for `child_id` and shared knowledge concurrently,
    /// embedding the question once. Failures and timeouts degrade to an
    /// empty result.
    pub async fn retrieve(
        &self,
        child_id: Option<ChildId>,
        query: &str,
        k_details: usize,
        k_knowledge: usize,
        token: &CancelToken,
    ) -> Retrieved {
        let started = Instant::now();
        match self.try_retrieve(child_id, query, k_details, k_knowledge, token).await {
            Ok(retrieved) => {
                debug!(
                    details = retrieved.details.len(),
                    knowledge = retrieved.knowledge.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Retrieval complete"
                );
                retrieved
            }
            Err(e) => {
                warn!(
                    child_id = ?child_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Retrieval degraded to empty context: {e}"
                );
                Retrieved {
                    degraded: true,
                    ..Default::default()
                }
            }
        }
    }

    async fn try_retrieve(
        &self,
        child_id: Option<ChildId>,
        query: &str,
        k_details: usize,
        k_knowledge: usize,
        token: &CancelToken,
    ) -> Result<Retrieved, Error> {
        let token = token.narrowed(self.timeout);
        let embedding = token.run(self.embedder.embed_one(query)).await??;

        let detail_scope = child_id.map(ScopeFilter::details_of);
        let shared_scope = ScopeFilter::shared_only();

        let details = async {
            match &detail_scope {
                Some(scope) if k_details > 0 => self.index.query(&embedding, scope, k_details).await,
                _ => Ok(Vec::new()),
            }
        };
        let knowledge = async {
            if k_knowledge == 0 {
                return Ok(Vec::new());
            }
            self.index.query(&embedding, &shared_scope, k_knowledge).await
        };

        let (details, knowledge): (Result<_, IndexError>, Result<_, IndexError>) =
            token.run(async { tokio::join!(details, knowledge) }).await?;

        Ok(Retrieved {
            details: match &detail_scope {
                Some(scope) => enforce_scope(scope, details?, k_details),
                None => Vec::new(),
            },
            knowledge: enforce_scope(&shared_scope, knowledge?, k_knowledge),
            degraded: false,
        })
    }
}

/// Drop anything outside `scope` (a backend bug, never expected) and
/// collapse duplicate documents, keeping the best-ranked copy.
fn enforce_scope(scope: &ScopeFilter, hits: Vec<ScoredEntry>, k: usize) -> Vec<ScoredEntry> {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(hits.len().min(k));
    for hit in hits {
        if !scope.matches(&hit.metadata) {
            warn!(
                entry_id = %hit.entry_id,
                owner = ?hit.metadata.owner(),
                scope_child = ?scope.child_id,
                "Vector index returned an out-of-scope entry; dropped"
            );
            continue;
        }
        if !seen.insert(hit.metadata.document_id()) {
            continue;
        }
        kept.push(hit);
        if kept.len() == k {
            break;
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::DetailIndexer;
    use crate::test_helpers::{FailingEmbedder, HangingEmbedder, detail};
    use async_trait::async_trait;
    use chrono::Utc;
    use nestling_core::child::{DetailId, DetailType};
    use nestling_core::knowledge::AgeRange;
    use nestling_core::store::ChildDetailStore;
    use nestling_core::vector::{EntryMetadata, VectorEntry};
    use nestling_memory::{InMemoryChildStore, InMemoryVectorIndex};
    use nestling_providers::HashEmbedder;

    const TIMEOUT: Duration = Duration::from_secs(3);

    async fn indexed(details: &[nestling_core::child::ChildDetail]) -> (Retriever, Arc<InMemoryVectorIndex>) {
        let embedder = Arc::new(HashEmbedder::default());
        let index = Arc::new(InMemoryVectorIndex::new());
        let store = InMemoryChildStore::new();
        let indexer = DetailIndexer::new(embedder.clone(), index.clone(), Arc::new(store.clone()));
        for d in details {
            store.insert(d.clone()).await.unwrap();
            indexer.index(d).await.unwrap();
        }
        (Retriever::new(embedder, index.clone(), TIMEOUT), index)
    }

    #[tokio::test]
    async fn details_never_cross_children() {
        let a = ChildId::new();
        let b = ChildId::new();
        let blocks = detail(a, DetailType::Interest, "enjoys stacking blocks into towers", 8);
        let (retriever, _) = indexed(&[blocks.clone()]).await;
        let token = CancelToken::new();

        let own = retriever
            .search(&ScopeFilter::child_and_shared(Some(a)), "stacking blocks", 5, &token)
            .await
            .unwrap();
        assert_eq!(own[0].metadata.document_id(), blocks.id.to_string());

        let other = retriever
            .search(&ScopeFilter::child_and_shared(Some(b)), "stacking blocks", 5, &token)
            .await
            .unwrap();
        assert!(other.is_empty());

        let retrieved = retriever.retrieve(Some(b), "stacking blocks", 5, 5, &token).await;
        assert!(retrieved.details.is_empty());
        assert!(!retrieved.degraded);
    }

    fn detail_entry(id: &str, child_id: ChildId, importance: u8, days_ago: i64) -> VectorEntry {
        VectorEntry {
            id: id.into(),
            document: format!("Child Detail - Type: interest\nContent: {id}\n"),
            metadata: EntryMetadata::ChildDetail {
                detail_id: DetailId::new(),
                child_id,
                detail_type: DetailType::Interest,
                tags: vec![],
                importance,
                recorded_at: Utc::now() - chrono::Duration::days(days_ago),
                revision: 1,
            },
            embedding: HashEmbedder::default().vector("likes puzzles"),
        }
    }

    #[tokio::test]
    async fn ties_prefer_importance_then_recency() {
        let child = ChildId::new();
        let (retriever, index) = indexed(&[]).await;
        index.upsert(detail_entry("old-low", child, 3, 60)).await.unwrap();
        index.upsert(detail_entry("new-low", child, 3, 1)).await.unwrap();
        index.upsert(detail_entry("old-high", child, 9, 90)).await.unwrap();

        let hits = retriever
            .retrieve(Some(child), "likes puzzles", 5, 0, &CancelToken::new())
            .await;
        let ids: Vec<&str> = hits.details.iter().map(|h| h.entry_id.as_str()).collect();
        assert_eq!(ids, vec!["old-high", "new-low", "old-low"]);
    }

    #[tokio::test]
    async fn shared_knowledge_is_visible_without_a_child() {
        let (retriever, index) = indexed(&[]).await;
        let embedder = HashEmbedder::default();
        index
            .upsert(VectorEntry {
                id: "knowledge-sleep-1".into(),
                document: "Toddlers need 11 to 14 hours of sleep".into(),
                metadata: EntryMetadata::SharedKnowledge {
                    segment_id: "sleep-1".into(),
                    category: "sleep".into(),
                    topic: "naps".into(),
                    origin: "handbook".into(),
                    age_range: AgeRange::ALL,
                    expert_reviewed: true,
                },
                embedding: embedder.vector("Toddlers need 11 to 14 hours of sleep"),
            })
            .await
            .unwrap();

        let retrieved = retriever
            .retrieve(None, "how much sleep", 5, 5, &CancelToken::new())
            .await;
        assert!(retrieved.details.is_empty());
        assert_eq!(retrieved.knowledge.len(), 1);
        assert_eq!(retrieved.knowledge[0].metadata.document_id(), "sleep-1");
    }

    #[tokio::test]
    async fn embedding_failure_degrades() {
        let retriever = Retriever::new(Arc::new(FailingEmbedder), Arc::new(InMemoryVectorIndex::new()), TIMEOUT);
        let retrieved = retriever
            .retrieve(Some(ChildId::new()), "anything", 5, 5, &CancelToken::new())
            .await;
        assert!(retrieved.degraded);
        assert!(retrieved.details.is_empty() && retrieved.knowledge.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_embedding_times_out_and_degrades() {
        let retriever = Retriever::new(
            Arc::new(HangingEmbedder),
            Arc::new(InMemoryVectorIndex::new()),
            Duration::from_millis(200),
        );
        let started = Instant::now();
        let retrieved = retriever
            .retrieve(Some(ChildId::new()), "anything", 5, 5, &CancelToken::new())
            .await;
        assert!(retrieved.degraded);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    /// A backend that ignores the scope filter.
    struct LeakyIndex(VectorEntry);

    #[async_trait]
    impl VectorIndex for LeakyIndex {
        fn name(&self) -> &str {
            "leaky"
        }
        async fn upsert(&self, _entry: VectorEntry) -> Result<(), IndexError> {
            Ok(())
        }
        async fn delete(&self, _entry_id: &str) -> Result<bool, IndexError> {
            Ok(false)
        }
        async fn query(
            &self,
            _embedding: &[f32],
            _filter: &ScopeFilter,
            _k: usize,
        ) -> Result<Vec<ScoredEntry>, IndexError> {
            Ok(vec![ScoredEntry {
                entry_id: self.0.id.clone(),
                document: self.0.document.clone(),
                metadata: self.0.metadata.clone(),
                score: 1.0,
            }])
        }
        async fn count(&self) -> Result<usize, IndexError> {
            Ok(1)
        }
    }

    #[tokio::test]
    async fn out_of_scope_hits_are_filtered_again() {
        let owner = ChildId::new();
        let leaky = LeakyIndex(VectorEntry {
            id: "e".into(),
            document: "secret".into(),
            metadata: EntryMetadata::ChildDetail {
                detail_id: DetailId::new(),
                child_id: owner,
                detail_type: DetailType::Routine,
                tags: vec![],
                importance: 5,
                recorded_at: Utc::now(),
                revision: 1,
            },
            embedding: vec![1.0],
        });
        let retriever = Retriever::new(Arc::new(HashEmbedder::default()), Arc::new(leaky), TIMEOUT);
        let retrieved = retriever
            .retrieve(Some(ChildId::new()), "secret", 5, 5, &CancelToken::new())
            .await;
        assert!(retrieved.details.is_empty());
        assert!(retrieved.knowledge.is_empty());
    }
}
