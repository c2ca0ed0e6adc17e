//! The shared knowledge corpus: expert content visible to every query.

use crate::cache::ResponseCache;
use crate::ingest::{ContentType, DocumentLoader, IngestError, RecursiveSplitter};
use nestling_core::embedding::Embedder;
use nestling_core::error::{Error, IndexError};
use nestling_core::knowledge::{AgeRange, KnowledgeSegment};
use nestling_core::vector::{EntryMetadata, VectorEntry, VectorIndex};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::info;

/// A document to be split into knowledge segments.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    /// Title or URL; segment ids derive from it, so re-ingesting the same
    /// source replaces its segments.
    pub source: String,
    pub content_type: ContentType,
    pub bytes: Vec<u8>,
    pub category: String,
    pub topic: String,
    pub age_range: AgeRange,
    pub expert_reviewed: bool,
}

pub fn entry_id_for_segment(segment_id: &str) -> String {
    format!("knowledge-{segment_id}")
}

pub struct KnowledgeCatalog {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    cache: ResponseCache,
    splitter: RecursiveSplitter,
}

impl KnowledgeCatalog {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>, cache: ResponseCache) -> Self {
        Self {
            embedder,
            index,
            cache,
            splitter: RecursiveSplitter::default(),
        }
    }

    pub fn with_splitter(mut self, splitter: RecursiveSplitter) -> Self {
        self.splitter = splitter;
        self
    }

    /// Upsert segments, embedding any that arrive without a vector. Clears
    /// the answer cache, since any cached answer may have drawn on the
    /// corpus.
    pub async fn publish(&self, mut segments: Vec<KnowledgeSegment>) -> Result<usize, Error> {
        if segments.is_empty() {
            return Ok(0);
        }
        let missing: Vec<usize> = (0..segments.len())
            .filter(|&i| segments[i].embedding.is_empty())
            .collect();
        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|&i| segments[i].content.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            if vectors.len() != texts.len() {
                return Err(IndexError::EmbeddingFailed(format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    vectors.len()
                ))
                .into());
            }
            for (i, vector) in missing.into_iter().zip(vectors) {
                segments[i].embedding = vector;
            }
        }

        let count = segments.len();
        for segment in segments {
            self.index
                .upsert(VectorEntry {
                    id: entry_id_for_segment(&segment.id),
                    document: segment.content,
                    metadata: EntryMetadata::SharedKnowledge {
                        segment_id: segment.id,
                        category: segment.category,
                        topic: segment.topic,
                        origin: segment.source,
                        age_range: segment.age_range,
                        expert_reviewed: segment.expert_reviewed,
                    },
                    embedding: segment.embedding,
                })
                .await?;
        }

        self.cache.invalidate_all().await;
        info!(segments = count, index = self.index.name(), "Knowledge published");
        Ok(count)
    }

    /// Remove one segment. Returns `false` if it was not indexed.
    pub async fn retract(&self, segment_id: &str) -> Result<bool, Error> {
        let removed = self.index.delete(&entry_id_for_segment(segment_id)).await?;
        if removed {
            self.cache.invalidate_all().await;
            info!(segment_id, "Knowledge segment retracted");
        }
        Ok(removed)
    }

    /// Extract, chunk and publish a document. Returns the new segment ids.
    pub async fn ingest(&self, document: SourceDocument) -> Result<Vec<String>, Error> {
        let text = DocumentLoader::for_content_type(document.content_type).load(&document.bytes)?;
        let chunks = self.splitter.split(&text);
        if chunks.is_empty() {
            return Err(IngestError::Empty.into());
        }

        let prefix = source_prefix(&document.source);
        let segments: Vec<KnowledgeSegment> = chunks
            .into_iter()
            .enumerate()
            .map(|(i, content)| KnowledgeSegment {
                id: format!("{prefix}-{i:04}"),
                content,
                category: document.category.clone(),
                age_range: document.age_range,
                topic: document.topic.clone(),
                source: document.source.clone(),
                expert_reviewed: document.expert_reviewed,
                embedding: Vec::new(),
            })
            .collect();
        let ids = segments.iter().map(|s| s.id.clone()).collect();
        self.publish(segments).await?;
        Ok(ids)
    }
}

fn source_prefix(source: &str) -> String {
    let digest = hex::encode(Sha256::digest(source.trim().as_bytes()));
    digest[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedAnswer;
    use crate::test_helpers::FailingEmbedder;
    use nestling_core::vector::ScopeFilter;
    use nestling_memory::{InMemoryCacheStore, InMemoryVectorIndex};
    use nestling_providers::HashEmbedder;
    use std::time::Duration;

    fn segment(id: &str, content: &str) -> KnowledgeSegment {
        KnowledgeSegment {
            id: id.into(),
            content: content.into(),
            category: "sleep".into(),
            age_range: AgeRange { min_months: 12, max_months: Some(36) },
            topic: "naps".into(),
            source: "Sleep Guide".into(),
            expert_reviewed: true,
            embedding: Vec::new(),
        }
    }

    fn catalog(embedder: Arc<dyn Embedder>) -> (KnowledgeCatalog, Arc<InMemoryVectorIndex>, ResponseCache) {
        let index = Arc::new(InMemoryVectorIndex::new());
        let cache = ResponseCache::new(Arc::new(InMemoryCacheStore::new()), Duration::from_secs(60));
        (KnowledgeCatalog::new(embedder, index.clone(), cache.clone()), index, cache)
    }

    #[tokio::test]
    async fn publish_embeds_and_shares_segments() {
        let embedder = Arc::new(HashEmbedder::default());
        let (catalog, index, _) = catalog(embedder.clone());
        catalog
            .publish(vec![segment("s1", "Toddlers usually nap once a day after lunch.")])
            .await
            .unwrap();

        let hits = index
            .query(&embedder.vector("nap after lunch"), &ScopeFilter::shared_only(), 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry_id, "knowledge-s1");
        assert_eq!(hits[0].metadata.document_id(), "s1");
        assert!(hits[0].metadata.owner().is_none());
    }

    #[tokio::test]
    async fn publish_and_retract_clear_the_cache() {
        let (catalog, index, cache) = catalog(Arc::new(HashEmbedder::default()));
        let store = || async {
            Ok(CachedAnswer {
                answer: "a".into(),
                citations: vec![],
                model: "m".into(),
                context_limited: false,
            })
        };
        cache.get_or_compute("fp", "shared", store).await.unwrap();
        catalog.publish(vec![segment("s1", "content")]).await.unwrap();
        assert!(cache.lookup("fp").await.is_none());

        cache.get_or_compute("fp", "shared", store).await.unwrap();
        assert!(catalog.retract("s1").await.unwrap());
        assert!(cache.lookup("fp").await.is_none());
        assert!(!catalog.retract("s1").await.unwrap());
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn embedding_outage_publishes_nothing() {
        let (catalog, index, _) = catalog(Arc::new(FailingEmbedder));
        assert!(catalog.publish(vec![segment("s1", "content")]).await.is_err());
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ingest_chunks_with_stable_ids() {
        let (catalog, index, _) = catalog(Arc::new(HashEmbedder::default()));
        let catalog = catalog.with_splitter(RecursiveSplitter::new(40, 10));
        let document = SourceDocument {
            source: "Feeding Basics".into(),
            content_type: ContentType::PlainText,
            bytes: b"Offer a variety of vegetables.\n\nLet toddlers feed themselves with a spoon.".to_vec(),
            category: "nutrition".into(),
            topic: "feeding".into(),
            age_range: AgeRange::ALL,
            expert_reviewed: false,
        };

        let first = catalog.ingest(document.clone()).await.unwrap();
        assert_eq!(first.len(), 2);
        let again = catalog.ingest(document).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(index.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn ingest_rejects_unsupported_formats() {
        let (catalog, _, _) = catalog(Arc::new(HashEmbedder::default()));
        let err = catalog
            .ingest(SourceDocument {
                source: "scan".into(),
                content_type: ContentType::Pdf,
                bytes: b"%PDF".to_vec(),
                category: "c".into(),
                topic: "t".into(),
                age_range: AgeRange::ALL,
                expert_reviewed: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
