//! Vector index abstraction with tenant-scoped filtering.
//!
//! Every entry carries metadata naming its source. Child-detail entries name
//! their owning child; shared-knowledge entries are owned by no one. Queries
//! pass a [`ScopeFilter`] and implementations MUST apply it before ranking:
//! an entry owned by child A never matches a filter scoped to child B.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::child::{ChildId, DetailId, DetailType};
use crate::error::IndexError;
use crate::knowledge::AgeRange;

/// Where an indexed document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    ChildDetail,
    SharedKnowledge,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChildDetail => "child_detail",
            Self::SharedKnowledge => "shared_knowledge",
        }
    }
}

/// Metadata stored alongside each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum EntryMetadata {
    ChildDetail {
        detail_id: DetailId,
        child_id: ChildId,
        detail_type: DetailType,
        #[serde(default)]
        tags: Vec<String>,
        importance: u8,
        recorded_at: DateTime<Utc>,
        revision: u64,
    },
    SharedKnowledge {
        segment_id: String,
        category: String,
        topic: String,
        origin: String,
        #[serde(default)]
        age_range: AgeRange,
        #[serde(default)]
        expert_reviewed: bool,
    },
}

impl EntryMetadata {
    pub fn source(&self) -> SourceKind {
        match self {
            Self::ChildDetail { .. } => SourceKind::ChildDetail,
            Self::SharedKnowledge { .. } => SourceKind::SharedKnowledge,
        }
    }

    /// The owning child, `None` for shared content.
    pub fn owner(&self) -> Option<ChildId> {
        match self {
            Self::ChildDetail { child_id, .. } => Some(*child_id),
            Self::SharedKnowledge { .. } => None,
        }
    }

    /// Stable id of the source document (detail id or segment id).
    pub fn document_id(&self) -> String {
        match self {
            Self::ChildDetail { detail_id, .. } => detail_id.to_string(),
            Self::SharedKnowledge { segment_id, .. } => segment_id.clone(),
        }
    }

    /// Tie-break importance; shared knowledge has none.
    pub fn importance(&self) -> u8 {
        match self {
            Self::ChildDetail { importance, .. } => *importance,
            Self::SharedKnowledge { .. } => 0,
        }
    }

    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::ChildDetail { recorded_at, .. } => Some(*recorded_at),
            Self::SharedKnowledge { .. } => None,
        }
    }
}

/// A document stored in the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    /// Index-assigned entry id.
    pub id: String,
    /// Retrieval document text (what was embedded).
    pub document: String,
    pub metadata: EntryMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
}

/// A query hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntry {
    pub entry_id: String,
    pub document: String,
    pub metadata: EntryMetadata,
    /// Cosine similarity.
    pub score: f32,
}

/// Hard filter applied inside the index: `owner = child OR source = shared`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeFilter {
    /// Child whose details may match. `None` matches no child details at all.
    pub child_id: Option<ChildId>,
    /// Whether shared knowledge may match.
    pub include_shared: bool,
}

impl ScopeFilter {
    /// Only the given child's details.
    pub fn details_of(child_id: ChildId) -> Self {
        Self {
            child_id: Some(child_id),
            include_shared: false,
        }
    }

    /// Only shared knowledge.
    pub fn shared_only() -> Self {
        Self {
            child_id: None,
            include_shared: true,
        }
    }

    /// The child's details plus shared knowledge.
    pub fn child_and_shared(child_id: Option<ChildId>) -> Self {
        Self {
            child_id,
            include_shared: true,
        }
    }

    pub fn matches(&self, metadata: &EntryMetadata) -> bool {
        match metadata.owner() {
            Some(owner) => self.child_id == Some(owner),
            None => self.include_shared,
        }
    }
}

/// A nearest-neighbour store with metadata filtering.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Backend name (e.g. "in_memory", "sqlite").
    fn name(&self) -> &str;

    /// Insert or replace the entry with `entry.id`.
    async fn upsert(&self, entry: VectorEntry) -> Result<(), IndexError>;

    /// Delete an entry. Returns whether it existed.
    async fn delete(&self, entry_id: &str) -> Result<bool, IndexError>;

    /// Top-`k` entries matching `filter`, by descending similarity.
    async fn query(
        &self,
        embedding: &[f32],
        filter: &ScopeFilter,
        k: usize,
    ) -> Result<Vec<ScoredEntry>, IndexError>;

    /// Number of live entries.
    async fn count(&self) -> Result<usize, IndexError>;
}
