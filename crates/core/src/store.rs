//! Relational-store collaborators consumed by the core.
//!
//! Profiles and growth records are owned elsewhere and only read here. Child
//! details are stored by the detail management surface. The detail → vector
//! entry relationship lives in its own mapping table ([`IndexMapping`]); the
//! vector index never points back into the relational store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::child::{ChildDetail, ChildId, ChildProfile, DetailId, DetailType, GrowthRecord};
use crate::error::StoreError;

/// Read access to child profiles and growth records.
#[async_trait]
pub trait ChildDirectory: Send + Sync {
    async fn profile(&self, child_id: ChildId) -> Result<Option<ChildProfile>, StoreError>;

    /// Growth records recorded at or after `since`, newest first, at most `limit`.
    async fn recent_records(
        &self,
        child_id: ChildId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GrowthRecord>, StoreError>;
}

/// Listing filter for details.
#[derive(Debug, Clone, Default)]
pub struct DetailFilter {
    pub detail_type: Option<DetailType>,
    /// Any-match over tags; empty means no tag filter.
    pub tags: Vec<String>,
    pub offset: usize,
    pub limit: usize,
}

impl DetailFilter {
    pub fn matches(&self, detail: &ChildDetail) -> bool {
        let type_ok = self.detail_type.is_none_or(|t| t == detail.detail_type);
        let tags_ok = self.tags.is_empty() || self.tags.iter().any(|t| detail.tags.contains(t));
        type_ok && tags_ok
    }
}

/// Source-of-truth storage for child details.
///
/// Reads populate `embedding_ref` from the index mapping.
#[async_trait]
pub trait ChildDetailStore: Send + Sync {
    async fn insert(&self, detail: ChildDetail) -> Result<(), StoreError>;

    /// Insert several details atomically.
    async fn insert_batch(&self, details: Vec<ChildDetail>) -> Result<(), StoreError>;

    /// Replace a stored detail. Fails with `Conflict` if the stored revision is
    /// not `detail.revision - 1`.
    async fn update(&self, detail: ChildDetail) -> Result<(), StoreError>;

    /// Remove a detail, returning it if it existed.
    async fn delete(&self, id: DetailId) -> Result<Option<ChildDetail>, StoreError>;

    async fn get(&self, id: DetailId) -> Result<Option<ChildDetail>, StoreError>;

    /// Details of one child ordered by `recorded_at` descending, plus the
    /// total number matching the filter.
    async fn list(
        &self,
        child_id: ChildId,
        filter: &DetailFilter,
    ) -> Result<(Vec<ChildDetail>, usize), StoreError>;
}

/// One row of the detail → vector-entry mapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedEntry {
    pub detail_id: DetailId,
    pub child_id: ChildId,
    pub entry_id: String,
    /// Detail revision that was embedded into `entry_id`.
    pub revision: u64,
}

/// The explicit detail → index-entry mapping table.
#[async_trait]
pub trait IndexMapping: Send + Sync {
    async fn entry_for(&self, detail_id: DetailId) -> Result<Option<MappedEntry>, StoreError>;

    /// Record (or replace) the mapping for a detail.
    async fn record(&self, entry: MappedEntry) -> Result<(), StoreError>;

    /// Drop the mapping for a detail, returning what was there.
    async fn forget(&self, detail_id: DetailId) -> Result<Option<MappedEntry>, StoreError>;

    /// Details with no mapping or a mapping older than their current revision.
    async fn stale(&self, limit: usize) -> Result<Vec<DetailId>, StoreError>;

    /// Mappings whose detail no longer exists.
    async fn orphans(&self, limit: usize) -> Result<Vec<MappedEntry>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::child::NewChildDetail;

    fn detail(detail_type: DetailType, tags: &[&str]) -> ChildDetail {
        NewChildDetail {
            child_id: ChildId::new(),
            detail_type,
            content: "x".into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            importance: 5,
            recorded_at: None,
        }
        .into_detail(Utc::now())
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = DetailFilter::default();
        assert!(filter.matches(&detail(DetailType::Interest, &[])));
    }

    #[test]
    fn tag_filter_is_any_match() {
        let filter = DetailFilter {
            tags: vec!["food".into(), "sleep".into()],
            ..Default::default()
        };
        assert!(filter.matches(&detail(DetailType::Preference, &["food"])));
        assert!(!filter.matches(&detail(DetailType::Preference, &["play"])));
    }

    #[test]
    fn type_filter() {
        let filter = DetailFilter {
            detail_type: Some(DetailType::Milestone),
            ..Default::default()
        };
        assert!(filter.matches(&detail(DetailType::Milestone, &[])));
        assert!(!filter.matches(&detail(DetailType::Routine, &[])));
    }
}
