//! In-memory relational store for children, growth records, details and the
//! detail → index-entry mapping table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nestling_core::child::{ChildDetail, ChildId, ChildProfile, DetailId, GrowthRecord};
use nestling_core::error::StoreError;
use nestling_core::store::{
    ChildDetailStore, ChildDirectory, DetailFilter, IndexMapping, MappedEntry,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    profiles: HashMap<ChildId, ChildProfile>,
    records: Vec<GrowthRecord>,
    details: HashMap<DetailId, ChildDetail>,
    mappings: HashMap<DetailId, MappedEntry>,
}

impl Tables {
    fn materialise(&self, detail: &ChildDetail) -> ChildDetail {
        let mut detail = detail.clone();
        detail.embedding_ref = self.mappings.get(&detail.id).map(|m| m.entry_id.clone());
        detail
    }
}

/// All child-scoped relational data behind one lock, so a batch insert is
/// atomic and reads see a consistent view of details and mappings.
#[derive(Clone, Default)]
pub struct InMemoryChildStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryChildStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a profile (owned by the external profile service).
    pub async fn put_profile(&self, profile: ChildProfile) {
        self.tables.write().await.profiles.insert(profile.id, profile);
    }

    /// Register a growth record (owned by the external records service).
    pub async fn put_record(&self, record: GrowthRecord) {
        self.tables.write().await.records.push(record);
    }
}

#[async_trait]
impl ChildDirectory for InMemoryChildStore {
    async fn profile(&self, child_id: ChildId) -> Result<Option<ChildProfile>, StoreError> {
        Ok(self.tables.read().await.profiles.get(&child_id).cloned())
    }

    async fn recent_records(
        &self,
        child_id: ChildId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GrowthRecord>, StoreError> {
        let tables = self.tables.read().await;
        let mut records: Vec<GrowthRecord> = tables
            .records
            .iter()
            .filter(|r| r.child_id == child_id && r.recorded_at >= since)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        records.truncate(limit);
        Ok(records)
    }
}

#[async_trait]
impl ChildDetailStore for InMemoryChildStore {
    async fn insert(&self, detail: ChildDetail) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.details.contains_key(&detail.id) {
            return Err(StoreError::Conflict(format!("detail {} already exists", detail.id)));
        }
        tables.details.insert(detail.id, detail);
        Ok(())
    }

    async fn insert_batch(&self, details: Vec<ChildDetail>) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(dup) = details.iter().find(|d| tables.details.contains_key(&d.id)) {
            return Err(StoreError::Conflict(format!("detail {} already exists", dup.id)));
        }
        for detail in details {
            tables.details.insert(detail.id, detail);
        }
        Ok(())
    }

    async fn update(&self, detail: ChildDetail) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let current = tables
            .details
            .get_mut(&detail.id)
            .ok_or_else(|| StoreError::Conflict(format!("detail {} no longer exists", detail.id)))?;
        if current.revision + 1 != detail.revision {
            return Err(StoreError::Conflict(format!(
                "detail {} is at revision {}, update expected {}",
                detail.id,
                current.revision,
                detail.revision.saturating_sub(1)
            )));
        }
        *current = ChildDetail {
            embedding_ref: None,
            ..detail
        };
        Ok(())
    }

    async fn delete(&self, id: DetailId) -> Result<Option<ChildDetail>, StoreError> {
        let mut tables = self.tables.write().await;
        let removed = tables.details.remove(&id);
        Ok(removed.map(|d| tables.materialise(&d)))
    }

    async fn get(&self, id: DetailId) -> Result<Option<ChildDetail>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.details.get(&id).map(|d| tables.materialise(d)))
    }

    async fn list(
        &self,
        child_id: ChildId,
        filter: &DetailFilter,
    ) -> Result<(Vec<ChildDetail>, usize), StoreError> {
        let tables = self.tables.read().await;
        let mut matching: Vec<&ChildDetail> = tables
            .details
            .values()
            .filter(|d| d.child_id == child_id && filter.matches(d))
            .collect();
        matching.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at).then(a.id.cmp(&b.id)));
        let total = matching.len();
        let limit = if filter.limit == 0 { usize::MAX } else { filter.limit };
        let page = matching
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .map(|d| tables.materialise(d))
            .collect();
        Ok((page, total))
    }
}

#[async_trait]
impl IndexMapping for InMemoryChildStore {
    async fn entry_for(&self, detail_id: DetailId) -> Result<Option<MappedEntry>, StoreError> {
        Ok(self.tables.read().await.mappings.get(&detail_id).cloned())
    }

    async fn record(&self, entry: MappedEntry) -> Result<(), StoreError> {
        self.tables.write().await.mappings.insert(entry.detail_id, entry);
        Ok(())
    }

    async fn forget(&self, detail_id: DetailId) -> Result<Option<MappedEntry>, StoreError> {
        Ok(self.tables.write().await.mappings.remove(&detail_id))
    }

    async fn stale(&self, limit: usize) -> Result<Vec<DetailId>, StoreError> {
        let tables = self.tables.read().await;
        let mut stale: Vec<&ChildDetail> = tables
            .details
            .values()
            .filter(|d| {
                tables
                    .mappings
                    .get(&d.id)
                    .is_none_or(|m| m.revision < d.revision)
            })
            .collect();
        stale.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        Ok(stale.into_iter().take(limit).map(|d| d.id).collect())
    }

    async fn orphans(&self, limit: usize) -> Result<Vec<MappedEntry>, StoreError> {
        let tables = self.tables.read().await;
        let mut orphans: Vec<MappedEntry> = tables
            .mappings
            .values()
            .filter(|m| !tables.details.contains_key(&m.detail_id))
            .cloned()
            .collect();
        orphans.sort_by(|a, b| a.detail_id.cmp(&b.detail_id));
        orphans.truncate(limit);
        Ok(orphans)
    }
}
