//! Guardian-facing management of child details.
//!
//! Every committed mutation enqueues an indexing job and invalidates the
//! child's cached answers before returning. Indexing itself happens in the
//! background, so a question asked right after a write may not see it yet.

use crate::access::authorize_child;
use crate::cache::ResponseCache;
use crate::worker::IndexQueue;
use chrono::Utc;
use nestling_core::child::{
    ChildDetail, ChildDetailPatch, ChildId, DetailId, MAX_IMPORTANCE, MIN_IMPORTANCE, NewChildDetail, UserId,
};
use nestling_core::error::Error;
use nestling_core::store::{ChildDetailStore, ChildDirectory, DetailFilter};
use std::sync::Arc;
use tracing::info;

pub const MAX_BATCH: usize = 100;
pub const DEFAULT_LIST_LIMIT: usize = 100;

pub struct DetailManager {
    directory: Arc<dyn ChildDirectory>,
    details: Arc<dyn ChildDetailStore>,
    queue: IndexQueue,
    cache: ResponseCache,
}

impl DetailManager {
    pub fn new(
        directory: Arc<dyn ChildDirectory>,
        details: Arc<dyn ChildDetailStore>,
        queue: IndexQueue,
        cache: ResponseCache,
    ) -> Self {
        Self {
            directory,
            details,
            queue,
            cache,
        }
    }

    pub async fn create(&self, user_id: UserId, input: NewChildDetail) -> Result<ChildDetail, Error> {
        let input = validate_new(input)?;
        authorize_child(self.directory.as_ref(), input.child_id, user_id).await?;

        let detail = input.into_detail(Utc::now());
        self.details.insert(detail.clone()).await?;
        info!(detail_id = %detail.id, child_id = %detail.child_id, "Child detail created");

        self.queue.enqueue(detail.id);
        self.cache.invalidate_child(detail.child_id).await;
        Ok(detail)
    }

    /// Create up to [`MAX_BATCH`] details for one child, all or nothing.
    pub async fn batch_create(&self, user_id: UserId, inputs: Vec<NewChildDetail>) -> Result<Vec<ChildDetail>, Error> {
        let Some(first) = inputs.first() else {
            return Err(Error::Validation("batch must contain at least one detail".into()));
        };
        if inputs.len() > MAX_BATCH {
            return Err(Error::Validation(format!("batch exceeds {MAX_BATCH} details")));
        }
        let child_id = first.child_id;
        if inputs.iter().any(|i| i.child_id != child_id) {
            return Err(Error::Validation("all details in a batch must belong to the same child".into()));
        }
        let inputs = inputs.into_iter().map(validate_new).collect::<Result<Vec<_>, _>>()?;
        authorize_child(self.directory.as_ref(), child_id, user_id).await?;

        let now = Utc::now();
        let created: Vec<ChildDetail> = inputs.into_iter().map(|i| i.into_detail(now)).collect();
        self.details.insert_batch(created.clone()).await?;
        info!(child_id = %child_id, count = created.len(), "Child details created");

        for detail in &created {
            self.queue.enqueue(detail.id);
        }
        self.cache.invalidate_child(child_id).await;
        Ok(created)
    }

    pub async fn update(&self, user_id: UserId, detail_id: DetailId, patch: ChildDetailPatch) -> Result<ChildDetail, Error> {
        if patch.is_empty() {
            return Err(Error::Validation("update must change at least one field".into()));
        }
        let patch = validate_patch(patch)?;
        let mut detail = self.owned_detail(user_id, detail_id).await?;

        patch.apply(&mut detail, Utc::now());
        self.details.update(detail.clone()).await?;
        info!(detail_id = %detail.id, revision = detail.revision, "Child detail updated");

        self.queue.enqueue(detail.id);
        self.cache.invalidate_child(detail.child_id).await;
        Ok(detail)
    }

    pub async fn delete(&self, user_id: UserId, detail_id: DetailId) -> Result<ChildDetail, Error> {
        let detail = self.owned_detail(user_id, detail_id).await?;
        let removed = self
            .details
            .delete(detail_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("detail {detail_id}")))?;
        info!(detail_id = %detail_id, child_id = %detail.child_id, "Child detail deleted");

        // The worker finds the detail gone and removes its entry.
        self.queue.enqueue(detail_id);
        self.cache.invalidate_child(removed.child_id).await;
        Ok(removed)
    }

    pub async fn get(&self, user_id: UserId, detail_id: DetailId) -> Result<ChildDetail, Error> {
        self.owned_detail(user_id, detail_id).await
    }

    /// Details of `child_id`, newest first, with the total matching count.
    /// A zero limit means [`DEFAULT_LIST_LIMIT`].
    pub async fn list(
        &self,
        user_id: UserId,
        child_id: ChildId,
        mut filter: DetailFilter,
    ) -> Result<(Vec<ChildDetail>, usize), Error> {
        authorize_child(self.directory.as_ref(), child_id, user_id).await?;
        if filter.limit == 0 {
            filter.limit = DEFAULT_LIST_LIMIT;
        }
        filter.tags = normalize_tags(filter.tags);
        Ok(self.details.list(child_id, &filter).await?)
    }

    async fn owned_detail(&self, user_id: UserId, detail_id: DetailId) -> Result<ChildDetail, Error> {
        let detail = self
            .details
            .get(detail_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("detail {detail_id}")))?;
        authorize_child(self.directory.as_ref(), detail.child_id, user_id).await?;
        Ok(detail)
    }
}

fn validate_new(mut input: NewChildDetail) -> Result<NewChildDetail, Error> {
    input.content = validate_content(&input.content)?;
    validate_importance(input.importance)?;
    input.tags = normalize_tags(input.tags);
    Ok(input)
}

fn validate_patch(mut patch: ChildDetailPatch) -> Result<ChildDetailPatch, Error> {
    if let Some(content) = &patch.content {
        patch.content = Some(validate_content(content)?);
    }
    if let Some(importance) = patch.importance {
        validate_importance(importance)?;
    }
    patch.tags = patch.tags.map(normalize_tags);
    Ok(patch)
}

fn validate_content(content: &str) -> Result<String, Error> {
    let content = content.trim();
    if content.is_empty() {
        return Err(Error::Validation("content must not be empty".into()));
    }
    Ok(content.to_string())
}

fn validate_importance(importance: u8) -> Result<(), Error> {
    if !(MIN_IMPORTANCE..=MAX_IMPORTANCE).contains(&importance) {
        return Err(Error::Validation(format!(
            "importance must be between {MIN_IMPORTANCE} and {MAX_IMPORTANCE}, got {importance}"
        )));
    }
    Ok(())
}

/// Trim, drop empties, dedupe keeping first occurrence.
fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim();
        if !tag.is_empty() && !out.iter().any(|t| t == tag) {
            out.push(tag.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedAnswer;
    use crate::test_helpers::profile;
    use crate::worker::IndexJob;
    use chrono::NaiveDate;
    use nestling_core::child::{DEFAULT_IMPORTANCE, DetailType};
    use nestling_memory::{InMemoryCacheStore, InMemoryChildStore};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        manager: DetailManager,
        jobs: mpsc::Receiver<IndexJob>,
        cache: ResponseCache,
        guardian: UserId,
        child: ChildId,
    }

    async fn fixture() -> Fixture {
        let store = InMemoryChildStore::new();
        let guardian = UserId::new();
        let mia = profile(guardian, "Mia", NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
        let child = mia.id;
        store.put_profile(mia).await;
        let (queue, jobs) = IndexQueue::new(32);
        let cache = ResponseCache::new(Arc::new(InMemoryCacheStore::new()), Duration::from_secs(60));
        Fixture {
            manager: DetailManager::new(Arc::new(store.clone()), Arc::new(store), queue, cache.clone()),
            jobs,
            cache,
            guardian,
            child,
        }
    }

    fn input(child_id: ChildId, content: &str) -> NewChildDetail {
        NewChildDetail {
            child_id,
            detail_type: DetailType::Interest,
            content: content.into(),
            tags: vec![],
            importance: DEFAULT_IMPORTANCE,
            recorded_at: None,
        }
    }

    #[tokio::test]
    async fn create_normalizes_and_enqueues() {
        let mut f = fixture().await;
        let mut new = input(f.child, "  loves dinosaurs  ");
        new.tags = vec![" play ".into(), "play".into(), "".into(), "books".into()];

        let created = f.manager.create(f.guardian, new).await.unwrap();
        assert_eq!(created.content, "loves dinosaurs");
        assert_eq!(created.tags, vec!["play", "books"]);
        assert_eq!(created.revision, 1);

        let job = f.jobs.try_recv().unwrap();
        assert_eq!(job, IndexJob { detail_id: created.id, attempt: 0 });
    }

    #[tokio::test]
    async fn create_rejects_bad_input_and_strangers() {
        let f = fixture().await;
        let err = f.manager.create(f.guardian, input(f.child, "   ")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let mut loud = input(f.child, "x");
        loud.importance = 11;
        let err = f.manager.create(f.guardian, loud).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = f.manager.create(UserId::new(), input(f.child, "x")).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));

        let err = f.manager.create(f.guardian, input(ChildId::new(), "x")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn batch_requires_single_child() {
        let f = fixture().await;
        let err = f.manager.batch_create(f.guardian, vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let mixed = vec![input(f.child, "a"), input(ChildId::new(), "b")];
        let err = f.manager.batch_create(f.guardian, mixed).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let too_many = (0..=MAX_BATCH).map(|i| input(f.child, &format!("fact {i}"))).collect();
        let err = f.manager.batch_create(f.guardian, too_many).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn batch_creates_all_and_enqueues_each() {
        let mut f = fixture().await;
        let created = f
            .manager
            .batch_create(f.guardian, vec![input(f.child, "a"), input(f.child, "b")])
            .await
            .unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(f.jobs.try_recv().unwrap().detail_id, created[0].id);
        assert_eq!(f.jobs.try_recv().unwrap().detail_id, created[1].id);
    }

    #[tokio::test]
    async fn update_bumps_revision_and_invalidates_cache() {
        let f = fixture().await;
        let created = f.manager.create(f.guardian, input(f.child, "naps at noon")).await.unwrap();
        f.cache
            .get_or_compute("fp", &ResponseCache::child_scope(f.child), || async {
                Ok(CachedAnswer {
                    answer: "nap at noon".into(),
                    citations: vec![],
                    model: "m".into(),
                    context_limited: false,
                })
            })
            .await
            .unwrap();

        let updated = f
            .manager
            .update(
                f.guardian,
                created.id,
                ChildDetailPatch {
                    content: Some("naps at two".into()),
                    importance: Some(8),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.revision, 2);
        assert_eq!(updated.importance, 8);
        assert!(updated.updated_at >= created.updated_at);
        assert!(f.cache.lookup("fp").await.is_none());

        let err = f
            .manager
            .update(f.guardian, created.id, ChildDetailPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn strangers_cannot_read_or_delete() {
        let f = fixture().await;
        let created = f.manager.create(f.guardian, input(f.child, "secret")).await.unwrap();
        let stranger = UserId::new();
        assert!(matches!(f.manager.get(stranger, created.id).await, Err(Error::Unauthorized(_))));
        assert!(matches!(f.manager.delete(stranger, created.id).await, Err(Error::Unauthorized(_))));

        f.manager.delete(f.guardian, created.id).await.unwrap();
        assert!(matches!(f.manager.get(f.guardian, created.id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn list_filters_and_defaults_limit() {
        let f = fixture().await;
        let mut tagged = input(f.child, "likes bath toys");
        tagged.tags = vec!["bath".into()];
        f.manager.create(f.guardian, tagged).await.unwrap();
        let mut routine = input(f.child, "bath at seven");
        routine.detail_type = DetailType::Routine;
        f.manager.create(f.guardian, routine).await.unwrap();

        let (all, total) = f.manager.list(f.guardian, f.child, DetailFilter::default()).await.unwrap();
        assert_eq!((all.len(), total), (2, 2));

        let filter = DetailFilter {
            detail_type: Some(DetailType::Routine),
            ..Default::default()
        };
        let (routines, total) = f.manager.list(f.guardian, f.child, filter).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(routines[0].content, "bath at seven");

        let filter = DetailFilter {
            tags: vec![" bath ".into()],
            ..Default::default()
        };
        let (by_tag, _) = f.manager.list(f.guardian, f.child, filter).await.unwrap();
        assert_eq!(by_tag.len(), 1);
    }
}
