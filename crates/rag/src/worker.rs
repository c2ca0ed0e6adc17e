//! Background indexing.
//!
//! Detail mutations push the detail id onto a bounded [`IndexQueue`] and
//! return. The [`IndexWorker`] reads the detail as it is *now* when the job
//! runs, so replaying a job, or running several for the same detail, ends in
//! the same index state. Failed jobs come back after exponential backoff; a
//! periodic reconcile sweep catches anything the queue lost (overflow,
//! exhausted retries, restarts).

use crate::cache::ResponseCache;
use crate::indexer::{DetailIndexer, IndexOutcome};
use nestling_config::IndexerConfig;
use nestling_core::cancel::CancelToken;
use nestling_core::child::DetailId;
use nestling_core::error::Error;
use nestling_core::store::{ChildDetailStore, IndexMapping};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A pending indexing obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexJob {
    pub detail_id: DetailId,
    /// Failed attempts so far.
    pub attempt: u32,
}

/// Sending half of the indexing queue. Cheap to clone.
#[derive(Clone)]
pub struct IndexQueue {
    tx: mpsc::Sender<IndexJob>,
}

impl IndexQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<IndexJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue `detail_id` for (re)indexing. Never blocks; returns `false` when
    /// the queue is full or closed, leaving the detail to the reconcile sweep.
    pub fn enqueue(&self, detail_id: DetailId) -> bool {
        self.send(IndexJob { detail_id, attempt: 0 })
    }

    fn send(&self, job: IndexJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                warn!(detail_id = %job.detail_id, "Index queue full, deferring to reconcile");
                false
            }
            Err(TrySendError::Closed(job)) => {
                warn!(detail_id = %job.detail_id, "Index queue closed, deferring to reconcile");
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub reconcile_interval: Duration,
    pub reconcile_batch: usize,
}

impl WorkerSettings {
    pub fn from_config(config: &IndexerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            reconcile_interval: Duration::from_secs(config.reconcile_interval_secs.max(1)),
            reconcile_batch: config.reconcile_batch,
        }
    }

    /// `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.backoff_max)
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&IndexerConfig::default())
    }
}

/// What one reconcile sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub reindexed: usize,
    pub removed: usize,
    pub failed: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.reindexed == 0 && self.removed == 0 && self.failed == 0
    }
}

pub struct IndexWorker {
    indexer: Arc<DetailIndexer>,
    details: Arc<dyn ChildDetailStore>,
    mapping: Arc<dyn IndexMapping>,
    cache: Option<ResponseCache>,
    queue: IndexQueue,
    rx: mpsc::Receiver<IndexJob>,
    settings: WorkerSettings,
}

impl IndexWorker {
    pub fn new(
        indexer: Arc<DetailIndexer>,
        details: Arc<dyn ChildDetailStore>,
        mapping: Arc<dyn IndexMapping>,
        queue: IndexQueue,
        rx: mpsc::Receiver<IndexJob>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            indexer,
            details,
            mapping,
            cache: None,
            queue,
            rx,
            settings,
        }
    }

    /// Invalidate a child's cached answers whenever one of its details lands
    /// in the index.
    pub fn with_cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Bring the index in line with the current state of one detail.
    pub async fn process(&self, detail_id: DetailId) -> Result<(), Error> {
        match self.details.get(detail_id).await? {
            Some(detail) => {
                let outcome = self.indexer.index(&detail).await?;
                if let IndexOutcome::Indexed { .. } = outcome
                    && let Some(cache) = &self.cache
                {
                    cache.invalidate_child(detail.child_id).await;
                }
            }
            None => {
                if self.indexer.remove(detail_id).await? {
                    debug!(detail_id = %detail_id, "Removed entry for deleted detail");
                }
            }
        }
        Ok(())
    }

    async fn handle(&self, job: IndexJob) {
        let Err(e) = self.process(job.detail_id).await else {
            return;
        };
        let failed = job.attempt + 1;
        if failed >= self.settings.max_attempts {
            error!(
                detail_id = %job.detail_id,
                attempts = failed,
                "Indexing gave up, leaving detail to reconcile: {e}"
            );
            return;
        }

        let delay = self.settings.backoff(job.attempt);
        warn!(
            detail_id = %job.detail_id,
            attempt = failed,
            delay_ms = delay.as_millis() as u64,
            "Indexing failed, retrying: {e}"
        );
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.send(IndexJob {
                detail_id: job.detail_id,
                attempt: failed,
            });
        });
    }

    /// Index details whose entry is missing or behind, and drop mappings
    /// whose detail is gone. Runs inline, one batch per call.
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let batch = self.settings.reconcile_batch;

        match self.mapping.stale(batch).await {
            Ok(stale) => {
                for detail_id in stale {
                    match self.process(detail_id).await {
                        Ok(()) => report.reindexed += 1,
                        Err(e) => {
                            warn!(detail_id = %detail_id, "Reconcile could not index detail: {e}");
                            report.failed += 1;
                        }
                    }
                }
            }
            Err(e) => warn!("Reconcile could not list stale details: {e}"),
        }

        match self.mapping.orphans(batch).await {
            Ok(orphans) => {
                for orphan in orphans {
                    match self.indexer.remove(orphan.detail_id).await {
                        Ok(_) => report.removed += 1,
                        Err(e) => {
                            warn!(detail_id = %orphan.detail_id, "Reconcile could not remove orphan: {e}");
                            report.failed += 1;
                        }
                    }
                }
            }
            Err(e) => warn!("Reconcile could not list orphaned entries: {e}"),
        }

        if !report.is_empty() {
            info!(
                reindexed = report.reindexed,
                removed = report.removed,
                failed = report.failed,
                "Index reconciled"
            );
        }
        report
    }

    /// Run until `shutdown` fires: drain jobs as they arrive and reconcile on
    /// a fixed interval (the first sweep runs immediately).
    pub fn spawn(self, shutdown: CancelToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(mut self, shutdown: CancelToken) {
        let mut sweep = tokio::time::interval(self.settings.reconcile_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            index = self.indexer.index_name(),
            reconcile_secs = self.settings.reconcile_interval.as_secs(),
            "Index worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown.interrupted() => break,
                job = self.rx.recv() => match job {
                    Some(job) => self.handle(job).await,
                    None => break,
                },
                _ = sweep.tick() => {
                    self.reconcile().await;
                }
            }
        }
        info!("Index worker stopped");
    }
}
