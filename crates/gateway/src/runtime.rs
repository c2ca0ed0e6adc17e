//! Process wiring: storage backends, model clients, the answer pipeline and
//! the background index worker, constructed once and torn down together.

use std::sync::Arc;

use nestling_config::{AppConfig, EmbeddingBackend, ModelInfo};
use nestling_core::cache::CacheStore;
use nestling_core::cancel::CancelToken;
use nestling_core::chat::ChatHistoryStore;
use nestling_core::embedding::Embedder;
use nestling_core::error::Error;
use nestling_core::provider::Provider;
use nestling_core::store::{ChildDetailStore, ChildDirectory, IndexMapping};
use nestling_core::vector::VectorIndex;
use nestling_memory::{InMemoryCacheStore, InMemoryChatHistory, InMemoryChildStore, InMemoryVectorIndex, SqliteStore};
use nestling_providers::{GenerationClient, HashEmbedder, OpenAiCompatProvider, RetryPolicy};
use nestling_rag::{
    AssemblySettings, ChatPipeline, ContextAssembler, DetailIndexer, DetailManager, IndexQueue, IndexWorker,
    KnowledgeCatalog, PipelineSettings, PostProcessor, PromptComposer, ReconcileReport, ResponseCache, Retriever,
    WorkerSettings,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// The external collaborators the pipeline runs against.
pub struct Backends {
    pub directory: Arc<dyn ChildDirectory>,
    pub details: Arc<dyn ChildDetailStore>,
    pub mapping: Arc<dyn IndexMapping>,
    pub history: Arc<dyn ChatHistoryStore>,
    pub cache_store: Arc<dyn CacheStore>,
    pub index: Arc<dyn VectorIndex>,
    pub embedder: Arc<dyn Embedder>,
    pub provider: Arc<dyn Provider>,
    sqlite: Option<Arc<SqliteStore>>,
}

impl Backends {
    /// In-process stores around `children`, which the caller keeps to seed
    /// profiles and records.
    pub fn in_memory(children: InMemoryChildStore, embedder: Arc<dyn Embedder>, provider: Arc<dyn Provider>) -> Self {
        let children = Arc::new(children);
        Self {
            directory: children.clone(),
            details: children.clone(),
            mapping: children,
            history: Arc::new(InMemoryChatHistory::new()),
            cache_store: Arc::new(InMemoryCacheStore::new()),
            index: Arc::new(InMemoryVectorIndex::new()),
            embedder,
            provider,
            sqlite: None,
        }
    }

    /// Every store on one SQLite database.
    pub fn sqlite(store: Arc<SqliteStore>, embedder: Arc<dyn Embedder>, provider: Arc<dyn Provider>) -> Self {
        Self {
            directory: store.clone(),
            details: store.clone(),
            mapping: store.clone(),
            history: store.clone(),
            cache_store: store.clone(),
            index: store.clone(),
            embedder,
            provider,
            sqlite: Some(store),
        }
    }

    /// Backends described by `[provider]` and `[storage]`.
    pub async fn from_config(config: &AppConfig) -> Result<Self, Error> {
        let remote = Arc::new(OpenAiCompatProvider::from_config(&config.provider)?);
        let embedder: Arc<dyn Embedder> = match config.provider.embedding_backend {
            EmbeddingBackend::Remote => remote.clone(),
            EmbeddingBackend::Local => Arc::new(HashEmbedder::new(config.provider.local_dimensions)),
        };
        info!(
            provider = remote.name(),
            embedder = embedder.model(),
            database = %config.storage.database,
            "Backends configured"
        );

        if config.storage.is_in_memory() {
            return Ok(Self::in_memory(InMemoryChildStore::new(), embedder, remote));
        }
        let store = SqliteStore::new(&sqlite_url(&config.storage.database)).await?;
        Ok(Self::sqlite(Arc::new(store), embedder, remote))
    }
}

fn sqlite_url(database: &str) -> String {
    if database.starts_with("sqlite:") {
        database.to_string()
    } else {
        format!("sqlite://{database}")
    }
}

/// Request-path services shared by every handler.
pub struct Services {
    pub pipeline: ChatPipeline,
    pub details: DetailManager,
    pub knowledge: KnowledgeCatalog,
    pub history: Arc<dyn ChatHistoryStore>,
    pub models: Vec<ModelInfo>,
}

/// Owns the services plus the background worker and its shutdown signal.
pub struct Runtime {
    config: AppConfig,
    services: Arc<Services>,
    worker: Option<IndexWorker>,
    worker_task: Option<JoinHandle<()>>,
    shutdown: CancelToken,
    sqlite: Option<Arc<SqliteStore>>,
}

impl Runtime {
    /// Build backends from `config` and wire everything on top.
    pub async fn open(config: AppConfig) -> Result<Self, Error> {
        let backends = Backends::from_config(&config).await?;
        Self::assemble(config, backends)
    }

    /// Wire the pipeline over explicit backends. The index worker is built
    /// but not started; see [`Runtime::start_worker`].
    pub fn assemble(config: AppConfig, backends: Backends) -> Result<Self, Error> {
        let Backends {
            directory,
            details,
            mapping,
            history,
            cache_store,
            index,
            embedder,
            provider,
            sqlite,
        } = backends;

        let cache = ResponseCache::from_config(cache_store, &config.cache);
        let retriever = Arc::new(Retriever::new(
            embedder.clone(),
            index.clone(),
            config.retrieval.timeout(),
        ));
        let assembler = Arc::new(ContextAssembler::new(
            directory.clone(),
            history.clone(),
            retriever,
            AssemblySettings::from_config(&config.retrieval, &config.context),
        ));
        let generator = Arc::new(GenerationClient::new(
            provider,
            RetryPolicy::from_config(&config.generation),
        ));
        let pipeline = ChatPipeline::new(
            history.clone(),
            assembler,
            PromptComposer::new(config.context.max_prompt_tokens),
            generator,
            PostProcessor::from_config(&config.safety)?,
            cache.clone(),
            PipelineSettings::from_config(&config),
        );

        let (queue, rx) = IndexQueue::new(config.indexer.queue_capacity);
        let indexer = Arc::new(DetailIndexer::new(embedder.clone(), index.clone(), mapping.clone()));
        let worker = IndexWorker::new(
            indexer,
            details.clone(),
            mapping,
            queue.clone(),
            rx,
            WorkerSettings::from_config(&config.indexer),
        )
        .with_cache(cache.clone());

        let services = Arc::new(Services {
            pipeline,
            details: DetailManager::new(directory, details, queue, cache.clone()),
            knowledge: KnowledgeCatalog::new(embedder, index, cache),
            history,
            models: config.models.clone(),
        });

        Ok(Self {
            config,
            services,
            worker: Some(worker),
            worker_task: None,
            shutdown: CancelToken::new(),
            sqlite,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn services(&self) -> Arc<Services> {
        self.services.clone()
    }

    /// Spawn the index worker. Returns `false` if it is already running.
    pub fn start_worker(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            return false;
        };
        self.worker_task = Some(worker.spawn(self.shutdown.clone()));
        true
    }

    /// Sweep the index until a pass changes nothing. Only available before
    /// the worker has been started.
    pub async fn reconcile_all(&self) -> Result<ReconcileReport, Error> {
        let Some(worker) = &self.worker else {
            return Err(Error::Internal("index worker is already running".into()));
        };
        let mut total = ReconcileReport::default();
        loop {
            let pass = worker.reconcile().await;
            total.reindexed += pass.reindexed;
            total.removed += pass.removed;
            total.failed += pass.failed;
            if pass.reindexed == 0 && pass.removed == 0 {
                return Ok(total);
            }
        }
    }

    /// Stop the worker and close storage.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.worker_task.take()
            && let Err(e) = task.await
        {
            warn!("Index worker ended abnormally: {e}");
        }
        if let Some(store) = self.sqlite.take() {
            store.close().await;
        }
        info!("Runtime stopped");
    }
}
