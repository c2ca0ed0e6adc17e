//! The answer pipeline for Nestling.
//!
//! A question flows through these stages:
//!
//! 1. **Authorize** the caller against the child it names
//! 2. **Retrieve** the child's indexed details and shared knowledge
//! 3. **Assemble** profile, records, details, knowledge and prior Q&A under a
//!    token budget
//! 4. **Compose** the prompt with recent conversation turns
//! 5. **Generate** through the response cache, coalescing identical requests
//! 6. **Post-process** the answer and record the turn
//!
//! Detail edits reach the vector index asynchronously through the
//! [`IndexQueue`] and [`IndexWorker`].

pub mod access;
pub mod cache;
pub mod context;
pub mod details;
pub mod indexer;
pub mod ingest;
pub mod knowledge;
pub mod pipeline;
pub mod postprocess;
pub mod prompt;
pub mod retriever;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use access::authorize_child;
pub use cache::{CacheStatus, CachedAnswer, ResponseCache};
pub use context::{AssemblySettings, ContextAssembler, ContextBundle, Section, SectionKind};
pub use details::DetailManager;
pub use indexer::{DetailIndexer, IndexOutcome};
pub use ingest::{ContentType, DocumentLoader, IngestError, RecursiveSplitter};
pub use knowledge::{KnowledgeCatalog, SourceDocument};
pub use pipeline::{ChatAnswer, ChatPipeline, ChatRequest, PipelineSettings};
pub use postprocess::{Finalized, PostProcessor};
pub use prompt::{ComposedPrompt, PromptComposer};
pub use retriever::{Retrieved, Retriever};
pub use worker::{IndexJob, IndexQueue, IndexWorker, ReconcileReport, WorkerSettings};
