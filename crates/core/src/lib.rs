//! # nestling core
//!
//! Domain types, traits, and error definitions for the nestling caregiver
//! assistant. This crate defines the domain model; storage engines, model
//! clients and the retrieval pipeline implement against it.
//!
//! Every external collaborator (vector index, embedding service, language
//! model, relational stores, cache store) is a trait here so the pipeline can
//! be wired with real backends in production and fakes in tests.

pub mod cache;
pub mod cancel;
pub mod chat;
pub mod child;
pub mod embedding;
pub mod error;
pub mod knowledge;
pub mod message;
pub mod provider;
pub mod store;
pub mod vector;

pub use cache::CacheStore;
pub use cancel::{CancelToken, Interrupted};
pub use chat::{AppendOutcome, ChatHistoryStore, ChatTurn, HistoryQuery, SessionId, TurnKey};
pub use child::{
    ChildDetail, ChildDetailPatch, ChildId, ChildProfile, DetailId, DetailType, GrowthRecord,
    NewChildDetail, UserId,
};
pub use embedding::Embedder;
pub use error::{Error, Result};
pub use knowledge::{AgeRange, KnowledgeSegment};
pub use message::{Message, Role};
pub use provider::{Provider, ProviderRequest, ProviderResponse};
pub use store::{ChildDetailStore, ChildDirectory, DetailFilter, IndexMapping, MappedEntry};
pub use vector::{EntryMetadata, ScopeFilter, ScoredEntry, SourceKind, VectorEntry, VectorIndex};
