//! Storage backends for Nestling.
//!
//! Every trait from `nestling-core` has an in-process implementation for
//! tests and single-node use, and (behind the default `sqlite` feature) a
//! durable one sharing a single SQLite database.

pub mod cache;
pub mod children;
pub mod history;
pub mod in_memory;
pub mod vector;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use cache::InMemoryCacheStore;
pub use children::InMemoryChildStore;
pub use history::InMemoryChatHistory;
pub use in_memory::InMemoryVectorIndex;
pub use vector::{cosine_similarity, rank};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
