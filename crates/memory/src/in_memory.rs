//! In-memory vector index: useful for testing and ephemeral deployments.

use crate::vector;
use async_trait::async_trait;
use nestling_core::error::IndexError;
use nestling_core::vector::{ScopeFilter, ScoredEntry, VectorEntry, VectorIndex};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    entries: HashMap<String, VectorEntry>,
    dimensions: Option<usize>,
}

/// A brute-force vector index held in a HashMap.
///
/// The embedding dimension is fixed by the first upsert; later upserts and
/// queries with a different dimension are rejected.
pub struct InMemoryVectorIndex {
    state: Arc<RwLock<State>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
        }
    }

    /// Entry ids currently held, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.read().await.entries.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn check_dims(expected: Option<usize>, actual: usize) -> Result<(), IndexError> {
    match expected {
        Some(expected) if expected != actual => {
            Err(IndexError::DimensionMismatch { expected, actual })
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn upsert(&self, entry: VectorEntry) -> Result<(), IndexError> {
        let mut state = self.state.write().await;
        check_dims(state.dimensions, entry.embedding.len())?;
        if state.dimensions.is_none() && !entry.embedding.is_empty() {
            state.dimensions = Some(entry.embedding.len());
        }
        state.entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn delete(&self, entry_id: &str) -> Result<bool, IndexError> {
        Ok(self.state.write().await.entries.remove(entry_id).is_some())
    }

    async fn query(
        &self,
        embedding: &[f32],
        filter: &ScopeFilter,
        k: usize,
    ) -> Result<Vec<ScoredEntry>, IndexError> {
        let state = self.state.read().await;
        check_dims(state.dimensions, embedding.len())?;
        Ok(vector::rank(state.entries.values(), embedding, filter, k))
    }

    async fn count(&self) -> Result<usize, IndexError> {
        Ok(self.state.read().await.entries.len())
    }
}
