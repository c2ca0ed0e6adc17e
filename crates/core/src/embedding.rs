//! Embedding service abstraction.
//!
//! The same embedder (and therefore the same model) must be used for indexing
//! and for query-time embedding, otherwise similarity scores are meaningless.

use async_trait::async_trait;
use crate::error::IndexError;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier of the embedding model (e.g., "openai/text-embedding-3-small").
    fn model(&self) -> &str;

    /// Fixed output dimension, when known up front.
    fn dimensions(&self) -> Option<usize> {
        None
    }

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError>;

    /// Embed a single query text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, IndexError> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| IndexError::EmbeddingFailed("embedder returned no vectors".into()))
    }
}
