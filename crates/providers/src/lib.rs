//! Model service clients for nestling.
//!
//! - [`OpenAiCompatProvider`]: chat completions and embeddings over any
//!   OpenAI-compatible endpoint (OpenRouter by default).
//! - [`HashEmbedder`]: deterministic local embedder for offline use.
//! - [`GenerationClient`]: retry, backoff and cancellation around a provider.

pub mod generation;
pub mod hash_embedder;
pub mod openai_compat;

pub use generation::{Generation, GenerationClient, RetryPolicy};
pub use hash_embedder::HashEmbedder;
pub use openai_compat::OpenAiCompatProvider;
