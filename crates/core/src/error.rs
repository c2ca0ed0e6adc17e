//! Error types for the nestling domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all nestling operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Vector index errors ---
    #[error("Vector index error: {0}")]
    Index(#[from] IndexError),

    // --- Relational / cache store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Request rejection ---
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    // --- Cancellation ---
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Request deadline exceeded")]
    DeadlineExceeded,

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error rejects the request before any downstream call.
    pub fn is_fatal_to_request(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::NotFound(_) | Self::Unauthorized(_)
        )
    }
}

impl From<crate::cancel::Interrupted> for Error {
    fn from(value: crate::cancel::Interrupted) -> Self {
        match value {
            crate::cancel::Interrupted::Cancelled => Self::Cancelled,
            crate::cancel::Interrupted::DeadlineExceeded => Self::DeadlineExceeded,
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// Transient failures worth another attempt.
    ///
    /// Quota exhaustion, authentication and malformed prompts fail the same
    /// way on every retry and propagate immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ApiError { status_code, .. } => *status_code >= 500,
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Network(_) => true,
            Self::QuotaExhausted(_)
            | Self::InvalidRequest(_)
            | Self::AuthenticationFailed(_)
            | Self::ModelNotFound(_)
            | Self::NotConfigured(_) => false,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum IndexError {
    #[error("Vector index unavailable: {0}")]
    Unavailable(String),

    #[error("Vector query failed: {0}")]
    QueryFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}
