//! Chat turns and the append-only history store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::child::{ChildId, UserId};
use crate::error::StoreError;

/// Identifier of a chat session, chosen by the client or generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Idempotency key for appends: a session plus its turn sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnKey {
    pub session_id: SessionId,
    pub sequence: u64,
}

/// One completed question/answer exchange. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub session_id: SessionId,
    /// Monotonically increasing within a session, starting at 1.
    pub sequence: u64,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_id: Option<ChildId>,
    pub question: String,
    pub answer: String,
    pub model: String,
    /// Document ids cited by the answer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatTurn {
    pub fn key(&self) -> TurnKey {
        TurnKey {
            session_id: self.session_id.clone(),
            sequence: self.sequence,
        }
    }
}

/// Outcome of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// A turn with the same key already exists; nothing was written.
    Duplicate,
}

/// Filter for listing a user's turns.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub session_id: Option<SessionId>,
    pub child_id: Option<ChildId>,
    pub offset: usize,
    pub limit: usize,
}

/// Append-only log of chat turns.
#[async_trait]
pub trait ChatHistoryStore: Send + Sync {
    /// Most recent `limit` turns of a session for this user, newest last.
    async fn recent(
        &self,
        user_id: UserId,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<ChatTurn>, StoreError>;

    /// Append a turn. Re-appending the same [`TurnKey`] is a no-op.
    async fn append(&self, turn: ChatTurn) -> Result<AppendOutcome, StoreError>;

    /// Append a turn at the session's next free sequence, ignoring
    /// `turn.sequence`. Allocation and insert are one atomic step, so
    /// concurrent appends to a session never collide. Returns the sequence
    /// the turn was stored under.
    async fn append_next(&self, turn: ChatTurn) -> Result<u64, StoreError>;

    /// A user's prior turns about one child, newest first.
    async fn for_child(
        &self,
        user_id: UserId,
        child_id: ChildId,
        limit: usize,
    ) -> Result<Vec<ChatTurn>, StoreError>;

    /// Paginated listing, newest first, plus the total matching count.
    async fn list(
        &self,
        user_id: UserId,
        query: &HistoryQuery,
    ) -> Result<(Vec<ChatTurn>, usize), StoreError>;

    /// Distinct session ids for a user.
    async fn sessions(&self, user_id: UserId) -> Result<Vec<SessionId>, StoreError>;
}
