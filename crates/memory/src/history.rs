//! In-memory chat history store.

use async_trait::async_trait;
use nestling_core::chat::{AppendOutcome, ChatHistoryStore, ChatTurn, HistoryQuery, SessionId, TurnKey};
use nestling_core::child::{ChildId, UserId};
use nestling_core::error::StoreError;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Log {
    turns: Vec<ChatTurn>,
    keys: HashSet<TurnKey>,
}

/// Append-only turn log. Appends with an already-seen [`TurnKey`] are ignored.
#[derive(Clone, Default)]
pub struct InMemoryChatHistory {
    log: Arc<RwLock<Log>>,
}

impl InMemoryChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.log.read().await.turns.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Newest first: by creation time, then sequence.
fn newest_first(a: &&ChatTurn, b: &&ChatTurn) -> std::cmp::Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then(b.sequence.cmp(&a.sequence))
}

#[async_trait]
impl ChatHistoryStore for InMemoryChatHistory {
    async fn recent(
        &self,
        user_id: UserId,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<ChatTurn>, StoreError> {
        let log = self.log.read().await;
        let mut turns: Vec<&ChatTurn> = log
            .turns
            .iter()
            .filter(|t| t.user_id == user_id && &t.session_id == session_id)
            .collect();
        turns.sort_by_key(|t| t.sequence);
        let skip = turns.len().saturating_sub(limit);
        Ok(turns.into_iter().skip(skip).cloned().collect())
    }

    async fn append(&self, turn: ChatTurn) -> Result<AppendOutcome, StoreError> {
        let mut log = self.log.write().await;
        if !log.keys.insert(turn.key()) {
            return Ok(AppendOutcome::Duplicate);
        }
        log.turns.push(turn);
        Ok(AppendOutcome::Inserted)
    }

    async fn append_next(&self, mut turn: ChatTurn) -> Result<u64, StoreError> {
        let mut log = self.log.write().await;
        let last = log
            .turns
            .iter()
            .filter(|t| t.session_id == turn.session_id)
            .map(|t| t.sequence)
            .max()
            .unwrap_or(0);
        turn.sequence = last + 1;
        log.keys.insert(turn.key());
        log.turns.push(turn);
        Ok(last + 1)
    }

    async fn for_child(
        &self,
        user_id: UserId,
        child_id: ChildId,
        limit: usize,
    ) -> Result<Vec<ChatTurn>, StoreError> {
        let log = self.log.read().await;
        let mut turns: Vec<&ChatTurn> = log
            .turns
            .iter()
            .filter(|t| t.user_id == user_id && t.child_id == Some(child_id))
            .collect();
        turns.sort_by(newest_first);
        Ok(turns.into_iter().take(limit).cloned().collect())
    }

    async fn list(
        &self,
        user_id: UserId,
        query: &HistoryQuery,
    ) -> Result<(Vec<ChatTurn>, usize), StoreError> {
        let log = self.log.read().await;
        let mut turns: Vec<&ChatTurn> = log
            .turns
            .iter()
            .filter(|t| t.user_id == user_id)
            .filter(|t| query.session_id.as_ref().is_none_or(|s| &t.session_id == s))
            .filter(|t| query.child_id.is_none_or(|c| t.child_id == Some(c)))
            .collect();
        turns.sort_by(newest_first);
        let total = turns.len();
        let limit = if query.limit == 0 { usize::MAX } else { query.limit };
        let page = turns
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn sessions(&self, user_id: UserId) -> Result<Vec<SessionId>, StoreError> {
        let log = self.log.read().await;
        let mut seen = HashSet::new();
        let mut sessions = Vec::new();
        for turn in log.turns.iter().filter(|t| t.user_id == user_id) {
            if seen.insert(turn.session_id.clone()) {
                sessions.push(turn.session_id.clone());
            }
        }
        Ok(sessions)
    }
}
