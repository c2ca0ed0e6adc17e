use super::{SqliteStore, parse_id, parse_ts, query_failed, ts};
use async_trait::async_trait;
use nestling_core::chat::{AppendOutcome, ChatHistoryStore, ChatTurn, HistoryQuery, SessionId};
use nestling_core::child::{ChildId, UserId};
use nestling_core::error::StoreError;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

const TURN_COLUMNS: &str =
    "session_id, sequence, user_id, child_id, question, answer, model, sources, created_at";

fn row_to_turn(row: &SqliteRow) -> Result<ChatTurn, StoreError> {
    let session_id: String = row.try_get("session_id").map_err(query_failed("session_id column"))?;
    let sequence: i64 = row.try_get("sequence").map_err(query_failed("sequence column"))?;
    let user_id: String = row.try_get("user_id").map_err(query_failed("user_id column"))?;
    let child_id: Option<String> = row.try_get("child_id").map_err(query_failed("child_id column"))?;
    let sources: String = row.try_get("sources").map_err(query_failed("sources column"))?;
    let created_at: String = row.try_get("created_at").map_err(query_failed("created_at column"))?;

    Ok(ChatTurn {
        session_id: SessionId(session_id),
        sequence: sequence.max(0) as u64,
        user_id: parse_id(&user_id, "user_id")?,
        child_id: child_id.map(|c| parse_id(&c, "child_id")).transpose()?,
        question: row.try_get("question").map_err(query_failed("question column"))?,
        answer: row.try_get("answer").map_err(query_failed("answer column"))?,
        model: row.try_get("model").map_err(query_failed("model column"))?,
        sources: serde_json::from_str(&sources).unwrap_or_default(),
        created_at: parse_ts(&created_at)?,
    })
}

#[async_trait]
impl ChatHistoryStore for SqliteStore {
    async fn recent(
        &self,
        user_id: UserId,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<ChatTurn>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TURN_COLUMNS} FROM chat_turns \
             WHERE user_id = ? AND session_id = ? ORDER BY sequence DESC LIMIT ?"
        ))
        .bind(user_id.to_string())
        .bind(session_id.as_str().to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("recent turns"))?;

        let mut turns = rows.iter().map(row_to_turn).collect::<Result<Vec<_>, _>>()?;
        turns.reverse();
        Ok(turns)
    }

    async fn append(&self, turn: ChatTurn) -> Result<AppendOutcome, StoreError> {
        let sources = serde_json::to_string(&turn.sources)
            .map_err(|e| StoreError::Storage(format!("sources encode: {e}")))?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO chat_turns
                (session_id, sequence, user_id, child_id, question, answer, model, sources, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(turn.session_id.0.clone())
        .bind(turn.sequence as i64)
        .bind(turn.user_id.to_string())
        .bind(turn.child_id.map(|c| c.to_string()))
        .bind(turn.question.clone())
        .bind(turn.answer.clone())
        .bind(turn.model.clone())
        .bind(sources)
        .bind(ts(&turn.created_at))
        .execute(&self.pool)
        .await
        .map_err(query_failed("append turn"))?;

        Ok(if result.rows_affected() == 0 {
            AppendOutcome::Duplicate
        } else {
            AppendOutcome::Inserted
        })
    }

    async fn append_next(&self, turn: ChatTurn) -> Result<u64, StoreError> {
        let sources = serde_json::to_string(&turn.sources)
            .map_err(|e| StoreError::Storage(format!("sources encode: {e}")))?;
        // One statement: SQLite holds the write lock across the MAX and the
        // insert, so two appends can never pick the same sequence.
        let row = sqlx::query(
            r#"
            INSERT INTO chat_turns
                (session_id, sequence, user_id, child_id, question, answer, model, sources, created_at)
            SELECT ?, COALESCE(MAX(sequence), 0) + 1, ?, ?, ?, ?, ?, ?, ?
            FROM chat_turns WHERE session_id = ?
            RETURNING sequence
            "#,
        )
        .bind(turn.session_id.0.clone())
        .bind(turn.user_id.to_string())
        .bind(turn.child_id.map(|c| c.to_string()))
        .bind(turn.question.clone())
        .bind(turn.answer.clone())
        .bind(turn.model.clone())
        .bind(sources)
        .bind(ts(&turn.created_at))
        .bind(turn.session_id.0.clone())
        .fetch_one(&self.pool)
        .await
        .map_err(query_failed("append next turn"))?;
        let sequence: i64 = row.try_get("sequence").map_err(query_failed("sequence column"))?;
        Ok(sequence.max(0) as u64)
    }

    async fn for_child(
        &self,
        user_id: UserId,
        child_id: ChildId,
        limit: usize,
    ) -> Result<Vec<ChatTurn>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TURN_COLUMNS} FROM chat_turns WHERE user_id = ? AND child_id = ? \
             ORDER BY created_at DESC, sequence DESC LIMIT ?"
        ))
        .bind(user_id.to_string())
        .bind(child_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("turns for child"))?;
        rows.iter().map(row_to_turn).collect()
    }

    async fn list(
        &self,
        user_id: UserId,
        query: &HistoryQuery,
    ) -> Result<(Vec<ChatTurn>, usize), StoreError> {
        let session = query.session_id.as_ref().map(|s| s.0.clone());
        let child = query.child_id.map(|c| c.to_string());
        let filter = "user_id = ? AND (? IS NULL OR session_id = ?) AND (? IS NULL OR child_id = ?)";

        let total_row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM chat_turns WHERE {filter}"))
            .bind(user_id.to_string())
            .bind(session.clone())
            .bind(session.clone())
            .bind(child.clone())
            .bind(child.clone())
            .fetch_one(&self.pool)
            .await
            .map_err(query_failed("count turns"))?;
        let total: i64 = total_row.try_get("n").map_err(query_failed("count column"))?;

        // SQLite treats a negative LIMIT as unbounded.
        let limit = if query.limit == 0 { -1 } else { query.limit as i64 };
        let rows = sqlx::query(&format!(
            "SELECT {TURN_COLUMNS} FROM chat_turns WHERE {filter} \
             ORDER BY created_at DESC, sequence DESC LIMIT ? OFFSET ?"
        ))
        .bind(user_id.to_string())
        .bind(session.clone())
        .bind(session)
        .bind(child.clone())
        .bind(child)
        .bind(limit)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("list turns"))?;

        let page = rows.iter().map(row_to_turn).collect::<Result<Vec<_>, _>>()?;
        Ok((page, total.max(0) as usize))
    }

    async fn sessions(&self, user_id: UserId) -> Result<Vec<SessionId>, StoreError> {
        let rows = sqlx::query(
            "SELECT session_id, MIN(created_at) AS started FROM chat_turns \
             WHERE user_id = ? GROUP BY session_id ORDER BY started ASC, session_id ASC",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("sessions"))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("session_id")
                    .map(SessionId)
                    .map_err(query_failed("session_id column"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    async fn store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    fn turn(session: &str, sequence: u64, user_id: UserId, child_id: Option<ChildId>) -> ChatTurn {
        ChatTurn {
            session_id: SessionId::from(session),
            sequence,
            user_id,
            child_id,
            question: format!("question {sequence}"),
            answer: format!("answer {sequence}"),
            model: "m".into(),
            sources: vec!["detail-1".into()],
            created_at: Utc::now() + Duration::milliseconds(sequence as i64),
        }
    }

    #[tokio::test]
    async fn append_ignores_duplicate_keys() {
        let store = store().await;
        let user = UserId::new();
        assert_eq!(
            store.append(turn("s1", 1, user, None)).await.unwrap(),
            AppendOutcome::Inserted
        );
        assert_eq!(
            store.append(turn("s1", 1, user, None)).await.unwrap(),
            AppendOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn append_next_continues_the_session() {
        let store = store().await;
        let user = UserId::new();
        assert_eq!(store.append_next(turn("fresh", 0, user, None)).await.unwrap(), 1);
        store.append(turn("s1", 1, user, None)).await.unwrap();
        store.append(turn("s1", 2, user, None)).await.unwrap();

        let (a, b) = tokio::join!(
            store.append_next(turn("s1", 0, user, None)),
            store.append_next(turn("s1", 0, user, None)),
        );
        let mut allocated = vec![a.unwrap(), b.unwrap()];
        allocated.sort_unstable();
        assert_eq!(allocated, vec![3, 4]);

        let seqs: Vec<u64> = store
            .recent(user, &SessionId::from("s1"), 10)
            .await
            .unwrap()
            .iter()
            .map(|t| t.sequence)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn recent_is_ordered_oldest_to_newest() {
        let store = store().await;
        let user = UserId::new();
        for seq in 1..=4 {
            store.append(turn("s1", seq, user, None)).await.unwrap();
        }
        let recent = store.recent(user, &SessionId::from("s1"), 2).await.unwrap();
        let seqs: Vec<u64> = recent.iter().map(|t| t.sequence).collect();
        assert_eq!(seqs, vec![3, 4]);
        assert_eq!(recent[0].sources, vec!["detail-1"]);
    }

    #[tokio::test]
    async fn list_paginates_with_total() {
        let store = store().await;
        let user = UserId::new();
        let child = ChildId::new();
        store.append(turn("s1", 1, user, Some(child))).await.unwrap();
        store.append(turn("s1", 2, user, Some(child))).await.unwrap();
        store.append(turn("s2", 1, user, None)).await.unwrap();
        store.append(turn("s3", 1, UserId::new(), Some(child))).await.unwrap();

        let (page, total) = store
            .list(
                user,
                &HistoryQuery {
                    child_id: Some(child),
                    offset: 1,
                    limit: 10,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].sequence, 1);

        let (all, total) = store.list(user, &HistoryQuery::default()).await.unwrap();
        assert_eq!((all.len(), total), (3, 3));

        let sessions = store.sessions(user).await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(store.for_child(user, child, 10).await.unwrap().len(), 2);
    }
}
