use super::SqliteStore;
use crate::vector;
use async_trait::async_trait;
use nestling_core::error::IndexError;
use nestling_core::vector::{
    EntryMetadata, ScopeFilter, ScoredEntry, SourceKind, VectorEntry, VectorIndex,
};
use sqlx::Row;

fn failed(context: &'static str) -> impl Fn(sqlx::Error) -> IndexError {
    move |e| IndexError::QueryFailed(format!("{context}: {e}"))
}

#[async_trait]
impl VectorIndex for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn upsert(&self, entry: VectorEntry) -> Result<(), IndexError> {
        let metadata = serde_json::to_string(&entry.metadata)
            .map_err(|e| IndexError::QueryFailed(format!("metadata encode: {e}")))?;
        let owner = entry.metadata.owner().map(|c| c.to_string());

        sqlx::query(
            r#"
            INSERT INTO vector_entries (id, source, owner_child_id, document, metadata, embedding, dimensions)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                source = excluded.source,
                owner_child_id = excluded.owner_child_id,
                document = excluded.document,
                metadata = excluded.metadata,
                embedding = excluded.embedding,
                dimensions = excluded.dimensions
            "#,
        )
        .bind(&entry.id)
        .bind(entry.metadata.source().as_str())
        .bind(owner)
        .bind(&entry.document)
        .bind(metadata)
        .bind(vector::to_blob(&entry.embedding))
        .bind(entry.embedding.len() as i64)
        .execute(&self.pool)
        .await
        .map_err(failed("upsert"))?;
        Ok(())
    }

    async fn delete(&self, entry_id: &str) -> Result<bool, IndexError> {
        let result = sqlx::query("DELETE FROM vector_entries WHERE id = ?")
            .bind(entry_id)
            .execute(&self.pool)
            .await
            .map_err(failed("delete"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn query(
        &self,
        embedding: &[f32],
        filter: &ScopeFilter,
        k: usize,
    ) -> Result<Vec<ScoredEntry>, IndexError> {
        // Hard scope filter in SQL; ranking (and a second filter pass) in Rust.
        let rows = sqlx::query(
            r#"
            SELECT id, document, metadata, embedding FROM vector_entries
            WHERE dimensions = ?
              AND ((owner_child_id IS NOT NULL AND owner_child_id = ?)
                   OR (source = ? AND ?))
            "#,
        )
        .bind(embedding.len() as i64)
        .bind(filter.child_id.map(|c| c.to_string()))
        .bind(SourceKind::SharedKnowledge.as_str())
        .bind(filter.include_shared)
        .fetch_all(&self.pool)
        .await
        .map_err(failed("query"))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let metadata: String = row.try_get("metadata").map_err(failed("metadata column"))?;
            let metadata: EntryMetadata = serde_json::from_str(&metadata)
                .map_err(|e| IndexError::QueryFailed(format!("metadata decode: {e}")))?;
            let blob: Vec<u8> = row.try_get("embedding").map_err(failed("embedding column"))?;
            entries.push(VectorEntry {
                id: row.try_get("id").map_err(failed("id column"))?,
                document: row.try_get("document").map_err(failed("document column"))?,
                metadata,
                embedding: vector::from_blob(&blob),
            });
        }

        Ok(vector::rank(&entries, embedding, filter, k))
    }

    async fn count(&self) -> Result<usize, IndexError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM vector_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(failed("count"))?;
        let n: i64 = row.try_get("n").map_err(failed("count column"))?;
        Ok(n as usize)
    }
}
