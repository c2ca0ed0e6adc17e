use super::{SqliteStore, parse_id, parse_ts, query_failed, ts};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use nestling_core::child::{ChildDetail, ChildId, ChildProfile, DetailId, GrowthRecord};
use nestling_core::error::StoreError;
use nestling_core::store::{
    ChildDetailStore, ChildDirectory, DetailFilter, IndexMapping, MappedEntry,
};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

const DETAIL_COLUMNS: &str = "d.id, d.child_id, d.detail_type, d.content, d.tags, d.importance, \
     d.recorded_at, d.created_at, d.updated_at, d.revision, m.entry_id";

impl SqliteStore {
    /// Insert or replace a child profile.
    pub async fn put_profile(&self, profile: ChildProfile) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO children (id, name, birthdate, gender, guardian_id)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                birthdate = excluded.birthdate,
                gender = excluded.gender,
                guardian_id = excluded.guardian_id
            "#,
        )
        .bind(profile.id.to_string())
        .bind(profile.name)
        .bind(profile.birthdate.to_string())
        .bind(profile.gender)
        .bind(profile.guardian_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(query_failed("put profile"))?;
        Ok(())
    }

    /// Insert a growth record.
    pub async fn put_record(&self, record: GrowthRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO growth_records (id, child_id, category, value, notes, recorded_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.child_id.to_string())
        .bind(record.category)
        .bind(record.value.to_string())
        .bind(record.notes)
        .bind(ts(&record.recorded_at))
        .execute(&self.pool)
        .await
        .map_err(query_failed("put record"))?;
        Ok(())
    }

    fn row_to_detail(row: &SqliteRow) -> Result<ChildDetail, StoreError> {
        let get = |col: &str| -> Result<String, StoreError> {
            row.try_get::<String, _>(col)
                .map_err(|e| StoreError::QueryFailed(format!("{col} column: {e}")))
        };
        let tags: Vec<String> = serde_json::from_str(&get("tags")?).unwrap_or_default();
        let importance: i64 = row.try_get("importance").map_err(query_failed("importance column"))?;
        let revision: i64 = row.try_get("revision").map_err(query_failed("revision column"))?;
        let entry_id: Option<String> = row.try_get("entry_id").map_err(query_failed("entry_id column"))?;

        Ok(ChildDetail {
            id: parse_id(&get("id")?, "id")?,
            child_id: parse_id(&get("child_id")?, "child_id")?,
            detail_type: get("detail_type")?
                .parse()
                .map_err(|e: String| StoreError::QueryFailed(e))?,
            content: get("content")?,
            tags,
            importance: importance.clamp(0, u8::MAX as i64) as u8,
            recorded_at: parse_ts(&get("recorded_at")?)?,
            created_at: parse_ts(&get("created_at")?)?,
            updated_at: parse_ts(&get("updated_at")?)?,
            revision: revision.max(0) as u64,
            embedding_ref: entry_id,
        })
    }

    fn row_to_mapping(row: &SqliteRow) -> Result<MappedEntry, StoreError> {
        let detail_id: String = row.try_get("detail_id").map_err(query_failed("detail_id column"))?;
        let child_id: String = row.try_get("child_id").map_err(query_failed("child_id column"))?;
        let revision: i64 = row.try_get("revision").map_err(query_failed("revision column"))?;
        Ok(MappedEntry {
            detail_id: parse_id(&detail_id, "detail_id")?,
            child_id: parse_id(&child_id, "child_id")?,
            entry_id: row.try_get("entry_id").map_err(query_failed("entry_id column"))?,
            revision: revision.max(0) as u64,
        })
    }

    async fn insert_detail<'e, E>(executor: E, detail: &ChildDetail) -> Result<(), StoreError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let tags = serde_json::to_string(&detail.tags)
            .map_err(|e| StoreError::Storage(format!("tags encode: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO child_details
                (id, child_id, detail_type, content, tags, importance, recorded_at, created_at, updated_at, revision)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(detail.id.to_string())
        .bind(detail.child_id.to_string())
        .bind(detail.detail_type.as_str())
        .bind(detail.content.clone())
        .bind(tags)
        .bind(detail.importance as i64)
        .bind(ts(&detail.recorded_at))
        .bind(ts(&detail.created_at))
        .bind(ts(&detail.updated_at))
        .bind(detail.revision as i64)
        .execute(executor)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(format!("detail {} already exists", detail.id))
            }
            _ => StoreError::QueryFailed(format!("insert detail: {e}")),
        })?;
        Ok(())
    }
}

#[async_trait]
impl ChildDirectory for SqliteStore {
    async fn profile(&self, child_id: ChildId) -> Result<Option<ChildProfile>, StoreError> {
        let row = sqlx::query("SELECT id, name, birthdate, gender, guardian_id FROM children WHERE id = ?")
            .bind(child_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed("get profile"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let birthdate: String = row.try_get("birthdate").map_err(query_failed("birthdate column"))?;
        let guardian: String = row.try_get("guardian_id").map_err(query_failed("guardian_id column"))?;
        Ok(Some(ChildProfile {
            id: child_id,
            name: row.try_get("name").map_err(query_failed("name column"))?,
            birthdate: NaiveDate::parse_from_str(&birthdate, "%Y-%m-%d")
                .map_err(|e| StoreError::QueryFailed(format!("birthdate column: {e}")))?,
            gender: row.try_get("gender").map_err(query_failed("gender column"))?,
            guardian_id: parse_id(&guardian, "guardian_id")?,
        }))
    }

    async fn recent_records(
        &self,
        child_id: ChildId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GrowthRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, category, value, notes, recorded_at FROM growth_records \
             WHERE child_id = ? AND recorded_at >= ? ORDER BY recorded_at DESC LIMIT ?",
        )
        .bind(child_id.to_string())
        .bind(ts(&since))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("recent records"))?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(query_failed("id column"))?;
                let value: String = row.try_get("value").map_err(query_failed("value column"))?;
                let recorded_at: String =
                    row.try_get("recorded_at").map_err(query_failed("recorded_at column"))?;
                Ok(GrowthRecord {
                    id: parse_id(&id, "id")?,
                    child_id,
                    category: row.try_get("category").map_err(query_failed("category column"))?,
                    value: serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value)),
                    notes: row.try_get("notes").map_err(query_failed("notes column"))?,
                    recorded_at: parse_ts(&recorded_at)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ChildDetailStore for SqliteStore {
    async fn insert(&self, detail: ChildDetail) -> Result<(), StoreError> {
        Self::insert_detail(&self.pool, &detail).await
    }

    async fn insert_batch(&self, details: Vec<ChildDetail>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(query_failed("begin"))?;
        for detail in &details {
            Self::insert_detail(&mut *tx, detail).await?;
        }
        tx.commit().await.map_err(query_failed("commit"))?;
        Ok(())
    }

    async fn update(&self, detail: ChildDetail) -> Result<(), StoreError> {
        let tags = serde_json::to_string(&detail.tags)
            .map_err(|e| StoreError::Storage(format!("tags encode: {e}")))?;
        let result = sqlx::query(
            r#"
            UPDATE child_details SET
                detail_type = ?, content = ?, tags = ?, importance = ?,
                recorded_at = ?, updated_at = ?, revision = ?
            WHERE id = ? AND revision = ?
            "#,
        )
        .bind(detail.detail_type.as_str())
        .bind(&detail.content)
        .bind(tags)
        .bind(detail.importance as i64)
        .bind(ts(&detail.recorded_at))
        .bind(ts(&detail.updated_at))
        .bind(detail.revision as i64)
        .bind(detail.id.to_string())
        .bind(detail.revision.saturating_sub(1) as i64)
        .execute(&self.pool)
        .await
        .map_err(query_failed("update detail"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "detail {} was modified or deleted concurrently",
                detail.id
            )));
        }
        Ok(())
    }

    async fn delete(&self, id: DetailId) -> Result<Option<ChildDetail>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(query_failed("begin"))?;
        let row = sqlx::query(&format!(
            "SELECT {DETAIL_COLUMNS} FROM child_details d \
             LEFT JOIN detail_index_map m ON m.detail_id = d.id WHERE d.id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_failed("select detail"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let detail = Self::row_to_detail(&row)?;

        sqlx::query("DELETE FROM child_details WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_failed("delete detail"))?;
        tx.commit().await.map_err(query_failed("commit"))?;
        Ok(Some(detail))
    }

    async fn get(&self, id: DetailId) -> Result<Option<ChildDetail>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DETAIL_COLUMNS} FROM child_details d \
             LEFT JOIN detail_index_map m ON m.detail_id = d.id WHERE d.id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed("get detail"))?;
        row.as_ref().map(Self::row_to_detail).transpose()
    }

    async fn list(
        &self,
        child_id: ChildId,
        filter: &DetailFilter,
    ) -> Result<(Vec<ChildDetail>, usize), StoreError> {
        // Tag matching is any-of over a JSON array; done in Rust after the
        // type filter narrows rows in SQL.
        let rows = sqlx::query(&format!(
            "SELECT {DETAIL_COLUMNS} FROM child_details d \
             LEFT JOIN detail_index_map m ON m.detail_id = d.id \
             WHERE d.child_id = ? AND (? IS NULL OR d.detail_type = ?) \
             ORDER BY d.recorded_at DESC, d.id ASC"
        ))
        .bind(child_id.to_string())
        .bind(filter.detail_type.map(|t| t.as_str()))
        .bind(filter.detail_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("list details"))?;

        let mut matching = Vec::new();
        for row in &rows {
            let detail = Self::row_to_detail(row)?;
            if filter.matches(&detail) {
                matching.push(detail);
            }
        }
        let total = matching.len();
        let limit = if filter.limit == 0 { usize::MAX } else { filter.limit };
        let page = matching.into_iter().skip(filter.offset).take(limit).collect();
        Ok((page, total))
    }
}

#[async_trait]
impl IndexMapping for SqliteStore {
    async fn entry_for(&self, detail_id: DetailId) -> Result<Option<MappedEntry>, StoreError> {
        let row = sqlx::query(
            "SELECT detail_id, child_id, entry_id, revision FROM detail_index_map WHERE detail_id = ?",
        )
        .bind(detail_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed("get mapping"))?;
        row.as_ref().map(Self::row_to_mapping).transpose()
    }

    async fn record(&self, entry: MappedEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO detail_index_map (detail_id, child_id, entry_id, revision)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(detail_id) DO UPDATE SET
                child_id = excluded.child_id,
                entry_id = excluded.entry_id,
                revision = excluded.revision
            "#,
        )
        .bind(entry.detail_id.to_string())
        .bind(entry.child_id.to_string())
        .bind(&entry.entry_id)
        .bind(entry.revision as i64)
        .execute(&self.pool)
        .await
        .map_err(query_failed("record mapping"))?;
        Ok(())
    }

    async fn forget(&self, detail_id: DetailId) -> Result<Option<MappedEntry>, StoreError> {
        let existing = self.entry_for(detail_id).await?;
        if existing.is_some() {
            sqlx::query("DELETE FROM detail_index_map WHERE detail_id = ?")
                .bind(detail_id.to_string())
                .execute(&self.pool)
                .await
                .map_err(query_failed("forget mapping"))?;
        }
        Ok(existing)
    }

    async fn stale(&self, limit: usize) -> Result<Vec<DetailId>, StoreError> {
        let rows = sqlx::query(
            "SELECT d.id FROM child_details d \
             LEFT JOIN detail_index_map m ON m.detail_id = d.id \
             WHERE m.detail_id IS NULL OR m.revision < d.revision \
             ORDER BY d.updated_at ASC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("stale details"))?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(query_failed("id column"))?;
                parse_id(&id, "id")
            })
            .collect()
    }

    async fn orphans(&self, limit: usize) -> Result<Vec<MappedEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT m.detail_id, m.child_id, m.entry_id, m.revision FROM detail_index_map m \
             LEFT JOIN child_details d ON d.id = m.detail_id \
             WHERE d.id IS NULL LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("orphan mappings"))?;
        rows.iter().map(Self::row_to_mapping).collect()
    }
}
