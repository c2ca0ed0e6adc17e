//! SQLite persistence for every nestling store.
//!
//! One database file holds:
//! - `vector_entries`: embedded retrieval documents (f32 LE blobs), ranked in Rust
//! - `children`, `growth_records`: read-only inputs owned by other services
//! - `child_details`: source of truth for detail facts
//! - `detail_index_map`: detail id → vector entry id + embedded revision
//! - `chat_turns`: append-only history keyed by (session_id, sequence)
//! - `cache_entries`: TTL'd response cache with scope tags

mod cache;
mod children;
mod history;
mod vector_index;

use chrono::{DateTime, SecondsFormat, Utc};
use nestling_core::error::StoreError;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use tracing::{debug, info};

/// A SQLite-backed implementation of the vector index, relational stores,
/// chat history and cache store. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "vector_entries table",
        r#"
        CREATE TABLE IF NOT EXISTS vector_entries (
            id              TEXT PRIMARY KEY,
            source          TEXT NOT NULL,
            owner_child_id  TEXT,
            document        TEXT NOT NULL,
            metadata        TEXT NOT NULL,
            embedding       BLOB NOT NULL,
            dimensions      INTEGER NOT NULL
        )
        "#,
    ),
    (
        "vector_entries owner index",
        "CREATE INDEX IF NOT EXISTS idx_vector_owner ON vector_entries(owner_child_id, source)",
    ),
    (
        "children table",
        r#"
        CREATE TABLE IF NOT EXISTS children (
            id           TEXT PRIMARY KEY,
            name         TEXT NOT NULL,
            birthdate    TEXT NOT NULL,
            gender       TEXT,
            guardian_id  TEXT NOT NULL
        )
        "#,
    ),
    (
        "growth_records table",
        r#"
        CREATE TABLE IF NOT EXISTS growth_records (
            id           TEXT PRIMARY KEY,
            child_id     TEXT NOT NULL,
            category     TEXT NOT NULL,
            value        TEXT NOT NULL,
            notes        TEXT,
            recorded_at  TEXT NOT NULL
        )
        "#,
    ),
    (
        "growth_records index",
        "CREATE INDEX IF NOT EXISTS idx_records_child ON growth_records(child_id, recorded_at DESC)",
    ),
    (
        "child_details table",
        r#"
        CREATE TABLE IF NOT EXISTS child_details (
            id           TEXT PRIMARY KEY,
            child_id     TEXT NOT NULL,
            detail_type  TEXT NOT NULL,
            content      TEXT NOT NULL,
            tags         TEXT NOT NULL DEFAULT '[]',
            importance   INTEGER NOT NULL,
            recorded_at  TEXT NOT NULL,
            created_at   TEXT NOT NULL,
            updated_at   TEXT NOT NULL,
            revision     INTEGER NOT NULL
        )
        "#,
    ),
    (
        "child_details index",
        "CREATE INDEX IF NOT EXISTS idx_details_child ON child_details(child_id, recorded_at DESC)",
    ),
    (
        "detail_index_map table",
        r#"
        CREATE TABLE IF NOT EXISTS detail_index_map (
            detail_id  TEXT PRIMARY KEY,
            child_id   TEXT NOT NULL,
            entry_id   TEXT NOT NULL,
            revision   INTEGER NOT NULL
        )
        "#,
    ),
    (
        "chat_turns table",
        r#"
        CREATE TABLE IF NOT EXISTS chat_turns (
            session_id  TEXT NOT NULL,
            sequence    INTEGER NOT NULL,
            user_id     TEXT NOT NULL,
            child_id    TEXT,
            question    TEXT NOT NULL,
            answer      TEXT NOT NULL,
            model       TEXT NOT NULL,
            sources     TEXT NOT NULL DEFAULT '[]',
            created_at  TEXT NOT NULL,
            PRIMARY KEY (session_id, sequence)
        )
        "#,
    ),
    (
        "chat_turns user index",
        "CREATE INDEX IF NOT EXISTS idx_turns_user ON chat_turns(user_id, created_at DESC)",
    ),
    (
        "cache_entries table",
        r#"
        CREATE TABLE IF NOT EXISTS cache_entries (
            key         TEXT PRIMARY KEY,
            value       BLOB NOT NULL,
            scope       TEXT,
            expires_at  INTEGER NOT NULL
        )
        "#,
    ),
    (
        "cache_entries scope index",
        "CREATE INDEX IF NOT EXISTS idx_cache_scope ON cache_entries(scope)",
    ),
];

impl SqliteStore {
    /// Open (or create) a database at `path`.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral database (useful for tests);
    /// in that case the pool holds a single connection so every query sees
    /// the same database.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        let max_connections = if path.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Close the pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        for (name, sql) in MIGRATIONS {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(format!("{name}: {e}")))?;
        }
        debug!("SQLite migrations complete");
        Ok(())
    }
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::QueryFailed(format!("bad timestamp '{s}': {e}")))
}

fn query_failed(context: &str) -> impl Fn(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::QueryFailed(format!("{context}: {e}"))
}

fn parse_id<T: FromStr>(s: &str, column: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    s.parse()
        .map_err(|e| StoreError::QueryFailed(format!("{column} column: {e}")))
}
