//! PostgreSQL-backed document sources.
//!
//! Each watched collection is a table carrying a `monotonic_seq BIGINT` column
//! that the write path fills before insert. Type-specific columns are surfaced
//! through `to_jsonb` so one query shape serves every source.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::record::{MonotonicSeq, SourceKind, SourceRecord};
use crate::storage::traits::{DocumentSource, StorageError, WritableSource};

fn sql_err(err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::DuplicateKey(db.message().to_string()),
        sqlx::Error::Io(e) => StorageError::Connection(e.to_string()),
        e @ (sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed) => StorageError::Unavailable(e.to_string()),
        e @ (sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)) => StorageError::Serialization(e.to_string()),
        other => StorageError::Backend(other.to_string()),
    }
}

fn seq_to_sql(seq: MonotonicSeq) -> Result<i64, StorageError> {
    i64::try_from(seq.get()).map_err(|_| StorageError::Serialization(format!("sequence {seq} exceeds BIGINT")))
}

/// Table definitions for the three watched collections.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS film_bookmarks (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        film_id UUID NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        monotonic_seq BIGINT NOT NULL UNIQUE,
        UNIQUE (user_id, film_id)
    )",
    "CREATE TABLE IF NOT EXISTS film_reviews (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        film_id UUID NOT NULL,
        review_text TEXT NOT NULL,
        film_score INTEGER NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        monotonic_seq BIGINT NOT NULL UNIQUE,
        UNIQUE (film_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS film_scores (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        film_id UUID NOT NULL,
        film_score INTEGER NOT NULL CHECK (film_score BETWEEN 0 AND 10),
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        monotonic_seq BIGINT NOT NULL UNIQUE,
        UNIQUE (film_id, user_id)
    )",
    "CREATE INDEX IF NOT EXISTS film_bookmarks_user_idx ON film_bookmarks (user_id)",
    "CREATE INDEX IF NOT EXISTS film_reviews_user_idx ON film_reviews (user_id)",
    "CREATE INDEX IF NOT EXISTS film_scores_user_idx ON film_scores (user_id)",
];

/// Open a connection pool.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, StorageError> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(url)
        .await
        .map_err(sql_err)
}

/// Create the collection tables if they do not exist.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StorageError> {
    for stmt in SCHEMA {
        sqlx::query(stmt).execute(pool).await.map_err(sql_err)?;
    }
    Ok(())
}

/// One watched table.
#[derive(Debug, Clone)]
pub struct PgDocumentSource {
    pool: PgPool,
    kind: SourceKind,
}

impl PgDocumentSource {
    /// Source for `kind` over `pool`.
    #[must_use]
    pub fn new(pool: PgPool, kind: SourceKind) -> Self {
        Self { pool, kind }
    }

    fn select_prefix(&self) -> String {
        format!(
            "SELECT id, monotonic_seq, created_at, \
             to_jsonb(t) - 'id' - 'monotonic_seq' - 'created_at' AS fields \
             FROM {} t",
            self.kind.collection()
        )
    }

    fn decode(&self, row: &PgRow) -> Result<SourceRecord, StorageError> {
        let id: Uuid = row.try_get("id").map_err(sql_err)?;
        let seq: i64 = row.try_get("monotonic_seq").map_err(sql_err)?;
        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(sql_err)?;
        let fields: serde_json::Value = row.try_get("fields").map_err(sql_err)?;

        let monotonic_seq = u64::try_from(seq)
            .map(MonotonicSeq::new)
            .map_err(|_| StorageError::Serialization(format!("{} row {id}: negative sequence {seq}", self.kind)))?;
        let serde_json::Value::Object(fields) = fields else {
            return Err(StorageError::Serialization(format!(
                "{} row {id}: fields are not an object",
                self.kind
            )));
        };

        Ok(SourceRecord {
            id,
            monotonic_seq,
            created_at,
            fields,
        })
    }
}

#[async_trait]
impl DocumentSource for PgDocumentSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch_after(&self, after: MonotonicSeq, limit: usize) -> Result<Vec<SourceRecord>, StorageError> {
        let sql = format!(
            "{} WHERE monotonic_seq > $1 ORDER BY monotonic_seq ASC LIMIT $2",
            self.select_prefix()
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&sql)
            .bind(seq_to_sql(after)?)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err)?;
        rows.iter().map(|row| self.decode(row)).collect()
    }

    async fn fetch_by_user(&self, user_id: &str) -> Result<Vec<SourceRecord>, StorageError> {
        // Ids are UUID columns; anything else cannot own records.
        let Ok(user_id) = Uuid::parse_str(user_id) else {
            return Ok(Vec::new());
        };
        let sql = format!(
            "{} WHERE user_id = $1 ORDER BY monotonic_seq ASC",
            self.select_prefix()
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err)?;
        rows.iter().map(|row| self.decode(row)).collect()
    }
}

#[async_trait]
impl WritableSource for PgDocumentSource {
    async fn insert(&self, record: SourceRecord) -> Result<(), StorageError> {
        if record.monotonic_seq == MonotonicSeq::ZERO {
            return Err(StorageError::Backend(format!(
                "{} record {} has no sequence number",
                self.kind, record.id
            )));
        }

        let mut row = record.fields;
        row.insert("id".to_string(), record.id.to_string().into());
        row.insert("monotonic_seq".to_string(), record.monotonic_seq.get().into());
        row.insert("created_at".to_string(), record.created_at.to_rfc3339().into());

        let table = self.kind.collection();
        let sql = format!("INSERT INTO {table} SELECT * FROM jsonb_populate_record(NULL::{table}, $1)");
        sqlx::query(&sql)
            .bind(serde_json::Value::Object(row))
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }
}
