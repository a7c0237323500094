//! Persistence gateway for enriched records.
//!
//! [`RecordStore`] is the seam the pipeline writes through; [`SqliteStore`]
//! is the SQLite-backed implementation, with tags kept as a JSON array so
//! that subset queries can run in SQL.
use std::str::FromStr;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::credential::OutputRecord;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://leakscope.db";
pub const DEFAULT_PAGE_LIMIT: u64 = 50;

const SELECT_ENTRIES: &str = "SELECT id, username, password, address, scheme, port, url_path, \
     ip_address, title, file_name, line_number, application, tags FROM entries";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("tag encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Query predicates; every `Some`/non-empty field narrows the result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    /// Exact match.
    pub file_name: Option<String>,
    /// Substring match.
    pub address: Option<String>,
    /// Exact match.
    pub ip_address: Option<String>,
    /// Substring match.
    pub url_path: Option<String>,
    /// Entries must carry every listed tag.
    pub tags: Vec<String>,
    pub port: Option<u16>,
    pub application: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: u64,
    pub limit: u64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

/// A persisted record with its row id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredEntry {
    pub id: i64,
    #[serde(flatten)]
    pub record: OutputRecord,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Bulk insert; returns the number of rows written.
    async fn insert_many(&self, records: Vec<OutputRecord>) -> Result<u64, StoreError>;
    async fn count(&self, filter: &RecordFilter) -> Result<u64, StoreError>;
    async fn search(&self, filter: &RecordFilter, page: Page)
    -> Result<Vec<StoredEntry>, StoreError>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and ensure the schema.
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // Every connection to `:memory:` is its own database.
        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS entries(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL,
            password TEXT NOT NULL,
            address TEXT NOT NULL,
            scheme TEXT,
            port INTEGER,
            url_path TEXT,
            ip_address TEXT,
            title TEXT,
            file_name TEXT NOT NULL,
            line_number INTEGER NOT NULL,
            application TEXT,
            tags TEXT NOT NULL
        )"#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &RecordFilter) -> Result<(), StoreError> {
    qb.push(" WHERE 1 = 1");
    if let Some(v) = &filter.file_name {
        qb.push(" AND file_name = ").push_bind(v.clone());
    }
    if let Some(v) = &filter.address {
        qb.push(" AND instr(address, ").push_bind(v.clone()).push(") > 0");
    }
    if let Some(v) = &filter.ip_address {
        qb.push(" AND ip_address = ").push_bind(v.clone());
    }
    if let Some(v) = &filter.url_path {
        qb.push(" AND instr(url_path, ").push_bind(v.clone()).push(") > 0");
    }
    if let Some(p) = filter.port {
        qb.push(" AND port = ").push_bind(i64::from(p));
    }
    if let Some(v) = &filter.application {
        qb.push(" AND application = ").push_bind(v.clone());
    }
    if !filter.tags.is_empty() {
        qb.push(" AND NOT EXISTS (SELECT 1 FROM json_each(")
            .push_bind(serde_json::to_string(&filter.tags)?)
            .push(") AS wanted WHERE wanted.value NOT IN (SELECT value FROM json_each(entries.tags)))");
    }
    Ok(())
}

fn entry_from_row(row: &SqliteRow) -> Result<StoredEntry, StoreError> {
    let port: Option<i64> = row.try_get("port")?;
    let line_number: i64 = row.try_get("line_number")?;
    let tags: String = row.try_get("tags")?;
    Ok(StoredEntry {
        id: row.try_get("id")?,
        record: OutputRecord {
            username: row.try_get("username")?,
            password: row.try_get("password")?,
            address: row.try_get("address")?,
            scheme: row.try_get("scheme")?,
            port: port.and_then(|p| u16::try_from(p).ok()),
            url_path: row.try_get("url_path")?,
            ip_address: row.try_get("ip_address")?,
            title: row.try_get("title")?,
            file_name: row.try_get("file_name")?,
            line_number: usize::try_from(line_number).unwrap_or_default(),
            application: row.try_get("application")?,
            tags: serde_json::from_str(&tags)?,
        },
    })
}

fn to_sql_int(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn insert_many(&self, records: Vec<OutputRecord>) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for r in &records {
            let tags = serde_json::to_string(&r.tags)?;
            written += sqlx::query(
                r#"INSERT INTO entries(username, password, address, scheme, port, url_path,
                ip_address, title, file_name, line_number, application, tags)
                VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"#,
            )
            .bind(&r.username)
            .bind(&r.password)
            .bind(&r.address)
            .bind(r.scheme.as_deref())
            .bind(r.port.map(i64::from))
            .bind(r.url_path.as_deref())
            .bind(r.ip_address.as_deref())
            .bind(r.title.as_deref())
            .bind(&r.file_name)
            .bind(to_sql_int(r.line_number as u64))
            .bind(r.application.as_deref())
            .bind(tags)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn count(&self, filter: &RecordFilter) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM entries");
        push_filter(&mut qb, filter)?;
        let n = qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        Ok(n.max(0) as u64)
    }

    async fn search(
        &self,
        filter: &RecordFilter,
        page: Page,
    ) -> Result<Vec<StoredEntry>, StoreError> {
        let mut qb = QueryBuilder::new(SELECT_ENTRIES);
        push_filter(&mut qb, filter)?;
        qb.push(" ORDER BY id LIMIT ")
            .push_bind(to_sql_int(page.limit))
            .push(" OFFSET ")
            .push_bind(to_sql_int(page.offset));
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(entry_from_row).collect()
    }
}
