//! Persistence for crawls, visits, declarations, observed cookies and results.
//!
//! Two interchangeable backends implement [`ResultStore`]: an embedded SQLite
//! file and a PostgreSQL server. Every append is its own transaction, so
//! partial visit data survives a crash.

pub mod postgres;
pub mod sqlite;

use crate::error::StoreError;
use crate::model::{CrawlResultRecord, CrawlSummary, ObservedCookie, Site, Visit};
use async_trait::async_trait;
use consent_crawler_browser::Declaration;
use std::path::PathBuf;
use std::sync::Arc;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Register a new crawl with its browser parameters.
    async fn register_crawl(&self, browser_params: &serde_json::Value) -> Result<i64>;

    /// Most recently registered crawl, if any.
    async fn latest_crawl(&self) -> Result<Option<i64>>;

    async fn record_visit_start(&self, crawl_id: i64, worker_id: usize, site: &Site)
    -> Result<Visit>;

    /// Add a declaration; a repeated (visit, name, domain) keeps the more
    /// privacy-invasive category.
    async fn append_declaration(&self, visit_id: i64, declaration: &Declaration) -> Result<()>;

    async fn append_observed_cookie(&self, visit_id: i64, event: &ObservedCookie) -> Result<()>;

    /// Terminal write for a visit. Returns `false` when a result already
    /// exists, in which case nothing is changed.
    async fn record_result(&self, result: &CrawlResultRecord) -> Result<bool>;

    /// Highest site rank with a result in `crawl_id`.
    async fn resume_cursor(&self, crawl_id: i64) -> Result<Option<i64>>;

    async fn declarations(&self, visit_id: i64) -> Result<Vec<Declaration>>;

    async fn observed_cookie_count(&self, visit_id: i64) -> Result<i64>;

    async fn crawl_result(&self, visit_id: i64) -> Result<Option<CrawlResultRecord>>;

    async fn summary(&self, crawl_id: i64) -> Result<CrawlSummary>;
}

/// Where results are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Sqlite(PathBuf),
    Postgres(String),
}

impl StoreLocation {
    /// `postgres://` and `postgresql://` URLs select PostgreSQL, anything else
    /// is a SQLite file path.
    pub fn parse(location: &str) -> Self {
        if location.starts_with("postgres://") || location.starts_with("postgresql://") {
            StoreLocation::Postgres(location.to_string())
        } else {
            StoreLocation::Sqlite(PathBuf::from(location))
        }
    }
}

pub async fn open(location: &StoreLocation) -> Result<Arc<dyn ResultStore>> {
    match location {
        StoreLocation::Sqlite(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            Ok(Arc::new(SqliteStore::open(path)?))
        }
        StoreLocation::Postgres(url) => Ok(Arc::new(PostgresStore::connect(url).await?)),
    }
}
