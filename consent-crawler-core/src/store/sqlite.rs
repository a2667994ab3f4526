use super::{Result, ResultStore};
use crate::error::StoreError;
use crate::model::{CrawlResultRecord, CrawlState, CrawlSummary, ObservedCookie, Site, Visit};
use async_trait::async_trait;
use chrono::Utc;
use consent_crawler_browser::{CmpType, CookieCategory, Declaration};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS crawls (
    crawl_id INTEGER PRIMARY KEY AUTOINCREMENT,
    browser_params TEXT NOT NULL,  -- JSON
    start_time INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS site_visits (
    visit_id INTEGER PRIMARY KEY AUTOINCREMENT,
    crawl_id INTEGER NOT NULL,
    browser_id INTEGER NOT NULL,
    site_url TEXT NOT NULL,
    site_rank INTEGER NOT NULL,
    start_time INTEGER NOT NULL,
    FOREIGN KEY(crawl_id) REFERENCES crawls(crawl_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_site_visits_crawl ON site_visits(crawl_id, site_rank);

CREATE TABLE IF NOT EXISTS consent_data (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    visit_id INTEGER NOT NULL,
    browser_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    domain TEXT NOT NULL,
    cat_id INTEGER NOT NULL,
    cat_name TEXT NOT NULL,
    purpose TEXT,
    expiry TEXT,
    type_name TEXT,
    type_id INTEGER,
    FOREIGN KEY(visit_id) REFERENCES site_visits(visit_id) ON DELETE CASCADE,
    UNIQUE(visit_id, name, domain)
);

CREATE TABLE IF NOT EXISTS observed_cookies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    visit_id INTEGER NOT NULL,
    browser_id INTEGER NOT NULL,
    record_type TEXT NOT NULL CHECK(record_type IN ('added-or-changed', 'deleted')),
    host TEXT NOT NULL,
    name TEXT NOT NULL,
    path TEXT NOT NULL,
    value TEXT NOT NULL,
    expiry REAL,
    is_http_only INTEGER NOT NULL,
    is_host_only INTEGER NOT NULL,
    is_session INTEGER NOT NULL,
    is_secure INTEGER NOT NULL,
    same_site TEXT,
    time_stamp INTEGER NOT NULL,  -- unix millis
    FOREIGN KEY(visit_id) REFERENCES site_visits(visit_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_observed_cookies_visit ON observed_cookies(visit_id);

CREATE TABLE IF NOT EXISTS crawl_results (
    visit_id INTEGER PRIMARY KEY,
    browser_id INTEGER NOT NULL,
    cmp_type INTEGER NOT NULL,
    crawl_state INTEGER NOT NULL,
    report TEXT,
    FOREIGN KEY(visit_id) REFERENCES site_visits(visit_id) ON DELETE CASCADE
);
";

/// Embedded file-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // Several workers append concurrently
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl ResultStore for SqliteStore {
    async fn register_crawl(&self, browser_params: &serde_json::Value) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO crawls (browser_params, start_time) VALUES (?1, ?2)",
            params![serde_json::to_string(browser_params)?, Utc::now().timestamp()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn latest_crawl(&self) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let id = conn
            .query_row(
                "SELECT crawl_id FROM crawls ORDER BY crawl_id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    async fn record_visit_start(
        &self,
        crawl_id: i64,
        worker_id: usize,
        site: &Site,
    ) -> Result<Visit> {
        let started_at = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO site_visits (crawl_id, browser_id, site_url, site_rank, start_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                crawl_id,
                worker_id as i64,
                &site.url,
                site.rank,
                started_at.timestamp()
            ],
        )?;

        Ok(Visit {
            visit_id: conn.last_insert_rowid(),
            crawl_id,
            worker_id,
            site: site.clone(),
            started_at,
        })
    }

    async fn append_declaration(&self, visit_id: i64, declaration: &Declaration) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let existing: Option<(i64, i64)> = tx
            .query_row(
                "SELECT id, cat_id FROM consent_data WHERE visit_id = ?1 AND name = ?2 AND domain = ?3",
                params![visit_id, &declaration.name, &declaration.domain],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            None => {
                tx.execute(
                    "INSERT INTO consent_data (
                        visit_id, browser_id, name, domain, cat_id, cat_name,
                        purpose, expiry, type_name, type_id
                    ) VALUES (
                        ?1, (SELECT browser_id FROM site_visits WHERE visit_id = ?1),
                        ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9
                    )",
                    params![
                        visit_id,
                        &declaration.name,
                        &declaration.domain,
                        declaration.category.id(),
                        &declaration.category_label,
                        &declaration.purpose,
                        &declaration.expiry,
                        &declaration.type_name,
                        declaration.type_id,
                    ],
                )?;
            }
            Some((id, cat_id)) => {
                let stored = CookieCategory::from_id(cat_id);
                if CookieCategory::resolve(stored, declaration.category) != stored {
                    debug!(
                        "Declaration {}@{} upgraded from {} to {}",
                        declaration.name,
                        declaration.domain,
                        stored.as_str(),
                        declaration.category.as_str()
                    );
                    tx.execute(
                        "UPDATE consent_data SET cat_id = ?1, cat_name = ?2, purpose = ?3,
                            expiry = ?4, type_name = ?5, type_id = ?6
                         WHERE id = ?7",
                        params![
                            declaration.category.id(),
                            &declaration.category_label,
                            &declaration.purpose,
                            &declaration.expiry,
                            &declaration.type_name,
                            declaration.type_id,
                            id,
                        ],
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    async fn append_observed_cookie(&self, visit_id: i64, event: &ObservedCookie) -> Result<()> {
        let cookie = &event.cookie;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO observed_cookies (
                visit_id, browser_id, record_type, host, name, path, value, expiry,
                is_http_only, is_host_only, is_session, is_secure, same_site, time_stamp
            ) VALUES (
                ?1, (SELECT browser_id FROM site_visits WHERE visit_id = ?1),
                ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13
            )",
            params![
                visit_id,
                event.record_type.as_str(),
                &cookie.host,
                &cookie.name,
                &cookie.path,
                &cookie.value,
                cookie.expiry,
                cookie.http_only,
                cookie.host_only,
                cookie.session,
                cookie.secure,
                &cookie.same_site,
                event.observed_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    async fn record_result(&self, result: &CrawlResultRecord) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO crawl_results (visit_id, browser_id, cmp_type, crawl_state, report)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(visit_id) DO NOTHING",
            params![
                result.visit_id,
                result.browser_id as i64,
                result.cmp_type.id(),
                result.state.id(),
                &result.report,
            ],
        )?;
        Ok(inserted == 1)
    }

    async fn resume_cursor(&self, crawl_id: i64) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let cursor = conn.query_row(
            "SELECT MAX(v.site_rank)
             FROM crawl_results r
             JOIN site_visits v ON r.visit_id = v.visit_id
             WHERE v.crawl_id = ?1",
            params![crawl_id],
            |row| row.get(0),
        )?;
        Ok(cursor)
    }

    async fn declarations(&self, visit_id: i64) -> Result<Vec<Declaration>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, domain, cat_id, cat_name, purpose, expiry, type_name, type_id
             FROM consent_data WHERE visit_id = ?1 ORDER BY id",
        )?;

        let declarations = stmt
            .query_map(params![visit_id], |row| {
                Ok(Declaration {
                    name: row.get(0)?,
                    domain: row.get(1)?,
                    category: CookieCategory::from_id(row.get(2)?),
                    category_label: row.get(3)?,
                    purpose: row.get(4)?,
                    expiry: row.get(5)?,
                    type_name: row.get(6)?,
                    type_id: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(declarations)
    }

    async fn observed_cookie_count(&self, visit_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM observed_cookies WHERE visit_id = ?1",
            params![visit_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    async fn crawl_result(&self, visit_id: i64) -> Result<Option<CrawlResultRecord>> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                "SELECT visit_id, browser_id, cmp_type, crawl_state, report
                 FROM crawl_results WHERE visit_id = ?1",
                params![visit_id],
                |row| {
                    Ok(CrawlResultRecord {
                        visit_id: row.get(0)?,
                        browser_id: row.get::<_, i64>(1)? as usize,
                        cmp_type: CmpType::from_id(row.get(2)?),
                        state: CrawlState::from_id(row.get(3)?),
                        report: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    async fn summary(&self, crawl_id: i64) -> Result<CrawlSummary> {
        let conn = self.conn()?;

        let visits: i64 = conn.query_row(
            "SELECT COUNT(*) FROM site_visits WHERE crawl_id = ?1",
            params![crawl_id],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT r.crawl_state, COUNT(*)
             FROM crawl_results r JOIN site_visits v ON r.visit_id = v.visit_id
             WHERE v.crawl_id = ?1
             GROUP BY r.crawl_state ORDER BY r.crawl_state",
        )?;
        let by_state = stmt
            .query_map(params![crawl_id], |row| {
                Ok((CrawlState::from_id(row.get(0)?), row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT r.cmp_type, COUNT(*)
             FROM crawl_results r JOIN site_visits v ON r.visit_id = v.visit_id
             WHERE v.crawl_id = ?1
             GROUP BY r.cmp_type ORDER BY r.cmp_type",
        )?;
        let by_cmp = stmt
            .query_map(params![crawl_id], |row| {
                Ok((CmpType::from_id(row.get(0)?), row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let declarations: i64 = conn.query_row(
            "SELECT COUNT(*) FROM consent_data d JOIN site_visits v ON d.visit_id = v.visit_id
             WHERE v.crawl_id = ?1",
            params![crawl_id],
            |row| row.get(0),
        )?;
        let cookie_events: i64 = conn.query_row(
            "SELECT COUNT(*) FROM observed_cookies c JOIN site_visits v ON c.visit_id = v.visit_id
             WHERE v.crawl_id = ?1",
            params![crawl_id],
            |row| row.get(0),
        )?;

        Ok(CrawlSummary {
            crawl_id,
            visits,
            results: by_state.iter().map(|(_, n)| n).sum(),
            by_state,
            by_cmp,
            declarations,
            cookie_events,
        })
    }
}
