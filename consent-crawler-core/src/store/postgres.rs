use super::{Result, ResultStore};
use crate::model::{CrawlResultRecord, CrawlState, CrawlSummary, ObservedCookie, Site, Visit};
use async_trait::async_trait;
use chrono::Utc;
use consent_crawler_browser::{CmpType, CookieCategory, Declaration};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS crawls (
    crawl_id BIGSERIAL PRIMARY KEY,
    browser_params JSONB NOT NULL,
    start_time TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS site_visits (
    visit_id BIGSERIAL PRIMARY KEY,
    crawl_id BIGINT NOT NULL REFERENCES crawls(crawl_id) ON DELETE CASCADE,
    browser_id BIGINT NOT NULL,
    site_url TEXT NOT NULL,
    site_rank BIGINT NOT NULL,
    start_time TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_site_visits_crawl ON site_visits(crawl_id, site_rank);

CREATE TABLE IF NOT EXISTS consent_data (
    id BIGSERIAL PRIMARY KEY,
    visit_id BIGINT NOT NULL REFERENCES site_visits(visit_id) ON DELETE CASCADE,
    browser_id BIGINT NOT NULL,
    name TEXT NOT NULL,
    domain TEXT NOT NULL,
    cat_id BIGINT NOT NULL,
    cat_name TEXT NOT NULL,
    purpose TEXT,
    expiry TEXT,
    type_name TEXT,
    type_id BIGINT,
    UNIQUE(visit_id, name, domain)
);

CREATE TABLE IF NOT EXISTS observed_cookies (
    id BIGSERIAL PRIMARY KEY,
    visit_id BIGINT NOT NULL REFERENCES site_visits(visit_id) ON DELETE CASCADE,
    browser_id BIGINT NOT NULL,
    record_type TEXT NOT NULL CHECK(record_type IN ('added-or-changed', 'deleted')),
    host TEXT NOT NULL,
    name TEXT NOT NULL,
    path TEXT NOT NULL,
    value TEXT NOT NULL,
    expiry DOUBLE PRECISION,
    is_http_only BOOLEAN NOT NULL,
    is_host_only BOOLEAN NOT NULL,
    is_session BOOLEAN NOT NULL,
    is_secure BOOLEAN NOT NULL,
    same_site TEXT,
    time_stamp TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_observed_cookies_visit ON observed_cookies(visit_id);

CREATE TABLE IF NOT EXISTS crawl_results (
    visit_id BIGINT PRIMARY KEY REFERENCES site_visits(visit_id) ON DELETE CASCADE,
    browser_id BIGINT NOT NULL,
    cmp_type BIGINT NOT NULL,
    crawl_state BIGINT NOT NULL,
    report TEXT
);
"#;

/// Networked store on a PostgreSQL server.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(16).connect(url).await?;
        let store = Self::new(pool);
        store.migrate().await?;
        info!("Connected to PostgreSQL result store");
        Ok(store)
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ResultStore for PostgresStore {
    async fn register_crawl(&self, browser_params: &serde_json::Value) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO crawls (browser_params, start_time) VALUES ($1, $2) RETURNING crawl_id",
        )
        .bind(browser_params)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("crawl_id"))
    }

    async fn latest_crawl(&self) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT crawl_id FROM crawls ORDER BY crawl_id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("crawl_id")))
    }

    async fn record_visit_start(
        &self,
        crawl_id: i64,
        worker_id: usize,
        site: &Site,
    ) -> Result<Visit> {
        let started_at = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO site_visits (crawl_id, browser_id, site_url, site_rank, start_time)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING visit_id
            "#,
        )
        .bind(crawl_id)
        .bind(worker_id as i64)
        .bind(&site.url)
        .bind(site.rank)
        .bind(started_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(Visit {
            visit_id: row.get("visit_id"),
            crawl_id,
            worker_id,
            site: site.clone(),
            started_at,
        })
    }

    async fn append_declaration(&self, visit_id: i64, declaration: &Declaration) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT id, cat_id FROM consent_data
             WHERE visit_id = $1 AND name = $2 AND domain = $3
             FOR UPDATE",
        )
        .bind(visit_id)
        .bind(&declaration.name)
        .bind(&declaration.domain)
        .fetch_optional(&mut *tx)
        .await?;

        match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO consent_data (
                        visit_id, browser_id, name, domain, cat_id, cat_name,
                        purpose, expiry, type_name, type_id
                    ) VALUES (
                        $1, (SELECT browser_id FROM site_visits WHERE visit_id = $1),
                        $2, $3, $4, $5, $6, $7, $8, $9
                    )
                    "#,
                )
                .bind(visit_id)
                .bind(&declaration.name)
                .bind(&declaration.domain)
                .bind(declaration.category.id())
                .bind(&declaration.category_label)
                .bind(&declaration.purpose)
                .bind(&declaration.expiry)
                .bind(&declaration.type_name)
                .bind(declaration.type_id)
                .execute(&mut *tx)
                .await?;
            }
            Some(row) => {
                let id: i64 = row.get("id");
                let stored = CookieCategory::from_id(row.get("cat_id"));
                if CookieCategory::resolve(stored, declaration.category) != stored {
                    debug!(
                        "Declaration {}@{} upgraded from {} to {}",
                        declaration.name,
                        declaration.domain,
                        stored.as_str(),
                        declaration.category.as_str()
                    );
                    sqlx::query(
                        r#"
                        UPDATE consent_data SET cat_id = $1, cat_name = $2, purpose = $3,
                            expiry = $4, type_name = $5, type_id = $6
                        WHERE id = $7
                        "#,
                    )
                    .bind(declaration.category.id())
                    .bind(&declaration.category_label)
                    .bind(&declaration.purpose)
                    .bind(&declaration.expiry)
                    .bind(&declaration.type_name)
                    .bind(declaration.type_id)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn append_observed_cookie(&self, visit_id: i64, event: &ObservedCookie) -> Result<()> {
        let cookie = &event.cookie;
        sqlx::query(
            r#"
            INSERT INTO observed_cookies (
                visit_id, browser_id, record_type, host, name, path, value, expiry,
                is_http_only, is_host_only, is_session, is_secure, same_site, time_stamp
            ) VALUES (
                $1, (SELECT browser_id FROM site_visits WHERE visit_id = $1),
                $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13
            )
            "#,
        )
        .bind(visit_id)
        .bind(event.record_type.as_str())
        .bind(&cookie.host)
        .bind(&cookie.name)
        .bind(&cookie.path)
        .bind(&cookie.value)
        .bind(cookie.expiry)
        .bind(cookie.http_only)
        .bind(cookie.host_only)
        .bind(cookie.session)
        .bind(cookie.secure)
        .bind(&cookie.same_site)
        .bind(event.observed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_result(&self, result: &CrawlResultRecord) -> Result<bool> {
        let done = sqlx::query(
            r#"
            INSERT INTO crawl_results (visit_id, browser_id, cmp_type, crawl_state, report)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (visit_id) DO NOTHING
            "#,
        )
        .bind(result.visit_id)
        .bind(result.browser_id as i64)
        .bind(result.cmp_type.id())
        .bind(result.state.id())
        .bind(&result.report)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn resume_cursor(&self, crawl_id: i64) -> Result<Option<i64>> {
        let row = sqlx::query(
            r#"
            SELECT MAX(v.site_rank) AS cursor
            FROM crawl_results r
            JOIN site_visits v ON r.visit_id = v.visit_id
            WHERE v.crawl_id = $1
            "#,
        )
        .bind(crawl_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("cursor"))
    }

    async fn declarations(&self, visit_id: i64) -> Result<Vec<Declaration>> {
        let rows = sqlx::query(
            r#"
            SELECT name, domain, cat_id, cat_name, purpose, expiry, type_name, type_id
            FROM consent_data WHERE visit_id = $1 ORDER BY id
            "#,
        )
        .bind(visit_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Declaration {
                name: r.get("name"),
                domain: r.get("domain"),
                category: CookieCategory::from_id(r.get("cat_id")),
                category_label: r.get("cat_name"),
                purpose: r.get("purpose"),
                expiry: r.get("expiry"),
                type_name: r.get("type_name"),
                type_id: r.get("type_id"),
            })
            .collect())
    }

    async fn observed_cookie_count(&self, visit_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM observed_cookies WHERE visit_id = $1")
            .bind(visit_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    async fn crawl_result(&self, visit_id: i64) -> Result<Option<CrawlResultRecord>> {
        let row = sqlx::query(
            r#"
            SELECT visit_id, browser_id, cmp_type, crawl_state, report
            FROM crawl_results WHERE visit_id = $1
            "#,
        )
        .bind(visit_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| CrawlResultRecord {
            visit_id: r.get("visit_id"),
            browser_id: r.get::<i64, _>("browser_id") as usize,
            cmp_type: CmpType::from_id(r.get("cmp_type")),
            state: CrawlState::from_id(r.get("crawl_state")),
            report: r.get::<Option<String>, _>("report").unwrap_or_default(),
        }))
    }

    async fn summary(&self, crawl_id: i64) -> Result<CrawlSummary> {
        let visits: i64 = sqlx::query("SELECT COUNT(*) AS n FROM site_visits WHERE crawl_id = $1")
            .bind(crawl_id)
            .fetch_one(&self.pool)
            .await?
            .get("n");

        let by_state = sqlx::query(
            r#"
            SELECT r.crawl_state AS code, COUNT(*) AS n
            FROM crawl_results r JOIN site_visits v ON r.visit_id = v.visit_id
            WHERE v.crawl_id = $1
            GROUP BY r.crawl_state ORDER BY r.crawl_state
            "#,
        )
        .bind(crawl_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| (CrawlState::from_id(r.get("code")), r.get::<i64, _>("n")))
        .collect::<Vec<_>>();

        let by_cmp = sqlx::query(
            r#"
            SELECT r.cmp_type AS code, COUNT(*) AS n
            FROM crawl_results r JOIN site_visits v ON r.visit_id = v.visit_id
            WHERE v.crawl_id = $1
            GROUP BY r.cmp_type ORDER BY r.cmp_type
            "#,
        )
        .bind(crawl_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| (CmpType::from_id(r.get("code")), r.get::<i64, _>("n")))
        .collect::<Vec<_>>();

        let declarations: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM consent_data d
            JOIN site_visits v ON d.visit_id = v.visit_id
            WHERE v.crawl_id = $1
            "#,
        )
        .bind(crawl_id)
        .fetch_one(&self.pool)
        .await?
        .get("n");

        let cookie_events: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM observed_cookies c
            JOIN site_visits v ON c.visit_id = v.visit_id
            WHERE v.crawl_id = $1
            "#,
        )
        .bind(crawl_id)
        .fetch_one(&self.pool)
        .await?
        .get("n");

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
