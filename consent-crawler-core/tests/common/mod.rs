// Shared test doubles for session and orchestrator tests
#![allow(dead_code)]

use async_trait::async_trait;
use consent_crawler_browser::error::Result as BrowserResult;
use consent_crawler_browser::{
    Browser, BrowserError, BrowserLauncher, CookieRecord, Declaration,
};
use consent_crawler_core::error::StoreError;
use consent_crawler_core::model::{CrawlResultRecord, CrawlSummary, ObservedCookie, Site, Visit};
use consent_crawler_core::store::{ResultStore, SqliteStore};
use consent_crawler_core::watchdog::{ProcessSweeper, SweepReport};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type StoreResult<T> = Result<T, StoreError>;

/// How every browser from a [`MockLauncher`] behaves.
#[derive(Debug, Clone, Default)]
pub struct SiteScript {
    pub html: HashMap<String, String>,
    pub cookies: HashMap<String, Vec<CookieRecord>>,
    pub default_html: String,
    pub fail_urls: HashSet<String>,
    pub hang_navigation: bool,
    pub crash_on_cookies: bool,
}

impl SiteScript {
    pub fn new() -> Self {
        Self {
            default_html: "<html><body><p>plain page</p></body></html>".to_string(),
            ..Default::default()
        }
    }

    pub fn page(mut self, url: &str, html: &str) -> Self {
        self.html.insert(url.to_string(), html.to_string());
        self
    }

    pub fn cookie(mut self, url: &str, name: &str, value: &str) -> Self {
        self.cookies
            .entry(url.to_string())
            .or_default()
            .push(CookieRecord::new(name, value, ".example.com"));
        self
    }

    pub fn failing(mut self, url: &str) -> Self {
        self.fail_urls.insert(url.to_string());
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang_navigation = true;
        self
    }

    pub fn crashing(mut self) -> Self {
        self.crash_on_cookies = true;
        self
    }
}

#[derive(Debug, Default)]
pub struct BrowserStats {
    pub launches: AtomicUsize,
    pub interactive: AtomicUsize,
    pub kills: AtomicUsize,
    pub closes: AtomicUsize,
    pub navigations: Mutex<Vec<String>>,
}

impl BrowserStats {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().unwrap().clone()
    }
}

pub struct MockBrowser {
    script: Arc<SiteScript>,
    stats: Arc<BrowserStats>,
    current: Option<String>,
    visited: Vec<String>,
    killed: bool,
}

impl MockBrowser {
    pub fn new(script: SiteScript) -> Self {
        Self::with_stats(Arc::new(script), Arc::new(BrowserStats::default()))
    }

    pub fn with_stats(script: Arc<SiteScript>, stats: Arc<BrowserStats>) -> Self {
        Self {
            script,
            stats,
            current: None,
            visited: Vec::new(),
            killed: false,
        }
    }

    pub fn stats(&self) -> Arc<BrowserStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl Browser for MockBrowser {
    async fn navigate(&mut self, url: &str, _timeout: Duration) -> BrowserResult<()> {
        self.stats.navigations.lock().unwrap().push(url.to_string());
        if self.script.hang_navigation {
            std::future::pending::<()>().await;
        }
        if self.script.fail_urls.contains(url) {
            return Err(BrowserError::Navigation(format!(
                "net::ERR_NAME_NOT_RESOLVED at {}",
                url
            )));
        }
        self.current = Some(url.to_string());
        self.visited.push(url.to_string());
        Ok(())
    }

    async fn evaluate(&mut self, script: &str) -> BrowserResult<Value> {
        if script.contains("querySelectorAll('iframe')") {
            return Ok(Value::Array(Vec::new()));
        }
        if script.contains("outerHTML") {
            let html = self
                .current
                .as_ref()
                .and_then(|url| self.script.html.get(url))
                .unwrap_or(&self.script.default_html);
            return Ok(Value::String(html.clone()));
        }
        if script.contains("location.href") {
            let url = self.current.clone().unwrap_or_else(|| "about:blank".to_string());
            return Ok(Value::String(url));
        }
        Ok(Value::Null)
    }

    async fn read_cookies(&mut self) -> BrowserResult<Vec<CookieRecord>> {
        if self.script.crash_on_cookies {
            return Err(BrowserError::Crashed("target closed".to_string()));
        }
        Ok(self
            .visited
            .iter()
            .filter_map(|url| self.script.cookies.get(url))
            .flatten()
            .cloned()
            .collect())
    }

    async fn kill(&mut self) {
        if !self.killed {
            self.killed = true;
            self.stats.kills.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn close(&mut self) -> BrowserResult<()> {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockLauncher {
    script: Arc<SiteScript>,
    pub stats: Arc<BrowserStats>,
    fail_launches: bool,
    /// Worker whose launches fail after the given delay.
    broken_worker: Option<(usize, Duration)>,
}

impl MockLauncher {
    pub fn new(script: SiteScript) -> Self {
        Self {
            script: Arc::new(script),
            stats: Arc::new(BrowserStats::default()),
            fail_launches: false,
            broken_worker: None,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_launches: true,
            ..Self::new(SiteScript::new())
        }
    }

    pub fn broken_for(mut self, worker_id: usize, delay: Duration) -> Self {
        self.broken_worker = Some((worker_id, delay));
        self
    }
}

#[async_trait]
impl BrowserLauncher for MockLauncher {
    async fn launch(&self, worker_id: usize) -> BrowserResult<Box<dyn Browser>> {
        self.stats.launches.fetch_add(1, Ordering::SeqCst);
        if let Some((broken, delay)) = self.broken_worker
            && broken == worker_id
        {
            tokio::time::sleep(delay).await;
            return Err(BrowserError::Launch("crashed during startup".to_string()));
        }
        if self.fail_launches {
            return Err(BrowserError::Launch("chrome not found".to_string()));
        }
        Ok(Box::new(MockBrowser::with_stats(
            self.script.clone(),
            self.stats.clone(),
        )))
    }

    async fn launch_interactive(&self) -> BrowserResult<Box<dyn Browser>> {
        self.stats.interactive.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockBrowser::with_stats(
            self.script.clone(),
            self.stats.clone(),
        )))
    }
}

#[derive(Debug, Default)]
pub struct CountingSweeper {
    pub sweeps: AtomicUsize,
}

impl CountingSweeper {
    pub fn count(&self) -> usize {
        self.sweeps.load(Ordering::SeqCst)
    }
}

impl ProcessSweeper for CountingSweeper {
    fn sweep(&self) -> SweepReport {
        self.sweeps.fetch_add(1, Ordering::SeqCst);
        SweepReport::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Cookie appends never complete.
    HangOnCookies,
    /// Starting a visit fails.
    FailVisitStart,
}

/// SQLite store with one injected fault.
pub struct FaultyStore {
    pub inner: Arc<SqliteStore>,
    fault: Fault,
}

impl FaultyStore {
    pub fn new(fault: Fault) -> Self {
        Self {
            inner: Arc::new(SqliteStore::in_memory().unwrap()),
            fault,
        }
    }
}

#[async_trait]
impl ResultStore for FaultyStore {
    async fn register_crawl(&self, browser_params: &Value) -> StoreResult<i64> {
        self.inner.register_crawl(browser_params).await
    }

    async fn latest_crawl(&self) -> StoreResult<Option<i64>> {
        self.inner.latest_crawl().await
    }

    async fn record_visit_start(
        &self,
        crawl_id: i64,
        worker_id: usize,
        site: &Site,
    ) -> StoreResult<Visit> {
        if self.fault == Fault::FailVisitStart {
            return Err(StoreError::NotFound(format!("crawl {}", crawl_id)));
        }
        self.inner.record_visit_start(crawl_id, worker_id, site).await
    }

    async fn append_declaration(&self, visit_id: i64, declaration: &Declaration) -> StoreResult<()> {
        self.inner.append_declaration(visit_id, declaration).await
    }

    async fn append_observed_cookie(&self, visit_id: i64, event: &ObservedCookie) -> StoreResult<()> {
        if self.fault == Fault::HangOnCookies {
            std::future::pending::<()>().await;
        }
        self.inner.append_observed_cookie(visit_id, event).await
    }

    async fn record_result(&self, result: &CrawlResultRecord) -> StoreResult<bool> {
        self.inner.record_result(result).await
    }

    async fn resume_cursor(&self, crawl_id: i64) -> StoreResult<Option<i64>> {
        self.inner.resume_cursor(crawl_id).await
    }

    async fn declarations(&self, visit_id: i64) -> StoreResult<Vec<Declaration>> {
        self.inner.declarations(visit_id).await
    }

    async fn observed_cookie_count(&self, visit_id: i64) -> StoreResult<i64> {
        self.inner.observed_cookie_count(visit_id).await
    }

    async fn crawl_result(&self, visit_id: i64) -> StoreResult<Option<CrawlResultRecord>> {
        self.inner.crawl_result(visit_id).await
    }

    async fn summary(&self, crawl_id: i64) -> StoreResult<CrawlSummary> {
        self.inner.summary(crawl_id).await
    }
}

pub fn sites(count: usize) -> Vec<Site> {
    (1..=count)
        .map(|rank| Site::new(format!("https://site{}.example", rank), rank as i64))
        .collect()
}
