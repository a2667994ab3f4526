//! Per-site crawl protocol.
//!
//! A visit moves through `Start → DetectCmp → ExtractDeclarations →
//! BrowseSubpages → CollectCookies → Finalize`. Cookie snapshots and
//! declarations are appended to the store as they are read; the crawl result
//! is written once, in `Finalize`.

use crate::error::{StoreError, VisitError, extraction_state};
use crate::jar::CookieJar;
use crate::model::{CrawlResultRecord, CrawlState, Visit, VisitOutcome};
use crate::store::ResultStore;
use consent_crawler_browser::{
    Browser, Cmp, CmpMode, CmpType, DETECTION_ORDER, ExtractionError, ResourceFetcher,
    SubpageNavigator, detect_first,
};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: CmpMode,
    pub num_subpages: usize,
    /// Timeout for a single page load.
    pub page_timeout: Duration,
    /// Time budget of the whole visit. Subpage browsing stops once less than a
    /// tenth of it remains, leaving room to collect cookies.
    pub visit_budget: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: CmpMode::All,
            num_subpages: 10,
            page_timeout: Duration::from_secs(30),
            visit_budget: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Start,
    DetectCmp,
    ExtractDeclarations,
    BrowseSubpages,
    CollectCookies,
    Finalize,
}

/// What a running visit has done so far. Read by the orchestrator when it has
/// to finalize a visit the runner no longer responds for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitProgress {
    pub state: SessionState,
    pub cmp_type: CmpType,
    pub declarations: usize,
    pub cookie_events: usize,
}

impl Default for VisitProgress {
    fn default() -> Self {
        Self {
            state: SessionState::Start,
            cmp_type: CmpType::None,
            declarations: 0,
            cookie_events: 0,
        }
    }
}

/// Drives one browser through the per-site protocol.
pub struct SessionRunner {
    store: Arc<dyn ResultStore>,
    fetcher: ResourceFetcher,
    config: SessionConfig,
    progress: Arc<Mutex<VisitProgress>>,
    abort: Option<CancellationToken>,
}

impl SessionRunner {
    pub fn new(store: Arc<dyn ResultStore>, fetcher: ResourceFetcher, config: SessionConfig) -> Self {
        Self {
            store,
            fetcher,
            config,
            progress: Arc::new(Mutex::new(VisitProgress::default())),
            abort: None,
        }
    }

    /// Token of the whole crawl. Visits stopped because it was cancelled are
    /// reported as aborted rather than out of time.
    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = Some(abort);
        self
    }

    fn aborted(&self) -> bool {
        self.abort.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    pub fn progress(&self) -> VisitProgress {
        match self.progress.lock() {
            Ok(progress) => progress.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut VisitProgress)) {
        match self.progress.lock() {
            Ok(mut progress) => f(&mut progress),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Run the protocol for `visit` and write its crawl result.
    ///
    /// `cancel` is the cooperative deadline: it is checked at every state
    /// transition and aborts any pending browser call, finalizing the visit as
    /// a timeout. Only store failures are returned as errors; everything else
    /// ends up in the outcome.
    pub async fn run(
        &self,
        visit: &Visit,
        browser: &mut dyn Browser,
        cancel: &CancellationToken,
    ) -> Result<VisitOutcome, StoreError> {
        let span = info_span!(
            "visit",
            visit_id = visit.visit_id,
            worker_id = visit.worker_id,
            rank = visit.site.rank
        );
        self.drive(visit, browser, cancel).instrument(span).await
    }

    async fn drive(
        &self,
        visit: &Visit,
        browser: &mut dyn Browser,
        cancel: &CancellationToken,
    ) -> Result<VisitOutcome, StoreError> {
        self.update(|p| *p = VisitProgress::default());

        let mut run = VisitRun {
            runner: self,
            visit,
            browser,
            cancel,
            started: Instant::now(),
            jar: CookieJar::new(),
            cmp: None,
            cmp_missing: false,
            extraction_failure: None,
            declarations: 0,
            cookie_events: 0,
        };

        let mut state = SessionState::Start;
        let mut failure = None;
        while state != SessionState::Finalize {
            match run.step(state).await {
                Ok(next) => {
                    debug!("{:?} -> {:?}", state, next);
                    state = next;
                }
                Err(VisitError::StoreWrite(e)) => {
                    error!("Result store write failed: {}", e);
                    return Err(e);
                }
                Err(VisitError::DeadlineExceeded) if self.aborted() => {
                    warn!("Crawl aborted during {:?}", state);
                    failure = Some(VisitError::Aborted);
                    state = SessionState::Finalize;
                }
                Err(e) => {
                    if e.is_fatal_to_browser() {
                        error!("Browser lost during {:?}: {}", state, e);
                    } else {
                        warn!("Visit failed during {:?}: {}", state, e);
                    }
                    failure = Some(e);
                    state = SessionState::Finalize;
                }
            }
        }

        self.update(|p| p.state = SessionState::Finalize);
        run.finalize(failure).await
    }
}

/// Race a browser call against the visit deadline.
async fn guarded<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T, VisitError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<VisitError>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(VisitError::DeadlineExceeded),
        res = fut => res.map_err(Into::into),
    }
}

struct VisitRun<'a> {
    runner: &'a SessionRunner,
    visit: &'a Visit,
    browser: &'a mut dyn Browser,
    cancel: &'a CancellationToken,
    started: Instant,
    jar: CookieJar,
    cmp: Option<Cmp>,
    cmp_missing: bool,
    extraction_failure: Option<ExtractionError>,
    declarations: usize,
    cookie_events: usize,
}

impl VisitRun<'_> {
    async fn step(&mut self, state: SessionState) -> Result<SessionState, VisitError> {
        if self.cancel.is_cancelled() {
            return Err(VisitError::DeadlineExceeded);
        }
        self.runner.update(|p| p.state = state);

        match state {
            SessionState::Start => self.open_entry().await,
            SessionState::DetectCmp => self.detect().await,
            SessionState::ExtractDeclarations => self.extract().await,
            SessionState::BrowseSubpages => self.browse_subpages().await,
            SessionState::CollectCookies => {
                self.snapshot().await?;
                Ok(SessionState::Finalize)
            }
            SessionState::Finalize => Ok(SessionState::Finalize),
        }
    }

    async fn open_entry(&mut self) -> Result<SessionState, VisitError> {
        let site = &self.visit.site;
        let timeout = self.runner.config.page_timeout;
        info!("Visiting {}", site.url);

        match guarded(self.cancel, self.browser.navigate(&site.url, timeout)).await {
            Ok(()) => {}
            Err(VisitError::Navigation(msg))
                if site.scheme_assumed && site.url.starts_with("https://") =>
            {
                let fallback = format!("http://{}", &site.url["https://".len()..]);
                warn!("HTTPS failed ({}), retrying {}", msg, fallback);
                guarded(self.cancel, self.browser.navigate(&fallback, timeout)).await?;
            }
            Err(e) => return Err(e),
        }

        self.snapshot().await?;
        Ok(match self.runner.config.mode {
            CmpMode::None => SessionState::BrowseSubpages,
            _ => SessionState::DetectCmp,
        })
    }

    async fn detect(&mut self) -> Result<SessionState, VisitError> {
        match self.runner.config.mode {
            CmpMode::None => Ok(SessionState::BrowseSubpages),
            CmpMode::Forced(cmp_type) => {
                self.found(Cmp::for_type(cmp_type));
                Ok(SessionState::ExtractDeclarations)
            }
            CmpMode::All => {
                let detection =
                    guarded(self.cancel, detect_first(&mut *self.browser, &DETECTION_ORDER)).await;
                match detection {
                    Ok(detection) => match detection.found {
                        Some(cmp) => {
                            self.found(cmp);
                            Ok(SessionState::ExtractDeclarations)
                        }
                        None => {
                            info!("No consent platform detected (tried {:?})", detection.attempted);
                            self.cmp_missing = true;
                            Ok(SessionState::BrowseSubpages)
                        }
                    },
                    Err(VisitError::Script(msg)) => {
                        warn!("{}", VisitError::DetectionInconclusive(msg));
                        self.cmp_missing = true;
                        Ok(SessionState::BrowseSubpages)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn found(&mut self, cmp: Cmp) {
        info!("Using {} consent platform", cmp.cmp_type());
        self.cmp = Some(cmp);
        self.runner.update(|p| p.cmp_type = cmp.cmp_type());
    }

    async fn extract(&mut self) -> Result<SessionState, VisitError> {
        let Some(cmp) = self.cmp else {
            return Ok(SessionState::BrowseSubpages);
        };

        let fetcher = &self.runner.fetcher;
        match guarded(self.cancel, cmp.extract(&mut *self.browser, fetcher)).await {
            Ok(declarations) => {
                for declaration in declarations {
                    self.runner
                        .store
                        .append_declaration(self.visit.visit_id, &declaration)
                        .await?;
                    self.declarations += 1;
                    self.runner.update(|p| p.declarations += 1);
                }
                info!("{} declarations from {}", self.declarations, cmp.cmp_type());
            }
            Err(VisitError::Extraction(ExtractionError::Browser(e))) if e.is_crash() => {
                return Err(VisitError::SessionCrash(e.to_string()));
            }
            Err(VisitError::Extraction(e)) => {
                warn!("{} extraction failed: {}", cmp.cmp_type(), e);
                self.extraction_failure = Some(e);
            }
            Err(e) => return Err(e),
        }

        Ok(SessionState::BrowseSubpages)
    }

    async fn browse_subpages(&mut self) -> Result<SessionState, VisitError> {
        let runner = self.runner;
        let config = &runner.config;
        if config.num_subpages == 0 {
            return Ok(SessionState::CollectCookies);
        }

        let harvest = SubpageNavigator::harvest(&mut *self.browser, config.num_subpages);
        let navigator = match guarded(self.cancel, harvest).await {
            Ok(navigator) => navigator,
            Err(VisitError::Script(msg)) => {
                warn!("Could not harvest links: {}", msg);
                return Ok(SessionState::CollectCookies);
            }
            Err(e) => return Err(e),
        };

        let reserve = config.visit_budget / 10;
        for url in navigator {
            let remaining = config
                .visit_budget
                .saturating_sub(self.started.elapsed())
                .saturating_sub(reserve);
            if remaining.is_zero() {
                info!("Subpage budget exhausted, skipping remaining links");
                break;
            }
            if self.cancel.is_cancelled() {
                return Err(VisitError::DeadlineExceeded);
            }

            debug!("Subpage {}", url);
            let timeout = remaining.min(config.page_timeout);
            match guarded(self.cancel, self.browser.navigate(&url, timeout)).await {
                Ok(()) => {}
                Err(e @ (VisitError::NavigationTimeout(_) | VisitError::Navigation(_))) => {
                    debug!("Skipping subpage {}: {}", url, e);
                    continue;
                }
                Err(e) => return Err(e),
            }
            self.snapshot().await?;
        }

        Ok(SessionState::CollectCookies)
    }

    /// Diff the browser's cookies against the last snapshot and append the
    /// changes.
    async fn snapshot(&mut self) -> Result<(), VisitError> {
        let cookies = guarded(self.cancel, self.browser.read_cookies()).await?;
        for event in self.jar.diff(cookies) {
            self.runner
                .store
                .append_observed_cookie(self.visit.visit_id, &event)
                .await?;
            self.cookie_events += 1;
            self.runner.update(|p| p.cookie_events += 1);
        }
        Ok(())
    }

    async fn finalize(self, failure: Option<VisitError>) -> Result<VisitOutcome, StoreError> {
        let cmp_type = self.cmp.map(|c| c.cmp_type()).unwrap_or(CmpType::None);
        let browser_lost = failure.as_ref().is_some_and(VisitError::is_fatal_to_browser);

        let (state, report) = match (failure, &self.extraction_failure) {
            (Some(err), _) => (err.crawl_state(), err.to_string()),
            (None, Some(err)) => (extraction_state(err), err.to_string()),
            (None, None) if self.cmp_missing => (
                CrawlState::CmpNotFound,
                format!("No consent platform detected, {} cookie events", self.cookie_events),
            ),
            (None, None) => (
                CrawlState::Success,
                format!(
                    "{} declarations, {} cookie events",
                    self.declarations, self.cookie_events
                ),
            ),
        };

        let record = CrawlResultRecord {
            visit_id: self.visit.visit_id,
            browser_id: self.visit.worker_id,
            cmp_type,
            state,
            report: report.clone(),
        };
        if !self.runner.store.record_result(&record).await? {
            debug!("Result for visit {} already recorded", self.visit.visit_id);
        }

        Ok(VisitOutcome {
            visit: self.visit.clone(),
            cmp_type,
            state,
            report,
            declarations: self.declarations,
            cookie_events: self.cookie_events,
            elapsed: self.started.elapsed(),
            browser_lost,
        })
    }
}
