use crate::error::{CrawlError, StoreError};
use crate::model::{CrawlResultRecord, CrawlState, Site, VisitOutcome};
use crate::session::{SessionConfig, SessionRunner};
use crate::store::ResultStore;
use crate::watchdog::{ProcessSweeper, SweepReport};
use consent_crawler_browser::{Browser, BrowserLauncher, CmpMode, ResourceFetcher};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Options for configuring a crawl run
#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub mode: CmpMode,
    /// Number of concurrent browser sessions
    pub workers: usize,
    pub per_site_timeout: Duration,
    pub page_timeout: Duration,
    /// How long past the per-site timeout a session may keep running before
    /// its browser is killed
    pub kill_grace: Duration,
    /// Sites per batch; 0 runs everything as one batch
    pub batch_size: usize,
    pub resume: bool,
    /// Skip sites up to and including this rank
    pub offset: Option<i64>,
    pub num_subpages: usize,
    /// Consecutive browser failures a worker slot tolerates before retiring
    pub max_restarts: usize,
    pub show_progress: bool,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            mode: CmpMode::All,
            workers: 1,
            per_site_timeout: Duration::from_secs(600),
            page_timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(30),
            batch_size: 0,
            resume: false,
            offset: None,
            num_subpages: 10,
            max_restarts: 3,
            show_progress: false,
        }
    }
}

impl CrawlOptions {
    pub fn validate(&self) -> Result<(), CrawlError> {
        if self.workers < 1 {
            return Err(CrawlError::InvalidOptions(
                "number of browsers must be at least 1".to_string(),
            ));
        }
        if self.per_site_timeout.is_zero() {
            return Err(CrawlError::InvalidOptions(
                "per-site timeout must be greater than zero".to_string(),
            ));
        }
        if self.page_timeout.is_zero() {
            return Err(CrawlError::InvalidOptions(
                "page timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            mode: self.mode,
            num_subpages: self.num_subpages,
            page_timeout: self.page_timeout,
            visit_budget: self.per_site_timeout,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    /// A result store write failed and the run was aborted.
    StoreFailure,
    /// Every worker slot retired with sites still queued.
    WorkersExhausted,
}

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::StoreFailure => 1,
            ExitStatus::WorkersExhausted => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub crawl_id: i64,
    pub status: ExitStatus,
    /// Size of every batch that ran, in order.
    pub batches: Vec<usize>,
    pub sweeps: Vec<SweepReport>,
    /// Sites dropped from the queue because a result already existed.
    pub skipped: usize,
    pub visits: usize,
    pub error: Option<String>,
}

/// Callback for reporting individual visits as they finish
pub type VisitCallback = Arc<dyn Fn(&VisitOutcome) + Send + Sync>;

enum BatchOutcome {
    Completed,
    Exhausted { remaining: usize },
    StoreFailed(StoreError),
}

enum SlotEnd {
    Drained,
    Stopped,
    Retired,
    Aborted(StoreError),
}

/// Sites of one batch shared by its worker slots. A taken site stays in
/// flight until its [`InFlight`] guard drops, and a slot finding the queue
/// empty waits while other sites are in flight since they may be put back.
struct BatchQueue {
    state: Mutex<QueueState>,
    changed: Notify,
}

struct QueueState {
    sites: VecDeque<Site>,
    in_flight: usize,
}

/// Marks a site as taken by a slot; dropping it releases the site.
struct InFlight {
    queue: Arc<BatchQueue>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.queue.lock().in_flight -= 1;
        self.queue.changed.notify_waiters();
    }
}

impl BatchQueue {
    fn new(sites: VecDeque<Site>) -> Self {
        Self {
            state: Mutex::new(QueueState { sites, in_flight: 0 }),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next site, or `None` once nothing is queued or in flight.
    async fn take(self: &Arc<Self>, abort: &CancellationToken) -> Option<(Site, InFlight)> {
        loop {
            let changed = self.changed.notified();
            {
                let mut state = self.lock();
                if let Some(site) = state.sites.pop_front() {
                    state.in_flight += 1;
                    return Some((site, InFlight { queue: self.clone() }));
                }
                if state.in_flight == 0 {
                    return None;
                }
            }
            tokio::select! {
                _ = changed => {}
                _ = abort.cancelled() => return None,
            }
        }
    }

    /// Requeue a site at the front; release its guard afterwards.
    fn put_back(&self, site: Site) {
        self.lock().sites.push_front(site);
    }

    fn remaining(&self) -> usize {
        self.lock().sites.len()
    }
}

/// Everything a worker slot needs, shared across the slots of one batch.
struct SlotContext {
    store: Arc<dyn ResultStore>,
    launcher: Arc<dyn BrowserLauncher>,
    fetcher: ResourceFetcher,
    session: SessionConfig,
    per_site_timeout: Duration,
    kill_grace: Duration,
    max_restarts: usize,
    crawl_id: i64,
    abort: CancellationToken,
    progress: Option<ProgressBar>,
    on_visit: Option<VisitCallback>,
}

/// Owns a pool of browser sessions for one crawl run.
pub struct Orchestrator {
    store: Arc<dyn ResultStore>,
    launcher: Arc<dyn BrowserLauncher>,
    sweeper: Arc<dyn ProcessSweeper>,
    fetcher: ResourceFetcher,
    options: CrawlOptions,
    browser_params: serde_json::Value,
    on_visit: Option<VisitCallback>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ResultStore>,
        launcher: Arc<dyn BrowserLauncher>,
        sweeper: Arc<dyn ProcessSweeper>,
        options: CrawlOptions,
    ) -> Result<Self, CrawlError> {
        options.validate()?;
        let fetcher = ResourceFetcher::with_timeout(options.page_timeout.as_secs().max(1))
            .map_err(|e| CrawlError::InvalidOptions(e.to_string()))?;

        Ok(Self {
            store,
            launcher,
            sweeper,
            fetcher,
            options,
            browser_params: serde_json::Value::Null,
            on_visit: None,
        })
    }

    /// Parameters stored with the crawl registration.
    pub fn with_browser_params(mut self, params: serde_json::Value) -> Self {
        self.browser_params = params;
        self
    }

    pub fn with_visit_callback(mut self, callback: VisitCallback) -> Self {
        self.on_visit = Some(callback);
        self
    }

    pub fn options(&self) -> &CrawlOptions {
        &self.options
    }

    /// Crawl `sites` and return once every batch has finished or the run
    /// had to stop.
    pub async fn run(&self, sites: Vec<Site>) -> Result<RunReport, CrawlError> {
        let crawl_id = self.crawl_id().await?;
        let offset = self.options.offset;
        let mut pending: VecDeque<Site> = sites
            .into_iter()
            .filter(|site| offset.is_none_or(|o| site.rank > o))
            .collect();

        let abort = CancellationToken::new();
        let mut report = RunReport {
            crawl_id,
            status: ExitStatus::Success,
            batches: Vec::new(),
            sweeps: Vec::new(),
            skipped: 0,
            visits: 0,
            error: None,
        };

        loop {
            // Recomputed before every batch: the store is the source of truth
            if let Some(cursor) = self.store.resume_cursor(crawl_id).await? {
                let before = pending.len();
                pending.retain(|site| site.rank > cursor);
                if report.batches.is_empty() && before > pending.len() {
                    report.skipped = before - pending.len();
                    info!(
                        "Resuming after rank {}, skipping {} sites",
                        cursor, report.skipped
                    );
                }
            }
            if pending.is_empty() {
                break;
            }

            let take = match self.options.batch_size {
                0 => pending.len(),
                n => n.min(pending.len()),
            };
            let batch: VecDeque<Site> = pending.drain(..take).collect();
            info!(
                "Starting batch {} with {} sites ({} left afterwards)",
                report.batches.len() + 1,
                take,
                pending.len()
            );

            let outcome = self.run_batch(crawl_id, batch, &abort, &mut report).await;
            report.batches.push(take);
            report.sweeps.push(self.sweep().await);

            match outcome {
                BatchOutcome::Completed => {}
                BatchOutcome::Exhausted { remaining } => {
                    error!(
                        "All workers retired with {} sites left in the batch",
                        remaining
                    );
                    report.status = ExitStatus::WorkersExhausted;
                    report.error = Some(format!("workers exhausted, {} sites left", remaining));
                    break;
                }
                BatchOutcome::StoreFailed(e) => {
                    error!("Aborting crawl: {}", e);
                    report.status = ExitStatus::StoreFailure;
                    report.error = Some(e.to_string());
                    break;
                }
            }
        }

        if report.batches.is_empty() {
            info!("Nothing left to crawl");
            report.sweeps.push(self.sweep().await);
        }

        Ok(report)
    }

    async fn crawl_id(&self) -> Result<i64, CrawlError> {
        if self.options.resume {
            match self.store.latest_crawl().await? {
                Some(id) => {
                    info!("Resuming crawl {}", id);
                    return Ok(id);
                }
                None => warn!("No previous crawl in the database, starting a new one"),
            }
        }
        let id = self.store.register_crawl(&self.browser_params).await?;
        info!("Registered crawl {}", id);
        Ok(id)
    }

    async fn run_batch(
        &self,
        crawl_id: i64,
        batch: VecDeque<Site>,
        abort: &CancellationToken,
        report: &mut RunReport,
    ) -> BatchOutcome {
        let size = batch.len();
        let queue = Arc::new(BatchQueue::new(batch));
        let progress = self.progress_bar(size);

        let ctx = Arc::new(SlotContext {
            store: self.store.clone(),
            launcher: self.launcher.clone(),
            fetcher: self.fetcher.clone(),
            session: self.options.session_config(),
            per_site_timeout: self.options.per_site_timeout,
            kill_grace: self.options.kill_grace,
            max_restarts: self.options.max_restarts,
            crawl_id,
            abort: abort.clone(),
            progress: progress.clone(),
            on_visit: self.on_visit.clone(),
        });

        let slots = self.options.workers.min(size).max(1);
        let mut handles = Vec::with_capacity(slots);
        for slot in 0..slots {
            handles.push(tokio::spawn(worker_slot(ctx.clone(), slot, queue.clone())));
        }

        let mut store_failure = None;
        for handle in handles {
            match handle.await {
                Ok((visits, end)) => {
                    report.visits += visits;
                    if let SlotEnd::Aborted(e) = end
                        && store_failure.is_none()
                    {
                        store_failure = Some(e);
                    }
                }
                Err(e) => error!("Worker slot panicked: {}", e),
            }
        }

        if let Some(pb) = progress {
            pb.finish_and_clear();
        }

        if let Some(e) = store_failure {
            return BatchOutcome::StoreFailed(e);
        }
        let remaining = queue.remaining();
        if remaining > 0 {
            BatchOutcome::Exhausted { remaining }
        } else {
            BatchOutcome::Completed
        }
    }

    async fn sweep(&self) -> SweepReport {
        let sweeper = self.sweeper.clone();
        match tokio::task::spawn_blocking(move || sweeper.sweep()).await {
            Ok(report) => report,
            Err(e) => {
                warn!("Watchdog sweep failed: {}", e);
                SweepReport::default()
            }
        }
    }

    fn progress_bar(&self, len: usize) -> Option<ProgressBar> {
        if !self.options.show_progress {
            return None;
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb.enable_steady_tick(Duration::from_millis(200));
        Some(pb)
    }
}

async fn worker_slot(
    ctx: Arc<SlotContext>,
    slot: usize,
    queue: Arc<BatchQueue>,
) -> (usize, SlotEnd) {
    let mut failures = 0usize;
    let mut visits = 0usize;

    loop {
        if ctx.abort.is_cancelled() {
            return (visits, SlotEnd::Stopped);
        }
        let Some((site, in_flight)) = queue.take(&ctx.abort).await else {
            if ctx.abort.is_cancelled() {
                return (visits, SlotEnd::Stopped);
            }
            debug!(worker_id = slot, "Queue drained");
            return (visits, SlotEnd::Drained);
        };

        let browser = match ctx.launcher.launch(slot).await {
            Ok(browser) => browser,
            Err(e) => {
                failures += 1;
                warn!(worker_id = slot, "Browser launch failed ({} in a row): {}", failures, e);
                queue.put_back(site);
                drop(in_flight);
                if failures > ctx.max_restarts {
                    error!(worker_id = slot, "Retiring worker after {} failures", failures);
                    return (visits, SlotEnd::Retired);
                }
                continue;
            }
        };

        let result = visit_site(&ctx, slot, site, browser).await;
        drop(in_flight);
        match result {
            Ok(outcome) => {
                visits += 1;
                failures = if outcome.browser_lost { failures + 1 } else { 0 };

                if let Some(pb) = &ctx.progress {
                    pb.inc(1);
                    pb.set_message(outcome.visit.site.url.clone());
                }
                if let Some(callback) = &ctx.on_visit {
                    match &ctx.progress {
                        Some(pb) => pb.suspend(|| callback(&outcome)),
                        None => callback(&outcome),
                    }
                }

                if failures > ctx.max_restarts {
                    error!(worker_id = slot, "Retiring worker after {} failures", failures);
                    return (visits, SlotEnd::Retired);
                }
            }
            Err(e) => {
                ctx.abort.cancel();
                return (visits, SlotEnd::Aborted(e));
            }
        }
    }
}

/// Run one visit under the soft deadline and the hard kill timer.
async fn visit_site(
    ctx: &SlotContext,
    slot: usize,
    site: Site,
    mut browser: Box<dyn Browser>,
) -> Result<VisitOutcome, StoreError> {
    let visit = match ctx.store.record_visit_start(ctx.crawl_id, slot, &site).await {
        Ok(visit) => visit,
        Err(e) => {
            browser.kill().await;
            return Err(e);
        }
    };

    let runner = SessionRunner::new(ctx.store.clone(), ctx.fetcher.clone(), ctx.session.clone())
        .with_abort(ctx.abort.clone());

    let deadline = ctx.abort.child_token();
    let timer = {
        let deadline = deadline.clone();
        let after = ctx.per_site_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            deadline.cancel();
        })
    };

    let hard_limit = ctx.per_site_timeout + ctx.kill_grace;
    let result =
        tokio::time::timeout(hard_limit, runner.run(&visit, browser.as_mut(), &deadline)).await;
    timer.abort();

    match result {
        Ok(Ok(outcome)) => {
            if outcome.browser_lost || outcome.state == CrawlState::Timeout {
                browser.kill().await;
            } else if let Err(e) = browser.close().await {
                debug!("Closing browser failed: {}", e);
                browser.kill().await;
            }
            Ok(outcome)
        }
        Ok(Err(e)) => {
            browser.kill().await;
            Err(e)
        }
        Err(_) => {
            let progress = runner.progress();
            warn!(
                visit_id = visit.visit_id,
                worker_id = slot,
                "Session stuck in {:?} {}s after its deadline, killing browser",
                progress.state,
                ctx.kill_grace.as_secs()
            );
            browser.kill().await;

            let mut record = CrawlResultRecord {
                visit_id: visit.visit_id,
                browser_id: slot,
                cmp_type: progress.cmp_type,
                state: CrawlState::Timeout,
                report: format!(
                    "Session unresponsive in {:?} after {}s, browser killed",
                    progress.state,
                    hard_limit.as_secs()
                ),
            };
            if !ctx.store.record_result(&record).await?
                && let Some(stored) = ctx.store.crawl_result(visit.visit_id).await?
            {
                debug!("Visit {} finalized before the kill", visit.visit_id);
                record = stored;
            }

            Ok(VisitOutcome {
                visit,
                cmp_type: record.cmp_type,
                state: record.state,
                report: record.report,
                declarations: progress.declarations,
                cookie_events: progress.cookie_events,
                elapsed: hard_limit,
                browser_lost: true,
            })
        }
    }
}

/// Start one headful browser on the persistent profile and keep it open until
/// Ctrl-C or `hold` elapses, so the profile can be configured by hand.
pub async fn prime_profile(launcher: &dyn BrowserLauncher, hold: Duration) -> Result<(), CrawlError> {
    let mut browser = launcher.launch_interactive().await?;
    if let Err(e) = browser.navigate("about:blank", Duration::from_secs(30)).await {
        browser.kill().await;
        return Err(e.into());
    }

    info!("Browser ready for profile setup, press Ctrl-C when done");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted, closing browser"),
        _ = tokio::time::sleep(hold) => info!("Hold time elapsed, closing browser"),
    }

    browser.close().await?;
    Ok(())
}
