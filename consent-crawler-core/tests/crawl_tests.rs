// Tests for crawl orchestration

mod common;

use common::{CountingSweeper, Fault, FaultyStore, MockLauncher, SiteScript, sites};
use consent_crawler_core::crawl::{CrawlOptions, ExitStatus, Orchestrator, prime_profile};
use consent_crawler_core::model::{CrawlState, Site, VisitOutcome};
use consent_crawler_core::store::{ResultStore, SqliteStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn options() -> CrawlOptions {
    CrawlOptions {
        workers: 2,
        per_site_timeout: Duration::from_secs(60),
        page_timeout: Duration::from_secs(5),
        kill_grace: Duration::from_secs(5),
        num_subpages: 0,
        max_restarts: 1,
        ..Default::default()
    }
}

fn orchestrator(
    store: Arc<dyn ResultStore>,
    launcher: Arc<MockLauncher>,
    sweeper: Arc<CountingSweeper>,
    options: CrawlOptions,
) -> Orchestrator {
    Orchestrator::new(store, launcher, sweeper, options).unwrap()
}

// ============================================================================
// Batching
// ============================================================================

#[tokio::test]
async fn test_batches_and_sweeps() {
    let store: Arc<dyn ResultStore> = Arc::new(SqliteStore::in_memory().unwrap());
    let launcher = Arc::new(MockLauncher::new(SiteScript::new()));
    let sweeper = Arc::new(CountingSweeper::default());

    let report = orchestrator(
        store.clone(),
        launcher.clone(),
        sweeper.clone(),
        CrawlOptions {
            batch_size: 4,
            ..options()
        },
    )
    .run(sites(10))
    .await
    .unwrap();

    assert_eq!(report.status, ExitStatus::Success);
    assert_eq!(report.batches, vec![4, 4, 2]);
    assert_eq!(report.sweeps.len(), 3);
    assert_eq!(sweeper.count(), 3);
    assert_eq!(report.visits, 10);

    let summary = store.summary(report.crawl_id).await.unwrap();
    assert_eq!(summary.visits, 10);
    assert_eq!(summary.results, 10);
    assert_eq!(summary.count_for(CrawlState::CmpNotFound), 10);

    // One fresh browser per site, each closed cleanly
    assert_eq!(launcher.stats.launches(), 10);
    assert_eq!(launcher.stats.closes(), 10);
}

#[tokio::test]
async fn test_single_batch_without_batch_size() {
    let store: Arc<dyn ResultStore> = Arc::new(SqliteStore::in_memory().unwrap());
    let sweeper = Arc::new(CountingSweeper::default());

    let report = orchestrator(
        store,
        Arc::new(MockLauncher::new(SiteScript::new())),
        sweeper.clone(),
        options(),
    )
    .run(sites(5))
    .await
    .unwrap();

    assert_eq!(report.batches, vec![5]);
    assert_eq!(sweeper.count(), 1);
}

#[tokio::test]
async fn test_empty_input_still_sweeps() {
    let store: Arc<dyn ResultStore> = Arc::new(SqliteStore::in_memory().unwrap());
    let sweeper = Arc::new(CountingSweeper::default());

    let report = orchestrator(
        store,
        Arc::new(MockLauncher::new(SiteScript::new())),
        sweeper.clone(),
        options(),
    )
    .run(Vec::new())
    .await
    .unwrap();

    assert_eq!(report.status, ExitStatus::Success);
    assert!(report.batches.is_empty());
    assert_eq!(sweeper.count(), 1);
}

#[tokio::test]
async fn test_offset_skips_leading_ranks() {
    let store: Arc<dyn ResultStore> = Arc::new(SqliteStore::in_memory().unwrap());

    let report = orchestrator(
        store,
        Arc::new(MockLauncher::new(SiteScript::new())),
        Arc::new(CountingSweeper::default()),
        CrawlOptions {
            offset: Some(2),
            ..options()
        },
    )
    .run(sites(5))
    .await
    .unwrap();

    assert_eq!(report.visits, 3);
    assert_eq!(report.batches, vec![3]);
}

// ============================================================================
// Resume
// ============================================================================

#[tokio::test]
async fn test_resume_after_complete_run_does_nothing() {
    let store: Arc<dyn ResultStore> = Arc::new(SqliteStore::in_memory().unwrap());
    let launcher = Arc::new(MockLauncher::new(SiteScript::new()));

    let first = orchestrator(
        store.clone(),
        launcher.clone(),
        Arc::new(CountingSweeper::default()),
        options(),
    )
    .run(sites(5))
    .await
    .unwrap();

    let second = orchestrator(
        store.clone(),
        launcher.clone(),
        Arc::new(CountingSweeper::default()),
        CrawlOptions {
            resume: true,
            ..options()
        },
    )
    .run(sites(5))
    .await
    .unwrap();

    assert_eq!(second.crawl_id, first.crawl_id);
    assert_eq!(second.skipped, 5);
    assert_eq!(second.visits, 0);
    assert!(second.batches.is_empty());
    assert_eq!(store.summary(first.crawl_id).await.unwrap().visits, 5);
    assert_eq!(launcher.stats.launches(), 5);
}

#[tokio::test]
async fn test_resume_continues_after_cursor() {
    let store: Arc<dyn ResultStore> = Arc::new(SqliteStore::in_memory().unwrap());

    // A previous run that finished ranks 1-3
    let first = orchestrator(
        store.clone(),
        Arc::new(MockLauncher::new(SiteScript::new())),
        Arc::new(CountingSweeper::default()),
        options(),
    )
    .run(sites(3))
    .await
    .unwrap();

    let second = orchestrator(
        store.clone(),
        Arc::new(MockLauncher::new(SiteScript::new())),
        Arc::new(CountingSweeper::default()),
        CrawlOptions {
            resume: true,
            ..options()
        },
    )
    .run(sites(6))
    .await
    .unwrap();

    assert_eq!(second.crawl_id, first.crawl_id);
    assert_eq!(second.skipped, 3);
    assert_eq!(second.visits, 3);
    assert_eq!(store.summary(first.crawl_id).await.unwrap().results, 6);
}

#[tokio::test]
async fn test_new_run_ignores_previous_crawl() {
    let store: Arc<dyn ResultStore> = Arc::new(SqliteStore::in_memory().unwrap());

    let first = orchestrator(
        store.clone(),
        Arc::new(MockLauncher::new(SiteScript::new())),
        Arc::new(CountingSweeper::default()),
        options(),
    )
    .run(sites(3))
    .await
    .unwrap();

    let second = orchestrator(
        store.clone(),
        Arc::new(MockLauncher::new(SiteScript::new())),
        Arc::new(CountingSweeper::default()),
        options(),
    )
    .run(sites(3))
    .await
    .unwrap();

    assert_ne!(second.crawl_id, first.crawl_id);
    assert_eq!(second.skipped, 0);
    assert_eq!(second.visits, 3);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_launch_failures_exhaust_workers() {
    let store: Arc<dyn ResultStore> = Arc::new(SqliteStore::in_memory().unwrap());
    let launcher = Arc::new(MockLauncher::failing());

    let report = orchestrator(
        store,
        launcher.clone(),
        Arc::new(CountingSweeper::default()),
        options(),
    )
    .run(sites(4))
    .await
    .unwrap();

    assert_eq!(report.status, ExitStatus::WorkersExhausted);
    assert_eq!(report.status.code(), 2);
    assert_eq!(report.visits, 0);
    // Two slots, each retiring after max_restarts + 1 failed launches
    assert_eq!(launcher.stats.launches(), 4);
}

#[tokio::test]
async fn test_repeated_crashes_retire_worker() {
    let store: Arc<dyn ResultStore> = Arc::new(SqliteStore::in_memory().unwrap());
    let launcher = Arc::new(MockLauncher::new(SiteScript::new().crashing()));

    let report = orchestrator(
        store.clone(),
        launcher.clone(),
        Arc::new(CountingSweeper::default()),
        CrawlOptions {
            workers: 1,
            ..options()
        },
    )
    .run(sites(5))
    .await
    .unwrap();

    assert_eq!(report.status, ExitStatus::WorkersExhausted);
    assert_eq!(report.visits, 2);
    assert_eq!(launcher.stats.kills(), 2);

    let summary = store.summary(report.crawl_id).await.unwrap();
    assert_eq!(summary.count_for(CrawlState::SessionCrash), 2);
}

#[tokio::test(start_paused = true)]
async fn test_requeued_site_taken_by_idle_worker() {
    let store: Arc<dyn ResultStore> = Arc::new(SqliteStore::in_memory().unwrap());
    // Worker 0 gives up on its site only after worker 1 found the queue empty
    let launcher = Arc::new(
        MockLauncher::new(SiteScript::new()).broken_for(0, Duration::from_secs(1)),
    );

    let report = orchestrator(
        store.clone(),
        launcher.clone(),
        Arc::new(CountingSweeper::default()),
        CrawlOptions {
            batch_size: 2,
            ..options()
        },
    )
    .run(sites(4))
    .await
    .unwrap();

    assert_eq!(report.status, ExitStatus::Success);
    assert_eq!(report.batches, vec![2, 2]);
    assert_eq!(report.visits, 4);

    let summary = store.summary(report.crawl_id).await.unwrap();
    assert_eq!(summary.results, 4);
    assert_eq!(summary.count_for(CrawlState::CmpNotFound), 4);
    assert_eq!(launcher.stats.closes(), 4);
}

#[tokio::test]
async fn test_store_failure_aborts_run() {
    let store: Arc<dyn ResultStore> = Arc::new(FaultyStore::new(Fault::FailVisitStart));
    let launcher = Arc::new(MockLauncher::new(SiteScript::new()));

    let report = orchestrator(
        store,
        launcher.clone(),
        Arc::new(CountingSweeper::default()),
        CrawlOptions {
            batch_size: 2,
            ..options()
        },
    )
    .run(sites(6))
    .await
    .unwrap();

    assert_eq!(report.status, ExitStatus::StoreFailure);
    assert_eq!(report.status.code(), 1);
    assert!(report.error.is_some());
    assert_eq!(report.batches.len(), 1);
    assert_eq!(report.visits, 0);
    // Browsers started for the failed visits are not leaked
    assert_eq!(launcher.stats.kills(), launcher.stats.launches());
}

// ============================================================================
// Timeouts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cooperative_timeout() {
    let store: Arc<dyn ResultStore> = Arc::new(SqliteStore::in_memory().unwrap());
    let launcher = Arc::new(MockLauncher::new(SiteScript::new().hanging()));

    let report = orchestrator(
        store.clone(),
        launcher.clone(),
        Arc::new(CountingSweeper::default()),
        CrawlOptions {
            workers: 1,
            per_site_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(30),
            max_restarts: 5,
            ..options()
        },
    )
    .run(sites(1))
    .await
    .unwrap();

    assert_eq!(report.status, ExitStatus::Success);
    let summary = store.summary(report.crawl_id).await.unwrap();
    assert_eq!(summary.count_for(CrawlState::Timeout), 1);
    assert_eq!(launcher.stats.kills(), 1);
    assert_eq!(launcher.stats.closes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_every_site_times_out_on_single_worker() {
    let store: Arc<dyn ResultStore> = Arc::new(SqliteStore::in_memory().unwrap());
    let launcher = Arc::new(MockLauncher::new(SiteScript::new().hanging()));
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();

    let report = orchestrator(
        store.clone(),
        launcher.clone(),
        Arc::new(CountingSweeper::default()),
        CrawlOptions {
            workers: 1,
            per_site_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(30),
            max_restarts: 5,
            ..options()
        },
    )
    .with_visit_callback(Arc::new(move |outcome: &VisitOutcome| {
        assert_eq!(outcome.state, CrawlState::Timeout);
        counter.fetch_add(1, Ordering::SeqCst);
    }))
    .run(sites(4))
    .await
    .unwrap();

    assert_eq!(report.status, ExitStatus::Success);
    assert_eq!(report.visits, 4);
    assert_eq!(count.load(Ordering::SeqCst), 4);

    let summary = store.summary(report.crawl_id).await.unwrap();
    assert_eq!(summary.results, 4);
    assert_eq!(summary.count_for(CrawlState::Timeout), 4);
    assert_eq!(launcher.stats.launches(), 4);
    assert_eq!(launcher.stats.kills(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_sessions_killed_one_after_another() {
    let faulty = Arc::new(FaultyStore::new(Fault::HangOnCookies));
    let inner = faulty.inner.clone();
    let store: Arc<dyn ResultStore> = faulty;
    let script = (1..=3).fold(SiteScript::new(), |script, rank| {
        script.cookie(&format!("https://site{}.example", rank), "sid", "1")
    });
    let launcher = Arc::new(MockLauncher::new(script));

    let report = orchestrator(
        store,
        launcher.clone(),
        Arc::new(CountingSweeper::default()),
        CrawlOptions {
            workers: 1,
            per_site_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(5),
            max_restarts: 5,
            ..options()
        },
    )
    .run(sites(3))
    .await
    .unwrap();

    // Killed browsers count as failures, but three stay within max_restarts
    assert_eq!(report.status, ExitStatus::Success);
    assert_eq!(report.visits, 3);
    assert_eq!(launcher.stats.kills(), 3);

    let summary = inner.summary(report.crawl_id).await.unwrap();
    assert_eq!(summary.results, 3);
    assert_eq!(summary.count_for(CrawlState::Timeout), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_session_is_killed() {
    let faulty = Arc::new(FaultyStore::new(Fault::HangOnCookies));
    let inner = faulty.inner.clone();
    let store: Arc<dyn ResultStore> = faulty;
    let script = SiteScript::new().cookie("https://site1.example", "sid", "1");
    let launcher = Arc::new(MockLauncher::new(script));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let callback_seen = seen.clone();

    let report = orchestrator(
        store,
        launcher.clone(),
        Arc::new(CountingSweeper::default()),
        CrawlOptions {
            workers: 1,
            per_site_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(5),
            max_restarts: 5,
            ..options()
        },
    )
    .with_visit_callback(Arc::new(move |outcome: &VisitOutcome| {
        callback_seen
            .lock()
            .unwrap()
            .push((outcome.state, outcome.report.clone()));
    }))
    .run(vec![Site::new("https://site1.example", 1)])
    .await
    .unwrap();

    assert_eq!(report.status, ExitStatus::Success);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, CrawlState::Timeout);
    // Stuck on the first cookie snapshot of the entry page
    assert!(seen[0].1.starts_with("Session unresponsive in Start"));
    drop(seen);
    assert_eq!(launcher.stats.kills(), 1);

    let summary = inner.summary(report.crawl_id).await.unwrap();
    assert_eq!(summary.results, 1);
    assert_eq!(summary.count_for(CrawlState::Timeout), 1);
}

// ============================================================================
// Callbacks and profile priming
// ============================================================================

#[tokio::test]
async fn test_callback_sees_every_visit() {
    let store: Arc<dyn ResultStore> = Arc::new(SqliteStore::in_memory().unwrap());
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();

    orchestrator(
        store,
        Arc::new(MockLauncher::new(SiteScript::new())),
        Arc::new(CountingSweeper::default()),
        options(),
    )
    .with_visit_callback(Arc::new(move |_: &VisitOutcome| {
        counter.fetch_add(1, Ordering::SeqCst);
    }))
    .run(sites(7))
    .await
    .unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 7);
}

#[tokio::test]
async fn test_invalid_options_rejected() {
    let store: Arc<dyn ResultStore> = Arc::new(SqliteStore::in_memory().unwrap());
    let result = Orchestrator::new(
        store,
        Arc::new(MockLauncher::new(SiteScript::new())),
        Arc::new(CountingSweeper::default()),
        CrawlOptions {
            workers: 0,
            ..options()
        },
    );
    assert!(result.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_prime_profile_closes_after_hold() {
    let launcher = MockLauncher::new(SiteScript::new());

    prime_profile(&launcher, Duration::from_secs(30)).await.unwrap();

    assert_eq!(launcher.stats.interactive.load(Ordering::SeqCst), 1);
    assert_eq!(launcher.stats.navigations(), vec!["about:blank".to_string()]);
    assert_eq!(launcher.stats.closes(), 1);
}
