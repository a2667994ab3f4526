// Tests for crawl summary rendering

use consent_crawler_browser::CmpType;
use consent_crawler_core::crawl::{ExitStatus, RunReport};
use consent_crawler_core::model::{CrawlState, CrawlSummary};
use consent_crawler_core::report::{generate_json_summary, generate_text_summary};
use consent_crawler_core::watchdog::SweepReport;

fn summary() -> CrawlSummary {
    CrawlSummary {
        crawl_id: 7,
        visits: 5,
        results: 4,
        by_state: vec![
            (CrawlState::Success, 3),
            (CrawlState::CmpNotFound, 1),
        ],
        by_cmp: vec![(CmpType::None, 1), (CmpType::Cookiebot, 3)],
        declarations: 42,
        cookie_events: 17,
    }
}

#[test]
fn test_text_summary_contains_counts() {
    let text = generate_text_summary(&summary(), None);

    assert!(text.contains("CONSENT CRAWL SUMMARY"));
    assert!(text.contains("Crawl ID:        7"));
    assert!(text.contains("Declarations:    42"));
    assert!(text.contains("success"));
    assert!(text.contains("75.0%"));
    assert!(text.contains("Cookiebot"));
    assert!(text.contains("1 visits have no result yet"));
    assert!(text.contains("3 of 4 sites crawled successfully"));
}

#[test]
fn test_text_summary_with_run_report() {
    let run = RunReport {
        crawl_id: 7,
        status: ExitStatus::Success,
        batches: vec![2, 2, 1],
        sweeps: vec![
            SweepReport {
                matched: 3,
                signalled: 3,
                killed: 0,
                zombies: 1,
            },
            SweepReport::default(),
        ],
        skipped: 4,
        visits: 5,
        error: None,
    };

    let text = generate_text_summary(&summary(), Some(&run));
    assert!(text.contains("Batches:         2, 2, 1"));
    assert!(text.contains("Skipped:         4 (already crawled)"));
    assert!(text.contains("Zombies:         1"));
}

#[test]
fn test_empty_summary() {
    let text = generate_text_summary(&CrawlSummary::default(), None);
    assert!(text.contains("0 of 0 sites crawled successfully"));
    assert!(!text.contains("Results by state"));
}

#[test]
fn test_json_summary() {
    let json = generate_json_summary(&summary()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

    assert_eq!(parsed["crawl_id"], 7);
    assert_eq!(parsed["results"], 4);
    assert_eq!(parsed["by_state"][0]["code"], 0);
    assert_eq!(parsed["by_state"][0]["count"], 3);
    assert_eq!(parsed["by_cmp"]["Cookiebot"], 3);
    assert_eq!(parsed["by_cmp"]["none"], 1);
}
