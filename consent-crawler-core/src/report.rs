// Crawl summary rendering

use crate::crawl::RunReport;
use crate::model::{CrawlState, CrawlSummary};

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n";

pub fn generate_text_summary(summary: &CrawlSummary, run: Option<&RunReport>) -> String {
    let mut report = String::new();

    report.push_str(RULE);
    report.push_str("                           CONSENT CRAWL SUMMARY\n");
    report.push_str(RULE);
    report.push('\n');

    report.push_str(&format!("Crawl ID:        {}\n", summary.crawl_id));
    report.push_str(&format!("Visits:          {}\n", summary.visits));
    report.push_str(&format!("Results:         {}\n", summary.results));
    report.push_str(&format!("Declarations:    {}\n", summary.declarations));
    report.push_str(&format!("Cookie events:   {}\n", summary.cookie_events));

    if let Some(run) = run {
        report.push_str(&format!("Batches:         {}\n", format_batches(&run.batches)));
        if run.skipped > 0 {
            report.push_str(&format!("Skipped:         {} (already crawled)\n", run.skipped));
        }
        let zombies: usize = run.sweeps.iter().map(|s| s.zombies).sum();
        if zombies > 0 {
            report.push_str(&format!("Zombies:         {}\n", zombies));
        }
    }
    report.push('\n');

    if !summary.by_state.is_empty() {
        report.push_str("Results by state:\n");
        for (state, count) in &summary.by_state {
            report.push_str(&format!(
                "  [{:>2}] {:<16} {:>6}  {}\n",
                state.id(),
                state.as_str(),
                count,
                percentage(*count, summary.results)
            ));
        }
        report.push('\n');
    }

    if !summary.by_cmp.is_empty() {
        report.push_str("Results by CMP:\n");
        for (cmp, count) in &summary.by_cmp {
            report.push_str(&format!("  {:<21} {:>6}\n", cmp.as_str(), count));
        }
        report.push('\n');
    }

    let unfinished = summary.visits - summary.results;
    if unfinished > 0 {
        report.push_str(&format!("{} visits have no result yet\n\n", unfinished));
    }

    let success = summary.count_for(CrawlState::Success);
    report.push_str(RULE);
    report.push_str(&format!(
        "{} of {} sites crawled successfully\n",
        success, summary.results
    ));
    report.push_str(RULE);

    report
}

pub fn generate_json_summary(summary: &CrawlSummary) -> Result<String, serde_json::Error> {
    let by_state: Vec<serde_json::Value> = summary
        .by_state
        .iter()
        .map(|(state, count)| {
            serde_json::json!({
                "code": state.id(),
                "state": state.as_str(),
                "count": count,
            })
        })
        .collect();
    let by_cmp: serde_json::Map<String, serde_json::Value> = summary
        .by_cmp
        .iter()
        .map(|(cmp, count)| (cmp.as_str().to_string(), serde_json::json!(count)))
        .collect();

    serde_json::to_string_pretty(&serde_json::json!({
        "crawl_id": summary.crawl_id,
        "visits": summary.visits,
        "results": summary.results,
        "declarations": summary.declarations,
        "cookie_events": summary.cookie_events,
        "by_state": by_state,
        "by_cmp": by_cmp,
    }))
}

fn format_batches(batches: &[usize]) -> String {
    if batches.is_empty() {
        return "none".to_string();
    }
    batches
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn percentage(count: i64, total: i64) -> String {
    if total == 0 {
        return "-".to_string();
    }
    format!("{:.1}%", count as f64 * 100.0 / total as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage() {
        assert_eq!(percentage(1, 4), "25.0%");
        assert_eq!(percentage(3, 0), "-");
    }

    #[test]
    fn test_format_batches() {
        assert_eq!(format_batches(&[4, 4, 2]), "4, 4, 2");
        assert_eq!(format_batches(&[]), "none");
    }
}
