use anyhow::{Context, bail};
use chrono::Local;
use clap::ArgMatches;
use colored::Colorize;
use consent_crawler_browser::{ChromeLauncher, ChromeOptions, CmpMode};
use consent_crawler_core::crawl::{CrawlOptions, Orchestrator, VisitCallback, prime_profile};
use consent_crawler_core::model::{CrawlState, Site, VisitOutcome};
use consent_crawler_core::report::{generate_json_summary, generate_text_summary};
use consent_crawler_core::store::{self, ResultStore, StoreLocation};
use consent_crawler_core::watchdog::ProcessWatchdog;
use flate2::read::GzDecoder;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

pub const DATA_DIR: &str = "./collected_data";
pub const RETRY_LIST: &str = "./collected_data/retry_list.txt";

// Helper functions for the crawl handler

/// Parse a single input line as a site URL, adding `https://` when the line has
/// no scheme. Returns the URL and whether the scheme was assumed.
pub fn parse_url_line(line: &str) -> Option<(String, bool)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (candidate, assumed) = if line.contains("://") {
        (line.to_string(), false)
    } else {
        (format!("https://{}", line), true)
    };

    match Url::parse(&candidate) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && is_plausible_host(&url) => {
            Some((candidate, assumed))
        }
        _ => {
            warn!("Skipping invalid URL '{}'", line);
            None
        }
    }
}

// Header cells of toplists ("domain", "url") parse as single-label hosts
fn is_plausible_host(url: &Url) -> bool {
    match url.host_str() {
        Some("localhost") => true,
        Some(host) => host.contains('.') || host.contains(':'),
        None => false,
    }
}

/// Load raw lines from a newline-delimited file
pub fn load_urls_from_file(path: &Path) -> anyhow::Result<Vec<String>> {
    if !path.exists() {
        bail!("File at {} does not exist", path.display());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Load one column of a delimited file
pub fn load_urls_from_csv(path: &Path, column: usize, delimiter: char) -> anyhow::Result<Vec<String>> {
    if !path.exists() {
        bail!("File at {} does not exist", path.display());
    }
    if !delimiter.is_ascii() {
        bail!("Delimiter must be a single ASCII character");
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter as u8)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut urls = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Malformed record in {}", path.display()))?;
        match record.get(column) {
            Some(value) if !value.trim().is_empty() => urls.push(value.trim().to_string()),
            _ => warn!("Line {} of {} has no column {}", line + 1, path.display(), column),
        }
    }
    Ok(urls)
}

/// Combine every input into ranked sites: literal URLs first, then the line
/// file, then the delimited file. Ranks are 1-based positions in that order.
pub fn load_sites(
    urls: &[String],
    file: Option<&Path>,
    csv: Option<(&Path, usize, char)>,
) -> anyhow::Result<Vec<Site>> {
    let mut lines: Vec<String> = urls.to_vec();
    if let Some(path) = file {
        lines.extend(load_urls_from_file(path)?);
    }
    if let Some((path, column, delimiter)) = csv {
        lines.extend(load_urls_from_csv(path, column, delimiter)?);
    }

    let sites: Vec<Site> = lines
        .iter()
        .filter_map(|line| parse_url_line(line))
        .enumerate()
        .map(|(i, (url, assumed))| {
            let site = Site::new(url, i as i64 + 1);
            if assumed { site.with_assumed_scheme() } else { site }
        })
        .collect();

    if sites.is_empty() {
        bail!("No valid URLs in the given input");
    }
    Ok(sites)
}

/// Default SQLite location for a fresh crawl
pub fn default_db_path() -> PathBuf {
    Path::new(DATA_DIR).join(format!(
        "crawl_data_{}.sqlite",
        Local::now().format("%Y%m%d_%H%M%S")
    ))
}

pub fn store_location(use_db: Option<&String>) -> StoreLocation {
    match use_db {
        Some(location) => StoreLocation::parse(shellexpand::tilde(location).as_ref()),
        None => StoreLocation::Sqlite(default_db_path()),
    }
}

/// Unpack a `.tar` or `.tar.gz` profile archive into `dest`
pub fn extract_profile(archive: &Path, dest: &Path) -> anyhow::Result<()> {
    if !archive.exists() {
        bail!("File at {} does not exist", archive.display());
    }
    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;

    let file = File::open(archive)
        .with_context(|| format!("Failed to open {}", archive.display()))?;
    let name = archive.to_string_lossy().to_lowercase();
    let reader: Box<dyn Read> = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    tar::Archive::new(reader)
        .unpack(dest)
        .with_context(|| format!("Failed to extract {}", archive.display()))?;
    info!("Extracted profile {} into {}", archive.display(), dest.display());
    Ok(())
}

/// States worth feeding back into a retry crawl
pub fn is_retry_candidate(state: CrawlState) -> bool {
    matches!(
        state,
        CrawlState::Timeout | CrawlState::SessionCrash | CrawlState::ConnFailed
    )
}

pub fn append_retry(path: &Path, url: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", url)
}

/// One colored result line per finished visit
pub fn format_visit_line(outcome: &VisitOutcome) -> String {
    let state = outcome.state.as_str();
    let (marker, state) = match outcome.state {
        CrawlState::Success => ("✓".green().bold(), state.green()),
        CrawlState::CmpNotFound | CrawlState::NoCookies => ("•".yellow(), state.yellow()),
        _ => ("✗".red().bold(), state.red()),
    };

    format!(
        "{} [{}] {} {} {} ({} declarations, {} cookie events, {:.1}s)",
        marker,
        outcome.visit.site.rank.to_string().cyan(),
        outcome.visit.site.url.bright_white(),
        outcome.cmp_type.as_str().blue(),
        state,
        outcome.declarations,
        outcome.cookie_events,
        outcome.elapsed.as_secs_f64()
    )
}

fn chrome_options(args: &ArgMatches, profile_dir: &Path) -> ChromeOptions {
    ChromeOptions {
        executable: args.get_one::<PathBuf>("chrome").cloned(),
        profile_template: Some(profile_dir.to_path_buf()),
        ..Default::default()
    }
}

pub fn crawl_options(args: &ArgMatches) -> anyhow::Result<CrawlOptions> {
    let mode: CmpMode = args
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("all")
        .parse()
        .map_err(anyhow::Error::msg)?;

    let options = CrawlOptions {
        mode,
        workers: *args.get_one::<usize>("num-browsers").unwrap_or(&1),
        per_site_timeout: Duration::from_secs(*args.get_one::<u64>("timeout").unwrap_or(&600)),
        page_timeout: Duration::from_secs(*args.get_one::<u64>("page-timeout").unwrap_or(&30)),
        kill_grace: Duration::from_secs(*args.get_one::<u64>("kill-grace").unwrap_or(&30)),
        batch_size: *args.get_one::<usize>("batch-size").unwrap_or(&0),
        resume: args.get_flag("resume"),
        offset: args.get_one::<i64>("offset").copied(),
        num_subpages: *args.get_one::<usize>("num-subpages").unwrap_or(&10),
        max_restarts: *args.get_one::<usize>("max-restarts").unwrap_or(&3),
        show_progress: !args.get_flag("no-stdout"),
    };
    options.validate()?;
    Ok(options)
}

pub fn sites_from_args(args: &ArgMatches) -> anyhow::Result<Vec<Site>> {
    let urls: Vec<String> = args
        .get_many::<String>("url")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let file = args.get_one::<PathBuf>("file").map(PathBuf::as_path);
    let csv = args.get_one::<PathBuf>("csv").map(|path| {
        (
            path.as_path(),
            *args.get_one::<usize>("url-column").unwrap_or(&1),
            *args.get_one::<char>("delimiter").unwrap_or(&','),
        )
    });
    load_sites(&urls, file, csv)
}

/// Run the `crawl` subcommand and return the process exit code
pub async fn handle_crawl(args: &ArgMatches) -> anyhow::Result<i32> {
    let options = crawl_options(args)?;
    let sites = sites_from_args(args)?;
    let quiet = args.get_flag("no-stdout");

    let profile_dir = args
        .get_one::<PathBuf>("profile-dir")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("./chrome_profile"));
    if let Some(archive) = args.get_one::<PathBuf>("profile-tar") {
        extract_profile(archive, &profile_dir)?;
    }

    let chrome = ChromeOptions {
        headless: !args.get_flag("no-headless"),
        ..chrome_options(args, &profile_dir)
    };
    let launcher = ChromeLauncher::new(chrome.clone()).context("Invalid browser options")?;
    let watchdog = ProcessWatchdog::default()
        .with_marker(launcher.run_root().display().to_string())
        .with_max_age(options.per_site_timeout * 4);

    let location = store_location(args.get_one::<String>("use-db"));
    let store = store::open(&location)
        .await
        .context("Failed to open result store")?;

    if !quiet {
        println!();
        println!(
            "{} Crawling {} site(s) with {} browser(s)",
            "→".blue().bold(),
            sites.len().to_string().cyan(),
            options.workers.to_string().cyan()
        );
        println!("{} Mode: {}", "→".blue(), options.mode.to_string().bright_white());
        match &location {
            StoreLocation::Sqlite(path) => println!(
                "{} Results: {}",
                "→".blue(),
                path.display().to_string().bright_white()
            ),
            StoreLocation::Postgres(_) => println!("{} Results: PostgreSQL", "→".blue()),
        }
        println!();
    }

    let browser_params = serde_json::json!({
        "browser": chrome,
        "mode": options.mode.to_string(),
        "num_browsers": options.workers,
        "num_subpages": options.num_subpages,
        "timeout": options.per_site_timeout.as_secs(),
        "page_timeout": options.page_timeout.as_secs(),
        "batch_size": options.batch_size,
    });

    let retry_list = PathBuf::from(RETRY_LIST);
    let on_visit: VisitCallback = Arc::new(move |outcome: &VisitOutcome| {
        if !quiet {
            println!("{}", format_visit_line(outcome));
        }
        if is_retry_candidate(outcome.state)
            && let Err(e) = append_retry(&retry_list, &outcome.visit.site.url)
        {
            warn!("Could not update retry list: {}", e);
        }
    });

    let orchestrator = Orchestrator::new(store.clone(), Arc::new(launcher), Arc::new(watchdog), options)?
        .with_browser_params(browser_params)
        .with_visit_callback(on_visit);
    let report = orchestrator.run(sites).await?;

    if !quiet {
        let summary = store.summary(report.crawl_id).await?;
        println!();
        match args.get_one::<String>("format").map(String::as_str) {
            Some("json") => println!("{}", generate_json_summary(&summary)?),
            _ => print!("{}", generate_text_summary(&summary, Some(&report))),
        }
    }

    if let Some(e) = &report.error {
        eprintln!("{} Crawl stopped: {}", "✗".red().bold(), e);
    }
    Ok(report.status.code())
}

/// Run the `launch-browser` subcommand
pub async fn handle_launch_browser(args: &ArgMatches) -> anyhow::Result<()> {
    let profile_dir = args
        .get_one::<PathBuf>("profile-dir")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("./chrome_profile"));
    if let Some(archive) = args.get_one::<PathBuf>("profile-tar") {
        extract_profile(archive, &profile_dir)?;
    }
    let hold = Duration::from_secs(*args.get_one::<u64>("hold").unwrap_or(&3600));

    let launcher = ChromeLauncher::new(ChromeOptions {
        headless: false,
        ..chrome_options(args, &profile_dir)
    })
    .context("Invalid browser options")?;

    println!(
        "{} Profile: {}",
        "→".blue(),
        profile_dir.display().to_string().bright_white()
    );
    println!("{} Press Ctrl-C when the profile is ready", "ℹ".blue());

    prime_profile(&launcher, hold).await?;
    println!("{} Browser closed", "✓".green().bold());
    Ok(())
}
