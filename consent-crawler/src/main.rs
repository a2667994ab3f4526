use colored::Colorize;
use consent_crawler::commands::command_argument_builder;
use consent_crawler::handlers::{handle_crawl, handle_launch_browser};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let matches = command_argument_builder().get_matches();

    // Logs go to stderr, stdout carries the per-site results
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let code = match matches.subcommand() {
        Some(("crawl", sub_matches)) => match handle_crawl(sub_matches).await {
            Ok(code) => code,
            Err(e) => {
                eprintln!("{} {:#}", "✗".red().bold(), e);
                1
            }
        },
        Some(("launch-browser", sub_matches)) => match handle_launch_browser(sub_matches).await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("{} {:#}", "✗".red().bold(), e);
                1
            }
        },
        _ => unreachable!("clap should ensure we don't get here"),
    };

    std::process::exit(code);
}
