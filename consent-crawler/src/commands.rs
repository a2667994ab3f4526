use crate::CLAP_STYLING;
use clap::{ArgGroup, arg, command};
use std::path::PathBuf;

pub fn command_argument_builder() -> clap::Command {
    clap::Command::new("consent-crawler")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("consent-crawler")
        .styles(CLAP_STYLING)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            command!("crawl")
                .about(
                    "Visit a list of sites, extract the cookies their consent platforms \
                declare and record the cookies the browser actually receives.",
                )
                .arg(
                    arg!(-u --"url" <URL>)
                        .required(false)
                        .help("A site to crawl (repeatable)")
                        .action(clap::ArgAction::Append),
                )
                .arg(
                    arg!(-f --"file" <PATH>)
                        .required(false)
                        .help("Path to a file containing one URL per line")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--"csv" <PATH>)
                        .required(false)
                        .help("Path to a delimited file such as a rank,domain toplist")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .group(
                    ArgGroup::new("input")
                        .args(["url", "file", "csv"])
                        .multiple(true)
                        .required(true),
                )
                .arg(
                    arg!(--"url-column" <INDEX>)
                        .required(false)
                        .help("Zero-based column holding the URL in --csv input")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("1"),
                )
                .arg(
                    arg!(--"delimiter" <CHAR>)
                        .required(false)
                        .help("Field delimiter of --csv input")
                        .value_parser(clap::value_parser!(char))
                        .default_value(","),
                )
                .arg(
                    arg!(-m --"mode" <MODE>)
                        .required(false)
                        .help("Consent platforms to look for")
                        .value_parser(["all", "none", "cookiebot", "onetrust", "termly"])
                        .default_value("all"),
                )
                .arg(
                    arg!(-n --"num-browsers" <NUM>)
                        .required(false)
                        .help("Number of browsers to use in parallel")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("1"),
                )
                .arg(
                    arg!(-d --"use-db" <LOCATION>)
                        .required(false)
                        .help(
                            "SQLite file or postgres:// URL to store results in \
                        (default: ./collected_data/crawl_data_<timestamp>.sqlite)",
                        ),
                )
                .arg(
                    arg!(--"resume")
                        .required(false)
                        .help("Continue the most recent crawl in --use-db")
                        .action(clap::ArgAction::SetTrue)
                        .requires("use-db"),
                )
                .arg(
                    arg!(--"offset" <RANK>)
                        .required(false)
                        .help("Skip every site up to and including this rank")
                        .value_parser(clap::value_parser!(i64)),
                )
                .arg(
                    arg!(--"batch-size" <NUM>)
                        .required(false)
                        .help("Sites per batch, leftover browsers are cleaned up between batches (0: one batch)")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("0"),
                )
                .arg(
                    arg!(--"num-subpages" <NUM>)
                        .required(false)
                        .help("Same-site links to follow on every site")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("10"),
                )
                .arg(
                    arg!(--"timeout" <SECONDS>)
                        .required(false)
                        .help("Time budget for one site")
                        .value_parser(clap::value_parser!(u64).range(1..))
                        .default_value("600"),
                )
                .arg(
                    arg!(--"page-timeout" <SECONDS>)
                        .required(false)
                        .help("Timeout for a single page load")
                        .value_parser(clap::value_parser!(u64).range(1..))
                        .default_value("30"),
                )
                .arg(
                    arg!(--"kill-grace" <SECONDS>)
                        .required(false)
                        .help("How long an overdue site may keep running before its browser is killed")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("30"),
                )
                .arg(
                    arg!(--"max-restarts" <NUM>)
                        .required(false)
                        .help("Consecutive browser failures a worker tolerates before retiring")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("3"),
                )
                .arg(
                    arg!(--"profile-dir" <PATH>)
                        .required(false)
                        .help("Browser profile copied into every crawl browser")
                        .value_parser(clap::value_parser!(PathBuf))
                        .default_value("./chrome_profile"),
                )
                .arg(
                    arg!(--"profile-tar" <PATH>)
                        .required(false)
                        .help("Extract this .tar or .tar.gz archive into --profile-dir first")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--"chrome" <PATH>)
                        .required(false)
                        .help("Chrome or Chromium executable (default: auto-detect)")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--"no-headless")
                        .required(false)
                        .help("Start the browsers with GUI")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    arg!(--"no-stdout")
                        .required(false)
                        .help("Do not print crawl results to stdout")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    arg!(--"format" <FORMAT>)
                        .required(false)
                        .help("Format of the final summary")
                        .value_parser(["text", "json"])
                        .default_value("text"),
                ),
        )
        .subcommand(
            command!("launch-browser")
                .about("Open a browser on the persistent profile so it can be set up by hand")
                .arg(
                    arg!(--"profile-dir" <PATH>)
                        .required(false)
                        .help("Profile directory to prime")
                        .value_parser(clap::value_parser!(PathBuf))
                        .default_value("./chrome_profile"),
                )
                .arg(
                    arg!(--"profile-tar" <PATH>)
                        .required(false)
                        .help("Extract this .tar or .tar.gz archive into --profile-dir first")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--"chrome" <PATH>)
                        .required(false)
                        .help("Chrome or Chromium executable (default: auto-detect)")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--"hold" <SECONDS>)
                        .required(false)
                        .help("Close the browser after this many seconds unless interrupted earlier")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("3600"),
                ),
        )
}
