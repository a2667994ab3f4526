use crate::model::CrawlState;
use consent_crawler_browser::{BrowserError, ExtractionError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database connection lock poisoned")]
    Poisoned,

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Why a visit did not finish cleanly.
#[derive(Error, Debug)]
pub enum VisitError {
    /// Detection could not run; the visit proceeds without a consent platform.
    #[error("Consent platform detection inconclusive: {0}")]
    DetectionInconclusive(String),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("{0}")]
    NavigationTimeout(String),

    #[error("{0}")]
    Navigation(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Browser session crashed: {0}")]
    SessionCrash(String),

    #[error("Per-site time budget exhausted")]
    DeadlineExceeded,

    #[error("Crawl aborted before the visit finished")]
    Aborted,

    #[error("Result store write failed: {0}")]
    StoreWrite(#[from] StoreError),
}

impl From<BrowserError> for VisitError {
    fn from(err: BrowserError) -> Self {
        match err {
            BrowserError::NavigationTimeout { .. } => VisitError::NavigationTimeout(err.to_string()),
            BrowserError::Navigation(msg) => VisitError::Navigation(msg),
            BrowserError::Crashed(msg) => VisitError::SessionCrash(msg),
            BrowserError::Launch(msg) => VisitError::SessionCrash(msg),
            BrowserError::Script(msg) => VisitError::Script(msg),
            other => VisitError::Script(other.to_string()),
        }
    }
}

impl VisitError {
    pub fn crawl_state(&self) -> CrawlState {
        match self {
            VisitError::DetectionInconclusive(_) => CrawlState::CmpNotFound,
            VisitError::Extraction(e) => extraction_state(e),
            VisitError::NavigationTimeout(_) | VisitError::DeadlineExceeded | VisitError::Aborted => {
                CrawlState::Timeout
            }
            VisitError::Navigation(msg) => navigation_state(msg),
            VisitError::Script(_) => CrawlState::LibraryError,
            VisitError::SessionCrash(_) => CrawlState::SessionCrash,
            VisitError::StoreWrite(_) => CrawlState::Unknown,
        }
    }

    /// Errors after which the browser process must be discarded.
    pub fn is_fatal_to_browser(&self) -> bool {
        matches!(self, VisitError::SessionCrash(_))
    }
}

/// Crawl state recorded for a failed extraction.
pub fn extraction_state(err: &ExtractionError) -> CrawlState {
    match err {
        ExtractionError::Fetch(_) | ExtractionError::Unsupported(_) => CrawlState::LibraryError,
        ExtractionError::Parse(_) => CrawlState::ParseError,
        ExtractionError::RegionBlocked(_) => CrawlState::RegionBlock,
        ExtractionError::Malformed(_) => CrawlState::MalformResp,
        ExtractionError::NoDeclarations(_) => CrawlState::NoCookies,
        ExtractionError::Browser(BrowserError::Crashed(_)) => CrawlState::SessionCrash,
        ExtractionError::Browser(BrowserError::NavigationTimeout { .. }) => CrawlState::Timeout,
        ExtractionError::Browser(_) => CrawlState::LibraryError,
    }
}

// Chrome reports network failures as net::ERR_* codes in the error text.
fn navigation_state(msg: &str) -> CrawlState {
    if msg.contains("ERR_CERT") || msg.contains("ERR_SSL") {
        CrawlState::SslError
    } else if msg.contains("ERR_HTTP_RESPONSE_CODE_FAILURE") {
        CrawlState::HttpError
    } else if msg.contains("ERR_INVALID_URL") {
        CrawlState::MalformedUrl
    } else {
        CrawlState::ConnFailed
    }
}

/// Run-level failures.
#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("Result store error: {0}")]
    Store(#[from] StoreError),

    #[error("Browser error: {0}")]
    Browser(#[from] BrowserError),

    #[error("Invalid crawl options: {0}")]
    InvalidOptions(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
