use chrono::{DateTime, Utc};
use consent_crawler_browser::{CmpType, CookieRecord};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A crawl target. Ranks are 1-based positions in the input list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub url: String,
    pub rank: i64,
    /// The input had no scheme and `https://` was assumed.
    pub scheme_assumed: bool,
}

impl Site {
    pub fn new(url: impl Into<String>, rank: i64) -> Self {
        Self {
            url: url.into(),
            rank,
            scheme_assumed: false,
        }
    }

    pub fn with_assumed_scheme(mut self) -> Self {
        self.scheme_assumed = true;
        self
    }
}

/// One attempt at crawling a [`Site`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    pub visit_id: i64,
    pub crawl_id: i64,
    pub worker_id: usize,
    pub site: Site,
    pub started_at: DateTime<Utc>,
}

/// Terminal state of a visit, stored as its numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrawlState {
    Success,
    ConnFailed,
    HttpError,
    ParseError,
    CmpNotFound,
    BotDetection,
    MalformedUrl,
    SslError,
    LibraryError,
    RegionBlock,
    MalformResp,
    NoCookies,
    Timeout,
    SessionCrash,
    Unknown,
}

impl CrawlState {
    pub fn id(&self) -> i64 {
        match self {
            CrawlState::Success => 0,
            CrawlState::ConnFailed => 1,
            CrawlState::HttpError => 2,
            CrawlState::ParseError => 3,
            CrawlState::CmpNotFound => 4,
            CrawlState::BotDetection => 5,
            CrawlState::MalformedUrl => 6,
            CrawlState::SslError => 7,
            CrawlState::LibraryError => 8,
            CrawlState::RegionBlock => 9,
            CrawlState::MalformResp => 10,
            CrawlState::NoCookies => 11,
            CrawlState::Timeout => 12,
            CrawlState::SessionCrash => 13,
            CrawlState::Unknown => -1,
        }
    }

    pub fn from_id(id: i64) -> Self {
        match id {
            0 => CrawlState::Success,
            1 => CrawlState::ConnFailed,
            2 => CrawlState::HttpError,
            3 => CrawlState::ParseError,
            4 => CrawlState::CmpNotFound,
            5 => CrawlState::BotDetection,
            6 => CrawlState::MalformedUrl,
            7 => CrawlState::SslError,
            8 => CrawlState::LibraryError,
            9 => CrawlState::RegionBlock,
            10 => CrawlState::MalformResp,
            11 => CrawlState::NoCookies,
            12 => CrawlState::Timeout,
            13 => CrawlState::SessionCrash,
            _ => CrawlState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlState::Success => "success",
            CrawlState::ConnFailed => "connection failed",
            CrawlState::HttpError => "http error",
            CrawlState::ParseError => "parse error",
            CrawlState::CmpNotFound => "cmp not found",
            CrawlState::BotDetection => "bot detection",
            CrawlState::MalformedUrl => "malformed url",
            CrawlState::SslError => "ssl error",
            CrawlState::LibraryError => "library error",
            CrawlState::RegionBlock => "region block",
            CrawlState::MalformResp => "malformed response",
            CrawlState::NoCookies => "no cookies",
            CrawlState::Timeout => "timeout",
            CrawlState::SessionCrash => "session crash",
            CrawlState::Unknown => "unknown",
        }
    }

    pub fn is_success(&self) -> bool {
        *self == CrawlState::Success
    }

    /// Failures worth another attempt in a later, explicit retry crawl.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CrawlState::Timeout | CrawlState::SessionCrash | CrawlState::ConnFailed
        )
    }
}

impl fmt::Display for CrawlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CookieEventType {
    AddedOrChanged,
    Deleted,
}

impl CookieEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CookieEventType::AddedOrChanged => "added-or-changed",
            CookieEventType::Deleted => "deleted",
        }
    }
}

/// One entry of the append-only observed cookie log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedCookie {
    pub record_type: CookieEventType,
    pub cookie: CookieRecord,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlResultRecord {
    pub visit_id: i64,
    pub browser_id: usize,
    pub cmp_type: CmpType,
    pub state: CrawlState,
    pub report: String,
}

/// What a finished visit looks like to callers of the orchestrator.
#[derive(Debug, Clone)]
pub struct VisitOutcome {
    pub visit: Visit,
    pub cmp_type: CmpType,
    pub state: CrawlState,
    pub report: String,
    pub declarations: usize,
    pub cookie_events: usize,
    pub elapsed: Duration,
    /// The browser crashed or was killed and must not be reused.
    pub browser_lost: bool,
}

/// Aggregate counts for one crawl.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrawlSummary {
    pub crawl_id: i64,
    pub visits: i64,
    pub results: i64,
    pub by_state: Vec<(CrawlState, i64)>,
    pub by_cmp: Vec<(CmpType, i64)>,
    pub declarations: i64,
    pub cookie_events: i64,
}

impl CrawlSummary {
    pub fn count_for(&self, state: CrawlState) -> i64 {
        self.by_state
            .iter()
            .find(|(s, _)| *s == state)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}
