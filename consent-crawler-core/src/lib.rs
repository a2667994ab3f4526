pub mod crawl;
pub mod error;
pub mod jar;
pub mod model;
pub mod report;
pub mod session;
pub mod store;
pub mod watchdog;

pub use crawl::{CrawlOptions, ExitStatus, Orchestrator, RunReport, VisitCallback, prime_profile};
pub use error::{CrawlError, StoreError, VisitError};
pub use jar::CookieJar;
pub use model::{
    CookieEventType, CrawlResultRecord, CrawlState, CrawlSummary, ObservedCookie, Site, Visit,
    VisitOutcome,
};
pub use session::{SessionConfig, SessionRunner, SessionState, VisitProgress};
pub use store::{ResultStore, StoreLocation};
pub use watchdog::{ProcessSweeper, ProcessWatchdog, SweepReport};
