use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("Failed to launch browser: {0}")]
    Launch(String),

    #[error("Invalid browser options: {0}")]
    InvalidOptions(String),

    #[error("Navigation to {url} timed out after {after:?}")]
    NavigationTimeout { url: String, after: Duration },

    #[error("Navigation failed: {0}")]
    Navigation(String),

    /// The DevTools connection is gone or the browser process died.
    #[error("Browser session crashed: {0}")]
    Crashed(String),

    #[error("Script evaluation failed: {0}")]
    Script(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrowserError {
    /// Errors after which the browser process must not be reused.
    pub fn is_crash(&self) -> bool {
        matches!(self, BrowserError::Crashed(_))
    }
}

/// Failures while reading a consent platform's declarations.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Failed to fetch consent resource: {0}")]
    Fetch(String),

    #[error("Could not locate consent configuration: {0}")]
    Parse(String),

    #[error("Consent platform refused to serve this region: {0}")]
    RegionBlocked(String),

    #[error("Malformed consent payload: {0}")]
    Malformed(String),

    #[error("Consent platform declared no cookies: {0}")]
    NoDeclarations(String),

    #[error("Extraction not supported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Browser(#[from] BrowserError),
}

impl From<reqwest::Error> for ExtractionError {
    fn from(err: reqwest::Error) -> Self {
        ExtractionError::Fetch(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrowserError>;
