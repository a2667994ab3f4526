use crate::browser::Browser;
use crate::error::ExtractionError;
use crate::result::Declaration;
use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};

lazy_static! {
    static ref BASE_PATTERN: Regex = RegexBuilder::new(r"https://app\.termly\.io/")
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|e| panic!("invalid Termly pattern: {}", e));
}

pub fn detect(html: &str) -> bool {
    BASE_PATTERN.is_match(html)
}

// Termly is detection-only for now; its snippet API is not scraped.
pub async fn extract(browser: &mut dyn Browser) -> Result<Vec<Declaration>, ExtractionError> {
    let url = browser.current_url().await?;
    Err(ExtractionError::Unsupported(format!(
        "TERMLY: declaration extraction is not implemented ({})",
        url
    )))
}
