//! Consent management platform detection and declaration extraction.
//!
//! Each supported provider is one [`Cmp`] variant. Adding a provider means a
//! new variant, its module, and an entry in [`DETECTION_ORDER`].

pub mod category;
pub mod cookiebot;
pub mod onetrust;
pub mod termly;

use crate::browser::Browser;
use crate::error::{BrowserError, ExtractionError};
use crate::fetch::ResourceFetcher;
use crate::result::Declaration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Declarations produced by one extraction; consumed once per visit.
pub type Declarations = std::vec::IntoIter<Declaration>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpType {
    Cookiebot,
    OneTrust,
    Termly,
    None,
}

impl CmpType {
    pub fn id(&self) -> i64 {
        match self {
            CmpType::Cookiebot => 0,
            CmpType::OneTrust => 1,
            CmpType::Termly => 2,
            CmpType::None => -1,
        }
    }

    pub fn from_id(id: i64) -> Self {
        match id {
            0 => CmpType::Cookiebot,
            1 => CmpType::OneTrust,
            2 => CmpType::Termly,
            _ => CmpType::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CmpType::Cookiebot => "Cookiebot",
            CmpType::OneTrust => "OneTrust",
            CmpType::Termly => "Termly",
            CmpType::None => "none",
        }
    }
}

impl fmt::Display for CmpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which providers a crawl looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpMode {
    /// Try every provider in [`DETECTION_ORDER`], stop at the first match.
    All,
    /// Assume this provider without detection.
    Forced(CmpType),
    /// Skip consent platforms, only collect cookies.
    None,
}

impl FromStr for CmpMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" => Ok(CmpMode::All),
            "none" => Ok(CmpMode::None),
            "cookiebot" => Ok(CmpMode::Forced(CmpType::Cookiebot)),
            "onetrust" => Ok(CmpMode::Forced(CmpType::OneTrust)),
            "termly" => Ok(CmpMode::Forced(CmpType::Termly)),
            other => Err(format!("Unknown CMP mode '{}'", other)),
        }
    }
}

impl fmt::Display for CmpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmpMode::All => f.write_str("all"),
            CmpMode::None => f.write_str("none"),
            CmpMode::Forced(cmp) => write!(f, "{}", cmp.as_str().to_lowercase()),
        }
    }
}

/// A consent platform capable of detection and extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Cookiebot,
    OneTrust,
    Termly,
    None,
}

/// Fixed detection priority used by [`CmpMode::All`].
pub const DETECTION_ORDER: [Cmp; 3] = [Cmp::Cookiebot, Cmp::OneTrust, Cmp::Termly];

impl Cmp {
    pub fn for_type(cmp_type: CmpType) -> Self {
        match cmp_type {
            CmpType::Cookiebot => Cmp::Cookiebot,
            CmpType::OneTrust => Cmp::OneTrust,
            CmpType::Termly => Cmp::Termly,
            CmpType::None => Cmp::None,
        }
    }

    pub fn cmp_type(&self) -> CmpType {
        match self {
            Cmp::Cookiebot => CmpType::Cookiebot,
            Cmp::OneTrust => CmpType::OneTrust,
            Cmp::Termly => CmpType::Termly,
            Cmp::None => CmpType::None,
        }
    }

    /// Fingerprint check over page markup. Side-effect free.
    pub fn detect_in_source(&self, html: &str) -> bool {
        match self {
            Cmp::Cookiebot => cookiebot::detect(html),
            Cmp::OneTrust => onetrust::detect(html),
            Cmp::Termly => termly::detect(html),
            Cmp::None => false,
        }
    }

    pub async fn detect(&self, browser: &mut dyn Browser) -> Result<bool, BrowserError> {
        if *self == Cmp::None {
            return Ok(false);
        }
        let html = browser.page_source().await?;
        Ok(self.detect_in_source(&html))
    }

    /// Read every cookie the provider declares for the loaded page.
    pub async fn extract(
        &self,
        browser: &mut dyn Browser,
        fetcher: &ResourceFetcher,
    ) -> Result<Declarations, ExtractionError> {
        let declarations = match self {
            Cmp::Cookiebot => cookiebot::extract(browser, fetcher).await?,
            Cmp::OneTrust => onetrust::extract(browser, fetcher).await?,
            Cmp::Termly => termly::extract(browser).await?,
            Cmp::None => Vec::new(),
        };
        Ok(declarations.into_iter())
    }
}

/// Outcome of probing providers in priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub found: Option<Cmp>,
    /// Providers whose `detect` actually ran, in order.
    pub attempted: Vec<CmpType>,
}

/// Probe `order` until one provider matches.
pub async fn detect_first(
    browser: &mut dyn Browser,
    order: &[Cmp],
) -> Result<Detection, BrowserError> {
    let mut attempted = Vec::with_capacity(order.len());
    for cmp in order {
        attempted.push(cmp.cmp_type());
        if cmp.detect(browser).await? {
            debug!("Detected {} consent platform", cmp.cmp_type());
            return Ok(Detection {
                found: Some(*cmp),
                attempted,
            });
        }
    }
    Ok(Detection {
        found: None,
        attempted,
    })
}
