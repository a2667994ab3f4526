use crate::browser::Browser;
use crate::error::Result;
use scraper::{Html, Selector};
use std::collections::HashSet;
use tracing::debug;
use url::Url;

/// Same-site links harvested from one loaded page, in first-appearance order.
///
/// The navigator is built per visit and yields at most `limit` candidates.
#[derive(Debug, Clone)]
pub struct SubpageNavigator {
    candidates: std::vec::IntoIter<String>,
    remaining: usize,
}

impl SubpageNavigator {
    /// Harvest anchors from the page currently loaded in `browser`.
    pub async fn harvest(browser: &mut dyn Browser, limit: usize) -> Result<Self> {
        let page_url = browser.current_url().await?;
        let html = browser.page_source().await?;
        Ok(Self::from_html(&html, &page_url, limit))
    }

    pub fn from_html(html: &str, page_url: &str, limit: usize) -> Self {
        let candidates = extract_same_site_links(html, page_url);
        debug!("Found {} same-site links on {}", candidates.len(), page_url);
        Self {
            candidates: candidates.into_iter(),
            remaining: limit,
        }
    }
}

impl Iterator for SubpageNavigator {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.remaining == 0 {
            return None;
        }
        let next = self.candidates.next()?;
        self.remaining -= 1;
        Some(next)
    }
}

/// The site a page belongs to: its host without a leading `www.`.
pub fn site_domain(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(host.strip_prefix("www.").unwrap_or(host).to_lowercase())
}

fn extract_same_site_links(html: &str, page_url: &str) -> Vec<String> {
    let Some(base_domain) = site_domain(page_url) else {
        return Vec::new();
    };
    let current = resolve_url(page_url, page_url);

    let document = Html::parse_document(html);
    let Ok(link_selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for element in document.select(&link_selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let Some(absolute_url) = resolve_url(page_url, href.trim()) else {
            continue;
        };
        if Some(&absolute_url) == current.as_ref() {
            continue;
        }
        if !is_same_site(&absolute_url, &base_domain) {
            continue;
        }
        if seen.insert(absolute_url.clone()) {
            links.push(absolute_url);
        }
    }

    links
}

fn resolve_url(base: &str, href: &str) -> Option<String> {
    // Skip empty, javascript:, mailto:, tel:, etc.
    if href.is_empty()
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with('#')
    {
        return None;
    }

    let base_url = Url::parse(base).ok()?;
    let mut url = base_url.join(href).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }

    url.set_fragment(None);
    Some(url.to_string())
}

fn is_same_site(url: &str, base_domain: &str) -> bool {
    if let Ok(parsed) = Url::parse(url)
        && let Some(host) = parsed.host_str()
    {
        let host = host.to_lowercase();
        return host == base_domain || host.ends_with(&format!(".{}", base_domain));
    }
    false
}
