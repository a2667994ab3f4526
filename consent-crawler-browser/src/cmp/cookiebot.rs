//! Cookiebot keeps its declarations in a per-customer `cc.js` file on its CDN.
//! The page only has to reveal the customer id; the file is fetched directly.

use super::category::CookieCategory;
use crate::browser::Browser;
use crate::error::ExtractionError;
use crate::fetch::ResourceFetcher;
use crate::result::Declaration;
use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};
use scraper::{Html, Selector};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

const UUID: &str = r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}";

/// Table suffixes in `cc.js`, with the category each one declares.
const CATEGORY_TABLES: [(&str, CookieCategory); 5] = [
    ("Necessary", CookieCategory::Necessary),
    ("Preference", CookieCategory::Functional),
    ("Statistics", CookieCategory::Analytics),
    ("Advertising", CookieCategory::Advertising),
    ("Unclassified", CookieCategory::Uncategorized),
];

lazy_static! {
    static ref BASE_PATTERN: Regex = RegexBuilder::new(r"https://consent\.cookiebot\.(com|eu)/")
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|e| panic!("invalid Cookiebot pattern: {}", e));
    static ref UUID_PATTERN: Regex = Regex::new(&format!("^{}$", UUID))
        .unwrap_or_else(|e| panic!("invalid uuid pattern: {}", e));
    static ref CC_URL_PATTERN: Regex = Regex::new(&format!(
        r"https://consent\.cookiebot\.(com|eu)/({})/cc\.js",
        UUID
    ))
    .unwrap_or_else(|e| panic!("invalid cc.js pattern: {}", e));
    static ref CBID_PARAM_PATTERN: Regex = Regex::new(&format!(r"[&?]cbid=({})", UUID))
        .unwrap_or_else(|e| panic!("invalid cbid pattern: {}", e));
    static ref INVALID_DOMAIN_PATTERN: Regex =
        Regex::new(r"cookiedomainwarning='Error: .* is not a valid domain\.")
            .unwrap_or_else(|e| panic!("invalid domain warning pattern: {}", e));
    static ref TABLE_PATTERN: Regex = Regex::new(
        r"CookieConsentDialog\.cookieTable(Necessary|Preference|Statistics|Advertising|Unclassified) = "
    )
    .unwrap_or_else(|e| panic!("invalid cookie table pattern: {}", e));
}

pub fn detect(html: &str) -> bool {
    BASE_PATTERN.is_match(html)
}

/// Locate the Cookiebot customer id and the CDN top level domain.
///
/// Tried in order: a `data-cbid` attribute on a script tag, an id embedded in
/// a `cc.js` URL, a `cbid=` query parameter.
pub fn find_cbid(html: &str) -> Option<(String, String)> {
    let document = Html::parse_document(html);
    if let Ok(selector) = Selector::parse("script[data-cbid]") {
        for element in document.select(&selector) {
            let Some(cbid) = element.value().attr("data-cbid") else {
                continue;
            };
            if !UUID_PATTERN.is_match(cbid) {
                continue;
            }
            let tld = element
                .value()
                .attr("src")
                .and_then(|src| BASE_PATTERN.captures(src))
                .map(|c| c[1].to_lowercase())
                .unwrap_or_else(|| "com".to_string());
            debug!("Found Cookiebot id in data-cbid attribute");
            return Some((cbid.to_string(), tld));
        }
    }

    if let Some(caps) = CC_URL_PATTERN.captures(html) {
        debug!("Found Cookiebot id in cc.js URL");
        return Some((caps[2].to_string(), caps[1].to_lowercase()));
    }

    if let Some(caps) = CBID_PARAM_PATTERN.captures(html) {
        debug!("Found Cookiebot id in cbid parameter");
        let tld = BASE_PATTERN
            .captures(html)
            .map(|c| c[1].to_lowercase())
            .unwrap_or_else(|| "com".to_string());
        return Some((caps[1].to_string(), tld));
    }

    None
}

/// The referer Cookiebot expects may be pinned in the page's `cc.js` URL;
/// otherwise the page URL is used.
pub fn find_referer(html: &str, cbid: &str, tld: &str, fallback: &str) -> String {
    let pattern = format!(
        r"https://consent\.cookiebot\.{}/{}/cc\.js[^'\x22\s]*?(?:\?|&amp;|&)referer=([^&'\x22\s]+)",
        regex::escape(tld),
        regex::escape(cbid)
    );
    match Regex::new(&pattern) {
        Ok(re) => re
            .captures(html)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| fallback.to_string()),
        Err(_) => fallback.to_string(),
    }
}

/// Reject payloads Cookiebot serves instead of the cookie tables.
pub fn check_payload(js: &str, cc_url: &str, referer: &str) -> Result<(), ExtractionError> {
    if js.contains("CookieConsent.setOutOfRegion") {
        return Err(ExtractionError::RegionBlocked(format!(
            "COOKIEBOT: Received an out-of-region response from \"{}\"",
            cc_url
        )));
    }
    if INVALID_DOMAIN_PATTERN.is_match(js) {
        return Err(ExtractionError::Fetch(format!(
            "COOKIEBOT: Unrecognized referer: {}",
            referer
        )));
    }
    if js.trim().is_empty() {
        return Err(ExtractionError::Malformed(format!(
            "COOKIEBOT: Empty response when retrieving \"{}\"",
            cc_url
        )));
    }
    Ok(())
}

fn string_field(row: &[Value], idx: usize) -> String {
    match row.get(idx) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Parse every `cookieTable<Category>` array in a `cc.js` body.
///
/// Rows are `[name, domain, purpose, expiry, type name, type id]`.
pub fn parse_declarations(js: &str) -> Result<Vec<Declaration>, ExtractionError> {
    let mut declarations = Vec::new();
    let mut tables_found = 0;

    for caps in TABLE_PATTERN.captures_iter(js) {
        let label = &caps[1];
        let Some((_, category)) = CATEGORY_TABLES.iter().find(|(name, _)| *name == label) else {
            continue;
        };
        tables_found += 1;

        let Some(assignment) = caps.get(0) else {
            continue;
        };

        // Exactly one array after the assignment; purposes may contain "];"
        let rows: Vec<Vec<Value>> = serde_json::Deserializer::from_str(&js[assignment.end()..])
            .into_iter::<Vec<Vec<Value>>>()
            .next()
            .unwrap_or_else(|| Ok(Vec::new()))
            .map_err(|e| {
                ExtractionError::Malformed(format!(
                    "COOKIEBOT: cookie table {} is not a valid array: {}",
                    label, e
                ))
            })?;

        for row in rows {
            let name = string_field(&row, 0);
            if name.is_empty() {
                continue;
            }
            let type_name = Some(string_field(&row, 4)).filter(|s| !s.is_empty());
            let type_id = row.get(5).and_then(Value::as_i64);
            declarations.push(
                Declaration::new(name, string_field(&row, 1), *category, label)
                    .with_purpose(string_field(&row, 2))
                    .with_expiry(string_field(&row, 3))
                    .with_type(type_name, type_id),
            );
        }
    }

    if tables_found == 0 {
        warn!("COOKIEBOT: no cookie tables present in cc.js");
    }

    Ok(declarations)
}

pub async fn extract(
    browser: &mut dyn Browser,
    fetcher: &ResourceFetcher,
) -> Result<Vec<Declaration>, ExtractionError> {
    let html = browser.page_source().await?;
    let page_url = browser.current_url().await?;

    let (cbid, tld) = find_cbid(&html).ok_or_else(|| {
        ExtractionError::Parse(format!("COOKIEBOT: Failed to find cbid on {}", page_url))
    })?;
    info!("COOKIEBOT: Cookiebot id = {}, TLD = {}", cbid, tld);

    let referer = find_referer(&html, &cbid, &tld, &page_url);
    let base = format!("https://consent.cookiebot.{}/{}/cc.js", tld, cbid);
    let cc_url = Url::parse_with_params(&base, &[("referer", referer.as_str())])
        .map(|u| u.to_string())
        .unwrap_or(base);

    let js = fetcher.get_text(&cc_url, Some(&page_url)).await?;
    check_payload(&js, &cc_url, &referer)?;

    let declarations = parse_declarations(&js)?;
    if declarations.is_empty() {
        return Err(ExtractionError::NoDeclarations(format!(
            "COOKIEBOT: No cookies found in {}",
            cc_url
        )));
    }

    info!("COOKIEBOT: Extracted {} cookie entries", declarations.len());
    Ok(declarations)
}
