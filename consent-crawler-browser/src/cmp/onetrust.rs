//! OneTrust publishes its consent configuration on one of a handful of CDNs,
//! either as JSON reached through the page's data-domain id or as an object
//! literal inside a `/consent/<uuid>.js` script. Both may sit in an iframe.

use super::category::{CookieCategory, LabelLanguage, categorize_label};
use crate::browser::Browser;
use crate::error::ExtractionError;
use crate::fetch::ResourceFetcher;
use crate::result::Declaration;
use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};
use scraper::{Html, Selector};
use serde_json::Value;
use tracing::{debug, info, warn};

const CDN_BASES: [&str; 7] = [
    "https://cdn-apac.onetrust.com",
    "https://cdn-ukwest.onetrust.com",
    "https://cdn.cookielaw.org",
    "https://cmp-cdn.cookielaw.org",
    "https://optanon.blob.core.windows.net",
    "https://cookie-cdn.cookiepro.com",
    "https://cookiepro.blob.core.windows.net",
];

/// Generic data-domain id some sites ship instead of their own.
const DEFAULT_STACK_ID: &str = "center-center-default-stack-global-ot";

lazy_static! {
    static ref DETECT_PATTERN: Regex = RegexBuilder::new(
        r"https://(cdn-apac\.onetrust\.com|cdn-ukwest\.onetrust\.com|cdn\.cookielaw\.org|cmp-cdn\.cookielaw\.org|optanon\.blob\.core\.windows\.net|cookie-cdn\.cookiepro\.com|cookiepro\.blob\.core\.windows\.net)"
    )
    .case_insensitive(true)
    .build()
    .unwrap_or_else(|e| panic!("invalid OneTrust pattern: {}", e));
    static ref UUID_PATTERN: Regex = Regex::new(
        r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}(-test)?$"
    )
    .unwrap_or_else(|e| panic!("invalid uuid pattern: {}", e));
    static ref SCRIPT_URL_PATTERN: Regex = Regex::new(
        r"/consent/[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}[a-zA-Z0-9_-]*\.js"
    )
    .unwrap_or_else(|e| panic!("invalid OneTrust script pattern: {}", e));
    static ref GROUPS_START: Regex = Regex::new(r",\s*Groups:\s*\[")
        .unwrap_or_else(|e| panic!("invalid OneTrust groups pattern: {}", e));
}

pub fn detect(html: &str) -> bool {
    DETECT_PATTERN.is_match(html)
}

fn cdn_base(src: &str) -> Option<&'static str> {
    CDN_BASES.iter().copied().find(|base| src.starts_with(base))
}

/// Where the consent configuration lives for this page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A `data-domain-script` id served from a known CDN base.
    DataDomain { base: String, id: String },
    /// The configuration is inlined in a `/consent/<uuid>.js` script.
    InlineScript { url: String },
}

pub fn find_source(html: &str) -> Option<Source> {
    let document = Html::parse_document(html);

    if let Ok(selector) = Selector::parse("script[data-domain-script]") {
        for element in document.select(&selector) {
            let Some(id) = element.value().attr("data-domain-script") else {
                continue;
            };
            if !UUID_PATTERN.is_match(id) && id != DEFAULT_STACK_ID {
                continue;
            }
            let Some(src) = element.value().attr("src") else {
                warn!("ONETRUST: data-domain-script {} has no src", id);
                continue;
            };
            match cdn_base(src) {
                Some(base) => {
                    return Some(Source::DataDomain {
                        base: base.to_string(),
                        id: id.to_string(),
                    });
                }
                None => warn!("ONETRUST: data-domain-script {} served from unknown host {}", id, src),
            }
        }
    }

    if let Ok(selector) = Selector::parse("script[src]") {
        for element in document.select(&selector) {
            let Some(src) = element.value().attr("src") else {
                continue;
            };
            if cdn_base(src).is_some() && SCRIPT_URL_PATTERN.is_match(src) {
                return Some(Source::InlineScript {
                    url: src.to_string(),
                });
            }
        }
    }

    None
}

/// Search the top document and its frames. A data-domain id anywhere wins
/// over an inline consent script.
pub fn find_source_in(documents: &[String]) -> Option<Source> {
    let found: Vec<Source> = documents.iter().filter_map(|html| find_source(html)).collect();
    found
        .iter()
        .find(|source| matches!(source, Source::DataDomain { .. }))
        .cloned()
        .or_else(|| found.into_iter().next())
}

/// Pick `(language, ruleset id)` pairs from the ruleset index.
///
/// English variants are preferred, then German; rulesets without a known
/// language fall back to English.
pub fn parse_rulesets(index: &Value) -> Result<Vec<(String, String)>, ExtractionError> {
    let rulesets = index
        .get("RuleSet")
        .and_then(Value::as_array)
        .ok_or_else(|| ExtractionError::Parse("ONETRUST: No valid 'RuleSet' element".to_string()))?;

    let mut ids = Vec::new();
    for ruleset in rulesets {
        let Some(id) = ruleset.get("Id").and_then(Value::as_str) else {
            continue;
        };
        let Some(languages) = ruleset
            .get("LanguageSwitcherPlaceholder")
            .and_then(Value::as_object)
        else {
            continue;
        };
        let offered: Vec<&str> = languages.values().filter_map(Value::as_str).collect();

        let lang = ["en", "en-GB", "en-US", "de"]
            .iter()
            .find(|l| offered.contains(l))
            .map(|l| l.to_lowercase())
            .unwrap_or_else(|| {
                warn!("ONETRUST: ruleset {} has no recognized language, using english", id);
                "en".to_string()
            });
        ids.push((lang, id.to_string()));
    }

    if ids.is_empty() {
        return Err(ExtractionError::Parse(
            "ONETRUST: No valid language ruleset found".to_string(),
        ));
    }
    Ok(ids)
}

fn label_language(domain_data: &Value) -> LabelLanguage {
    let culture = domain_data
        .get("Language")
        .and_then(|l| l.get("Culture"))
        .and_then(Value::as_str)
        .unwrap_or("en");
    if culture.to_lowercase().starts_with("de") {
        LabelLanguage::German
    } else {
        LabelLanguage::English
    }
}

fn cookie_declaration(cookie: &Value, group_name: Option<&str>, category: CookieCategory) -> Option<Declaration> {
    let name = cookie.get("Name").and_then(Value::as_str)?;
    let host = cookie.get("Host").and_then(Value::as_str).unwrap_or_default();

    let mut declaration = Declaration::new(name, host, category, group_name.unwrap_or_default());
    if let Some(purpose) = cookie.get("description").and_then(Value::as_str) {
        declaration = declaration.with_purpose(purpose);
    }
    let is_session = cookie
        .get("IsSession")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if is_session {
        declaration = declaration.with_expiry("session");
    } else if let Some(length) = cookie.get("Length") {
        let length = match length {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        declaration = declaration.with_expiry(length);
    }
    Some(declaration)
}

/// Read the declarations from one language file's `DomainData`.
pub fn parse_domain_data(doc: &Value) -> Result<Vec<Declaration>, ExtractionError> {
    let domain_data = doc
        .get("DomainData")
        .ok_or_else(|| ExtractionError::Malformed("ONETRUST: missing DomainData".to_string()))?;
    let groups = domain_data
        .get("Groups")
        .and_then(Value::as_array)
        .ok_or_else(|| ExtractionError::Malformed("ONETRUST: missing Groups".to_string()))?;
    let language = label_language(domain_data);

    let mut declarations = Vec::new();
    for group in groups {
        let group_name = group.get("GroupName").and_then(Value::as_str);
        let category = categorize_label(group_name, language);

        if let Some(cookies) = group.get("FirstPartyCookies").and_then(Value::as_array) {
            declarations.extend(
                cookies
                    .iter()
                    .filter_map(|c| cookie_declaration(c, group_name, category)),
            );
        }

        if let Some(hosts) = group.get("Hosts").and_then(Value::as_array) {
            for host in hosts {
                if let Some(cookies) = host.get("Cookies").and_then(Value::as_array) {
                    declarations.extend(
                        cookies
                            .iter()
                            .filter_map(|c| cookie_declaration(c, group_name, category)),
                    );
                }
            }
        }
    }

    Ok(declarations)
}

/// Cut the `Groups:[...]` member out of an inline consent script.
pub fn find_groups_literal(script: &str) -> Option<&str> {
    let start = GROUPS_START.find(script)?;
    let bytes = script.as_bytes();
    let mut depth = 1;
    let mut quote: Option<u8> = None;
    let mut escaped = false;
    let mut i = start.end();

    while i < bytes.len() && depth > 0 {
        let b = bytes[i];
        match quote {
            Some(_) if escaped => escaped = false,
            Some(_) if b == b'\\' => escaped = true,
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'[' => depth += 1,
                b']' => depth -= 1,
                _ => {}
            },
        }
        i += 1;
    }

    if depth > 0 {
        return None;
    }
    // Skip the leading comma
    Some(script[start.start() + 1..i].trim())
}

/// Turn a JavaScript object literal body (`Groups:[...]`) into JSON.
///
/// Covers what minified consent scripts use: bare and single-quoted keys,
/// single-quoted strings, `!0`/`!1`, `void 0`, `undefined` and trailing
/// commas. Other bare identifiers in value position become `null`.
pub fn parse_object_literal(body: &str) -> Result<Value, ExtractionError> {
    let chars: Vec<char> = format!("{{{}}}", body).chars().collect();
    let mut out = String::with_capacity(chars.len() + chars.len() / 4);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' | '\'' => {
                i = read_string(&chars, i, &mut out)?;
                continue;
            }
            '!' if matches!(chars.get(i + 1), Some('0') | Some('1')) => {
                out.push_str(if chars[i + 1] == '0' { "true" } else { "false" });
                i += 2;
                continue;
            }
            '}' | ']' => {
                let trimmed = out.trim_end().len();
                out.truncate(trimmed);
                if out.ends_with(',') {
                    out.pop();
                }
                out.push(c);
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                if next_significant(&chars, i) == Some(':') {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                    continue;
                }
                match word.as_str() {
                    "true" | "false" | "null" => out.push_str(&word),
                    "void" => {
                        // `void 0`
                        while i < chars.len() && (chars[i].is_whitespace() || chars[i].is_ascii_digit()) {
                            i += 1;
                        }
                        out.push_str("null");
                    }
                    _ => out.push_str("null"),
                }
                continue;
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || matches!(chars[i], '.' | '-' | '+'))
                {
                    i += 1;
                }
                let number: String = chars[start..i].iter().collect();
                if next_significant(&chars, i) == Some(':') {
                    out.push('"');
                    out.push_str(&number);
                    out.push('"');
                } else if number.starts_with('.') {
                    out.push('0');
                    out.push_str(&number);
                } else {
                    out.push_str(&number);
                }
                continue;
            }
            _ => out.push(c),
        }
        i += 1;
    }

    serde_json::from_str(&out)
        .map_err(|e| ExtractionError::Malformed(format!("ONETRUST: consent object is not valid: {}", e)))
}

fn next_significant(chars: &[char], from: usize) -> Option<char> {
    chars[from.min(chars.len())..].iter().copied().find(|c| !c.is_whitespace())
}

/// Copy the string literal starting at `start` into `out` as a JSON string.
/// Returns the index after the closing quote.
fn read_string(chars: &[char], start: usize, out: &mut String) -> Result<usize, ExtractionError> {
    let quote = chars[start];
    let mut i = start + 1;
    out.push('"');

    while i < chars.len() {
        let c = chars[i];
        if c == quote {
            out.push('"');
            return Ok(i + 1);
        }
        match c {
            '\\' => {
                let Some(&next) = chars.get(i + 1) else { break };
                match next {
                    '\'' => out.push('\''),
                    'x' => {
                        let hex: String = chars.iter().skip(i + 2).take(2).collect();
                        out.push_str("\\u00");
                        out.push_str(&hex);
                        i += 2;
                    }
                    '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u' => {
                        out.push('\\');
                        out.push(next);
                    }
                    other => out.push(other),
                }
                i += 2;
                continue;
            }
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
        i += 1;
    }

    Err(ExtractionError::Malformed(
        "ONETRUST: unterminated string in consent object".to_string(),
    ))
}

/// Read the declarations from an inline consent object's `Groups`.
///
/// Labels are matched against the English patterns first and the German ones
/// when English finds nothing.
pub fn parse_inline_groups(consent: &Value) -> Result<Vec<Declaration>, ExtractionError> {
    let groups = consent
        .get("Groups")
        .and_then(Value::as_array)
        .ok_or_else(|| ExtractionError::Malformed("ONETRUST: missing Groups".to_string()))?;

    let mut declarations = Vec::new();
    for group in groups {
        let properties = match group.get("Parent") {
            Some(parent) if !parent.is_null() => parent.get("GroupLanguagePropertiesSets"),
            _ => group.get("GroupLanguagePropertiesSets"),
        };
        let label = properties
            .and_then(Value::as_array)
            .and_then(|sets| sets.first())
            .and_then(|set| set.get("GroupName"))
            .and_then(|name| name.get("Text"))
            .and_then(Value::as_str);
        if label.is_none() {
            debug!("ONETRUST: group without a name, keeping its cookies");
        }

        let category = match categorize_label(label, LabelLanguage::English) {
            CookieCategory::Unknown => categorize_label(label, LabelLanguage::German),
            category => category,
        };

        let cookies = group
            .get("Cookies")
            .and_then(Value::as_array)
            .ok_or_else(|| ExtractionError::Malformed("ONETRUST: group without Cookies".to_string()))?;
        declarations.extend(
            cookies
                .iter()
                .filter_map(|c| cookie_declaration(c, label, category)),
        );
    }

    Ok(declarations)
}

async fn extract_inline_script(
    fetcher: &ResourceFetcher,
    url: &str,
) -> Result<Vec<Declaration>, ExtractionError> {
    let script = fetcher.get_text(url, None).await?;
    let body = find_groups_literal(&script).ok_or_else(|| {
        ExtractionError::Parse("ONETRUST: no Groups object in the consent script".to_string())
    })?;
    let consent = parse_object_literal(body)?;
    let declarations = parse_inline_groups(&consent)?;

    if declarations.is_empty() {
        return Err(ExtractionError::NoDeclarations(format!(
            "ONETRUST: consent script {} contained zero cookies",
            url
        )));
    }
    Ok(declarations)
}

async fn extract_data_domain(
    fetcher: &ResourceFetcher,
    base: &str,
    id: &str,
) -> Result<Vec<Declaration>, ExtractionError> {
    let index_url = format!("{}/consent/{}/{}.json", base, id, id);
    let index = fetcher.get_json(&index_url).await?;
    let rulesets = parse_rulesets(&index)?;

    for (lang, ruleset) in rulesets {
        let url = format!("{}/consent/{}/{}/{}.json", base, id, ruleset, lang);
        let doc = match fetcher.get_json(&url).await {
            Ok(doc) => doc,
            Err(e) => {
                warn!("ONETRUST: failed to retrieve ruleset {}: {}", url, e);
                continue;
            }
        };
        match parse_domain_data(&doc) {
            Ok(declarations) if !declarations.is_empty() => return Ok(declarations),
            Ok(_) => continue,
            Err(e) => warn!("ONETRUST: {} ({})", e, url),
        }
    }

    Err(ExtractionError::NoDeclarations(format!(
        "ONETRUST: Could not extract any cookies for data domain {}",
        id
    )))
}

pub async fn extract(
    browser: &mut dyn Browser,
    fetcher: &ResourceFetcher,
) -> Result<Vec<Declaration>, ExtractionError> {
    let mut documents = vec![browser.page_source().await?];
    match browser.frame_sources().await {
        Ok(frames) => documents.extend(frames),
        Err(e) => debug!("ONETRUST: could not read frames: {}", e),
    }

    match find_source_in(&documents) {
        Some(Source::DataDomain { base, id }) => {
            info!("ONETRUST: data domain {} on {}", id, base);
            let declarations = extract_data_domain(fetcher, &base, &id).await?;
            info!("ONETRUST: Extracted {} cookie entries", declarations.len());
            Ok(declarations)
        }
        Some(Source::InlineScript { url }) => {
            info!("ONETRUST: inline consent script {}", url);
            let declarations = extract_inline_script(fetcher, &url).await?;
            info!("ONETRUST: Extracted {} cookie entries", declarations.len());
            Ok(declarations)
        }
        None => Err(ExtractionError::Parse(
            "ONETRUST: Could not find a data domain id or consent script".to_string(),
        )),
    }
}
