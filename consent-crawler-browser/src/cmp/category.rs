use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Purpose category of a declared cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CookieCategory {
    Necessary,
    Functional,
    Analytics,
    Advertising,
    Uncategorized,
    SocialMedia,
    Unknown,
}

impl CookieCategory {
    pub fn id(&self) -> i64 {
        match self {
            CookieCategory::Necessary => 0,
            CookieCategory::Functional => 1,
            CookieCategory::Analytics => 2,
            CookieCategory::Advertising => 3,
            CookieCategory::Uncategorized => 4,
            CookieCategory::SocialMedia => 5,
            CookieCategory::Unknown => -1,
        }
    }

    pub fn from_id(id: i64) -> Self {
        match id {
            0 => CookieCategory::Necessary,
            1 => CookieCategory::Functional,
            2 => CookieCategory::Analytics,
            3 => CookieCategory::Advertising,
            4 => CookieCategory::Uncategorized,
            5 => CookieCategory::SocialMedia,
            _ => CookieCategory::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CookieCategory::Necessary => "necessary",
            CookieCategory::Functional => "functional",
            CookieCategory::Analytics => "analytics",
            CookieCategory::Advertising => "advertising",
            CookieCategory::Uncategorized => "uncategorized",
            CookieCategory::SocialMedia => "social_media",
            CookieCategory::Unknown => "unknown",
        }
    }

    /// Position in the privacy ordering, if the category takes part in it.
    fn precedence(&self) -> Option<u8> {
        match self {
            CookieCategory::Necessary => Some(0),
            CookieCategory::Functional => Some(1),
            CookieCategory::Analytics => Some(2),
            CookieCategory::Advertising => Some(3),
            _ => None,
        }
    }

    /// Category kept when the same cookie is declared twice in one visit.
    ///
    /// Necessary < Functional < Analytics < Advertising, the more
    /// privacy-invasive one wins. Uncategorized, social media and unknown are
    /// outside that order: they never replace a ranked category, are replaced
    /// by one, and between themselves the first declaration stays.
    pub fn resolve(existing: CookieCategory, incoming: CookieCategory) -> CookieCategory {
        match (existing.precedence(), incoming.precedence()) {
            (Some(a), Some(b)) if b > a => incoming,
            (Some(_), _) => existing,
            (None, Some(_)) => incoming,
            (None, None) => existing,
        }
    }
}

/// Language of the provider's category labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelLanguage {
    English,
    German,
}

fn pattern(expr: &str) -> Regex {
    RegexBuilder::new(expr)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|e| panic!("invalid category pattern {}: {}", expr, e))
}

lazy_static! {
    static ref EN_PATTERNS: Vec<(CookieCategory, Regex)> = vec![
        (
            CookieCategory::Advertising,
            pattern(
                r"(^ads.*|.*\s+ads.*|Ad Selection|advertising|advertise|targeting|personali[sz]ed|personali[sz]ation|sale of personal data|marketing|tracking|tracker|fingerprint|geolocation|personal info)"
            )
        ),
        (
            CookieCategory::Necessary,
            pattern(r"(mandatory|necessary|essential|required)")
        ),
        (
            CookieCategory::Analytics,
            pattern(r"(measurement|analytic|anonym|research|performance|statistic)")
        ),
        (
            CookieCategory::Functional,
            pattern(r"(functional|preference|security|secure|video)")
        ),
        (
            CookieCategory::Uncategorized,
            pattern(r"(uncategori[zs]e|unclassified|unknown)")
        ),
        (CookieCategory::SocialMedia, SOCIAL_MEDIA.clone()),
    ];
    static ref DE_PATTERNS: Vec<(CookieCategory, Regex)> = vec![
        (
            CookieCategory::Advertising,
            pattern(r"(werbung|werbe|marketing|anzeigen|reklame|personalisiert|tracking)")
        ),
        (
            CookieCategory::Necessary,
            pattern(r"(notwendig|nötig|erforderlich)")
        ),
        (
            CookieCategory::Analytics,
            pattern(r"(analyse|analytisch|leistung|statistik|performance)")
        ),
        (
            CookieCategory::Functional,
            pattern(r"(funktional|funktionel|sicherheit|video)")
        ),
        (
            CookieCategory::Uncategorized,
            pattern(r"(unkategorisiert|unklassifiziert|unbekannt)")
        ),
        (CookieCategory::SocialMedia, SOCIAL_MEDIA.clone()),
    ];
    static ref SOCIAL_MEDIA: Regex = pattern(
        r"(social.media|social.network|soziales.netzwerk|soziale.medien|facebook|youtube|twitter|instagram|linkedin|whatsapp|pinterest|\s+xing|\s+reddit|tumblr)"
    );
}

/// Map a provider's free-text category label onto a [`CookieCategory`].
///
/// Absent or blank labels are uncategorized. A label that matches none of the
/// keyword patterns (e.g. "Content Delivery") is unknown.
pub fn categorize_label(label: Option<&str>, language: LabelLanguage) -> CookieCategory {
    let label = match label.map(str::trim) {
        Some(l) if !l.is_empty() => l,
        _ => return CookieCategory::Uncategorized,
    };

    let patterns = match language {
        LabelLanguage::English => &*EN_PATTERNS,
        LabelLanguage::German => &*DE_PATTERNS,
    };

    patterns
        .iter()
        .find(|(_, re)| re.is_match(label))
        .map(|(category, _)| *category)
        .unwrap_or(CookieCategory::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_roundtrip() {
        for c in [
            CookieCategory::Necessary,
            CookieCategory::Functional,
            CookieCategory::Analytics,
            CookieCategory::Advertising,
            CookieCategory::Uncategorized,
            CookieCategory::SocialMedia,
            CookieCategory::Unknown,
        ] {
            assert_eq!(CookieCategory::from_id(c.id()), c);
        }
        assert_eq!(CookieCategory::from_id(42), CookieCategory::Unknown);
    }

    #[test]
    fn test_resolve_prefers_more_invasive() {
        use CookieCategory::*;
        assert_eq!(CookieCategory::resolve(Necessary, Advertising), Advertising);
        assert_eq!(CookieCategory::resolve(Advertising, Necessary), Advertising);
        assert_eq!(CookieCategory::resolve(Functional, Analytics), Analytics);
        assert_eq!(CookieCategory::resolve(Analytics, Analytics), Analytics);
    }

    #[test]
    fn test_resolve_non_comparable() {
        use CookieCategory::*;
        assert_eq!(CookieCategory::resolve(Necessary, Unknown), Necessary);
        assert_eq!(CookieCategory::resolve(Uncategorized, Functional), Functional);
        assert_eq!(CookieCategory::resolve(SocialMedia, Uncategorized), SocialMedia);
        assert_eq!(CookieCategory::resolve(Unknown, SocialMedia), Unknown);
    }

    #[test]
    fn test_categorize_english_labels() {
        let en = LabelLanguage::English;
        assert_eq!(
            categorize_label(Some("Strictly Necessary Cookies"), en),
            CookieCategory::Necessary
        );
        assert_eq!(
            categorize_label(Some("Performance Cookies"), en),
            CookieCategory::Analytics
        );
        assert_eq!(
            categorize_label(Some("Functional Cookies"), en),
            CookieCategory::Functional
        );
        assert_eq!(
            categorize_label(Some("Targeting Cookies"), en),
            CookieCategory::Advertising
        );
        assert_eq!(
            categorize_label(Some("Social Media Cookies"), en),
            CookieCategory::SocialMedia
        );
        assert_eq!(
            categorize_label(Some("Unclassified"), en),
            CookieCategory::Uncategorized
        );
    }

    #[test]
    fn test_advertising_checked_first() {
        // "Personalised" would otherwise never be reached after "necessary"
        assert_eq!(
            categorize_label(Some("Necessary for personalised ads"), LabelLanguage::English),
            CookieCategory::Advertising
        );
    }

    #[test]
    fn test_categorize_german_labels() {
        let de = LabelLanguage::German;
        assert_eq!(
            categorize_label(Some("Unbedingt erforderliche Cookies"), de),
            CookieCategory::Necessary
        );
        assert_eq!(
            categorize_label(Some("Statistik"), de),
            CookieCategory::Analytics
        );
        assert_eq!(
            categorize_label(Some("Werbe-Cookies und Marketing"), de),
            CookieCategory::Advertising
        );
    }

    #[test]
    fn test_unmatched_and_empty_labels() {
        let en = LabelLanguage::English;
        assert_eq!(
            categorize_label(Some("Content Delivery"), en),
            CookieCategory::Unknown
        );
        assert_eq!(categorize_label(Some("   "), en), CookieCategory::Uncategorized);
        assert_eq!(categorize_label(None, en), CookieCategory::Uncategorized);
    }
}
