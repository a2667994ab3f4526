use crate::model::{CookieEventType, ObservedCookie};
use chrono::Utc;
use consent_crawler_browser::CookieRecord;
use std::collections::BTreeMap;

type CookieKey = (String, String, String);

/// Last known cookie state of one visit.
///
/// Each snapshot is diffed against the previous one; the difference is the
/// event log that gets appended to the store.
#[derive(Debug, Default)]
pub struct CookieJar {
    known: BTreeMap<CookieKey, CookieRecord>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Replace the known state with `snapshot` and return what changed.
    pub fn diff(&mut self, snapshot: Vec<CookieRecord>) -> Vec<ObservedCookie> {
        let now = Utc::now();
        let mut current = BTreeMap::new();
        for cookie in snapshot {
            current.insert(cookie.key(), cookie);
        }

        let mut events = Vec::new();
        for (key, cookie) in &current {
            if self.known.get(key) != Some(cookie) {
                events.push(ObservedCookie {
                    record_type: CookieEventType::AddedOrChanged,
                    cookie: cookie.clone(),
                    observed_at: now,
                });
            }
        }

        for (key, cookie) in &self.known {
            if !current.contains_key(key) {
                events.push(ObservedCookie {
                    record_type: CookieEventType::Deleted,
                    cookie: cookie.clone(),
                    observed_at: now,
                });
            }
        }

        self.known = current;
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(name: &str, value: &str) -> CookieRecord {
        CookieRecord::new(name, value, ".example.com")
    }

    #[test]
    fn test_first_snapshot_adds_everything() {
        let mut jar = CookieJar::new();
        let events = jar.diff(vec![cookie("a", "1"), cookie("b", "2")]);
        assert_eq!(events.len(), 2);
        assert!(
            events
                .iter()
                .all(|e| e.record_type == CookieEventType::AddedOrChanged)
        );
        assert_eq!(jar.len(), 2);
    }

    #[test]
    fn test_unchanged_cookies_emit_nothing() {
        let mut jar = CookieJar::new();
        jar.diff(vec![cookie("a", "1")]);
        assert!(jar.diff(vec![cookie("a", "1")]).is_empty());
    }

    #[test]
    fn test_changes_and_deletions() {
        let mut jar = CookieJar::new();
        jar.diff(vec![cookie("a", "1"), cookie("b", "2")]);

        let events = jar.diff(vec![cookie("a", "changed"), cookie("c", "3")]);
        let summary: Vec<(&str, CookieEventType)> = events
            .iter()
            .map(|e| (e.cookie.name.as_str(), e.record_type))
            .collect();

        assert_eq!(
            summary,
            vec![
                ("a", CookieEventType::AddedOrChanged),
                ("c", CookieEventType::AddedOrChanged),
                ("b", CookieEventType::Deleted),
            ]
        );
        // Deleted cookies keep their last known attributes
        assert_eq!(events[2].cookie.value, "2");
    }

    #[test]
    fn test_same_name_on_different_hosts() {
        let mut jar = CookieJar::new();
        let events = jar.diff(vec![
            CookieRecord::new("id", "1", ".example.com"),
            CookieRecord::new("id", "2", "tracker.net"),
        ]);
        assert_eq!(events.len(), 2);
    }
}
