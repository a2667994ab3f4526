use crate::cmp::category::CookieCategory;
use serde::{Deserialize, Serialize};

/// A cookie as reported by the browser's cookie store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    pub host: String,
    pub path: String,
    /// Seconds since the epoch; `None` for session cookies.
    pub expiry: Option<f64>,
    pub http_only: bool,
    pub host_only: bool,
    pub session: bool,
    pub secure: bool,
    pub same_site: Option<String>,
}

impl CookieRecord {
    pub fn new(name: impl Into<String>, value: impl Into<String>, host: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            name: name.into(),
            value: value.into(),
            host_only: !host.starts_with('.'),
            host,
            path: "/".to_string(),
            expiry: None,
            http_only: false,
            session: true,
            secure: false,
            same_site: None,
        }
    }

    /// Identity of a cookie inside one jar.
    pub fn key(&self) -> (String, String, String) {
        (self.name.clone(), self.host.clone(), self.path.clone())
    }
}

/// One cookie entry published by a consent platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    pub name: String,
    pub domain: String,
    pub category: CookieCategory,
    /// The provider's own label, kept verbatim.
    pub category_label: String,
    pub purpose: Option<String>,
    pub expiry: Option<String>,
    pub type_name: Option<String>,
    pub type_id: Option<i64>,
}

impl Declaration {
    pub fn new(
        name: impl Into<String>,
        domain: impl Into<String>,
        category: CookieCategory,
        category_label: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
            category,
            category_label: category_label.into(),
            purpose: None,
            expiry: None,
            type_name: None,
            type_id: None,
        }
    }

    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        let purpose = purpose.into();
        if !purpose.is_empty() {
            self.purpose = Some(purpose);
        }
        self
    }

    pub fn with_expiry(mut self, expiry: impl Into<String>) -> Self {
        let expiry = expiry.into();
        if !expiry.is_empty() {
            self.expiry = Some(expiry);
        }
        self
    }

    pub fn with_type(mut self, type_name: Option<String>, type_id: Option<i64>) -> Self {
        self.type_name = type_name;
        self.type_id = type_id;
        self
    }
}
