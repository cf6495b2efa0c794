//! Redaction of sensitive headers and query parameters
//!
//! Header names match exactly, parameter names match by substring, both
//! case-insensitively. Sanitizing twice yields the same result as once.

use crate::config::{DEFAULT_SENSITIVE_HEADERS, DEFAULT_SENSITIVE_PARAMS};
use std::collections::BTreeMap;

/// Replacement for redacted values
pub const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone)]
pub struct Sanitizer {
    headers: Vec<String>,
    params: Vec<String>,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(DEFAULT_SENSITIVE_HEADERS, DEFAULT_SENSITIVE_PARAMS)
    }
}

impl Sanitizer {
    pub fn new<H, P>(headers: &[H], params: &[P]) -> Self
    where
        H: AsRef<str>,
        P: AsRef<str>,
    {
        Self {
            headers: headers.iter().map(|h| h.as_ref().to_ascii_lowercase()).collect(),
            params: params.iter().map(|p| p.as_ref().to_ascii_lowercase()).collect(),
        }
    }

    pub fn is_sensitive_header(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.headers.iter().any(|h| *h == name)
    }

    pub fn is_sensitive_param(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.params.iter().any(|p| name.contains(p.as_str()))
    }

    pub fn sanitize_headers(&self, headers: &mut BTreeMap<String, String>) {
        for (name, value) in headers.iter_mut() {
            if self.is_sensitive_header(name) {
                *value = REDACTED.to_string();
            }
        }
    }

    pub fn sanitize_query(&self, params: &mut BTreeMap<String, String>) {
        for (name, value) in params.iter_mut() {
            if self.is_sensitive_param(name) {
                *value = REDACTED.to_string();
            }
        }
    }
}
