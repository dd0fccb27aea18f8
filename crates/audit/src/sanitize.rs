//! Privacy masking applied to every entry before it is buffered or stored.

use serde_json::Value;

const MAX_STRING_LEN: usize = 100;

/// Irreversibly mask the local part of an email address.
///
/// `user@example.com` becomes `****@example.com`; the domain is kept so
/// delivery problems can still be grouped by provider.
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => format!("{}@{}", "*".repeat(local.len().max(1)), domain),
        None => email.to_string(),
    }
}

/// Reduce a URL to scheme + host + path; query strings and fragments carry
/// tokens and user data and are never stored.
pub fn sanitize_url(url: &str) -> String {
    if !url.contains("://") {
        return "invalid-url".to_string();
    }
    let without_fragment = url.split('#').next().unwrap_or(url);
    without_fragment.split('?').next().unwrap_or(url).to_string()
}

/// Recursively sanitize a JSON value: emails masked, long strings truncated.
pub fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_string(s)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn sanitize_string(s: &str) -> String {
    if looks_like_email(s) {
        return mask_email(s);
    }
    if s.len() > MAX_STRING_LEN {
        let cut = truncation_point(s);
        return format!("{}...", &s[..cut]);
    }
    s.to_string()
}

fn looks_like_email(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !s.contains(char::is_whitespace)
        }
        None => false,
    }
}

// Back off to a char boundary so truncation never splits a code point.
fn truncation_point(s: &str) -> usize {
    let mut cut = MAX_STRING_LEN;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}
