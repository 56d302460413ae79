//! Value clean-up and identity-key normalization.

use regex::Regex;
use std::sync::OnceLock;

/// Collapse runs of whitespace into single spaces and trim.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip list enumeration such as `"1. "` or `"12) "` from a name.
pub fn clean_name(name: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^\s*\d{1,3}\s*[.)]\s+").expect("enumeration regex is valid"));
    collapse_whitespace(&re.replace(name, ""))
}

/// Drop `tel:` / `mailto:` / `sms:` prefixes from attribute values.
pub fn strip_uri_scheme(value: &str) -> &str {
    let trimmed = value.trim();
    for scheme in ["tel:", "mailto:", "sms:"] {
        if trimmed
            .get(..scheme.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
        {
            return trimmed[scheme.len()..].trim();
        }
    }
    trimmed
}

/// Digits of a phone number, dropping a leading US country code.
pub fn phone_digits(phone: &str) -> String {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.len() == 11 && digits.starts_with('1') {
        digits[1..].to_string()
    } else {
        digits
    }
}

/// Format a 10-digit number as `(XXX) XXX-XXXX`; other inputs pass through.
pub fn format_phone(phone: &str) -> String {
    let digits = phone_digits(phone);
    if digits.len() == 10 {
        format!("({}) {}-{}", &digits[..3], &digits[3..6], &digits[6..])
    } else {
        collapse_whitespace(phone)
    }
}

/// Lowercase, keep alphanumerics, single-space everything else.
///
/// `"ACME Motors, Inc."` and `"acme  motors inc"` normalize identically.
pub fn key_part(s: &str) -> String {
    let mapped: String = s
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();
    collapse_whitespace(&mapped)
}

/// Lowercased host + path of a website, without scheme or trailing slash.
pub fn website_key(url: &str) -> String {
    let lower = url.trim().to_ascii_lowercase();
    let without_scheme = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);
    let without_www = without_scheme.strip_prefix("www.").unwrap_or(without_scheme);
    without_www.trim_end_matches('/').to_string()
}
