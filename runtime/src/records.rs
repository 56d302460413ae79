//! Harvested records and per-site deduplication.

use crate::extraction::normalize::{key_part, phone_digits, website_key};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Confidence marking attached to a record at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFlag {
    /// The site passed post-execution validation.
    Validated,
    /// Validation for the site had not completed yet.
    Unvalidated,
    /// The site failed validation; selectors may be wrong.
    Degraded,
}

impl RecordFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validated => "validated",
            Self::Unvalidated => "unvalidated",
            Self::Degraded => "degraded",
        }
    }
}

/// One harvested entity. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    source_site: String,
    source_url: String,
    query_key_used: String,
    capture_timestamp: DateTime<Utc>,
    card_index: usize,
    flag: RecordFlag,
    fields: BTreeMap<String, String>,
}

impl ResultRecord {
    pub fn new(
        source_site: impl Into<String>,
        source_url: impl Into<String>,
        query_key_used: impl Into<String>,
        card_index: usize,
        flag: RecordFlag,
        fields: BTreeMap<String, String>,
    ) -> Self {
        Self {
            source_site: source_site.into(),
            source_url: source_url.into(),
            query_key_used: query_key_used.into(),
            capture_timestamp: Utc::now(),
            card_index,
            flag,
            fields,
        }
    }

    pub fn source_site(&self) -> &str {
        &self.source_site
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn query_key_used(&self) -> &str {
        &self.query_key_used
    }

    pub fn capture_timestamp(&self) -> DateTime<Utc> {
        self.capture_timestamp
    }

    pub fn card_index(&self) -> usize {
        self.card_index
    }

    pub fn flag(&self) -> RecordFlag {
        self.flag
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Field value, empty when the field is absent.
    pub fn field(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or("")
    }

    /// True when every field value is empty.
    pub fn is_empty(&self) -> bool {
        self.fields.values().all(|v| v.trim().is_empty())
    }

    /// Identity key used for deduplication.
    ///
    /// Normalized name + address when either is present, then phone
    /// digits, then website, then all remaining field values. Records with
    /// no values at all key on their capture coordinates so they survive.
    pub fn identity_key(&self) -> String {
        let name = key_part(self.field("name"));
        let address = key_part(self.field("address"));
        if !name.is_empty() || !address.is_empty() {
            return format!("{name}|{address}");
        }

        let phone = phone_digits(self.field("phone"));
        if !phone.is_empty() {
            return format!("phone:{phone}");
        }

        let website = website_key(self.field("website"));
        if !website.is_empty() {
            return format!("web:{website}");
        }

        if !self.is_empty() {
            let joined = self
                .fields
                .iter()
                .map(|(k, v)| format!("{k}={}", key_part(v)))
                .collect::<Vec<_>>()
                .join(";");
            return format!("fields:{joined}");
        }

        format!(
            "empty:{}:{}:{}:{}",
            self.source_url,
            self.query_key_used,
            self.card_index,
            self.capture_timestamp.timestamp_nanos_opt().unwrap_or_default()
        )
    }
}

/// Keep the first record for each identity key, preserving input order.
///
/// Idempotent: `dedup(&dedup(x)) == dedup(x)`.
pub fn dedup(records: &[ResultRecord]) -> Vec<ResultRecord> {
    let mut seen = HashSet::with_capacity(records.len());
    records
        .iter()
        .filter(|r| seen.insert(r.identity_key()))
        .cloned()
        .collect()
}

/// Union of field names across records, sorted, for tabular output.
pub fn field_columns(records: &[ResultRecord]) -> Vec<String> {
    let mut names: Vec<String> = records
        .iter()
        .flat_map(|r| r.fields.keys().cloned())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    // Conventional columns first.
    let preferred = ["name", "address", "phone", "website"];
    names.sort_by_key(|n| {
        preferred
            .iter()
            .position(|p| p == n)
            .unwrap_or(preferred.len())
    });
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(query: &str, pairs: &[(&str, &str)]) -> ResultRecord {
        ResultRecord::new(
            "example.com",
            "https://example.com/dealers",
            query,
            0,
            RecordFlag::Validated,
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_same_name_address_different_query_keeps_one() {
        let a = record("10001", &[("name", "Acme Motors"), ("address", "1 Main St, NY")]);
        let b = record("10002", &[("name", "ACME motors"), ("address", "1 Main St., NY")]);
        let out = dedup(&[a.clone(), b]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].query_key_used(), "10001");
    }

    #[test]
    fn test_dedup_is_idempotent() {
        let records = vec![
            record("1", &[("name", "A"), ("address", "x")]),
            record("2", &[("name", "a"), ("address", "X")]),
            record("3", &[("name", "B"), ("address", "y")]),
            record("4", &[("phone", "tel:212-555-0100")]),
            record("5", &[("phone", "(212) 555-0100")]),
            record("6", &[("name", ""), ("address", "")]),
        ];
        let once = dedup(&records);
        let twice = dedup(&once);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 4);
    }

    #[test]
    fn test_empty_records_are_kept() {
        let a = ResultRecord::new("s", "u", "q", 0, RecordFlag::Degraded, BTreeMap::new());
        let b = ResultRecord::new("s", "u", "q", 1, RecordFlag::Degraded, BTreeMap::new());
        assert_eq!(dedup(&[a, b]).len(), 2);
    }

    #[test]
    fn test_field_columns_order() {
        let records = vec![
            record("1", &[("zeta", "z"), ("phone", "1"), ("name", "n")]),
            record("2", &[("address", "a"), ("alpha", "b")]),
        ];
        assert_eq!(
            field_columns(&records),
            ["name", "address", "phone", "alpha", "zeta"]
        );
    }
}
