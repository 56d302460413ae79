//! Site-list and query-key input parsing.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use url::Url;

/// Query key used when none is supplied.
pub const DEFAULT_QUERY: &str = "10001";

/// Parse a site list: one URL per line; blank lines, `#` comment lines and
/// trailing ` #` comments ignored; non-http(s) entries skipped with a
/// warning; duplicates removed, first occurrence kept.
pub fn parse_site_list(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut sites = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = match line.find(" #") {
            Some(i) => &line[..i],
            None => line,
        };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match Url::parse(line) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => {
                if seen.insert(url.to_string()) {
                    sites.push(line.to_string());
                }
            }
            _ => tracing::warn!("line {}: skipping non-http(s) site entry {line:?}", lineno + 1),
        }
    }
    sites
}

pub fn load_site_list(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read site list: {}", path.display()))?;
    Ok(parse_site_list(&text))
}

/// Merge query keys from a comma-separated flag and a one-per-line file.
///
/// Keys are trimmed and deduplicated preserving order; `#` lines in the
/// file are skipped. Falls back to [`DEFAULT_QUERY`] when nothing remains.
pub fn merge_queries(inline: Option<&str>, file_text: Option<&str>) -> Vec<String> {
    let from_flag = inline.into_iter().flat_map(|s| s.split(','));
    let from_file = file_text
        .into_iter()
        .flat_map(str::lines)
        .filter(|l| !l.trim_start().starts_with('#'));

    let mut seen = HashSet::new();
    let mut keys: Vec<String> = from_flag
        .chain(from_file)
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .filter(|k| seen.insert(k.to_string()))
        .map(String::from)
        .collect();
    if keys.is_empty() {
        keys.push(DEFAULT_QUERY.to_string());
    }
    keys
}

pub fn load_queries(inline: Option<&str>, file: Option<&Path>) -> Result<Vec<String>> {
    let file_text = match file {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read query file: {}", path.display()))?,
        ),
        None => None,
    };
    Ok(merge_queries(inline, file_text.as_deref()))
}
