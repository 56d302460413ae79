//! Selector candidates and ordered-candidate resolution.
//!
//! A candidate is plain CSS, optionally followed by a text filter in the
//! form `:has-text("Find")` or `:contains("Find")`. The text filter is not
//! CSS, so it is split off and applied as a case-insensitive containment
//! check on the element's collapsed text.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use std::sync::OnceLock;

fn text_filter_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^(.*?):(?:has-text|contains)\(\s*["']?(.*?)["']?\s*\)\s*$"#)
            .expect("text filter regex is valid")
    })
}

/// A parsed selector candidate.
#[derive(Debug, Clone)]
pub struct Candidate {
    raw: String,
    css: String,
    selector: Selector,
    text: Option<String>,
}

impl Candidate {
    /// Parse a candidate string; `None` when the CSS part is invalid.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        let (css, text) = match text_filter_regex().captures(raw) {
            Some(caps) => {
                let css = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
                let needle = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
                let css = if css.is_empty() { "*" } else { css };
                let text = (!needle.is_empty()).then(|| needle.to_lowercase());
                (css.to_string(), text)
            }
            None => (raw.to_string(), None),
        };

        let parsed = Selector::parse(&css).map_err(|e| format!("{e:?}"));
        match parsed {
            Ok(selector) => Some(Self {
                raw: raw.to_string(),
                css,
                selector,
                text,
            }),
            Err(e) => {
                tracing::debug!("skipping unparsable selector candidate {raw:?}: {e}");
                None
            }
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The CSS part, usable with `document.querySelectorAll`.
    pub fn css(&self) -> &str {
        &self.css
    }

    /// Lowercased text filter, if any.
    pub fn text_filter(&self) -> Option<&str> {
        self.text.as_deref()
    }

    fn accepts(&self, el: &ElementRef<'_>) -> bool {
        match &self.text {
            Some(needle) => element_text(el).to_lowercase().contains(needle.as_str()),
            None => true,
        }
    }

    /// All matches in a document, in document order.
    pub fn select_document<'a>(&self, doc: &'a Html) -> Vec<ElementRef<'a>> {
        doc.select(&self.selector)
            .filter(|el| self.accepts(el))
            .collect()
    }

    /// All matches among the descendants of `root`.
    pub fn select_within<'a>(&self, root: ElementRef<'a>) -> Vec<ElementRef<'a>> {
        root.select(&self.selector)
            .filter(|el| self.accepts(el))
            .collect()
    }
}

/// Collapsed visible text of an element.
pub fn element_text(el: &ElementRef<'_>) -> String {
    el.text()
        .flat_map(|chunk| chunk.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

/// The first candidate that matched, with its matches.
#[derive(Debug)]
pub struct Resolution<'a> {
    /// Position of the winning candidate in the input list.
    pub index: usize,
    pub candidate: Candidate,
    pub elements: Vec<ElementRef<'a>>,
}

/// Owned summary of a resolution, safe to carry across `.await` points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub raw: String,
    pub css: String,
    pub text: Option<String>,
    pub count: usize,
}

impl From<&Resolution<'_>> for Target {
    fn from(r: &Resolution<'_>) -> Self {
        Self {
            raw: r.candidate.raw().to_string(),
            css: r.candidate.css().to_string(),
            text: r.candidate.text_filter().map(str::to_string),
            count: r.elements.len(),
        }
    }
}

/// Try `candidates` in order against a document; first one with at least
/// one match wins. `None` means no match, which is not an error.
pub fn resolve<'a>(doc: &'a Html, candidates: &[String]) -> Option<Resolution<'a>> {
    candidates.iter().enumerate().find_map(|(index, raw)| {
        let candidate = Candidate::parse(raw)?;
        let elements = candidate.select_document(doc);
        if elements.is_empty() {
            None
        } else {
            Some(Resolution {
                index,
                candidate,
                elements,
            })
        }
    })
}

/// Like [`resolve`], scoped to the descendants of `root`.
pub fn resolve_within<'a>(root: ElementRef<'a>, candidates: &[String]) -> Option<Resolution<'a>> {
    candidates.iter().enumerate().find_map(|(index, raw)| {
        let candidate = Candidate::parse(raw)?;
        let elements = candidate.select_within(root);
        if elements.is_empty() {
            None
        } else {
            Some(Resolution {
                index,
                candidate,
                elements,
            })
        }
    })
}

/// Parse `html` and resolve `candidates`, returning an owned [`Target`].
pub fn resolve_target(html: &str, candidates: &[String]) -> Option<Target> {
    if candidates.is_empty() {
        return None;
    }
    let doc = Html::parse_document(html);
    resolve(&doc, candidates).as_ref().map(Target::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
    <html><body>
        <form><input id="zip" name="zip"/><button type="submit">Search</button></form>
        <ul>
            <li class="dealer-item">A</li>
            <li class="dealer-item">B</li>
        </ul>
        <button class="cta">Find a Dealer</button>
    </body></html>
    "#;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_first_matching_candidate_wins() {
        let doc = Html::parse_document(PAGE);
        let res = resolve(&doc, &list(&["#missing", "li.dealer-item", "li"])).unwrap();
        assert_eq!(res.index, 1);
        assert_eq!(res.elements.len(), 2);
    }

    #[test]
    fn test_no_match_is_none_not_error() {
        let doc = Html::parse_document(PAGE);
        assert!(resolve(&doc, &list(&["#nope", ".also-nope"])).is_none());
        assert!(resolve(&doc, &[]).is_none());
    }

    #[test]
    fn test_invalid_candidates_are_skipped() {
        let doc = Html::parse_document(PAGE);
        let res = resolve(&doc, &list(&["[[[", "", "#zip"])).unwrap();
        assert_eq!(res.index, 2);
    }

    #[test]
    fn test_text_filter_candidates() {
        let doc = Html::parse_document(PAGE);
        let res = resolve(&doc, &list(&["button:has-text(\"find a dealer\")"])).unwrap();
        assert_eq!(res.elements.len(), 1);
        assert_eq!(res.candidate.css(), "button");
        assert_eq!(res.candidate.text_filter(), Some("find a dealer"));

        assert!(resolve(&doc, &list(&["button:contains('Locate')"])).is_none());

        let bare = Candidate::parse(":has-text(\"Search\")").unwrap();
        assert_eq!(bare.css(), "*");
    }

    #[test]
    fn test_resolve_target_is_owned() {
        let target = resolve_target(PAGE, &list(&["#zip"])).unwrap();
        assert_eq!(target.css, "#zip");
        assert_eq!(target.count, 1);
        assert!(resolve_target(PAGE, &[]).is_none());
    }
}
