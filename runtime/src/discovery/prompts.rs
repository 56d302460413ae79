//! Prompt builders for the discovery states.
//!
//! Every prompt states the exact JSON shape expected back; the parsers in
//! [`super::response`] are lenient about everything else.

use super::locator::ScoredLink;
use scraper::{ElementRef, Html, Node};

/// Attributes kept when compacting HTML for a prompt.
const KEPT_ATTRIBUTES: &[&str] = &[
    "id",
    "class",
    "href",
    "type",
    "name",
    "placeholder",
    "aria-label",
    "role",
    "data-testid",
];

/// Elements dropped entirely when compacting HTML.
const DROPPED_ELEMENTS: &[&str] = &[
    "script", "style", "noscript", "template", "svg", "iframe", "link", "meta", "head",
];

pub fn locator_prompt(homepage: &str, links: &[ScoredLink]) -> String {
    let mut listing = String::new();
    for (i, link) in links.iter().enumerate() {
        listing.push_str(&format!(
            "{}. {} (text: \"{}\", score {})\n",
            i + 1,
            link.url,
            link.text,
            link.score
        ));
    }
    format!(
        "You are looking at the homepage {homepage}.\n\
         Pick the page where a visitor searches for dealers, stores or locations by \
         postal code. Candidate internal links:\n{listing}\n\
         If the homepage itself already has the location search, answer with the \
         homepage URL and set already_on_locator to true.\n\
         Respond with JSON only:\n\
         {{\"locator_url\": \"<url>\", \"already_on_locator\": false, \"confidence\": 0.0, \"reason\": \"...\"}}"
    )
}

pub fn form_prompt(url: &str) -> String {
    format!(
        "This is the location-search page {url}.\n\
         Identify CSS selectors for the search form and the results list. Each \
         value may be a list of candidates, most specific first. A candidate may \
         end with :has-text(\"label\") to match by visible text.\n\
         Respond with JSON only:\n\
         {{\n\
           \"selectors\": {{\n\
             \"search_input\": [\"...\"],\n\
             \"submit_button\": [\"...\"],\n\
             \"pagination_control\": [\"...\"],\n\
             \"result_card\": [\"...\"],\n\
             \"entry_button\": [],\n\
             \"popup_dismiss\": []\n\
           }},\n\
           \"pagination_mode\": \"click_more | virtual_scroll | plain_scroll | none\",\n\
           \"submit_strategy\": \"click | enter | click_then_enter\",\n\
           \"direct_url_template\": null,\n\
           \"confidence\": 0.0,\n\
           \"notes\": \"...\"\n\
         }}"
    )
}

/// Prompt for data-field discovery over a rendered results page.
///
/// `failed` lists card candidates already known not to match; the model is
/// told to avoid them.
pub fn results_prompt(url: &str, fields: &[String], failed: &[String]) -> String {
    let field_list = fields.join(", ");
    let avoid = if failed.is_empty() {
        String::new()
    } else {
        format!(
            "These result card selectors matched nothing and must not be proposed again: {}\n",
            failed.join(", ")
        )
    };
    format!(
        "This is the results page {url} after a location search.\n\
         Identify the repeating element that wraps one result, and selectors \
         relative to that element for these fields: {field_list}.\n\
         {avoid}\
         Use \"type\": \"href\" for values read from a link target.\n\
         Respond with JSON only:\n\
         {{\n\
           \"result_card\": [\"...\"],\n\
           \"data_fields\": {{\n\
             \"name\": {{\"selector\": \"...\", \"type\": \"text\"}},\n\
             \"phone\": {{\"selector\": \"a[href^='tel:']\", \"type\": \"href\"}}\n\
           }},\n\
           \"confidence\": 0.0\n\
         }}"
    )
}

pub fn page_state_prompt(url: &str) -> String {
    format!(
        "Page: {url}\n\
         Is a postal-code or location search input visible right now? If not, is \
         there a button or link that must be clicked first to reveal it?\n\
         Respond with JSON only:\n\
         {{\"has_search_input\": true, \"needs_entry_button\": false, \
         \"entry_selector\": null, \"entry_text\": null}}"
    )
}

/// Structural HTML reduced to tags and a few identifying attributes.
///
/// Scripts, styles and inline SVG are dropped; text is collapsed. Output is
/// cut at `max_chars`.
pub fn compact_html(html: &str, max_chars: usize) -> String {
    let doc = Html::parse_document(html);
    let mut out = String::new();
    write_element(doc.root_element(), &mut out, max_chars);
    if out.len() > max_chars {
        let mut cut = max_chars;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
    }
    out
}

fn write_element(el: ElementRef<'_>, out: &mut String, max_chars: usize) {
    if out.len() >= max_chars {
        return;
    }
    let name = el.value().name();
    if DROPPED_ELEMENTS.contains(&name) {
        return;
    }

    out.push('<');
    out.push_str(name);
    for attr in KEPT_ATTRIBUTES {
        if let Some(value) = el.value().attr(attr) {
            let value = value.split_whitespace().collect::<Vec<_>>().join(" ");
            if !value.is_empty() {
                out.push_str(&format!(" {attr}=\"{}\"", value.replace('"', "'")));
            }
        }
    }
    out.push('>');

    for child in el.children() {
        match child.value() {
            Node::Text(text) => {
                let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
                if !collapsed.is_empty() {
                    out.push_str(&collapsed);
                }
            }
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    write_element(child_el, out, max_chars);
                }
            }
            _ => {}
        }
    }

    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_html_keeps_structure() {
        let html = r#"<html><head><style>.x{color:red}</style></head><body>
            <div class="dealer  card" style="color:red" onclick="x()">
                <h3>Acme   Motors</h3><script>track()</script>
                <a href="tel:555" data-x="1">Call</a>
            </div></body></html>"#;
        let compact = compact_html(html, 10_000);
        assert!(compact.contains("<div class=\"dealer card\"><h3>Acme Motors</h3>"));
        assert!(compact.contains("<a href=\"tel:555\">Call</a>"));
        assert!(!compact.contains("style"));
        assert!(!compact.contains("track()"));
        assert!(!compact.contains("onclick"));
    }

    #[test]
    fn test_compact_html_truncates() {
        let html = format!("<body>{}</body>", "<p>hello</p>".repeat(100));
        assert!(compact_html(&html, 50).len() <= 50);
    }

    #[test]
    fn test_results_prompt_lists_failed_candidates() {
        let prompt = results_prompt(
            "https://acme.com/dealers",
            &["name".into(), "phone".into()],
            &[".dealer-card".into()],
        );
        assert!(prompt.contains("name, phone"));
        assert!(prompt.contains("must not be proposed again: .dealer-card"));
        assert!(!results_prompt("u", &[], &[]).contains("must not"));
    }

    #[test]
    fn test_locator_prompt_lists_links() {
        let links = vec![ScoredLink {
            url: "https://acme.com/dealers".into(),
            text: "Dealers".into(),
            score: 14,
        }];
        let prompt = locator_prompt("https://acme.com/", &links);
        assert!(prompt.contains("1. https://acme.com/dealers (text: \"Dealers\", score 14)"));
    }
}
