//! Model-free fallback for locating result cards.

use crate::extraction::candidate::element_text;
use scraper::{Html, Selector};

/// Patterns tried when the model cannot propose a card selector.
pub const CARD_PATTERNS: &[&str] = &[
    "[class*='dealer' i]",
    "[class*='location' i]",
    "[class*='store' i]",
    "[class*='result' i]",
    "[class*='card' i]",
    "[class*='listing' i]",
    "li[class*='item' i]",
    "div[class*='item' i]",
];

/// Characters of text an element needs, at least, to count as a card.
const MIN_CARD_TEXT: usize = 50;

/// Minimum substantial elements for a pattern to qualify.
const MIN_CARDS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicCards {
    pub selector: String,
    pub count: usize,
    pub confidence: f32,
}

/// The pattern with the most text-bearing matches, if any qualifies.
pub fn detect_cards(html: &str) -> Option<HeuristicCards> {
    let doc = Html::parse_document(html);
    let mut best: Option<HeuristicCards> = None;

    for pattern in CARD_PATTERNS {
        let Ok(selector) = Selector::parse(pattern) else {
            continue;
        };
        let substantial = doc
            .select(&selector)
            .filter(|el| element_text(el).chars().count() >= MIN_CARD_TEXT)
            .count();
        if substantial < MIN_CARDS {
            continue;
        }
        if best.as_ref().is_none_or(|b| substantial > b.count) {
            best = Some(HeuristicCards {
                selector: pattern.to_string(),
                count: substantial,
                confidence: (substantial as f32 / 5.0 + 0.4).min(0.9),
            });
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(name: &str) -> String {
        format!(
            "<div class=\"store-tile\"><h4>{name}</h4><p>1200 Commerce Parkway, Springfield, IL 62701</p></div>"
        )
    }

    #[test]
    fn test_detects_repeating_text_blocks() {
        let html = format!(
            "<body><nav class=\"store-nav\">Stores</nav>{}{}{}</body>",
            card("North Farm Supply"),
            card("South Farm Supply"),
            card("East Farm Supply")
        );
        let found = detect_cards(&html).unwrap();
        assert_eq!(found.selector, "[class*='store' i]");
        assert_eq!(found.count, 3);
        assert!(found.confidence > 0.9 - 0.01);
    }

    #[test]
    fn test_text_length_boundary() {
        let block = |len: usize| format!("<div class=\"result-row\">{}</div>", "x".repeat(len));
        let exact = block(MIN_CARD_TEXT).repeat(3);
        let found = detect_cards(&exact).unwrap();
        assert_eq!(found.selector, "[class*='result' i]");
        assert_eq!(found.count, 3);

        let short = block(MIN_CARD_TEXT - 1).repeat(3);
        assert_eq!(detect_cards(&short), None);
    }

    #[test]
    fn test_too_few_or_too_short() {
        let html = format!("<body>{}{}</body>", card("A"), card("B"));
        assert_eq!(detect_cards(&html), None);
        let short = "<div class='result'>x</div>".repeat(5);
        assert_eq!(detect_cards(&short), None);
    }
}
