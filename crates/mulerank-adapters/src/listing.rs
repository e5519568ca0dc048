//! MuleRun listing markup -> ordered `RawRecord`s.

use std::sync::OnceLock;

use mulerank_core::RawRecord;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::ExtractionError;

pub const CARD_SELECTOR: &str = r#"a[href^="/@"]"#;
const NAME_SELECTOR: &str = "h3";
const DESCRIPTION_SELECTOR: &str = ".line-clamp-2";
const AVATAR_SELECTOR: &str = r#"img[data-slot="avatar-image"]"#;
const PRICE_SELECTOR: &str = "span.font-jetbrains-mono";

struct CardSelectors {
    card: Selector,
    name: Selector,
    description: Selector,
    avatar: Selector,
    price: Selector,
}

impl CardSelectors {
    fn new() -> Result<Self, ExtractionError> {
        Ok(Self {
            card: selector(CARD_SELECTOR)?,
            name: selector(NAME_SELECTOR)?,
            description: selector(DESCRIPTION_SELECTOR)?,
            avatar: selector(AVATAR_SELECTOR)?,
            price: selector(PRICE_SELECTOR)?,
        })
    }
}

fn selector(css: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(css).map_err(|e| ExtractionError::Parse(format!("selector {css}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(card: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    card.select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn price_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\d+\s*/.*?run").expect("valid price pattern"))
}

/// Cuts a price label down to its `"<n> / ... run"` part, e.g.
/// `"50/ run (approx.)"` -> `"50/ run"`. Labels without that shape are
/// returned unchanged.
pub fn normalize_price(text: &str) -> String {
    price_pattern()
        .find(text)
        .map_or(text, |m| m.as_str())
        .to_string()
}

fn author_of(card: &ElementRef<'_>) -> Option<String> {
    card.text()
        .map(str::trim)
        .find_map(|t| t.strip_prefix("by ").map(str::trim))
        .and_then(|a| text_or_none(a.to_string()))
}

fn record_from_card(card: &ElementRef<'_>, selectors: &CardSelectors) -> Option<RawRecord> {
    let link = card.value().attr("href").and_then(|h| text_or_none(h.to_string()))?;
    let name = first_text(card, &selectors.name).unwrap_or_default();
    let avatar_url = card
        .select(&selectors.avatar)
        .next()
        .and_then(|n| n.value().attr("src"))
        .and_then(|s| text_or_none(s.to_string()));
    let price = first_text(card, &selectors.price).map(|p| normalize_price(&p));

    Some(RawRecord {
        link,
        name,
        description: first_text(card, &selectors.description),
        avatar_url,
        price,
        author: author_of(card),
    })
}

/// Every agent card in document order. Position in the returned vector is
/// the rank on the page.
pub fn parse_listing_html(html: &str) -> Result<Vec<RawRecord>, ExtractionError> {
    let selectors = CardSelectors::new()?;
    let document = Html::parse_document(html);
    Ok(document
        .select(&selectors.card)
        .filter_map(|card| record_from_card(&card, &selectors))
        .collect())
}
