//! Excerpt extraction strategies.

use scraper::{ElementRef, Html, Selector};

use crate::AdapterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    GeographicEntity,
    NoBoldLead,
    ColonTerminatedLead,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Accepted(String),
    Rejected(RejectReason),
}

impl Extraction {
    pub fn accepted(self) -> Option<String> {
        match self {
            Extraction::Accepted(excerpt) => Some(excerpt),
            Extraction::Rejected(_) => None,
        }
    }
}

/// Picks a short descriptive fragment out of rendered article markup.
pub trait ExcerptExtractor: Send + Sync {
    fn extract(&self, html: &str) -> Extraction;
}

/// Wikipedia lead-sentence heuristic.
///
/// Takes the first top-level paragraph containing a `<b>` element. Rejects articles
/// carrying geographic coordinates and leads ending in a colon (lists, disambiguation).
/// The paragraph's inner markup is returned untouched.
#[derive(Debug, Clone)]
pub struct LeadParagraphExtractor {
    geo: Selector,
    paragraph: Selector,
    bold: Selector,
}

impl LeadParagraphExtractor {
    pub fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            geo: parse_selector(".geo, .geo-dms, .geo-dec, #coordinates")?,
            paragraph: parse_selector("p")?,
            bold: parse_selector("b")?,
        })
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

/// Paragraphs directly under the fragment root or the parser output wrapper.
fn is_top_level(paragraph: &ElementRef<'_>) -> bool {
    match paragraph.parent().and_then(ElementRef::wrap) {
        None => true,
        Some(parent) => {
            let el = parent.value();
            el.name() == "html"
                || (el.name() == "div" && el.classes().any(|c| c == "mw-parser-output"))
        }
    }
}

impl ExcerptExtractor for LeadParagraphExtractor {
    fn extract(&self, html: &str) -> Extraction {
        let document = Html::parse_fragment(html);

        if document.select(&self.geo).next().is_some() {
            return Extraction::Rejected(RejectReason::GeographicEntity);
        }

        let lead = document
            .select(&self.paragraph)
            .filter(is_top_level)
            .find(|p| p.select(&self.bold).next().is_some());

        let Some(lead) = lead else {
            return Extraction::Rejected(RejectReason::NoBoldLead);
        };

        if lead.text().collect::<String>().trim().ends_with(':') {
            return Extraction::Rejected(RejectReason::ColonTerminatedLead);
        }

        Extraction::Accepted(lead.inner_html())
    }
}
