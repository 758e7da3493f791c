//! Rule-based pre-filter that runs before any model call.
//!
//! Classifies a message by type from subject/body keywords and detects bulk
//! mail from its headers. Bulk mail skips the front of the AI queue: it is
//! admitted at the lowest priority so newsletters never starve live work.

use crate::gmail::ParsedMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    NewInquiry,
    Ongoing,
    Variation,
    Quote,
    Payment,
    Completion,
    FollowUp,
    Other,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::NewInquiry => "new_inquiry",
            Category::Ongoing => "ongoing",
            Category::Variation => "variation",
            Category::Quote => "quote",
            Category::Payment => "payment",
            Category::Completion => "completion",
            Category::FollowUp => "follow_up",
            Category::Other => "other",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Categorization {
    pub category: Category,
    pub confidence: f64,
    /// List-Unsubscribe or Precedence: bulk. Newsletters, receipts, noise.
    pub is_bulk: bool,
    pub requires_action: bool,
}

/// Keyword rules, first match wins within a tier. Subject hits score higher
/// than body hits.
const RULES: &[(Category, &[&str])] = &[
    (Category::Variation, &["variation", "change order", "extra works", "additional works"]),
    (Category::Payment, &["invoice", "payment", "deposit", "progress claim", "remittance", "overdue"]),
    (Category::Completion, &["handover", "final inspection", "completion", "certificate of occupancy", "practical completion"]),
    (Category::Quote, &["quote", "quotation", "estimate", "tender", "pricing"]),
    (Category::NewInquiry, &["enquiry", "inquiry", "interested in", "looking for a builder", "would like a quote", "new project"]),
    (Category::FollowUp, &["following up", "follow up", "just checking", "any update", "bump"]),
];

pub fn categorize(message: &ParsedMessage) -> Categorization {
    let is_bulk = message
        .list_unsubscribe
        .as_deref()
        .map(|v| !v.is_empty())
        .unwrap_or(false)
        || message
            .precedence
            .as_deref()
            .map(|v| v.eq_ignore_ascii_case("bulk") || v.eq_ignore_ascii_case("list"))
            .unwrap_or(false);

    let subject = message.subject.to_lowercase();
    let body = message.content().to_lowercase();

    let mut category = Category::Other;
    let mut confidence = 0.3;
    'outer: for (cat, needles) in RULES {
        for needle in *needles {
            if subject.contains(needle) {
                category = *cat;
                confidence = 0.85;
                break 'outer;
            }
            if body.contains(needle) {
                category = *cat;
                confidence = 0.6;
                break 'outer;
            }
        }
    }

    // A reply on an existing thread defaults to ongoing when nothing else hit.
    if category == Category::Other && subject.starts_with("re:") {
        category = Category::Ongoing;
        confidence = 0.5;
    }

    let requires_action = matches!(
        category,
        Category::NewInquiry | Category::Variation | Category::Quote | Category::Payment
    );

    Categorization {
        category,
        confidence,
        is_bulk,
        requires_action,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(subject: &str, body: &str) -> ParsedMessage {
        ParsedMessage {
            subject: subject.into(),
            body_text: Some(body.into()),
            ..ParsedMessage::default()
        }
    }

    #[test]
    fn test_subject_keyword_beats_body() {
        let c = categorize(&message("Quote for 12 Baker St", "invoice attached"));
        assert_eq!(c.category, Category::Quote);
        assert!(c.confidence >= 0.8);
        assert!(c.requires_action);
    }

    #[test]
    fn test_body_keyword_scores_lower() {
        let c = categorize(&message("12 Baker St", "please find our invoice attached"));
        assert_eq!(c.category, Category::Payment);
        assert!((c.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_variation_outranks_quote() {
        // "variation to the quoted works" mentions both; variation is listed first
        let c = categorize(&message("Variation request", "variation to the quoted works"));
        assert_eq!(c.category, Category::Variation);
    }

    #[test]
    fn test_reply_defaults_to_ongoing() {
        let c = categorize(&message("Re: 12 Baker St", "see photos from site today"));
        assert_eq!(c.category, Category::Ongoing);
        assert!(!c.requires_action);
    }

    #[test]
    fn test_bulk_detection_from_headers() {
        let mut msg = message("Weekly Digest", "this week in timber prices");
        msg.list_unsubscribe = Some("<https://news.example/unsub>".into());
        let c = categorize(&msg);
        assert!(c.is_bulk);

        let mut msg = message("Special offers", "");
        msg.precedence = Some("bulk".into());
        assert!(categorize(&msg).is_bulk);
    }

    #[test]
    fn test_plain_mail_is_not_bulk() {
        let c = categorize(&message("Quote for deck", "hi"));
        assert!(!c.is_bulk);
    }
}
