//! Deterministic rule-based extractor.
//!
//! No network, no key. Serves tests and acts as the degraded fallback when
//! no hosted model is configured. The rules mirror what the prompts ask a
//! model for: job-number patterns, street addresses, a subject-derived
//! project name, and the sender as client contact.

use async_trait::async_trait;
use regex::Regex;

use super::{
    ClientInfo, EntityExtractor, ExtractedAddress, ExtractedEntities, ExtractionInput, JobNumber,
    MatchingIndicators, NameCandidate, SimilarityVerdict,
};
use crate::error::CoreResult;
use crate::normalize::{job_numbers_match, normalize_name, normalize_street};

pub struct StubExtractor {
    job_re: Regex,
    bare_ref_re: Regex,
    street_re: Regex,
    postcode_re: Regex,
    region_postcode_re: Regex,
    reply_prefix_re: Regex,
    subject_for_re: Regex,
}

impl StubExtractor {
    pub fn new() -> Self {
        StubExtractor {
            job_re: Regex::new(
                r"(?i)\b(?:job|quote|ref(?:erence)?|invoice|po)\s*(?:#|no\.?|number)?[\s:\-]*([A-Za-z0-9][A-Za-z0-9\-]{1,14}[0-9])",
            )
            .expect("job regex"),
            bare_ref_re: Regex::new(r"#([0-9][0-9\-]{1,12}[0-9])").expect("bare ref regex"),
            street_re: Regex::new(
                r"\b(\d+[A-Za-z]?(?:\s+[A-Z][A-Za-z']+){1,3}\s+(?:St|Street|Rd|Road|Ave|Avenue|Dr|Drive|Ct|Court|Pl|Place|Ln|Lane|Cres|Crescent|Hwy|Highway|Pde|Parade|Blvd|Boulevard))\b",
            )
            .expect("street regex"),
            postcode_re: Regex::new(r"(?i)\bpostcode\s*:?\s*([0-9]{4})\b").expect("postcode regex"),
            region_postcode_re: Regex::new(
                r"\b(VIC|NSW|QLD|SA|WA|TAS|NT|ACT)\s*,?\s*([0-9]{4})\b",
            )
            .expect("region regex"),
            reply_prefix_re: Regex::new(r"(?i)^(?:re|fwd?|fw)\s*:\s*").expect("prefix regex"),
            subject_for_re: Regex::new(
                r"(?i)^(?:quote|quotation|invoice|update|request|estimate|variation)\s+for\s+(.{4,80})$",
            )
            .expect("subject regex"),
        }
    }

    fn extract_job_numbers(&self, input: &ExtractionInput) -> Vec<JobNumber> {
        let mut found: Vec<JobNumber> = Vec::new();
        let mut push = |value: &str, source: &str, confidence: f64| {
            let value = value.trim();
            if value.is_empty() {
                return;
            }
            if !found.iter().any(|j| job_numbers_match(&j.value, value)) {
                found.push(JobNumber {
                    value: value.to_string(),
                    source: source.to_string(),
                    confidence,
                });
            }
        };

        for (text, source) in [(&input.subject, "subject"), (&input.body, "body")] {
            for caps in self.job_re.captures_iter(text) {
                push(&caps[1], source, 0.9);
            }
            for caps in self.bare_ref_re.captures_iter(text) {
                push(&caps[1], source, 0.7);
            }
        }
        found
    }

    fn extract_address(&self, input: &ExtractionInput) -> Option<ExtractedAddress> {
        let combined = format!("{}\n{}", input.subject, input.body);
        let street = self
            .street_re
            .captures(&combined)
            .map(|caps| caps[1].to_string())?;

        let postcode = self
            .postcode_re
            .captures(&combined)
            .map(|caps| caps[1].to_string())
            .or_else(|| {
                self.region_postcode_re
                    .captures(&combined)
                    .map(|caps| caps[2].to_string())
            });
        let region = self
            .region_postcode_re
            .captures(&combined)
            .map(|caps| caps[1].to_string());

        let full = match &postcode {
            Some(pc) => format!("{street} {pc}"),
            None => street.clone(),
        };
        Some(ExtractedAddress {
            full: Some(full),
            street: Some(street),
            locality: None,
            region,
            postcode,
            confidence: 0.85,
        })
    }

    fn extract_project_name(&self, input: &ExtractionInput) -> Option<NameCandidate> {
        let mut subject = input.subject.trim().to_string();
        loop {
            let stripped = self.reply_prefix_re.replace(&subject, "").into_owned();
            if stripped == subject {
                break;
            }
            subject = stripped;
        }
        if subject.is_empty() {
            return None;
        }

        if let Some(caps) = self.subject_for_re.captures(&subject) {
            return Some(NameCandidate {
                value: caps[1].trim().to_string(),
                confidence: 0.85,
                aliases: Vec::new(),
            });
        }

        // Generic one-word subjects carry no project identity.
        let folded = normalize_name(&subject);
        const GENERIC: &[&str] = &[
            "update", "hi", "hello", "invoice", "quote", "thanks", "thank you", "follow up",
            "reminder", "question",
        ];
        if GENERIC.contains(&folded.as_str()) {
            return None;
        }

        Some(NameCandidate {
            value: subject,
            confidence: 0.6,
            aliases: Vec::new(),
        })
    }

    fn project_type(&self, text: &str) -> Option<String> {
        let folded = text.to_lowercase();
        for (needle, ty) in [
            ("renovation", "renovation"),
            ("reno", "renovation"),
            ("new build", "new_build"),
            ("maintenance", "maintenance"),
            ("repair", "maintenance"),
            ("variation", "variation"),
            ("quote", "quote"),
            ("invoice", "payment"),
            ("payment", "payment"),
        ] {
            if folded.contains(needle) {
                return Some(ty.to_string());
            }
        }
        None
    }

    fn keywords(&self, text: &str) -> Vec<String> {
        const VOCAB: &[&str] = &[
            "kitchen", "bathroom", "deck", "pergola", "roof", "extension", "garage", "fence",
            "plumbing", "electrical", "tiling", "painting", "landscaping",
        ];
        let folded = text.to_lowercase();
        VOCAB
            .iter()
            .filter(|w| folded.contains(*w))
            .map(|w| w.to_string())
            .collect()
    }
}

impl Default for StubExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityExtractor for StubExtractor {
    async fn extract(&self, input: &ExtractionInput) -> CoreResult<ExtractedEntities> {
        let combined = format!("{} {}", input.subject, input.body);

        let job_numbers = self.extract_job_numbers(input);
        let address = self.extract_address(input);
        let project_name = self.extract_project_name(input);
        let client = if input.sender_email.is_empty() {
            None
        } else {
            Some(ClientInfo {
                name: input.sender_name.clone(),
                email: Some(input.sender_email.clone()),
                phone: None,
                company: None,
                confidence: 0.6,
            })
        };

        let mut confidence: f64 = 0.4;
        if address.is_some() {
            confidence += 0.2;
        }
        if !job_numbers.is_empty() {
            confidence += 0.2;
        }
        if project_name.is_some() {
            confidence += 0.1;
        }
        if client.is_some() {
            confidence += 0.05;
        }

        Ok(ExtractedEntities {
            project_name,
            alternative_names: Vec::new(),
            address,
            job_numbers,
            client,
            project_type: self.project_type(&combined),
            keywords: self.keywords(&combined),
            overall_confidence: confidence.min(0.95),
        })
    }

    async fn compare(
        &self,
        a: &ExtractionInput,
        b: &ExtractionInput,
    ) -> CoreResult<SimilarityVerdict> {
        let ea = self.extract(a).await?;
        let eb = self.extract(b).await?;

        let mut indicators = MatchingIndicators::default();

        indicators.job_number = ea.job_numbers.iter().any(|ja| {
            eb.job_numbers
                .iter()
                .any(|jb| job_numbers_match(&ja.value, &jb.value))
        });

        indicators.address = match (&ea.address, &eb.address) {
            (Some(aa), Some(ab)) => match (&aa.street, &ab.street) {
                (Some(sa), Some(sb)) => normalize_street(sa) == normalize_street(sb),
                _ => false,
            },
            _ => false,
        };

        indicators.project_name = match (&ea.project_name, &eb.project_name) {
            (Some(na), Some(nb)) => normalize_name(&na.value) == normalize_name(&nb.value),
            _ => false,
        };

        indicators.client = a.sender_email.eq_ignore_ascii_case(&b.sender_email)
            && !a.sender_email.is_empty();

        let overlap = keyword_overlap(&ea.keywords, &eb.keywords);
        indicators.content = overlap >= 0.5;

        let (same_project, score, reason) = if indicators.job_number {
            (true, 0.9, "matching job number")
        } else if indicators.address {
            (true, 0.85, "matching street address")
        } else if indicators.project_name {
            (true, 0.75, "matching project name")
        } else if indicators.content && indicators.client {
            (true, 0.6, "same sender and similar content")
        } else {
            (false, 0.2, "no shared identifiers")
        };

        Ok(SimilarityVerdict {
            same_project,
            score,
            matching_indicators: indicators,
            reason: reason.to_string(),
        })
    }
}

fn keyword_overlap(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.iter().filter(|w| b.contains(w)).count();
    let union = a.len() + b.len() - shared;
    shared as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(subject: &str, body: &str, sender: &str) -> ExtractionInput {
        ExtractionInput {
            subject: subject.into(),
            body: body.into(),
            sender_name: None,
            sender_email: sender.into(),
            existing_projects: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_quote_email_extraction() {
        let stub = StubExtractor::new();
        let entities = stub
            .extract(&input(
                "Quote for 12 Baker St renovation",
                "Hi, Job #2024-087 as discussed. New kitchen and bathroom.",
                "alice@builder.test",
            ))
            .await
            .unwrap();

        assert_eq!(
            entities.project_name.as_ref().unwrap().value,
            "12 Baker St renovation"
        );
        assert_eq!(entities.job_numbers.len(), 1);
        assert_eq!(entities.job_numbers[0].value, "2024-087");
        assert_eq!(
            entities.address.as_ref().unwrap().street.as_deref(),
            Some("12 Baker St")
        );
        assert_eq!(entities.project_type.as_deref(), Some("renovation"));
        assert!(entities.keywords.contains(&"kitchen".to_string()));
        assert!(entities.overall_confidence >= 0.8);
    }

    #[tokio::test]
    async fn test_generic_subject_yields_no_name() {
        let stub = StubExtractor::new();
        let entities = stub
            .extract(&input(
                "Update",
                "Progress at 12 Baker Street, postcode 3000. New kitchen going in.",
                "bob@sub.test",
            ))
            .await
            .unwrap();

        assert!(entities.project_name.is_none());
        let addr = entities.address.unwrap();
        assert_eq!(addr.street.as_deref(), Some("12 Baker Street"));
        assert_eq!(addr.postcode.as_deref(), Some("3000"));
    }

    #[tokio::test]
    async fn test_job_number_without_hash() {
        let stub = StubExtractor::new();
        let entities = stub
            .extract(&input("Update", "Regarding Job 2024-087, timber arrives Monday.", "x@y.test"))
            .await
            .unwrap();
        assert_eq!(entities.job_numbers.len(), 1);
        assert_eq!(entities.job_numbers[0].value, "2024-087");
    }

    #[tokio::test]
    async fn test_reply_prefixes_stripped() {
        let stub = StubExtractor::new();
        let entities = stub
            .extract(&input(
                "Re: Fwd: Quote for Smith Residence",
                "",
                "x@y.test",
            ))
            .await
            .unwrap();
        assert_eq!(entities.project_name.unwrap().value, "Smith Residence");
    }

    #[tokio::test]
    async fn test_region_postcode_pattern() {
        let stub = StubExtractor::new();
        let entities = stub
            .extract(&input(
                "Site works",
                "Deliver to 5 Ocean Crescent, Torquay VIC 3228.",
                "x@y.test",
            ))
            .await
            .unwrap();
        let addr = entities.address.unwrap();
        assert_eq!(addr.postcode.as_deref(), Some("3228"));
        assert_eq!(addr.region.as_deref(), Some("VIC"));
    }

    #[tokio::test]
    async fn test_compare_matches_on_job_number() {
        let stub = StubExtractor::new();
        let verdict = stub
            .compare(
                &input("Quote", "Job #2024-087 quote attached", "alice@a.test"),
                &input("Update", "Progress on job 2024-087", "bob@b.test"),
            )
            .await
            .unwrap();
        assert!(verdict.same_project);
        assert!(verdict.score >= 0.8);
        assert!(verdict.matching_indicators.job_number);
    }

    #[tokio::test]
    async fn test_compare_unrelated() {
        let stub = StubExtractor::new();
        let verdict = stub
            .compare(
                &input("Quote for 12 Baker St renovation", "kitchen", "a@a.test"),
                &input("Fence repair", "back fence blew over", "b@b.test"),
            )
            .await
            .unwrap();
        assert!(!verdict.same_project);
        assert!(verdict.score < 0.5);
    }
}
