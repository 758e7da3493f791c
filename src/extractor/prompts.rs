//! Prompt builders for entity extraction and similarity.
//!
//! Prompts ask for JSON matching the schemas in this module's parent; the
//! reformatting preamble gets stricter on each parse-failure retry.

use super::ExtractionInput;

pub const SYSTEM_PROMPT: &str = "You are an assistant that extracts and analyzes \
project information from emails for builders and carpenters. Always return valid JSON.";

/// Preamble by retry attempt: the first retry asks politely, the second
/// forbids everything but the object.
pub fn strictness_preamble(attempt: u32) -> &'static str {
    match attempt {
        0 => "",
        1 => "Return ONLY a JSON object matching the requested structure. \
              Do not wrap it in markdown fences or add commentary.\n\n",
        _ => "CRITICAL: your entire response must be a single raw JSON object. \
              No markdown, no code fences, no explanation, no text before or \
              after the object.\n\n",
    }
}

/// Comprehensive entity extraction for one message.
pub fn entity_extraction_prompt(input: &ExtractionInput, attempt: u32) -> String {
    let sender = match &input.sender_name {
        Some(name) if !name.is_empty() => format!("{} ({})", name, input.sender_email),
        _ => input.sender_email.clone(),
    };
    let existing = if input.existing_projects.is_empty() {
        String::new()
    } else {
        format!(
            "\n\nExisting projects for this user: {}",
            input.existing_projects.join(", ")
        )
    };
    let body: String = input.body.chars().take(3000).collect();

    format!(
        "{preamble}Analyze the email and extract all relevant project information. \
Projects are typically identified by a property address, a client name plus project \
type (e.g. \"Smith Kitchen Renovation\"), a job description, or a job/quote/reference \
number.

Email Subject: {subject}
Sender: {sender}
Email Content:
{body}{existing}

Return ONLY a JSON object with this structure:
{{
    \"project_name\": {{\"value\": \"primary project name\", \"confidence\": 0.0, \"aliases\": [\"variations mentioned\"]}},
    \"alternative_names\": [{{\"value\": \"other independent project mentioned\", \"confidence\": 0.0, \"aliases\": []}}],
    \"address\": {{\"full\": \"complete address\", \"street\": \"street number and name\", \"locality\": \"suburb or town\", \"region\": \"state\", \"postcode\": \"postcode\", \"confidence\": 0.0}},
    \"job_numbers\": [{{\"value\": \"job or reference number\", \"source\": \"subject|body|signature|attachment-filename\", \"confidence\": 0.0}}],
    \"client\": {{\"name\": \"client name\", \"email\": \"client email if different from sender\", \"phone\": \"phone if mentioned\", \"company\": \"company if mentioned\", \"confidence\": 0.0}},
    \"project_type\": \"renovation|new_build|maintenance|quote|variation|payment|completion|other\",
    \"keywords\": [\"words that identify this project\"],
    \"overall_confidence\": 0.0
}}

Use null for fields that cannot be determined. If multiple projects are \
mentioned, put the PRIMARY one in project_name and the others in \
alternative_names. If no clear project can be identified, set project_name \
to null and overall_confidence below 0.5.",
        preamble = strictness_preamble(attempt),
        subject = input.subject,
    )
}

/// Pairwise comparison: do two messages belong to the same project?
pub fn similarity_prompt(a: &ExtractionInput, b: &ExtractionInput, attempt: u32) -> String {
    let body_a: String = a.body.chars().take(1000).collect();
    let body_b: String = b.body.chars().take(1000).collect();
    let existing = if a.existing_projects.is_empty() {
        String::new()
    } else {
        format!(
            "\n\nExisting projects:\n{}",
            a.existing_projects
                .iter()
                .take(5)
                .map(|p| format!("- {p}"))
                .collect::<Vec<_>>()
                .join("\n")
        )
    };

    format!(
        "{preamble}Determine whether these two emails belong to the same project/job.

Email 1:
Subject: {subj_a}
From: {from_a}
Content: {body_a}

Email 2:
Subject: {subj_b}
From: {from_b}
Content: {body_b}{existing}

Consider: same sender discussing the same property is likely the same project; \
different senders but the same address is likely the same project; matching job \
numbers are near-certain; similar content at different addresses is likely a \
different project.

Return ONLY a JSON object:
{{
    \"same_project\": true,
    \"score\": 0.0,
    \"matching_indicators\": {{\"project_name\": false, \"address\": false, \"job_number\": false, \"client\": false, \"content\": false}},
    \"reason\": \"brief explanation\"
}}",
        preamble = strictness_preamble(attempt),
        subj_a = a.subject,
        from_a = a.sender_email,
        subj_b = b.subject,
        from_b = b.sender_email,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> ExtractionInput {
        ExtractionInput {
            subject: "Quote for 12 Baker St renovation".into(),
            body: "Job #2024-087. Please find the quote attached.".into(),
            sender_name: Some("Alice Builder".into()),
            sender_email: "alice@builder.test".into(),
            existing_projects: vec!["Baker Job".into()],
        }
    }

    #[test]
    fn test_entity_prompt_includes_context() {
        let prompt = entity_extraction_prompt(&input(), 0);
        assert!(prompt.contains("Quote for 12 Baker St renovation"));
        assert!(prompt.contains("Alice Builder (alice@builder.test)"));
        assert!(prompt.contains("Existing projects for this user: Baker Job"));
        assert!(prompt.contains("overall_confidence"));
        assert!(!prompt.starts_with("CRITICAL"));
    }

    #[test]
    fn test_preamble_escalates() {
        assert!(strictness_preamble(0).is_empty());
        assert!(strictness_preamble(1).contains("ONLY a JSON object"));
        assert!(strictness_preamble(2).starts_with("CRITICAL"));
        let prompt = entity_extraction_prompt(&input(), 2);
        assert!(prompt.starts_with("CRITICAL"));
    }

    #[test]
    fn test_body_truncation() {
        let mut long = input();
        long.body = "x".repeat(10_000);
        let prompt = entity_extraction_prompt(&long, 0);
        assert!(prompt.len() < 8_000);
    }

    #[test]
    fn test_similarity_prompt_shape() {
        let prompt = similarity_prompt(&input(), &input(), 0);
        assert!(prompt.contains("Email 1:"));
        assert!(prompt.contains("Email 2:"));
        assert!(prompt.contains("same_project"));
    }
}
