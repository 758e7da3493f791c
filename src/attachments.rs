//! Attachment filename analysis.
//!
//! Filenames carry project identity surprisingly often: job numbers, dates,
//! address fragments. Parsed indicators feed the resolver's job-number
//! signal and are stored with the attachment descriptor.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::gmail::AttachmentPart;

/// Coarse file-type buckets for the UI and per-project aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    Document,
    Spreadsheet,
    Image,
    Drawing,
    Archive,
    Other,
}

impl FileCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FileCategory::Document => "document",
            FileCategory::Spreadsheet => "spreadsheet",
            FileCategory::Image => "image",
            FileCategory::Drawing => "drawing",
            FileCategory::Archive => "archive",
            FileCategory::Other => "other",
        }
    }
}

/// Project-indicator tokens parsed from a filename.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilenameIndicators {
    pub job_number: Option<String>,
    pub date: Option<String>,
    pub name_tokens: Vec<String>,
}

pub fn categorize_file(mime_type: &str, filename: &str) -> FileCategory {
    let ext = filename
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_lowercase();

    // Drawings before generic documents: CAD and plan formats
    if matches!(ext.as_str(), "dwg" | "dxf" | "rvt" | "skp") {
        return FileCategory::Drawing;
    }
    if mime_type.starts_with("image/") {
        return FileCategory::Image;
    }
    match ext.as_str() {
        "pdf" | "doc" | "docx" | "txt" | "rtf" | "odt" => FileCategory::Document,
        "xls" | "xlsx" | "csv" | "ods" => FileCategory::Spreadsheet,
        "jpg" | "jpeg" | "png" | "gif" | "heic" | "webp" => FileCategory::Image,
        "zip" | "rar" | "7z" | "tar" | "gz" => FileCategory::Archive,
        _ => match mime_type {
            "application/pdf" => FileCategory::Document,
            "application/zip" => FileCategory::Archive,
            _ => FileCategory::Other,
        },
    }
}

pub struct FilenameParser {
    job_res: Vec<Regex>,
    date_re: Regex,
    token_re: Regex,
}

impl FilenameParser {
    pub fn new() -> Self {
        let job_patterns = [
            r"(?i)job[_\s\-]*(?:#|no\.?|number)?[_\s\-]*([0-9][0-9\-]{1,12})",
            r"(?i)quote[_\s\-]*(?:#|no\.?)?[_\s\-]*([0-9][0-9\-]{1,12})",
            r"(?i)ref[_\s\-]*(?:#|no\.?)?[_\s\-]*([A-Z0-9][A-Z0-9\-]{1,12})",
            r"JOB-([0-9][0-9\-]{1,12})",
            r"Q-([0-9]{2,8})",
            r"#([0-9]{2,10})",
        ];
        FilenameParser {
            job_res: job_patterns
                .iter()
                .map(|p| Regex::new(p).expect("job pattern"))
                .collect(),
            date_re: Regex::new(r"(20[0-9]{2})[\-_.]?(0[1-9]|1[0-2])[\-_.]?([0-2][0-9]|3[01])")
                .expect("date pattern"),
            token_re: Regex::new(r"[A-Za-z]{3,}").expect("token pattern"),
        }
    }

    /// Parse one filename for project indicators.
    pub fn parse(&self, filename: &str) -> FilenameIndicators {
        let stem = filename.rsplit_once('.').map(|(s, _)| s).unwrap_or(filename);

        let mut indicators = FilenameIndicators::default();

        for re in &self.job_res {
            if let Some(caps) = re.captures(stem) {
                indicators.job_number = Some(caps[1].to_string());
                break;
            }
        }

        if let Some(caps) = self.date_re.captures(stem) {
            indicators.date = Some(format!("{}-{}-{}", &caps[1], &caps[2], &caps[3]));
        }

        const NOISE: &[&str] = &[
            "final", "draft", "copy", "scan", "img", "image", "doc", "file", "job", "quote",
            "ref", "invoice", "the", "and", "for", "rev", "version",
        ];
        indicators.name_tokens = self
            .token_re
            .find_iter(stem)
            .map(|m| m.as_str().to_lowercase())
            .filter(|t| !NOISE.contains(&t.as_str()))
            .collect();

        indicators
    }

    /// Parse a whole attachment set; job numbers found here enter the
    /// extraction result with `source = attachment-filename`.
    pub fn job_numbers_in(&self, attachments: &[AttachmentPart]) -> Vec<String> {
        let mut numbers = Vec::new();
        for att in attachments {
            if let Some(job) = self.parse(&att.filename).job_number {
                if !numbers.contains(&job) {
                    numbers.push(job);
                }
            }
        }
        numbers
    }
}

impl Default for FilenameParser {
    fn default() -> Self {
        Self::new()
    }
}
