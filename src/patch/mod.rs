pub mod applicator;
pub mod diff;
pub mod extractor;
pub mod validator;

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Which extraction rule produced a candidate patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    StructuredField,
    FencedBlock,
    RawHeuristic,
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExtractionMethod::StructuredField => "structured-field",
            ExtractionMethod::FencedBlock => "fenced-block",
            ExtractionMethod::RawHeuristic => "raw-heuristic",
        })
    }
}

/// A unified diff pulled out of an AI response. Never empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidatePatch {
    text: String,
    method: ExtractionMethod,
}

impl CandidatePatch {
    /// `None` when `text` is empty or whitespace only.
    pub fn new(text: impl Into<String>, method: ExtractionMethod) -> Option<Self> {
        let text = text.into();
        if text.trim().is_empty() {
            return None;
        }
        Some(Self { text, method })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn method(&self) -> ExtractionMethod {
        self.method
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ValidationResult {
    Valid,
    Invalid(String),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApplyResult {
    Applied { files: Vec<PathBuf> },
    FallbackApplied { path: PathBuf },
    Failed { reason: String },
}
