use crate::error::Result;
use crate::patch::{CandidatePatch, ExtractionMethod};
use regex::Regex;
use serde_json::Value;

/// Result of running the extraction rules over one AI response.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub patch: Option<CandidatePatch>,
    /// JSON field the patch came from, for structured extractions.
    pub field: Option<String>,
}

impl Extraction {
    fn none() -> Self {
        Self {
            patch: None,
            field: None,
        }
    }

    pub fn method(&self) -> Option<ExtractionMethod> {
        self.patch.as_ref().map(|p| p.method())
    }
}

/// Header lines that may sit directly above a `---` line.
const GIT_HEADER_PREFIXES: &[&str] = &[
    "diff --git ",
    "index ",
    "new file mode ",
    "deleted file mode ",
    "old mode ",
    "new mode ",
    "similarity index ",
    "rename from ",
    "rename to ",
];

/// Pulls a unified diff out of free-form model output.
///
/// Rules run in a fixed order and the first hit wins: a diff-looking field in
/// JSON, then a fenced block labeled `diff`/`patch`, then a bare `--- a/` /
/// `+++ b/` span in the raw text.
pub struct PatchExtractor {
    json_fence_regex: Regex,
    patch_literal_regex: Regex,
    diff_fence_regex: Regex,
}

impl PatchExtractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            json_fence_regex: Regex::new(r"(?s)```[ \t]*(?:json|JSON)?[ \t]*\r?\n(.*?)```")?,
            patch_literal_regex: Regex::new(r#"(?s)"patch"\s*:\s*"((?:[^"\\]|\\.)*)""#)?,
            diff_fence_regex: Regex::new(r"(?s)```[ \t]*(?:diff|patch)\b[^\n]*\n(.*?)```")?,
        })
    }

    pub fn extract(&self, response: &str) -> Extraction {
        if let Some((field, text)) = self.from_structured(response) {
            if let Some(patch) = CandidatePatch::new(text, ExtractionMethod::StructuredField) {
                return Extraction {
                    patch: Some(patch),
                    field: Some(field),
                };
            }
        }

        if let Some(text) = self.from_fenced_block(response) {
            if let Some(patch) = CandidatePatch::new(text, ExtractionMethod::FencedBlock) {
                return Extraction {
                    patch: Some(patch),
                    field: None,
                };
            }
        }

        if let Some(text) = from_raw_text(response) {
            if let Some(patch) = CandidatePatch::new(text, ExtractionMethod::RawHeuristic) {
                return Extraction {
                    patch: Some(patch),
                    field: None,
                };
            }
        }

        Extraction::none()
    }

    fn from_structured(&self, response: &str) -> Option<(String, String)> {
        for candidate in self.json_candidates(response) {
            if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                if let Some(found) = find_diff_field(&value) {
                    return Some(found);
                }
            }
        }

        // Not valid JSON, but the model may still have written a `"patch": "..."` literal.
        for caps in self.patch_literal_regex.captures_iter(response) {
            if let Some(raw) = caps.get(1) {
                let text = unescape(raw.as_str());
                if looks_like_diff(&text) {
                    return Some(("patch".to_string(), text));
                }
            }
        }

        None
    }

    fn json_candidates<'a>(&self, response: &'a str) -> Vec<&'a str> {
        let mut candidates = vec![response.trim()];

        for caps in self.json_fence_regex.captures_iter(response) {
            if let Some(body) = caps.get(1) {
                candidates.push(body.as_str().trim());
            }
        }

        if let (Some(start), Some(end)) = (response.find('{'), response.rfind('}')) {
            if start < end {
                candidates.push(&response[start..=end]);
            }
        }

        candidates
    }

    fn from_fenced_block(&self, response: &str) -> Option<String> {
        self.diff_fence_regex
            .captures_iter(response)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
            .find(|body| !body.trim().is_empty())
    }
}

/// A unified diff mentions `diff --git`, or has both a `---` and a `+++` line.
pub fn looks_like_diff(text: &str) -> bool {
    if text.contains("diff --git") {
        return true;
    }
    let has_old = text.lines().any(|l| l.starts_with("---"));
    let has_new = text.lines().any(|l| l.starts_with("+++"));
    has_old && has_new
}

/// Depth-first search for a string field holding a diff; `patch` wins over
/// any other key at any depth.
fn find_diff_field(value: &Value) -> Option<(String, String)> {
    let mut found = Vec::new();
    collect_diff_fields(value, "", &mut found);

    let preferred = found
        .iter()
        .position(|(key, _)| key.eq_ignore_ascii_case("patch"))
        .unwrap_or(0);

    if found.is_empty() {
        None
    } else {
        Some(found.swap_remove(preferred))
    }
}

fn collect_diff_fields(value: &Value, key: &str, found: &mut Vec<(String, String)>) {
    match value {
        Value::String(s) => {
            let text = if !s.contains('\n') && s.contains("\\n") {
                unescape(s)
            } else {
                s.clone()
            };
            if looks_like_diff(&text) {
                found.push((key.to_string(), text));
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                collect_diff_fields(v, k, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_diff_fields(item, key, found);
            }
        }
        _ => {}
    }
}

/// Undo JSON-style escaping: `\n`, `\t`, `\r`, `\"`, `\\`, `\/`.
/// Unknown escapes are kept as written.
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn is_old_header(line: &str) -> bool {
    line.starts_with("--- a/") || line.starts_with("--- /dev/null")
}

fn is_new_header(line: &str) -> bool {
    line.starts_with("+++ b/") || line.starts_with("+++ /dev/null")
}

fn is_diff_syntax(line: &str) -> bool {
    line.starts_with("---")
        || line.starts_with("+++")
        || line.starts_with("@@")
        || line.starts_with(' ')
        || line.starts_with('+')
        || line.starts_with('-')
        || line.starts_with('\\')
        || GIT_HEADER_PREFIXES.iter().any(|p| line.starts_with(p))
}

/// Smallest contiguous run of diff-shaped lines around the first `--- a/` that
/// is eventually followed by a `+++ b/`.
fn from_raw_text(response: &str) -> Option<String> {
    let lines: Vec<&str> = response.lines().collect();

    let start = lines.iter().enumerate().find_map(|(i, line)| {
        (is_old_header(line) && lines[i + 1..].iter().any(|l| is_new_header(l))).then_some(i)
    })?;

    let mut first = start;
    while first > 0 && GIT_HEADER_PREFIXES.iter().any(|p| lines[first - 1].starts_with(p)) {
        first -= 1;
    }

    let mut last = start;
    let mut i = start + 1;
    while i < lines.len() {
        let line = lines[i];
        if is_diff_syntax(line) {
            last = i;
        } else if !line.is_empty() || !lines.get(i + 1).is_some_and(|n| is_diff_syntax(n)) {
            // Blank lines only count when the diff carries on after them.
            break;
        }
        i += 1;
    }

    let mut text = lines[first..=last].join("\n");
    text.push('\n');
    Some(text)
}
