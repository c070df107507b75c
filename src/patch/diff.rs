//! Unified diff parsing and in-memory application.
//!
//! Hunk headers are read for their start positions; their line counts decide
//! where a hunk body ends, but a hunk that stops early (next header, stray
//! text, end of input) is recounted from its body instead of rejected, the way
//! `git apply --recount` treats hand-edited or model-written patches.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PatchError {
    #[error("malformed diff at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("patch contains no file sections")]
    Empty,

    #[error("hunk {hunk} does not apply to {path}")]
    ContextMismatch { path: String, hunk: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<HunkLine>,
    /// `\ No newline at end of file` seen after the last old-side line.
    pub old_missing_newline: bool,
    /// Same, after the last new-side line.
    pub new_missing_newline: bool,
}

impl Hunk {
    fn old_side(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilePatch {
    /// `None` for `/dev/null`.
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    pub fn is_deletion(&self) -> bool {
        self.new_path.is_none()
    }

    /// Path the patch reads from (or creates).
    pub fn target_path(&self) -> &str {
        self.old_path
            .as_deref()
            .or(self.new_path.as_deref())
            .unwrap_or_default()
    }
}

fn hunk_header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@ .*?-(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("valid hunk regex")
    })
}

fn strip_path(raw: &str) -> Option<String> {
    let path = raw.split('\t').next().unwrap_or(raw).trim();
    let path = path.trim_matches('"');
    if path == "/dev/null" {
        return None;
    }
    let stripped = path
        .strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path);
    Some(stripped.to_string())
}

struct OpenHunk {
    hunk: Hunk,
    old_remaining: usize,
    new_remaining: usize,
}

impl OpenHunk {
    fn exhausted(&self) -> bool {
        self.old_remaining == 0 && self.new_remaining == 0
    }

    /// Close the hunk, trusting the body over the header counts.
    fn finish(mut self, line_no: usize) -> Result<Hunk, PatchError> {
        if self.hunk.lines.is_empty() {
            return Err(PatchError::Malformed {
                line: line_no,
                reason: "hunk has no body".to_string(),
            });
        }
        self.hunk.old_len = self
            .hunk
            .lines
            .iter()
            .filter(|l| !matches!(l, HunkLine::Add(_)))
            .count();
        self.hunk.new_len = self
            .hunk
            .lines
            .iter()
            .filter(|l| !matches!(l, HunkLine::Remove(_)))
            .count();
        Ok(self.hunk)
    }
}

#[derive(Default)]
struct Section {
    old_path: Option<Option<String>>,
    new_path: Option<Option<String>>,
    hunks: Vec<Hunk>,
}

impl Section {
    fn finish(self, line_no: usize) -> Result<FilePatch, PatchError> {
        let (Some(old_path), Some(new_path)) = (self.old_path, self.new_path) else {
            return Err(PatchError::Malformed {
                line: line_no,
                reason: "file section without ---/+++ headers".to_string(),
            });
        };
        if old_path.is_none() && new_path.is_none() {
            return Err(PatchError::Malformed {
                line: line_no,
                reason: "both sides are /dev/null".to_string(),
            });
        }
        if self.hunks.is_empty() {
            return Err(PatchError::Malformed {
                line: line_no,
                reason: "file section has no hunks".to_string(),
            });
        }
        Ok(FilePatch {
            old_path,
            new_path,
            hunks: self.hunks,
        })
    }
}

/// Parse a unified diff into per-file patches.
pub fn parse(text: &str) -> Result<Vec<FilePatch>, PatchError> {
    let lines: Vec<&str> = text
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .collect();

    let mut files = Vec::new();
    let mut section: Option<Section> = None;
    let mut open: Option<OpenHunk> = None;

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let line_no = i + 1;

        if let Some(h) = open.as_mut() {
            if !h.exhausted() {
                let starts_file_header = line.starts_with("--- ")
                    && lines.get(i + 1).is_some_and(|n| n.starts_with("+++ "));
                let body = match line.chars().next() {
                    _ if starts_file_header => None,
                    Some(' ') => Some(HunkLine::Context(line[1..].to_string())),
                    Some('-') => Some(HunkLine::Remove(line[1..].to_string())),
                    Some('+') => Some(HunkLine::Add(line[1..].to_string())),
                    // Blank context lines often lose their leading space in transit.
                    None if i + 1 < lines.len() => Some(HunkLine::Context(String::new())),
                    _ => None,
                };

                if let Some(body) = body {
                    match body {
                        HunkLine::Context(_) => {
                            h.old_remaining = h.old_remaining.saturating_sub(1);
                            h.new_remaining = h.new_remaining.saturating_sub(1);
                        }
                        HunkLine::Remove(_) => h.old_remaining = h.old_remaining.saturating_sub(1),
                        HunkLine::Add(_) => h.new_remaining = h.new_remaining.saturating_sub(1),
                    }
                    h.hunk.lines.push(body);
                    i += 1;
                    continue;
                }

                if line.starts_with('\\') {
                    mark_missing_newline(&mut h.hunk);
                    i += 1;
                    continue;
                }
            } else if line.starts_with('\\') {
                mark_missing_newline(&mut h.hunk);
                i += 1;
                continue;
            }

            // Hunk is over, by count or because the body stopped.
            if let (Some(h), Some(s)) = (open.take(), section.as_mut()) {
                s.hunks.push(h.finish(line_no)?);
            }
        }

        if line.starts_with("diff --git ") {
            if let Some(s) = section.take() {
                files.push(s.finish(line_no)?);
            }
            section = Some(Section::default());
        } else if let Some(rest) = line.strip_prefix("--- ") {
            let starts_new = section
                .as_ref()
                .is_none_or(|s| s.old_path.is_some() && !s.hunks.is_empty());
            if starts_new {
                if let Some(s) = section.take() {
                    files.push(s.finish(line_no)?);
                }
                section = Some(Section::default());
            }
            if let Some(s) = section.as_mut() {
                s.old_path = Some(strip_path(rest));
            }
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            match section.as_mut() {
                Some(s) if s.old_path.is_some() => s.new_path = Some(strip_path(rest)),
                _ => {
                    return Err(PatchError::Malformed {
                        line: line_no,
                        reason: "+++ header without preceding ---".to_string(),
                    });
                }
            }
        } else if line.starts_with("@@") {
            let Some(s) = section.as_ref() else {
                return Err(PatchError::Malformed {
                    line: line_no,
                    reason: "hunk before any file header".to_string(),
                });
            };
            if s.old_path.is_none() || s.new_path.is_none() {
                return Err(PatchError::Malformed {
                    line: line_no,
                    reason: "hunk before ---/+++ headers".to_string(),
                });
            }
            let caps = hunk_header_regex()
                .captures(line)
                .ok_or_else(|| PatchError::Malformed {
                    line: line_no,
                    reason: format!("unparseable hunk header '{}'", line),
                })?;
            let num = |idx: usize, default: usize| -> usize {
                caps.get(idx)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(default)
            };
            let old_len = num(2, 1);
            let new_len = num(4, 1);
            open = Some(OpenHunk {
                hunk: Hunk {
                    old_start: num(1, 0),
                    old_len,
                    new_start: num(3, 0),
                    new_len,
                    lines: Vec::new(),
                    old_missing_newline: false,
                    new_missing_newline: false,
                },
                old_remaining: old_len,
                new_remaining: new_len,
            });
        }
        // Anything else (index lines, mode lines, commentary) is ignored.

        i += 1;
    }

    let end = lines.len();
    if let Some(h) = open.take() {
        let hunk = h.finish(end)?;
        match section.as_mut() {
            Some(s) => s.hunks.push(hunk),
            None => {
                return Err(PatchError::Malformed {
                    line: end,
                    reason: "hunk outside of a file section".to_string(),
                });
            }
        }
    }
    if let Some(s) = section.take() {
        files.push(s.finish(end)?);
    }

    if files.is_empty() {
        return Err(PatchError::Empty);
    }
    Ok(files)
}

fn mark_missing_newline(hunk: &mut Hunk) {
    match hunk.lines.last() {
        Some(HunkLine::Remove(_)) => hunk.old_missing_newline = true,
        Some(HunkLine::Add(_)) => hunk.new_missing_newline = true,
        Some(HunkLine::Context(_)) => {
            hunk.old_missing_newline = true;
            hunk.new_missing_newline = true;
        }
        None => {}
    }
}

fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn matches_at(file: &[String], at: usize, needle: &[&str], loose: bool) -> bool {
    if at + needle.len() > file.len() {
        return false;
    }
    needle.iter().enumerate().all(|(k, expected)| {
        let actual = &file[at + k];
        if loose {
            normalize_ws(actual) == normalize_ws(expected)
        } else {
            actual == expected
        }
    })
}

/// Nearest match to `expected` at or after `floor`, exact before loose.
fn locate(file: &[String], needle: &[&str], expected: usize, floor: usize) -> Option<usize> {
    let last = file.len().checked_sub(needle.len())?;
    if floor > last {
        return None;
    }
    let expected = expected.clamp(floor, last);
    for loose in [false, true] {
        let span = (expected - floor).max(last - expected);
        for delta in 0..=span {
            if let Some(at) = expected.checked_sub(delta).filter(|a| *a >= floor) {
                if matches_at(file, at, needle, loose) {
                    return Some(at);
                }
            }
            if delta > 0 && expected + delta <= last && matches_at(file, expected + delta, needle, loose) {
                return Some(expected + delta);
            }
        }
    }
    None
}

fn split_lines(content: &str) -> (Vec<String>, bool) {
    if content.is_empty() {
        return (Vec::new(), true);
    }
    let ends_with_newline = content.ends_with('\n');
    let mut lines: Vec<String> = content.split('\n').map(str::to_string).collect();
    if ends_with_newline {
        lines.pop();
    }
    (lines, ends_with_newline)
}

/// Apply one file patch to `original` (`None` when the file does not exist).
///
/// Returns the new content, or `None` when the patch deletes the file.
pub fn apply_file_patch(original: Option<&str>, patch: &FilePatch) -> Result<Option<String>, PatchError> {
    let mismatch = |hunk: usize| PatchError::ContextMismatch {
        path: patch.target_path().to_string(),
        hunk,
    };

    let (mut file, mut ends_with_newline) = split_lines(original.unwrap_or_default());
    let mut offset: isize = 0;
    let mut floor = 0usize;

    for (idx, hunk) in patch.hunks.iter().enumerate() {
        let needle = hunk.old_side();
        let expected = if needle.is_empty() {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        let expected = (expected as isize + offset).max(0) as usize;

        let at = if needle.is_empty() {
            if expected > file.len() {
                return Err(mismatch(idx + 1));
            }
            expected.max(floor)
        } else {
            locate(&file, &needle, expected, floor).ok_or_else(|| mismatch(idx + 1))?
        };

        let mut replacement = Vec::with_capacity(hunk.new_len);
        let mut cursor = at;
        for line in &hunk.lines {
            match line {
                HunkLine::Context(_) => {
                    replacement.push(file[cursor].clone());
                    cursor += 1;
                }
                HunkLine::Remove(_) => cursor += 1,
                HunkLine::Add(s) => replacement.push(s.clone()),
            }
        }

        let touches_end = cursor == file.len();
        let inserted = replacement.len();
        file.splice(at..cursor, replacement);

        if touches_end {
            if hunk.new_missing_newline {
                ends_with_newline = false;
            } else if hunk.old_missing_newline {
                ends_with_newline = true;
            }
        }

        offset += inserted as isize - needle.len() as isize;
        floor = at + inserted;
    }

    if patch.is_deletion() {
        if !file.is_empty() {
            return Err(mismatch(patch.hunks.len()));
        }
        return Ok(None);
    }

    let mut out = file.join("\n");
    if !file.is_empty() && ends_with_newline {
        out.push('\n');
    }
    Ok(Some(out))
}
