use super::diff::{self, FilePatch};
use super::{CandidatePatch, ValidationResult};
use crate::vcs::VcsGateway;
use crate::workspace::{FileAccessTracker, WorkingTree};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationCheck {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

impl ValidationCheck {
    fn pass(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: message.into(),
        }
    }

    fn fail(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: message.into(),
        }
    }
}

/// A patch that passed every check. Only the validator can produce one, so
/// the applicator never sees an unvalidated patch.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPatch {
    patch: CandidatePatch,
    files: Vec<String>,
}

impl ValidatedPatch {
    pub fn patch(&self) -> &CandidatePatch {
        &self.patch
    }

    /// Repository-relative paths the patch touches.
    pub fn files(&self) -> &[String] {
        &self.files
    }
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub result: ValidationResult,
    pub checks: Vec<ValidationCheck>,
    validated: Option<ValidatedPatch>,
}

impl ValidationReport {
    pub fn validated(&self) -> Option<&ValidatedPatch> {
        self.validated.as_ref()
    }

    fn from_checks(checks: Vec<ValidationCheck>, patch: &CandidatePatch, files: Vec<String>) -> Self {
        match checks.iter().find(|c| !c.passed) {
            Some(failed) => Self {
                result: ValidationResult::Invalid(failed.message.clone()),
                checks,
                validated: None,
            },
            None => Self {
                result: ValidationResult::Valid,
                checks,
                validated: Some(ValidatedPatch {
                    patch: patch.clone(),
                    files,
                }),
            },
        }
    }
}

/// Decides whether a candidate patch applies cleanly to the working tree.
///
/// Checks run in order and stop at the first failure:
/// 1. `syntax`: the text parses as a unified diff
/// 2. `targets`: every path stays inside the tree and exists (or, for new
///    files, does not exist yet)
/// 3. `dry_run`: every hunk matches the current file content, in memory
/// 4. `vcs_apply_check`: the version-control backend agrees
///
/// Nothing here writes to the tree.
#[derive(Debug, Default)]
pub struct PatchValidator;

impl PatchValidator {
    pub fn new() -> Self {
        Self
    }

    pub async fn validate(
        &self,
        patch: &CandidatePatch,
        tree: &WorkingTree,
        vcs: &dyn VcsGateway,
        tracker: &FileAccessTracker,
    ) -> ValidationReport {
        let mut checks = Vec::new();

        let files = match diff::parse(patch.text()) {
            Ok(files) => {
                checks.push(ValidationCheck::pass(
                    "syntax",
                    format!("Parsed {} file section(s)", files.len()),
                ));
                files
            }
            Err(e) => {
                checks.push(ValidationCheck::fail("syntax", format!("malformed diff: {}", e)));
                return ValidationReport::from_checks(checks, patch, Vec::new());
            }
        };

        let touched = touched_paths(&files);

        let targets = check_targets(&files, tree);
        let targets_ok = targets.passed;
        checks.push(targets);
        if !targets_ok {
            return ValidationReport::from_checks(checks, patch, touched);
        }

        let dry_run = dry_run(&files, tree, tracker);
        let dry_run_ok = dry_run.passed;
        checks.push(dry_run);
        if !dry_run_ok {
            return ValidationReport::from_checks(checks, patch, touched);
        }

        checks.push(match vcs.apply_check(patch.text()).await {
            Ok(true) => ValidationCheck::pass("vcs_apply_check", "Patch applies cleanly"),
            Ok(false) => ValidationCheck::fail(
                "vcs_apply_check",
                "patch does not apply cleanly to the working tree",
            ),
            Err(e) => ValidationCheck::fail("vcs_apply_check", format!("apply check failed: {}", e)),
        });

        let report = ValidationReport::from_checks(checks, patch, touched);
        match &report.result {
            ValidationResult::Valid => info!(files = ?report.validated().map(|v| v.files()), "Patch validated"),
            ValidationResult::Invalid(reason) => info!(reason = %reason, "Patch rejected"),
        }
        report
    }
}

fn touched_paths(files: &[FilePatch]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for file in files {
        for path in [&file.old_path, &file.new_path].into_iter().flatten() {
            if !out.contains(path) {
                out.push(path.clone());
            }
        }
    }
    out
}

fn check_targets(files: &[FilePatch], tree: &WorkingTree) -> ValidationCheck {
    for file in files {
        for path in [&file.old_path, &file.new_path].into_iter().flatten() {
            if let Err(e) = tree.resolve(path) {
                return ValidationCheck::fail("targets", e.to_string());
            }
        }

        match (&file.old_path, &file.new_path) {
            (None, Some(new)) if tree.exists(new) => {
                return ValidationCheck::fail("targets", format!("{} already exists", new));
            }
            (Some(old), _) if !tree.exists(old) => {
                return ValidationCheck::fail("targets", format!("{} does not exist", old));
            }
            (None, None) => {
                return ValidationCheck::fail("targets", "file section has no paths");
            }
            _ => {}
        }
    }
    ValidationCheck::pass("targets", "All target files present")
}

fn dry_run(files: &[FilePatch], tree: &WorkingTree, tracker: &FileAccessTracker) -> ValidationCheck {
    // Later sections see the output of earlier ones for the same path.
    let mut staged: HashMap<String, Option<String>> = HashMap::new();

    for file in files {
        let source = file.target_path().to_string();
        let current = match staged.get(&source) {
            Some(content) => content.clone(),
            None => {
                if let Ok(abs) = tree.resolve(&source) {
                    tracker.record_read(&abs);
                }
                match tree.read(&source) {
                    Ok(content) => content,
                    Err(e) => return ValidationCheck::fail("dry_run", format!("cannot read {}: {}", source, e)),
                }
            }
        };

        let updated = match diff::apply_file_patch(current.as_deref(), file) {
            Ok(updated) => updated,
            Err(e) => return ValidationCheck::fail("dry_run", e.to_string()),
        };
        debug!(path = %source, deleted = updated.is_none(), "Dry run applied file section");

        match &file.new_path {
            Some(dest) if *dest != source => {
                if let Ok(abs) = tree.resolve(dest) {
                    tracker.record_read(&abs);
                }
                staged.insert(source, None);
                staged.insert(dest.clone(), updated);
            }
            _ => {
                staged.insert(source, updated);
            }
        }
    }

    ValidationCheck::pass("dry_run", "All hunks match")
}
