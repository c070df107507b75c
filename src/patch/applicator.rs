use super::ApplyResult;
use super::validator::ValidatedPatch;
use crate::vcs::VcsGateway;
use crate::workspace::{FileAccessTracker, WorkingTree};
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Where and why to record a run that produced no usable patch.
#[derive(Debug, Clone)]
pub struct Fallback<'a> {
    /// Repository-relative file that receives the marker line.
    pub path: &'a Path,
    pub reason: &'a str,
    pub run_id: &'a str,
}

/// Turns a validation outcome into a change in the working tree: either the
/// validated patch, or one appended marker line in the fallback file.
#[derive(Debug, Clone)]
pub struct PatchApplicator {
    marker: String,
}

impl PatchApplicator {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn marker_line(&self, fallback: &Fallback<'_>, at: DateTime<Utc>) -> String {
        let reason = fallback.reason.replace(['\r', '\n'], " ");
        format!(
            "{} {} run {}: no automatic fix applied ({}); manual investigation required",
            self.marker,
            at.to_rfc3339_opts(SecondsFormat::Secs, true),
            fallback.run_id,
            reason.trim()
        )
    }

    pub async fn apply(
        &self,
        patch: Option<&ValidatedPatch>,
        fallback: &Fallback<'_>,
        tree: &WorkingTree,
        vcs: &dyn VcsGateway,
        tracker: &FileAccessTracker,
    ) -> ApplyResult {
        match patch {
            Some(patch) => self.apply_patch(patch, vcs, tracker).await,
            None => self.apply_fallback(fallback, tree),
        }
    }

    async fn apply_patch(
        &self,
        patch: &ValidatedPatch,
        vcs: &dyn VcsGateway,
        tracker: &FileAccessTracker,
    ) -> ApplyResult {
        if let Err(e) = tracker.check_all() {
            warn!(error = %e, "Refusing to apply patch to a tree changed since validation");
            return ApplyResult::Failed {
                reason: e.to_string(),
            };
        }

        match vcs.apply(patch.patch().text()).await {
            Ok(()) => {
                info!(files = ?patch.files(), "Patch applied");
                ApplyResult::Applied {
                    files: patch.files().iter().map(PathBuf::from).collect(),
                }
            }
            Err(e) => {
                warn!(error = %e, "Patch apply failed");
                ApplyResult::Failed { reason: e.reason() }
            }
        }
    }

    fn apply_fallback(&self, fallback: &Fallback<'_>, tree: &WorkingTree) -> ApplyResult {
        let line = self.marker_line(fallback, Utc::now());
        match tree.append_line(fallback.path, &line) {
            Ok(_) => {
                info!(path = %fallback.path.display(), "Fallback marker recorded");
                ApplyResult::FallbackApplied {
                    path: fallback.path.to_path_buf(),
                }
            }
            Err(e) => ApplyResult::Failed {
                reason: format!("cannot write {}: {}", fallback.path.display(), e),
            },
        }
    }
}
