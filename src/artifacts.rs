//! Side-channel storage for what a heal run saw: the raw AI response, the
//! extracted patch, the deploy result and the final report. Sink failures are
//! logged and never change the outcome of a run.

use crate::deploy::DeployResult;
use crate::heal::HealReport;
use crate::patch::CandidatePatch;
use crate::providers::Message;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

pub trait ArtifactSink: Send + Sync {
    fn record_ai_request(&self, run_id: &str, messages: &[Message]);

    fn record_ai_response(&self, run_id: &str, text: &str);

    fn record_patch(&self, run_id: &str, patch: &CandidatePatch);

    fn record_deploy_result(&self, run_id: &str, result: &DeployResult);

    fn record_report(&self, report: &HealReport);
}

/// Writes one directory per run under `root`.
#[derive(Debug, Clone)]
pub struct FsArtifactSink {
    root: PathBuf,
}

impl FsArtifactSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    fn write(&self, run_id: &str, name: &str, content: &str) {
        let dir = self.run_dir(run_id);
        let path = dir.join(name);
        let result = fs::create_dir_all(&dir).and_then(|_| fs::write(&path, content));
        match result {
            Ok(()) => debug!(path = %path.display(), "Artifact written"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to write artifact"),
        }
    }

    fn write_json<T: Serialize>(&self, run_id: &str, name: &str, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(json) => self.write(run_id, name, &json),
            Err(e) => warn!(artifact = name, error = %e, "Failed to serialize artifact"),
        }
    }
}

impl ArtifactSink for FsArtifactSink {
    fn record_ai_request(&self, run_id: &str, messages: &[Message]) {
        self.write_json(run_id, "ai_request.json", &messages);
    }

    fn record_ai_response(&self, run_id: &str, text: &str) {
        self.write(run_id, "ai_response.txt", text);
    }

    fn record_patch(&self, run_id: &str, patch: &CandidatePatch) {
        self.write(run_id, "candidate.patch", patch.text());
    }

    fn record_deploy_result(&self, run_id: &str, result: &DeployResult) {
        self.write_json(run_id, "deploy_result.json", result);
    }

    fn record_report(&self, report: &HealReport) {
        self.write_json(&report.run_id(), "report.json", report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::ExtractionMethod;
    use tempfile::TempDir;

    #[test]
    fn test_writes_per_run_directory() {
        let dir = TempDir::new().unwrap();
        let sink = FsArtifactSink::new(dir.path().join("artifacts"));

        sink.record_ai_request(
            "run-1",
            &[Message { role: crate::providers::Role::User, content: "fix it".into() }],
        );
        sink.record_ai_response("run-1", "{\"patch\": \"\"}");
        sink.record_patch(
            "run-1",
            &CandidatePatch::new("--- a/x\n+++ b/x\n", ExtractionMethod::RawHeuristic).unwrap(),
        );
        sink.record_deploy_result("run-1", &DeployResult::Failed { reason: "quota_exceeded".into() });

        let run = sink.run_dir("run-1");
        assert_eq!(fs::read_to_string(run.join("ai_response.txt")).unwrap(), "{\"patch\": \"\"}");
        assert_eq!(fs::read_to_string(run.join("candidate.patch")).unwrap(), "--- a/x\n+++ b/x\n");
        let request: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(run.join("ai_request.json")).unwrap()).unwrap();
        assert_eq!(request[0]["content"], "fix it");
        let deploy: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(run.join("deploy_result.json")).unwrap()).unwrap();
        assert_eq!(deploy["reason"], "quota_exceeded");
    }

    #[test]
    fn test_unwritable_root_does_not_panic() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "not a directory").unwrap();

        let sink = FsArtifactSink::new(&blocker);
        sink.record_ai_response("run-1", "text");
        assert!(!blocker.join("run-1").exists());
    }
}
