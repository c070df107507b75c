//! In-memory gateways for exercising the orchestrator without git, network
//! or a deploy platform.

use crate::artifacts::ArtifactSink;
use crate::deploy::{DeployError, DeployGateway, DeployResult, Deployment};
use crate::heal::{CancelFlag, HealReport, RunStatus};
use crate::patch::diff;
use crate::patch::CandidatePatch;
use crate::providers::{AiError, AiGateway, GenerationParams, Message};
use crate::vcs::{ChangeSet, CommitId, CommitOutcome, VcsError, VcsGateway, last_live_marked_commit};
use crate::workspace::WorkingTree;
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn snapshot(root: &Path) -> BTreeMap<String, String> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, String>) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(root, &path, out);
            } else if let Ok(content) = fs::read_to_string(&path) {
                let rel = path
                    .strip_prefix(root)
                    .unwrap()
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                out.insert(rel, content);
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

#[derive(Default)]
struct VcsState {
    committed: BTreeMap<String, String>,
    applied: Vec<String>,
    commits: Vec<(CommitId, String)>,
    pushes: Vec<(CommitId, String)>,
    reverts: Vec<CommitId>,
}

/// A version-control backend over a plain directory. Patches really change
/// files; commits are snapshots.
pub struct FakeVcs {
    root: PathBuf,
    apply_check: Option<bool>,
    inert_apply: bool,
    fail_commit: Option<String>,
    fail_push: Option<String>,
    state: Mutex<VcsState>,
}

impl FakeVcs {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            apply_check: None,
            inert_apply: false,
            fail_commit: None,
            fail_push: None,
            state: Mutex::new(VcsState {
                committed: snapshot(root),
                ..Default::default()
            }),
        }
    }

    pub fn with_apply_check(mut self, result: bool) -> Self {
        self.apply_check = Some(result);
        self
    }

    /// `apply` succeeds without touching the tree.
    pub fn with_inert_apply(mut self) -> Self {
        self.inert_apply = true;
        self
    }

    pub fn with_commit_failure(mut self, reason: &str) -> Self {
        self.fail_commit = Some(reason.to_string());
        self
    }

    pub fn with_push_failure(mut self, reason: &str) -> Self {
        self.fail_push = Some(reason.to_string());
        self
    }

    pub fn with_history(self, id: &str, message: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .commits
            .push((CommitId(id.to_string()), message.to_string()));
        self
    }

    pub fn applied(&self) -> Vec<String> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn commits(&self) -> Vec<(CommitId, String)> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn pushes(&self) -> Vec<(CommitId, String)> {
        self.state.lock().unwrap().pushes.clone()
    }

    pub fn reverts(&self) -> Vec<CommitId> {
        self.state.lock().unwrap().reverts.clone()
    }

    fn planned(&self, patch: &str) -> Result<Vec<(PathBuf, Option<String>)>, VcsError> {
        let failed = |e: diff::PatchError| VcsError::CommandFailed {
            command: "apply".to_string(),
            reason: e.to_string(),
        };
        let mut out = Vec::new();
        for file in diff::parse(patch).map_err(failed)? {
            let source = self.root.join(file.target_path());
            let current = fs::read_to_string(&source).ok();
            let updated = diff::apply_file_patch(current.as_deref(), &file).map_err(failed)?;
            let dest = file
                .new_path
                .as_ref()
                .map(|p| self.root.join(p))
                .unwrap_or(source);
            out.push((dest, updated));
        }
        Ok(out)
    }
}

#[async_trait]
impl VcsGateway for FakeVcs {
    async fn checkout(&self, _repo_ref: &str, branch: &str) -> Result<WorkingTree, VcsError> {
        Ok(WorkingTree::new(self.root.clone(), branch))
    }

    async fn apply_check(&self, patch: &str) -> Result<bool, VcsError> {
        Ok(self.apply_check.unwrap_or_else(|| self.planned(patch).is_ok()))
    }

    async fn apply(&self, patch: &str) -> Result<(), VcsError> {
        if !self.inert_apply {
            for (path, content) in self.planned(patch)? {
                match content {
                    Some(content) => {
                        if let Some(parent) = path.parent() {
                            fs::create_dir_all(parent)?;
                        }
                        fs::write(&path, content)?;
                    }
                    None => fs::remove_file(&path)?,
                }
            }
        }
        self.state.lock().unwrap().applied.push(patch.to_string());
        Ok(())
    }

    async fn stage_all(&self) -> Result<ChangeSet, VcsError> {
        let current = snapshot(&self.root);
        let state = self.state.lock().unwrap();
        let mut files: Vec<String> = current
            .iter()
            .filter(|(path, content)| state.committed.get(*path) != Some(*content))
            .map(|(path, _)| path.clone())
            .collect();
        files.extend(
            state
                .committed
                .keys()
                .filter(|path| !current.contains_key(*path))
                .cloned(),
        );
        files.sort();
        Ok(ChangeSet { files })
    }

    async fn commit(&self, message: &str, changes: &ChangeSet) -> Result<CommitOutcome, VcsError> {
        if let Some(reason) = &self.fail_commit {
            return Err(VcsError::CommandFailed {
                command: "commit".to_string(),
                reason: reason.clone(),
            });
        }
        if changes.is_empty() {
            return Ok(CommitOutcome::NoOp);
        }
        let mut state = self.state.lock().unwrap();
        let id = CommitId(format!("c{}", state.commits.len() + 1));
        state.commits.push((id.clone(), message.to_string()));
        state.committed = snapshot(&self.root);
        Ok(CommitOutcome::Committed(id))
    }

    async fn push(&self, commit: &CommitId, branch: &str) -> Result<(), VcsError> {
        if let Some(reason) = &self.fail_push {
            return Err(VcsError::CommandFailed {
                command: "push".to_string(),
                reason: reason.clone(),
            });
        }
        self.state
            .lock()
            .unwrap()
            .pushes
            .push((commit.clone(), branch.to_string()));
        Ok(())
    }

    async fn revert(&self, commit: &CommitId) -> Result<CommitId, VcsError> {
        let mut state = self.state.lock().unwrap();
        state.reverts.push(commit.clone());
        let subject = state
            .commits
            .iter()
            .find(|(id, _)| id == commit)
            .and_then(|(_, message)| message.lines().next())
            .unwrap_or_default()
            .to_string();
        let id = CommitId(format!("revert-{}", commit));
        // Same shape as `git revert --no-edit`.
        let message = format!("Revert \"{}\"\n\nThis reverts commit {}.\n", subject, commit);
        state.commits.push((id.clone(), message));
        Ok(id)
    }

    async fn find_last_marked_commit(&self, marker: &str) -> Result<Option<CommitId>, VcsError> {
        let state = self.state.lock().unwrap();
        Ok(last_live_marked_commit(
            state.commits.iter().rev().map(|(id, message)| (id, message.as_str())),
            marker,
        ))
    }
}

/// Replays canned responses in order; an empty script reads as an outage.
pub struct ScriptedAi {
    script: Mutex<VecDeque<Result<String, AiError>>>,
    hang: bool,
    cancel_on_call: Mutex<Option<CancelFlag>>,
    calls: AtomicU32,
}

impl ScriptedAi {
    pub fn new(script: Vec<Result<String, AiError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            hang: false,
            cancel_on_call: Mutex::new(None),
            calls: AtomicU32::new(0),
        }
    }

    pub fn responding(text: impl Into<String>) -> Self {
        Self::new(vec![Ok(text.into())])
    }

    /// Never answers.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::new(Vec::new())
        }
    }

    /// Trip `flag` when called, then answer normally.
    pub fn cancel_on_call(&self, flag: CancelFlag) {
        *self.cancel_on_call.lock().unwrap() = Some(flag);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AiGateway for ScriptedAi {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, _prompt: &[Message], _params: &GenerationParams) -> Result<String, AiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(flag) = self.cancel_on_call.lock().unwrap().as_ref() {
            flag.cancel();
        }
        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AiError::Unavailable("script exhausted".to_string())))
    }
}

pub struct FakeDeployer {
    outcome: Result<Deployment, DeployError>,
    health: Result<u16, DeployError>,
    deploys: Mutex<Vec<String>>,
    health_checks: Mutex<Vec<String>>,
}

impl FakeDeployer {
    pub fn succeeding() -> Self {
        Self {
            outcome: Ok(Deployment {
                id: "dpl_1".to_string(),
                url: Some("https://app.example.com".to_string()),
            }),
            health: Ok(200),
            deploys: Mutex::new(Vec::new()),
            health_checks: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            outcome: Err(DeployError::Rejected(reason.to_string())),
            ..Self::succeeding()
        }
    }

    pub fn with_health(mut self, status: u16) -> Self {
        self.health = Ok(status);
        self
    }

    pub fn without_url(mut self) -> Self {
        if let Ok(deployment) = &mut self.outcome {
            deployment.url = None;
        }
        self
    }

    /// Refs passed to `deploy`, in order.
    pub fn deploys(&self) -> Vec<String> {
        self.deploys.lock().unwrap().clone()
    }

    pub fn health_checks(&self) -> Vec<String> {
        self.health_checks.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeployGateway for FakeDeployer {
    async fn deploy(&self, git_ref: &str, _branch: &str) -> Result<Deployment, DeployError> {
        self.deploys.lock().unwrap().push(git_ref.to_string());
        self.outcome.clone()
    }

    async fn health_check(&self, url: &str) -> Result<u16, DeployError> {
        self.health_checks.lock().unwrap().push(url.to_string());
        self.health.clone()
    }
}

#[derive(Default)]
pub struct MemorySink {
    pub requests: Mutex<Vec<Vec<Message>>>,
    pub ai_responses: Mutex<Vec<String>>,
    pub patches: Mutex<Vec<String>>,
    pub deploys: Mutex<Vec<DeployResult>>,
    pub reports: Mutex<Vec<RunStatus>>,
}

impl ArtifactSink for MemorySink {
    fn record_ai_request(&self, _run_id: &str, messages: &[Message]) {
        self.requests.lock().unwrap().push(messages.to_vec());
    }

    fn record_ai_response(&self, _run_id: &str, text: &str) {
        self.ai_responses.lock().unwrap().push(text.to_string());
    }

    fn record_patch(&self, _run_id: &str, patch: &CandidatePatch) {
        self.patches.lock().unwrap().push(patch.text().to_string());
    }

    fn record_deploy_result(&self, _run_id: &str, result: &DeployResult) {
        self.deploys.lock().unwrap().push(result.clone());
    }

    fn record_report(&self, report: &HealReport) {
        self.reports.lock().unwrap().push(report.status.clone());
    }
}
