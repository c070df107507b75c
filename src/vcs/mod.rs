pub mod git;

pub use git::GitCli;

use crate::workspace::WorkingTree;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VcsError {
    #[error("repo not found: {path}")]
    RepoNotFound { path: String },
    #[error("`git {command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },
    #[error("`git {command}` timed out")]
    Timeout { command: String },
    #[error("backend error: {reason}")]
    BackendError { reason: String },
}

impl VcsError {
    /// Short human-readable cause, without the command prefix.
    pub fn reason(&self) -> String {
        match self {
            VcsError::CommandFailed { reason, .. } | VcsError::BackendError { reason } => {
                reason.clone()
            }
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for VcsError {
    fn from(err: std::io::Error) -> Self {
        VcsError::BackendError {
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CommitId(pub String);

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Files staged for the next commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    pub files: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed(CommitId),
    /// The staged change set was empty.
    NoOp,
}

/// Trailer git writes into the body of every revert commit.
const REVERTS_TRAILER: &str = "This reverts commit ";

/// The commit a revert message undoes, if `message` is a revert.
pub fn reverted_commit(message: &str) -> Option<&str> {
    let rest = &message[message.find(REVERTS_TRAILER)? + REVERTS_TRAILER.len()..];
    let id = rest
        .split_whitespace()
        .next()?
        .trim_end_matches('.');
    (!id.is_empty()).then_some(id)
}

/// Pick the rollback target from `history` (newest first): the newest commit
/// carrying `marker` that is neither a revert nor already reverted.
///
/// Revert messages quote the reverted subject, so they carry the marker too.
pub fn last_live_marked_commit<'a>(
    history: impl IntoIterator<Item = (&'a CommitId, &'a str)>,
    marker: &str,
) -> Option<CommitId> {
    let history: Vec<_> = history.into_iter().collect();
    let reverted: HashSet<&str> = history
        .iter()
        .filter_map(|(_, message)| reverted_commit(message))
        .collect();

    history
        .iter()
        .filter(|(_, message)| message.contains(marker))
        .filter(|(_, message)| reverted_commit(message).is_none() && !message.starts_with("Revert \""))
        .find(|(id, _)| !reverted.contains(id.0.as_str()))
        .map(|(id, _)| (*id).clone())
}

#[async_trait]
pub trait VcsGateway: Send + Sync {
    /// Make `branch` of `repo_ref` available locally. An empty `repo_ref`
    /// means the tree is already checked out.
    async fn checkout(&self, repo_ref: &str, branch: &str) -> Result<WorkingTree, VcsError>;

    /// Whether the patch would apply cleanly. Never modifies the tree.
    async fn apply_check(&self, patch: &str) -> Result<bool, VcsError>;

    async fn apply(&self, patch: &str) -> Result<(), VcsError>;

    async fn stage_all(&self) -> Result<ChangeSet, VcsError>;

    async fn commit(&self, message: &str, changes: &ChangeSet) -> Result<CommitOutcome, VcsError>;

    async fn push(&self, commit: &CommitId, branch: &str) -> Result<(), VcsError>;

    /// Create a commit undoing `commit` and return its id.
    async fn revert(&self, commit: &CommitId) -> Result<CommitId, VcsError>;

    /// Most recent commit whose message contains `marker`, skipping reverts
    /// and commits that have already been reverted.
    async fn find_last_marked_commit(&self, marker: &str) -> Result<Option<CommitId>, VcsError>;
}
