use super::state::{HealState, StateTrail};
use crate::deploy::DeployResult;
use crate::error::{HealFailure, Result};
use crate::patch::validator::ValidationCheck;
use crate::patch::{ApplyResult, ExtractionMethod, ValidationResult};
use crate::providers::Message;
use crate::vcs::CommitId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    Failure,
}

/// What the CI build reported. Read-only once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutcome {
    status: BuildStatus,
    log: Option<String>,
}

impl BuildOutcome {
    pub fn new(status: BuildStatus, log: Option<String>) -> Self {
        Self { status, log }
    }

    pub fn success() -> Self {
        Self::new(BuildStatus::Success, None)
    }

    pub fn failure(log: impl Into<String>) -> Self {
        Self::new(BuildStatus::Failure, Some(log.into()))
    }

    pub fn status(&self) -> BuildStatus {
        self.status
    }

    pub fn log(&self) -> Option<&str> {
        self.log.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "failure", rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure(HealFailure),
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Success)
    }

    pub fn failure(&self) -> Option<&HealFailure> {
        match self {
            RunStatus::Success => None,
            RunStatus::Failure(f) => Some(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommitRecord {
    Committed { id: CommitId, files: Vec<String> },
    NoOp,
    Failed { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerificationRecord {
    pub url: Option<String>,
    pub status_code: Option<u16>,
    pub passed: bool,
    /// No health URL was known, so nothing was polled.
    pub skipped: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RollbackRecord {
    pub target: Option<CommitId>,
    pub revert_commit: Option<CommitId>,
    pub pushed: bool,
    pub error: Option<HealFailure>,
}

/// Everything one run observed, filled in as it progresses.
#[derive(Debug, Clone, Serialize)]
pub struct HealAttempt {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub build_status: BuildStatus,
    pub build_log: Option<String>,
    pub healed: bool,
    pub states: StateTrail,
    /// Messages sent to the AI gateway.
    pub ai_request: Option<Vec<Message>>,
    pub ai_attempts: u32,
    pub ai_response: Option<String>,
    /// Text of the extracted candidate patch.
    pub patch: Option<String>,
    pub extraction: Option<ExtractionMethod>,
    pub extraction_field: Option<String>,
    pub validation: Option<ValidationResult>,
    pub validation_checks: Vec<ValidationCheck>,
    pub apply: Option<ApplyResult>,
    pub commit: Option<CommitRecord>,
    /// A failed push of the heal commit. The run carries on.
    pub push_warning: Option<HealFailure>,
    pub deploy: Option<DeployResult>,
    pub verification: Option<VerificationRecord>,
    pub rollback: Option<RollbackRecord>,
}

impl HealAttempt {
    pub fn new(outcome: &BuildOutcome) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            build_status: outcome.status(),
            build_log: outcome.log().map(str::to_string),
            healed: false,
            states: StateTrail::new(),
            ai_request: None,
            ai_attempts: 0,
            ai_response: None,
            patch: None,
            extraction: None,
            extraction_field: None,
            validation: None,
            validation_checks: Vec::new(),
            apply: None,
            commit: None,
            push_warning: None,
            deploy: None,
            verification: None,
            rollback: None,
        }
    }

    pub fn advance(&mut self, to: HealState) -> Result<()> {
        self.states.advance(to)
    }

    pub fn finish(mut self, status: RunStatus) -> Result<HealReport> {
        self.advance(HealState::Done)?;
        Ok(HealReport {
            attempt: self,
            finished_at: Utc::now(),
            status,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealReport {
    #[serde(flatten)]
    pub attempt: HealAttempt,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
}

impl HealReport {
    pub fn run_id(&self) -> String {
        self.attempt.run_id.to_string()
    }

    pub fn states(&self) -> &[HealState] {
        self.attempt.states.visited()
    }

    #[cfg(test)]
    pub fn visited(&self, state: HealState) -> bool {
        self.attempt.states.contains(state)
    }
}
