pub mod cancel;
pub mod prompt;
pub mod report;
pub mod state;

pub use cancel::CancelFlag;
pub use report::{BuildOutcome, BuildStatus, HealAttempt, HealReport, RunStatus};
pub use state::HealState;

use crate::artifacts::ArtifactSink;
use crate::config::HealConfig;
use crate::deploy::{DeployError, DeployGateway, DeployResult};
use crate::error::{HealFailure, Result};
use crate::patch::applicator::{Fallback, PatchApplicator};
use crate::patch::extractor::PatchExtractor;
use crate::patch::validator::{PatchValidator, ValidatedPatch};
use crate::patch::{ApplyResult, ValidationResult};
use crate::providers::retry::retry_with_backoff;
use crate::providers::{self, AiError, AiGateway, GenerationParams};
use crate::vcs::{CommitId, CommitOutcome, VcsError, VcsGateway};
use crate::workspace::{FileAccessTracker, WorkingTree};
use prompt::AiRequest;
use report::{CommitRecord, RollbackRecord, VerificationRecord};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Time limits for one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timings {
    pub gateway_timeout: Duration,
    pub settle_delay: Duration,
    pub ai_retry_delay: Duration,
}

impl Timings {
    pub fn from_config(config: &HealConfig) -> Self {
        Self {
            gateway_timeout: config.gateway_timeout(),
            settle_delay: config.settle_delay(),
            ai_retry_delay: config.ai_retry_delay(),
        }
    }
}

/// Await `fut` for at most `limit`; expiry becomes the error `on_timeout` builds.
async fn bounded<T, E>(
    limit: Duration,
    fut: impl Future<Output = std::result::Result<T, E>>,
    on_timeout: impl FnOnce() -> E,
) -> std::result::Result<T, E> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}

fn vcs_timeout(command: &'static str) -> impl FnOnce() -> VcsError {
    move || VcsError::Timeout {
        command: command.to_string(),
    }
}

/// Drives one CI run from build outcome to a final status: ask the AI for a
/// patch, validate and apply it (or record a fallback marker), commit, push,
/// deploy, verify, and roll back when the deployment turns out bad.
pub struct HealOrchestrator {
    config: HealConfig,
    timings: Timings,
    ai: Arc<dyn AiGateway>,
    vcs: Arc<dyn VcsGateway>,
    deployer: Arc<dyn DeployGateway>,
    sink: Arc<dyn ArtifactSink>,
    extractor: PatchExtractor,
    validator: PatchValidator,
    applicator: PatchApplicator,
    cancel: CancelFlag,
}

impl HealOrchestrator {
    pub fn new(
        config: HealConfig,
        ai: Arc<dyn AiGateway>,
        vcs: Arc<dyn VcsGateway>,
        deployer: Arc<dyn DeployGateway>,
        sink: Arc<dyn ArtifactSink>,
    ) -> Result<Self> {
        Ok(Self {
            timings: Timings::from_config(&config),
            applicator: PatchApplicator::new(config.marker.clone()),
            extractor: PatchExtractor::new()?,
            validator: PatchValidator::new(),
            cancel: CancelFlag::new(),
            config,
            ai,
            vcs,
            deployer,
            sink,
        })
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Handle for stopping the run from elsewhere.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run the full pipeline for one build outcome.
    ///
    /// Gateway failures end up in the report's status; an `Err` here means
    /// the run itself went wrong (an illegal state transition).
    pub async fn run(&self, tree: &WorkingTree, outcome: &BuildOutcome) -> Result<HealReport> {
        let mut attempt = HealAttempt::new(outcome);
        info!(run_id = %attempt.run_id, build = ?outcome.status(), "Heal run started");

        attempt.advance(HealState::BuildRan)?;
        let status = match outcome.status() {
            BuildStatus::Success => {
                attempt.advance(HealState::BuildSucceeded)?;
                if self.config.heal_on_success {
                    self.heal(&mut attempt, tree, outcome).await?
                } else {
                    debug!("Build succeeded, skipping heal");
                    self.deploy_and_verify(&mut attempt, tree, None).await?
                }
            }
            BuildStatus::Failure => {
                attempt.advance(HealState::BuildFailed)?;
                self.heal(&mut attempt, tree, outcome).await?
            }
        };

        let report = attempt.finish(status)?;
        match &report.status {
            RunStatus::Success => info!(run_id = %report.run_id(), "Heal run succeeded"),
            RunStatus::Failure(failure) => {
                warn!(run_id = %report.run_id(), reason = %failure, "Heal run failed")
            }
        }
        self.sink.record_report(&report);
        Ok(report)
    }

    async fn heal(
        &self,
        attempt: &mut HealAttempt,
        tree: &WorkingTree,
        outcome: &BuildOutcome,
    ) -> Result<RunStatus> {
        attempt.healed = true;
        let run_id = attempt.run_id.to_string();

        // Ask
        attempt.advance(HealState::AiRequested)?;
        let context = prompt::load_context(tree, &self.config.ai.context_files);
        let request = AiRequest::build(outcome, &context, self.config.ai.max_log_chars);
        let params = providers::generation_params(&self.config.ai);
        self.sink.record_ai_request(&run_id, &request.messages);
        attempt.ai_request = Some(request.messages.clone());

        let response = match self.request_fix(&request, &params, attempt).await {
            Ok(text) => text,
            Err(AiError::Cancelled) => return Ok(RunStatus::Failure(HealFailure::Cancelled)),
            Err(e) => {
                warn!(error = %e, attempts = attempt.ai_attempts, "AI gateway unavailable");
                return Ok(RunStatus::Failure(HealFailure::AiUnavailable));
            }
        };
        attempt.advance(HealState::AiResponded)?;
        self.sink.record_ai_response(&run_id, &response);
        attempt.ai_response = Some(response.clone());

        // Extract and validate
        let extraction = self.extractor.extract(&response);
        attempt.extraction = extraction.method();
        attempt.extraction_field = extraction.field.clone();
        if let Some(patch) = &extraction.patch {
            self.sink.record_patch(&run_id, patch);
            attempt.patch = Some(patch.text().to_string());
        }

        let tracker = FileAccessTracker::new();
        let (validated, fallback_reason): (Option<ValidatedPatch>, String) = match &extraction.patch {
            None => {
                info!("No patch found in AI response");
                (None, HealFailure::NoPatchExtracted.to_string())
            }
            Some(patch) => {
                let report = self
                    .validator
                    .validate(patch, tree, self.vcs.as_ref(), &tracker)
                    .await;
                attempt.validation = Some(report.result.clone());
                attempt.validation_checks = report.checks.clone();
                match (report.validated(), &report.result) {
                    (Some(_), _) if !self.config.apply_real_fix => {
                        info!("Valid patch ignored, real fixes are disabled");
                        (None, "real fixes disabled by configuration".to_string())
                    }
                    (Some(valid), _) => (Some(valid.clone()), String::new()),
                    (None, result) => {
                        let reason = match result {
                            ValidationResult::Invalid(reason) => reason.clone(),
                            ValidationResult::Valid => "rejected".to_string(),
                        };
                        (None, HealFailure::PatchInvalid(reason).to_string())
                    }
                }
            }
        };
        attempt.advance(if validated.is_some() {
            HealState::PatchValidated
        } else {
            HealState::PatchInvalid
        })?;

        if self.cancel.is_cancelled() {
            warn!("Cancelled before applying changes");
            return Ok(RunStatus::Failure(HealFailure::Cancelled));
        }

        // Apply
        let fallback_path = PathBuf::from(&self.config.fallback_file);
        let fallback = Fallback {
            path: &fallback_path,
            reason: &fallback_reason,
            run_id: &run_id,
        };
        let applied = self
            .applicator
            .apply(validated.as_ref(), &fallback, tree, self.vcs.as_ref(), &tracker)
            .await;
        attempt.apply = Some(applied.clone());

        let summary = match &applied {
            ApplyResult::Applied { files } => {
                attempt.advance(HealState::Applied)?;
                let names: Vec<String> = files.iter().map(|f| f.display().to_string()).collect();
                format!("fix build ({})", names.join(", "))
            }
            ApplyResult::FallbackApplied { path } => {
                attempt.advance(HealState::Fallback)?;
                format!("record unhealed build in {}", path.display())
            }
            ApplyResult::Failed { reason } => {
                return Ok(RunStatus::Failure(HealFailure::ApplyFailed(reason.clone())));
            }
        };

        if self.cancel.is_cancelled() {
            warn!("Cancelled before commit, leaving changes uncommitted");
            return Ok(RunStatus::Failure(HealFailure::Cancelled));
        }

        // Commit and push
        let commit = match self.commit(attempt, &summary).await {
            Ok(commit) => commit,
            Err(failure) => return Ok(RunStatus::Failure(failure)),
        };
        attempt.advance(HealState::Committed)?;

        if let Some(id) = &commit {
            if self.cancel.is_cancelled() {
                warn!("Cancelled before push");
                return Ok(RunStatus::Failure(HealFailure::Cancelled));
            }
            let pushed = bounded(
                self.timings.gateway_timeout,
                self.vcs.push(id, tree.branch()),
                vcs_timeout("push"),
            )
            .await;
            match pushed {
                Ok(()) => info!(commit = %id, branch = tree.branch(), "Pushed heal commit"),
                Err(e) => {
                    warn!(commit = %id, error = %e, "Push failed, deploying anyway");
                    attempt.push_warning = Some(HealFailure::PushFailed(e.reason()));
                }
            }
        }

        self.deploy_and_verify(attempt, tree, commit).await
    }

    async fn request_fix(
        &self,
        request: &AiRequest,
        params: &GenerationParams,
        attempt: &mut HealAttempt,
    ) -> std::result::Result<String, AiError> {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let limit = self.timings.gateway_timeout;

        let result = retry_with_backoff(
            self.config.ai_retry_count,
            self.timings.ai_retry_delay,
            &self.cancel,
            || async move {
                if self.cancel.is_cancelled() {
                    return Err(AiError::Cancelled);
                }
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(attempt = n, gateway = self.ai.name(), "Requesting fix");
                bounded(limit, self.ai.generate(&request.messages, params), || {
                    AiError::Unavailable(format!("no response within {}s", limit.as_secs_f32()))
                })
                .await
            },
        )
        .await;

        attempt.ai_attempts = calls.load(Ordering::SeqCst);
        result
    }

    /// Stage everything and commit it. `Ok(None)` is the empty change set.
    async fn commit(
        &self,
        attempt: &mut HealAttempt,
        summary: &str,
    ) -> std::result::Result<Option<CommitId>, HealFailure> {
        let limit = self.timings.gateway_timeout;

        let changes = match bounded(limit, self.vcs.stage_all(), vcs_timeout("add")).await {
            Ok(changes) => changes,
            Err(e) => {
                attempt.commit = Some(CommitRecord::Failed { reason: e.reason() });
                return Err(HealFailure::CommitFailed(e.reason()));
            }
        };

        let message = format!("{} {}", self.config.marker, summary);
        match bounded(limit, self.vcs.commit(&message, &changes), vcs_timeout("commit")).await {
            Ok(CommitOutcome::Committed(id)) => {
                info!(commit = %id, files = changes.files.len(), "Committed");
                attempt.commit = Some(CommitRecord::Committed {
                    id: id.clone(),
                    files: changes.files,
                });
                Ok(Some(id))
            }
            Ok(CommitOutcome::NoOp) => {
                info!("{}", HealFailure::CommitNoOp);
                attempt.commit = Some(CommitRecord::NoOp);
                Ok(None)
            }
            Err(e) => {
                attempt.commit = Some(CommitRecord::Failed { reason: e.reason() });
                Err(HealFailure::CommitFailed(e.reason()))
            }
        }
    }

    async fn deploy_and_verify(
        &self,
        attempt: &mut HealAttempt,
        tree: &WorkingTree,
        commit: Option<CommitId>,
    ) -> Result<RunStatus> {
        if self.cancel.is_cancelled() {
            warn!("Cancelled before deployment");
            return Ok(RunStatus::Failure(HealFailure::Cancelled));
        }

        let run_id = attempt.run_id.to_string();
        let limit = self.timings.gateway_timeout;
        let git_ref = commit
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| tree.branch().to_string());

        let deployed = bounded(limit, self.deployer.deploy(&git_ref, tree.branch()), || {
            DeployError::Unavailable("deploy request timed out".to_string())
        })
        .await;
        let result = DeployResult::from(&deployed);
        self.sink.record_deploy_result(&run_id, &result);
        attempt.deploy = Some(result);

        let deployment = match deployed {
            Ok(deployment) => deployment,
            Err(e) => {
                let reason = e.reason();
                warn!(git_ref = %git_ref, reason = %reason, "Deployment failed");
                attempt.advance(HealState::RollbackTriggered)?;
                self.rollback(attempt, tree, commit.as_ref()).await;
                return Ok(RunStatus::Failure(HealFailure::DeployFailed(reason)));
            }
        };
        attempt.advance(HealState::Deployed)?;
        info!(id = %deployment.id, url = ?deployment.url, "Deployment triggered");

        let Some(url) = deployment.url.or_else(|| self.config.deploy.health_url.clone()) else {
            warn!("No health URL known, skipping verification");
            attempt.verification = Some(VerificationRecord {
                skipped: true,
                ..Default::default()
            });
            attempt.advance(HealState::Verified)?;
            return Ok(RunStatus::Success);
        };

        if !self.cancel.sleep(self.timings.settle_delay).await {
            warn!("Cancelled while waiting for deployment to settle");
            return Ok(RunStatus::Failure(HealFailure::Cancelled));
        }

        let expected = self.config.deploy.expected_status;
        let mut record = VerificationRecord {
            url: Some(url.clone()),
            ..Default::default()
        };
        match bounded(limit, self.deployer.health_check(&url), || {
            DeployError::Unavailable("health check timed out".to_string())
        })
        .await
        {
            Ok(code) => {
                record.status_code = Some(code);
                record.passed = code == expected;
            }
            Err(e) => record.error = Some(e.to_string()),
        }

        let passed = record.passed;
        info!(url = %url, status = ?record.status_code, expected, passed, "Health check finished");
        attempt.verification = Some(record);

        if passed {
            attempt.advance(HealState::Verified)?;
            Ok(RunStatus::Success)
        } else {
            attempt.advance(HealState::RollbackTriggered)?;
            self.rollback(attempt, tree, commit.as_ref()).await;
            Ok(RunStatus::Failure(HealFailure::VerificationFailed))
        }
    }

    /// Revert this run's commit, or the latest marked one, and push the revert.
    /// Failures are recorded on the attempt and never change the run status.
    async fn rollback(&self, attempt: &mut HealAttempt, tree: &WorkingTree, commit: Option<&CommitId>) {
        let limit = self.timings.gateway_timeout;
        let mut record = RollbackRecord::default();

        let target = match commit {
            Some(id) => Some(id.clone()),
            None => match bounded(
                limit,
                self.vcs.find_last_marked_commit(&self.config.marker),
                vcs_timeout("log"),
            )
            .await
            {
                Ok(found) => found,
                Err(e) => {
                    record.error = Some(HealFailure::RollbackFailed(e.reason()));
                    None
                }
            },
        };

        match target {
            None if record.error.is_none() => {
                record.error = Some(HealFailure::RollbackFailed(format!(
                    "no commit carrying {} to revert",
                    self.config.marker
                )));
            }
            None => {}
            Some(target) => {
                record.target = Some(target.clone());
                match bounded(limit, self.vcs.revert(&target), vcs_timeout("revert")).await {
                    Ok(revert) => {
                        record.revert_commit = Some(revert.clone());
                        match bounded(limit, self.vcs.push(&revert, tree.branch()), vcs_timeout("push"))
                            .await
                        {
                            Ok(()) => record.pushed = true,
                            Err(e) => {
                                record.error = Some(HealFailure::RollbackFailed(format!(
                                    "revert not pushed: {}",
                                    e.reason()
                                )))
                            }
                        }
                    }
                    Err(e) => record.error = Some(HealFailure::RollbackFailed(e.reason())),
                }
            }
        }

        match &record.error {
            Some(err) => error!(error = %err, "Rollback failed"),
            None => info!(reverted = ?record.target, revert = ?record.revert_commit, "Rolled back"),
        }
        attempt.rollback = Some(record);
    }
}
