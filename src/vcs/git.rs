use super::{ChangeSet, CommitId, CommitOutcome, VcsError, VcsGateway, last_live_marked_commit};
use crate::config::GitConfig;
use crate::workspace::WorkingTree;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl GitOutput {
    fn failure_reason(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        text.lines().last().unwrap_or("unknown error").to_string()
    }

    /// The `CONFLICT` or `error:` line of a failed merge-like command,
    /// falling back to the last line of output.
    fn conflict_reason(&self) -> String {
        let lines = || self.stdout.lines().chain(self.stderr.lines()).map(str::trim);
        lines()
            .find(|l| l.starts_with("CONFLICT"))
            .or_else(|| lines().find(|l| l.starts_with("error:")))
            .map(str::to_string)
            .unwrap_or_else(|| self.failure_reason())
    }
}

/// The git subcommand in `args`, skipping `-c key=value` options.
fn subcommand(args: &[&str]) -> String {
    args.iter()
        .copied()
        .find(|a| !a.starts_with('-') && !a.contains('='))
        .unwrap_or("git")
        .to_string()
}

/// Version control through the `git` command line.
pub struct GitCli {
    root: PathBuf,
    config: GitConfig,
    timeout: Duration,
    /// Repository-relative paths never staged (e.g. the artifacts directory).
    excludes: Vec<String>,
}

impl GitCli {
    pub fn new(root: impl Into<PathBuf>, config: GitConfig, timeout: Duration) -> Self {
        Self {
            root: root.into(),
            config,
            timeout,
            excludes: Vec::new(),
        }
    }

    pub fn with_excludes(mut self, excludes: Vec<String>) -> Self {
        self.excludes = excludes;
        self
    }

    fn identity_args(&self) -> [String; 4] {
        [
            "-c".to_string(),
            format!("user.name={}", self.config.author_name),
            "-c".to_string(),
            format!("user.email={}", self.config.author_email),
        ]
    }

    async fn run(
        &self,
        args: &[&str],
        stdin: Option<&str>,
        cwd: Option<&Path>,
    ) -> Result<GitOutput, VcsError> {
        let command = subcommand(args);
        let start = Instant::now();

        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(cwd.unwrap_or(&self.root))
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| VcsError::BackendError {
            reason: format!("failed to spawn git: {}", e),
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            if !input.ends_with('\n') {
                pipe.write_all(b"\n").await?;
            }
            pipe.shutdown().await?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| VcsError::Timeout {
                command: command.clone(),
            })??;

        debug!(
            command = %command,
            status = ?output.status.code(),
            duration_ms = start.elapsed().as_millis() as u64,
            "git finished"
        );

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Run and require a zero exit status.
    async fn run_ok(&self, args: &[&str], stdin: Option<&str>) -> Result<String, VcsError> {
        let output = self.run(args, stdin, None).await?;
        if !output.success {
            return Err(VcsError::CommandFailed {
                command: subcommand(args),
                reason: output.failure_reason(),
            });
        }
        Ok(output.stdout)
    }

    async fn head(&self) -> Result<CommitId, VcsError> {
        let out = self.run_ok(&["rev-parse", "HEAD"], None).await?;
        Ok(CommitId(out.trim().to_string()))
    }
}

#[async_trait]
impl VcsGateway for GitCli {
    async fn checkout(&self, repo_ref: &str, branch: &str) -> Result<WorkingTree, VcsError> {
        if !self.root.join(".git").exists() {
            if repo_ref.is_empty() {
                return Err(VcsError::RepoNotFound {
                    path: self.root.display().to_string(),
                });
            }

            let parent = self
                .root
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            tokio::fs::create_dir_all(parent).await?;

            // git runs from the parent, so clone into the root's own name
            let target = self
                .root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.root.display().to_string());
            info!(repo = %repo_ref, branch, into = %self.root.display(), "Cloning repository");
            let output = self
                .run(
                    &["clone", "--branch", branch, repo_ref, target.as_str()],
                    None,
                    Some(parent),
                )
                .await?;
            if !output.success {
                return Err(VcsError::CommandFailed {
                    command: "clone".to_string(),
                    reason: output.failure_reason(),
                });
            }
        } else {
            self.run_ok(&["checkout", branch], None).await?;
        }

        Ok(WorkingTree::new(self.root.clone(), branch))
    }

    async fn apply_check(&self, patch: &str) -> Result<bool, VcsError> {
        let output = self
            .run(
                &["apply", "--check", "--recount", "--ignore-whitespace", "-"],
                Some(patch),
                None,
            )
            .await?;
        if !output.success {
            debug!(reason = %output.failure_reason(), "git apply --check rejected patch");
        }
        Ok(output.success)
    }

    async fn apply(&self, patch: &str) -> Result<(), VcsError> {
        self.run_ok(
            &["apply", "--recount", "--ignore-whitespace", "-"],
            Some(patch),
        )
        .await?;
        Ok(())
    }

    async fn stage_all(&self) -> Result<ChangeSet, VcsError> {
        let pathspecs: Vec<String> = self
            .excludes
            .iter()
            .map(|p| format!(":(exclude){}", p))
            .collect();
        let mut args = vec!["add", "-A", "--", "."];
        args.extend(pathspecs.iter().map(String::as_str));
        self.run_ok(&args, None).await?;
        let out = self
            .run_ok(&["diff", "--cached", "--name-only"], None)
            .await?;
        Ok(ChangeSet {
            files: out
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }

    async fn commit(&self, message: &str, changes: &ChangeSet) -> Result<CommitOutcome, VcsError> {
        if changes.is_empty() {
            return Ok(CommitOutcome::NoOp);
        }

        let identity = self.identity_args();
        let mut args: Vec<&str> = identity.iter().map(String::as_str).collect();
        args.extend(["commit", "-m", message]);

        let output = self.run(&args, None, None).await?;
        if !output.success {
            if output.stdout.contains("nothing to commit") {
                return Ok(CommitOutcome::NoOp);
            }
            return Err(VcsError::CommandFailed {
                command: "commit".to_string(),
                reason: output.failure_reason(),
            });
        }

        Ok(CommitOutcome::Committed(self.head().await?))
    }

    async fn push(&self, commit: &CommitId, branch: &str) -> Result<(), VcsError> {
        let refspec = format!("{}:refs/heads/{}", commit, branch);
        self.run_ok(&["push", self.config.remote.as_str(), refspec.as_str()], None)
            .await?;
        Ok(())
    }

    async fn revert(&self, commit: &CommitId) -> Result<CommitId, VcsError> {
        let identity = self.identity_args();
        let mut args: Vec<&str> = identity.iter().map(String::as_str).collect();
        args.extend(["revert", "--no-edit", commit.0.as_str()]);

        let output = self.run(&args, None, None).await?;
        if !output.success {
            let reason = output.conflict_reason();
            if let Err(e) = self.run_ok(&["revert", "--abort"], None).await {
                warn!(error = %e, "Could not abort failed revert");
            }
            return Err(VcsError::CommandFailed {
                command: "revert".to_string(),
                reason,
            });
        }
        self.head().await
    }

    async fn find_last_marked_commit(&self, marker: &str) -> Result<Option<CommitId>, VcsError> {
        // Reverts are listed too so already-reverted commits can be skipped.
        let grep = format!("--grep={}", marker);
        let out = self
            .run_ok(
                &[
                    "log",
                    "--fixed-strings",
                    grep.as_str(),
                    "--grep=This reverts commit ",
                    "--format=%H%x1f%B%x1e",
                ],
                None,
            )
            .await?;

        let history: Vec<(CommitId, &str)> = out
            .split('\x1e')
            .filter_map(|record| record.trim().split_once('\x1f'))
            .map(|(id, message)| (CommitId(id.trim().to_string()), message))
            .collect();
        Ok(last_live_marked_commit(
            history.iter().map(|(id, message)| (id, *message)),
            marker,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn git_available() -> bool {
        StdCommand::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-q"],
            vec!["symbolic-ref", "HEAD", "refs/heads/main"],
        ] {
            let status = StdCommand::new("git")
                .args(&args)
                .current_dir(dir)
                .status()
                .unwrap();
            assert!(status.success());
        }
    }

    fn cli(dir: &Path) -> GitCli {
        GitCli::new(dir, GitConfig::default(), Duration::from_secs(30))
    }

    async fn seed(git: &GitCli, dir: &Path) -> CommitId {
        std::fs::write(dir.join("index.html"), "<title>old</title>\n").unwrap();
        let changes = git.stage_all().await.unwrap();
        match git.commit("initial", &changes).await.unwrap() {
            CommitOutcome::Committed(id) => id,
            CommitOutcome::NoOp => panic!("expected a commit"),
        }
    }

    const FIX: &str = "--- a/index.html\n+++ b/index.html\n@@ -1 +1 @@\n-<title>old</title>\n+<title>new</title>\n";

    #[tokio::test]
    async fn test_checkout_without_repo_or_url() {
        let dir = TempDir::new().unwrap();
        let git = cli(dir.path());
        let err = git.checkout("", "main").await.unwrap_err();
        assert!(matches!(err, VcsError::RepoNotFound { .. }));
    }

    #[tokio::test]
    async fn test_apply_commit_and_find_marker() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let git = cli(dir.path());
        seed(&git, dir.path()).await;

        assert!(git.apply_check(FIX).await.unwrap());
        assert!(!git.apply_check("--- a/index.html\n+++ b/index.html\n@@ -1 +1 @@\n-nope\n+x\n").await.unwrap());
        // the check leaves the tree alone
        assert_eq!(
            std::fs::read_to_string(dir.path().join("index.html")).unwrap(),
            "<title>old</title>\n"
        );

        git.apply(FIX).await.unwrap();
        let changes = git.stage_all().await.unwrap();
        assert_eq!(changes.files, vec!["index.html".to_string()]);

        let CommitOutcome::Committed(id) = git.commit("[auto-heal] fix title", &changes).await.unwrap() else {
            panic!("expected a commit");
        };
        assert_eq!(git.find_last_marked_commit("[auto-heal]").await.unwrap(), Some(id.clone()));

        let revert = git.revert(&id).await.unwrap();
        assert_ne!(revert, id);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("index.html")).unwrap(),
            "<title>old</title>\n"
        );
    }

    fn commit_all(git_dir: &Path, message: &str) -> CommitId {
        for args in [
            vec!["add", "-A"],
            vec!["-c", "user.name=t", "-c", "user.email=t@example.com", "commit", "-q", "-m", message],
        ] {
            assert!(StdCommand::new("git").args(&args).current_dir(git_dir).status().unwrap().success());
        }
        let out = StdCommand::new("git").args(["rev-parse", "HEAD"]).current_dir(git_dir).output().unwrap();
        CommitId(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    #[tokio::test]
    async fn test_marker_search_skips_reverts() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let git = cli(dir.path());
        seed(&git, dir.path()).await;

        std::fs::write(dir.path().join("index.html"), "first fix\n").unwrap();
        let first = commit_all(dir.path(), "[auto-heal] fix build (index.html)");
        std::fs::write(dir.path().join("index.html"), "bad fix\n").unwrap();
        let second = commit_all(dir.path(), "[auto-heal] fix build (index.html)");

        git.revert(&second).await.unwrap();
        assert_eq!(git.find_last_marked_commit("[auto-heal]").await.unwrap(), Some(first.clone()));

        git.revert(&first).await.unwrap();
        assert_eq!(git.find_last_marked_commit("[auto-heal]").await.unwrap(), None);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("index.html")).unwrap(),
            "<title>old</title>\n"
        );
    }

    #[tokio::test]
    async fn test_conflicting_revert_is_aborted() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let git = cli(dir.path());
        seed(&git, dir.path()).await;

        std::fs::write(dir.path().join("index.html"), "healed\n").unwrap();
        let heal = commit_all(dir.path(), "[auto-heal] fix build (index.html)");
        std::fs::write(dir.path().join("index.html"), "edited later\n").unwrap();
        commit_all(dir.path(), "manual edit");

        let err = git.revert(&heal).await.unwrap_err();
        let VcsError::CommandFailed { command, reason } = err else {
            panic!("expected a command failure");
        };
        assert_eq!(command, "revert");
        assert!(reason.starts_with("CONFLICT") || reason.starts_with("error:"), "{}", reason);
        assert!(!reason.starts_with("hint:"));
        assert!(!dir.path().join(".git/REVERT_HEAD").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("index.html")).unwrap(),
            "edited later\n"
        );
    }

    #[tokio::test]
    async fn test_failed_command_names_only_the_subcommand() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let git = cli(dir.path());
        seed(&git, dir.path()).await;

        let err = git.revert(&CommitId("0000000000000000000000000000000000000000".into())).await.unwrap_err();
        let VcsError::CommandFailed { command, .. } = err else {
            panic!("expected a command failure");
        };
        assert_eq!(command, "revert");
        assert_eq!(subcommand(&["-c", "user.name=x", "-c", "user.email=y", "commit", "-m", "msg"]), "commit");
    }

    #[tokio::test]
    async fn test_commit_with_nothing_staged_is_noop() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let git = cli(dir.path());
        seed(&git, dir.path()).await;

        let changes = git.stage_all().await.unwrap();
        assert!(changes.is_empty());
        assert_eq!(git.commit("noop", &changes).await.unwrap(), CommitOutcome::NoOp);
        assert_eq!(git.find_last_marked_commit("[auto-heal]").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stage_all_skips_excluded_paths() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let git = cli(dir.path()).with_excludes(vec!["autoheal-artifacts".to_string()]);
        seed(&git, dir.path()).await;

        std::fs::create_dir_all(dir.path().join("autoheal-artifacts/run-1")).unwrap();
        std::fs::write(dir.path().join("autoheal-artifacts/run-1/report.json"), "{}").unwrap();
        std::fs::write(dir.path().join("AUTOHEAL.md"), "[auto-heal] marker\n").unwrap();

        let changes = git.stage_all().await.unwrap();
        assert_eq!(changes.files, vec!["AUTOHEAL.md".to_string()]);
    }

    #[tokio::test]
    async fn test_push_without_remote_fails() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let git = cli(dir.path());
        let id = seed(&git, dir.path()).await;

        let err = git.push(&id, "main").await.unwrap_err();
        assert!(matches!(err, VcsError::CommandFailed { .. }));
    }
}
