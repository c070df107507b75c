mod artifacts;
mod config;
mod deploy;
mod error;
#[cfg(test)]
mod fakes;
mod heal;
mod patch;
mod providers;
mod vcs;
mod workspace;

use anyhow::{Context, Result};
use artifacts::FsArtifactSink;
use clap::{Args, Parser, Subcommand, ValueEnum};
use config::{ConfigManager, HealConfig};
use deploy::WebhookDeployer;
use heal::{BuildOutcome, BuildStatus, HealOrchestrator, HealReport, RunStatus};
use patch::extractor::PatchExtractor;
use patch::validator::PatchValidator;
use patch::{CandidatePatch, ExtractionMethod};
use providers::AiGateway;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use vcs::{GitCli, VcsGateway};
use workspace::{FileAccessTracker, WorkingTree};

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Parser)]
#[command(name = "autoheal", version, about = "Autoheal - AI-assisted CI repair")]
struct Cli {
    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one heal attempt for a finished build
    Run(RunArgs),
    /// Extract a patch from a saved AI response
    Extract {
        /// File holding the raw response text
        file: PathBuf,
    },
    /// Dry-run a patch against a working tree
    Validate {
        /// Unified diff to check
        patch: PathBuf,
        /// Working tree (defaults to `repo_path` from config)
        #[arg(long)]
        repo: Option<PathBuf>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show system info (version, platform, etc.)
    Info,
}

#[derive(Args)]
struct RunArgs {
    /// Outcome of the build that just ran
    #[arg(long, value_enum, default_value = "failure")]
    build_status: BuildStatusArg,

    /// Captured build output
    #[arg(long)]
    build_log: Option<PathBuf>,

    /// Working tree to heal
    #[arg(long)]
    repo: Option<PathBuf>,

    /// Clone from this URL when the working tree does not exist yet
    #[arg(long)]
    remote: Option<String>,

    /// Branch to commit, push and deploy
    #[arg(long)]
    branch: Option<String>,

    /// Ask the AI for a patch even when the build succeeded
    #[arg(long)]
    heal_on_success: bool,

    /// Never apply AI patches; only record the fallback marker
    #[arg(long)]
    no_real_fix: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum BuildStatusArg {
    Success,
    Failure,
}

impl From<BuildStatusArg> for BuildStatus {
    fn from(arg: BuildStatusArg) -> Self {
        match arg {
            BuildStatusArg::Success => BuildStatus::Success,
            BuildStatusArg::Failure => BuildStatus::Failure,
        }
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration (secrets redacted)
    Show,
    /// Print the config file location
    Path,
    /// Write a config file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// JSON envelope for non-interactive output
fn json_output(success: bool, data: serde_json::Value, error: Option<&str>) -> String {
    serde_json::json!({
        "success": success,
        "data": data,
        "error": error,
    })
    .to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Check for --json flag before initializing logging
    let json_mode = std::env::args().any(|arg| arg == "--json");

    // Initialize structured logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("autoheal=info"));

    if json_mode {
        // In JSON mode: send logs to stderr with no ANSI colors
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_ansi(false)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    } else if std::env::var("AUTOHEAL_LOG_JSON").is_ok() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }

    let cli = Cli::parse();
    let succeeded = run_command(cli.command, cli.config.as_deref(), cli.json).await?;
    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

// ============================================================================
// Command Runner
// ============================================================================

/// Returns whether the command achieved what it was asked to do.
async fn run_command(command: Commands, config_path: Option<&Path>, json_mode: bool) -> Result<bool> {
    match command {
        Commands::Info => {
            let version = env!("CARGO_PKG_VERSION");
            let platform = std::env::consts::OS;
            if json_mode {
                println!(
                    "{}",
                    json_output(
                        true,
                        serde_json::json!({
                            "version": version,
                            "platform": platform,
                            "name": "autoheal",
                        }),
                        None
                    )
                );
            } else {
                println!("Autoheal v{}", version);
                println!("Platform: {}", platform);
            }
            Ok(true)
        }
        Commands::Config { action } => run_config(action, config_path, json_mode),
        Commands::Extract { file } => {
            let response = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let extraction = PatchExtractor::new()?.extract(&response);
            let found = extraction.patch.is_some();

            if json_mode {
                let data = serde_json::json!({
                    "method": extraction.method(),
                    "field": extraction.field,
                    "patch": extraction.patch.as_ref().map(|p| p.text()),
                });
                let error = (!found).then_some("NoPatchExtracted");
                println!("{}", json_output(found, data, error));
            } else {
                match &extraction.patch {
                    Some(patch) => {
                        eprintln!("Extracted via {}", patch.method());
                        print!("{}", patch.text());
                    }
                    None => println!("No patch found"),
                }
            }
            Ok(found)
        }
        Commands::Validate { patch, repo } => {
            let config = ConfigManager::load(config_path)?;
            let text = tokio::fs::read_to_string(&patch)
                .await
                .with_context(|| format!("Failed to read {}", patch.display()))?;
            let candidate = CandidatePatch::new(text, ExtractionMethod::RawHeuristic)
                .with_context(|| format!("{} is empty", patch.display()))?;

            let root = repo.unwrap_or_else(|| config.repo_path.clone());
            let tree = WorkingTree::new(&root, &config.branch);
            let git = GitCli::new(&root, config.git.clone(), config.gateway_timeout());
            let report = PatchValidator::new()
                .validate(&candidate, &tree, &git, &FileAccessTracker::new())
                .await;
            let valid = report.result.is_valid();

            if json_mode {
                let data = serde_json::json!({
                    "result": report.result,
                    "checks": report.checks,
                });
                let error = match &report.result {
                    patch::ValidationResult::Invalid(reason) => Some(reason.as_str()),
                    patch::ValidationResult::Valid => None,
                };
                println!("{}", json_output(valid, data, error));
            } else {
                for check in &report.checks {
                    let mark = if check.passed { "ok" } else { "FAILED" };
                    println!("  [{}] {}: {}", mark, check.name, check.message);
                }
                println!("{}", if valid { "Patch is valid" } else { "Patch is invalid" });
            }
            Ok(valid)
        }
        Commands::Run(args) => run_heal(args, config_path, json_mode).await,
    }
}

fn run_config(action: ConfigAction, config_path: Option<&Path>, json_mode: bool) -> Result<bool> {
    match action {
        ConfigAction::Show => {
            let config = ConfigManager::load(config_path)?;
            if json_mode {
                println!(
                    "{}",
                    json_output(true, serde_json::to_value(config.redacted())?, None)
                );
            } else {
                print!("{}", ConfigManager::render(&config)?);
            }
        }
        ConfigAction::Path => {
            let path = match config_path {
                Some(p) => p.to_path_buf(),
                None => ConfigManager::default_config_path()?,
            };
            if json_mode {
                println!(
                    "{}",
                    json_output(
                        true,
                        serde_json::json!({ "path": path, "exists": path.exists() }),
                        None
                    )
                );
            } else {
                println!("{}", path.display());
            }
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(p) => p.to_path_buf(),
                None => ConfigManager::default_config_path()?,
            };
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            ConfigManager::save(&HealConfig::default(), &path)?;
            if json_mode {
                println!("{}", json_output(true, serde_json::json!({ "path": path }), None));
            } else {
                println!("Wrote {}", path.display());
            }
        }
    }
    Ok(true)
}

/// The artifacts directory relative to the repository root, when it lies inside it.
fn artifacts_inside_repo(repo: &Path, artifacts: &Path) -> Option<String> {
    let repo = std::fs::canonicalize(repo).ok()?;
    let artifacts = std::fs::canonicalize(artifacts).ok()?;
    let relative = artifacts.strip_prefix(&repo).ok()?;
    if relative.as_os_str().is_empty() {
        return None;
    }
    Some(relative.to_string_lossy().replace('\\', "/"))
}

async fn run_heal(args: RunArgs, config_path: Option<&Path>, json_mode: bool) -> Result<bool> {
    let mut config = ConfigManager::load(config_path)?;
    if let Some(repo) = args.repo {
        config.repo_path = repo;
    }
    if let Some(remote) = args.remote {
        config.git.clone_url = Some(remote);
    }
    if let Some(branch) = args.branch {
        config.branch = branch;
    }
    if args.heal_on_success {
        config.heal_on_success = true;
    }
    if args.no_real_fix {
        config.apply_real_fix = false;
    }
    config.validate()?;

    let build_log = match &args.build_log {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read build log {}", path.display()))?,
        ),
        None => None,
    };
    let outcome = BuildOutcome::new(args.build_status.into(), build_log);

    let timeout = config.gateway_timeout();
    let git = GitCli::new(&config.repo_path, config.git.clone(), timeout);
    let tree = git
        .checkout(config.git.clone_url.as_deref().unwrap_or_default(), &config.branch)
        .await?;

    tokio::fs::create_dir_all(&config.artifacts_dir).await?;
    let excludes: Vec<String> = artifacts_inside_repo(tree.root(), &config.artifacts_dir)
        .into_iter()
        .collect();
    let git = git.with_excludes(excludes);

    let ai: Arc<dyn AiGateway> = Arc::from(providers::create_gateway(&config.ai, timeout)?);
    let deployer = Arc::new(WebhookDeployer::new(&config.deploy, timeout)?);
    let artifacts = FsArtifactSink::new(&config.artifacts_dir);
    let sink = Arc::new(artifacts.clone());

    info!(
        repo = %tree.root().display(),
        branch = tree.branch(),
        provider = ai.name(),
        "Starting heal run"
    );
    let orchestrator = HealOrchestrator::new(config, ai, Arc::new(git), deployer, sink)?;

    let cancel = orchestrator.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let report = orchestrator.run(&tree, &outcome).await?;
    print_report(&report, &artifacts.run_dir(&report.run_id()), json_mode)?;
    Ok(report.status.is_success())
}

fn print_report(report: &HealReport, run_dir: &Path, json_mode: bool) -> Result<()> {
    let failure = report.status.failure().map(|f| f.reason().to_string());

    if json_mode {
        println!(
            "{}",
            json_output(
                report.status.is_success(),
                serde_json::to_value(report)?,
                failure.as_deref()
            )
        );
        return Ok(());
    }

    let states: Vec<String> = report.states().iter().map(|s| s.to_string()).collect();
    println!("Run {}", report.run_id());
    println!("  States:    {}", states.join(" -> "));
    if let Some(method) = report.attempt.extraction {
        println!("  Extracted: {}", method);
    }
    if let Some(warning) = &report.attempt.push_warning {
        println!("  Warning:   {}", warning);
    }
    if let Some(rollback) = &report.attempt.rollback {
        match &rollback.error {
            Some(err) => println!("  Rollback:  {}", err),
            None => println!(
                "  Rollback:  reverted {}",
                rollback.target.as_ref().map(|t| t.to_string()).unwrap_or_default()
            ),
        }
    }
    println!("  Artifacts: {}", run_dir.display());
    match &report.status {
        RunStatus::Success => println!("Result: SUCCESS"),
        RunStatus::Failure(f) => println!("Result: FAILURE ({})", f),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "autoheal",
            "--json",
            "run",
            "--build-status",
            "success",
            "--branch",
            "release",
            "--heal-on-success",
        ])
        .unwrap();

        assert!(cli.json);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(matches!(args.build_status, BuildStatusArg::Success));
        assert_eq!(args.branch.as_deref(), Some("release"));
        assert!(args.heal_on_success);
        assert!(!args.no_real_fix);
    }

    #[test]
    fn test_json_envelope() {
        let out: serde_json::Value =
            serde_json::from_str(&json_output(false, serde_json::json!({}), Some("AiUnavailable")))
                .unwrap();
        assert_eq!(out["success"], false);
        assert_eq!(out["error"], "AiUnavailable");
    }

    #[test]
    fn test_artifacts_inside_repo() {
        let dir = TempDir::new().unwrap();
        let inside = dir.path().join("out/artifacts");
        std::fs::create_dir_all(&inside).unwrap();
        assert_eq!(
            artifacts_inside_repo(dir.path(), &inside).as_deref(),
            Some("out/artifacts")
        );

        let elsewhere = TempDir::new().unwrap();
        assert_eq!(artifacts_inside_repo(dir.path(), elsewhere.path()), None);
    }
}
