use super::report::{BuildOutcome, BuildStatus};
use crate::providers::{Message, Role};
use crate::workspace::WorkingTree;
use std::path::PathBuf;
use tracing::debug;

/// Per-file cap on context sent alongside the build log.
const MAX_CONTEXT_FILE_CHARS: usize = 6000;

const FORMAT_CONTRACT: &str = "You are a CI repair bot. You receive the output of a build and \
the contents of relevant repository files. Reply with a single JSON object and nothing else: \
{\"patch\": \"<unified diff>\", \"explanation\": \"<one sentence>\"}. The patch must be a unified \
diff against the repository root using `--- a/<path>` and `+++ b/<path>` headers, with enough \
unchanged context lines for every hunk to apply. If no safe fix exists, reply {\"patch\": \"\"}.";

/// The prompt for one heal run.
#[derive(Debug, Clone)]
pub struct AiRequest {
    pub messages: Vec<Message>,
}

impl AiRequest {
    pub fn build(outcome: &BuildOutcome, context: &[(String, String)], max_log_chars: usize) -> Self {
        let build = match (outcome.status(), outcome.log()) {
            (BuildStatus::Failure, Some(log)) if !log.trim().is_empty() => {
                format!("The build failed. Build output (last part):\n```\n{}\n```", tail(log, max_log_chars))
            }
            (BuildStatus::Failure, _) => "The build failed without producing output.".to_string(),
            (BuildStatus::Success, _) => {
                "The build succeeded. Propose a small, safe improvement, or an empty patch.".to_string()
            }
        };

        let files = if context.is_empty() {
            "No repository files were provided.".to_string()
        } else {
            context
                .iter()
                .map(|(path, content)| format!("--- {} ---\n{}", path, content))
                .collect::<Vec<_>>()
                .join("\n\n")
        };

        Self {
            messages: vec![
                Message {
                    role: Role::System,
                    content: FORMAT_CONTRACT.to_string(),
                },
                Message {
                    role: Role::User,
                    content: format!("{}\n\nRepository files:\n{}", build, files),
                },
            ],
        }
    }
}

/// Read the configured context files that exist; missing ones are skipped.
pub fn load_context(tree: &WorkingTree, files: &[PathBuf]) -> Vec<(String, String)> {
    files
        .iter()
        .filter_map(|path| match tree.read(path) {
            Ok(Some(content)) => Some((
                path.display().to_string(),
                content.chars().take(MAX_CONTEXT_FILE_CHARS).collect(),
            )),
            Ok(None) => {
                debug!(path = %path.display(), "Context file missing, skipping");
                None
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Context file unreadable, skipping");
                None
            }
        })
        .collect()
}

/// The last `max_chars` characters of `log`; build errors cluster at the end.
fn tail(log: &str, max_chars: usize) -> &str {
    let total = log.chars().count();
    if total <= max_chars {
        return log;
    }
    let skip = total - max_chars;
    let start = log.char_indices().nth(skip).map(|(i, _)| i).unwrap_or(0);
    &log[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_prompt_carries_contract_log_and_files() {
        let outcome = BuildOutcome::failure("npm ERR! missing script: build");
        let context = vec![("index.html".to_string(), "<title>old</title>".to_string())];
        let request = AiRequest::build(&outcome, &context, 8000);

        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, Role::System);
        assert!(request.messages[0].content.contains("\"patch\""));
        assert!(request.messages[1].content.contains("missing script: build"));
        assert!(request.messages[1].content.contains("--- index.html ---\n<title>old</title>"));
    }

    #[test]
    fn test_log_is_truncated_from_the_front() {
        let log = format!("{}FINAL ERROR", "x".repeat(100));
        let request = AiRequest::build(&BuildOutcome::failure(log), &[], 11);
        assert!(request.messages[1].content.contains("```\nFINAL ERROR\n```"));
        assert!(!request.messages[1].content.contains("xFINAL"));
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("héllo", 4), "éllo");
        assert_eq!(tail("abc", 10), "abc");
    }

    #[test]
    fn test_load_context_skips_missing_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("index.html"), "<title>old</title>\n").unwrap();
        let tree = WorkingTree::new(dir.path(), "main");

        let context = load_context(
            &tree,
            &[PathBuf::from("index.html"), PathBuf::from("gone.css")],
        );
        assert_eq!(context.len(), 1);
        assert_eq!(context[0].0, "index.html");
    }
}
