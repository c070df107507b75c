use serde::{Serialize, Serializer};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HealError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Path escapes the working tree: {0}")]
    PathOutsideTree(String),

    #[error("Illegal state transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error(
        "File {path} has been modified since it was validated. Refusing to apply a stale patch."
    )]
    FileStale { path: String },

    /// A thread panicked while updating the file tracker; its records cannot be trusted.
    #[error("File tracker state is poisoned")]
    TrackerPoisoned,
}

pub type Result<T> = std::result::Result<T, HealError>;

/// Why a heal run ended in failure (or, for `CommitNoOp`, a recognized
/// non-error outcome that still gets reported).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealFailure {
    AiUnavailable,
    NoPatchExtracted,
    PatchInvalid(String),
    ApplyFailed(String),
    CommitNoOp,
    CommitFailed(String),
    PushFailed(String),
    DeployFailed(String),
    VerificationFailed,
    RollbackFailed(String),
    Cancelled,
}

impl HealFailure {
    /// Taxonomy name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            HealFailure::AiUnavailable => "AiUnavailable",
            HealFailure::NoPatchExtracted => "NoPatchExtracted",
            HealFailure::PatchInvalid(_) => "PatchInvalid",
            HealFailure::ApplyFailed(_) => "ApplyFailed",
            HealFailure::CommitNoOp => "CommitNoOp",
            HealFailure::CommitFailed(_) => "CommitFailed",
            HealFailure::PushFailed(_) => "PushFailed",
            HealFailure::DeployFailed(_) => "DeployFailed",
            HealFailure::VerificationFailed => "VerificationFailed",
            HealFailure::RollbackFailed(_) => "RollbackFailed",
            HealFailure::Cancelled => "Cancelled",
        }
    }

    /// The reason surfaced to the caller: the carried detail when there is
    /// one, the taxonomy name otherwise.
    pub fn reason(&self) -> &str {
        match self {
            HealFailure::PatchInvalid(r)
            | HealFailure::ApplyFailed(r)
            | HealFailure::CommitFailed(r)
            | HealFailure::PushFailed(r)
            | HealFailure::DeployFailed(r)
            | HealFailure::RollbackFailed(r) => r,
            other => other.kind(),
        }
    }
}

impl fmt::Display for HealFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealFailure::PatchInvalid(_)
            | HealFailure::ApplyFailed(_)
            | HealFailure::CommitFailed(_)
            | HealFailure::PushFailed(_)
            | HealFailure::DeployFailed(_)
            | HealFailure::RollbackFailed(_) => write!(f, "{}: {}", self.kind(), self.reason()),
            _ => f.write_str(self.kind()),
        }
    }
}

impl Serialize for HealFailure {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("HealFailure", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("reason", self.reason())?;
        s.end()
    }
}
