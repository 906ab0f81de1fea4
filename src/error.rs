use std::path::PathBuf;
use std::time::Duration;

use crate::item::ItemState;

pub type Result<T> = std::result::Result<T, WreckitError>;

/// Error taxonomy for the orchestration kernel.
///
/// Categories:
/// - Startup: halt immediately (RepoNotFound, ConfigError)
/// - Phase: converted to a `PhaseOutcome` by the phase runner, item unchanged
/// - Quality: phase failure carrying a defect list
/// - Interrupted: exits with code 130
#[derive(Debug, thiserror::Error)]
pub enum WreckitError {
    #[error("Repository not found at {0}")]
    RepoNotFound(PathBuf),

    #[error("Invalid JSON in {path}: {detail}")]
    InvalidJson { path: PathBuf, detail: String },

    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Resource busy: could not acquire {path} within {timeout:?}")]
    ResourceBusy { path: PathBuf, timeout: Duration },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Phase validation failed: {0}")]
    PhaseValidation(String),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: ItemState, to: ItemState },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Agent did not create required artifact '{artifact}' for item {item}")]
    ArtifactNotCreated { item: String, artifact: String },

    #[error("Research quality check failed: {}", defects.join("; "))]
    ResearchQuality { defects: Vec<String> },

    #[error("Plan quality check failed: {}", defects.join("; "))]
    PlanQuality { defects: Vec<String> },

    #[error("Story quality check failed: {}", defects.join("; "))]
    StoryQuality { defects: Vec<String> },

    #[error("Agent timed out after {0:?}")]
    Timeout(Duration),

    #[error("Interrupted")]
    Interrupted,

    #[error("Branch operation failed: {0}")]
    BranchError(String),

    #[error("Push failed: {0}")]
    PushError(String),

    #[error("Pull request creation failed: {0}")]
    PrCreationError(String),

    #[error("Merge conflict: {0}")]
    MergeConflict(String),

    #[error("Concurrent modification of item {item}: {detail}")]
    ConcurrentModification { item: String, detail: String },

    #[error("I/O error on {path}: {detail}")]
    Io { path: PathBuf, detail: String },
}

impl WreckitError {
    /// One-line remediation hint shown alongside user-visible errors.
    pub fn hint(&self) -> &'static str {
        match self {
            WreckitError::RepoNotFound(_) => "Run `wreckit init` first",
            WreckitError::InvalidJson { .. } => "Run `wreckit doctor` to diagnose corruption",
            WreckitError::SchemaValidation(_) => "Run `wreckit doctor` to diagnose corruption",
            WreckitError::FileNotFound(_) => "Check the path, or run `wreckit doctor`",
            WreckitError::ResourceBusy { .. } => {
                "Another wreckit process holds the lock; retry or run `wreckit doctor`"
            }
            WreckitError::ConfigError(_) => "Fix .wreckit/config.json and retry",
            WreckitError::PhaseValidation(_) => "Check the item state with `wreckit status`",
            WreckitError::InvalidTransition { .. } => {
                "Check the item state with `wreckit status`"
            }
            WreckitError::InvalidState(_) => "Run `wreckit doctor --fix` to reset the state",
            WreckitError::ArtifactNotCreated { .. } => "Re-run the phase",
            WreckitError::ResearchQuality { .. }
            | WreckitError::PlanQuality { .. }
            | WreckitError::StoryQuality { .. } => "Re-run the phase to regenerate the artifact",
            WreckitError::Timeout(_) => "Raise timeout_seconds in config.json or retry",
            WreckitError::Interrupted => "Re-run to resume from the last persisted state",
            WreckitError::BranchError(_)
            | WreckitError::PushError(_)
            | WreckitError::PrCreationError(_) => "Check git remote access and retry",
            WreckitError::MergeConflict(_) => "Resolve the conflict manually, then retry",
            WreckitError::ConcurrentModification { .. } => {
                "Another process touched the item; run `wreckit doctor`"
            }
            WreckitError::Io { .. } => "Check filesystem permissions and disk space",
        }
    }

    /// Process exit code for this error when it reaches `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            WreckitError::Interrupted => 130,
            _ => 1,
        }
    }

    /// Helper for wrapping filesystem errors with their path.
    pub fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        let path = path.into();
        if err.kind() == std::io::ErrorKind::NotFound {
            WreckitError::FileNotFound(path)
        } else {
            WreckitError::Io {
                path,
                detail: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupted_exits_130() {
        assert_eq!(WreckitError::Interrupted.exit_code(), 130);
        assert_eq!(WreckitError::ConfigError("x".into()).exit_code(), 1);
    }

    #[test]
    fn quality_error_lists_defects() {
        let err = WreckitError::ResearchQuality {
            defects: vec!["missing Summary".into(), "missing Key Files".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("missing Summary"));
        assert!(msg.contains("missing Key Files"));
    }

    #[test]
    fn io_not_found_maps_to_file_not_found() {
        let err = WreckitError::io(
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, WreckitError::FileNotFound(_)));
    }

    #[test]
    fn every_error_has_a_hint() {
        assert!(!WreckitError::Interrupted.hint().is_empty());
        assert!(!WreckitError::Timeout(std::time::Duration::from_secs(1))
            .hint()
            .is_empty());
    }
}
