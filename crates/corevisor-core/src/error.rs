use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::process::ProcessError;

/// Error kinds reported to control-surface callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ConfigMissing,
    ConfigInvalid,
    SpawnFailed,
    AlreadyRunning,
    NotRunning,
    StopFailed,
    PreflightFailed,
    DependencyCheckFailed,
    /// The control request could not be understood
    InvalidRequest,
}

/// Errors produced by supervisor operations
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("config not found at {}", .0.display())]
    ConfigMissing(PathBuf),

    #[error("failed to parse config {}: {reason}", path.display())]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("referenced binary not found at {}", .0.display())]
    BinaryMissing(PathBuf),

    #[error("failed to spawn managed process: {0}")]
    SpawnFailed(#[source] ProcessError),

    #[error("managed process is already running")]
    AlreadyRunning,

    #[error("managed process is not running")]
    NotRunning,

    #[error("failed to stop managed process: {0}")]
    StopFailed(String),

    #[error("pre-start preparation failed: {0}")]
    PreflightFailed(#[source] anyhow::Error),

    #[error("dependency check for {name} failed: {reason}")]
    DependencyCheckFailed { name: String, reason: String },
}

impl SupervisorError {
    /// Wire-level kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::ConfigMissing(_) => ErrorKind::ConfigMissing,
            SupervisorError::ConfigInvalid { .. } | SupervisorError::BinaryMissing(_) => {
                ErrorKind::ConfigInvalid
            }
            SupervisorError::SpawnFailed(_) => ErrorKind::SpawnFailed,
            SupervisorError::AlreadyRunning => ErrorKind::AlreadyRunning,
            SupervisorError::NotRunning => ErrorKind::NotRunning,
            SupervisorError::StopFailed(_) => ErrorKind::StopFailed,
            SupervisorError::PreflightFailed(_) => ErrorKind::PreflightFailed,
            SupervisorError::DependencyCheckFailed { .. } => ErrorKind::DependencyCheckFailed,
        }
    }

    /// Check if this error only reports that the request did not apply to the current state
    pub fn is_state_conflict(&self) -> bool {
        matches!(
            self,
            SupervisorError::AlreadyRunning | SupervisorError::NotRunning
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            SupervisorError::ConfigMissing(PathBuf::from("a")).kind(),
            ErrorKind::ConfigMissing
        );
        assert_eq!(
            SupervisorError::BinaryMissing(PathBuf::from("sing-box")).kind(),
            ErrorKind::ConfigInvalid
        );
        assert_eq!(SupervisorError::NotRunning.kind(), ErrorKind::NotRunning);
        assert_eq!(
            SupervisorError::SpawnFailed(ProcessError::SpawnFailed("boom".into())).kind(),
            ErrorKind::SpawnFailed
        );
    }

    #[test]
    fn test_error_categorization() {
        assert!(SupervisorError::AlreadyRunning.is_state_conflict());
        assert!(SupervisorError::NotRunning.is_state_conflict());
        assert!(!SupervisorError::StopFailed("x".into()).is_state_conflict());
    }

    #[test]
    fn test_error_display() {
        let error = SupervisorError::ConfigInvalid {
            path: PathBuf::from("/opt/config.obv"),
            reason: "expected value at line 1".to_string(),
        };
        let display = format!("{error}");
        assert!(display.contains("/opt/config.obv"));
        assert!(display.contains("expected value"));

        let error = SupervisorError::BinaryMissing(PathBuf::from("/opt/sing-box"));
        assert!(format!("{error}").contains("binary not found"));
    }

    #[test]
    fn test_kind_serializes_as_name() {
        let json = serde_json::to_string(&ErrorKind::AlreadyRunning).unwrap();
        assert_eq!(json, "\"AlreadyRunning\"");
    }
}
