//! Error types for ctl-core

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Failure of a command against a host service.
///
/// Every variant carries a human-readable reason suitable for a toast or
/// an inline message next to the control that issued the command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum CommandError {
    /// Service absent or unreachable.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Service present but missing a required permission or helper.
    #[error("service degraded: {0}")]
    Degraded(String),

    /// Timeout or busy service. Eligible for one retry.
    #[error("temporary failure: {0}")]
    Transient(String),

    /// Service explicitly refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Action not valid for the current device or state.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl CommandError {
    /// Stable machine-readable code for UI layers.
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::Unavailable(_) => "unavailable",
            CommandError::Degraded(_) => "degraded",
            CommandError::Transient(_) => "transient",
            CommandError::Rejected(_) => "rejected",
            CommandError::Unsupported(_) => "unsupported",
        }
    }

    /// Human-readable reason without the category prefix.
    pub fn reason(&self) -> &str {
        match self {
            CommandError::Unavailable(r)
            | CommandError::Degraded(r)
            | CommandError::Transient(r)
            | CommandError::Rejected(r)
            | CommandError::Unsupported(r) => r,
        }
    }

    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, CommandError::Transient(_))
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}
