//! Execution failure taxonomy.
//!
//! Every failure ends up as a Failed terminal status for the caller. The
//! variants exist so logs and the sink can tell them apart.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutionError {
    /// Unsupported language or missing configuration for the chosen strategy.
    #[error("{0}")]
    Validation(String),

    #[error("Error while executing {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write source to {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read process output: {0}")]
    Stream(#[source] std::io::Error),

    #[error("Process exited with code {0}")]
    NonZeroExit(i32),

    /// Process ended without an exit code (killed by a signal).
    #[error("Process terminated by signal{}", .0.map(|s| format!(" {s}")).unwrap_or_default())]
    Signal(Option<i32>),

    #[error("Execution timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Remote execution failed: {0}")]
    Network(String),

    /// Error raised inside the executed program or engine.
    #[error("{0}")]
    Runtime(String),
}

impl ExecutionError {
    /// Short label for structured logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Spawn { .. } => "spawn",
            Self::Write { .. } => "write",
            Self::Stream(_) => "stream",
            Self::NonZeroExit(_) => "non_zero_exit",
            Self::Signal(_) => "signal",
            Self::Timeout(_) => "timeout",
            Self::Network(_) => "network",
            Self::Runtime(_) => "runtime",
        }
    }
}

impl From<reqwest::Error> for ExecutionError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

/// Rejection of a submission before anything runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("A run for '{0}' is already in progress")]
    AlreadyRunning(String),
}
