//! Execution backends and their shared result types.
//!
//! Three ways to run a snippet live here:
//! - [`ProcessRunner`] spawns a local toolchain against a scratch file
//! - [`PistonClient`] (behind [`RemoteExecutor`]) delegates to a remote API
//! - [`EmbeddedEngine`] hands the source to an opaque in-process engine

mod engine;
mod local;
mod remote;

pub use engine::{drain_answers, run_engine, Answer, AnswerSession, EmbeddedEngine};
pub use local::ProcessRunner;
pub use remote::{PistonClient, RemoteResponse, RemoteRun, Runtime, Signal};

use async_trait::async_trait;

use crate::config::Strategy;
use crate::error::ExecutionError;
use crate::language::Language;

/// Output captured from one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Exit code; `None` if the program was killed, timed out or never ran.
    pub exit_code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

/// Final outcome of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Succeeded,
    Failed,
}

impl TerminalStatus {
    /// User-facing notice for this status.
    pub const fn notice(self) -> &'static str {
        match self {
            Self::Succeeded => "Done!",
            Self::Failed => "Error!",
        }
    }
}

/// Output plus the error that made the run fail, if any.
#[derive(Debug)]
pub struct Outcome {
    pub result: ExecutionResult,
    pub error: Option<ExecutionError>,
}

impl Outcome {
    pub const fn status(&self) -> TerminalStatus {
        if self.error.is_none() {
            TerminalStatus::Succeeded
        } else {
            TerminalStatus::Failed
        }
    }

    /// Failure that happened before any output was produced.
    pub fn failed(error: ExecutionError) -> Self {
        Self {
            result: ExecutionResult::default(),
            error: Some(error),
        }
    }
}

/// Why a run failed, in a form that can be cloned into reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Stable label, see [`ExecutionError::kind`].
    pub kind: &'static str,
    pub message: String,
}

impl From<&ExecutionError> for Failure {
    fn from(err: &ExecutionError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Terminal report handed to the sink and returned to the caller.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub language: Option<Language>,
    pub strategy: Option<Strategy>,
    pub status: TerminalStatus,
    pub result: ExecutionResult,
    pub failure: Option<Failure>,
}

/// Client for a remote execution service.
///
/// One request per execution, no retries, no streaming.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `source` remotely as `language` (the service's identifier).
    async fn execute(&self, language: &str, source: &str) -> Result<RemoteResponse, ExecutionError>;
}
