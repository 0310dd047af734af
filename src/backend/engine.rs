//! Embedded engine seam.
//!
//! Some languages can be answered by an in-process engine instead of a
//! toolchain (a Prolog solver producing one answer per query step, say). The
//! engines themselves live outside this crate; this module only defines how
//! they are driven: load the source, then pull answers one at a time until
//! the engine is exhausted, fails, or the answer cap is hit.

use async_trait::async_trait;
use tracing::debug;

use super::{ExecutionResult, Outcome};
use crate::error::ExecutionError;
use crate::sink::OutputSink;

/// One step of a bounded-answer protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    /// A formatted answer.
    Value(String),
    /// No answers left.
    Exhausted,
    /// The engine failed while producing the next answer.
    Error(String),
}

/// A loaded program that yields answers on demand.
#[async_trait]
pub trait AnswerSession: Send {
    async fn next_answer(&mut self) -> Answer;
}

/// An opaque in-process interpreter.
#[async_trait]
pub trait EmbeddedEngine: Send + Sync {
    /// Load `source`. The error string is shown to the user verbatim.
    async fn load(&self, source: &str) -> Result<Box<dyn AnswerSession>, String>;
}

/// Load `source` into `engine` and drain its answers into `sink`.
pub async fn run_engine(
    engine: &dyn EmbeddedEngine,
    source: &str,
    max_answers: usize,
    sink: &mut dyn OutputSink,
) -> Outcome {
    match engine.load(source).await {
        Ok(mut session) => drain_answers(session.as_mut(), max_answers, sink).await,
        Err(message) => {
            sink.write_err(&format!("Loading program failed.\n{message}"));
            Outcome {
                result: ExecutionResult {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: message.clone(),
                },
                error: Some(ExecutionError::Runtime(message)),
            }
        }
    }
}

/// Pull at most `max_answers` answers, writing each on its own line.
pub async fn drain_answers(
    session: &mut dyn AnswerSession,
    max_answers: usize,
    sink: &mut dyn OutputSink,
) -> Outcome {
    let mut result = ExecutionResult::default();

    for _ in 0..max_answers {
        match session.next_answer().await {
            Answer::Value(answer) => {
                let line = format!("{answer}\n");
                sink.write(&line);
                result.stdout.push_str(&line);
            }
            Answer::Exhausted => {
                result.exit_code = Some(0);
                return Outcome { result, error: None };
            }
            Answer::Error(message) => {
                let text = format!("Error while executing code: {message}");
                sink.write_err(&text);
                result.stderr.push_str(&text);
                return Outcome {
                    result,
                    error: Some(ExecutionError::Runtime(message)),
                };
            }
        }
    }

    debug!(max_answers, "Answer cap reached");
    result.exit_code = Some(0);
    Outcome { result, error: None }
}
