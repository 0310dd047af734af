//! Output sinks.
//!
//! A sink receives output while an execution is running and the final report
//! once it is over. The coordinator only talks to the trait, so the same run
//! can feed a terminal, an MCP response or a test buffer.

use std::io::Write;

use crate::backend::ExecutionReport;

/// Destination for streamed output and the terminal report.
///
/// Calls on one channel arrive in the order the chunks were produced.
/// Interleaving between `write` and `write_err` is best effort.
pub trait OutputSink: Send {
    /// Append a chunk of standard output.
    fn write(&mut self, text: &str);

    /// Append a chunk of standard error (or an error message).
    fn write_err(&mut self, text: &str);

    /// Drop anything accumulated by a previous run.
    fn clear(&mut self);

    /// Receive the terminal report. Called exactly once per execution.
    fn finish(&mut self, _report: &ExecutionReport) {}
}

/// One write as it reached a [`BufferSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Out(String),
    Err(String),
}

/// Sink that keeps everything in memory.
#[derive(Debug, Default)]
pub struct BufferSink {
    chunks: Vec<Chunk>,
    report: Option<ExecutionReport>,
    finish_calls: usize,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stdout chunks concatenated.
    pub fn stdout(&self) -> String {
        self.chunks
            .iter()
            .filter_map(|c| match c {
                Chunk::Out(s) => Some(s.as_str()),
                Chunk::Err(_) => None,
            })
            .collect()
    }

    /// All stderr chunks concatenated.
    pub fn stderr(&self) -> String {
        self.chunks
            .iter()
            .filter_map(|c| match c {
                Chunk::Err(s) => Some(s.as_str()),
                Chunk::Out(_) => None,
            })
            .collect()
    }

    /// Both channels in arrival order.
    pub fn combined(&self) -> String {
        self.chunks
            .iter()
            .map(|c| match c {
                Chunk::Out(s) | Chunk::Err(s) => s.as_str(),
            })
            .collect()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub const fn report(&self) -> Option<&ExecutionReport> {
        self.report.as_ref()
    }

    /// How many times `finish` was called since the last `clear`.
    pub const fn finish_calls(&self) -> usize {
        self.finish_calls
    }
}

impl OutputSink for BufferSink {
    fn write(&mut self, text: &str) {
        self.chunks.push(Chunk::Out(text.to_string()));
    }

    fn write_err(&mut self, text: &str) {
        self.chunks.push(Chunk::Err(text.to_string()));
    }

    fn clear(&mut self) {
        self.chunks.clear();
        self.report = None;
        self.finish_calls = 0;
    }

    fn finish(&mut self, report: &ExecutionReport) {
        self.finish_calls += 1;
        self.report = Some(report.clone());
    }
}

/// Sink that forwards output to this process's stdout and stderr.
#[derive(Debug, Default)]
pub struct TerminalSink;

impl OutputSink for TerminalSink {
    fn write(&mut self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }

    fn write_err(&mut self, text: &str) {
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(text.as_bytes());
        let _ = err.flush();
    }

    // Terminal output cannot be retracted.
    fn clear(&mut self) {}

    fn finish(&mut self, report: &ExecutionReport) {
        eprintln!("\n{}", report.status.notice());
    }
}
