//! Local toolchain backend.
//!
//! Writes the snippet to a scratch file, runs `<command> <args...> <file>`,
//! and streams the child's output into the sink as it arrives.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, instrument, warn};

use super::{ExecutionResult, Outcome};
use crate::config::LocalCommand;
use crate::error::ExecutionError;
use crate::scratch::{ScratchDir, ScratchFile};
use crate::sink::OutputSink;

/// Read size for the child's pipes.
const CHUNK_SIZE: usize = 8 * 1024;

/// Runs snippets through local interpreters and compilers.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    scratch: ScratchDir,
}

impl ProcessRunner {
    pub const fn new(scratch: ScratchDir) -> Self {
        Self { scratch }
    }

    pub const fn scratch(&self) -> &ScratchDir {
        &self.scratch
    }

    /// Run `source` with the given toolchain.
    ///
    /// The scratch file is removed before this returns, whatever the outcome.
    #[instrument(skip(self, command, source, sink), fields(command = %command.command))]
    pub async fn run(
        &self,
        command: &LocalCommand,
        source: &str,
        timeout: Duration,
        sink: &mut dyn OutputSink,
    ) -> Outcome {
        let file = match self.scratch.allocate(&command.extension) {
            Ok(file) => file,
            Err(e) => {
                return Outcome::failed(ExecutionError::Write {
                    path: self.scratch.path().to_path_buf(),
                    source: e,
                })
            }
        };

        let outcome = execute(command, &file, source, timeout, sink).await;
        file.release();
        outcome
    }
}

async fn execute(
    command: &LocalCommand,
    file: &ScratchFile,
    source: &str,
    timeout: Duration,
    sink: &mut dyn OutputSink,
) -> Outcome {
    if let Err(e) = tokio::fs::write(file.path(), source).await {
        return Outcome::failed(ExecutionError::Write {
            path: file.path().to_path_buf(),
            source: e,
        });
    }

    let invocation = format!("{} {} {}", command.command, command.args, file.path().display());
    debug!(%invocation, code_len = source.len(), "Spawning process");

    let mut cmd = Command::new(&command.command);
    cmd.args(command.arg_list())
        .arg(file.path())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Toolchains like `go run` start the program as a grandchild; a group of
    // its own lets the whole tree be killed together.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return Outcome::failed(ExecutionError::Spawn {
                command: invocation,
                source: e,
            })
        }
    };

    // Declared after `child` so it drops first, while the group id is still ours.
    let mut group = ProcessGroup::of(&child);

    let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
        group.kill();
        let _ = child.kill().await;
        return Outcome::failed(ExecutionError::Stream(std::io::Error::other(
            "child stdio pipes unavailable",
        )));
    };

    let mut capture = Capture::new(sink);

    // `child` is only borrowed here so it can still be killed on timeout.
    let run = async {
        pump(&mut stdout, &mut stderr, &mut capture)
            .await
            .map_err(ExecutionError::Stream)?;
        child.wait().await.map_err(ExecutionError::Stream)
    };
    let waited = tokio::time::timeout(timeout, run).await;

    let (exit_code, error) = match waited {
        Ok(Ok(status)) => {
            group.disarm();
            classify(status)
        }
        Ok(Err(e)) => {
            group.kill();
            let _ = child.kill().await;
            (None, Some(e))
        }
        Err(_) => {
            warn!(%invocation, ?timeout, "Process timed out, killing its process group");
            group.kill();
            let _ = child.kill().await;
            (None, Some(ExecutionError::Timeout(timeout)))
        }
    };

    debug!(?exit_code, "Process finished");

    Outcome {
        result: capture.into_result(exit_code),
        error,
    }
}

/// Process group of a spawned child, killed on demand or on drop.
///
/// Disarmed once the child has been reaped, since its id may then be reused.
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|id| i32::try_from(id).ok()),
        }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pgid: i32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        debug!(pgid, error = %e, "Process group already gone");
    }
}

// Without process groups only the direct child is killed.
#[cfg(not(unix))]
const fn kill_group(_pgid: i32) {}

fn classify(status: ExitStatus) -> (Option<i32>, Option<ExecutionError>) {
    match status.code() {
        Some(0) => (Some(0), None),
        Some(code) => (Some(code), Some(ExecutionError::NonZeroExit(code))),
        None => (None, Some(ExecutionError::Signal(signal_of(status)))),
    }
}

#[cfg(unix)]
fn signal_of(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
const fn signal_of(_status: ExitStatus) -> Option<i32> {
    None
}

/// Forward both pipes into `capture` until each reaches EOF.
async fn pump<O, E>(stdout: &mut O, stderr: &mut E, capture: &mut Capture<'_>) -> std::io::Result<()>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out_buf = vec![0u8; CHUNK_SIZE];
    let mut err_buf = vec![0u8; CHUNK_SIZE];
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            read = stdout.read(&mut out_buf), if out_open => {
                let n = read?;
                if n == 0 {
                    out_open = false;
                    capture.close_out();
                } else {
                    capture.out(&out_buf[..n]);
                }
            }
            read = stderr.read(&mut err_buf), if err_open => {
                let n = read?;
                if n == 0 {
                    err_open = false;
                    capture.close_err();
                } else {
                    capture.err(&err_buf[..n]);
                }
            }
        }
    }

    Ok(())
}

/// Tees decoded output into the sink and the accumulated result.
struct Capture<'a> {
    sink: &'a mut dyn OutputSink,
    stdout: String,
    stderr: String,
    out_decoder: Utf8Decoder,
    err_decoder: Utf8Decoder,
}

impl<'a> Capture<'a> {
    fn new(sink: &'a mut dyn OutputSink) -> Self {
        Self {
            sink,
            stdout: String::new(),
            stderr: String::new(),
            out_decoder: Utf8Decoder::default(),
            err_decoder: Utf8Decoder::default(),
        }
    }

    fn out(&mut self, bytes: &[u8]) {
        let text = self.out_decoder.decode(bytes);
        self.emit_out(&text);
    }

    fn err(&mut self, bytes: &[u8]) {
        let text = self.err_decoder.decode(bytes);
        self.emit_err(&text);
    }

    fn close_out(&mut self) {
        let text = self.out_decoder.finish();
        self.emit_out(&text);
    }

    fn close_err(&mut self) {
        let text = self.err_decoder.finish();
        self.emit_err(&text);
    }

    fn emit_out(&mut self, text: &str) {
        if !text.is_empty() {
            self.sink.write(text);
            self.stdout.push_str(text);
        }
    }

    fn emit_err(&mut self, text: &str) {
        if !text.is_empty() {
            self.sink.write_err(text);
            self.stderr.push_str(text);
        }
    }

    fn into_result(self, exit_code: Option<i32>) -> ExecutionResult {
        ExecutionResult {
            exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
        }
    }
}

/// Incremental UTF-8 decoder.
///
/// Holds back an incomplete trailing sequence until the next chunk arrives;
/// invalid bytes become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is left at end of stream.
    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::sink::{BufferSink, Chunk};

    fn sh() -> LocalCommand {
        LocalCommand::new("sh", "", "sh")
    }

    fn runner(dir: &tempfile::TempDir) -> ProcessRunner {
        ProcessRunner::new(ScratchDir::new(dir.path()))
    }

    fn is_empty(dir: &tempfile::TempDir) -> bool {
        std::fs::read_dir(dir.path()).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn stdout_arrives_in_order_and_exit_zero_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = BufferSink::new();

        let outcome = runner(&dir)
            .run(&sh(), "echo a\necho b\necho c\n", Duration::from_secs(10), &mut sink)
            .await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.result.exit_code, Some(0));
        assert_eq!(outcome.result.stdout, "a\nb\nc\n");
        assert_eq!(sink.stdout(), "a\nb\nc\n");
        assert!(is_empty(&dir));
    }

    #[tokio::test]
    async fn output_is_streamed_not_buffered() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = BufferSink::new();

        runner(&dir)
            .run(&sh(), "echo first\nsleep 0.3\necho second\n", Duration::from_secs(10), &mut sink)
            .await;

        let out_chunks = sink
            .chunks()
            .iter()
            .filter(|c| matches!(c, Chunk::Out(_)))
            .count();
        assert!(out_chunks >= 2, "expected separate chunks, got {:?}", sink.chunks());
        assert_eq!(sink.stdout(), "first\nsecond\n");
    }

    #[tokio::test]
    async fn non_zero_exit_fails_and_keeps_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = BufferSink::new();

        let outcome = runner(&dir)
            .run(&sh(), "echo partial\necho boom >&2\nexit 3\n", Duration::from_secs(10), &mut sink)
            .await;

        assert!(matches!(outcome.error, Some(ExecutionError::NonZeroExit(3))));
        assert_eq!(outcome.result.exit_code, Some(3));
        assert_eq!(outcome.result.stdout, "partial\n");
        assert_eq!(sink.stderr(), "boom\n");
        assert!(is_empty(&dir));
    }

    #[tokio::test]
    async fn timeout_kills_process_and_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = BufferSink::new();
        let started = Instant::now();

        let outcome = runner(&dir)
            .run(&sh(), "echo started\nsleep 30\n", Duration::from_millis(300), &mut sink)
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(outcome.error, Some(ExecutionError::Timeout(_))));
        assert_eq!(outcome.result.exit_code, None);
        assert_eq!(sink.stdout(), "started\n");
        assert!(is_empty(&dir));
    }

    #[tokio::test]
    async fn timeout_kills_grandchildren_too() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let scratch = dir.path().join("scratch");
        std::fs::create_dir(&scratch).unwrap();
        let runner = ProcessRunner::new(ScratchDir::new(&scratch));
        let mut sink = BufferSink::new();

        // The inner shell outlives its parent unless the whole group is killed.
        let source = format!("sh -c 'sleep 1; touch \"{}\"'\n", marker.display());
        let outcome = runner
            .run(&sh(), &source, Duration::from_millis(200), &mut sink)
            .await;
        assert!(matches!(outcome.error, Some(ExecutionError::Timeout(_))));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "grandchild survived the timeout");
    }

    #[tokio::test]
    async fn cleanup_failure_does_not_fail_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = BufferSink::new();

        // The program removes its own scratch file, so release finds nothing.
        let outcome = runner(&dir)
            .run(&sh(), "rm \"$0\"\necho ok\n", Duration::from_secs(10), &mut sink)
            .await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.result.exit_code, Some(0));
        assert_eq!(sink.stdout(), "ok\n");
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = BufferSink::new();
        let cmd = LocalCommand::new("/nonexistent/interpreter", "--flag", "py");

        let outcome = runner(&dir)
            .run(&cmd, "print(1)", Duration::from_secs(5), &mut sink)
            .await;

        match outcome.error {
            Some(ref err @ ExecutionError::Spawn { .. }) => {
                assert!(err.to_string().starts_with("Error while executing /nonexistent/interpreter --flag "));
            }
            other => panic!("expected spawn error, got {other:?}"),
        }
        assert!(is_empty(&dir));
    }

    #[tokio::test]
    async fn scratch_file_exists_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = BufferSink::new();

        let outcome = runner(&dir)
            .run(&sh(), "test -f \"$0\" && echo present\n", Duration::from_secs(10), &mut sink)
            .await;

        assert!(outcome.error.is_none());
        assert_eq!(sink.stdout(), "present\n");
        assert!(is_empty(&dir));
    }

    #[tokio::test]
    async fn configured_args_precede_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = BufferSink::new();
        let cat = LocalCommand::new("cat", "-n", "txt");

        let outcome = runner(&dir)
            .run(&cat, "hello\n", Duration::from_secs(10), &mut sink)
            .await;

        assert!(outcome.error.is_none());
        assert!(sink.stdout().contains("1\thello"));
    }

    #[tokio::test]
    async fn killed_by_signal_has_no_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = BufferSink::new();

        let outcome = runner(&dir)
            .run(&sh(), "kill -9 $$\n", Duration::from_secs(10), &mut sink)
            .await;

        assert!(matches!(outcome.error, Some(ExecutionError::Signal(Some(9)))));
        assert_eq!(outcome.result.exit_code, None);
    }

    #[tokio::test]
    async fn unwritable_scratch_dir_fails_before_spawn() {
        let mut sink = BufferSink::new();
        let runner = ProcessRunner::new(ScratchDir::new("/nonexistent/scratch"));

        let outcome = runner
            .run(&sh(), "echo never", Duration::from_secs(5), &mut sink)
            .await;

        assert!(matches!(outcome.error, Some(ExecutionError::Write { .. })));
        assert!(sink.chunks().is_empty());
    }

    #[test]
    fn decoder_holds_back_split_characters() {
        let bytes = "héllo".as_bytes();
        let mut decoder = Utf8Decoder::default();

        // Split inside the two-byte 'é'.
        let first = decoder.decode(&bytes[..2]);
        let second = decoder.decode(&bytes[2..]);
        assert_eq!(first, "h");
        assert_eq!(second, "éllo");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");

        // A truncated sequence at EOF is flushed lossily.
        assert_eq!(decoder.decode(b"\xc3"), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }
}
