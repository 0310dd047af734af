//! Execution coordinator.
//!
//! Resolves a language tag to a strategy, runs it, and reports exactly one
//! terminal status per submission. Each origin (the code block a run was
//! submitted from) moves through `Idle → Running → {Succeeded, Failed}`;
//! while it is Running, further submissions from it are rejected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{
    run_engine, EmbeddedEngine, ExecutionReport, Failure, Outcome, PistonClient, ProcessRunner,
    RemoteExecutor, TerminalStatus,
};
use crate::config::{Config, Strategy};
use crate::error::{ExecutionError, SubmitError};
use crate::language::Language;
use crate::scratch::ScratchDir;
use crate::sink::OutputSink;

/// Lifecycle of the runs submitted from one origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Succeeded,
    Failed,
}

type StateMap = Arc<Mutex<HashMap<String, RunState>>>;

/// Origins the state map may hold before settled entries are pruned.
const MAX_TRACKED_ORIGINS: usize = 256;

/// Exclusive right to run for one origin.
///
/// Dropping an unsettled claim (the run's future was cancelled) leaves the
/// origin Failed so it can be submitted again.
struct Claim {
    origin: String,
    states: StateMap,
    settled: bool,
}

impl Claim {
    fn settle(mut self, status: TerminalStatus) {
        let state = match status {
            TerminalStatus::Succeeded => RunState::Succeeded,
            TerminalStatus::Failed => RunState::Failed,
        };
        set_state(&self.states, &self.origin, state);
        self.settled = true;
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.settled {
            warn!(origin = %self.origin, "Run abandoned before completion");
            set_state(&self.states, &self.origin, RunState::Failed);
        }
    }
}

fn set_state(states: &StateMap, origin: &str, state: RunState) {
    let mut states = states.lock().unwrap_or_else(PoisonError::into_inner);
    states.insert(origin.to_string(), state);

    // A pruned origin reads as Idle, which accepts a new run just the same.
    if state != RunState::Running && states.len() > MAX_TRACKED_ORIGINS {
        states.retain(|key, s| *s == RunState::Running || key == origin);
        debug!(remaining = states.len(), "Pruned settled origins");
    }
}

/// Chooses and drives an execution strategy for each submission.
pub struct ExecutionCoordinator {
    config: Arc<Config>,
    runner: ProcessRunner,
    remote: Arc<dyn RemoteExecutor>,
    engines: HashMap<Language, Arc<dyn EmbeddedEngine>>,
    states: StateMap,
}

impl ExecutionCoordinator {
    /// Create a coordinator using the Piston API configured in `config`.
    pub fn new(config: Config) -> Self {
        let remote = Arc::new(PistonClient::new(config.remote.endpoint.clone()));
        Self::with_remote(config, remote)
    }

    /// Create a coordinator with a custom remote executor.
    pub fn with_remote(config: Config, remote: Arc<dyn RemoteExecutor>) -> Self {
        let runner = ProcessRunner::new(ScratchDir::new(config.resolved_scratch_dir()));
        Self {
            config: Arc::new(config),
            runner,
            remote,
            engines: HashMap::new(),
            states: Arc::default(),
        }
    }

    /// Register an in-process engine for a language.
    pub fn register_engine(&mut self, language: Language, engine: Arc<dyn EmbeddedEngine>) {
        info!(%language, "Registered embedded engine");
        self.engines.insert(language, engine);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current state of an origin.
    pub fn state(&self, origin: &str) -> RunState {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(origin)
            .copied()
            .unwrap_or(RunState::Idle)
    }

    /// Drop the terminal state of `origin`, returning it to Idle.
    ///
    /// An origin with a run in flight is left alone.
    pub fn forget(&self, origin: &str) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        if states.get(origin) != Some(&RunState::Running) {
            states.remove(origin);
        }
    }

    /// Number of origins with a recorded state.
    pub fn tracked_origins(&self) -> usize {
        self.states.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether a new run may be submitted from `origin`.
    pub fn is_enabled(&self, origin: &str) -> bool {
        self.state(origin) != RunState::Running
    }

    /// Strategy that would run `language`.
    ///
    /// An explicit per-language override is taken as is. Otherwise the global
    /// preference applies; a Local preference for a language without a local
    /// toolchain falls back to a registered engine, then to the remote API.
    pub fn strategy_for(&self, language: Language) -> Result<Strategy, ExecutionError> {
        let explicit = self.config.strategy_override(language);
        let mut strategy = explicit.unwrap_or(self.config.prefer);

        if explicit.is_none()
            && strategy == Strategy::Local
            && self.config.local_command(language).is_none()
        {
            if self.engines.contains_key(&language) {
                strategy = Strategy::Embedded;
            } else if self.config.remote.enabled {
                strategy = Strategy::Remote;
            }
        }

        match strategy {
            Strategy::Local if self.config.local_command(language).is_none() => Err(
                ExecutionError::Validation(format!("No local toolchain configured for {language}")),
            ),
            Strategy::Remote if !self.config.remote.enabled => Err(ExecutionError::Validation(
                format!("Remote execution is disabled; cannot run {language}"),
            )),
            Strategy::Embedded if !self.engines.contains_key(&language) => Err(
                ExecutionError::Validation(format!("No embedded engine registered for {language}")),
            ),
            s => Ok(s),
        }
    }

    /// Run `source` on behalf of `origin` and wait for the report.
    ///
    /// Fails only if `origin` already has a run in flight. Every other
    /// problem, including an unsupported tag, comes back as a Failed report
    /// that has also been delivered to `sink`.
    pub async fn submit(
        &self,
        origin: &str,
        tag: &str,
        source: &str,
        sink: &mut dyn OutputSink,
    ) -> Result<ExecutionReport, SubmitError> {
        let claim = self.claim(origin)?;
        Ok(self.run_claimed(claim, tag, source, sink).await)
    }

    /// Like [`submit`](Self::submit), but runs on a separate task.
    ///
    /// The origin is claimed before this returns, so a second call for the
    /// same origin is rejected immediately.
    pub fn spawn_submit(
        self: &Arc<Self>,
        origin: &str,
        tag: &str,
        source: String,
        mut sink: Box<dyn OutputSink>,
    ) -> Result<JoinHandle<ExecutionReport>, SubmitError> {
        let claim = self.claim(origin)?;
        let this = Arc::clone(self);
        let tag = tag.to_string();

        Ok(tokio::spawn(async move {
            this.run_claimed(claim, &tag, &source, sink.as_mut()).await
        }))
    }

    fn claim(&self, origin: &str) -> Result<Claim, SubmitError> {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        if states.get(origin) == Some(&RunState::Running) {
            return Err(SubmitError::AlreadyRunning(origin.to_string()));
        }
        states.insert(origin.to_string(), RunState::Running);

        Ok(Claim {
            origin: origin.to_string(),
            states: Arc::clone(&self.states),
            settled: false,
        })
    }

    async fn run_claimed(
        &self,
        claim: Claim,
        tag: &str,
        source: &str,
        sink: &mut dyn OutputSink,
    ) -> ExecutionReport {
        sink.clear();

        let plan = Language::from_tag(tag)
            .ok_or_else(|| ExecutionError::Validation(format!("Unsupported language '{tag}'")))
            .and_then(|language| Ok((language, self.strategy_for(language)?)));

        let (language, strategy, outcome) = match plan {
            Ok((language, strategy)) => {
                info!(origin = %claim.origin, %language, %strategy, "Running");
                let outcome = self.dispatch(language, strategy, source, sink).await;
                (Some(language), Some(strategy), outcome)
            }
            Err(e) => (Language::from_tag(tag), None, Outcome::failed(e)),
        };

        let status = outcome.status();
        if let Some(err) = &outcome.error {
            // Program and engine errors already wrote their own text.
            if !matches!(err, ExecutionError::NonZeroExit(_) | ExecutionError::Runtime(_)) {
                sink.write_err(&format!("{err}\n"));
            }
            warn!(origin = %claim.origin, kind = err.kind(), error = %err, notice = status.notice(), "Execution failed");
        } else {
            info!(origin = %claim.origin, notice = status.notice(), "Execution finished");
        }

        let report = ExecutionReport {
            language,
            strategy,
            status,
            failure: outcome.error.as_ref().map(Failure::from),
            result: outcome.result,
        };

        sink.finish(&report);
        claim.settle(status);
        report
    }

    async fn dispatch(
        &self,
        language: Language,
        strategy: Strategy,
        source: &str,
        sink: &mut dyn OutputSink,
    ) -> Outcome {
        let timeout = self.config.timeout();

        match strategy {
            Strategy::Local => match self.config.local_command(language) {
                Some(command) => self.runner.run(command, source, timeout, sink).await,
                None => Outcome::failed(ExecutionError::Validation(format!(
                    "No local toolchain configured for {language}"
                ))),
            },
            Strategy::Remote => self.run_remote(language, source, sink).await,
            Strategy::Embedded => match self.engines.get(&language) {
                Some(engine) => {
                    let run = run_engine(engine.as_ref(), source, self.config.max_answers, sink);
                    tokio::time::timeout(timeout, run)
                        .await
                        .unwrap_or_else(|_| Outcome::failed(ExecutionError::Timeout(timeout)))
                }
                None => Outcome::failed(ExecutionError::Validation(format!(
                    "No embedded engine registered for {language}"
                ))),
            },
        }
    }

    async fn run_remote(&self, language: Language, source: &str, sink: &mut dyn OutputSink) -> Outcome {
        let timeout = self.config.timeout();
        let remote_id = self.config.remote_id(language);

        let response = match tokio::time::timeout(timeout, self.remote.execute(remote_id, source)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Outcome::failed(e),
            Err(_) => return Outcome::failed(ExecutionError::Timeout(timeout)),
        };

        // One shot: everything the remote produced arrives at once.
        if let Some(compile) = response.failed_compile() {
            if !compile.output.is_empty() {
                sink.write_err(&compile.output);
            }
        } else if !response.run.output.is_empty() {
            sink.write(&response.run.output);
        }

        let (result, error) = response.to_result();
        Outcome { result, error }
    }
}
