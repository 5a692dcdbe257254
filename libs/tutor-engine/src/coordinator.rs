/// Execution Coordinator - Public Entry Point of the Engine
///
/// **Responsibility:**
/// Own every execution from submission to teardown: session supersession,
/// the bounded worker pool, cancellation, and turning the pipeline's outcome
/// into an [`ExecutionResult`].
///
/// **Pipeline:**
/// 1. Packager writes the source into a fresh work area
/// 2. Invoker compiles it (compile errors end here, nothing is run)
/// 3. Invoker runs it under the Governor with the Collector attached
/// 4. Result Builder classifies and renders
///
/// **Concurrency Rules:**
/// - At most one in-flight execution per session; a newer request cancels
///   the older one and waits for its cleanup before starting
/// - Across sessions, executions share a fixed number of worker permits
/// - The session map is the only shared mutable state and is touched only
///   under its lock, never across an await
/// - Cancelling returns only after the work area and process tree are gone

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use tutor_common::config::EngineLimits;
use tutor_common::types::{ExecutionMeta, ExecutionOutcome, ExecutionRequest, ExecutionResult};
use uuid::Uuid;

use crate::config::{active_toolchain_name, ToolchainConfig, ToolchainRegistry};
use crate::error::{ExecutionError, InfrastructureError};
use crate::invoker::{CompileStep, ToolchainInvoker};
use crate::packager::{Package, SourcePackager, WorkArea};
use crate::report::{self, ExcerptLimits};

/// Lifecycle of one execution. Exactly one terminal state is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Created,
    Packaging,
    Compiling,
    Running,
    CompileFailed,
    Completed,
    TimedOut,
    Cancelled,
    /// Infrastructure error; no outcome was produced.
    Failed,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::CompileFailed
                | ExecutionState::Completed
                | ExecutionState::TimedOut
                | ExecutionState::Cancelled
                | ExecutionState::Failed
        )
    }
}

struct StateTracker {
    execution_id: Uuid,
    state: ExecutionState,
}

impl StateTracker {
    fn new(execution_id: Uuid) -> Self {
        Self {
            execution_id,
            state: ExecutionState::Created,
        }
    }

    fn advance(&mut self, next: ExecutionState) {
        debug_assert!(!self.state.is_terminal(), "execution already terminal");
        debug!(
            execution_id = %self.execution_id,
            from = ?self.state,
            to = ?next,
            "State transition"
        );
        self.state = next;
    }
}

/// Cancels one execution. Cheap to clone; all clones address the same execution.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

impl CancelHandle {
    /// Request cancellation and wait until the execution has released its
    /// work area and process tree.
    ///
    /// Returns `true` if this call stopped a running execution, `false` if it
    /// had already finished or been cancelled. Safe to call any number of times.
    pub async fn cancel(&self) -> bool {
        let was_running = !self.token.is_cancelled() && !self.is_finished();
        self.token.cancel();
        self.wait_finished().await;
        was_running
    }

    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    async fn wait_finished(&self) {
        let mut done = self.done.clone();
        // A closed channel means the task is gone, which is just as finished.
        let _ = done.wait_for(|finished| *finished).await;
    }
}

/// Signals completion when dropped, after the pipeline's resources are released.
struct CompletionGuard(watch::Sender<bool>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

/// A submitted execution.
#[derive(Debug)]
pub struct ExecutionHandle {
    execution_id: Uuid,
    cancel: CancelHandle,
    join: JoinHandle<Result<ExecutionResult, ExecutionError>>,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// See [`CancelHandle::cancel`].
    pub async fn cancel(&self) -> bool {
        self.cancel.cancel().await
    }

    /// Wait for the execution to resolve.
    pub async fn result(self) -> Result<ExecutionResult, ExecutionError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(ExecutionError::Cancelled),
            Err(e) => Err(InfrastructureError::Worker(e.to_string()).into()),
        }
    }
}

#[derive(Debug)]
struct InFlight {
    execution_id: Uuid,
    cancel: CancelHandle,
}

#[derive(Debug)]
struct Inner {
    limits: EngineLimits,
    packager: SourcePackager,
    invoker: ToolchainInvoker,
    pool: Arc<Semaphore>,
    sessions: Mutex<HashMap<String, InFlight>>,
}

/// Runs learner code: one in-flight execution per session, bounded across sessions.
///
/// Cloning is cheap and every clone shares the same pool and session map.
/// Must be used from within a Tokio runtime.
#[derive(Debug, Clone)]
pub struct ExecutionCoordinator {
    inner: Arc<Inner>,
}

impl ExecutionCoordinator {
    pub fn new(toolchain: ToolchainConfig, limits: EngineLimits) -> Self {
        let packager = SourcePackager::new(
            toolchain.source_file.clone(),
            limits.work_root.clone(),
            limits.max_source_bytes,
        );
        let invoker = ToolchainInvoker::new(toolchain, &limits);
        let pool = Arc::new(Semaphore::new(limits.workers.max(1)));

        info!(
            toolchain = %invoker.toolchain().name,
            workers = limits.workers,
            run_timeout_ms = limits.run_timeout.as_millis() as u64,
            compile_timeout_ms = limits.compile_timeout.as_millis() as u64,
            "Execution coordinator ready"
        );

        Self {
            inner: Arc::new(Inner {
                limits,
                packager,
                invoker,
                pool,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Coordinator for the toolchain named by `TUTOR_TOOLCHAIN`, with limits
    /// from the `TUTOR_*` environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let registry = ToolchainRegistry::load_default()?;
        let toolchain = registry.get(&active_toolchain_name())?.clone();
        Ok(Self::new(toolchain, EngineLimits::from_env()))
    }

    pub fn limits(&self) -> &EngineLimits {
        &self.inner.limits
    }

    pub fn toolchain(&self) -> &ToolchainConfig {
        self.inner.invoker.toolchain()
    }

    /// Number of sessions with an execution in flight.
    pub fn in_flight_sessions(&self) -> usize {
        self.inner.sessions().len()
    }

    /// Run `request` to completion.
    ///
    /// Code problems (compile errors, crashes, timeouts) come back as `Ok`;
    /// only cancellation and infrastructure failures are errors.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ExecutionError> {
        self.submit(request).result().await
    }

    /// Start `request` on a worker and return immediately.
    ///
    /// A request carrying a session id supersedes whatever that session has
    /// in flight; the superseded execution resolves to
    /// [`ExecutionError::Cancelled`].
    pub fn submit(&self, request: ExecutionRequest) -> ExecutionHandle {
        let execution_id = Uuid::new_v4();
        let token = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let cancel = CancelHandle {
            token: token.clone(),
            done: done_rx,
        };

        let superseded = request
            .session_id()
            .and_then(|session| self.inner.register(session, execution_id, cancel.clone()));

        let inner = self.inner.clone();
        let join = tokio::spawn(async move {
            let _completion = CompletionGuard(done_tx);
            inner.run(execution_id, request, superseded, token).await
        });

        ExecutionHandle {
            execution_id,
            cancel,
            join,
        }
    }

    /// Cancel whatever `session_id` has in flight and wait for its cleanup.
    /// Returns `false` when there was nothing running.
    pub async fn cancel_session(&self, session_id: &str) -> bool {
        let handle = self
            .inner
            .sessions()
            .get(session_id)
            .map(|in_flight| in_flight.cancel.clone());
        match handle {
            Some(handle) => handle.cancel().await,
            None => false,
        }
    }
}

impl Inner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make `execution_id` the session's in-flight execution, returning the one it replaces.
    fn register(&self, session_id: &str, execution_id: Uuid, cancel: CancelHandle) -> Option<CancelHandle> {
        self.sessions()
            .insert(session_id.to_string(), InFlight { execution_id, cancel })
            .map(|previous| {
                debug!(
                    session_id,
                    superseded = %previous.execution_id,
                    by = %execution_id,
                    "Superseding in-flight execution"
                );
                previous.cancel
            })
    }

    /// Drop the session entry, unless a newer execution already replaced it.
    fn deregister(&self, session_id: Option<&str>, execution_id: Uuid) {
        let Some(session_id) = session_id else {
            return;
        };
        let mut sessions = self.sessions();
        if sessions
            .get(session_id)
            .is_some_and(|in_flight| in_flight.execution_id == execution_id)
        {
            sessions.remove(session_id);
        }
    }

    #[instrument(
        skip_all,
        fields(
            execution_id = %execution_id,
            session_id = request.session_id().unwrap_or("-"),
            toolchain = %self.invoker.toolchain().name,
        )
    )]
    async fn run(
        &self,
        execution_id: Uuid,
        request: ExecutionRequest,
        superseded: Option<CancelHandle>,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        let start = Instant::now();

        if let Some(previous) = superseded {
            if previous.cancel().await {
                info!("Cancelled previous execution for session");
            }
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.pool.clone().acquire_owned() => Some(
                permit.map_err(|_| InfrastructureError::Worker("worker pool closed".to_string()))
            ),
        };
        let outcome = match permit {
            None => Err(ExecutionError::Cancelled),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(_permit)) => {
                info!(source_size = request.source().len(), "Starting execution");
                self.pipeline(execution_id, &request, &cancel).await
            }
        };
        self.deregister(request.session_id(), execution_id);

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(outcome) => {
                info!(outcome = %outcome.kind(), elapsed_ms, "Execution finished");
                let meta = ExecutionMeta {
                    execution_id,
                    session_id: request.session_id().map(str::to_string),
                    toolchain: self.invoker.toolchain().name.clone(),
                    elapsed_ms,
                    finished_at: Utc::now(),
                };
                Ok(report::build(meta, outcome))
            }
            Err(ExecutionError::Cancelled) => {
                warn!(elapsed_ms, "Execution cancelled");
                Err(ExecutionError::Cancelled)
            }
            Err(ExecutionError::Infrastructure(e)) => {
                error!(error = %e, elapsed_ms, "Execution failed on infrastructure error");
                Err(ExecutionError::Infrastructure(e))
            }
        }
    }

    async fn pipeline(
        &self,
        execution_id: Uuid,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let mut state = StateTracker::new(execution_id);
        state.advance(ExecutionState::Packaging);

        if let Some(stdin) = request.stdin() {
            if stdin.len() > self.limits.max_stdin_bytes {
                state.advance(ExecutionState::CompileFailed);
                return Ok(ExecutionOutcome::compile_error(format!(
                    "input is {} bytes; the limit is {} bytes",
                    stdin.len(),
                    self.limits.max_stdin_bytes
                )));
            }
        }

        let area = match self.packager.package(request.source()) {
            Ok(Package::Ready(area)) => area,
            Ok(Package::Empty) => {
                state.advance(ExecutionState::CompileFailed);
                return Ok(ExecutionOutcome::compile_error("no code to execute"));
            }
            Ok(Package::TooLarge { bytes, limit }) => {
                state.advance(ExecutionState::CompileFailed);
                return Ok(ExecutionOutcome::compile_error(format!(
                    "source is {} bytes; the limit is {} bytes",
                    bytes, limit
                )));
            }
            Err(e) => {
                state.advance(ExecutionState::Failed);
                return Err(e.into());
            }
        };

        let outcome = self.build_and_run(&area, request, cancel, &mut state).await;
        if let Err(ExecutionError::Infrastructure(_)) = &outcome {
            state.advance(ExecutionState::Failed);
        }
        // Removal failures are logged by close(); the outcome stands either way.
        let _ = area.close();
        outcome
    }

    async fn build_and_run(
        &self,
        area: &WorkArea,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
        state: &mut StateTracker,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        state.advance(ExecutionState::Compiling);
        match self.invoker.compile(area, cancel).await? {
            CompileStep::Succeeded => {}
            CompileStep::Failed { diagnostics } => {
                state.advance(ExecutionState::CompileFailed);
                return Ok(ExecutionOutcome::CompileError { diagnostics });
            }
            CompileStep::TimedOut { limit } => {
                state.advance(ExecutionState::CompileFailed);
                return Ok(ExecutionOutcome::compile_error(format!(
                    "compiler timed out after {}ms",
                    limit.as_millis()
                )));
            }
            CompileStep::Cancelled => {
                state.advance(ExecutionState::Cancelled);
                return Err(ExecutionError::Cancelled);
            }
        }

        state.advance(ExecutionState::Running);
        let timeout = self.limits.effective_run_timeout(request.timeout_ms());
        let step = self.invoker.run(area, request.stdin(), timeout, cancel).await?;

        let excerpt = ExcerptLimits {
            lines: self.limits.stderr_excerpt_lines,
            bytes: self.limits.stderr_excerpt_bytes,
        };
        match report::classify_run(step, timeout, excerpt) {
            Some(outcome) => {
                state.advance(match outcome {
                    ExecutionOutcome::TimedOut { .. } => ExecutionState::TimedOut,
                    _ => ExecutionState::Completed,
                });
                Ok(outcome)
            }
            None => {
                state.advance(ExecutionState::Cancelled);
                Err(ExecutionError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        for state in [
            ExecutionState::CompileFailed,
            ExecutionState::Completed,
            ExecutionState::TimedOut,
            ExecutionState::Cancelled,
            ExecutionState::Failed,
        ] {
            assert!(state.is_terminal(), "{:?} should be terminal", state);
        }
        for state in [
            ExecutionState::Created,
            ExecutionState::Packaging,
            ExecutionState::Compiling,
            ExecutionState::Running,
        ] {
            assert!(!state.is_terminal(), "{:?} should not be terminal", state);
        }
    }

    #[tokio::test]
    async fn test_cancel_handle_after_completion_is_noop() {
        let (tx, rx) = watch::channel(false);
        let handle = CancelHandle {
            token: CancellationToken::new(),
            done: rx,
        };
        drop(CompletionGuard(tx));

        assert!(handle.is_finished());
        assert!(!handle.cancel().await);
        assert!(!handle.cancel().await);
    }
}
