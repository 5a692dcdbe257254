use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One learner-submitted run of source code.
///
/// Fields are private so a request cannot change once it has been handed to
/// the engine; build it with [`ExecutionRequest::new`] and the `with_*` methods.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionRequest {
    source: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    stdin: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

impl ExecutionRequest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            session_id: None,
            stdin: None,
            timeout_ms: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    /// Requested wall-clock budget for the run step, before clamping.
    pub fn timeout_ms(&self) -> Option<u64> {
        self.timeout_ms
    }
}

/// Text captured from one standard stream of a child process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapturedStream {
    pub text: String,
    /// Set when the child wrote more than the capture cap; the excess was drained and dropped.
    pub truncated: bool,
    /// Total bytes the child wrote to the stream, including discarded ones.
    pub total_bytes: u64,
}

impl CapturedStream {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let total_bytes = text.len() as u64;
        Self {
            text,
            truncated: false,
            total_bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

/// A single compiler message, located in the learner's source when the
/// compiler reported a position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub message: String,
    /// Source excerpt and caret lines printed by the compiler under the message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            line: None,
            column: None,
            message: message.into(),
            context: Vec::new(),
        }
    }

    pub fn at(mut self, line: u32, column: Option<u32>) -> Self {
        self.line = Some(line);
        self.column = column;
        self
    }
}

/// Terminal classification of an execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The source never produced a runnable artifact. Always holds at least one diagnostic.
    CompileError { diagnostics: Vec<Diagnostic> },
    /// The program ran and ended with a non-zero exit or a signal.
    RuntimeFailure {
        exit_code: Option<i32>,
        signal: Option<i32>,
        stdout: CapturedStream,
        stderr_excerpt: String,
    },
    /// The run exceeded its wall-clock budget and was killed.
    TimedOut {
        timeout_ms: u64,
        stdout: CapturedStream,
        stderr: CapturedStream,
    },
    Success {
        stdout: CapturedStream,
        stderr: CapturedStream,
        exit_code: i32,
    },
}

impl ExecutionOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            ExecutionOutcome::CompileError { .. } => OutcomeKind::CompileError,
            ExecutionOutcome::RuntimeFailure { .. } => OutcomeKind::RuntimeFailure,
            ExecutionOutcome::TimedOut { .. } => OutcomeKind::TimedOut,
            ExecutionOutcome::Success { .. } => OutcomeKind::Success,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    pub fn compile_error(message: impl Into<String>) -> Self {
        ExecutionOutcome::CompileError {
            diagnostics: vec![Diagnostic::error(message)],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    CompileError,
    RuntimeFailure,
    TimedOut,
    Success,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::CompileError => "compile_error",
            OutcomeKind::RuntimeFailure => "runtime_failure",
            OutcomeKind::TimedOut => "timed_out",
            OutcomeKind::Success => "success",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an execution came from and how long it took.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionMeta {
    pub execution_id: Uuid,
    pub session_id: Option<String>,
    pub toolchain: String,
    pub elapsed_ms: u64,
    pub finished_at: DateTime<Utc>,
}

/// Final, display-ready result of one execution.
///
/// Built once by the engine and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionResult {
    #[serde(flatten)]
    meta: ExecutionMeta,
    outcome: ExecutionOutcome,
    summary: String,
}

impl ExecutionResult {
    pub fn new(meta: ExecutionMeta, outcome: ExecutionOutcome, summary: String) -> Self {
        Self {
            meta,
            outcome,
            summary,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.meta.execution_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.meta.session_id.as_deref()
    }

    pub fn meta(&self) -> &ExecutionMeta {
        &self.meta
    }

    pub fn outcome(&self) -> &ExecutionOutcome {
        &self.outcome
    }

    /// Ready-to-display text for the output pane.
    pub fn summary(&self) -> &str {
        &self.summary
    }
}
