use thiserror::Error;

/// The host environment is broken; nothing the learner typed caused this.
#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("toolchain executable `{program}` was not found")]
    ToolchainMissing { program: String },

    #[error("no toolchain named `{0}` is configured")]
    UnknownToolchain(String),

    #[error("failed to allocate work area")]
    WorkArea(#[source] std::io::Error),

    #[error("failed to spawn `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for `{program}`")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("execution worker failed: {0}")]
    Worker(String),
}

/// Why an execution produced no [`ExecutionResult`](tutor_common::types::ExecutionResult).
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Cancelled explicitly or superseded by a newer request for the same session.
    #[error("execution was cancelled")]
    Cancelled,

    #[error(transparent)]
    Infrastructure(#[from] InfrastructureError),
}
