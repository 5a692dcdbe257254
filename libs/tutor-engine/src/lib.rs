//! Sandboxed compile-and-run engine behind the lesson tutor.
//!
//! [`ExecutionCoordinator`] is the entry point: hand it an
//! [`ExecutionRequest`](tutor_common::types::ExecutionRequest) and it packages,
//! compiles, and runs the code under a time limit, returning exactly one
//! [`ExecutionResult`](tutor_common::types::ExecutionResult) or an
//! [`ExecutionError`].

pub mod collector;
pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod error;
pub mod governor;
pub mod invoker;
pub mod packager;
pub mod report;


pub use config::{ToolchainConfig, ToolchainRegistry};
pub use coordinator::{CancelHandle, ExecutionCoordinator, ExecutionHandle, ExecutionState};
pub use error::{ExecutionError, InfrastructureError};
