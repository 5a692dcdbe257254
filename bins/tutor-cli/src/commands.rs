// CLI commands for running code through the engine
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tutor_common::config::EngineLimits;
use tutor_common::types::{ExecutionOutcome, ExecutionRequest};
use tutor_engine::config::active_toolchain_name;
use tutor_engine::{ExecutionCoordinator, ToolchainRegistry};

/// Exit status when the program was killed for running too long, as timeout(1) does.
const EXIT_TIMED_OUT: i32 = 124;
const EXIT_COMPILE_ERROR: i32 = 2;
const EXIT_RUNTIME_FAILURE: i32 = 1;
const EXIT_INTERRUPTED: i32 = 130;

pub struct RunOptions {
    pub file: PathBuf,
    pub stdin: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
    pub toolchain: Option<String>,
    pub json: bool,
}

fn load_registry(config: Option<&Path>) -> Result<ToolchainRegistry> {
    match config {
        Some(path) => ToolchainRegistry::load(path),
        None => ToolchainRegistry::load_default(),
    }
}

/// Process exit status for an outcome: zero only for success.
pub fn exit_code(outcome: &ExecutionOutcome) -> i32 {
    match outcome {
        ExecutionOutcome::Success { .. } => 0,
        ExecutionOutcome::CompileError { .. } => EXIT_COMPILE_ERROR,
        ExecutionOutcome::RuntimeFailure { .. } => EXIT_RUNTIME_FAILURE,
        ExecutionOutcome::TimedOut { .. } => EXIT_TIMED_OUT,
    }
}

/// Execute one source file and print its result. Returns the exit status to use.
pub async fn run_file(config: Option<&Path>, options: RunOptions) -> Result<i32> {
    let registry = load_registry(config)?;
    let name = options.toolchain.unwrap_or_else(active_toolchain_name);
    let toolchain = registry.get(&name)?.clone();

    let source = fs::read_to_string(&options.file)
        .with_context(|| format!("Failed to read {}", options.file.display()))?;
    let mut request = ExecutionRequest::new(source);
    if let Some(path) = &options.stdin {
        let input = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        request = request.with_stdin(input);
    }
    if let Some(timeout_ms) = options.timeout_ms {
        request = request.with_timeout_ms(timeout_ms);
    }

    let coordinator = ExecutionCoordinator::new(toolchain, EngineLimits::from_env());
    let handle = coordinator.submit(request);
    let cancel = handle.cancel_handle();

    let result = tokio::select! {
        result = handle.result() => result.context("Execution did not produce a result")?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("⚠️  Interrupted, stopping program...");
            cancel.cancel().await;
            return Ok(EXIT_INTERRUPTED);
        }
    };

    if options.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        let summary = result.summary();
        if summary.ends_with('\n') {
            print!("{}", summary);
        } else {
            println!("{}", summary);
        }
    }

    Ok(exit_code(result.outcome()))
}

/// List all configured toolchains
pub fn list_toolchains(config: Option<&Path>) -> Result<()> {
    let registry = load_registry(config)?;
    let active = active_toolchain_name();

    println!("📋 Configured Toolchains:\n");
    println!("{:<10} {:<10} {:<14} {:<20} {:<20}", "Name", "Version", "Source", "Compile", "Run");
    println!("{}", "─".repeat(78));

    let names = registry.list_toolchains();
    for name in &names {
        let toolchain = registry.get(name)?;
        let marker = if *name == active { " *" } else { "" };
        println!(
            "{:<10} {:<10} {:<14} {:<20} {:<20}",
            format!("{}{}", toolchain.name, marker),
            toolchain.version,
            toolchain.source_file,
            toolchain.compile.as_ref().map(|c| c.program.as_str()).unwrap_or("-"),
            toolchain.run.program,
        );
    }

    println!("\n✅ Total: {} toolchain(s), * = active", names.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutor_common::types::CapturedStream;

    #[test]
    fn test_only_success_exits_zero() {
        let success = ExecutionOutcome::Success {
            stdout: CapturedStream::new("hi"),
            stderr: CapturedStream::default(),
            exit_code: 0,
        };
        assert_eq!(exit_code(&success), 0);
        assert_eq!(exit_code(&ExecutionOutcome::compile_error("boom")), EXIT_COMPILE_ERROR);

        let timed_out = ExecutionOutcome::TimedOut {
            timeout_ms: 100,
            stdout: CapturedStream::default(),
            stderr: CapturedStream::default(),
        };
        assert_eq!(exit_code(&timed_out), EXIT_TIMED_OUT);

        let crashed = ExecutionOutcome::RuntimeFailure {
            exit_code: Some(3),
            signal: None,
            stdout: CapturedStream::default(),
            stderr_excerpt: String::new(),
        };
        assert_eq!(exit_code(&crashed), EXIT_RUNTIME_FAILURE);
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let err = load_registry(Some(Path::new("/nonexistent/toolchains.json"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
