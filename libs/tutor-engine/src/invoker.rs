/// Toolchain Invoker - One Subprocess per Build or Run Step
///
/// **Core Responsibility:**
/// Start the configured compiler or runtime inside a work area and report
/// what happened, with the Governor enforcing the step's time budget and the
/// Collector capturing its streams.
///
/// **Process Rules:**
/// - Exactly one child per step, working directory = work area
/// - Program + argument vector, never a shell string
/// - Environment cleared, then only PATH, HOME, TMPDIR, LANG and the
///   toolchain's declared variables are set
/// - Each child leads its own process group so the whole tree can be killed
/// - The child never outlives the step that spawned it

use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use tutor_common::config::EngineLimits;
use tutor_common::types::{Diagnostic, Severity};

use crate::collector::{CapturedOutput, OutputCollector};
use crate::config::{CommandSpec, ToolchainConfig};
use crate::diagnostics;
use crate::error::InfrastructureError;
use crate::governor::{Governor, ProcessTree, Termination};
use crate::packager::WorkArea;

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How long readers get to hit EOF after the child is gone.
const DRAIN_WINDOW: Duration = Duration::from_millis(250);

/// Result of the build step.
#[derive(Debug)]
pub enum CompileStep {
    Succeeded,
    Failed { diagnostics: Vec<Diagnostic> },
    TimedOut { limit: Duration },
    Cancelled,
}

/// How the run step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTermination {
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    TimedOut,
    Cancelled,
}

/// Result of the run step, including whatever output was captured.
#[derive(Debug)]
pub struct RunStep {
    pub termination: RunTermination,
    pub output: CapturedOutput,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct ToolchainInvoker {
    toolchain: ToolchainConfig,
    governor: Governor,
    compile_timeout: Duration,
    max_output_bytes: usize,
}

impl ToolchainInvoker {
    pub fn new(toolchain: ToolchainConfig, limits: &EngineLimits) -> Self {
        Self {
            toolchain,
            governor: Governor::new(limits.kill_grace),
            compile_timeout: limits.compile_timeout,
            max_output_bytes: limits.max_output_bytes,
        }
    }

    pub fn toolchain(&self) -> &ToolchainConfig {
        &self.toolchain
    }

    /// Build the packaged source. Toolchains without a build step succeed immediately.
    #[instrument(skip_all, fields(toolchain = %self.toolchain.name))]
    pub async fn compile(
        &self,
        area: &WorkArea,
        cancel: &CancellationToken,
    ) -> Result<CompileStep, InfrastructureError> {
        let Some(spec) = &self.toolchain.compile else {
            return Ok(CompileStep::Succeeded);
        };

        let start = Instant::now();
        let (mut child, tree) = self.spawn(spec, area, false)?;
        let collector = OutputCollector::attach(child.stdout.take(), child.stderr.take(), self.max_output_bytes);

        let termination = self
            .governor
            .supervise(&mut child, &tree, self.compile_timeout, cancel)
            .await
            .map_err(|source| InfrastructureError::Wait {
                program: spec.program.clone(),
                source,
            })?;
        let output = collector.finish(DRAIN_WINDOW).await;
        let compilation_time_ms = start.elapsed().as_millis() as u64;

        let step = match termination {
            Termination::Exited(status) if status.success() => {
                info!(compilation_time_ms, "Compilation succeeded");
                CompileStep::Succeeded
            }
            Termination::Exited(status) => {
                let raw = compiler_output(&output);
                let mut diagnostics = diagnostics::compile_errors(&raw, status.code());
                if let Some(notice) = truncation_notice(&output) {
                    diagnostics.push(notice);
                }
                warn!(
                    compilation_time_ms,
                    exit_code = ?status.code(),
                    errors = diagnostics.len(),
                    error_preview = raw.lines().next().unwrap_or(""),
                    "Compilation failed"
                );
                CompileStep::Failed { diagnostics }
            }
            Termination::TimedOut => {
                warn!(compilation_time_ms, "Compiler timed out");
                CompileStep::TimedOut {
                    limit: self.compile_timeout,
                }
            }
            Termination::Cancelled => CompileStep::Cancelled,
        };
        Ok(step)
    }

    /// Run the built program with optional stdin under the given time budget.
    #[instrument(skip_all, fields(toolchain = %self.toolchain.name, timeout_ms = timeout.as_millis() as u64))]
    pub async fn run(
        &self,
        area: &WorkArea,
        stdin: Option<&str>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<RunStep, InfrastructureError> {
        let spec = &self.toolchain.run;
        let start = Instant::now();
        let (mut child, tree) = self.spawn(spec, area, stdin.is_some())?;
        let collector = OutputCollector::attach(child.stdout.take(), child.stderr.take(), self.max_output_bytes);
        let feeder = feed_stdin(&mut child, stdin);

        let supervised = self.governor.supervise(&mut child, &tree, timeout, cancel).await;
        if let Some(feeder) = feeder {
            feeder.abort();
        }
        let termination = supervised.map_err(|source| InfrastructureError::Wait {
            program: spec.program.clone(),
            source,
        })?;

        let output = collector.finish(DRAIN_WINDOW).await;
        let elapsed = start.elapsed();

        let termination = match termination {
            Termination::Exited(status) => RunTermination::Exited {
                code: status.code(),
                signal: exit_signal(&status),
            },
            Termination::TimedOut => RunTermination::TimedOut,
            Termination::Cancelled => RunTermination::Cancelled,
        };

        debug!(
            execution_ms = elapsed.as_millis() as u64,
            ?termination,
            stdout_bytes = output.stdout.total_bytes,
            stderr_bytes = output.stderr.total_bytes,
            "Run step finished"
        );

        Ok(RunStep {
            termination,
            output,
            elapsed,
        })
    }

    fn spawn(
        &self,
        spec: &CommandSpec,
        area: &WorkArea,
        with_stdin: bool,
    ) -> Result<(Child, ProcessTree), InfrastructureError> {
        let args = spec.resolve_args(area.source_file(), area.path());
        debug!(program = %spec.program, ?args, workdir = %area.path().display(), "Spawning step");

        let mut command = Command::new(&spec.program);
        command
            .args(&args)
            .current_dir(area.path())
            .env_clear()
            .envs(self.environment(area))
            .stdin(if with_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                InfrastructureError::ToolchainMissing {
                    program: spec.program.clone(),
                }
            } else {
                InfrastructureError::Spawn {
                    program: spec.program.clone(),
                    source,
                }
            }
        })?;
        let tree = ProcessTree::new(&child);
        Ok((child, tree))
    }

    fn environment(&self, area: &WorkArea) -> Vec<(String, String)> {
        let workdir = area.path().display().to_string();
        let path = self
            .toolchain
            .path
            .clone()
            .or_else(|| std::env::var("PATH").ok())
            .unwrap_or_else(|| FALLBACK_PATH.to_string());

        let mut env = vec![
            ("PATH".to_string(), path),
            ("HOME".to_string(), workdir.clone()),
            ("TMPDIR".to_string(), workdir),
            ("LANG".to_string(), "C.UTF-8".to_string()),
        ];
        for name in &self.toolchain.inherit_env {
            if let Ok(value) = std::env::var(name) {
                env.push((name.clone(), value));
            }
        }
        for (name, value) in &self.toolchain.env {
            env.push((name.clone(), value.clone()));
        }
        env
    }
}

/// Write stdin from a separate task and close it, so a child that never reads
/// cannot block the step.
fn feed_stdin(child: &mut Child, stdin: Option<&str>) -> Option<tokio::task::JoinHandle<()>> {
    let mut pipe = child.stdin.take()?;
    let data = stdin?.as_bytes().to_vec();
    Some(tokio::spawn(async move {
        if let Err(e) = pipe.write_all(&data).await {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                debug!(error = %e, "Failed to write stdin");
            }
        }
        // Dropping the pipe delivers EOF.
    }))
}

/// Compiler messages: stderr first, then stdout for compilers that print there.
fn compiler_output(output: &CapturedOutput) -> String {
    match (output.stderr.is_empty(), output.stdout.is_empty()) {
        (false, false) => format!("{}\n{}", output.stderr.text, output.stdout.text),
        (false, true) => output.stderr.text.clone(),
        _ => output.stdout.text.clone(),
    }
}

/// Labels compiler output that hit the capture cap, so cut diagnostics are never silent.
fn truncation_notice(output: &CapturedOutput) -> Option<Diagnostic> {
    let streams = [&output.stderr, &output.stdout];
    if !streams.iter().any(|s| s.truncated) {
        return None;
    }
    let shown: usize = streams.iter().map(|s| s.text.len()).sum();
    let total: u64 = streams.iter().map(|s| s.total_bytes).sum();
    Some(Diagnostic {
        severity: Severity::Info,
        line: None,
        column: None,
        message: format!("[compiler output truncated: showing first {} of {} bytes]", shown, total),
        context: Vec::new(),
    })
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::packager::{Package, SourcePackager};
    use std::collections::BTreeMap;

    fn sh_toolchain() -> ToolchainConfig {
        ToolchainConfig {
            name: "sh".to_string(),
            version: "posix".to_string(),
            source_file: "main.sh".to_string(),
            compile: Some(CommandSpec::new("sh", ["-n", "{source}"])),
            run: CommandSpec::new("sh", ["{source}"]),
            inherit_env: Vec::new(),
            env: BTreeMap::new(),
            path: None,
        }
    }

    fn limits() -> EngineLimits {
        EngineLimits {
            compile_timeout: Duration::from_secs(5),
            kill_grace: Duration::from_millis(200),
            ..EngineLimits::default()
        }
    }

    fn area(source: &str) -> WorkArea {
        let packager = SourcePackager::new("main.sh", None, 1024 * 1024);
        match packager.package(source).unwrap() {
            Package::Ready(area) => area,
            other => panic!("expected work area, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_compile_success_and_failure() {
        let invoker = ToolchainInvoker::new(sh_toolchain(), &limits());
        let cancel = CancellationToken::new();

        let ok = invoker.compile(&area("echo fine"), &cancel).await.unwrap();
        assert!(matches!(ok, CompileStep::Succeeded));

        let bad = invoker.compile(&area("if then fi (("), &cancel).await.unwrap();
        match bad {
            CompileStep::Failed { diagnostics } => assert!(!diagnostics.is_empty()),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_compiler_output_is_labelled() {
        let mut toolchain = sh_toolchain();
        toolchain.compile = Some(CommandSpec::new(
            "sh",
            ["-c", "head -c 5000 /dev/zero | tr '\\0' e >&2; exit 1"],
        ));
        let limits = EngineLimits {
            max_output_bytes: 100,
            ..limits()
        };
        let invoker = ToolchainInvoker::new(toolchain, &limits);

        let step = invoker.compile(&area("echo x"), &CancellationToken::new()).await.unwrap();
        let diagnostics = match step {
            CompileStep::Failed { diagnostics } => diagnostics,
            other => panic!("expected failure, got {:?}", other),
        };
        let notice = diagnostics.last().unwrap();
        assert_eq!(notice.severity, Severity::Info);
        assert_eq!(notice.message, "[compiler output truncated: showing first 100 of 5000 bytes]");
    }

    #[test]
    fn test_untruncated_output_has_no_notice() {
        let output = CapturedOutput {
            stdout: tutor_common::types::CapturedStream::new("ok"),
            stderr: tutor_common::types::CapturedStream::new("Main.kt:1:1: error: boom"),
        };
        assert!(truncation_notice(&output).is_none());
    }

    #[tokio::test]
    async fn test_compiler_hang_is_reported() {
        let mut toolchain = sh_toolchain();
        toolchain.compile = Some(CommandSpec::new("sleep", ["30"]));
        let limits = EngineLimits {
            compile_timeout: Duration::from_millis(200),
            ..limits()
        };
        let invoker = ToolchainInvoker::new(toolchain, &limits);

        let step = invoker.compile(&area("echo x"), &CancellationToken::new()).await.unwrap();
        assert!(matches!(step, CompileStep::TimedOut { limit } if limit == Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn test_run_feeds_stdin_and_captures() {
        let invoker = ToolchainInvoker::new(sh_toolchain(), &limits());
        let step = invoker
            .run(
                &area("read name; printf 'hi %s' \"$name\"; printf oops >&2; exit 4"),
                Some("ada\n"),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(step.termination, RunTermination::Exited { code: Some(4), signal: None });
        assert_eq!(step.output.stdout.text, "hi ada");
        assert_eq!(step.output.stderr.text, "oops");
    }

    #[tokio::test]
    async fn test_environment_is_scrubbed() {
        std::env::set_var("TUTOR_TEST_SECRET", "hunter2");
        let invoker = ToolchainInvoker::new(sh_toolchain(), &limits());
        let work = area("printf '%s|%s' \"${TUTOR_TEST_SECRET:-unset}\" \"$HOME\"");
        let expected_home = work.path().display().to_string();

        let step = invoker
            .run(&work, None, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(step.output.stdout.text, format!("unset|{}", expected_home));
    }

    #[tokio::test]
    async fn test_missing_toolchain_is_infrastructure_error() {
        let mut toolchain = sh_toolchain();
        toolchain.run = CommandSpec::new("definitely-not-a-real-compiler-xyz", Vec::<String>::new());
        let invoker = ToolchainInvoker::new(toolchain, &limits());

        let err = invoker
            .run(&area("x"), None, Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InfrastructureError::ToolchainMissing { .. }));
    }

    #[tokio::test]
    async fn test_arguments_are_not_shell_interpreted() {
        let mut toolchain = sh_toolchain();
        toolchain.run = CommandSpec::new("printf", ["%s", "$(echo injected); rm -rf {source}"]);
        let invoker = ToolchainInvoker::new(toolchain, &limits());
        let work = area("echo x");

        let step = invoker
            .run(&work, None, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(step.output.stdout.text, "$(echo injected); rm -rf main.sh");
        assert!(work.source_path().exists());
    }
}
