/// Result Builder - Outcome Classification and Rendering
///
/// **Core Responsibility:**
/// Turn a finished run step into an [`ExecutionOutcome`] and render any
/// outcome into the text the output pane shows.
///
/// **Critical Properties:**
/// - No I/O, no clock, no randomness: same input, same text
/// - Success output appears verbatim
/// - Timeouts and truncation are always spelled out

use std::fmt::Write as _;
use std::time::Duration;
use tutor_common::types::{
    CapturedStream, Diagnostic, ExecutionMeta, ExecutionOutcome, ExecutionResult,
};

use crate::invoker::{RunStep, RunTermination};

const NO_OUTPUT: &str = "Program finished with no output.";
const STDERR_HEADER: &str = "--- stderr ---";

/// Bounds for the stderr excerpt kept in a runtime failure.
#[derive(Debug, Clone, Copy)]
pub struct ExcerptLimits {
    pub lines: usize,
    pub bytes: usize,
}

/// Classify a finished run step. `None` means the step was cancelled and no
/// outcome exists.
pub fn classify_run(step: RunStep, timeout: Duration, excerpt: ExcerptLimits) -> Option<ExecutionOutcome> {
    let RunStep { termination, output, .. } = step;
    match termination {
        RunTermination::Cancelled => None,
        RunTermination::TimedOut => Some(ExecutionOutcome::TimedOut {
            timeout_ms: timeout.as_millis() as u64,
            stdout: output.stdout,
            stderr: output.stderr,
        }),
        RunTermination::Exited { code: Some(0), .. } => Some(ExecutionOutcome::Success {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: 0,
        }),
        RunTermination::Exited { code, signal } => Some(ExecutionOutcome::RuntimeFailure {
            exit_code: code,
            signal,
            stderr_excerpt: stderr_excerpt(&output.stderr, excerpt),
            stdout: output.stdout,
        }),
    }
}

/// Leading lines of stderr (where exception headers live), capped in lines and bytes.
pub fn stderr_excerpt(stderr: &CapturedStream, limits: ExcerptLimits) -> String {
    let lines: Vec<&str> = stderr.text.trim_end().lines().collect();
    let mut excerpt = lines
        .iter()
        .take(limits.lines)
        .copied()
        .collect::<Vec<_>>()
        .join("\n");

    let cut = excerpt.len() > limits.bytes;
    if cut {
        let end = floor_char_boundary(&excerpt, limits.bytes);
        excerpt.truncate(end);
    }

    if cut || stderr.truncated {
        excerpt.push_str("\n[stderr truncated]");
    } else if lines.len() > limits.lines {
        let _ = write!(excerpt, "\n[... {} more lines]", lines.len() - limits.lines);
    }
    excerpt
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Wrap an outcome and its rendered summary into the final result.
pub fn build(meta: ExecutionMeta, outcome: ExecutionOutcome) -> ExecutionResult {
    let summary = render_summary(&outcome);
    ExecutionResult::new(meta, outcome, summary)
}

/// Human-readable text for the output pane.
pub fn render_summary(outcome: &ExecutionOutcome) -> String {
    let mut out = String::new();
    match outcome {
        ExecutionOutcome::Success { stdout, stderr, .. } => {
            if stdout.is_empty() && stderr.is_empty() {
                out.push_str(NO_OUTPUT);
            } else {
                push_stream(&mut out, stdout);
                push_stderr_section(&mut out, stderr);
            }
        }
        ExecutionOutcome::CompileError { diagnostics } => {
            out.push_str("Compilation failed:");
            for diagnostic in diagnostics {
                out.push('\n');
                push_diagnostic(&mut out, diagnostic);
            }
        }
        ExecutionOutcome::RuntimeFailure {
            exit_code,
            signal,
            stdout,
            stderr_excerpt,
        } => {
            push_stream(&mut out, stdout);
            separate(&mut out);
            out.push_str(&describe_exit(*exit_code, *signal));
            if !stderr_excerpt.is_empty() {
                let _ = write!(out, "\n{}\n{}", STDERR_HEADER, stderr_excerpt);
            }
        }
        ExecutionOutcome::TimedOut {
            timeout_ms,
            stdout,
            stderr,
        } => {
            push_stream(&mut out, stdout);
            push_stderr_section(&mut out, stderr);
            separate(&mut out);
            let _ = write!(out, "[execution timed out after {}]", format_seconds(*timeout_ms));
        }
    }
    out
}

fn push_stream(out: &mut String, stream: &CapturedStream) {
    out.push_str(&stream.text);
    if stream.truncated {
        separate(out);
        let _ = write!(
            out,
            "[output truncated: showing first {} of {} bytes]",
            stream.text.len(),
            stream.total_bytes
        );
    }
}

fn push_stderr_section(out: &mut String, stderr: &CapturedStream) {
    if stderr.is_empty() {
        return;
    }
    separate(out);
    out.push_str(STDERR_HEADER);
    out.push('\n');
    push_stream(out, stderr);
}

/// Start a new line unless `out` is empty or already ends with one.
fn separate(out: &mut String) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

fn push_diagnostic(out: &mut String, diagnostic: &Diagnostic) {
    out.push_str("  ");
    match (diagnostic.line, diagnostic.column) {
        (Some(line), Some(col)) => {
            let _ = write!(out, "line {}, column {}: ", line, col);
        }
        (Some(line), None) => {
            let _ = write!(out, "line {}: ", line);
        }
        _ => {}
    }
    let _ = write!(out, "{}: {}", diagnostic.severity, diagnostic.message);
    for context in &diagnostic.context {
        let _ = write!(out, "\n    {}", context);
    }
}

fn describe_exit(exit_code: Option<i32>, signal: Option<i32>) -> String {
    match (exit_code, signal) {
        (_, Some(signal)) => match signal_hint(signal) {
            Some(hint) => format!("Program was terminated by signal {} ({})", signal, hint),
            None => format!("Program was terminated by signal {}", signal),
        },
        (Some(code), None) => match exit_code_hint(code) {
            Some(hint) => format!("Program exited with code {} ({})", code, hint),
            None => format!("Program exited with code {}", code),
        },
        (None, None) => "Program terminated abnormally".to_string(),
    }
}

fn signal_hint(signal: i32) -> Option<&'static str> {
    match signal {
        6 => Some("SIGABRT: aborted"),
        8 => Some("SIGFPE: arithmetic error"),
        9 => Some("SIGKILL: likely out of memory"),
        11 => Some("SIGSEGV: segmentation fault"),
        15 => Some("SIGTERM"),
        _ => None,
    }
}

/// Shell-style 128+N codes reported by wrappers that re-raise as exit codes.
fn exit_code_hint(code: i32) -> Option<&'static str> {
    match code {
        137 => Some("killed: likely out of memory"),
        139 => Some("segmentation fault"),
        _ => None,
    }
}

fn format_seconds(ms: u64) -> String {
    if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}
