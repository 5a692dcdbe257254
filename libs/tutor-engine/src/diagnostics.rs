// Compiler diagnostic parsing
//
// Understands the `file:line[:col]: severity: message` shape printed by
// kotlinc, javac, gcc-style compilers and friends. Lines that do not match are
// the compiler's source excerpt and caret, attached to the message above them.

use lazy_static::lazy_static;
use regex::Regex;
use tutor_common::types::{Diagnostic, Severity};

lazy_static! {
    static ref DIAGNOSTIC_LINE: Regex = Regex::new(
        r"^(?:[^:\s][^:]*):(?P<line>\d+):(?:(?P<col>\d+):)?\s*(?P<sev>error|warning|info|note):\s*(?P<msg>.*)$"
    )
    .expect("diagnostic regex is valid");
}

fn severity(raw: &str) -> Severity {
    match raw {
        "error" => Severity::Error,
        "warning" => Severity::Warning,
        _ => Severity::Info,
    }
}

/// Every diagnostic found in `output`, in the order the compiler printed them.
pub fn parse(output: &str) -> Vec<Diagnostic> {
    let mut diagnostics: Vec<Diagnostic> = Vec::new();

    for line in output.lines() {
        let line = line.trim_end();
        if let Some(caps) = DIAGNOSTIC_LINE.captures(line) {
            let line_no = caps["line"].parse::<u32>().ok();
            let column = caps.name("col").and_then(|c| c.as_str().parse::<u32>().ok());
            diagnostics.push(Diagnostic {
                severity: severity(&caps["sev"]),
                line: line_no,
                column,
                message: caps["msg"].to_string(),
                context: Vec::new(),
            });
        } else if let Some(last) = diagnostics.last_mut() {
            if !line.trim().is_empty() {
                last.context.push(line.to_string());
            }
        }
    }

    diagnostics
}

/// Error diagnostics for a failed compile; never empty.
///
/// Falls back to one diagnostic carrying the raw compiler output when nothing
/// parses, or a generic message when the compiler printed nothing at all.
pub fn compile_errors(output: &str, exit_code: Option<i32>) -> Vec<Diagnostic> {
    let errors: Vec<Diagnostic> = parse(output)
        .into_iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        return errors;
    }

    let raw = output.trim();
    if !raw.is_empty() {
        return vec![Diagnostic::error(raw)];
    }

    let message = match exit_code {
        Some(code) => format!("compilation failed with exit code {} and no diagnostics", code),
        None => "compilation failed without diagnostics".to_string(),
    };
    vec![Diagnostic::error(message)]
}
