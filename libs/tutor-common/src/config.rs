// Engine limits shared by the engine and its front ends

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_RUN_TIMEOUT_MS: u64 = 10_000;
pub const MAX_RUN_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_COMPILE_TIMEOUT_MS: u64 = 8_000;
pub const DEFAULT_KILL_GRACE_MS: u64 = 500;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;
pub const DEFAULT_STDERR_EXCERPT_BYTES: usize = 4 * 1024;
pub const DEFAULT_STDERR_EXCERPT_LINES: usize = 20;
pub const MAX_SOURCE_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_STDIN_BYTES: usize = 1024 * 1024; // 1MB

/// Timeouts, capture caps and pool size for the execution engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLimits {
    pub run_timeout: Duration,
    /// Upper bound for per-request timeout overrides.
    pub max_run_timeout: Duration,
    pub compile_timeout: Duration,
    /// Time between the polite termination signal and the forced kill.
    pub kill_grace: Duration,
    pub max_output_bytes: usize,
    pub stderr_excerpt_bytes: usize,
    pub stderr_excerpt_lines: usize,
    pub max_source_bytes: usize,
    pub max_stdin_bytes: usize,
    pub workers: usize,
    /// Parent directory for work areas; the system temp dir when unset.
    pub work_root: Option<PathBuf>,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_millis(DEFAULT_RUN_TIMEOUT_MS),
            max_run_timeout: Duration::from_millis(MAX_RUN_TIMEOUT_MS),
            compile_timeout: Duration::from_millis(DEFAULT_COMPILE_TIMEOUT_MS),
            kill_grace: Duration::from_millis(DEFAULT_KILL_GRACE_MS),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            stderr_excerpt_bytes: DEFAULT_STDERR_EXCERPT_BYTES,
            stderr_excerpt_lines: DEFAULT_STDERR_EXCERPT_LINES,
            max_source_bytes: MAX_SOURCE_BYTES,
            max_stdin_bytes: MAX_STDIN_BYTES,
            workers: num_cpus::get().max(1),
            work_root: None,
        }
    }
}

impl EngineLimits {
    /// Defaults overridden by `TUTOR_*` environment variables.
    ///
    /// Unparseable values are ignored rather than rejected so a typo in the
    /// environment never prevents the engine from starting.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        };
        let count = |key: &str| lookup(key).and_then(|v| v.trim().parse::<usize>().ok());

        let mut limits = Self::default();
        if let Some(v) = millis("TUTOR_RUN_TIMEOUT_MS") {
            limits.run_timeout = v;
        }
        if let Some(v) = millis("TUTOR_MAX_RUN_TIMEOUT_MS") {
            limits.max_run_timeout = v;
        }
        if let Some(v) = millis("TUTOR_COMPILE_TIMEOUT_MS") {
            limits.compile_timeout = v;
        }
        if let Some(v) = millis("TUTOR_KILL_GRACE_MS") {
            limits.kill_grace = v;
        }
        if let Some(v) = count("TUTOR_MAX_OUTPUT_BYTES") {
            limits.max_output_bytes = v;
        }
        if let Some(v) = count("TUTOR_WORKERS") {
            limits.workers = v.max(1);
        }
        if let Some(v) = lookup("TUTOR_WORK_ROOT").filter(|v| !v.trim().is_empty()) {
            limits.work_root = Some(PathBuf::from(v));
        }
        if limits.max_run_timeout < limits.run_timeout {
            limits.max_run_timeout = limits.run_timeout;
        }
        limits
    }

    /// Run budget for a request: its override clamped to `max_run_timeout`,
    /// or the default when it asked for none.
    pub fn effective_run_timeout(&self, requested_ms: Option<u64>) -> Duration {
        match requested_ms {
            Some(ms) => Duration::from_millis(ms.max(1)).min(self.max_run_timeout),
            None => self.run_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let limits = EngineLimits::default();
        assert!(limits.compile_timeout < limits.run_timeout);
        assert!(limits.run_timeout <= limits.max_run_timeout);
        assert!(limits.workers >= 1);
        assert!(limits.work_root.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let limits = EngineLimits::from_lookup(lookup_from(&[
            ("TUTOR_RUN_TIMEOUT_MS", "2000"),
            ("TUTOR_WORKERS", "3"),
            ("TUTOR_MAX_OUTPUT_BYTES", "1024"),
            ("TUTOR_WORK_ROOT", "/var/tmp/tutor"),
        ]));
        assert_eq!(limits.run_timeout, Duration::from_secs(2));
        assert_eq!(limits.workers, 3);
        assert_eq!(limits.max_output_bytes, 1024);
        assert_eq!(limits.work_root, Some(PathBuf::from("/var/tmp/tutor")));
    }

    #[test]
    fn test_env_garbage_ignored() {
        let limits = EngineLimits::from_lookup(lookup_from(&[
            ("TUTOR_RUN_TIMEOUT_MS", "soon"),
            ("TUTOR_WORKERS", "0"),
        ]));
        assert_eq!(limits.run_timeout, Duration::from_millis(DEFAULT_RUN_TIMEOUT_MS));
        assert_eq!(limits.workers, 1);
    }

    #[test]
    fn test_max_never_below_default() {
        let limits = EngineLimits::from_lookup(lookup_from(&[
            ("TUTOR_RUN_TIMEOUT_MS", "60000"),
            ("TUTOR_MAX_RUN_TIMEOUT_MS", "1000"),
        ]));
        assert_eq!(limits.max_run_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_effective_run_timeout_clamps() {
        let limits = EngineLimits::default();
        assert_eq!(limits.effective_run_timeout(None), limits.run_timeout);
        assert_eq!(
            limits.effective_run_timeout(Some(1500)),
            Duration::from_millis(1500)
        );
        assert_eq!(
            limits.effective_run_timeout(Some(10 * MAX_RUN_TIMEOUT_MS)),
            limits.max_run_timeout
        );
        assert_eq!(limits.effective_run_timeout(Some(0)), Duration::from_millis(1));
    }
}
