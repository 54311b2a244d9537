//! Judging configuration
//!
//! One explicitly constructed `JudgeConfig` value is passed down from the
//! driver to every Run and session; there is no process-global state.

use std::path::PathBuf;
use std::thread;

use crate::verdict::RunUntil;

/// How many bytes of captured stderr/diagnostics to keep per run.
pub const DEFAULT_ERROR_LIMIT: usize = 4096;

#[derive(Debug, Clone)]
pub struct JudgeConfig {
    /// Number of scheduler workers. `0` runs tasks inline on `put`.
    pub jobs: usize,
    /// Lazy-judging mode.
    pub run_until: RunUntil,
    /// Append an annotated interaction transcript to this file.
    pub interaction: Option<PathBuf>,
    /// Use process groups and racing waits. Disabled on platforms without
    /// them; can be switched off to exercise the sequential fallback.
    pub process_groups: bool,
    /// Truncation limit for captured diagnostics.
    pub error_limit: usize,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            jobs: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            run_until: RunUntil::FirstError,
            interaction: None,
            process_groups: cfg!(unix),
            error_limit: DEFAULT_ERROR_LIMIT,
        }
    }
}

impl JudgeConfig {
    /// Load configuration with environment overrides.
    ///
    /// `JUDGEKIT_JOBS` sets the worker count, `JUDGEKIT_RUN_UNTIL` one of
    /// `first_error`/`duration`/`all`, `JUDGEKIT_INTERACTION` a transcript
    /// path.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(jobs) = std::env::var("JUDGEKIT_JOBS") {
            if let Ok(jobs) = jobs.parse() {
                config.jobs = jobs;
            }
        }
        if let Ok(mode) = std::env::var("JUDGEKIT_RUN_UNTIL") {
            config.run_until = match mode.as_str() {
                "duration" => RunUntil::Duration,
                "all" => RunUntil::All,
                _ => RunUntil::FirstError,
            };
        }
        if let Ok(path) = std::env::var("JUDGEKIT_INTERACTION") {
            config.interaction = Some(PathBuf::from(path));
        }
        config
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_run_until(mut self, run_until: RunUntil) -> Self {
        self.run_until = run_until;
        self
    }
}

/// Crop captured output to `limit` bytes on a character boundary, appending a
/// marker when something was cut.
pub fn crop_output(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[...truncated...]", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_workers() {
        assert!(JudgeConfig::default().jobs >= 1);
    }

    #[test]
    fn test_crop_output() {
        assert_eq!(crop_output("short", 100), "short");
        let cropped = crop_output(&"x".repeat(100), 10);
        assert!(cropped.starts_with("xxxxxxxxxx"));
        assert!(cropped.ends_with("[...truncated...]"));
    }
}
