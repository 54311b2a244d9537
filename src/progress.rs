//! Progress reporting at task boundaries
//!
//! Rendering (progress bars, verdict tables) lives outside this crate; the
//! engine only emits start/done/log events per judged testcase.

use crate::verdict::{ExecResult, Verdict};
use tracing::{error, info, warn};

pub trait Reporter: Send + Sync {
    fn started(&self, name: &str);
    fn done(&self, name: &str, result: &ExecResult);
    fn log(&self, name: &str, message: &str);
}

/// Reports through the tracing subsystem; validator crashes escalate to
/// error level since they indicate a problem-setup bug.
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn started(&self, name: &str) {
        info!("Judging {}", name);
    }

    fn done(&self, name: &str, result: &ExecResult) {
        match result.verdict {
            Verdict::Accepted => info!(
                "{}: {} {:.3}s",
                name,
                result.verdict.short(),
                result.duration.as_secs_f64()
            ),
            Verdict::ValidatorCrash => error!(
                "{}: {} {}",
                name,
                result.verdict.short(),
                result.validator_error.as_deref().unwrap_or("")
            ),
            _ => warn!(
                "{}: {} {:.3}s",
                name,
                result.verdict.short(),
                result.duration.as_secs_f64()
            ),
        }
    }

    fn log(&self, name: &str, message: &str) {
        info!("{}: {}", name, message);
    }
}

/// Swallows all events; used by tests.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn started(&self, _name: &str) {}
    fn done(&self, _name: &str, _result: &ExecResult) {}
    fn log(&self, _name: &str, _message: &str) {}
}
