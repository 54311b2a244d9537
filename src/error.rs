//! Typed errors for unrecoverable failures.
//!
//! Judging outcomes (wrong answers, timeouts, validator crashes) are data and
//! travel through `ExecResult`; the types here cover the cases where judging
//! itself cannot proceed.

use thiserror::Error;

/// Raised by tasks that observe a scheduler abort and bail out early.
#[derive(Debug, Clone, Copy, Error)]
#[error("judging aborted")]
pub struct Aborted;

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("no output validator configured for problem {0}")]
    MissingValidator(String),
    #[error("empty run command for program {0}")]
    EmptyCommand(String),
}
