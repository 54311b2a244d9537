//! Verdicts and verdict aggregation
//!
//! A `Verdict` is the judged outcome of a single pass or a whole submission.
//! Verdicts are ordinary data, not errors: they are produced by the engine,
//! folded by `Verdicts`, and only surfaced to humans at the driver level.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

/// Verdict of one pass, testcase or submission.
///
/// The derived order is the severity order used for aggregation:
/// `Accepted` is least severe, `ValidatorCrash` most.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    #[default]
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    RuntimeError,
    /// The output validator broke its contract: bad exit code, or a reject
    /// combined with a next-pass artifact. Indicates a problem-setup bug,
    /// never a submission bug.
    ValidatorCrash,
}

impl Verdict {
    /// Two-or-three letter form used in per-testcase report lines.
    pub fn short(&self) -> &'static str {
        match self {
            Verdict::Accepted => "AC",
            Verdict::WrongAnswer => "WA",
            Verdict::TimeLimitExceeded => "TLE",
            Verdict::RuntimeError => "RTE",
            Verdict::ValidatorCrash => "VC",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Accepted => "accepted",
            Verdict::WrongAnswer => "wrong_answer",
            Verdict::TimeLimitExceeded => "time_limit_exceeded",
            Verdict::RuntimeError => "runtime_error",
            Verdict::ValidatorCrash => "validator_crash",
        };
        write!(f, "{}", s)
    }
}

/// Raw outcome of one program execution, before verdict interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Accepted,
    Rejected,
    Timeout,
    Error,
}

impl ExecStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ExecStatus::Accepted)
    }
}

/// Result of judging one testcase (possibly across multiple passes).
#[derive(Debug, Clone, Serialize)]
pub struct ExecResult {
    pub status: ExecStatus,
    /// Wall-clock duration; for multi-pass runs the maximum across passes.
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
    /// Whether the hard timeout was reached (as opposed to a plain soft TLE).
    pub timeout_expired: bool,
    /// Validator diagnostics: judgeerror.txt replaces captured stderr,
    /// judgemessage.txt fills in when stderr is empty.
    pub validator_error: Option<String>,
    /// Captured submission stderr.
    pub submission_error: Option<String>,
    pub verdict: Verdict,
    /// Pass that produced the verdict; `None` for single-pass problems.
    pub pass_index: Option<u32>,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Which testcases still need to run for a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunUntil {
    /// Stop as soon as any non-accepted verdict is known.
    FirstError,
    /// Keep timing testcases; stop only once a hard timeout occurred.
    Duration,
    /// Run every testcase.
    All,
}

/// Reduce verdicts to the most severe one; ties go to the first occurrence.
///
/// An empty iterator aggregates to `Accepted`.
pub fn aggregate<I>(verdicts: I) -> Verdict
where
    I: IntoIterator<Item = Verdict>,
{
    verdicts
        .into_iter()
        .fold(Verdict::Accepted, |acc, v| if v > acc { v } else { acc })
}

#[derive(Debug, Default)]
struct VerdictsInner {
    verdicts: Vec<Option<Verdict>>,
    durations: Vec<Option<Duration>>,
    /// Validator crashes counted separately from ordinary verdicts.
    error_count: usize,
}

/// Thread-safe per-submission verdict table with lazy judging.
///
/// Testcases are identified by name in a fixed iteration order. Worker tasks
/// record results with [`set`](Verdicts::set) and consult
/// [`run_is_needed`](Verdicts::run_is_needed) before starting work, so that
/// judging short-circuits once the submission verdict is decided.
#[derive(Debug)]
pub struct Verdicts {
    order: Vec<String>,
    index: HashMap<String, usize>,
    run_until: RunUntil,
    hard_timeout: Duration,
    inner: Mutex<VerdictsInner>,
}

impl Verdicts {
    pub fn new<I, S>(testcases: I, hard_timeout: Duration, run_until: RunUntil) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let order: Vec<String> = testcases.into_iter().map(Into::into).collect();
        let index = order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        let inner = VerdictsInner {
            verdicts: vec![None; order.len()],
            durations: vec![None; order.len()],
            error_count: 0,
        };
        Self {
            order,
            index,
            run_until,
            hard_timeout,
            inner: Mutex::new(inner),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Record the verdict and duration of one testcase.
    pub fn set(&self, testcase: &str, verdict: Verdict, duration: Duration) {
        let i = *self
            .index
            .get(testcase)
            .unwrap_or_else(|| panic!("unknown testcase {testcase}"));
        let mut inner = self.inner.lock().unwrap();
        assert!(
            inner.verdicts[i].is_none(),
            "verdict of {testcase} set twice"
        );
        inner.verdicts[i] = Some(verdict);
        inner.durations[i] = Some(duration);
        if verdict == Verdict::ValidatorCrash {
            inner.error_count += 1;
        }
    }

    /// Whether the given testcase still needs to run.
    ///
    /// `FirstError` skips everything once a non-accepted verdict is recorded;
    /// `Duration` keeps running until a hard timeout occurred; `All` never
    /// skips.
    pub fn run_is_needed(&self, testcase: &str) -> bool {
        let i = *self
            .index
            .get(testcase)
            .unwrap_or_else(|| panic!("unknown testcase {testcase}"));
        let inner = self.inner.lock().unwrap();
        if inner.verdicts[i].is_some() {
            return false;
        }
        match self.run_until {
            RunUntil::FirstError => inner
                .verdicts
                .iter()
                .flatten()
                .all(|v| *v == Verdict::Accepted),
            RunUntil::Duration => inner
                .durations
                .iter()
                .flatten()
                .all(|d| *d < self.hard_timeout),
            RunUntil::All => true,
        }
    }

    /// The aggregate submission verdict over everything recorded so far.
    ///
    /// `None` before any testcase finished.
    pub fn final_verdict(&self) -> Option<Verdict> {
        let inner = self.inner.lock().unwrap();
        let mut result = None;
        for v in inner.verdicts.iter().flatten() {
            result = Some(match result {
                Some(acc) if *v <= acc => acc,
                _ => *v,
            });
        }
        result
    }

    /// Maximum duration over all recorded testcases.
    pub fn max_duration(&self) -> Duration {
        let inner = self.inner.lock().unwrap();
        inner
            .durations
            .iter()
            .flatten()
            .copied()
            .max()
            .unwrap_or_default()
    }

    /// The testcase most salient to the submission verdict: the first
    /// rejected one, or the slowest one if everything was accepted.
    pub fn salient(&self) -> Option<(String, Duration)> {
        let inner = self.inner.lock().unwrap();
        let rejected = self
            .order
            .iter()
            .enumerate()
            .find(|(i, _)| matches!(inner.verdicts[*i], Some(v) if v != Verdict::Accepted));
        if let Some((i, name)) = rejected {
            return Some((name.clone(), inner.durations[i].unwrap_or_default()));
        }
        self.order
            .iter()
            .enumerate()
            .filter_map(|(i, name)| inner.durations[i].map(|d| (name.clone(), d)))
            .max_by_key(|(_, d)| *d)
    }

    /// Number of validator crashes seen so far.
    pub fn error_count(&self) -> usize {
        self.inner.lock().unwrap().error_count
    }

    /// Snapshot of `(name, verdict, duration)` rows in testcase order.
    pub fn rows(&self) -> Vec<(String, Option<Verdict>, Option<Duration>)> {
        let inner = self.inner.lock().unwrap();
        self.order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), inner.verdicts[i], inner.durations[i]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_order() {
        assert!(Verdict::Accepted < Verdict::WrongAnswer);
        assert!(Verdict::WrongAnswer < Verdict::TimeLimitExceeded);
        assert!(Verdict::TimeLimitExceeded < Verdict::RuntimeError);
        assert!(Verdict::RuntimeError < Verdict::ValidatorCrash);
    }

    #[test]
    fn test_verdict_display() {
        assert_eq!(Verdict::Accepted.to_string(), "accepted");
        assert_eq!(Verdict::WrongAnswer.to_string(), "wrong_answer");
        assert_eq!(Verdict::ValidatorCrash.short(), "VC");
    }

    #[test]
    fn test_aggregate_most_severe() {
        use Verdict::*;
        assert_eq!(aggregate([Accepted, WrongAnswer, Accepted]), WrongAnswer);
        assert_eq!(aggregate([Accepted; 5]), Accepted);
        assert_eq!(aggregate([ValidatorCrash, RuntimeError]), ValidatorCrash);
        assert_eq!(aggregate([RuntimeError, ValidatorCrash]), ValidatorCrash);
        assert_eq!(aggregate([]), Accepted);
    }

    #[test]
    fn test_lazy_skip_after_first_error() {
        let v = Verdicts::new(["a", "b", "c"], Duration::from_secs(3), RunUntil::FirstError);
        assert!(v.run_is_needed("a"));
        v.set("a", Verdict::Accepted, Duration::from_millis(10));
        assert!(v.run_is_needed("b"));
        v.set("b", Verdict::WrongAnswer, Duration::from_millis(20));
        assert!(!v.run_is_needed("c"));
        assert_eq!(v.final_verdict(), Some(Verdict::WrongAnswer));
    }

    #[test]
    fn test_duration_mode_runs_past_errors() {
        let v = Verdicts::new(["a", "b", "c"], Duration::from_secs(3), RunUntil::Duration);
        v.set("a", Verdict::WrongAnswer, Duration::from_millis(20));
        assert!(v.run_is_needed("b"));
        v.set("b", Verdict::TimeLimitExceeded, Duration::from_secs(3));
        assert!(!v.run_is_needed("c"));
    }

    #[test]
    fn test_salient_prefers_first_rejection() {
        let v = Verdicts::new(["a", "b", "c"], Duration::from_secs(3), RunUntil::All);
        v.set("a", Verdict::Accepted, Duration::from_millis(100));
        v.set("b", Verdict::RuntimeError, Duration::from_millis(10));
        v.set("c", Verdict::WrongAnswer, Duration::from_millis(10));
        assert_eq!(
            v.salient(),
            Some(("b".to_string(), Duration::from_millis(10)))
        );
        assert_eq!(v.final_verdict(), Some(Verdict::RuntimeError));
    }

    #[test]
    fn test_salient_slowest_when_accepted() {
        let v = Verdicts::new(["a", "b"], Duration::from_secs(3), RunUntil::All);
        v.set("a", Verdict::Accepted, Duration::from_millis(100));
        v.set("b", Verdict::Accepted, Duration::from_millis(200));
        assert_eq!(
            v.salient(),
            Some(("b".to_string(), Duration::from_millis(200)))
        );
    }

    #[test]
    fn test_error_count_tracks_crashes_only() {
        let v = Verdicts::new(["a", "b"], Duration::from_secs(3), RunUntil::All);
        v.set("a", Verdict::WrongAnswer, Duration::from_millis(10));
        v.set("b", Verdict::ValidatorCrash, Duration::from_millis(10));
        assert_eq!(v.error_count(), 1);
    }
}
