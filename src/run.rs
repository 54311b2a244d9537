//! One (submission, testcase) evaluation
//!
//! A `Run` owns the scratch layout for one testcase evaluation and decides
//! between batch execution (pipe the input through the submission, then let
//! the external validator diff the produced output) and the interactive
//! engine. It may span multiple passes; its process groups never do.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::{crop_output, JudgeConfig};
use crate::error::JudgeError;
use crate::interactive;
use crate::problem::{Problem, Testcase};
use crate::program::{
    apply_limits, build_command, drain_stderr, exit_code, read_feedback, Program, Validator,
};
use crate::verdict::{ExecResult, ExecStatus, Verdict};

/// Binds one submission to one testcase for evaluation.
#[derive(Debug)]
pub struct Run {
    pub problem: Arc<Problem>,
    pub submission: Arc<Program>,
    pub validator: Arc<Validator>,
    pub testcase: Testcase,
    /// Extra arguments appended to the submission command.
    pub submission_args: Vec<String>,
    /// Scratch directory exclusive to this run.
    pub dir: PathBuf,
    pub in_path: PathBuf,
    pub out_path: PathBuf,
    pub feedback_dir: PathBuf,
}

impl Run {
    /// Prepare the scratch layout under
    /// `<work>/runs/<submission>/<testcase>/` and stage the input file.
    pub fn new(
        problem: Arc<Problem>,
        submission: Arc<Program>,
        validator: Arc<Validator>,
        testcase: Testcase,
    ) -> Result<Self> {
        if submission.run_command.is_empty() {
            return Err(JudgeError::EmptyCommand(submission.name.clone()).into());
        }
        let dir = problem
            .work_dir
            .join("runs")
            .join(&submission.name)
            .join(&testcase.name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to clear run dir {}", dir.display()))?;
        }
        let feedback_dir = dir.join("feedback");
        std::fs::create_dir_all(&feedback_dir)
            .with_context(|| format!("Failed to create {}", feedback_dir.display()))?;

        let in_path = dir.join("testcase.in");
        std::fs::copy(&testcase.in_path, &in_path).with_context(|| {
            format!("Failed to stage input {}", testcase.in_path.display())
        })?;

        Ok(Self {
            out_path: dir.join("testcase.out"),
            problem,
            submission,
            validator,
            testcase,
            submission_args: Vec::new(),
            in_path,
            feedback_dir,
            dir,
        })
    }

    pub(crate) fn nextpass_path(&self) -> PathBuf {
        self.feedback_dir.join("nextpass.in")
    }

    /// Fold per-testcase results into one submission verdict.
    pub fn aggregate<'a, I>(results: I) -> Verdict
    where
        I: IntoIterator<Item = &'a ExecResult>,
    {
        crate::verdict::aggregate(results.into_iter().map(|r| r.verdict))
    }

    /// Judge this testcase and return the amended result.
    pub async fn run(&self, cfg: &JudgeConfig) -> Result<ExecResult> {
        let result = if self.problem.interactive || self.problem.multi_pass {
            interactive::run_interactive(self, &self.submission_args, cfg).await?
        } else {
            self.run_batch(cfg).await?
        };

        if result.verdict != Verdict::Accepted
            && !self.problem.multi_pass
            && self.nextpass_path().is_file()
        {
            warn!(
                "{}: validator created nextpass.in for a single-pass problem; ignored",
                self.testcase.name
            );
        }
        Ok(result)
    }

    /// Batch judging: run the submission over the input file, then hand the
    /// produced output to the validator.
    async fn run_batch(&self, cfg: &JudgeConfig) -> Result<ExecResult> {
        let limits = &self.problem.limits;
        let time_limit = limits.time_limit();
        let hard_timeout = limits.hard_timeout();

        let mut argv = self.submission.run_command.clone();
        argv.extend(self.submission_args.iter().cloned());
        debug!("Submission: {:?} < {}", argv, self.in_path.display());

        let stdin = std::fs::File::open(&self.in_path)
            .with_context(|| format!("Failed to open {}", self.in_path.display()))?;
        let stdout = std::fs::File::create(&self.out_path)
            .with_context(|| format!("Failed to create {}", self.out_path.display()))?;

        let mut cmd = build_command(&argv, &self.submission.work_dir)?;
        cmd.stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_limits(&mut cmd, Some(hard_timeout), limits.memory_bytes, None);

        let start = Instant::now();
        let mut child = cmd.spawn().context("Failed to spawn submission")?;
        let stderr = drain_stderr(&mut child);

        let (code, duration, aborted) =
            match tokio::time::timeout(hard_timeout, child.wait()).await {
                Ok(status) => {
                    let code = exit_code(&status.context("Failed to wait for submission")?);
                    (code, start.elapsed(), false)
                }
                Err(_) => {
                    child.start_kill().ok();
                    let status = child.wait().await.context("Failed to reap submission")?;
                    (exit_code(&status), hard_timeout, true)
                }
            };
        let submission_stderr = stderr.await.unwrap_or_default();
        let submission_error =
            (!submission_stderr.is_empty()).then(|| crop_output(&submission_stderr, cfg.error_limit));

        if aborted || duration > time_limit {
            return Ok(ExecResult {
                status: ExecStatus::Timeout,
                duration,
                timeout_expired: aborted || duration >= hard_timeout,
                validator_error: None,
                submission_error,
                verdict: Verdict::TimeLimitExceeded,
                pass_index: None,
            });
        }
        if code != 0 {
            return Ok(ExecResult {
                status: ExecStatus::Error,
                duration,
                timeout_expired: false,
                validator_error: None,
                submission_error: Some(match submission_error {
                    Some(err) => format!("Exited with code {code}:\n{err}"),
                    None => format!("Exited with code {code}"),
                }),
                verdict: Verdict::RuntimeError,
                pass_index: None,
            });
        }

        let outcome = self
            .validator
            .run(
                &self.in_path,
                &self.testcase.ans_path,
                &self.feedback_dir,
                Some(&self.out_path),
                &self.problem.validator_args,
                limits.validator_time(),
                limits.validator_memory_bytes,
            )
            .await?;

        let feedback = read_feedback(&self.feedback_dir, &outcome.stderr);
        let validator_error = (!feedback.is_empty()).then(|| crop_output(&feedback, cfg.error_limit));

        let (status, verdict) = if outcome.accepted() {
            (ExecStatus::Accepted, Verdict::Accepted)
        } else if outcome.rejected() {
            (ExecStatus::Rejected, Verdict::WrongAnswer)
        } else {
            tracing::error!(
                "{}: validator exited with non-contract code {}",
                self.testcase.name,
                outcome.exit_code
            );
            (ExecStatus::Error, Verdict::ValidatorCrash)
        };

        Ok(ExecResult {
            status,
            duration,
            timeout_expired: false,
            validator_error,
            submission_error,
            verdict,
            pass_index: None,
        })
    }

    /// Stage the validator's continuation artifact as the next pass's input.
    ///
    /// Clears everything in the run directory except the feedback directory,
    /// then moves `nextpass.in` over the staged input. Returns whether a
    /// next pass exists.
    pub(crate) fn prepare_next_pass(&self) -> Result<bool> {
        let nextpass = self.nextpass_path();
        if !nextpass.is_file() {
            return Ok(false);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path == self.feedback_dir {
                continue;
            }
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        std::fs::rename(&nextpass, &self.in_path)
            .context("Failed to stage nextpass.in as next input")?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::Limits;
    use crate::program::ValidatorKind;

    fn fixture(work: &std::path::Path) -> Run {
        let data = work.join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("1.in"), "42\n").unwrap();
        std::fs::write(data.join("1.ans"), "42\n").unwrap();

        let problem = Arc::new(Problem {
            name: "sum".to_string(),
            interactive: false,
            multi_pass: false,
            limits: Limits::default(),
            validator_args: vec![],
            work_dir: work.to_path_buf(),
        });
        let submission = Arc::new(Program::new(
            "echo",
            vec!["/bin/cat".to_string()],
            work,
        ));
        let validator = Arc::new(Validator {
            kind: ValidatorKind::General,
            program: Program::new("val", vec!["/bin/true".to_string()], work),
        });
        let testcase = Testcase::from_input(&data.join("1.in"));
        Run::new(problem, submission, validator, testcase).unwrap()
    }

    #[test]
    fn test_scratch_layout() {
        let work = tempfile::tempdir().unwrap();
        let run = fixture(work.path());
        assert!(run.in_path.is_file());
        assert!(run.feedback_dir.is_dir());
        assert_eq!(std::fs::read_to_string(&run.in_path).unwrap(), "42\n");
    }

    #[test]
    fn test_prepare_next_pass_moves_artifact() {
        let work = tempfile::tempdir().unwrap();
        let run = fixture(work.path());
        std::fs::write(&run.out_path, "stale output").unwrap();
        std::fs::write(run.nextpass_path(), "second round\n").unwrap();
        std::fs::write(run.feedback_dir.join("judgemessage.txt"), "kept").unwrap();

        assert!(run.prepare_next_pass().unwrap());
        assert_eq!(
            std::fs::read_to_string(&run.in_path).unwrap(),
            "second round\n"
        );
        assert!(!run.out_path.exists());
        assert!(!run.nextpass_path().exists());
        // The feedback directory survives the sweep.
        assert!(run.feedback_dir.join("judgemessage.txt").is_file());
    }

    #[test]
    fn test_empty_run_command_is_rejected() {
        let work = tempfile::tempdir().unwrap();
        let data = work.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("1.in"), "").unwrap();

        let problem = Arc::new(Problem {
            name: "sum".to_string(),
            interactive: false,
            multi_pass: false,
            limits: Limits::default(),
            validator_args: vec![],
            work_dir: work.path().to_path_buf(),
        });
        let submission = Arc::new(Program::new("broken", vec![], work.path()));
        let validator = Arc::new(Validator {
            kind: ValidatorKind::General,
            program: Program::new("val", vec!["/bin/true".to_string()], work.path()),
        });
        let err = Run::new(
            problem,
            submission,
            validator,
            Testcase::from_input(&data.join("1.in")),
        )
        .unwrap_err();
        assert!(err.to_string().contains("empty run command"));
    }

    #[test]
    fn test_prepare_next_pass_without_artifact() {
        let work = tempfile::tempdir().unwrap();
        let run = fixture(work.path());
        assert!(!run.prepare_next_pass().unwrap());
        assert!(run.in_path.is_file());
    }
}
