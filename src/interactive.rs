//! Interactive judging engine
//!
//! Runs one pass of validator↔submission interaction: the two programs are
//! spawned into a shared process group with their stdio cross-wired over
//! pipes, raced to completion under a wall-clock watchdog, and the pass
//! verdict is resolved from which side finished first and how. Multi-pass
//! problems loop passes, feeding the validator's `nextpass.in` artifact back
//! as the next input.
//!
//! Whichever side finishes first is authoritative for the accept/reject
//! question, but is overridden by the other side's hard failure; timeouts
//! and contract violations dominate a plain accept.

use anyhow::{Context, Result};
use std::os::fd::OwnedFd;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::{crop_output, JudgeConfig};
use crate::program::{
    apply_limits, build_command, drain_stderr, exit_code, read_feedback, GroupRole,
    VALIDATOR_ACCEPT, VALIDATOR_REJECT,
};
use crate::relay::{self, Transcript, TEAM_MARKER, VALIDATOR_MARKER};
use crate::run::Run;
use crate::verdict::{ExecResult, ExecStatus, RunUntil, Verdict};

/// Which of the two racing processes exited first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstExit {
    Validator,
    Submission,
}

/// Everything the verdict of one pass depends on.
#[derive(Debug, Clone, Copy)]
pub struct PassObservation {
    pub validator_code: i32,
    pub submission_code: i32,
    /// A `nextpass.in` continuation artifact exists (multi-pass only).
    pub nextpass: bool,
    /// Submission wall time exceeded the (soft) time limit.
    pub timed_out: bool,
    /// Submission wall time reached the hard timeout, or the watchdog killed it.
    pub aborted: bool,
    pub first: FirstExit,
}

/// Resolve the verdict of one pass. Pure; the rules apply in order.
pub fn resolve_verdict(obs: &PassObservation) -> Verdict {
    // A validator outside its exit-code contract is a crash no matter what
    // the submission did, as is rejecting while asking for another pass.
    if obs.validator_code != VALIDATOR_ACCEPT && obs.validator_code != VALIDATOR_REJECT {
        return Verdict::ValidatorCrash;
    }
    if obs.validator_code == VALIDATOR_REJECT && obs.nextpass {
        return Verdict::ValidatorCrash;
    }
    if obs.aborted {
        return Verdict::TimeLimitExceeded;
    }
    match obs.first {
        FirstExit::Validator => {
            // The validator decided first; a reject beats a later submission
            // failure, but not a timeout.
            if obs.timed_out {
                Verdict::TimeLimitExceeded
            } else if obs.validator_code == VALIDATOR_REJECT {
                Verdict::WrongAnswer
            } else if obs.submission_code != 0 {
                Verdict::RuntimeError
            } else {
                Verdict::Accepted
            }
        }
        FirstExit::Submission => {
            if obs.submission_code != 0 {
                Verdict::RuntimeError
            } else if obs.timed_out {
                Verdict::TimeLimitExceeded
            } else if obs.validator_code == VALIDATOR_REJECT {
                Verdict::WrongAnswer
            } else {
                Verdict::Accepted
            }
        }
    }
}

/// Verdict resolution for the sequential fallback, which cannot observe exit
/// order: a timeout deterministically beats a stale validator verdict.
pub fn resolve_sequential_verdict(
    validator_code: i32,
    nextpass: bool,
    submission_code: i32,
    timed_out: bool,
) -> Verdict {
    if validator_code != VALIDATOR_ACCEPT && validator_code != VALIDATOR_REJECT {
        return Verdict::ValidatorCrash;
    }
    if validator_code == VALIDATOR_REJECT && nextpass {
        return Verdict::ValidatorCrash;
    }
    if timed_out {
        return Verdict::TimeLimitExceeded;
    }
    if submission_code != 0 {
        return Verdict::RuntimeError;
    }
    if validator_code == VALIDATOR_REJECT {
        return Verdict::WrongAnswer;
    }
    Verdict::Accepted
}

/// Outcome of one pass, diagnostics included.
struct PassResult {
    verdict: Verdict,
    duration: Duration,
    aborted: bool,
    validator_error: Option<String>,
    submission_error: Option<String>,
}

/// One pass of validator↔submission interaction.
struct InteractiveSession<'a> {
    run: &'a Run,
    submission_args: &'a [String],
    cfg: &'a JudgeConfig,
    transcript: Option<Transcript>,
}

impl<'a> InteractiveSession<'a> {
    /// Process-group mode: both programs race, the watchdog arbitrates.
    async fn run_pass_grouped(&self) -> Result<PassResult> {
        let run = self.run;
        let limits = &run.problem.limits;
        let time_limit = limits.time_limit();
        let hard_timeout = limits.hard_timeout();
        let validator_time = limits.validator_time();

        let validator_argv = run.validator.invocation(
            &run.in_path,
            &run.testcase.ans_path,
            &run.feedback_dir,
            &run.problem.validator_args,
        );
        let mut submission_argv = run.submission.run_command.clone();
        submission_argv.extend(self.submission_args.iter().cloned());
        debug!("Validator:  {:?}", validator_argv);
        debug!("Submission: {:?}", submission_argv);

        // Two unidirectional channels; with a transcript each one is split in
        // half around a relay.
        let (team_read, team_write) = relay::channel()?;
        let (val_read, val_write) = relay::channel()?;
        let mut relays: Vec<JoinHandle<()>> = Vec::new();

        let validator_stdin: OwnedFd;
        let submission_stdout = team_write;
        let submission_stdin: OwnedFd;
        let validator_stdout = val_write;
        if let Some(transcript) = &self.transcript {
            let (team_fwd_read, team_fwd_write) = relay::channel()?;
            let (val_fwd_read, val_fwd_write) = relay::channel()?;
            relays.push(relay::spawn(
                team_read,
                team_fwd_write,
                transcript.clone(),
                TEAM_MARKER,
            )?);
            relays.push(relay::spawn(
                val_read,
                val_fwd_write,
                transcript.clone(),
                VALIDATOR_MARKER,
            )?);
            validator_stdin = team_fwd_read;
            submission_stdin = val_fwd_read;
        } else {
            validator_stdin = team_read;
            submission_stdin = val_read;
        }

        // The validator leads the process group; everything else joins it.
        let mut cmd = build_command(&validator_argv, &run.validator.program.work_dir)?;
        cmd.stdin(Stdio::from(validator_stdin))
            .stdout(Stdio::from(validator_stdout))
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_limits(
            &mut cmd,
            Some(validator_time),
            limits.validator_memory_bytes,
            Some(GroupRole::Leader),
        );
        let mut validator = cmd.spawn().context("Failed to spawn validator")?;
        let gid = validator.id().context("validator pid unavailable")? as i32;
        let validator_stderr = drain_stderr(&mut validator);
        // Drop the builder so the parent releases its copies of the pipe ends
        // it handed to the child; otherwise the retained write end keeps the
        // peer's reader from ever seeing EOF.
        drop(cmd);

        let start = Instant::now();
        let mut cmd = build_command(&submission_argv, &run.submission.work_dir)?;
        cmd.stdin(Stdio::from(submission_stdin))
            .stdout(Stdio::from(submission_stdout))
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_limits(
            &mut cmd,
            Some(hard_timeout),
            limits.memory_bytes,
            Some(GroupRole::Member(gid)),
        );
        let mut submission = cmd.spawn().context("Failed to spawn submission")?;
        let submission_pid = submission.id().context("submission pid unavailable")? as i32;
        let submission_stderr = drain_stderr(&mut submission);
        // Release the parent's copies of the submission's pipe ends too, so the
        // only writers left are the two children.
        drop(cmd);

        // Wall-clock watchdog: kill the submission at the hard timeout and
        // escalate to the whole group once the validator's window is also
        // over. Disarmed when both processes have been reaped.
        let fired = Arc::new(AtomicBool::new(false));
        let (disarm_tx, disarm_rx) = watch::channel(false);
        let watchdog = tokio::spawn(watchdog(
            hard_timeout,
            validator_time,
            submission_pid,
            gid,
            Arc::clone(&fired),
            disarm_rx,
        ));

        // One supervisor per process; the first message fixes the exit order.
        let (tx, mut rx) = mpsc::channel::<(FirstExit, std::io::Result<std::process::ExitStatus>, Duration)>(2);
        {
            let tx = tx.clone();
            tokio::spawn(async move {
                let status = validator.wait().await;
                let _ = tx.send((FirstExit::Validator, status, start.elapsed())).await;
            });
        }
        {
            let tx = tx.clone();
            tokio::spawn(async move {
                let status = submission.wait().await;
                let _ = tx
                    .send((FirstExit::Submission, status, start.elapsed()))
                    .await;
            });
        }
        drop(tx);

        let mut first = None;
        let mut validator_code = None;
        let mut submission_code = None;
        let mut submission_elapsed = Duration::ZERO;
        while validator_code.is_none() || submission_code.is_none() {
            let (which, status, elapsed) =
                rx.recv().await.context("process supervisors vanished")?;
            let code = exit_code(&status.context("Failed to wait for child")?);
            match which {
                FirstExit::Validator => {
                    validator_code = Some(code);
                    if first.is_none() {
                        first = Some(FirstExit::Validator);
                        if code != VALIDATOR_ACCEPT {
                            // Pass already decided; no point letting the
                            // submission keep running.
                            kill_group(gid);
                        }
                    }
                }
                FirstExit::Submission => {
                    submission_code = Some(code);
                    submission_elapsed = elapsed;
                    if first.is_none() {
                        first = Some(FirstExit::Submission);
                    }
                }
            }
        }
        let _ = disarm_tx.send(true);
        watchdog.await.ok();
        for handle in relays {
            handle.await.ok();
        }

        let aborted =
            fired.load(Ordering::SeqCst) || submission_elapsed >= hard_timeout;
        let obs = PassObservation {
            validator_code: validator_code.unwrap(),
            submission_code: submission_code.unwrap(),
            nextpass: run.problem.multi_pass && run.nextpass_path().is_file(),
            timed_out: submission_elapsed > time_limit,
            aborted,
            first: first.unwrap(),
        };
        let verdict = resolve_verdict(&obs);
        if verdict == Verdict::ValidatorCrash {
            if obs.validator_code == VALIDATOR_REJECT && obs.nextpass {
                error!(
                    "{}: validator rejected but wrote nextpass.in",
                    run.testcase.name
                );
            } else if obs.validator_code != VALIDATOR_ACCEPT {
                error!(
                    "{}: validator exited with non-contract code {}",
                    run.testcase.name, obs.validator_code
                );
            }
        }

        Ok(self.finish_pass(
            verdict,
            submission_elapsed,
            aborted,
            validator_stderr.await.unwrap_or_default(),
            submission_stderr.await.unwrap_or_default(),
        ))
    }

    /// Sequential fallback for platforms without group wait/kill: run the
    /// submission to completion first, then collect the validator. Cannot
    /// tell a validator reject from a submission timeout when both are near
    /// their limits; the timeout wins.
    async fn run_pass_sequential(&self) -> Result<PassResult> {
        let run = self.run;
        let limits = &run.problem.limits;
        let time_limit = limits.time_limit();
        let hard_timeout = limits.hard_timeout();
        let validator_time = limits.validator_time();

        let validator_argv = run.validator.invocation(
            &run.in_path,
            &run.testcase.ans_path,
            &run.feedback_dir,
            &run.problem.validator_args,
        );
        let mut submission_argv = run.submission.run_command.clone();
        submission_argv.extend(self.submission_args.iter().cloned());
        if self.transcript.is_some() {
            warn!("interaction transcripts are not recorded in sequential mode");
        }

        let (team_read, team_write) = relay::channel()?;
        let (val_read, val_write) = relay::channel()?;

        let mut cmd = build_command(&validator_argv, &run.validator.program.work_dir)?;
        cmd.stdin(Stdio::from(team_read))
            .stdout(Stdio::from(val_write))
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_limits(
            &mut cmd,
            Some(validator_time),
            limits.validator_memory_bytes,
            None,
        );
        let mut validator = cmd.spawn().context("Failed to spawn validator")?;
        let validator_stderr = drain_stderr(&mut validator);
        // See run_pass_grouped: drop the builder so the parent stops holding
        // the child's pipe ends open.
        drop(cmd);

        let start = Instant::now();
        let mut cmd = build_command(&submission_argv, &run.submission.work_dir)?;
        cmd.stdin(Stdio::from(val_read))
            .stdout(Stdio::from(team_write))
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_limits(&mut cmd, Some(hard_timeout), limits.memory_bytes, None);
        let mut submission = cmd.spawn().context("Failed to spawn submission")?;
        let submission_stderr = drain_stderr(&mut submission);
        drop(cmd);

        let (submission_code, duration, watchdog_killed) =
            match tokio::time::timeout(hard_timeout, submission.wait()).await {
                Ok(status) => {
                    let code = exit_code(&status.context("Failed to wait for submission")?);
                    (code, start.elapsed(), false)
                }
                Err(_) => {
                    submission.start_kill().ok();
                    let status = submission
                        .wait()
                        .await
                        .context("Failed to reap submission")?;
                    (exit_code(&status), hard_timeout, true)
                }
            };

        let validator_code = match tokio::time::timeout(validator_time, validator.wait()).await {
            Ok(status) => exit_code(&status.context("Failed to wait for validator")?),
            Err(_) => {
                validator.start_kill().ok();
                exit_code(&validator.wait().await.context("Failed to reap validator")?)
            }
        };

        let aborted = watchdog_killed || duration >= hard_timeout;
        let nextpass = run.problem.multi_pass && run.nextpass_path().is_file();
        let verdict = resolve_sequential_verdict(
            validator_code,
            nextpass,
            submission_code,
            aborted || duration > time_limit,
        );
        if verdict == Verdict::ValidatorCrash {
            error!(
                "{}: validator broke contract (exit {}, nextpass: {})",
                run.testcase.name, validator_code, nextpass
            );
        }

        Ok(self.finish_pass(
            verdict,
            duration,
            aborted,
            validator_stderr.await.unwrap_or_default(),
            submission_stderr.await.unwrap_or_default(),
        ))
    }

    fn finish_pass(
        &self,
        verdict: Verdict,
        duration: Duration,
        aborted: bool,
        validator_stderr: String,
        submission_stderr: String,
    ) -> PassResult {
        let feedback = read_feedback(&self.run.feedback_dir, &validator_stderr);
        let validator_error =
            (!feedback.is_empty()).then(|| crop_output(&feedback, self.cfg.error_limit));
        let submission_error = (!submission_stderr.is_empty())
            .then(|| crop_output(&submission_stderr, self.cfg.error_limit));
        PassResult {
            verdict,
            duration,
            aborted,
            validator_error,
            submission_error,
        }
    }
}

async fn watchdog(
    hard_timeout: Duration,
    validator_time: Duration,
    submission_pid: i32,
    gid: i32,
    fired: Arc<AtomicBool>,
    mut disarm: watch::Receiver<bool>,
) {
    let disarmed = |rx: &mut watch::Receiver<bool>| {
        let mut rx = rx.clone();
        async move {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = disarmed(&mut disarm) => return,
        _ = tokio::time::sleep(hard_timeout) => {}
    }
    fired.store(true, Ordering::SeqCst);
    kill_process(submission_pid);

    if validator_time > hard_timeout {
        tokio::select! {
            _ = disarmed(&mut disarm) => return,
            _ = tokio::time::sleep(validator_time - hard_timeout) => {}
        }
    }
    if !*disarm.borrow() {
        kill_group(gid);
    }
}

fn kill_process(pid: i32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
}

fn kill_group(gid: i32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    let _ = killpg(Pid::from_raw(gid), Signal::SIGKILL);
}

/// Whether a multi-pass run may continue past a soft TLE.
fn continue_with_tle(run: &Run, cfg: &JudgeConfig, aborted: bool) -> bool {
    if !run.problem.multi_pass {
        return false;
    }
    if cfg.run_until == RunUntil::All {
        return true;
    }
    if aborted {
        return false;
    }
    cfg.run_until == RunUntil::Duration
}

/// Judge one testcase interactively, looping passes for multi-pass problems.
///
/// Reports the final pass's decisive verdict (a recorded TLE wins), the
/// maximum duration observed across passes, and the pass index for
/// multi-pass problems.
pub async fn run_interactive(
    run: &Run,
    submission_args: &[String],
    cfg: &JudgeConfig,
) -> Result<ExecResult> {
    let transcript = match &cfg.interaction {
        Some(path) => Some(Transcript::open(path).await?),
        None => None,
    };

    let mut pass_index: u32 = 0;
    let mut max_duration = Duration::ZERO;
    let mut tle_result: Option<ExecResult> = None;

    let last = loop {
        pass_index += 1;
        let session = InteractiveSession {
            run,
            submission_args,
            cfg,
            transcript: transcript.clone(),
        };
        let mut pass = if cfg.process_groups && cfg!(unix) {
            session.run_pass_grouped().await?
        } else {
            session.run_pass_sequential().await?
        };
        max_duration = max_duration.max(pass.duration);

        if pass.verdict == Verdict::TimeLimitExceeded {
            match &mut tle_result {
                None => {
                    tle_result = Some(pass_exec_result(run, &pass, pass_index));
                }
                Some(result) => result.timeout_expired |= pass.aborted,
            }
        }

        let continues = match pass.verdict {
            Verdict::Accepted => true,
            Verdict::TimeLimitExceeded => continue_with_tle(run, cfg, pass.aborted),
            _ => false,
        };
        if !continues {
            break pass;
        }
        // Only multi-pass problems consume the continuation artifact.
        if !run.problem.multi_pass || !run.prepare_next_pass()? {
            break pass;
        }
        if pass_index >= run.problem.limits.max_passes {
            error!(
                "{}: validator exceeded limit of {} passes",
                run.testcase.name, run.problem.limits.max_passes
            );
            pass.verdict = Verdict::ValidatorCrash;
            break pass;
        }
        if let Some(transcript) = &transcript {
            transcript.separator().await?;
        }
    };

    let mut result = match tle_result {
        Some(result) => result,
        None => pass_exec_result(run, &last, pass_index),
    };
    result.duration = max_duration;
    Ok(result)
}

fn pass_exec_result(run: &Run, pass: &PassResult, pass_index: u32) -> ExecResult {
    let status = match pass.verdict {
        Verdict::Accepted => ExecStatus::Accepted,
        Verdict::WrongAnswer => ExecStatus::Rejected,
        Verdict::TimeLimitExceeded => ExecStatus::Timeout,
        _ => ExecStatus::Error,
    };
    ExecResult {
        status,
        duration: pass.duration,
        timeout_expired: pass.aborted,
        validator_error: pass.validator_error.clone(),
        submission_error: pass.submission_error.clone(),
        verdict: pass.verdict,
        pass_index: run.problem.multi_pass.then_some(pass_index),
    }
}
