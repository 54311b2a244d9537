//! Built programs and the output-validator contract
//!
//! Programs arrive here prebuilt: some upstream builder has already turned a
//! source tree into a runnable argument vector. This module knows how to
//! spawn them under resource limits and how to talk to output validators.
//!
//! A validator must exit with exactly one of two contract codes; anything
//! else is a crash, regardless of what the submission did.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::debug;

/// Validator exit code meaning "output accepted".
pub const VALIDATOR_ACCEPT: i32 = 42;
/// Validator exit code meaning "output rejected".
pub const VALIDATOR_REJECT: i32 = 43;

/// A ready-to-execute program: the output of the (out-of-scope) builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    /// Argument vector; first element is the executable.
    pub run_command: Vec<String>,
    /// Directory the program runs in.
    pub work_dir: PathBuf,
}

impl Program {
    pub fn new(name: impl Into<String>, run_command: Vec<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            run_command,
            work_dir: work_dir.into(),
        }
    }
}

/// The two validator flavors, dispatched through one invocation shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorKind {
    /// Judges a produced output stream: argv `[in, ans, feedback_dir]`,
    /// team output on stdin.
    General,
    /// Judges a testcase input file fed on stdin; no path arguments.
    Format,
}

/// An output/input validator with the accept/reject exit-code contract.
#[derive(Debug, Clone)]
pub struct Validator {
    pub kind: ValidatorKind,
    pub program: Program,
}

impl Validator {
    /// Build the argument vector for one invocation.
    pub fn invocation(
        &self,
        in_path: &Path,
        ans_path: &Path,
        feedback_dir: &Path,
        args: &[String],
    ) -> Vec<String> {
        let mut argv = self.program.run_command.clone();
        if self.kind == ValidatorKind::General {
            argv.push(in_path.display().to_string());
            argv.push(ans_path.display().to_string());
            argv.push(feedback_dir.display().to_string());
        }
        argv.extend(args.iter().cloned());
        argv
    }

    /// Run the validator over a finished output file (batch judging) or, for
    /// the format kind, over the input file itself.
    ///
    /// Returns the raw decision; interpreting it into a verdict is the
    /// caller's job.
    pub async fn run(
        &self,
        in_path: &Path,
        ans_path: &Path,
        feedback_dir: &Path,
        out_path: Option<&Path>,
        args: &[String],
        time: Duration,
        memory: Option<u64>,
    ) -> Result<ValidatorOutcome> {
        let argv = self.invocation(in_path, ans_path, feedback_dir, args);
        debug!("Running validator: {:?}", argv);

        let stdin_path = match self.kind {
            ValidatorKind::General => {
                out_path.context("general validator needs a produced output file")?
            }
            ValidatorKind::Format => in_path,
        };
        let stdin = std::fs::File::open(stdin_path)
            .with_context(|| format!("Failed to open {}", stdin_path.display()))?;

        let mut cmd = build_command(&argv, &self.program.work_dir)?;
        cmd.stdin(Stdio::from(stdin))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_limits(&mut cmd, Some(time), memory, None);

        let start = Instant::now();
        let mut child = cmd.spawn().context("Failed to spawn validator")?;
        let stderr = drain_stderr(&mut child);

        let status = match tokio::time::timeout(time, child.wait()).await {
            Ok(status) => status.context("Failed to wait for validator")?,
            Err(_) => {
                child.start_kill().ok();
                child.wait().await.context("Failed to reap validator")?
            }
        };

        Ok(ValidatorOutcome {
            exit_code: exit_code(&status),
            duration: start.elapsed(),
            stderr: stderr.await.unwrap_or_default(),
        })
    }
}

/// Raw result of one validator invocation.
#[derive(Debug)]
pub struct ValidatorOutcome {
    pub exit_code: i32,
    pub duration: Duration,
    pub stderr: String,
}

impl ValidatorOutcome {
    pub fn accepted(&self) -> bool {
        self.exit_code == VALIDATOR_ACCEPT
    }

    pub fn rejected(&self) -> bool {
        self.exit_code == VALIDATOR_REJECT
    }

    /// Exit code outside the contract.
    pub fn crashed(&self) -> bool {
        !self.accepted() && !self.rejected()
    }
}

/// Validator diagnostics: `judgeerror.txt` replaces the captured stderr
/// entirely; `judgemessage.txt` only fills in when stderr is empty.
pub fn read_feedback(feedback_dir: &Path, stderr: &str) -> String {
    if let Ok(text) = std::fs::read_to_string(feedback_dir.join("judgeerror.txt")) {
        return text;
    }
    if stderr.is_empty() {
        if let Ok(text) = std::fs::read_to_string(feedback_dir.join("judgemessage.txt")) {
            return text;
        }
    }
    stderr.to_string()
}

/// Build a `Command` from an argument vector.
pub(crate) fn build_command(argv: &[String], work_dir: &Path) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .context("empty command")?;
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(work_dir);
    Ok(cmd)
}

/// Role of a process in its pass's process group.
#[derive(Debug, Clone, Copy)]
pub(crate) enum GroupRole {
    /// First process of the pass; its pid becomes the group id.
    Leader,
    /// Joins the group led by the given pid.
    Member(i32),
}

/// Apply CPU/memory rlimits and process-group membership at spawn time.
///
/// Runs in the forked child just before exec, so only async-signal-safe
/// calls are allowed here.
pub(crate) fn apply_limits(
    cmd: &mut Command,
    cpu: Option<Duration>,
    memory: Option<u64>,
    group: Option<GroupRole>,
) {
    #[cfg(unix)]
    {
        use nix::sys::resource::{setrlimit, Resource};
        use nix::unistd::{setpgid, Pid};

        let cpu_secs = cpu.map(|d| d.as_secs_f64().ceil() as u64);
        let pgid = group.map(|g| match g {
            GroupRole::Leader => 0,
            GroupRole::Member(pid) => pid,
        });
        unsafe {
            cmd.pre_exec(move || {
                if let Some(pgid) = pgid {
                    setpgid(Pid::from_raw(0), Pid::from_raw(pgid))
                        .map_err(std::io::Error::from)?;
                }
                if let Some(secs) = cpu_secs {
                    setrlimit(Resource::RLIMIT_CPU, secs, secs + 1)
                        .map_err(std::io::Error::from)?;
                }
                if let Some(bytes) = memory {
                    setrlimit(Resource::RLIMIT_AS, bytes, bytes)
                        .map_err(std::io::Error::from)?;
                }
                Ok(())
            });
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (cmd, cpu, memory, group);
    }
}

/// Map an exit status to a code, folding signal deaths to `-1`.
pub(crate) fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Collect a child's stderr concurrently so the pipe never fills up.
pub(crate) fn drain_stderr(child: &mut Child) -> tokio::task::JoinHandle<String> {
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        match stderr {
            Some(mut stderr) => {
                use tokio::io::AsyncReadExt;
                let mut buf = Vec::new();
                stderr.read_to_end(&mut buf).await.ok();
                String::from_utf8_lossy(&buf).into_owned()
            }
            None => String::new(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(kind: ValidatorKind) -> Validator {
        Validator {
            kind,
            program: Program::new("val", vec!["./validator".to_string()], "."),
        }
    }

    #[test]
    fn test_general_invocation_order() {
        let v = validator(ValidatorKind::General);
        let argv = v.invocation(
            Path::new("/t/1.in"),
            Path::new("/t/1.ans"),
            Path::new("/t/feedback"),
            &["case_sensitive".to_string()],
        );
        assert_eq!(
            argv,
            vec![
                "./validator",
                "/t/1.in",
                "/t/1.ans",
                "/t/feedback",
                "case_sensitive"
            ]
        );
    }

    #[test]
    fn test_format_invocation_has_no_paths() {
        let v = validator(ValidatorKind::Format);
        let argv = v.invocation(
            Path::new("/t/1.in"),
            Path::new("/t/1.ans"),
            Path::new("/t/feedback"),
            &[],
        );
        assert_eq!(argv, vec!["./validator"]);
    }

    #[test]
    fn test_contract_codes() {
        let outcome = ValidatorOutcome {
            exit_code: VALIDATOR_ACCEPT,
            duration: Duration::ZERO,
            stderr: String::new(),
        };
        assert!(outcome.accepted() && !outcome.crashed());
        let outcome = ValidatorOutcome {
            exit_code: 1,
            duration: Duration::ZERO,
            stderr: String::new(),
        };
        assert!(outcome.crashed());
    }

    #[test]
    fn test_read_feedback_precedence() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_feedback(dir.path(), "stderr text"), "stderr text");

        std::fs::write(dir.path().join("judgemessage.txt"), "message").unwrap();
        assert_eq!(read_feedback(dir.path(), ""), "message");
        assert_eq!(read_feedback(dir.path(), "stderr text"), "stderr text");

        std::fs::write(dir.path().join("judgeerror.txt"), "fatal").unwrap();
        assert_eq!(read_feedback(dir.path(), "stderr text"), "fatal");
    }
}
