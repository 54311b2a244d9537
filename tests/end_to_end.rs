//! End-to-end judging tests over real processes
//!
//! Validators and submissions are small `/bin/sh` scripts written into a
//! scratch directory, so every test exercises the real pipe wiring, process
//! groups, watchdog and verdict resolution.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use judgekit::{
    JudgeConfig, Limits, Problem, Program, Run, RunUntil, TaskScheduler, Validator, ValidatorKind,
    Verdict, Verdicts,
};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct Fixture {
    scratch: tempfile::TempDir,
    problem: Arc<Problem>,
    validator: Arc<Validator>,
    data_dir: PathBuf,
    bin_dir: PathBuf,
}

impl Fixture {
    fn new(interactive: bool, multi_pass: bool, validator_body: &str) -> Self {
        let scratch = tempfile::tempdir().unwrap();
        let data_dir = scratch.path().join("data");
        let bin_dir = scratch.path().join("bin");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::create_dir_all(&bin_dir).unwrap();

        let validator_path = write_script(&bin_dir, "validator.sh", validator_body);
        let problem = Arc::new(Problem {
            name: "fixture".to_string(),
            interactive,
            multi_pass,
            limits: Limits {
                time_limit_secs: 2.0,
                hard_timeout_secs: Some(5.0),
                max_passes: 3,
                ..Limits::default()
            },
            validator_args: vec![],
            work_dir: scratch.path().join("work"),
        });
        let validator = Arc::new(Validator {
            kind: ValidatorKind::General,
            program: Program::new(
                "validator",
                vec![validator_path.display().to_string()],
                scratch.path(),
            ),
        });
        Self {
            scratch,
            problem,
            validator,
            data_dir,
            bin_dir,
        }
    }

    fn limits(mut self, limits: Limits) -> Self {
        Arc::get_mut(&mut self.problem).unwrap().limits = limits;
        self
    }

    fn add_testcase(&self, name: &str, input: &str) -> judgekit::Testcase {
        let in_path = self.data_dir.join(format!("{name}.in"));
        std::fs::write(&in_path, input).unwrap();
        std::fs::write(self.data_dir.join(format!("{name}.ans")), input).unwrap();
        judgekit::Testcase::from_input(&in_path)
    }

    fn submission(&self, body: &str) -> Arc<Program> {
        let path = write_script(&self.bin_dir, "submission.sh", body);
        Arc::new(Program::new(
            "submission",
            vec![path.display().to_string()],
            self.scratch.path(),
        ))
    }

    fn make_run(&self, submission: &Arc<Program>, testcase: judgekit::Testcase) -> Run {
        Run::new(
            Arc::clone(&self.problem),
            Arc::clone(submission),
            Arc::clone(&self.validator),
            testcase,
        )
        .unwrap()
    }
}

/// Validator that sends the input to the submission and expects it echoed
/// back verbatim.
const ECHO_VALIDATOR: &str = r#"
input=$(cat "$1")
printf '%s\n' "$input"
read reply
if [ "$reply" = "$input" ]; then exit 42; else exit 43; fi
"#;

const ECHO_SUBMISSION: &str = r#"
read line
printf '%s\n' "$line"
"#;

#[tokio::test]
async fn test_interactive_echo_accepted() {
    let fx = Fixture::new(true, false, ECHO_VALIDATOR);
    let submission = fx.submission(ECHO_SUBMISSION);
    let run = fx.make_run(&submission, fx.add_testcase("1", "hello judge\n"));

    let result = run.run(&JudgeConfig::default()).await.unwrap();
    assert_eq!(result.verdict, Verdict::Accepted);
    assert!(!result.timeout_expired);
    assert_eq!(result.pass_index, None);
}

#[tokio::test]
async fn test_interactive_wrong_answer() {
    let fx = Fixture::new(true, false, ECHO_VALIDATOR);
    let submission = fx.submission("read line\nprintf 'nope\\n'\n");
    let run = fx.make_run(&submission, fx.add_testcase("1", "hello\n"));

    let result = run.run(&JudgeConfig::default()).await.unwrap();
    assert_eq!(result.verdict, Verdict::WrongAnswer);
}

#[tokio::test]
async fn test_interactive_runtime_error() {
    // On EOF the validator lingers briefly so the submission's exit is
    // observed first and its failure wins.
    let fx = Fixture::new(
        true,
        false,
        "input=$(cat \"$1\")\nprintf '%s\\n' \"$input\"\nread reply || sleep 0.3\nif [ \"$reply\" = \"$input\" ]; then exit 42; else exit 43; fi\n",
    );
    let submission = fx.submission("read line\nexit 3\n");
    let run = fx.make_run(&submission, fx.add_testcase("1", "hello\n"));

    let result = run.run(&JudgeConfig::default()).await.unwrap();
    assert_eq!(result.verdict, Verdict::RuntimeError);
}

#[tokio::test]
async fn test_timeout_dominates_validator_accept() {
    let fx = Fixture::new(
        true,
        false,
        // Accepts without waiting for any reply.
        "cat \"$1\" > /dev/null\nprintf 'go\\n'\nsleep 0.1\nexit 42\n",
    )
    .limits(Limits {
        time_limit_secs: 0.2,
        hard_timeout_secs: Some(0.6),
        ..Limits::default()
    });
    let submission = fx.submission("sleep 10\n");
    let run = fx.make_run(&submission, fx.add_testcase("1", "x\n"));

    let result = run.run(&JudgeConfig::default()).await.unwrap();
    assert_eq!(result.verdict, Verdict::TimeLimitExceeded);
    assert!(result.timeout_expired);
    // The watchdog, not the 10s sleep, bounded the wall time.
    assert!(result.duration < Duration::from_secs(5));
}

#[tokio::test]
async fn test_validator_bad_exit_code_is_crash() {
    let fx = Fixture::new(true, false, "sleep 0.1\nexit 1\n");
    let submission = fx.submission(ECHO_SUBMISSION);
    let run = fx.make_run(&submission, fx.add_testcase("1", "x\n"));

    let result = run.run(&JudgeConfig::default()).await.unwrap();
    assert_eq!(result.verdict, Verdict::ValidatorCrash);
}

#[tokio::test]
async fn test_judgemessage_becomes_diagnostic() {
    let fx = Fixture::new(
        true,
        false,
        "read _ignored\nprintf 'off by one\\n' > \"$3/judgemessage.txt\"\nexit 43\n",
    );
    let submission = fx.submission("printf 'guess\\n'\n");
    let run = fx.make_run(&submission, fx.add_testcase("1", "x\n"));

    let result = run.run(&JudgeConfig::default()).await.unwrap();
    assert_eq!(result.verdict, Verdict::WrongAnswer);
    assert_eq!(result.validator_error.as_deref(), Some("off by one\n"));
}

/// Multi-pass validator that counts passes in the feedback directory and
/// requests `passes` rounds in total before accepting.
fn counting_validator(passes: u32, last_exit: &str) -> String {
    format!(
        r#"fb="$3"
pass=$(cat "$fb/count" 2>/dev/null || printf 0)
pass=$((pass+1))
printf '%s\n' "$pass" > "$fb/count"
input=$(cat "$1")
printf '%s\n' "$input"
read reply
[ "$reply" = "$input" ] || exit 43
if [ "$pass" -lt {passes} ]; then
    printf 'pass %s\n' "$pass" > "$fb/nextpass.in"
    exit 42
fi
{last_exit}
"#
    )
}

#[tokio::test]
async fn test_multi_pass_accept_after_three_passes() {
    let fx = Fixture::new(true, true, &counting_validator(3, "exit 42"));
    let submission = fx.submission(ECHO_SUBMISSION);
    let run = fx.make_run(&submission, fx.add_testcase("1", "round one\n"));

    let result = run.run(&JudgeConfig::default()).await.unwrap();
    assert_eq!(result.verdict, Verdict::Accepted);
    assert_eq!(result.pass_index, Some(3));
}

#[tokio::test]
async fn test_multi_pass_reject_on_second_pass() {
    let fx = Fixture::new(true, true, &counting_validator(2, "exit 43"));
    let submission = fx.submission(ECHO_SUBMISSION);
    let run = fx.make_run(&submission, fx.add_testcase("1", "round one\n"));

    let result = run.run(&JudgeConfig::default()).await.unwrap();
    assert_eq!(result.verdict, Verdict::WrongAnswer);
    assert_eq!(result.pass_index, Some(2));
}

#[tokio::test]
async fn test_exceeding_max_passes_is_crash() {
    // The validator keeps requesting continuations forever.
    let fx = Fixture::new(true, true, &counting_validator(1000, "exit 42")).limits(Limits {
        max_passes: 2,
        ..Limits::default()
    });
    let submission = fx.submission(ECHO_SUBMISSION);
    let run = fx.make_run(&submission, fx.add_testcase("1", "x\n"));

    let result = run.run(&JudgeConfig::default()).await.unwrap();
    assert_eq!(result.verdict, Verdict::ValidatorCrash);
}

#[tokio::test]
async fn test_reject_plus_nextpass_is_crash() {
    let fx = Fixture::new(
        true,
        true,
        "read _r\nprintf 'more\\n' > \"$3/nextpass.in\"\nsleep 0.1\nexit 43\n",
    );
    let submission = fx.submission("printf 'hi\\n'\n");
    let run = fx.make_run(&submission, fx.add_testcase("1", "x\n"));

    let result = run.run(&JudgeConfig::default()).await.unwrap();
    assert_eq!(result.verdict, Verdict::ValidatorCrash);
}

#[tokio::test]
async fn test_interaction_transcript() {
    let fx = Fixture::new(true, false, ECHO_VALIDATOR);
    let submission = fx.submission(ECHO_SUBMISSION);
    let transcript = fx.scratch.path().join("interaction.txt");
    let run = fx.make_run(&submission, fx.add_testcase("1", "ping\n"));

    let cfg = JudgeConfig {
        interaction: Some(transcript.clone()),
        ..JudgeConfig::default()
    };
    let result = run.run(&cfg).await.unwrap();
    assert_eq!(result.verdict, Verdict::Accepted);

    let logged = std::fs::read_to_string(&transcript).unwrap();
    // Both directions appear, tagged with their markers.
    assert!(logged.contains("<ping"), "transcript was: {logged:?}");
    assert!(logged.contains(">ping"), "transcript was: {logged:?}");
}

#[tokio::test]
async fn test_sequential_fallback_accepts() {
    let fx = Fixture::new(true, false, ECHO_VALIDATOR);
    let submission = fx.submission(ECHO_SUBMISSION);
    let run = fx.make_run(&submission, fx.add_testcase("1", "fallback\n"));

    let cfg = JudgeConfig {
        process_groups: false,
        ..JudgeConfig::default()
    };
    let result = run.run(&cfg).await.unwrap();
    assert_eq!(result.verdict, Verdict::Accepted);
}

#[tokio::test]
async fn test_sequential_fallback_timeout_beats_reject() {
    // Validator rejects early while the submission hangs; without exit-order
    // information the timeout wins.
    let fx = Fixture::new(true, false, "cat \"$1\" > /dev/null\nexit 43\n").limits(Limits {
        time_limit_secs: 0.2,
        hard_timeout_secs: Some(0.5),
        ..Limits::default()
    });
    let submission = fx.submission("sleep 10\n");
    let run = fx.make_run(&submission, fx.add_testcase("1", "x\n"));

    let cfg = JudgeConfig {
        process_groups: false,
        ..JudgeConfig::default()
    };
    let result = run.run(&cfg).await.unwrap();
    assert_eq!(result.verdict, Verdict::TimeLimitExceeded);
}

/// Batch-mode validator: diff the produced output (stdin) against the answer.
const DIFF_VALIDATOR: &str = r#"
if cmp -s - "$2"; then exit 42; else exit 43; fi
"#;

#[tokio::test]
async fn test_batch_accepted_and_rejected() {
    let fx = Fixture::new(false, false, DIFF_VALIDATOR);
    let testcase = fx.add_testcase("1", "same text\n");

    let cat = Arc::new(Program::new(
        "cat",
        vec!["/bin/cat".to_string()],
        fx.scratch.path(),
    ));
    let run = fx.make_run(&cat, testcase.clone());
    let result = run.run(&JudgeConfig::default()).await.unwrap();
    assert_eq!(result.verdict, Verdict::Accepted);

    let wrong = fx.submission("printf 'different\\n'\n");
    let run = fx.make_run(&wrong, testcase);
    let result = run.run(&JudgeConfig::default()).await.unwrap();
    assert_eq!(result.verdict, Verdict::WrongAnswer);
}

#[tokio::test]
async fn test_batch_runtime_error_and_timeout() {
    let fx = Fixture::new(false, false, DIFF_VALIDATOR).limits(Limits {
        time_limit_secs: 0.2,
        hard_timeout_secs: Some(0.5),
        ..Limits::default()
    });

    let crashing = fx.submission("exit 7\n");
    let run = fx.make_run(&crashing, fx.add_testcase("1", "x\n"));
    let result = run.run(&JudgeConfig::default()).await.unwrap();
    assert_eq!(result.verdict, Verdict::RuntimeError);
    assert!(result
        .submission_error
        .as_deref()
        .unwrap()
        .contains("Exited with code 7"));

    let hanging = fx.submission("sleep 10\n");
    let run = fx.make_run(&hanging, fx.add_testcase("2", "x\n"));
    let result = run.run(&JudgeConfig::default()).await.unwrap();
    assert_eq!(result.verdict, Verdict::TimeLimitExceeded);
    assert!(result.timeout_expired);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hundred_testcases_four_workers() {
    let fx = Fixture::new(true, false, ECHO_VALIDATOR);
    let submission = fx.submission(ECHO_SUBMISSION);

    let names: Vec<String> = (0..100).map(|i| format!("{i:03}")).collect();
    let verdicts = Arc::new(Verdicts::new(
        names.clone(),
        fx.problem.limits.hard_timeout(),
        RunUntil::FirstError,
    ));

    let mut scheduler = {
        let verdicts = Arc::clone(&verdicts);
        TaskScheduler::new(4, move |run: Arc<Run>| {
            let verdicts = Arc::clone(&verdicts);
            let cfg = JudgeConfig::default();
            async move {
                let name = run.testcase.name.clone();
                if !verdicts.run_is_needed(&name) {
                    return Ok(());
                }
                let result = run.run(&cfg).await?;
                verdicts.set(&name, result.verdict, result.duration);
                Ok(())
            }
        })
    };

    for name in &names {
        let testcase = fx.add_testcase(name, &format!("payload {name}\n"));
        let run = fx.make_run(&submission, testcase);
        scheduler.put(Arc::new(run), 0).await;
    }
    scheduler.join().await.unwrap();
    scheduler.done().await.unwrap();

    assert_eq!(verdicts.final_verdict(), Some(Verdict::Accepted));
    for (name, verdict, _) in verdicts.rows() {
        assert_eq!(verdict, Some(Verdict::Accepted), "testcase {name}");
    }
}
