//! judgekit driver
//!
//! Judges one submission against every testcase of a problem directory:
//!
//! ```text
//! judgekit [--json] <problem_dir> <submission_cmd> [args...]
//! ```
//!
//! The problem directory carries a `problem.toml` (limits, validator
//! command, judging flags) and a testcase directory with `*.in`/`*.ans`
//! pairs. The submission command must already be built; building is a
//! separate concern.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use judgekit::progress::Reporter;
use judgekit::{
    load_problem, JudgeConfig, Program, Run, TaskScheduler, TracingReporter, Verdict, Verdicts,
};

#[derive(Serialize)]
struct CaseReport {
    name: String,
    verdict: Option<Verdict>,
    duration_secs: Option<f64>,
}

#[derive(Serialize)]
struct Report {
    problem: String,
    submission: String,
    verdict: Verdict,
    duration_secs: f64,
    error_count: usize,
    testcases: Vec<CaseReport>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("judgekit=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let json = args.first().map(String::as_str) == Some("--json");
    if json {
        args.remove(0);
    }
    if args.len() < 2 {
        bail!("usage: judgekit [--json] <problem_dir> <submission_cmd> [args...]");
    }
    let problem_dir = PathBuf::from(args.remove(0));
    let submission_cmd = args;

    let cfg = JudgeConfig::from_env();
    let scratch = tempfile::tempdir().context("Failed to create scratch dir")?;
    let loaded = load_problem(&problem_dir, scratch.path())?;
    if loaded.testcases.is_empty() {
        bail!("no testcases found under {}", problem_dir.display());
    }
    info!(
        "Judging problem {} ({} testcases, {} workers)",
        loaded.problem.name,
        loaded.testcases.len(),
        cfg.jobs
    );

    let submission_name = submission_cmd
        .first()
        .map(|cmd| {
            PathBuf::from(cmd)
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| cmd.clone())
        })
        .unwrap_or_default();
    let problem = Arc::new(loaded.problem);
    let validator = Arc::new(loaded.validator);
    let submission = Arc::new(Program::new(
        submission_name.clone(),
        submission_cmd,
        &problem_dir,
    ));

    let verdicts = Arc::new(Verdicts::new(
        loaded.testcases.iter().map(|tc| tc.name.clone()),
        problem.limits.hard_timeout(),
        cfg.run_until,
    ));
    let reporter = Arc::new(TracingReporter);

    let mut scheduler = {
        let verdicts = Arc::clone(&verdicts);
        let reporter = Arc::clone(&reporter);
        let cfg = cfg.clone();
        TaskScheduler::new(cfg.jobs, move |run: Arc<Run>| {
            let verdicts = Arc::clone(&verdicts);
            let reporter = Arc::clone(&reporter);
            let cfg = cfg.clone();
            async move {
                let name = run.testcase.name.clone();
                if !verdicts.run_is_needed(&name) {
                    return Ok(());
                }
                reporter.started(&name);
                let result = run.run(&cfg).await?;
                verdicts.set(&name, result.verdict, result.duration);
                reporter.done(&name, &result);
                Ok(())
            }
        })
    };

    for testcase in loaded.testcases {
        // Samples first: they are cheap and fail fast on broken setups.
        let priority = if testcase.in_path.to_string_lossy().contains("sample") {
            1
        } else {
            0
        };
        let run = Run::new(
            Arc::clone(&problem),
            Arc::clone(&submission),
            Arc::clone(&validator),
            testcase,
        )?;
        scheduler.put(Arc::new(run), priority).await;
    }
    scheduler.done().await?;

    let verdict = verdicts.final_verdict().unwrap_or(Verdict::Accepted);
    let (salient_case, salient_duration) = verdicts.salient().unwrap_or_default();
    info!(
        "{}: {} {:.3}s @ {}",
        submission_name,
        verdict.short(),
        salient_duration.as_secs_f64(),
        salient_case
    );

    if json {
        let report = Report {
            problem: problem.name.clone(),
            submission: submission_name,
            verdict,
            duration_secs: verdicts.max_duration().as_secs_f64(),
            error_count: verdicts.error_count(),
            testcases: verdicts
                .rows()
                .into_iter()
                .map(|(name, verdict, duration)| CaseReport {
                    name,
                    verdict,
                    duration_secs: duration.map(|d| d.as_secs_f64()),
                })
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for (name, verdict, duration) in verdicts.rows() {
            match (verdict, duration) {
                (Some(v), Some(d)) => {
                    println!("{:>3} {:6.3}s  {}", v.short(), d.as_secs_f64(), name)
                }
                _ => println!("  -         {name}"),
            }
        }
    }

    if verdicts.error_count() > 0 {
        std::process::exit(2);
    }
    if verdict != Verdict::Accepted {
        std::process::exit(1);
    }
    Ok(())
}
