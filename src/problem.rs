//! Problem metadata, limits and testcases
//!
//! A `Problem` carries the judging flags and limits; `Testcase` points at the
//! input and default-answer files. The driver loads both from a problem
//! directory with a `problem.toml` at its root.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::JudgeError;
use crate::program::{Program, Validator, ValidatorKind};

/// Resource limits for one problem.
///
/// All times are wall-clock seconds unless noted; memory is in bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Soft limit: exceeding it is a TLE verdict.
    pub time_limit_secs: f64,
    /// Hard limit: the watchdog kills the submission here. Defaults to
    /// `2 * time_limit + 1`.
    pub hard_timeout_secs: Option<f64>,
    /// Submission address-space ceiling.
    pub memory_bytes: Option<u64>,
    /// Independent CPU-time ceiling for the validator.
    pub validator_time_secs: f64,
    /// Validator address-space ceiling.
    pub validator_memory_bytes: Option<u64>,
    /// Upper bound on validator-requested passes for multi-pass problems.
    pub max_passes: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            time_limit_secs: 1.0,
            hard_timeout_secs: None,
            memory_bytes: Some(2048 << 20),
            validator_time_secs: 30.0,
            validator_memory_bytes: None,
            max_passes: 2,
        }
    }
}

impl Limits {
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs_f64(self.time_limit_secs)
    }

    pub fn hard_timeout(&self) -> Duration {
        let secs = self
            .hard_timeout_secs
            .unwrap_or(2.0 * self.time_limit_secs + 1.0)
            .max(self.time_limit_secs);
        Duration::from_secs_f64(secs)
    }

    pub fn validator_time(&self) -> Duration {
        Duration::from_secs_f64(self.validator_time_secs)
    }
}

/// One testcase: input file, default answer, and a name used for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Testcase {
    pub name: String,
    pub in_path: PathBuf,
    pub ans_path: PathBuf,
}

impl Testcase {
    /// Derive a testcase from its `.in` file; the answer is the `.ans`
    /// sibling.
    pub fn from_input(in_path: &Path) -> Self {
        let name = in_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name,
            ans_path: in_path.with_extension("ans"),
            in_path: in_path.to_path_buf(),
        }
    }
}

/// Judging-relevant problem metadata.
#[derive(Debug, Clone)]
pub struct Problem {
    pub name: String,
    /// Submission and validator talk over pipes.
    pub interactive: bool,
    /// The validator may request further passes via `nextpass.in`.
    pub multi_pass: bool,
    pub limits: Limits,
    /// Extra flags appended to the validator invocation.
    pub validator_args: Vec<String>,
    /// Root for per-run scratch directories.
    pub work_dir: PathBuf,
}

/// `problem.toml` layout.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProblemFile {
    name: String,
    #[serde(default)]
    interactive: bool,
    #[serde(default)]
    multi_pass: bool,
    #[serde(default)]
    limits: Limits,
    validator: ValidatorSpec,
    /// Directory with `*.in`/`*.ans` pairs, relative to the problem root.
    #[serde(default = "default_testcase_dir")]
    testcase_dir: PathBuf,
    #[serde(default)]
    validator_args: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ValidatorSpec {
    command: Vec<String>,
    #[serde(default = "default_validator_kind")]
    kind: ValidatorKind,
}

fn default_testcase_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_validator_kind() -> ValidatorKind {
    ValidatorKind::General
}

/// A problem loaded from disk, ready to judge against.
#[derive(Debug)]
pub struct LoadedProblem {
    pub problem: Problem,
    pub validator: Validator,
    pub testcases: Vec<Testcase>,
}

/// Load `problem.toml` from `dir` and discover its testcases.
///
/// Testcases are the `*.in` files under the configured testcase directory,
/// sorted by name.
pub fn load_problem(dir: &Path, work_dir: &Path) -> Result<LoadedProblem> {
    let manifest = dir.join("problem.toml");
    let raw = std::fs::read_to_string(&manifest)
        .with_context(|| format!("Failed to read {}", manifest.display()))?;
    let file: ProblemFile = toml::from_str(&raw)
        .with_context(|| format!("Failed to parse {}", manifest.display()))?;
    if file.validator.command.is_empty() {
        return Err(JudgeError::MissingValidator(file.name).into());
    }

    let problem = Problem {
        name: file.name.clone(),
        interactive: file.interactive,
        multi_pass: file.multi_pass,
        limits: file.limits,
        validator_args: file.validator_args,
        work_dir: work_dir.to_path_buf(),
    };

    let validator = Validator {
        kind: file.validator.kind,
        program: Program {
            name: "output_validator".to_string(),
            run_command: file.validator.command,
            work_dir: dir.to_path_buf(),
        },
    };

    let case_dir = dir.join(&file.testcase_dir);
    let mut testcases = Vec::new();
    let entries = std::fs::read_dir(&case_dir)
        .with_context(|| format!("Failed to read testcase dir {}", case_dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == "in") {
            testcases.push(Testcase::from_input(&path));
        }
    }
    testcases.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(LoadedProblem {
        problem,
        validator,
        testcases,
    })
}
