use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Outcome of judging a test case, a test group or a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    RunTimeError,
}

impl Verdict {
    pub fn is_accepted(self) -> bool {
        self == Verdict::Accepted
    }

    /// Ranking used by the WORST_ERROR verdict mode.
    /// Run-time errors and time limits rank equal; the first one seen wins.
    pub fn severity(self) -> u8 {
        match self {
            Verdict::Accepted => 0,
            Verdict::WrongAnswer => 1,
            Verdict::TimeLimitExceeded | Verdict::RunTimeError => 2,
        }
    }

    /// Two or three letter code used on the custom grader protocol.
    pub fn short_code(self) -> &'static str {
        match self {
            Verdict::Accepted => "AC",
            Verdict::WrongAnswer => "WA",
            Verdict::TimeLimitExceeded => "TLE",
            Verdict::RunTimeError => "RTE",
        }
    }

    pub fn from_short_code(code: &str) -> Option<Self> {
        match code {
            "AC" => Some(Verdict::Accepted),
            "WA" => Some(Verdict::WrongAnswer),
            "TLE" => Some(Verdict::TimeLimitExceeded),
            "RTE" => Some(Verdict::RunTimeError),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Accepted => "accepted",
            Verdict::WrongAnswer => "wrong_answer",
            Verdict::TimeLimitExceeded => "time_limit_exceeded",
            Verdict::RunTimeError => "run_time_error",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle of a submission run.
///
/// `queued -> compiling -> running -> done`, with `compile_error` and
/// `judging_error` as the other terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Compiling,
    Running,
    CompileError,
    JudgingError,
    Done,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Done | RunStatus::CompileError | RunStatus::JudgingError
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Queued => "queued",
            RunStatus::Compiling => "compiling",
            RunStatus::Running => "running",
            RunStatus::CompileError => "compile_error",
            RunStatus::JudgingError => "judging_error",
            RunStatus::Done => "done",
        };
        write!(f, "{}", s)
    }
}

/// Source files of a program, keyed by relative path, base64 encoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramSource {
    pub language: String,
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRun {
    pub id: i64,
    pub submission_id: i64,
    pub problem_version_id: i64,
    pub program: ProgramSource,
    pub status: RunStatus,
    #[serde(default)]
    pub verdict: Option<Verdict>,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub time_usage_ms: i64,
    #[serde(default)]
    pub compile_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SubmissionRun {
    pub fn new(id: i64, submission_id: i64, problem_version_id: i64, program: ProgramSource) -> Self {
        Self {
            id,
            submission_id,
            problem_version_id,
            program,
            status: RunStatus::Queued,
            verdict: None,
            score: 0.0,
            time_usage_ms: 0,
            compile_error: None,
            created_at: Utc::now(),
        }
    }

    /// Apply the fields that are set in `update`.
    pub fn apply(&mut self, update: &RunUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(verdict) = update.verdict {
            self.verdict = Some(verdict);
        }
        if let Some(score) = update.score {
            self.score = score;
        }
        if let Some(time) = update.time_usage_ms {
            self.time_usage_ms = time;
        }
        if let Some(ref error) = update.compile_error {
            self.compile_error = Some(error.clone());
        }
    }
}

/// Partial update of a run; unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub verdict: Option<Verdict>,
    pub score: Option<f64>,
    pub time_usage_ms: Option<i64>,
    pub compile_error: Option<String>,
}

impl RunUpdate {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRun {
    pub run_id: i64,
    pub test_case_id: i64,
    pub verdict: Verdict,
    pub score: f64,
    pub time_usage_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRun {
    pub run_id: i64,
    pub test_group_id: i64,
    pub verdict: Verdict,
    pub score: f64,
    pub time_usage_ms: i64,
    /// Score classified against the group's accept/reject thresholds.
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseSpec {
    pub id: i64,
    pub name: String,
    pub input_hash: String,
    pub output_hash: String,
}

fn default_scoring_mode() -> String {
    "sum".to_string()
}

fn default_verdict_mode() -> String {
    "first_error".to_string()
}

/// Test group as stored with a problem version. Modes are kept as strings
/// and only validated when an evaluation plan is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestGroupSpec {
    pub id: i64,
    pub name: String,
    #[serde(default = "default_scoring_mode")]
    pub scoring_mode: String,
    #[serde(default = "default_verdict_mode")]
    pub verdict_mode: String,
    #[serde(default)]
    pub accept_score: Option<f64>,
    #[serde(default)]
    pub reject_score: Option<f64>,
    #[serde(default)]
    pub break_on_reject: bool,
    #[serde(default)]
    pub accept_if_any_accepted: bool,
    #[serde(default)]
    pub ignore_sample: bool,
    #[serde(default)]
    pub custom_grading: bool,
    #[serde(default)]
    pub output_validator_flags: Vec<String>,
    #[serde(default)]
    pub grader_flags: Vec<String>,
    #[serde(default)]
    pub cases: Vec<TestCaseSpec>,
    #[serde(default)]
    pub groups: Vec<TestGroupSpec>,
}

impl TestGroupSpec {
    /// Every content hash referenced by this group and its descendants.
    pub fn file_hashes(&self) -> Vec<String> {
        let mut hashes = Vec::new();
        let mut pending = vec![self];
        while let Some(group) = pending.pop() {
            for case in &group.cases {
                hashes.push(case.input_hash.clone());
                hashes.push(case.output_hash.clone());
            }
            pending.extend(group.groups.iter());
        }
        hashes.sort();
        hashes.dedup();
        hashes
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemVersion {
    pub id: i64,
    pub time_limit_ms: i64,
    pub memory_limit_kb: i64,
    #[serde(default)]
    pub interactive: bool,
    pub root_group: TestGroupSpec,
    #[serde(default)]
    pub output_validator: Option<ProgramSource>,
    #[serde(default)]
    pub scoring_validator: bool,
    #[serde(default)]
    pub custom_grader: Option<ProgramSource>,
    /// Problem-supplied files per language id, path to base64 contents.
    #[serde(default)]
    pub included_files: BTreeMap<String, BTreeMap<String, String>>,
}

impl ProblemVersion {
    /// The submission as it is compiled: included files for its language are
    /// added and replace submitted files at the same path.
    pub fn with_included_files(&self, program: &ProgramSource) -> ProgramSource {
        let mut merged = program.clone();
        if let Some(files) = self.included_files.get(&program.language) {
            merged
                .files
                .extend(files.iter().map(|(path, contents)| (path.clone(), contents.clone())));
        }
        merged
    }
}
