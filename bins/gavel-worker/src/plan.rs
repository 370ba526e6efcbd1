/// Evaluation Plan - What to Run and How to Judge It
///
/// Built from a stored `ProblemVersion` once test data is on disk and every
/// program is compiled. Immutable for the rest of the run.
///
/// Mode strings, validator flags and the plan type are checked by
/// `validate` before any compilation or sandbox work starts.
use crate::error::{JudgeError, JudgeResult};
use crate::language::CompiledProgram;
use gavel_common::diff::DiffArgs;
use gavel_common::types::{ProblemVersion, TestGroupSpec, Verdict};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

/// Upper bounds on stored limits; larger values are data errors.
pub const MAX_TIME_LIMIT_MS: i64 = 60 * 60 * 1000;
pub const MAX_MEMORY_LIMIT_KB: i64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringMode {
    Sum,
    Avg,
    Min,
    Max,
}

impl FromStr for ScoringMode {
    type Err = JudgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sum" => Ok(ScoringMode::Sum),
            "avg" => Ok(ScoringMode::Avg),
            "min" => Ok(ScoringMode::Min),
            "max" => Ok(ScoringMode::Max),
            _ => Err(JudgeError::Plan(format!("unknown scoring mode: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictMode {
    FirstError,
    WorstError,
    AlwaysAccept,
}

impl FromStr for VerdictMode {
    type Err = JudgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "first_error" => Ok(VerdictMode::FirstError),
            "worst_error" => Ok(VerdictMode::WorstError),
            "always_accept" => Ok(VerdictMode::AlwaysAccept),
            _ => Err(JudgeError::Plan(format!("unknown verdict mode: {}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupPolicy {
    pub scoring_mode: ScoringMode,
    pub verdict_mode: VerdictMode,
    pub accept_score: Option<f64>,
    pub reject_score: Option<f64>,
    pub break_on_reject: bool,
    pub accept_if_any_accepted: bool,
    pub ignore_sample: bool,
    pub custom_grading: bool,
    pub output_validator_flags: Vec<String>,
    pub grader_flags: Vec<String>,
}

impl Default for GroupPolicy {
    fn default() -> Self {
        Self {
            scoring_mode: ScoringMode::Sum,
            verdict_mode: VerdictMode::FirstError,
            accept_score: None,
            reject_score: None,
            break_on_reject: false,
            accept_if_any_accepted: false,
            ignore_sample: false,
            custom_grading: false,
            output_validator_flags: Vec::new(),
            grader_flags: Vec::new(),
        }
    }
}

impl GroupPolicy {
    /// Classify a group outcome against the accept/reject thresholds.
    /// Without a deciding threshold the verdict decides.
    pub fn passed(&self, verdict: Verdict, score: f64) -> bool {
        match (self.accept_score, self.reject_score) {
            (Some(accept), _) if score >= accept => true,
            (_, Some(reject)) if score <= reject => false,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            _ => verdict.is_accepted(),
        }
    }
}

/// A content-addressed test data file resolved to a local path.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub hash: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub id: i64,
    pub name: String,
    pub input: Artifact,
    pub answer: Artifact,
}

/// Cases and subgroups are each sorted by name.
#[derive(Debug, Clone, PartialEq)]
pub struct TestGroup {
    pub id: i64,
    pub name: String,
    pub policy: GroupPolicy,
    pub cases: Vec<TestCase>,
    pub groups: Vec<TestGroup>,
}

fn inherit_flags(own: &[String], parent: Option<&Vec<String>>) -> Vec<String> {
    match parent {
        Some(flags) if own.is_empty() => flags.clone(),
        _ => own.to_vec(),
    }
}

fn policy_from_spec(spec: &TestGroupSpec, inherited: Option<&GroupPolicy>) -> JudgeResult<GroupPolicy> {
    Ok(GroupPolicy {
        scoring_mode: spec.scoring_mode.parse()?,
        verdict_mode: spec.verdict_mode.parse()?,
        accept_score: spec.accept_score,
        reject_score: spec.reject_score,
        break_on_reject: spec.break_on_reject,
        accept_if_any_accepted: spec.accept_if_any_accepted,
        ignore_sample: spec.ignore_sample,
        custom_grading: spec.custom_grading,
        output_validator_flags: inherit_flags(
            &spec.output_validator_flags,
            inherited.map(|p| &p.output_validator_flags),
        ),
        grader_flags: inherit_flags(&spec.grader_flags, inherited.map(|p| &p.grader_flags)),
    })
}

fn artifact(hash: &str, files: &HashMap<String, PathBuf>) -> JudgeResult<Artifact> {
    let path = files
        .get(hash)
        .ok_or_else(|| JudgeError::MissingFile(hash.to_string()))?;
    Ok(Artifact {
        hash: hash.to_string(),
        path: path.clone(),
    })
}

impl TestGroup {
    /// Build the group tree. Groups without their own validator or grader
    /// flags inherit the parent's.
    pub fn from_spec(
        spec: &TestGroupSpec,
        files: &HashMap<String, PathBuf>,
        inherited: Option<&GroupPolicy>,
    ) -> JudgeResult<Self> {
        let policy = policy_from_spec(spec, inherited)?;

        let mut cases = spec
            .cases
            .iter()
            .map(|case| {
                Ok(TestCase {
                    id: case.id,
                    name: case.name.clone(),
                    input: artifact(&case.input_hash, files)?,
                    answer: artifact(&case.output_hash, files)?,
                })
            })
            .collect::<JudgeResult<Vec<_>>>()?;
        cases.sort_by(|a, b| a.name.cmp(&b.name));

        let mut groups = spec
            .groups
            .iter()
            .map(|child| TestGroup::from_spec(child, files, Some(&policy)))
            .collect::<JudgeResult<Vec<_>>>()?;
        groups.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(TestGroup {
            id: spec.id,
            name: spec.name.clone(),
            policy,
            cases,
            groups,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanType {
    Simple,
    Interactive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationPlan {
    pub program: CompiledProgram,
    pub root: TestGroup,
    pub time_limit_ms: u64,
    pub memory_limit_kb: u64,
    pub plan_type: PlanType,
    pub validator: Option<CompiledProgram>,
    pub scoring_validator: bool,
    pub grader: Option<CompiledProgram>,
}

/// Compiled helper programs of a problem.
#[derive(Debug, Clone, Default)]
pub struct ProblemPrograms {
    pub validator: Option<CompiledProgram>,
    pub grader: Option<CompiledProgram>,
}

fn check_flags(group: &TestGroupSpec) -> JudgeResult<()> {
    DiffArgs::from_flags(&group.output_validator_flags).map_err(|e| JudgeError::Plan(e.to_string()))?;
    group.groups.iter().try_for_each(check_flags)
}

fn check_modes(group: &TestGroupSpec) -> JudgeResult<()> {
    group.scoring_mode.parse::<ScoringMode>()?;
    group.verdict_mode.parse::<VerdictMode>()?;
    group.groups.iter().try_for_each(check_modes)
}

/// Reject problems this engine cannot judge, before any work is spent.
pub fn validate(problem: &ProblemVersion) -> JudgeResult<()> {
    if problem.interactive {
        return Err(JudgeError::Plan("interactive problems are not supported".to_string()));
    }
    if problem.time_limit_ms <= 0 || problem.memory_limit_kb <= 0 {
        return Err(JudgeError::Plan("limits must be positive".to_string()));
    }
    if problem.time_limit_ms > MAX_TIME_LIMIT_MS || problem.memory_limit_kb > MAX_MEMORY_LIMIT_KB {
        return Err(JudgeError::Plan(format!(
            "limits {} ms / {} KB exceed {} ms / {} KB",
            problem.time_limit_ms, problem.memory_limit_kb, MAX_TIME_LIMIT_MS, MAX_MEMORY_LIMIT_KB
        )));
    }
    check_modes(&problem.root_group)?;
    if problem.output_validator.is_none() {
        check_flags(&problem.root_group)?;
    }
    Ok(())
}

impl EvaluationPlan {
    pub fn build(
        problem: &ProblemVersion,
        program: CompiledProgram,
        helpers: ProblemPrograms,
        files: &HashMap<String, PathBuf>,
    ) -> JudgeResult<Self> {
        validate(problem)?;
        let plan_type = if problem.interactive {
            PlanType::Interactive
        } else {
            PlanType::Simple
        };
        Ok(EvaluationPlan {
            program,
            root: TestGroup::from_spec(&problem.root_group, files, None)?,
            time_limit_ms: problem.time_limit_ms as u64,
            memory_limit_kb: problem.memory_limit_kb as u64,
            plan_type,
            validator: helpers.validator,
            scoring_validator: problem.scoring_validator,
            grader: helpers.grader,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    TestCase,
    TestGroup,
}

/// One streamed evaluation result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalResult {
    pub kind: ResultKind,
    pub verdict: Verdict,
    pub score: f64,
    pub time_usage_ms: i64,
}

impl EvalResult {
    pub fn case(verdict: Verdict, score: f64, time_usage_ms: i64) -> Self {
        Self {
            kind: ResultKind::TestCase,
            verdict,
            score,
            time_usage_ms,
        }
    }

    pub fn group(verdict: Verdict, score: f64, time_usage_ms: i64) -> Self {
        Self {
            kind: ResultKind::TestGroup,
            verdict,
            score,
            time_usage_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::program;
    use gavel_common::types::TestCaseSpec;
    use std::path::Path;

    fn spec(name: &str, cases: &[&str], groups: Vec<TestGroupSpec>) -> TestGroupSpec {
        serde_json::from_value::<TestGroupSpec>(serde_json::json!({"id": 1, "name": name}))
            .map(|mut group| {
                group.cases = cases
                    .iter()
                    .enumerate()
                    .map(|(i, case)| TestCaseSpec {
                        id: i as i64 + 1,
                        name: case.to_string(),
                        input_hash: format!("{}.in", case),
                        output_hash: format!("{}.ans", case),
                    })
                    .collect();
                group.groups = groups;
                group
            })
            .unwrap()
    }

    fn files(names: &[&str]) -> HashMap<String, PathBuf> {
        names
            .iter()
            .flat_map(|n| [format!("{}.in", n), format!("{}.ans", n)])
            .map(|h| (h.clone(), PathBuf::from("/cache").join(h)))
            .collect()
    }

    fn problem(root: TestGroupSpec) -> ProblemVersion {
        ProblemVersion {
            id: 1,
            time_limit_ms: 1000,
            memory_limit_kb: 262_144,
            interactive: false,
            root_group: root,
            output_validator: None,
            scoring_validator: false,
            custom_grader: None,
            included_files: Default::default(),
        }
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("SUM".parse::<ScoringMode>().unwrap(), ScoringMode::Sum);
        assert_eq!("avg".parse::<ScoringMode>().unwrap(), ScoringMode::Avg);
        assert_eq!("worst_error".parse::<VerdictMode>().unwrap(), VerdictMode::WorstError);
        assert!(matches!("median".parse::<ScoringMode>(), Err(JudgeError::Plan(_))));
        assert!(matches!("last_error".parse::<VerdictMode>(), Err(JudgeError::Plan(_))));
    }

    #[test]
    fn test_children_sorted_by_name() {
        let root = spec("root", &["c", "a", "b"], vec![spec("z", &[], vec![]), spec("m", &[], vec![])]);
        let group = TestGroup::from_spec(&root, &files(&["a", "b", "c"]), None).unwrap();
        let cases: Vec<_> = group.cases.iter().map(|c| c.name.as_str()).collect();
        let groups: Vec<_> = group.groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(cases, vec!["a", "b", "c"]);
        assert_eq!(groups, vec!["m", "z"]);
        assert_eq!(group.cases[0].input.path, Path::new("/cache/a.in"));
    }

    #[test]
    fn test_missing_file() {
        let root = spec("root", &["a"], vec![]);
        let err = TestGroup::from_spec(&root, &HashMap::new(), None).unwrap_err();
        assert!(matches!(err, JudgeError::MissingFile(_)));
    }

    #[test]
    fn test_flags_inherited() {
        let mut root = spec("root", &[], vec![spec("child", &[], vec![])]);
        root.output_validator_flags = vec!["case_sensitive".to_string()];
        let group = TestGroup::from_spec(&root, &HashMap::new(), None).unwrap();
        assert_eq!(group.groups[0].policy.output_validator_flags, vec!["case_sensitive"]);
    }

    #[test]
    fn test_validate_rejects_before_work() {
        let mut interactive = problem(spec("root", &[], vec![]));
        interactive.interactive = true;
        assert!(matches!(validate(&interactive), Err(JudgeError::Plan(_))));

        let mut bad_mode = spec("root", &[], vec![spec("child", &[], vec![])]);
        bad_mode.groups[0].verdict_mode = "sometimes".to_string();
        assert!(validate(&problem(bad_mode)).is_err());

        let mut bad_flag = spec("root", &[], vec![]);
        bad_flag.output_validator_flags = vec!["float_tolerance".to_string(), "x".to_string()];
        assert!(validate(&problem(bad_flag)).is_err());
    }

    #[test]
    fn test_validate_bounds_limits() {
        let mut huge_time = problem(spec("root", &[], vec![]));
        huge_time.time_limit_ms = i64::MAX;
        assert!(matches!(validate(&huge_time), Err(JudgeError::Plan(_))));

        let mut huge_memory = problem(spec("root", &[], vec![]));
        huge_memory.memory_limit_kb = MAX_MEMORY_LIMIT_KB + 1;
        assert!(matches!(validate(&huge_memory), Err(JudgeError::Plan(_))));

        let mut largest = problem(spec("root", &[], vec![]));
        largest.time_limit_ms = MAX_TIME_LIMIT_MS;
        largest.memory_limit_kb = MAX_MEMORY_LIMIT_KB;
        assert!(validate(&largest).is_ok());
    }

    #[test]
    fn test_build_plan() {
        let dir = tempfile::tempdir().unwrap();
        let plan = EvaluationPlan::build(
            &problem(spec("root", &["a"], vec![])),
            program(dir.path()),
            ProblemPrograms::default(),
            &files(&["a"]),
        )
        .unwrap();
        assert_eq!(plan.plan_type, PlanType::Simple);
        assert_eq!(plan.time_limit_ms, 1000);
        assert_eq!(plan.root.cases.len(), 1);
    }

    #[test]
    fn test_threshold_classification() {
        let policy = GroupPolicy {
            accept_score: Some(50.0),
            reject_score: Some(10.0),
            ..Default::default()
        };
        assert!(policy.passed(Verdict::WrongAnswer, 60.0));
        assert!(!policy.passed(Verdict::Accepted, 5.0));
        assert!(policy.passed(Verdict::Accepted, 30.0));
        assert!(!policy.passed(Verdict::WrongAnswer, 30.0));
        assert!(GroupPolicy::default().passed(Verdict::Accepted, 0.0));
    }
}
