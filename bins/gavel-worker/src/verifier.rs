/// Output Verifier - Is the Produced Output Correct?
///
/// Either the built-in token diff, or a problem-supplied validator program
/// following the exit code contract: 42 accepts, 43 rejects, anything else
/// is a fault of the problem and fails the run.
use crate::engine::{ResourceLimits, Termination};
use crate::error::{JudgeError, JudgeResult};
use crate::plan::TestCase;
use crate::runner::{Invocation, Link, ProgramRunner};
use gavel_common::diff::{diff, DiffArgs};
use gavel_common::types::Verdict;
use std::path::Path;
use tokio::fs;
use tracing::debug;

const VALIDATOR_ACCEPT: i32 = 42;
const VALIDATOR_REJECT: i32 = 43;
const FEEDBACK_DIR: &str = "feedback";
const SCORE_FILE: &str = "score.txt";
const TESTDATA_INPUT: &str = "testdata_input";
const JUDGE_ANSWER: &str = "judge_answer";

pub const VALIDATOR_LIMITS: ResourceLimits = ResourceLimits {
    cpu_time_ms: 60_000,
    wall_time_ms: 120_000,
    memory_kb: 2 * 1024 * 1024,
    max_processes: 10,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verification {
    pub verdict: Verdict,
    pub score: f64,
}

impl Verification {
    fn of(verdict: Verdict) -> Self {
        let score = if verdict.is_accepted() { 1.0 } else { 0.0 };
        Self { verdict, score }
    }
}

pub enum OutputVerifier {
    TokenDiff,
    Validator { runner: ProgramRunner, scoring: bool },
}

async fn read_lossy(path: &Path) -> JudgeResult<String> {
    let bytes = fs::read(path).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

impl OutputVerifier {
    pub async fn verify(&mut self, case: &TestCase, output: &Path, flags: &[String]) -> JudgeResult<Verification> {
        match self {
            OutputVerifier::TokenDiff => {
                let args = DiffArgs::from_flags(flags).map_err(|e| JudgeError::Plan(e.to_string()))?;
                let reference = read_lossy(&case.answer.path).await?;
                let produced = read_lossy(output).await?;
                let result = diff(&reference, &produced, &args);
                if !result.matched {
                    debug!(case = %case.name, difference = %result.description, "Output mismatch");
                }
                Ok(Verification::of(if result.matched {
                    Verdict::Accepted
                } else {
                    Verdict::WrongAnswer
                }))
            }
            OutputVerifier::Validator { runner, scoring } => {
                validate(runner, *scoring, case, output, flags).await
            }
        }
    }
}

async fn validate(
    runner: &mut ProgramRunner,
    scoring: bool,
    case: &TestCase,
    output: &Path,
    flags: &[String],
) -> JudgeResult<Verification> {
    let scratch = runner.scratch().await?;
    let feedback = scratch.subdir(FEEDBACK_DIR).await?;

    let mut extra_args = vec![
        runner.linked_path(TESTDATA_INPUT).display().to_string(),
        runner.linked_path(JUDGE_ANSWER).display().to_string(),
        feedback.display().to_string(),
    ];
    extra_args.extend(flags.iter().cloned());
    let invocation = Invocation {
        links: vec![
            Link {
                source: case.input.path.clone(),
                name: TESTDATA_INPUT.to_string(),
            },
            Link {
                source: case.answer.path.clone(),
                name: JUDGE_ANSWER.to_string(),
            },
        ],
        extra_args,
    };

    let outcome = runner.run(&scratch, output, &invocation).await?;
    let verification = match outcome.execution.termination {
        Termination::Exited(VALIDATOR_ACCEPT) => {
            let mut verification = Verification::of(Verdict::Accepted);
            if scoring {
                if let Some(score) = read_score(&feedback.join(SCORE_FILE)).await? {
                    verification.score = score;
                }
            }
            verification
        }
        Termination::Exited(VALIDATOR_REJECT) => Verification::of(Verdict::WrongAnswer),
        Termination::ResourceExceeded(kind) => {
            return Err(JudgeError::Validator(format!(
                "validator exceeded its {:?} limit on case {}",
                kind, case.name
            )));
        }
        termination => {
            let stderr = read_lossy(&outcome.stderr).await.unwrap_or_default();
            let stdout = read_lossy(&outcome.stdout).await.unwrap_or_default();
            return Err(JudgeError::Validator(format!(
                "validator terminated with {:?} on case {}: {}{}",
                termination, case.name, stderr, stdout
            )));
        }
    };
    scratch.discard().await?;
    Ok(verification)
}

async fn read_score(path: &Path) -> JudgeResult<Option<f64>> {
    if !fs::try_exists(path).await? {
        return Ok(None);
    }
    let text = read_lossy(path).await?;
    let score = text
        .trim()
        .parse::<f64>()
        .map_err(|_| JudgeError::Validator(format!("unreadable score: {:?}", text.trim())))?;
    Ok(Some(score))
}
