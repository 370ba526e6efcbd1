/// Custom Grader - Problem-Supplied Group Aggregation
///
/// **Protocol:**
/// stdin carries one `VERDICT score` line per counted child, in evaluation
/// order, with verdicts as short codes (`AC`, `WA`, `TLE`, `RTE`).
/// The grader exits 0 and prints the group's `VERDICT score` on the first
/// line of stdout. Anything else fails the run.
use crate::engine::{ResourceLimits, Termination};
use crate::error::{JudgeError, JudgeResult};
use crate::plan::EvalResult;
use crate::runner::{Invocation, ProgramRunner};
use crate::tree::ChildOutcome;
use gavel_common::types::Verdict;
use tokio::fs;

const GRADER_INPUT: &str = "grader_input";

pub const GRADER_LIMITS: ResourceLimits = ResourceLimits {
    cpu_time_ms: 60_000,
    wall_time_ms: 120_000,
    memory_kb: 2 * 1024 * 1024,
    max_processes: 10,
};

pub struct Grader {
    runner: ProgramRunner,
}

fn render_input(children: &[ChildOutcome]) -> String {
    children
        .iter()
        .filter(|c| !c.ignored)
        .map(|c| format!("{} {}\n", c.verdict.short_code(), c.score))
        .collect()
}

fn parse_output(stdout: &str) -> Option<(Verdict, f64)> {
    let line = stdout.lines().next()?;
    let mut parts = line.split_whitespace();
    let verdict = Verdict::from_short_code(parts.next()?)?;
    let score = parts.next()?.parse::<f64>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((verdict, score))
}

impl Grader {
    pub fn new(runner: ProgramRunner) -> Self {
        Self { runner }
    }

    /// Aggregate `children` into the group result; time is still the
    /// slowest child, the grader only decides verdict and score.
    pub async fn grade(&mut self, children: &[ChildOutcome], flags: &[String]) -> JudgeResult<EvalResult> {
        let scratch = self.runner.scratch().await?;
        let input = scratch.path(GRADER_INPUT);
        fs::write(&input, render_input(children)).await?;

        let invocation = Invocation {
            links: Vec::new(),
            extra_args: flags.to_vec(),
        };
        let outcome = self.runner.run(&scratch, &input, &invocation).await?;
        let stdout = String::from_utf8_lossy(&fs::read(&outcome.stdout).await?).into_owned();
        if outcome.execution.termination != Termination::Exited(0) {
            let stderr = String::from_utf8_lossy(&fs::read(&outcome.stderr).await?).into_owned();
            return Err(JudgeError::Grader(format!(
                "grader terminated with {:?}: {}",
                outcome.execution.termination, stderr
            )));
        }
        let (verdict, score) = parse_output(&stdout)
            .ok_or_else(|| JudgeError::Grader(format!("unreadable grader output: {:?}", stdout.trim())))?;
        scratch.discard().await?;

        let time_usage_ms = children.iter().map(|c| c.time_usage_ms).max().unwrap_or(0);
        Ok(EvalResult::group(verdict, score, time_usage_ms))
    }
}
