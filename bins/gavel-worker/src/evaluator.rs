/// Test-Tree Evaluator - Producer Side of the Result Stream
///
/// **Core Responsibility:**
/// Walk the plan's group tree in flattening order and stream one result per
/// evaluated case and per finished group.
///
/// **Critical Properties:**
/// - Knows nothing about Redis
/// - Never sends identifiers, only results in walk order
/// - Skipped units (break on reject) produce nothing
/// - Dropping the sender after the root aggregate ends the stream
use crate::engine::ResourceLimits;
use crate::error::{JudgeError, JudgeResult};
use crate::grader::{Grader, GRADER_LIMITS};
use crate::language::LanguageRegistry;
use crate::metrics;
use crate::plan::{EvalResult, EvaluationPlan, PlanType, TestCase, TestGroup};
use crate::runner::{Invocation, ProgramRunner};
use crate::tree::{self, should_break, ChildOutcome, Flattener, Step};
use crate::verifier::{OutputVerifier, VALIDATOR_LIMITS};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::mpsc;
use tracing::debug;

/// Identical (input, answer, flags) triples are judged once per run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    input: String,
    answer: String,
    flags: String,
}

impl CacheKey {
    fn of(case: &TestCase, flags: &[String]) -> Self {
        Self {
            input: case.input.hash.clone(),
            answer: case.answer.hash.clone(),
            flags: flags.join(" "),
        }
    }
}

pub struct Evaluator<'a> {
    plan: &'a EvaluationPlan,
    submission: ProgramRunner,
    verifier: OutputVerifier,
    grader: Option<Grader>,
    cache: HashMap<CacheKey, EvalResult>,
    evaluate_all: bool,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        plan: &'a EvaluationPlan,
        submission: ProgramRunner,
        verifier: OutputVerifier,
        grader: Option<Grader>,
        evaluate_all: bool,
    ) -> Self {
        Self {
            plan,
            submission,
            verifier,
            grader,
            cache: HashMap::new(),
            evaluate_all,
        }
    }

    /// Open sandboxes for the submission and the problem's helper programs,
    /// with their environments under `dir`.
    pub async fn create(
        plan: &'a EvaluationPlan,
        languages: &LanguageRegistry,
        dir: &Path,
        evaluate_all: bool,
    ) -> JudgeResult<Self> {
        if plan.plan_type == PlanType::Interactive {
            return Err(JudgeError::Plan("interactive plans are not supported".to_string()));
        }

        let limits = ResourceLimits::for_submission(plan.time_limit_ms, plan.memory_limit_kb);
        let sandbox = languages.sandbox_for(&plan.program).await?;
        let submission = ProgramRunner::create(sandbox, &plan.program, &dir.join("submission"), limits).await?;

        let verifier = match &plan.validator {
            Some(program) => {
                let sandbox = languages.sandbox_for(program).await?;
                let runner = ProgramRunner::create(sandbox, program, &dir.join("validator"), VALIDATOR_LIMITS).await?;
                OutputVerifier::Validator {
                    runner,
                    scoring: plan.scoring_validator,
                }
            }
            None => OutputVerifier::TokenDiff,
        };

        let grader = match &plan.grader {
            Some(program) => {
                let sandbox = languages.sandbox_for(program).await?;
                let runner = ProgramRunner::create(sandbox, program, &dir.join("grader"), GRADER_LIMITS).await?;
                Some(Grader::new(runner))
            }
            None => None,
        };

        Ok(Self::new(plan, submission, verifier, grader, evaluate_all))
    }

    /// Evaluate the whole tree, sending results into `tx`.
    pub async fn run(mut self, tx: mpsc::Sender<EvalResult>) -> JudgeResult<()> {
        let plan = self.plan;
        let mut walk = Flattener::new(&plan.root);
        let mut frames: Vec<(&TestGroup, Vec<ChildOutcome>)> = Vec::new();

        while let Some(step) = walk.next() {
            match step {
                Step::Enter(group) => frames.push((group, Vec::new())),
                Step::Case(case) => {
                    let (group, children) = frames
                        .last_mut()
                        .ok_or_else(|| JudgeError::Stream("case outside any group".to_string()))?;
                    let result = self.evaluate_case(case, &group.policy.output_validator_flags).await?;
                    send(&tx, result).await?;
                    children.push(ChildOutcome::of(&result, false));
                    if should_break(&group.policy, result.verdict, self.evaluate_all) {
                        walk.skip_remaining();
                    }
                }
                Step::Leave(group) => {
                    let (_, children) = frames
                        .pop()
                        .ok_or_else(|| JudgeError::Stream("unbalanced group walk".to_string()))?;
                    let result = self.aggregate(group, &children).await?;
                    send(&tx, result).await?;
                    if let Some((parent, siblings)) = frames.last_mut() {
                        siblings.push(ChildOutcome::of(&result, group.policy.ignore_sample));
                        if should_break(&parent.policy, result.verdict, self.evaluate_all) {
                            walk.skip_remaining();
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn evaluate_case(&mut self, case: &TestCase, flags: &[String]) -> JudgeResult<EvalResult> {
        let key = CacheKey::of(case, flags);
        if let Some(cached) = self.cache.get(&key) {
            metrics::record_cache_hit("evaluation");
            debug!(case = %case.name, "Reusing cached evaluation");
            return Ok(*cached);
        }

        let scratch = self.submission.scratch().await?;
        let outcome = self
            .submission
            .run(&scratch, &case.input.path, &Invocation::default())
            .await?;
        let time_usage_ms = outcome.execution.time_usage_ms;
        let result = match outcome.failure_verdict() {
            Some(verdict) => EvalResult::case(verdict, 0.0, time_usage_ms),
            None => {
                let verification = self.verifier.verify(case, &outcome.stdout, flags).await?;
                EvalResult::case(verification.verdict, verification.score, time_usage_ms)
            }
        };
        scratch.discard().await?;

        debug!(case = %case.name, verdict = %result.verdict, time_ms = time_usage_ms, "Case evaluated");
        self.cache.insert(key, result);
        Ok(result)
    }

    async fn aggregate(&mut self, group: &TestGroup, children: &[ChildOutcome]) -> JudgeResult<EvalResult> {
        let result = match (&mut self.grader, group.policy.custom_grading) {
            (Some(grader), true) => grader.grade(children, &group.policy.grader_flags).await?,
            _ => tree::aggregate(&group.policy, children),
        };
        debug!(group = %group.name, verdict = %result.verdict, score = result.score, "Group aggregated");
        Ok(result)
    }
}

async fn send(tx: &mpsc::Sender<EvalResult>, result: EvalResult) -> JudgeResult<()> {
    tx.send(result)
        .await
        .map_err(|_| JudgeError::Stream("result consumer went away".to_string()))
}
