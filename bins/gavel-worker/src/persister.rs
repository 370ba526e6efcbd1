/// Result Persister - Consumer Side of the Result Stream
///
/// Replays the flat stream onto the plan's tree and upserts one row per
/// completed case and group. Returns the root aggregate, which becomes the
/// run's final verdict.
use crate::error::{JudgeError, JudgeResult};
use crate::plan::{EvalResult, EvaluationPlan};
use crate::store::RunStore;
use crate::tree::{Node, Reconstructor};
use gavel_common::types::{CaseRun, GroupRun};
use tokio::sync::mpsc;
use tracing::debug;

pub async fn persist(
    run_id: i64,
    plan: &EvaluationPlan,
    mut rx: mpsc::Receiver<EvalResult>,
    store: &dyn RunStore,
    evaluate_all: bool,
) -> JudgeResult<EvalResult> {
    let mut tree = Reconstructor::new(&plan.root, evaluate_all);
    let mut root = None;

    while let Some(result) = rx.recv().await {
        match tree.push(result)? {
            Node::Case(case, result) => {
                store
                    .store_case_run(&CaseRun {
                        run_id,
                        test_case_id: case.id,
                        verdict: result.verdict,
                        score: result.score,
                        time_usage_ms: result.time_usage_ms,
                    })
                    .await?;
            }
            Node::Group(group, result) => {
                store
                    .store_group_run(&GroupRun {
                        run_id,
                        test_group_id: group.id,
                        verdict: result.verdict,
                        score: result.score,
                        time_usage_ms: result.time_usage_ms,
                        passed: group.policy.passed(result.verdict, result.score),
                    })
                    .await?;
                debug!(run_id, group = %group.name, verdict = %result.verdict, "Group stored");
                if group.id == plan.root.id {
                    root = Some(result);
                }
            }
        }
    }

    tree.finish()?;
    root.ok_or_else(|| JudgeError::Stream("missing root aggregate".to_string()))
}
