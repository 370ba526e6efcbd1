/// Run Executor - High-Level Orchestration
///
/// **Responsibility:**
/// Take one run id from the queue to a terminal status.
///
/// **Lifecycle:**
/// 1. Skip runs that are missing or already terminal
/// 2. Hold an evaluation slot for the whole pass
/// 3. `compiling`: compile the programs while test data is materialized
/// 4. `running`: evaluate and persist concurrently over a result channel
/// 5. `done` with the root verdict, score and time
///
/// A submission that does not compile ends as `compile_error`. Any other
/// failure ends as `judging_error`; nothing is retried automatically.
use crate::error::{JudgeError, JudgeResult};
use crate::evaluator::Evaluator;
use crate::files::FileStore;
use crate::language::{CompiledProgram, LanguageRegistry};
use crate::metrics;
use crate::persister::persist;
use crate::plan::{self, EvaluationPlan, ProblemPrograms};
use crate::queue::RunHandler;
use crate::slots::EvaluationSlots;
use crate::store::RunStore;
use async_trait::async_trait;
use gavel_common::types::{ProblemVersion, RunStatus, RunUpdate, SubmissionRun};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const RESULT_BUFFER: usize = 64;

pub struct Judge {
    store: Arc<dyn RunStore>,
    files: FileStore,
    languages: Arc<LanguageRegistry>,
    slots: EvaluationSlots,
    root: PathBuf,
    evaluate_all: bool,
}

impl Judge {
    pub fn new(
        store: Arc<dyn RunStore>,
        files: FileStore,
        languages: Arc<LanguageRegistry>,
        slots: EvaluationSlots,
        root: PathBuf,
        evaluate_all: bool,
    ) -> Self {
        Self {
            store,
            files,
            languages,
            slots,
            root,
            evaluate_all,
        }
    }

    async fn judge(&self, run: &SubmissionRun, dir: &Path) -> JudgeResult<RunStatus> {
        self.store.update_run(run.id, &RunUpdate::status(RunStatus::Compiling)).await?;

        let problem = self
            .store
            .get_problem(run.problem_version_id)
            .await?
            .ok_or_else(|| JudgeError::Plan(format!("problem version {} not found", run.problem_version_id)))?;
        plan::validate(&problem)?;

        if fs::try_exists(dir).await? {
            fs::remove_dir_all(dir).await?;
        }
        fs::create_dir_all(dir).await?;

        let hashes = problem.root_group.file_hashes();
        let (programs, files) = tokio::join!(
            self.compile_programs(run, &problem, dir),
            self.files.ensure(&hashes)
        );
        let (program, helpers) = match programs {
            Ok(programs) => programs,
            Err(JudgeError::Compilation(diagnostics)) => {
                let update = RunUpdate {
                    status: Some(RunStatus::CompileError),
                    compile_error: Some(diagnostics),
                    ..Default::default()
                };
                self.store.update_run(run.id, &update).await?;
                info!("Submission does not compile");
                return Ok(RunStatus::CompileError);
            }
            Err(e) => return Err(e),
        };
        let files = files?;

        self.store.update_run(run.id, &RunUpdate::status(RunStatus::Running)).await?;
        let plan = EvaluationPlan::build(&problem, program, helpers, &files)?;
        let evaluator = Evaluator::create(&plan, &self.languages, &dir.join("sandbox"), self.evaluate_all).await?;

        let (tx, rx) = mpsc::channel(RESULT_BUFFER);
        let (produced, persisted) = tokio::join!(
            evaluator.run(tx),
            persist(run.id, &plan, rx, self.store.as_ref(), self.evaluate_all)
        );
        // A failed write closes the stream under the producer; report the write.
        let root = persisted?;
        produced?;

        let update = RunUpdate {
            status: Some(RunStatus::Done),
            verdict: Some(root.verdict),
            score: Some(root.score),
            time_usage_ms: Some(root.time_usage_ms),
            compile_error: None,
        };
        self.store.update_run(run.id, &update).await?;
        info!(verdict = %root.verdict, score = root.score, time_ms = root.time_usage_ms, "Run judged");
        Ok(RunStatus::Done)
    }

    /// Compile the submission with the problem's included files, then the
    /// problem's validator and grader. Only the submission's compile errors
    /// are the contestant's fault.
    async fn compile_programs(
        &self,
        run: &SubmissionRun,
        problem: &ProblemVersion,
        dir: &Path,
    ) -> JudgeResult<(CompiledProgram, ProblemPrograms)> {
        let source = problem.with_included_files(&run.program);
        let program = self.languages.compile(&source, &dir.join("program")).await?;
        let validator = match &problem.output_validator {
            Some(source) => Some(
                self.languages
                    .compile(source, &dir.join("validator"))
                    .await
                    .map_err(helper_error(JudgeError::Validator))?,
            ),
            None => None,
        };
        let grader = match &problem.custom_grader {
            Some(source) => Some(
                self.languages
                    .compile(source, &dir.join("grader"))
                    .await
                    .map_err(helper_error(JudgeError::Grader))?,
            ),
            None => None,
        };
        Ok((program, ProblemPrograms { validator, grader }))
    }

    async fn mark_failed(&self, run_id: i64) {
        let update = RunUpdate::status(RunStatus::JudgingError);
        if let Err(e) = self.store.update_run(run_id, &update).await {
            error!(error = %e, "Failed to record judging error");
        }
    }
}

/// A helper program that does not compile is a broken problem.
fn helper_error(kind: fn(String) -> JudgeError) -> impl Fn(JudgeError) -> JudgeError {
    move |e| match e {
        JudgeError::Compilation(diagnostics) => kind(format!("does not compile: {}", diagnostics)),
        other => other,
    }
}

#[async_trait]
impl RunHandler for Judge {
    #[tracing::instrument(skip(self))]
    async fn handle(&self, run_id: i64) {
        let run = match self.store.get_run(run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                warn!("Run not found, skipping");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to load run");
                return;
            }
        };
        if run.status.is_terminal() {
            debug!(status = %run.status, "Run already judged");
            return;
        }

        let _slot = match self.slots.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                error!(error = %e, "No evaluation slot");
                return;
            }
        };
        info!(
            submission_id = run.submission_id,
            problem_version_id = run.problem_version_id,
            language = %run.program.language,
            "Judging run"
        );
        metrics::run_started();
        let start = Instant::now();

        let dir = self.root.join(run_id.to_string());
        let status = match self.judge(&run, &dir).await {
            Ok(status) => status,
            Err(e) => {
                error!(error = %e, "Judging failed");
                self.mark_failed(run_id).await;
                RunStatus::JudgingError
            }
        };

        if let Err(e) = fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, dir = %dir.display(), "Failed to clean up run directory");
            }
        }
        metrics::run_finished(&status.to_string(), start.elapsed());
        info!(status = %status, elapsed_ms = start.elapsed().as_millis() as u64, "Run finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LanguageConfigManager;
    use crate::testing::{MemoryStore, Scripted, ScriptedProvider, ScriptedSandbox};
    use base64::{engine::general_purpose, Engine as _};
    use gavel_common::types::{ProgramSource, Verdict};
    use std::collections::BTreeMap;

    struct Harness {
        dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        sandbox: Arc<ScriptedSandbox>,
        judge: Judge,
    }

    fn harness(sandbox: ScriptedSandbox) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let sandbox = Arc::new(sandbox);
        let configs = LanguageConfigManager::parse(
            r#"{"languages": [
                {"name": "cpp", "image": "gcc:13", "compile": ["g++", "-o", "main", "{sources}"], "run": ["./main"]},
                {"name": "python3", "image": "python:3.12-slim", "run": ["python3", "{main}"]}
            ]}"#,
        )
        .unwrap();
        let languages = LanguageRegistry::new(configs, Arc::new(ScriptedProvider::new(sandbox.clone())));
        let judge = Judge::new(
            store.clone(),
            FileStore::new(dir.path().join("cache"), store.clone()),
            Arc::new(languages),
            EvaluationSlots::new(1),
            dir.path().join("runs"),
            false,
        );
        Harness {
            dir,
            store,
            sandbox,
            judge,
        }
    }

    fn source(language: &str) -> ProgramSource {
        let mut files = BTreeMap::new();
        files.insert("main.src".to_string(), general_purpose::STANDARD.encode("solution"));
        ProgramSource {
            language: language.to_string(),
            files,
        }
    }

    /// Cases `t1..tn` under one root group; case `i` reads `in{i}` and expects `ans{i}`.
    fn stored_problem(root_policy: serde_json::Value, answers: &[(&str, &str)], store: &MemoryStore) -> ProblemVersion {
        let mut cases = Vec::new();
        for (i, (input, answer)) in answers.iter().enumerate() {
            let n = i + 1;
            store.add_file(&format!("in{}", n), input);
            store.add_file(&format!("ans{}", n), answer);
            cases.push(serde_json::json!({
                "id": n,
                "name": format!("t{}", n),
                "input_hash": format!("in{}", n),
                "output_hash": format!("ans{}", n),
            }));
        }
        let mut root = serde_json::json!({"id": 100, "name": "root", "cases": cases});
        if let (Some(root), Some(policy)) = (root.as_object_mut(), root_policy.as_object()) {
            root.extend(policy.clone());
        }
        serde_json::from_value(serde_json::json!({
            "id": 1,
            "time_limit_ms": 1000,
            "memory_limit_kb": 65536,
            "root_group": root,
        }))
        .unwrap()
    }

    fn submit(h: &Harness, problem: ProblemVersion, language: &str) -> i64 {
        h.store.add_problem(problem);
        h.store.add_run(SubmissionRun::new(7, 1, 1, source(language)));
        7
    }

    #[tokio::test]
    async fn test_first_error_sum_scenario() {
        let h = harness(ScriptedSandbox::echo());
        let problem = stored_problem(serde_json::json!({}), &[("1\n", "1\n"), ("2\n", "3\n")], &h.store);
        let run_id = submit(&h, problem, "python3");

        h.judge.handle(run_id).await;

        let run = h.store.run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Done);
        assert_eq!(run.verdict, Some(Verdict::WrongAnswer));
        assert_eq!(run.score, 1.0);
        let verdicts: Vec<Verdict> = h.store.case_runs().iter().map(|c| c.verdict).collect();
        assert_eq!(verdicts, vec![Verdict::Accepted, Verdict::WrongAnswer]);
        assert_eq!(h.store.group_runs().len(), 1);

        let statuses: Vec<Option<RunStatus>> = h.store.updates().iter().map(|(_, u)| u.status).collect();
        assert_eq!(
            statuses,
            vec![Some(RunStatus::Compiling), Some(RunStatus::Running), Some(RunStatus::Done)]
        );
        assert!(!h.dir.path().join("runs").join("7").exists());
    }

    #[tokio::test]
    async fn test_break_on_reject_scenario() {
        let h = harness(ScriptedSandbox::echo());
        let problem = stored_problem(
            serde_json::json!({"break_on_reject": true}),
            &[("1\n", "1\n"), ("2\n", "0\n"), ("3\n", "3\n")],
            &h.store,
        );
        let run_id = submit(&h, problem, "python3");

        h.judge.handle(run_id).await;

        assert_eq!(h.sandbox.requests().len(), 2);
        assert_eq!(h.store.case_runs().len(), 2);
        let run = h.store.run(run_id).unwrap();
        assert_eq!(run.verdict, Some(Verdict::WrongAnswer));
        assert_eq!(run.score, 1.0);
    }

    #[tokio::test]
    async fn test_accept_if_any_accepted_scenario() {
        let h = harness(ScriptedSandbox::echo());
        let problem = stored_problem(
            serde_json::json!({"accept_if_any_accepted": true}),
            &[("1\n", "0\n"), ("2\n", "2\n"), ("3\n", "0\n")],
            &h.store,
        );
        let run_id = submit(&h, problem, "python3");

        h.judge.handle(run_id).await;

        let run = h.store.run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Done);
        assert_eq!(run.verdict, Some(Verdict::Accepted));
    }

    #[tokio::test]
    async fn test_compile_error() {
        let h = harness(ScriptedSandbox::with(|_, request| {
            if request.command == "g++" {
                std::fs::write(&request.stderr, "main.src:1: error").unwrap();
                return Scripted::exit(1);
            }
            Scripted::output("1\n")
        }));
        let problem = stored_problem(serde_json::json!({}), &[("1\n", "1\n")], &h.store);
        let run_id = submit(&h, problem, "cpp");

        h.judge.handle(run_id).await;

        let run = h.store.run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::CompileError);
        assert!(run.compile_error.unwrap().contains("main.src:1: error"));
        assert!(h.store.case_runs().is_empty());
    }

    #[tokio::test]
    async fn test_judging_errors() {
        let h = harness(ScriptedSandbox::echo());
        h.store.add_run(SubmissionRun::new(7, 1, 404, source("python3")));
        h.judge.handle(7).await;
        assert_eq!(h.store.run(7).unwrap().status, RunStatus::JudgingError);

        let h = harness(ScriptedSandbox::echo());
        let problem = stored_problem(serde_json::json!({}), &[("1\n", "1\n")], &h.store);
        let run_id = submit(&h, problem, "cobol");
        h.judge.handle(run_id).await;
        assert_eq!(h.store.run(run_id).unwrap().status, RunStatus::JudgingError);
        assert!(h.sandbox.requests().is_empty());

        let h = harness(ScriptedSandbox::echo());
        let problem = stored_problem(serde_json::json!({"verdict_mode": "best_effort"}), &[("1\n", "1\n")], &h.store);
        let run_id = submit(&h, problem, "python3");
        h.judge.handle(run_id).await;
        assert_eq!(h.store.run(run_id).unwrap().status, RunStatus::JudgingError);
        assert!(h.sandbox.requests().is_empty());
    }

    #[tokio::test]
    async fn test_broken_validator_is_judging_error() {
        let h = harness(ScriptedSandbox::with(|_, request| {
            if request.command == "g++" {
                return Scripted::exit(1);
            }
            Scripted::output("1\n")
        }));
        let mut problem = stored_problem(serde_json::json!({}), &[("1\n", "1\n")], &h.store);
        problem.output_validator = Some(source("cpp"));
        let run_id = submit(&h, problem, "python3");

        h.judge.handle(run_id).await;

        let run = h.store.run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::JudgingError);
        assert_eq!(run.compile_error, None);
    }

    #[tokio::test]
    async fn test_failed_write_is_reported_as_storage_error() {
        let h = harness(ScriptedSandbox::echo());
        h.store.fail_case_writes();
        let answers = [("1\n", "1\n"), ("2\n", "2\n"), ("3\n", "3\n"), ("4\n", "4\n")];
        let problem = stored_problem(serde_json::json!({}), &answers, &h.store);
        let run_id = submit(&h, problem, "python3");
        let run = h.store.run(run_id).unwrap();

        let err = h.judge.judge(&run, &h.dir.path().join("runs").join("7")).await.unwrap_err();
        assert!(matches!(err, JudgeError::Storage(_)), "unexpected error: {}", err);

        h.judge.handle(run_id).await;
        assert_eq!(h.store.run(run_id).unwrap().status, RunStatus::JudgingError);
    }

    #[tokio::test]
    async fn test_included_files_replace_submitted_ones() {
        let h = harness(ScriptedSandbox::with(|stdin, request| {
            if request.command == "g++" {
                let read = |name: &str| std::fs::read_to_string(request.working_dir.join(name)).unwrap_or_default();
                let sources_listed = request.args.iter().any(|a| a == "harness.src");
                if read("main.src") == "solution" && read("harness.src") == "harness" && sources_listed {
                    return Scripted::exit(0);
                }
                return Scripted::exit(1);
            }
            Scripted::output(stdin)
        }));
        let mut problem = stored_problem(serde_json::json!({}), &[("1\n", "1\n")], &h.store);
        let mut included = BTreeMap::new();
        included.insert("harness.src".to_string(), general_purpose::STANDARD.encode("harness"));
        problem.included_files.insert("cpp".to_string(), included);
        problem
            .included_files
            .insert("python3".to_string(), BTreeMap::from([("main.src".to_string(), "eA==".to_string())]));
        h.store.add_problem(problem);

        let mut program = source("cpp");
        program
            .files
            .insert("harness.src".to_string(), general_purpose::STANDARD.encode("tampered"));
        h.store.add_run(SubmissionRun::new(7, 1, 1, program));

        h.judge.handle(7).await;

        let run = h.store.run(7).unwrap();
        assert_eq!(run.compile_error, None);
        assert_eq!(run.status, RunStatus::Done);
        assert_eq!(run.verdict, Some(Verdict::Accepted));
    }

    #[tokio::test]
    async fn test_terminal_run_is_left_alone() {
        let h = harness(ScriptedSandbox::echo());
        let problem = stored_problem(serde_json::json!({}), &[("1\n", "1\n")], &h.store);
        let run_id = submit(&h, problem, "python3");
        h.judge.handle(run_id).await;
        let updates = h.store.updates().len();

        h.judge.handle(run_id).await;
        h.judge.handle(999).await;

        assert_eq!(h.store.updates().len(), updates);
    }
}
