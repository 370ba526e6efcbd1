// Test doubles shared by the unit tests of the worker modules

use crate::engine::{ExecRequest, Execution, ResourceKind, Sandbox, SandboxProvider, Termination};
use crate::error::{JudgeError, JudgeResult};
use crate::language::CompiledProgram;
use crate::store::RunStore;
use async_trait::async_trait;
use gavel_common::types::{CaseRun, GroupRun, ProblemVersion, RunUpdate, SubmissionRun};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn program(root: &Path) -> CompiledProgram {
    CompiledProgram {
        root: root.to_path_buf(),
        language: "test".to_string(),
        image: "test:latest".to_string(),
        sources: vec!["main".to_string()],
        run: vec!["./main".to_string()],
    }
}

/// What a scripted invocation does.
pub struct Scripted {
    pub termination: Termination,
    pub stdout: Option<String>,
    pub time_ms: i64,
}

impl Scripted {
    pub fn exit(code: i32) -> Self {
        Self {
            termination: Termination::Exited(code),
            stdout: None,
            time_ms: 1,
        }
    }

    pub fn output(text: impl Into<String>) -> Self {
        Self {
            termination: Termination::Exited(0),
            stdout: Some(text.into()),
            time_ms: 1,
        }
    }

    pub fn exceeded(kind: ResourceKind) -> Self {
        Self {
            termination: Termination::ResourceExceeded(kind),
            stdout: None,
            time_ms: 1,
        }
    }

    pub fn time(mut self, ms: i64) -> Self {
        self.time_ms = ms;
        self
    }
}

type Behavior = dyn Fn(&str, &ExecRequest) -> Scripted + Send + Sync;

/// Sandbox that answers from a closure over the invocation's stdin.
pub struct ScriptedSandbox {
    behavior: Option<Box<Behavior>>,
    requests: Mutex<Vec<ExecRequest>>,
}

impl ScriptedSandbox {
    pub fn with(behavior: impl Fn(&str, &ExecRequest) -> Scripted + Send + Sync + 'static) -> Self {
        Self {
            behavior: Some(Box::new(behavior)),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Copies stdin to stdout and exits cleanly.
    pub fn echo() -> Self {
        Self::with(|stdin, _| Scripted::output(stdin))
    }

    /// Echoes, terminating with each scripted termination in turn.
    pub fn new(terminations: Vec<Termination>) -> Self {
        let calls = AtomicUsize::new(0);
        Self::with(move |stdin, _| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            Scripted {
                termination: terminations.get(call).copied().unwrap_or(Termination::Exited(0)),
                stdout: Some(stdin.to_string()),
                time_ms: 1,
            }
        })
    }

    pub fn failing() -> Self {
        Self {
            behavior: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn reuse_flags(&self) -> Vec<bool> {
        self.requests().iter().map(|r| r.reuse_context).collect()
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn execute(&self, request: &ExecRequest) -> JudgeResult<Execution> {
        self.requests.lock().unwrap().push(request.clone());
        let Some(behavior) = &self.behavior else {
            return Err(JudgeError::Sandbox("scripted failure".to_string()));
        };
        let stdin = std::fs::read_to_string(&request.stdin).unwrap_or_default();
        let scripted = behavior(&stdin, request);
        if let Some(text) = scripted.stdout {
            std::fs::write(&request.stdout, text)?;
        }
        Ok(Execution {
            termination: scripted.termination,
            time_usage_ms: scripted.time_ms,
            memory_usage_kb: 0,
        })
    }
}

/// Hands out the same sandbox for every image.
pub struct ScriptedProvider {
    sandbox: Arc<dyn Sandbox>,
}

impl ScriptedProvider {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl SandboxProvider for ScriptedProvider {
    async fn open(&self, _image: &str) -> JudgeResult<Arc<dyn Sandbox>> {
        Ok(self.sandbox.clone())
    }
}

#[derive(Default)]
struct MemoryState {
    runs: HashMap<i64, SubmissionRun>,
    cases: BTreeMap<(i64, i64), CaseRun>,
    groups: BTreeMap<(i64, i64), GroupRun>,
    problems: HashMap<i64, ProblemVersion>,
    files: HashMap<String, Vec<u8>>,
    updates: Vec<(i64, RunUpdate)>,
    fail_case_writes: bool,
}

/// In-memory `RunStore`.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn add_run(&self, run: SubmissionRun) {
        self.state.lock().unwrap().runs.insert(run.id, run);
    }

    pub fn add_problem(&self, problem: ProblemVersion) {
        self.state.lock().unwrap().problems.insert(problem.id, problem);
    }

    pub fn add_file(&self, hash: &str, contents: &str) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(hash.to_string(), contents.as_bytes().to_vec());
    }

    /// Every later `store_case_run` fails with a storage error.
    pub fn fail_case_writes(&self) {
        self.state.lock().unwrap().fail_case_writes = true;
    }

    pub fn run(&self, id: i64) -> Option<SubmissionRun> {
        self.state.lock().unwrap().runs.get(&id).cloned()
    }

    pub fn case_runs(&self) -> Vec<CaseRun> {
        self.state.lock().unwrap().cases.values().cloned().collect()
    }

    pub fn group_runs(&self) -> Vec<GroupRun> {
        self.state.lock().unwrap().groups.values().cloned().collect()
    }

    pub fn updates(&self) -> Vec<(i64, RunUpdate)> {
        self.state.lock().unwrap().updates.clone()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn get_run(&self, run_id: i64) -> JudgeResult<Option<SubmissionRun>> {
        Ok(self.run(run_id))
    }

    async fn update_run(&self, run_id: i64, update: &RunUpdate) -> JudgeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.updates.push((run_id, update.clone()));
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| JudgeError::Storage(format!("run {} not found", run_id)))?;
        run.apply(update);
        Ok(())
    }

    async fn store_case_run(&self, row: &CaseRun) -> JudgeResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_case_writes {
            return Err(JudgeError::Storage("case write refused".to_string()));
        }
        state.cases.insert((row.run_id, row.test_case_id), row.clone());
        Ok(())
    }

    async fn store_group_run(&self, row: &GroupRun) -> JudgeResult<()> {
        self.state
            .lock()
            .unwrap()
            .groups
            .insert((row.run_id, row.test_group_id), row.clone());
        Ok(())
    }

    async fn get_problem(&self, problem_version_id: i64) -> JudgeResult<Option<ProblemVersion>> {
        Ok(self.state.lock().unwrap().problems.get(&problem_version_id).cloned())
    }

    async fn get_file(&self, hash: &str) -> JudgeResult<Option<Vec<u8>>> {
        Ok(self.state.lock().unwrap().files.get(hash).cloned())
    }

    async fn pending_runs(&self) -> JudgeResult<Vec<i64>> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<i64> = state
            .runs
            .values()
            .filter(|run| !run.status.is_terminal())
            .map(|run| run.id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}
