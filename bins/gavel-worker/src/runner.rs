/// Program Runner - One Program, Many Invocations
///
/// **Responsibility:**
/// Drive a compiled program (a submission, a validator or a grader) through
/// repeated sandboxed invocations.
///
/// Per invocation:
/// 1. Create fresh `output`/`error` files in a new scratch directory
/// 2. Link them and the input into the program's environment
/// 3. Execute through the sandbox, reusing the context after the first call
/// 4. Reset permissions and clear the environment, on every path
///
/// The scratch files survive the invocation so the caller can verify them.
use crate::engine::{ExecRequest, Execution, ResourceKind, ResourceLimits, Sandbox, Termination};
use crate::env::{self, Environment, Side};
use crate::error::JudgeResult;
use crate::language::CompiledProgram;
use gavel_common::types::Verdict;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

/// Per-invocation directory holding the files a program produced.
#[derive(Debug)]
pub struct Scratch {
    dir: PathBuf,
}

impl Scratch {
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Create a subdirectory the program may write into, e.g. validator feedback.
    pub async fn subdir(&self, name: &str) -> std::io::Result<PathBuf> {
        let dir = self.dir.join(name);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    pub async fn discard(self) -> std::io::Result<()> {
        fs::remove_dir_all(&self.dir).await
    }
}

/// Extra files linked read-only into the environment for one invocation.
#[derive(Debug, Clone)]
pub struct Link {
    pub source: PathBuf,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub links: Vec<Link>,
    pub extra_args: Vec<String>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub execution: Execution,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl RunOutcome {
    /// Verdict implied by the termination alone; `None` for a clean exit,
    /// which leaves the decision to output verification.
    pub fn failure_verdict(&self) -> Option<Verdict> {
        match self.execution.termination {
            Termination::Exited(0) => None,
            Termination::Exited(_) | Termination::Signaled(_) => Some(Verdict::RunTimeError),
            Termination::ResourceExceeded(ResourceKind::CpuTime | ResourceKind::WallTime) => {
                Some(Verdict::TimeLimitExceeded)
            }
            Termination::ResourceExceeded(ResourceKind::Memory) => Some(Verdict::RunTimeError),
        }
    }
}

pub struct ProgramRunner {
    sandbox: Arc<dyn Sandbox>,
    command: String,
    args: Vec<String>,
    working_dir: PathBuf,
    env: Environment,
    scratch_root: PathBuf,
    limits: ResourceLimits,
    invocations: u64,
    reuse: bool,
}

impl ProgramRunner {
    /// Prepare a runner whose environment and scratch space live under `root`.
    pub async fn create(
        sandbox: Arc<dyn Sandbox>,
        program: &CompiledProgram,
        root: &Path,
        limits: ResourceLimits,
    ) -> JudgeResult<Self> {
        let env = Environment::create(&root.join("env")).await?;
        let scratch_root = root.join("scratch");
        fs::create_dir_all(&scratch_root).await?;
        let (command, args) = program.run_command()?;
        Ok(Self {
            sandbox,
            command,
            args,
            working_dir: program.root.clone(),
            env,
            scratch_root,
            limits,
            invocations: 0,
            reuse: false,
        })
    }

    /// Absolute path a linked file will have inside the sandbox.
    pub fn linked_path(&self, name: &str) -> PathBuf {
        self.env.path_for(Side::Read, name)
    }

    pub async fn scratch(&mut self) -> std::io::Result<Scratch> {
        self.invocations += 1;
        let dir = self.scratch_root.join(self.invocations.to_string());
        fs::create_dir_all(&dir).await?;
        Ok(Scratch { dir })
    }

    pub async fn run(&mut self, scratch: &Scratch, stdin: &Path, invocation: &Invocation) -> JudgeResult<RunOutcome> {
        let outcome = self.invoke(scratch, stdin, invocation).await;
        let reset = self.env.reset_permissions().await;
        let cleared = self.env.clear().await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.reuse = false;
                return Err(e);
            }
        };
        reset?;
        cleared?;

        // A wall time kill tears the context down; start the next call fresh.
        self.reuse = !matches!(
            outcome.execution.termination,
            Termination::ResourceExceeded(ResourceKind::WallTime)
        );
        Ok(outcome)
    }

    async fn invoke(&mut self, scratch: &Scratch, stdin: &Path, invocation: &Invocation) -> JudgeResult<RunOutcome> {
        let stdout = scratch.path(env::OUTPUT);
        let stderr = scratch.path(env::ERROR);
        fs::File::create(&stdout).await?;
        fs::File::create(&stderr).await?;

        let input = self.env.link(stdin, Side::Read, env::INPUT).await?;
        let output = self.env.link(&stdout, Side::Write, env::OUTPUT).await?;
        let error = self.env.link(&stderr, Side::Write, env::ERROR).await?;
        for link in &invocation.links {
            self.env.link(&link.source, Side::Read, &link.name).await?;
        }

        let mut args = self.args.clone();
        args.extend(invocation.extra_args.iter().cloned());

        let request = ExecRequest {
            command: self.command.clone(),
            args,
            working_dir: self.working_dir.clone(),
            stdin: input,
            stdout: output,
            stderr: error,
            extra_read: vec![self.env.read_dir().to_path_buf()],
            extra_write: vec![self.env.write_dir().to_path_buf(), self.scratch_root.clone()],
            limits: self.limits,
            reuse_context: self.reuse,
        };
        let execution = self.sandbox.execute(&request).await?;
        debug!(
            command = %self.command,
            termination = ?execution.termination,
            time_ms = execution.time_usage_ms,
            "Invocation finished"
        );

        Ok(RunOutcome {
            execution,
            stdout,
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{program, ScriptedSandbox};

    fn limits() -> ResourceLimits {
        ResourceLimits::for_submission(1000, 65536)
    }

    #[tokio::test]
    async fn test_reuse_after_first_call_and_fresh_after_wall_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(ScriptedSandbox::new(vec![
            Termination::Exited(0),
            Termination::ResourceExceeded(ResourceKind::WallTime),
            Termination::Exited(0),
            Termination::Exited(0),
        ]));
        let mut runner = ProgramRunner::create(sandbox.clone(), &program(dir.path()), &dir.path().join("run"), limits())
            .await
            .unwrap();
        let stdin = dir.path().join("in");
        fs::write(&stdin, "5\n").await.unwrap();

        for _ in 0..4 {
            let scratch = runner.scratch().await.unwrap();
            runner.run(&scratch, &stdin, &Invocation::default()).await.unwrap();
        }

        assert_eq!(sandbox.reuse_flags(), vec![false, true, false, true]);
    }

    #[tokio::test]
    async fn test_environment_cleared_and_outputs_kept() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(ScriptedSandbox::echo());
        let mut runner = ProgramRunner::create(sandbox, &program(dir.path()), &dir.path().join("run"), limits())
            .await
            .unwrap();
        let stdin = dir.path().join("in");
        fs::write(&stdin, "hello\n").await.unwrap();

        let scratch = runner.scratch().await.unwrap();
        let outcome = runner.run(&scratch, &stdin, &Invocation::default()).await.unwrap();

        assert_eq!(fs::read_to_string(&outcome.stdout).await.unwrap(), "hello\n");
        assert!(!runner.linked_path(env::INPUT).exists());
        assert_eq!(outcome.failure_verdict(), None);
    }

    #[tokio::test]
    async fn test_environment_cleared_on_sandbox_error() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(ScriptedSandbox::failing());
        let mut runner = ProgramRunner::create(sandbox, &program(dir.path()), &dir.path().join("run"), limits())
            .await
            .unwrap();
        let stdin = dir.path().join("in");
        fs::write(&stdin, "x").await.unwrap();

        let scratch = runner.scratch().await.unwrap();
        assert!(runner.run(&scratch, &stdin, &Invocation::default()).await.is_err());
        assert!(!runner.linked_path(env::INPUT).exists());
    }

    #[test]
    fn test_failure_verdicts() {
        let outcome = |termination| RunOutcome {
            execution: Execution {
                termination,
                time_usage_ms: 0,
                memory_usage_kb: 0,
            },
            stdout: PathBuf::new(),
            stderr: PathBuf::new(),
        };
        assert_eq!(outcome(Termination::Exited(1)).failure_verdict(), Some(Verdict::RunTimeError));
        assert_eq!(outcome(Termination::Signaled(11)).failure_verdict(), Some(Verdict::RunTimeError));
        assert_eq!(
            outcome(Termination::ResourceExceeded(ResourceKind::CpuTime)).failure_verdict(),
            Some(Verdict::TimeLimitExceeded)
        );
        assert_eq!(
            outcome(Termination::ResourceExceeded(ResourceKind::Memory)).failure_verdict(),
            Some(Verdict::RunTimeError)
        );
    }
}
