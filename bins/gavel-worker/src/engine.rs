/// Sandbox Adapter - Resource-Limited Execution
///
/// **Core Responsibility:**
/// Run one command under CPU, wall time, memory and process limits and
/// classify how it terminated.
///
/// **Boundary:**
/// - The sandbox knows nothing about verdicts or expected output
/// - Streams are plain files; the caller decides what they mean
/// - Infrastructure failures are errors, program failures are terminations
///
/// Production uses `DockerSandbox`: one long-lived container per execution
/// stream, with every invocation running as an exec inside it.
use crate::error::{JudgeError, JudgeResult};
use crate::metrics;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions, StatsOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::container::LogOutput;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SIGKILL: i64 = 9;
const SIGXCPU: i64 = 24;

/// Shell prelude run for every invocation. Limits apply to the shell and
/// are inherited by the program; `times` reports the children's CPU usage
/// on the exec's own stdout, which the program never writes to.
const EXEC_SCRIPT: &str = r#"cd "$GAVEL_WORKDIR" || exit 125
ulimit -t "$GAVEL_CPU_SECONDS"
ulimit -v "$GAVEL_MEMORY_KB"
"$@" <"$GAVEL_STDIN" >"$GAVEL_STDOUT" 2>"$GAVEL_STDERR"
status=$?
times
exit $status"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    CpuTime,
    WallTime,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    ResourceExceeded(ResourceKind),
}

impl Termination {
    fn label(&self) -> &'static str {
        match self {
            Termination::Exited(0) => "exited_ok",
            Termination::Exited(_) => "exited_error",
            Termination::Signaled(_) => "signaled",
            Termination::ResourceExceeded(ResourceKind::CpuTime) => "cpu_time",
            Termination::ResourceExceeded(ResourceKind::WallTime) => "wall_time",
            Termination::ResourceExceeded(ResourceKind::Memory) => "memory",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_time_ms: u64,
    pub wall_time_ms: u64,
    pub memory_kb: u64,
    pub max_processes: u32,
}

impl ResourceLimits {
    /// Limits for a submitted program: wall time is twice the CPU time.
    pub fn for_submission(time_limit_ms: u64, memory_kb: u64) -> Self {
        Self {
            cpu_time_ms: time_limit_ms,
            wall_time_ms: time_limit_ms.saturating_mul(2),
            memory_kb,
            max_processes: 10,
        }
    }
}

/// One invocation. Every path is absolute and mounted at the same location
/// inside the sandbox.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub stdin: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub extra_read: Vec<PathBuf>,
    pub extra_write: Vec<PathBuf>,
    pub limits: ResourceLimits,
    /// Keep the execution context from the previous call on this stream.
    pub reuse_context: bool,
}

impl ExecRequest {
    /// Bind specs: write paths first, then read paths, each path once.
    fn binds(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut binds = Vec::new();
        let writes = self.extra_write.iter().map(|p| (p, "rw"));
        let reads = std::iter::once(&self.working_dir)
            .chain(self.extra_read.iter())
            .map(|p| (p, "ro"));
        for (path, mode) in writes.chain(reads) {
            let path = path.display().to_string();
            if seen.insert(path.clone()) {
                binds.push(format!("{}:{}:{}", path, path, mode));
            }
        }
        binds
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Execution {
    pub termination: Termination,
    pub time_usage_ms: i64,
    pub memory_usage_kb: i64,
}

/// A logical execution stream. Calls on one stream are serialized.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(&self, request: &ExecRequest) -> JudgeResult<Execution>;
}

/// Opens execution streams for a runtime image.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn open(&self, image: &str) -> JudgeResult<Arc<dyn Sandbox>>;
}

/// Container cleanup guard - guarantees container removal on drop
/// Dropping the guard force-removes the container, which also kills any
/// exec still running inside it.
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container_id = %self.container_id, "No runtime to remove container");
            return;
        };
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();
        handle.spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to remove container");
            }
        });
    }
}

pub struct DockerProvider {
    docker: Docker,
}

impl DockerProvider {
    pub fn connect() -> JudgeResult<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> JudgeResult<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result?;
        }
        info!(image = %image, "Image pulled");
        Ok(())
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    async fn open(&self, image: &str) -> JudgeResult<Arc<dyn Sandbox>> {
        self.ensure_image(image).await?;
        Ok(Arc::new(DockerSandbox {
            docker: self.docker.clone(),
            image: image.to_string(),
            context: Mutex::new(None),
        }))
    }
}

/// Docker-backed execution stream
///
/// **Container Rules:**
/// - Network disabled, memory and process counts capped at creation
/// - Mounts are fixed at creation, so a call without reuse starts a new container
/// - A wall time kill discards the container; the next call starts fresh
pub struct DockerSandbox {
    docker: Docker,
    image: String,
    context: Mutex<Option<ContainerGuard>>,
}

struct ExecReport {
    exit_code: i64,
    cpu_ms: Option<i64>,
    diagnostics: String,
}

impl DockerSandbox {
    async fn create_context(&self, request: &ExecRequest) -> JudgeResult<ContainerGuard> {
        let container_name = format!("gavel-{}", uuid::Uuid::new_v4());
        let memory_bytes = i64::try_from(request.limits.memory_kb.saturating_mul(1024)).unwrap_or(i64::MAX);

        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            entrypoint: Some(vec![]),
            network_disabled: Some(true),
            working_dir: Some(request.working_dir.display().to_string()),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(memory_bytes),
                memory_swap: Some(memory_bytes),
                pids_limit: Some(request.limits.max_processes as i64 + 1),
                binds: Some(request.binds()),
                readonly_rootfs: Some(true),
                tmpfs: Some(HashMap::from([("/tmp".to_string(), "rw,size=64m".to_string())])),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };
        let container = self.docker.create_container(Some(create_options), config).await?;
        let guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: container.id,
        };

        self.docker
            .start_container(&guard.container_id, None::<StartContainerOptions<String>>)
            .await?;

        debug!(container_id = %guard.container_id, image = %self.image, "Execution context ready");
        Ok(guard)
    }

    async fn run_exec(&self, container_id: &str, request: &ExecRequest) -> JudgeResult<ExecReport> {
        let cpu_seconds = request.limits.cpu_time_ms.div_ceil(1000).saturating_add(1);
        let mut cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            EXEC_SCRIPT.to_string(),
            "gavel-exec".to_string(),
            request.command.clone(),
        ];
        cmd.extend(request.args.iter().cloned());

        let env = vec![
            format!("GAVEL_WORKDIR={}", request.working_dir.display()),
            format!("GAVEL_CPU_SECONDS={}", cpu_seconds),
            format!("GAVEL_MEMORY_KB={}", request.limits.memory_kb),
            format!("GAVEL_STDIN={}", request.stdin.display()),
            format!("GAVEL_STDOUT={}", request.stdout.display()),
            format!("GAVEL_STDERR={}", request.stderr.display()),
        ];

        let exec_config = CreateExecOptions {
            cmd: Some(cmd),
            env: Some(env),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.docker.create_exec(container_id, exec_config).await?;

        let start_config = StartExecOptions {
            detach: false,
            ..Default::default()
        };
        let mut stdout = String::new();
        let mut diagnostics = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, Some(start_config)).await?
        {
            while let Some(msg) = output.next().await {
                match msg? {
                    LogOutput::StdOut { message } => stdout.push_str(&String::from_utf8_lossy(&message)),
                    LogOutput::StdErr { message } => diagnostics.push_str(&String::from_utf8_lossy(&message)),
                    _ => {}
                }
            }
        } else {
            return Err(JudgeError::Sandbox("exec did not attach".to_string()));
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        let exit_code = inspect
            .exit_code
            .ok_or_else(|| JudgeError::Sandbox("exec finished without exit code".to_string()))?;

        Ok(ExecReport {
            exit_code,
            cpu_ms: parse_times(&stdout),
            diagnostics,
        })
    }

    /// Peak memory of the container in KiB, when the daemon reports it.
    async fn peak_memory_kb(&self, container_id: &str) -> Option<i64> {
        let options = Some(StatsOptions {
            stream: false,
            one_shot: true,
        });
        let mut stream = Box::pin(self.docker.stats(container_id, options));
        let stats = stream.next().await?.ok()?;
        let bytes = stats.memory_stats.max_usage.or(stats.memory_stats.usage)?;
        Some((bytes / 1024) as i64)
    }

    async fn oom_killed(&self, container_id: &str) -> bool {
        match self.docker.inspect_container(container_id, None).await {
            Ok(info) => info.state.and_then(|s| s.oom_killed).unwrap_or(false),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    #[tracing::instrument(skip(self, request), fields(image = %self.image, command = %request.command, reuse = request.reuse_context))]
    async fn execute(&self, request: &ExecRequest) -> JudgeResult<Execution> {
        let mut context = self.context.lock().await;
        let guard = match context.take() {
            Some(guard) if request.reuse_context => guard,
            stale => {
                drop(stale);
                self.create_context(request).await?
            }
        };

        let started = Instant::now();
        let wall_limit = Duration::from_millis(request.limits.wall_time_ms);
        let report = match tokio::time::timeout(wall_limit, self.run_exec(&guard.container_id, request)).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                warn!(container_id = %guard.container_id, error = %e, "Exec failed, discarding context");
                return Err(e);
            }
            Err(_) => {
                warn!(
                    container_id = %guard.container_id,
                    wall_time_ms = request.limits.wall_time_ms,
                    "Wall time exceeded, discarding context"
                );
                drop(guard);
                let execution = Execution {
                    termination: Termination::ResourceExceeded(ResourceKind::WallTime),
                    time_usage_ms: request.limits.wall_time_ms as i64,
                    memory_usage_kb: 0,
                };
                metrics::record_execution(execution.termination.label());
                return Ok(execution);
            }
        };

        let cpu_ms = report
            .cpu_ms
            .unwrap_or_else(|| started.elapsed().as_millis() as i64);
        let memory_usage_kb = self.peak_memory_kb(&guard.container_id).await.unwrap_or(0);
        let memory_exceeded = report.exit_code == 128 + SIGKILL
            && (memory_usage_kb >= request.limits.memory_kb as i64 || self.oom_killed(&guard.container_id).await);
        let termination = classify(report.exit_code, cpu_ms, &request.limits, memory_exceeded);

        if !report.diagnostics.is_empty() {
            debug!(diagnostics = %report.diagnostics.trim(), "Sandbox shell output");
        }
        debug!(termination = ?termination, cpu_ms, memory_usage_kb, "Execution finished");
        metrics::record_execution(termination.label());

        *context = Some(guard);
        Ok(Execution {
            termination,
            time_usage_ms: cpu_ms,
            memory_usage_kb,
        })
    }
}

/// Classify a finished exec from the shell's exit status.
fn classify(exit_code: i64, cpu_ms: i64, limits: &ResourceLimits, memory_exceeded: bool) -> Termination {
    if cpu_ms > limits.cpu_time_ms as i64 {
        return Termination::ResourceExceeded(ResourceKind::CpuTime);
    }
    if exit_code > 128 {
        let signal = exit_code - 128;
        if signal == SIGXCPU {
            return Termination::ResourceExceeded(ResourceKind::CpuTime);
        }
        if signal == SIGKILL && memory_exceeded {
            return Termination::ResourceExceeded(ResourceKind::Memory);
        }
        return Termination::Signaled(signal as i32);
    }
    Termination::Exited(exit_code as i32)
}

/// Sum of child user and system time from the output of `times`.
/// The second line holds the children's `user sys` pair, e.g. `0m1.25s 0m0.01s`.
fn parse_times(output: &str) -> Option<i64> {
    let children = output.lines().filter(|l| !l.trim().is_empty()).nth(1)?;
    let mut total = 0.0;
    for field in children.split_whitespace() {
        let (minutes, seconds) = field.split_once('m')?;
        let minutes: f64 = minutes.parse().ok()?;
        let seconds: f64 = seconds.trim_end_matches('s').parse().ok()?;
        total += minutes * 60.0 + seconds;
    }
    Some((total * 1000.0).round() as i64)
}
