/// Integration tests for the Docker sandbox
///
/// These tests verify the execution contract against a real daemon:
/// 1. stdin/stdout redirection through bind-mounted files
/// 2. Exit codes are reported as-is
/// 3. CPU and wall time limits are classified correctly
/// 4. Contexts are reused on request and rebuilt after a wall time kill

#[cfg(test)]
mod docker_sandbox_tests {
    use crate::engine::{
        DockerProvider, ExecRequest, ResourceKind, ResourceLimits, Sandbox, SandboxProvider, Termination,
    };
    use std::path::Path;
    use std::sync::Arc;

    const IMAGE: &str = "python:3.12-slim";

    /// Bind mounts must live outside the container's /tmp tmpfs.
    fn workspace() -> tempfile::TempDir {
        tempfile::Builder::new()
            .prefix("gavel-engine-")
            .tempdir_in("/var/tmp")
            .expect("Failed to create workspace")
    }

    async fn sandbox() -> Arc<dyn Sandbox> {
        let provider = DockerProvider::connect().expect("Failed to connect to Docker");
        provider.open(IMAGE).await.expect("Failed to open sandbox")
    }

    fn request(dir: &Path, argv: &[&str], stdin: &str, limits: ResourceLimits, reuse: bool) -> ExecRequest {
        let input = dir.join("input");
        std::fs::write(&input, stdin).unwrap();
        std::fs::write(dir.join("output"), "").unwrap();
        std::fs::write(dir.join("error"), "").unwrap();
        ExecRequest {
            command: argv[0].to_string(),
            args: argv[1..].iter().map(|a| a.to_string()).collect(),
            working_dir: dir.to_path_buf(),
            stdin: input,
            stdout: dir.join("output"),
            stderr: dir.join("error"),
            extra_read: vec![],
            extra_write: vec![dir.to_path_buf()],
            limits,
            reuse_context: reuse,
        }
    }

    fn limits() -> ResourceLimits {
        ResourceLimits::for_submission(2000, 256 * 1024)
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_stdin_to_stdout() {
        let dir = workspace();
        let sandbox = sandbox().await;

        let execution = sandbox
            .execute(&request(dir.path(), &["cat"], "hello judge\n", limits(), false))
            .await
            .expect("Execution failed");

        assert_eq!(execution.termination, Termination::Exited(0));
        assert_eq!(std::fs::read_to_string(dir.path().join("output")).unwrap(), "hello judge\n");
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_exit_code_reported() {
        let dir = workspace();
        let sandbox = sandbox().await;

        let execution = sandbox
            .execute(&request(dir.path(), &["sh", "-c", "echo oops >&2; exit 3"], "", limits(), false))
            .await
            .expect("Execution failed");

        assert_eq!(execution.termination, Termination::Exited(3));
        assert!(std::fs::read_to_string(dir.path().join("error")).unwrap().contains("oops"));
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_cpu_limit() {
        let dir = workspace();
        let sandbox = sandbox().await;
        let limits = ResourceLimits::for_submission(1000, 256 * 1024);

        let execution = sandbox
            .execute(&request(dir.path(), &["python3", "-c", "while True: pass"], "", limits, false))
            .await
            .expect("Execution failed");

        assert!(matches!(
            execution.termination,
            Termination::ResourceExceeded(ResourceKind::CpuTime | ResourceKind::WallTime)
        ));
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_wall_timeout_then_fresh_context() {
        let dir = workspace();
        let sandbox = sandbox().await;
        let limits = ResourceLimits {
            cpu_time_ms: 5000,
            wall_time_ms: 1000,
            memory_kb: 256 * 1024,
            max_processes: 10,
        };

        let execution = sandbox
            .execute(&request(dir.path(), &["sleep", "30"], "", limits, false))
            .await
            .expect("Execution failed");
        assert_eq!(execution.termination, Termination::ResourceExceeded(ResourceKind::WallTime));

        let execution = sandbox
            .execute(&request(dir.path(), &["true"], "", limits, true))
            .await
            .expect("Execution after timeout failed");
        assert_eq!(execution.termination, Termination::Exited(0));
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_context_reused() {
        let dir = workspace();
        let sandbox = sandbox().await;

        let first = sandbox
            .execute(&request(dir.path(), &["touch", "/tmp/marker"], "", limits(), false))
            .await
            .expect("First execution failed");
        assert_eq!(first.termination, Termination::Exited(0));

        let reused = sandbox
            .execute(&request(dir.path(), &["test", "-f", "/tmp/marker"], "", limits(), true))
            .await
            .expect("Reused execution failed");
        assert_eq!(reused.termination, Termination::Exited(0));

        let fresh = sandbox
            .execute(&request(dir.path(), &["test", "-f", "/tmp/marker"], "", limits(), false))
            .await
            .expect("Fresh execution failed");
        assert_eq!(fresh.termination, Termination::Exited(1));
    }
}
