/// Language Registry - Compile and Run Capabilities
///
/// Built once at start-up from the language table and shared by `Arc`.
/// Compilation runs inside the language's image through the same sandbox
/// as judging, with the program directory mounted writable.
use crate::config::{LanguageConfig, LanguageConfigManager};
use crate::engine::{ExecRequest, ResourceLimits, Sandbox, SandboxProvider, Termination};
use crate::error::{JudgeError, JudgeResult};
use base64::{engine::general_purpose, Engine as _};
use gavel_common::types::ProgramSource;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

const COMPILE_DIR: &str = ".compile";
const MAX_DIAGNOSTICS_BYTES: usize = 64 * 1024;

const COMPILE_LIMITS: ResourceLimits = ResourceLimits {
    cpu_time_ms: 30_000,
    wall_time_ms: 60_000,
    memory_kb: 2 * 1024 * 1024,
    max_processes: 64,
};

/// A program ready to run. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledProgram {
    pub root: PathBuf,
    pub language: String,
    pub image: String,
    /// Source files relative to `root`, sorted.
    pub sources: Vec<String>,
    /// Run argv relative to `root`, placeholders already expanded.
    pub run: Vec<String>,
}

impl CompiledProgram {
    pub fn run_command(&self) -> JudgeResult<(String, Vec<String>)> {
        let (command, args) = self
            .run
            .split_first()
            .ok_or_else(|| JudgeError::Plan(format!("language {} has no run command", self.language)))?;
        Ok((command.clone(), args.to_vec()))
    }
}

/// Entry file: `main.*` when present, otherwise the first source.
fn main_source(sources: &[String]) -> Option<&String> {
    sources
        .iter()
        .find(|s| Path::new(s).file_stem().is_some_and(|stem| stem == "main" || stem == "Main"))
        .or_else(|| sources.first())
}

fn expand(template: &[String], sources: &[String]) -> Vec<String> {
    let mut argv = Vec::with_capacity(template.len());
    for part in template {
        match part.as_str() {
            "{sources}" => argv.extend(sources.iter().cloned()),
            "{main}" => argv.extend(main_source(sources).cloned()),
            _ => argv.push(part.clone()),
        }
    }
    argv
}

/// Source paths must stay inside the program directory.
fn safe_relative(name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    let normal = path.components().all(|c| matches!(c, Component::Normal(_)));
    (normal && !name.is_empty()).then(|| path.to_path_buf())
}

pub struct LanguageRegistry {
    configs: LanguageConfigManager,
    provider: Arc<dyn SandboxProvider>,
}

impl LanguageRegistry {
    pub fn new(configs: LanguageConfigManager, provider: Arc<dyn SandboxProvider>) -> Self {
        Self { configs, provider }
    }

    pub fn language(&self, name: &str) -> JudgeResult<&LanguageConfig> {
        self.configs
            .get_config(name)
            .ok_or_else(|| JudgeError::UnknownLanguage(name.to_string()))
    }

    /// Open a fresh execution stream for running `program`.
    pub async fn sandbox_for(&self, program: &CompiledProgram) -> JudgeResult<Arc<dyn Sandbox>> {
        self.provider.open(&program.image).await
    }

    /// Write `source` into `output` and compile it there.
    ///
    /// Returns `JudgeError::Compilation` with the compiler diagnostics when
    /// the program does not build; any other error is an infrastructure fault.
    #[tracing::instrument(skip(self, source), fields(language = %source.language))]
    pub async fn compile(&self, source: &ProgramSource, output: &Path) -> JudgeResult<CompiledProgram> {
        let config = self.language(&source.language)?;
        fs::create_dir_all(output).await?;

        let mut sources = Vec::new();
        for (name, encoded) in &source.files {
            let relative = safe_relative(name)
                .ok_or_else(|| JudgeError::Compilation(format!("invalid source file name: {}", name)))?;
            let contents = general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| JudgeError::Compilation(format!("{} is not valid base64: {}", name, e)))?;
            let target = output.join(&relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&target, contents).await?;
            sources.push(name.clone());
        }
        if sources.is_empty() {
            return Err(JudgeError::Compilation("no source files".to_string()));
        }

        let program = CompiledProgram {
            root: output.to_path_buf(),
            language: config.name.clone(),
            image: config.image.clone(),
            run: expand(&config.run, &sources),
            sources,
        };

        let Some(template) = &config.compile else {
            return Ok(program);
        };
        let argv = expand(template, &program.sources);
        let Some((command, args)) = argv.split_first() else {
            return Ok(program);
        };

        let logs = output.join(COMPILE_DIR);
        fs::create_dir_all(&logs).await?;
        let stdin = logs.join("stdin");
        let stdout = logs.join("stdout");
        let stderr = logs.join("stderr");
        fs::write(&stdin, b"").await?;

        let request = ExecRequest {
            command: command.clone(),
            args: args.to_vec(),
            working_dir: output.to_path_buf(),
            stdin,
            stdout: stdout.clone(),
            stderr: stderr.clone(),
            extra_read: vec![],
            extra_write: vec![output.to_path_buf()],
            limits: COMPILE_LIMITS,
            reuse_context: false,
        };
        let sandbox = self.provider.open(&config.image).await?;
        let execution = sandbox.execute(&request).await?;

        if execution.termination == Termination::Exited(0) {
            info!(time_ms = execution.time_usage_ms, "Compilation succeeded");
            return Ok(program);
        }

        let mut diagnostics = fs::read_to_string(&stderr).await.unwrap_or_default();
        diagnostics.push_str(&fs::read_to_string(&stdout).await.unwrap_or_default());
        if let Termination::ResourceExceeded(kind) = execution.termination {
            diagnostics.push_str(&format!("\ncompiler exceeded its {:?} limit", kind));
        }
        truncate(&mut diagnostics, MAX_DIAGNOSTICS_BYTES);
        warn!(
            termination = ?execution.termination,
            error_preview = diagnostics.lines().next().unwrap_or(""),
            "Compilation failed"
        );
        Err(JudgeError::Compilation(diagnostics))
    }
}

fn truncate(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("\n[truncated]");
}
