// Worker configuration: environment settings and the language table
use anyhow::{bail, Context, Result};
use gavel_common::config::RedisConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_LANGUAGES_PATH: &str = "config/languages.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub image: String,
    /// Compiler argv. `{sources}` expands to every source file and `{main}`
    /// to the entry file. Interpreted languages leave it out.
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    /// Run argv relative to the program root, with the same placeholders.
    pub run: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<String, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson =
            serde_json::from_str(content).context("Failed to parse language configuration")?;

        let mut configs = HashMap::new();
        for lang in languages_json.languages {
            if lang.run.is_empty() {
                bail!("Language {} has an empty run command", lang.name);
            }
            configs.insert(lang.name.clone(), lang);
        }

        Ok(Self { configs })
    }

    pub fn get_config(&self, language: &str) -> Option<&LanguageConfig> {
        self.configs.get(language)
    }

    /// List all supported languages
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Settings read from the environment at start-up.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis: RedisConfig,
    pub workers: usize,
    pub eval_slots: usize,
    /// Scratch space for per-run working directories.
    pub root: PathBuf,
    /// Content-addressed cache of test data.
    pub cache_dir: PathBuf,
    pub languages_path: PathBuf,
    pub metrics_addr: String,
    /// Judge every case even after a group rejects.
    pub evaluate_all: bool,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let workers: usize = env_or("GAVEL_WORKERS", &DEFAULT_WORKERS.to_string())
            .parse()
            .context("GAVEL_WORKERS must be a positive integer")?;
        if workers == 0 {
            bail!("GAVEL_WORKERS must be at least 1");
        }
        let eval_slots: usize = env_or("GAVEL_EVAL_SLOTS", &workers.to_string())
            .parse()
            .context("GAVEL_EVAL_SLOTS must be a positive integer")?;
        if eval_slots == 0 {
            bail!("GAVEL_EVAL_SLOTS must be at least 1");
        }
        let evaluate_all = matches!(
            env_or("GAVEL_EVALUATE_ALL", "false").to_lowercase().as_str(),
            "1" | "true" | "yes"
        );

        Ok(Self {
            redis: RedisConfig::from_env(),
            workers,
            eval_slots,
            root: PathBuf::from(env_or("GAVEL_ROOT", "/var/lib/gavel/runs")),
            cache_dir: PathBuf::from(env_or("GAVEL_CACHE_DIR", "/var/lib/gavel/cache")),
            languages_path: PathBuf::from(env_or("GAVEL_LANGUAGES", DEFAULT_LANGUAGES_PATH)),
            metrics_addr: env_or("GAVEL_METRICS_ADDR", "0.0.0.0:9100"),
            evaluate_all,
        })
    }
}
