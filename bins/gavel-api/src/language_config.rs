// Language configuration management
// Reads the enabled language ids from the worker's languages.json

use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

/// Only the id matters here; images and commands belong to the worker.
#[derive(Debug, Clone, Deserialize)]
struct LanguageEntry {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LanguagesFile {
    languages: Vec<LanguageEntry>,
}

/// Registry of configured languages
/// Submissions in any other language are rejected before they are queued
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    enabled_languages: BTreeSet<String>,
}

impl LanguageRegistry {
    /// Load language configuration from languages.json
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| format!("Failed to read {}: {}", path.as_ref().display(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        let config: LanguagesFile =
            serde_json::from_str(content).map_err(|e| format!("Failed to parse languages.json: {}", e))?;

        let enabled_languages: BTreeSet<String> = config.languages.into_iter().map(|l| l.name).collect();
        if enabled_languages.is_empty() {
            return Err("No languages configured in languages.json".to_string());
        }
        Ok(Self { enabled_languages })
    }

    pub fn is_enabled(&self, language: &str) -> bool {
        self.enabled_languages.contains(language)
    }

    /// Enabled language ids, sorted
    pub fn enabled_languages(&self) -> Vec<String> {
        self.enabled_languages.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_registry() {
        let registry = LanguageRegistry::load_from_file("../../config/languages.json");
        assert!(registry.is_ok());

        if let Ok(reg) = registry {
            assert!(reg.is_enabled("cpp"));
            assert!(reg.is_enabled("python3"));
            assert!(!reg.is_enabled("cobol"));
        }
    }

    #[test]
    fn test_empty_language_file_rejected() {
        assert!(LanguageRegistry::parse(r#"{"languages": []}"#).is_err());
        assert!(LanguageRegistry::parse("not json").is_err());
    }
}
