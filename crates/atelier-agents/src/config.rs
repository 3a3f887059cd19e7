//! Pipeline configuration.
//!
//! Everything is environment-driven with defaults; a TOML file can overlay
//! the environment via [`PipelineConfig::from_toml_file`]. Only LLM
//! credentials are required to reach a real provider.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use conformance::SandboxConfig;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// One OpenAI-spec inference endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmEndpoint {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl LlmEndpoint {
    fn from_env(model_var: &str, default_model: &str) -> Self {
        Self {
            base_url: env_or("ATELIER_LLM_BASE_URL", "https://api.openai.com/v1"),
            api_key: env_or("ATELIER_LLM_API_KEY", ""),
            model: env_or(model_var, default_model),
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Model for requirements and architecture (structured output).
    pub structured: LlmEndpoint,
    /// Model for the reviewer.
    pub reviewer: LlmEndpoint,
    /// Model for the implementer (plan, files, patches).
    pub implementer: LlmEndpoint,
    /// Review loop cap.
    pub max_review_passes: u32,
    /// Minimum security score the review gate accepts.
    pub trust_threshold: u8,
    /// Targeted repair pass budget.
    pub repair_max_iterations: u32,
    /// Broader-scope repair pass budget after targeted passes exhaust.
    pub repair_escalation_iterations: u32,
    /// Root for run records and offloaded bundles.
    pub store_root: PathBuf,
    /// Per-request LLM timeout.
    pub llm_timeout: Duration,
    /// Sandbox harness configuration.
    pub sandbox: SandboxConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            structured: LlmEndpoint::from_env("ATELIER_MODEL_STRUCTURED", "gpt-4o-mini"),
            reviewer: LlmEndpoint::from_env("ATELIER_MODEL_REVIEWER", "gpt-4o-mini"),
            implementer: LlmEndpoint::from_env("ATELIER_MODEL_IMPLEMENTER", "gpt-4o-mini"),
            max_review_passes: env_parse("ATELIER_MAX_REVIEW_PASSES", 3),
            trust_threshold: env_parse("ATELIER_TRUST_THRESHOLD", 7),
            repair_max_iterations: env_parse("ATELIER_REPAIR_MAX_ITERATIONS", 3),
            repair_escalation_iterations: env_parse("ATELIER_REPAIR_ESCALATION_ITERATIONS", 2),
            store_root: PathBuf::from(env_or("ATELIER_STORE_ROOT", ".atelier_data")),
            llm_timeout: Duration::from_secs(env_parse("ATELIER_LLM_TIMEOUT_SECS", 180)),
            sandbox: SandboxConfig::default(),
        }
    }
}

/// Optional TOML overlay; every field falls back to the env-driven default.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    structured: Option<LlmEndpoint>,
    reviewer: Option<LlmEndpoint>,
    implementer: Option<LlmEndpoint>,
    max_review_passes: Option<u32>,
    trust_threshold: Option<u8>,
    repair_max_iterations: Option<u32>,
    repair_escalation_iterations: Option<u32>,
    store_root: Option<PathBuf>,
}

impl PipelineConfig {
    /// Load a TOML configuration file over the environment defaults.
    pub fn from_toml_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let overlay: ConfigFile = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;

        let mut config = Self::default();
        if let Some(structured) = overlay.structured {
            config.structured = structured;
        }
        if let Some(reviewer) = overlay.reviewer {
            config.reviewer = reviewer;
        }
        if let Some(implementer) = overlay.implementer {
            config.implementer = implementer;
        }
        if let Some(value) = overlay.max_review_passes {
            config.max_review_passes = value;
        }
        if let Some(value) = overlay.trust_threshold {
            config.trust_threshold = value;
        }
        if let Some(value) = overlay.repair_max_iterations {
            config.repair_max_iterations = value;
        }
        if let Some(value) = overlay.repair_escalation_iterations {
            config.repair_escalation_iterations = value;
        }
        if let Some(value) = overlay.store_root {
            config.store_root = value;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_budgets() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_review_passes, 3);
        assert_eq!(config.trust_threshold, 7);
        assert_eq!(config.repair_max_iterations, 3);
        assert_eq!(config.repair_escalation_iterations, 2);
    }

    #[test]
    fn test_toml_overlay() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "max_review_passes = 5\ntrust_threshold = 8\n\n\
             [implementer]\nbase_url = \"http://localhost:8080/v1\"\n\
             api_key = \"not-needed\"\nmodel = \"local-coder\"\n"
        )
        .unwrap();

        let config = PipelineConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.max_review_passes, 5);
        assert_eq!(config.trust_threshold, 8);
        assert_eq!(config.implementer.model, "local-coder");
        // Untouched fields keep their defaults.
        assert_eq!(config.repair_max_iterations, 3);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(PipelineConfig::from_toml_file(std::path::Path::new("/nope/missing.toml")).is_err());
    }
}
