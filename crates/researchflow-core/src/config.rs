//! Runtime configuration.
//!
//! Layered as: built-in defaults, then an optional YAML file (with
//! `${VAR}` / `${VAR:-default}` substitution), then environment variables.
//!
//! ```yaml
//! database_url: "sqlite://${HOME}/researchflow/app.db"
//! cohort_backend: viewdef
//! view_cache_ttl_secs: 600
//! llm:
//!   primary:
//!     baseUrl: "https://api.anthropic.com"
//!     apiKey: "${ANTHROPIC_API_KEY}"
//!     model: "claude-sonnet-4-5"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agents::RetryPolicy;
use crate::cohort::CohortBackend;
use crate::error::ServerError;
use crate::llm::{anthropic, LlmProviderConfig};

pub const DEFAULT_DATABASE_URL: &str = "researchflow.db";
pub const DEFAULT_VIEW_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_LLM_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        ServerError::Internal(e.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Anthropic Messages API; required for critical tasks.
    pub primary: Option<LlmProviderConfig>,
    /// OpenAI-compatible endpoint for drafting.
    pub secondary: Option<LlmProviderConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            base_delay_ms: policy.base_delay.as_millis() as u64,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    /// Research data warehouse; the application database when unset.
    pub warehouse_database_url: Option<String>,
    pub llm: LlmConfig,
    /// External FHIR server for views; the warehouse is used when unset.
    pub fhir_base_url: Option<String>,
    pub viewdef_dir: PathBuf,
    pub delivery_dir: PathBuf,
    pub view_cache_ttl_secs: u64,
    pub cohort_backend: CohortBackend,
    /// Optional YAML transition table layered over the built-in one.
    pub workflow_file: Option<String>,
    pub retry: RetryConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            warehouse_database_url: None,
            llm: LlmConfig::default(),
            fhir_base_url: None,
            viewdef_dir: data_dir.join("views"),
            delivery_dir: data_dir.join("deliveries"),
            view_cache_ttl_secs: DEFAULT_VIEW_CACHE_TTL_SECS,
            cohort_backend: CohortBackend::default(),
            workflow_file: None,
            retry: RetryConfig::default(),
        }
    }
}

/// `<local data dir>/researchflow`, or `./.researchflow` when the platform
/// has none.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("researchflow"))
        .unwrap_or_else(|| PathBuf::from(".researchflow"))
}

impl AppConfig {
    /// Defaults (or `path`), then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let resolved = resolve_env_vars(yaml);
        serde_yaml::from_str(&resolved).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Override fields from environment variables looked up through `var`.
    pub fn apply_env<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = var("DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(url) = var("WAREHOUSE_DATABASE_URL") {
            self.warehouse_database_url = Some(url);
        }
        if let Some(url) = var("FHIR_BASE_URL") {
            self.fhir_base_url = Some(url);
        }
        if let Some(dir) = var("VIEWDEF_DIR") {
            self.viewdef_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("DELIVERY_DIR") {
            self.delivery_dir = PathBuf::from(dir);
        }
        if let Some(file) = var("WORKFLOW_FILE") {
            self.workflow_file = Some(file);
        }
        if let Some(ttl) = var("VIEW_CACHE_TTL_SECS") {
            self.view_cache_ttl_secs = ttl.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "VIEW_CACHE_TTL_SECS".to_string(),
                value: ttl.clone(),
            })?;
        }
        if let Some(backend) = var("COHORT_BACKEND") {
            self.cohort_backend =
                CohortBackend::from_str(&backend).ok_or_else(|| ConfigError::Invalid {
                    key: "COHORT_BACKEND".to_string(),
                    value: backend.clone(),
                })?;
        }

        let anthropic_key = var("ANTHROPIC_API_KEY").or_else(|| var("ANTHROPIC_AUTH_TOKEN"));
        if let Some(api_key) = anthropic_key {
            let existing = self.llm.primary.take();
            self.llm.primary = Some(LlmProviderConfig {
                base_url: var("ANTHROPIC_BASE_URL")
                    .or_else(|| existing.as_ref().map(|c| c.base_url.clone()))
                    .unwrap_or_else(|| anthropic::DEFAULT_BASE_URL.to_string()),
                api_key,
                model: var("ANTHROPIC_MODEL")
                    .or_else(|| existing.as_ref().map(|c| c.model.clone()))
                    .unwrap_or_else(|| anthropic::DEFAULT_MODEL.to_string()),
                temperature: existing.as_ref().and_then(|c| c.temperature),
                timeout_secs: existing
                    .as_ref()
                    .map(|c| c.timeout_secs)
                    .unwrap_or(DEFAULT_LLM_TIMEOUT_SECS),
            });
        }

        if let (Some(base_url), Some(model)) = (var("SECONDARY_LLM_BASE_URL"), var("SECONDARY_LLM_MODEL")) {
            self.llm.secondary = Some(LlmProviderConfig {
                base_url,
                api_key: var("SECONDARY_LLM_API_KEY").unwrap_or_default(),
                model,
                temperature: None,
                timeout_secs: DEFAULT_LLM_TIMEOUT_SECS,
            });
        }
        Ok(())
    }

    pub fn view_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.view_cache_ttl_secs)
    }

    pub fn warehouse_url(&self) -> &str {
        self.warehouse_database_url
            .as_deref()
            .unwrap_or(&self.database_url)
    }

    /// Whether the warehouse lives in the application database.
    pub fn shared_warehouse(&self) -> bool {
        self.warehouse_database_url
            .as_deref()
            .map_or(true, |url| url == self.database_url)
    }
}

static ENV_VAR: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
    regex::Regex::new(r"\$\{([^}]+)\}").expect("Invalid regex pattern for env references")
});

/// Replace `${VAR}` with the variable's value and `${VAR:-default}` with the
/// value or the default. Unset variables without a default are left as is.
pub fn resolve_env_vars(input: &str) -> String {
    ENV_VAR.replace_all(input, |caps: &regex::Captures| {
        let expr = &caps[1];
        match expr.split_once(":-") {
            Some((name, default)) => std::env::var(name).unwrap_or_else(|_| default.to_string()),
            None => std::env::var(expr).unwrap_or_else(|_| format!("${{{}}}", expr)),
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("RESEARCHFLOW_TEST_VAR", "hello");
        assert_eq!(resolve_env_vars("${RESEARCHFLOW_TEST_VAR}"), "hello");
        assert_eq!(
            resolve_env_vars("pre-${RESEARCHFLOW_TEST_VAR}-post"),
            "pre-hello-post"
        );
        assert_eq!(resolve_env_vars("${RESEARCHFLOW_UNSET_VAR:-fallback}"), "fallback");
        assert_eq!(resolve_env_vars("${RESEARCHFLOW_UNSET_VAR}"), "${RESEARCHFLOW_UNSET_VAR}");
        std::env::remove_var("RESEARCHFLOW_TEST_VAR");
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.cohort_backend, CohortBackend::Sql);
        assert!(config.shared_warehouse());
        assert_eq!(config.retry.policy().max_retries, 3);
    }

    #[test]
    fn test_yaml_then_env() {
        let mut config = AppConfig::from_yaml(
            r#"
database_url: "sqlite::memory:"
cohort_backend: viewdef
view_cache_ttl_secs: 60
retry:
  max_retries: 1
  base_delay_ms: 10
"#,
        )
        .unwrap();
        assert_eq!(config.cohort_backend, CohortBackend::Viewdef);
        assert_eq!(config.view_cache_ttl(), Duration::from_secs(60));

        config
            .apply_env(env(&[
                ("COHORT_BACKEND", "sql"),
                ("ANTHROPIC_API_KEY", "sk-test"),
                ("SECONDARY_LLM_BASE_URL", "http://localhost:11434/v1"),
                ("SECONDARY_LLM_MODEL", "llama3"),
                ("WAREHOUSE_DATABASE_URL", "sqlite://warehouse.db"),
            ]))
            .unwrap();
        assert_eq!(config.cohort_backend, CohortBackend::Sql);
        let primary = config.llm.primary.as_ref().unwrap();
        assert_eq!(primary.api_key, "sk-test");
        assert_eq!(primary.model, anthropic::DEFAULT_MODEL);
        assert_eq!(config.llm.secondary.as_ref().unwrap().model, "llama3");
        assert_eq!(config.warehouse_url(), "sqlite://warehouse.db");
        assert!(!config.shared_warehouse());
        assert_eq!(config.retry.policy().base_delay, Duration::from_millis(10));
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env(env(&[("COHORT_BACKEND", "graphql")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
