//! Evaluation pipeline configuration.
//!
//! Loaded from a TOML file, then overridden by `UXEVAL_*` environment
//! variables. Defaults are documented here, not hard-coded into pipeline
//! logic: the orchestrator and call client only ever read this struct.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvalConfig {
    pub tool: ToolConfig,
    pub model: ModelConfig,
    pub auth: AuthConfig,
    pub call: CallConfig,
    pub pipeline: PipelineConfig,
}

/// Rendering tool endpoint (`GET /health`, `POST /tools/call`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub endpoint: String,
    /// Tool name sent in the call envelope.
    pub name: String,
}

/// Model endpoint (Azure OpenAI deployment layout).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub endpoint: String,
    pub deployment: String,
    pub api_version: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            deployment: "gpt-5-mini".to_string(),
            api_version: "2025-01-01-preview".to_string(),
        }
    }
}

/// Exactly one of the two modes must be configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Static shared secret, sent as the `api-key` header.
    pub api_key: Option<String>,
    /// Bearer-token mode: a token provider refreshed ahead of expiry.
    pub bearer: Option<BearerConfig>,
}

/// Token provider for bearer auth. Either a static token (with optional
/// expiry, useful for tests and short scripts) or an external command that
/// prints `{"token": "...", "expires_on": <unix secs>}` on stdout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BearerConfig {
    pub token: Option<String>,
    pub expires_on: Option<i64>,
    pub command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Wall-clock bound per attempt, not per retry sequence.
    pub timeout_ms: u64,
    /// Extra attempts after the first; 3 means up to 4 attempts total.
    pub retries: u32,
    pub retry_base_ms: u64,
    /// JSONL call log destination. `None` disables event logging.
    pub log_path: Option<PathBuf>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retries: 3,
            retry_base_ms: 500,
            log_path: Some(PathBuf::from("logs/calls.log")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub prompts_dir: PathBuf,
    /// Primary record field holding the UI description; the loader falls
    /// back through the standard alternates when absent.
    pub ui_field: String,
    pub empty_tree: EmptyTreePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            prompts_dir: PathBuf::from("prompts"),
            ui_field: "ui_description".to_string(),
            empty_tree: EmptyTreePolicy::Warn,
        }
    }
}

/// What to do when the tool returns an empty container root: record a
/// warning and keep going, or treat it as a protocol failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyTreePolicy {
    #[default]
    Warn,
    Fail,
}

impl EvalConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let mut config = Self::from_toml(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Load(e.to_string()))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("UXEVAL_TOOL_ENDPOINT")
            && !endpoint.is_empty()
        {
            self.tool.endpoint = endpoint;
        }

        if let Ok(endpoint) = std::env::var("UXEVAL_MODEL_ENDPOINT")
            && !endpoint.is_empty()
        {
            self.model.endpoint = endpoint;
        }

        if let Ok(deployment) = std::env::var("UXEVAL_DEPLOYMENT")
            && !deployment.is_empty()
        {
            self.model.deployment = deployment;
        }

        if let Ok(key) = std::env::var("UXEVAL_API_KEY")
            && !key.is_empty()
        {
            self.auth.api_key = Some(key);
        }

        if let Ok(timeout) = std::env::var("UXEVAL_TIMEOUT_MS")
            && let Ok(ms) = timeout.parse::<u64>()
        {
            self.call.timeout_ms = ms;
        }

        if let Ok(retries) = std::env::var("UXEVAL_RETRIES")
            && let Ok(n) = retries.parse::<u32>()
        {
            self.call.retries = n;
        }

        if let Ok(base) = std::env::var("UXEVAL_RETRY_BASE_MS")
            && let Ok(ms) = base.parse::<u64>()
        {
            self.call.retry_base_ms = ms;
        }

        if let Ok(prompts) = std::env::var("UXEVAL_PROMPTS_DIR")
            && !prompts.is_empty()
        {
            self.pipeline.prompts_dir = PathBuf::from(prompts);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tool.endpoint.is_empty() {
            return Err(ConfigError::Missing("tool.endpoint".into()));
        }
        if self.model.endpoint.is_empty() {
            return Err(ConfigError::Missing("model.endpoint".into()));
        }
        match (&self.auth.api_key, &self.auth.bearer) {
            (Some(_), Some(_)) => Err(ConfigError::Invalid(
                "auth.api_key and auth.bearer are mutually exclusive".into(),
            )),
            (None, None) => Err(ConfigError::Missing(
                "auth.api_key or auth.bearer".into(),
            )),
            (None, Some(bearer)) if bearer.token.is_none() && bearer.command.is_none() => Err(
                ConfigError::Invalid("auth.bearer needs a token or a command".into()),
            ),
            _ => Ok(()),
        }
    }

    /// Chat completions URL for the configured deployment.
    pub fn model_url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.model.endpoint.trim_end_matches('/'),
            self.model.deployment,
            self.model.api_version
        )
    }

    pub fn tool_health_url(&self) -> String {
        format!("{}/health", self.tool.endpoint.trim_end_matches('/'))
    }

    pub fn tool_call_url(&self) -> String {
        format!("{}/tools/call", self.tool.endpoint.trim_end_matches('/'))
    }
}
