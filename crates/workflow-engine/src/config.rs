//! Engine configuration storage
//!
//! Engine-wide defaults for retry, step timeouts and error policy. Stored
//! as `engine.json` in a caller-chosen directory; a missing file means
//! defaults. Workflow settings override these per run.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::context::DEFAULT_AI_PROVIDERS;
use crate::error::{Result, WorkflowError};
use crate::retry::RetryConfig;

/// File name used by [`EngineConfig::load`] and [`EngineConfig::save`]
pub const CONFIG_FILE_NAME: &str = "engine.json";

/// Environment variable overriding `retry.maxRetries`
pub const ENV_MAX_RETRIES: &str = "WORKFLOW_ENGINE_MAX_RETRIES";
/// Environment variable overriding `retry.backoffMs`
pub const ENV_BACKOFF_MS: &str = "WORKFLOW_ENGINE_BACKOFF_MS";

/// Full engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    /// Step timeout when neither the step nor the workflow sets one;
    /// `None` disables the timeout
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: Option<u64>,
    /// Keep running after a step fails terminally
    #[serde(default)]
    pub continue_on_error: bool,
    /// Upper bound on steps run at once, whatever a workflow asks for
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Provider names that mark an upstream output as an AI response:
    /// an output whose `provider` field is one of these is also handed to
    /// downstream steps as `aiOutput`
    #[serde(default = "default_ai_providers")]
    pub ai_providers: Vec<String>,
}

fn default_timeout_ms() -> Option<u64> {
    Some(300_000)
}

fn default_max_concurrency() -> usize {
    8
}

fn default_ai_providers() -> Vec<String> {
    DEFAULT_AI_PROVIDERS.iter().map(|p| p.to_string()).collect()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            default_timeout_ms: default_timeout_ms(),
            continue_on_error: false,
            max_concurrency: default_max_concurrency(),
            ai_providers: default_ai_providers(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `dir`, falling back to defaults
    pub async fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let config_path = dir.as_ref().join(CONFIG_FILE_NAME);

        if !fs::try_exists(&config_path).await? {
            log::debug!("No engine config at {:?}, using defaults", config_path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&config_path).await?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration into `dir`, creating it if needed
    pub async fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;

        let config_path = dir.join(CONFIG_FILE_NAME);
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(&config_path, contents).await?;

        log::info!("Engine configuration saved to {:?}", config_path);
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(WorkflowError::Config(
                "maxConcurrency must be at least 1".to_string(),
            ));
        }
        if self.default_timeout_ms == Some(0) {
            return Err(WorkflowError::Config(
                "defaultTimeoutMs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `WORKFLOW_ENGINE_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MAX_RETRIES) {
            self.retry.max_retries = parse_override(ENV_MAX_RETRIES, &value)?;
            log::debug!("{} overrides maxRetries to {}", ENV_MAX_RETRIES, self.retry.max_retries);
        }
        if let Some(value) = lookup(ENV_BACKOFF_MS) {
            self.retry.backoff_ms = parse_override(ENV_BACKOFF_MS, &value)?;
            log::debug!("{} overrides backoffMs to {}", ENV_BACKOFF_MS, self.retry.backoff_ms);
        }
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| WorkflowError::Config(format!("{} has invalid value '{}'", key, value)))
}
