//! Configuration types for batch processing.
//!
//! Two independent pieces of configuration drive a batch:
//!
//! * [`ModelConfig`] — *which* model answers: a local runtime, an
//!   OpenAI-compatible HTTP endpoint, or a named `edgequake-llm` provider.
//!   It is a closed enum so a half-filled backend description (an API URL
//!   without a key, a local backend without a model path) cannot be
//!   represented once [`ModelConfig::validate`] has passed.
//!
//! * [`BatchConfig`] — *how* the batch runs: concurrency, page limit,
//!   timeouts, retries, generation parameters. Built via
//!   [`BatchConfigBuilder`] so callers set only what they care about.
//!
//! [`Presets`] is the typed view of a saved-presets JSON document; every
//! model preset is validated when the document is loaded, not when a batch
//! first tries to use it.

use crate::error::BatchError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ── Generation parameters ────────────────────────────────────────────────

/// Sampling parameters forwarded to every model invocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Maximum tokens the model may generate per page. Default: 1024.
    pub max_tokens: usize,
    /// Sampling temperature. Default: 0.0.
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.0,
        }
    }
}

// ── Batch configuration ──────────────────────────────────────────────────

/// Configuration for one batch invocation.
///
/// # Example
/// ```rust
/// use docbatch::BatchConfig;
///
/// let config = BatchConfig::builder()
///     .batch_size(4)
///     .max_pages(20)
///     .temperature(0.2)
///     .build()
///     .unwrap();
/// assert_eq!(config.batch_size, 4);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    /// Number of files processed at once, and the size of the worker pool
    /// that bounds concurrent page invocations. Default: 5.
    pub batch_size: usize,

    /// Maximum pages extracted from one PDF. Further pages are dropped and
    /// reported as truncation. Default: 10.
    pub max_pages: usize,

    /// Sampling parameters for every page.
    pub generation: GenerationParams,

    /// Per-request timeout for the remote backend, in seconds. Default: 120.
    pub request_timeout_secs: u64,

    /// Per-generation timeout for the local backend, in seconds. Default: 300.
    ///
    /// Time spent waiting for the model gate does not count.
    pub local_timeout_secs: u64,

    /// Wall-clock budget for one job, in seconds. Pages still outstanding
    /// when it expires are recorded as timeouts. `None` disables the
    /// deadline. Default: 1800.
    pub job_timeout_secs: Option<u64>,

    /// Retries for retryable remote failures (timeouts, transport errors).
    /// Default: 2.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled after each attempt.
    /// Default: 500.
    pub retry_backoff_ms: u64,

    /// Longest edge of a rasterised PDF page, in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// Password for encrypted PDFs.
    pub password: Option<String>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_pages: 10,
            generation: GenerationParams::default(),
            request_timeout_secs: 120,
            local_timeout_secs: 300,
            job_timeout_secs: Some(1800),
            max_retries: 2,
            retry_backoff_ms: 500,
            max_rendered_pixels: 2000,
            password: None,
            download_timeout_secs: 120,
        }
    }
}

impl BatchConfig {
    /// Create a new builder for `BatchConfig`.
    pub fn builder() -> BatchConfigBuilder {
        BatchConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn local_timeout(&self) -> Duration {
        Duration::from_secs(self.local_timeout_secs)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }
}

/// Builder for [`BatchConfig`].
#[derive(Debug)]
pub struct BatchConfigBuilder {
    config: BatchConfig,
}

impl BatchConfigBuilder {
    pub fn batch_size(mut self, n: usize) -> Self {
        self.config.batch_size = n.clamp(1, 64);
        self
    }

    pub fn max_pages(mut self, n: usize) -> Self {
        self.config.max_pages = n.max(1);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.generation.max_tokens = n;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.generation.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn local_timeout_secs(mut self, secs: u64) -> Self {
        self.config.local_timeout_secs = secs;
        self
    }

    /// Set the per-job deadline; `None` disables it.
    pub fn job_timeout_secs(mut self, secs: Option<u64>) -> Self {
        self.config.job_timeout_secs = secs;
        self
    }

    /// Retries per page, capped at 10.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n.min(10);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<BatchConfig, BatchError> {
        let c = &self.config;
        if c.batch_size == 0 {
            return Err(BatchError::InvalidConfig("batch_size must be ≥ 1".into()));
        }
        if c.max_pages == 0 {
            return Err(BatchError::InvalidConfig("max_pages must be ≥ 1".into()));
        }
        if c.generation.max_tokens == 0 {
            return Err(BatchError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        if c.request_timeout_secs == 0 || c.local_timeout_secs == 0 {
            return Err(BatchError::InvalidConfig(
                "model timeouts must be at least one second".into(),
            ));
        }
        if c.job_timeout_secs == Some(0) {
            return Err(BatchError::InvalidConfig(
                "job_timeout_secs must be ≥ 1 (use None to disable)".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Model configuration ──────────────────────────────────────────────────

/// Which model answers the page requests.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum ModelConfig {
    /// A model loaded by a local runtime (`mlx_vlm`). One resident instance
    /// per model path; invocations are serialised.
    Local {
        model_path: String,
        /// Python executable that hosts the runtime. Falls back to
        /// `$VLM_PYTHON`, then `python`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        python: Option<String>,
    },
    /// Any OpenAI-compatible chat-completions endpoint.
    Api {
        base_url: String,
        api_key: String,
        model_name: String,
    },
    /// A provider known to `edgequake-llm` (`openai`, `anthropic`,
    /// `gemini`, `ollama`, ...); credentials come from the environment.
    Provider { provider: String, model: String },
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelConfig::Local { model_path, python } => f
                .debug_struct("Local")
                .field("model_path", model_path)
                .field("python", python)
                .finish(),
            ModelConfig::Api {
                base_url,
                model_name,
                ..
            } => f
                .debug_struct("Api")
                .field("base_url", base_url)
                .field("api_key", &"<redacted>")
                .field("model_name", model_name)
                .finish(),
            ModelConfig::Provider { provider, model } => f
                .debug_struct("Provider")
                .field("provider", provider)
                .field("model", model)
                .finish(),
        }
    }
}

impl ModelConfig {
    /// Pick a backend from loosely filled form fields.
    ///
    /// The API backend is chosen only when URL, key and model name are all
    /// non-empty; otherwise the local model path is used.
    pub fn select(
        model_path: &str,
        base_url: &str,
        api_key: &str,
        model_name: &str,
    ) -> Result<Self, BatchError> {
        let config = if [base_url, api_key, model_name]
            .iter()
            .all(|s| !s.trim().is_empty())
        {
            ModelConfig::Api {
                base_url: base_url.trim().to_string(),
                api_key: api_key.trim().to_string(),
                model_name: model_name.trim().to_string(),
            }
        } else {
            ModelConfig::Local {
                model_path: model_path.trim().to_string(),
                python: None,
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON model description.
    pub fn from_json(json: &str) -> Result<Self, BatchError> {
        let config: ModelConfig = serde_json::from_str(json)
            .map_err(|e| BatchError::InvalidConfig(format!("model config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every field the backend needs is present and well-formed.
    pub fn validate(&self) -> Result<(), BatchError> {
        match self {
            ModelConfig::Local { model_path, python } => {
                if model_path.trim().is_empty() {
                    return Err(BatchError::InvalidConfig(
                        "local backend requires a model path".into(),
                    ));
                }
                if python.as_deref().is_some_and(|p| p.trim().is_empty()) {
                    return Err(BatchError::InvalidConfig(
                        "python executable must not be empty".into(),
                    ));
                }
            }
            ModelConfig::Api {
                base_url,
                api_key,
                model_name,
            } => {
                if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
                    return Err(BatchError::InvalidConfig(format!(
                        "api base_url must be an http(s) URL, got '{base_url}'"
                    )));
                }
                if api_key.trim().is_empty() {
                    return Err(BatchError::InvalidConfig("api backend requires an api_key".into()));
                }
                if model_name.trim().is_empty() {
                    return Err(BatchError::InvalidConfig(
                        "api backend requires a model_name".into(),
                    ));
                }
            }
            ModelConfig::Provider { provider, model } => {
                if provider.trim().is_empty() || model.trim().is_empty() {
                    return Err(BatchError::InvalidConfig(
                        "provider backend requires both provider and model".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Short backend label used in logs and history.
    pub fn label(&self) -> String {
        match self {
            ModelConfig::Local { model_path, .. } => format!("local:{model_path}"),
            ModelConfig::Api { model_name, .. } => format!("api:{model_name}"),
            ModelConfig::Provider { provider, model } => format!("{provider}:{model}"),
        }
    }
}

// ── Presets ──────────────────────────────────────────────────────────────

/// A named, validated model configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPreset {
    pub id: String,
    pub name: String,
    pub config: ModelConfig,
}

/// A named custom prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptPreset {
    pub id: String,
    pub name: String,
    pub content: String,
}

/// Saved model and prompt presets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Presets {
    pub models: Vec<ModelPreset>,
    pub prompts: Vec<PromptPreset>,
}

#[derive(Deserialize)]
struct RawPresets {
    #[serde(default)]
    models: Vec<RawModelPreset>,
    #[serde(default)]
    prompts: Vec<PromptPreset>,
}

#[derive(Deserialize)]
struct RawModelPreset {
    id: String,
    name: String,
    #[serde(default)]
    model_type: String,
    #[serde(default)]
    model_path: String,
    #[serde(default)]
    base_url: String,
    #[serde(default)]
    api_key: String,
    #[serde(default)]
    model_name: String,
}

impl RawModelPreset {
    fn into_preset(self) -> Result<ModelPreset, BatchError> {
        let config = match self.model_type.as_str() {
            "api" => ModelConfig::Api {
                base_url: self.base_url,
                api_key: self.api_key,
                model_name: self.model_name,
            },
            "local" | "" => ModelConfig::Local {
                model_path: self.model_path,
                python: None,
            },
            other => {
                return Err(BatchError::InvalidConfig(format!(
                    "preset '{}': unknown model_type '{other}'",
                    self.name
                )))
            }
        };
        config
            .validate()
            .map_err(|e| BatchError::InvalidConfig(format!("preset '{}': {e}", self.name)))?;
        Ok(ModelPreset {
            id: self.id,
            name: self.name,
            config,
        })
    }
}

impl Presets {
    /// Parse a presets document, validating every model preset.
    pub fn from_json(json: &str) -> Result<Self, BatchError> {
        let raw: RawPresets = serde_json::from_str(json)
            .map_err(|e| BatchError::InvalidConfig(format!("presets: {e}")))?;
        let models = raw
            .models
            .into_iter()
            .map(RawModelPreset::into_preset)
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(p) = raw.prompts.iter().find(|p| p.content.trim().is_empty()) {
            return Err(BatchError::InvalidConfig(format!(
                "prompt preset '{}' has no content",
                p.name
            )));
        }
        Ok(Self {
            models,
            prompts: raw.prompts,
        })
    }

    /// Find a model preset by id or name.
    pub fn model(&self, key: &str) -> Option<&ModelPreset> {
        self.models.iter().find(|m| m.id == key || m.name == key)
    }

    /// Find a prompt preset by id or name.
    pub fn prompt(&self, key: &str) -> Option<&PromptPreset> {
        self.prompts.iter().find(|p| p.id == key || p.name == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = BatchConfig::default();
        assert_eq!(c.batch_size, 5);
        assert_eq!(c.max_pages, 10);
        assert_eq!(c.generation.max_tokens, 1024);
        assert_eq!(c.generation.temperature, 0.0);
        assert_eq!(c.job_timeout(), Some(Duration::from_secs(1800)));
    }

    #[test]
    fn builder_clamps() {
        let c = BatchConfig::builder()
            .batch_size(0)
            .max_pages(0)
            .temperature(9.0)
            .max_retries(1_000)
            .build()
            .unwrap();
        assert_eq!(c.batch_size, 1);
        assert_eq!(c.max_pages, 1);
        assert_eq!(c.generation.temperature, 2.0);
        assert_eq!(c.max_retries, 10);
    }

    #[test]
    fn builder_rejects_zero_job_timeout() {
        let err = BatchConfig::builder()
            .job_timeout_secs(Some(0))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("job_timeout_secs"));
    }

    #[test]
    fn select_prefers_api_when_complete() {
        let c = ModelConfig::select("/models/qwen", "https://api.example.org/v1", "sk-1", "qwen-vl")
            .unwrap();
        assert!(matches!(c, ModelConfig::Api { .. }));

        let c = ModelConfig::select("/models/qwen", "https://api.example.org/v1", "", "qwen-vl")
            .unwrap();
        assert!(matches!(c, ModelConfig::Local { .. }));
    }

    #[test]
    fn select_rejects_empty_local_path() {
        assert!(ModelConfig::select("", "", "", "").is_err());
    }

    #[test]
    fn api_config_requires_http_url() {
        let c = ModelConfig::Api {
            base_url: "ftp://host".into(),
            api_key: "k".into(),
            model_name: "m".into(),
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn debug_redacts_api_key() {
        let c = ModelConfig::Api {
            base_url: "https://host/v1".into(),
            api_key: "sk-secret".into(),
            model_name: "m".into(),
        };
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn model_config_from_tagged_json() {
        let c = ModelConfig::from_json(r#"{"backend":"local","model_path":"/m/qwen"}"#).unwrap();
        assert_eq!(
            c,
            ModelConfig::Local {
                model_path: "/m/qwen".into(),
                python: None
            }
        );
        assert!(ModelConfig::from_json(r#"{"backend":"api","base_url":"https://h"}"#).is_err());
    }

    #[test]
    fn presets_validate_at_load_time() {
        let good = r#"{
            "models": [
                {"id": "a", "name": "qwen local", "model_type": "local", "model_path": "/m/qwen", "created_at": "x"},
                {"id": "b", "name": "remote", "model_type": "api", "base_url": "https://h/v1", "api_key": "k", "model_name": "vl"}
            ],
            "prompts": [{"id": "p", "name": "receipts", "content": "Extract totals."}]
        }"#;
        let presets = Presets::from_json(good).unwrap();
        assert_eq!(presets.models.len(), 2);
        assert!(matches!(presets.model("remote").unwrap().config, ModelConfig::Api { .. }));
        assert_eq!(presets.prompt("p").unwrap().content, "Extract totals.");

        let bad = r#"{"models": [{"id": "c", "name": "broken", "model_type": "api", "base_url": "https://h"}]}"#;
        let err = Presets::from_json(bad).unwrap_err();
        assert!(err.to_string().contains("broken"), "got: {err}");
    }

    #[test]
    fn presets_reject_unknown_model_type() {
        let json = r#"{"models": [{"id": "c", "name": "x", "model_type": "grpc"}]}"#;
        assert!(Presets::from_json(json).is_err());
    }
}
