//! Model backend adapter: one request/response contract over two very
//! different ways of running a vision model.
//!
//! | Variant | Runs | Concurrency |
//! |---------|------|-------------|
//! | [`ModelBackend::Local`]  | a single resident model in a local runtime | 1, every call queues on one gate |
//! | [`ModelBackend::Remote`] | an HTTP endpoint or `edgequake-llm` provider | whatever the scheduler allows |
//!
//! [`ModelBackend::invoke`] never returns `Err` and never panics on bad model
//! output: every failure comes back as [`ModelOutcome::Failure`] with a
//! [`FailureKind`], so one bad page can be recorded and the rest of the job
//! carries on.

pub mod local;
pub mod remote;

pub use local::{LocalBackend, LocalModel, MlxVlmModel};
pub use remote::{OpenAiCompatClient, RemoteBackend, RemoteTransport};

use crate::config::{BatchConfig, GenerationParams, ModelConfig};
use crate::error::{BatchError, FailureKind, ModelFailure};
use edgequake_llm::{LLMProvider, ProviderFactory};
use serde::Serialize;
use std::sync::Arc;

// ── Request / response ───────────────────────────────────────────────────

/// Everything a backend needs to answer one page. Immutable once built.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    image: Arc<[u8]>,
    mime_type: String,
    prompt: Arc<str>,
    params: GenerationParams,
    source: Arc<str>,
    page_index: usize,
}

impl ModelRequest {
    pub fn new(
        image: Arc<[u8]>,
        mime_type: impl Into<String>,
        prompt: Arc<str>,
        params: GenerationParams,
    ) -> Self {
        Self {
            image,
            mime_type: mime_type.into(),
            prompt,
            params,
            source: Arc::from(""),
            page_index: 0,
        }
    }

    /// Attach the file name and page index, used only for logging.
    pub fn with_context(mut self, source: Arc<str>, page_index: usize) -> Self {
        self.source = source;
        self.page_index = page_index;
        self
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn params(&self) -> GenerationParams {
        self.params
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn page_index(&self) -> usize {
        self.page_index
    }
}

/// Which variant answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Remote,
}

/// Success with raw text, or a typed failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutcome {
    Success { text: String },
    Failure(ModelFailure),
}

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub backend: BackendKind,
    pub outcome: ModelOutcome,
    /// Attempts made, including the first.
    pub attempts: u32,
    pub duration_ms: u64,
}

impl ModelResponse {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ModelOutcome::Success { .. })
    }

    pub fn text(&self) -> Option<&str> {
        match &self.outcome {
            ModelOutcome::Success { text } => Some(text),
            ModelOutcome::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&ModelFailure> {
        match &self.outcome {
            ModelOutcome::Failure(f) => Some(f),
            ModelOutcome::Success { .. } => None,
        }
    }
}

// ── Backend ──────────────────────────────────────────────────────────────

/// The closed set of backends.
#[derive(Clone)]
pub enum ModelBackend {
    Local(LocalBackend),
    Remote(RemoteBackend),
}

impl std::fmt::Debug for ModelBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelBackend::Local(b) => f.debug_tuple("Local").field(&b.label()).finish(),
            ModelBackend::Remote(b) => f.debug_tuple("Remote").field(&b.label()).finish(),
        }
    }
}

impl ModelBackend {
    /// Build the backend a [`ModelConfig`] describes.
    ///
    /// Local configs resolve to the process-wide resident model for that
    /// path, so separate batches share one gate.
    pub fn from_config(model: &ModelConfig, config: &BatchConfig) -> Result<Self, BatchError> {
        model.validate()?;
        match model {
            ModelConfig::Local { model_path, python } => Ok(ModelBackend::Local(
                LocalBackend::shared(model_path, python.as_deref(), config.local_timeout()),
            )),
            ModelConfig::Api {
                base_url,
                api_key,
                model_name,
            } => {
                let client =
                    OpenAiCompatClient::new(base_url, api_key, model_name, config.request_timeout())?;
                Ok(ModelBackend::Remote(RemoteBackend::new(
                    RemoteTransport::OpenAiCompatible(client),
                    config,
                )))
            }
            ModelConfig::Provider { provider, model } => {
                let llm = ProviderFactory::create_llm_provider(provider, model).map_err(|e| {
                    BatchError::ProviderNotConfigured {
                        provider: provider.clone(),
                        hint: format!("{e}"),
                    }
                })?;
                Ok(ModelBackend::Remote(
                    RemoteBackend::new(RemoteTransport::Provider(llm), config)
                        .with_label(format!("{provider}:{model}")),
                ))
            }
        }
    }

    /// Remote backend over a pre-built `edgequake-llm` provider.
    pub fn from_provider(provider: Arc<dyn LLMProvider>, config: &BatchConfig) -> Self {
        ModelBackend::Remote(RemoteBackend::new(RemoteTransport::Provider(provider), config))
    }

    /// Answer one page. Never fails; failures are in the outcome.
    pub async fn invoke(&self, request: &ModelRequest) -> ModelResponse {
        match self {
            ModelBackend::Local(b) => b.invoke(request).await,
            ModelBackend::Remote(b) => b.invoke(request).await,
        }
    }

    /// How many invocations may usefully run at once, given the caller's
    /// requested parallelism.
    pub fn effective_concurrency(&self, requested: usize) -> usize {
        match self {
            ModelBackend::Local(_) => 1,
            ModelBackend::Remote(_) => requested.max(1),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            ModelBackend::Local(_) => BackendKind::Local,
            ModelBackend::Remote(_) => BackendKind::Remote,
        }
    }

    pub fn label(&self) -> String {
        match self {
            ModelBackend::Local(b) => b.label().to_string(),
            ModelBackend::Remote(b) => b.label().to_string(),
        }
    }
}

/// Empty text is not an answer.
pub(crate) fn non_empty(text: String) -> Result<String, ModelFailure> {
    if text.trim().is_empty() {
        Err(ModelFailure::new(
            FailureKind::InvalidResponse,
            "model returned empty output",
        ))
    } else {
        Ok(text)
    }
}
