//! Local backend: one resident model, one call at a time.
//!
//! A local vision model owns the accelerator's memory, so two generations in
//! flight would either thrash or crash the runtime. Every [`LocalBackend`]
//! built for the same model path shares one gate (a tokio mutex around the
//! model), which holds across jobs and across separate batch invocations.
//!
//! The default runtime is `mlx_vlm` driven as a subprocess; anything else can
//! plug in through [`LocalModel`].

use super::{non_empty, BackendKind, ModelOutcome, ModelRequest, ModelResponse};
use crate::error::{FailureKind, ModelFailure};
use crate::pipeline::encode::extension_for_mime;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A model that runs in-process or on this machine.
#[async_trait]
pub trait LocalModel: Send {
    /// Produce raw text for one page.
    async fn generate(&mut self, request: &ModelRequest) -> Result<String, ModelFailure>;
}

type SharedModel = Arc<Mutex<Box<dyn LocalModel>>>;

/// Resident models, keyed by interpreter and model path.
static RESIDENT: Lazy<std::sync::Mutex<HashMap<String, SharedModel>>> =
    Lazy::new(|| std::sync::Mutex::new(HashMap::new()));

#[derive(Clone)]
pub struct LocalBackend {
    model: SharedModel,
    timeout: Duration,
    label: Arc<str>,
}

impl LocalBackend {
    /// Wrap a model with its own gate. Mostly useful for tests and embedders.
    pub fn new(model: impl LocalModel + 'static, timeout: Duration) -> Self {
        Self {
            model: Arc::new(Mutex::new(Box::new(model))),
            timeout,
            label: Arc::from("local"),
        }
    }

    /// The process-wide backend for `model_path`, loading it on first use.
    pub fn shared(model_path: &str, python: Option<&str>, timeout: Duration) -> Self {
        let model = MlxVlmModel::new(model_path, python.map(str::to_string));
        let key = format!("{}\u{0}{}", model.python, model_path);
        let mut resident = RESIDENT
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let shared = resident
            .entry(key)
            .or_insert_with(|| {
                debug!("Registering local model {}", model_path);
                Arc::new(Mutex::new(Box::new(model)))
            })
            .clone();
        Self {
            model: shared,
            timeout,
            label: Arc::from(format!("local:{model_path}")),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Queue on the gate, then generate under the per-call timeout.
    ///
    /// The timeout only starts once the gate is held; waiting behind other
    /// pages is not counted against this one.
    pub async fn invoke(&self, request: &ModelRequest) -> ModelResponse {
        let mut model = self.model.lock().await;
        let start = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, model.generate(request)).await {
            Ok(Ok(text)) => non_empty(text),
            Ok(Err(failure)) => Err(failure),
            Err(_) => Err(ModelFailure::timeout(self.timeout)),
        };
        drop(model);

        let duration_ms = start.elapsed().as_millis() as u64;
        let outcome = match outcome {
            Ok(text) => {
                debug!(
                    "{} page {}: {} chars in {}ms",
                    request.source(),
                    request.page_index() + 1,
                    text.len(),
                    duration_ms
                );
                ModelOutcome::Success { text }
            }
            Err(failure) => {
                warn!(
                    "{} page {}: local model failed: {}",
                    request.source(),
                    request.page_index() + 1,
                    failure
                );
                ModelOutcome::Failure(failure)
            }
        };
        ModelResponse {
            backend: BackendKind::Local,
            outcome,
            attempts: 1,
            duration_ms,
        }
    }
}

// ── mlx_vlm subprocess ───────────────────────────────────────────────────

/// Runs `python -m mlx_vlm generate` once per page.
///
/// The interpreter comes from the explicit argument, then `VLM_PYTHON`, then
/// plain `python` on `PATH`.
#[derive(Debug, Clone)]
pub struct MlxVlmModel {
    python: String,
    model_path: String,
}

impl MlxVlmModel {
    pub fn new(model_path: impl Into<String>, python: Option<String>) -> Self {
        let python = python
            .filter(|p| !p.trim().is_empty())
            .or_else(|| std::env::var("VLM_PYTHON").ok().filter(|p| !p.trim().is_empty()))
            .unwrap_or_else(|| "python".to_string());
        Self {
            python,
            model_path: model_path.into(),
        }
    }

    pub fn python(&self) -> &str {
        &self.python
    }

    fn command(&self, request: &ModelRequest, image: &Path) -> Command {
        let params = request.params();
        let mut cmd = Command::new(&self.python);
        cmd.args(["-m", "mlx_vlm", "generate", "--model"])
            .arg(&self.model_path)
            .arg("--max-tokens")
            .arg(params.max_tokens.to_string())
            .arg("--temperature")
            .arg(params.temperature.to_string())
            .arg("--prompt")
            .arg(request.prompt())
            .arg("--image")
            .arg(image)
            // Let the Metal allocator use all unified memory.
            .env("PYTORCH_MPS_HIGH_WATERMARK_RATIO", "0.0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl LocalModel for MlxVlmModel {
    async fn generate(&mut self, request: &ModelRequest) -> Result<String, ModelFailure> {
        let image = tempfile::Builder::new()
            .prefix("docbatch-page-")
            .suffix(&format!(".{}", extension_for_mime(request.mime_type())))
            .tempfile()
            .map_err(|e| runtime_error(format!("cannot create temp image: {e}")))?;
        tokio::fs::write(image.path(), request.image())
            .await
            .map_err(|e| runtime_error(format!("cannot write temp image: {e}")))?;

        let output = self
            .command(request, image.path())
            .output()
            .await
            .map_err(|e| runtime_error(format!("cannot start {}: {e}", self.python)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            let detail = if stderr.is_empty() { &stdout } else { &stderr };
            let message = if is_out_of_memory(detail) {
                format!("model ran out of memory: {}", tail(detail, 400))
            } else {
                format!("mlx_vlm exited with {}: {}", output.status, tail(detail, 400))
            };
            return Err(runtime_error(message));
        }

        // Some mlx_vlm versions print the answer on stderr.
        Ok(if stdout.is_empty() { stderr } else { stdout })
    }
}

fn runtime_error(message: String) -> ModelFailure {
    ModelFailure::new(FailureKind::ModelRuntimeError, message)
}

fn is_out_of_memory(detail: &str) -> bool {
    let d = detail.to_lowercase();
    d.contains("out of memory") || d.contains("outofmemory") || d.contains("insufficient memory")
}

/// Last `max` characters of `s`.
fn tail(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    match s.char_indices().nth(count - max) {
        Some((i, _)) => &s[i..],
        None => s,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::GenerationParams;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct EchoModel;

    #[async_trait]
    impl LocalModel for EchoModel {
        async fn generate(&mut self, request: &ModelRequest) -> Result<String, ModelFailure> {
            Ok(format!("echo {}", request.page_index()))
        }
    }

    struct SlowModel {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait]
    impl LocalModel for SlowModel {
        async fn generate(&mut self, _request: &ModelRequest) -> Result<String, ModelFailure> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok("done".into())
        }
    }

    fn request(page: usize) -> ModelRequest {
        ModelRequest::new(
            Arc::from(&b"png"[..]),
            "image/png",
            Arc::from("describe"),
            GenerationParams::default(),
        )
        .with_context(Arc::from("doc.pdf"), page)
    }

    #[tokio::test]
    async fn calls_are_serialised() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let backend = LocalBackend::new(
            SlowModel {
                active: active.clone(),
                peak: peak.clone(),
                delay: Duration::from_millis(20),
            },
            Duration::from_secs(5),
        );
        let mut handles = Vec::new();
        for page in 0..4 {
            let b = backend.clone();
            handles.push(tokio::spawn(async move { b.invoke(&request(page)).await }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_success());
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_generation_times_out() {
        let backend = LocalBackend::new(
            SlowModel {
                active: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
                delay: Duration::from_secs(5),
            },
            Duration::from_millis(30),
        );
        let resp = backend.invoke(&request(0)).await;
        assert_eq!(resp.failure().unwrap().kind, FailureKind::Timeout);
        assert_eq!(resp.backend, BackendKind::Local);
    }

    #[tokio::test]
    async fn missing_interpreter_is_runtime_error() {
        let mut model = MlxVlmModel::new("/models/none", Some("/nonexistent/python3".into()));
        let err = model.generate(&request(0)).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::ModelRuntimeError);
    }

    #[test]
    fn shared_backends_share_one_gate() {
        let a = LocalBackend::shared("/models/q", Some("py-test"), Duration::from_secs(1));
        let b = LocalBackend::shared("/models/q", Some("py-test"), Duration::from_secs(9));
        let c = LocalBackend::shared("/models/other", Some("py-test"), Duration::from_secs(1));
        assert!(Arc::ptr_eq(&a.model, &b.model));
        assert!(!Arc::ptr_eq(&a.model, &c.model));
        assert_eq!(b.timeout(), Duration::from_secs(9));
    }

    #[test]
    fn explicit_python_wins() {
        assert_eq!(MlxVlmModel::new("m", Some("/opt/py".into())).python(), "/opt/py");
    }

    #[test]
    fn tail_is_char_safe() {
        assert_eq!(tail("héllo", 3), "llo");
        assert_eq!(tail("ab", 5), "ab");
    }

    #[test]
    fn oom_detection() {
        assert!(is_out_of_memory("[METAL] Command buffer failed: Insufficient Memory"));
        assert!(!is_out_of_memory("No module named mlx_vlm"));
    }
}
