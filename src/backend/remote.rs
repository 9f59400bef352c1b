//! Remote backend: a vision model behind the network.
//!
//! Two transports share the retry and timeout policy:
//!
//! - [`OpenAiCompatClient`] posts an OpenAI-style chat completion to any
//!   compatible endpoint (vLLM, LM Studio, DashScope, OpenAI itself) with
//!   the page as a base64 data URL.
//! - [`RemoteTransport::Provider`] goes through an `edgequake-llm` provider,
//!   for backends the factory knows how to configure from the environment.
//!
//! ## Retry Strategy
//!
//! Only [`FailureKind::Timeout`] and [`FailureKind::TransportError`] are
//! retried. Back-off is `retry_backoff_ms * 2^(attempt-1)`: with the 500 ms
//! default and two retries a page waits at most 1.5 s between attempts. Each
//! wait is capped at one minute.

use super::{non_empty, BackendKind, ModelOutcome, ModelRequest, ModelResponse};
use crate::config::BatchConfig;
use crate::error::{BatchError, FailureKind, ModelFailure};
use crate::pipeline::encode::{data_url, image_data};
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

const MAX_BACKOFF_MS: u64 = 60_000;

static AUTH_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b40[13]\b").unwrap());
static TRANSIENT_STATUS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:408|429|5\d\d)\b").unwrap());

#[derive(Clone)]
pub enum RemoteTransport {
    OpenAiCompatible(OpenAiCompatClient),
    Provider(Arc<dyn LLMProvider>),
}

#[derive(Clone)]
pub struct RemoteBackend {
    transport: RemoteTransport,
    timeout: Duration,
    max_retries: u32,
    retry_backoff_ms: u64,
    label: String,
}

impl RemoteBackend {
    pub fn new(transport: RemoteTransport, config: &BatchConfig) -> Self {
        let label = match &transport {
            RemoteTransport::OpenAiCompatible(c) => format!("api:{}", c.model),
            RemoteTransport::Provider(_) => "provider".to_string(),
        };
        Self {
            label,
            transport,
            timeout: config.request_timeout(),
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Invoke with retries. Never returns `Err`.
    pub async fn invoke(&self, request: &ModelRequest) -> ModelResponse {
        let start = Instant::now();
        let mut attempt: u32 = 0;

        let outcome = loop {
            if attempt > 0 {
                let backoff = backoff_ms(self.retry_backoff_ms, attempt);
                warn!(
                    "{} page {}: retry {}/{} after {}ms",
                    request.source(),
                    request.page_index() + 1,
                    attempt,
                    self.max_retries,
                    backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.attempt(request).await.and_then(non_empty) {
                Ok(text) => break ModelOutcome::Success { text },
                Err(failure) if failure.kind.is_retryable() && attempt < self.max_retries => {
                    warn!(
                        "{} page {}: attempt {} failed — {}",
                        request.source(),
                        request.page_index() + 1,
                        attempt + 1,
                        failure
                    );
                    attempt += 1;
                }
                Err(failure) => {
                    warn!(
                        "{} page {}: giving up after {} attempt(s) — {}",
                        request.source(),
                        request.page_index() + 1,
                        attempt + 1,
                        failure
                    );
                    break ModelOutcome::Failure(failure);
                }
            }
        };

        ModelResponse {
            backend: BackendKind::Remote,
            outcome,
            attempts: attempt + 1,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn attempt(&self, request: &ModelRequest) -> Result<String, ModelFailure> {
        match &self.transport {
            RemoteTransport::OpenAiCompatible(client) => client.complete(request).await,
            RemoteTransport::Provider(provider) => {
                match tokio::time::timeout(self.timeout, call_provider(provider, request)).await {
                    Ok(result) => result,
                    Err(_) => Err(ModelFailure::timeout(self.timeout)),
                }
            }
        }
    }
}

/// Exponential back-off before retry `attempt` (1-based), capped at a minute.
fn backoff_ms(base_ms: u64, attempt: u32) -> u64 {
    2u64.checked_pow(attempt.saturating_sub(1))
        .map_or(u64::MAX, |factor| base_ms.saturating_mul(factor))
        .min(MAX_BACKOFF_MS)
}

// ── OpenAI-compatible transport ──────────────────────────────────────────

#[derive(Clone)]
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl fmt::Debug for OpenAiCompatClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiCompatClient")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiCompatClient {
    /// `timeout` bounds each whole request, connect through body.
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, BatchError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BatchError::InvalidConfig(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: chat_endpoint(base_url),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn complete(&self, request: &ModelRequest) -> Result<String, ModelFailure> {
        let params = request.params();
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatRequestMessage {
                role: "user",
                content: vec![
                    ContentPart::Text {
                        text: request.prompt(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: data_url(request.mime_type(), request.image()),
                        },
                    },
                ],
            }],
            max_tokens: params.max_tokens,
            temperature: params.temperature,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(classify_transport_error)?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &text));
        }
        parse_completion(&text)
    }
}

/// Endpoints already ending in `/chat/completions` are used as given.
pub fn chat_endpoint(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{base}/chat/completions")
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatRequestMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatRequestMessage<'a> {
    role: &'static str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<serde_json::Value>,
}

/// Extract `choices[0].message.content`.
///
/// Content may be a string or an array of `{type: "text", text}` parts.
pub fn parse_completion(body: &str) -> Result<String, ModelFailure> {
    let completion: ChatCompletion = serde_json::from_str(body).map_err(|e| {
        ModelFailure::new(
            FailureKind::InvalidResponse,
            format!("response is not a chat completion: {e}"),
        )
    })?;
    let content = completion
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .ok_or_else(|| {
            ModelFailure::new(
                FailureKind::InvalidResponse,
                "response has no choices[0].message.content",
            )
        })?;

    match content {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Array(parts) => Ok(parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("")),
        other => Err(ModelFailure::new(
            FailureKind::InvalidResponse,
            format!("unexpected content type: {other}"),
        )),
    }
}

/// Map a non-2xx status to a failure kind.
pub fn classify_status(status: u16, body: &str) -> ModelFailure {
    let kind = match status {
        401 | 403 => FailureKind::AuthError,
        408 | 429 | 500..=599 => FailureKind::TransportError,
        _ => FailureKind::InvalidResponse,
    };
    ModelFailure::new(kind, format!("HTTP {status}: {}", snippet(body)))
}

fn classify_transport_error(e: reqwest::Error) -> ModelFailure {
    let kind = if e.is_timeout() {
        FailureKind::Timeout
    } else if e.is_decode() {
        FailureKind::InvalidResponse
    } else {
        FailureKind::TransportError
    };
    ModelFailure::new(kind, e.to_string())
}

fn snippet(body: &str) -> String {
    let body = body.trim();
    if body.chars().count() <= 200 {
        body.to_string()
    } else {
        let cut: String = body.chars().take(200).collect();
        format!("{cut}…")
    }
}

// ── edgequake-llm transport ──────────────────────────────────────────────

async fn call_provider(
    provider: &Arc<dyn LLMProvider>,
    request: &ModelRequest,
) -> Result<String, ModelFailure> {
    let messages = vec![ChatMessage::user_with_images(
        request.prompt(),
        vec![image_data(request.mime_type(), request.image())],
    )];
    let params = request.params();
    let options = CompletionOptions {
        temperature: Some(params.temperature),
        max_tokens: Some(params.max_tokens),
        ..Default::default()
    };

    match provider.chat(&messages, Some(&options)).await {
        Ok(response) => {
            debug!(
                "{} page {}: {} input tokens, {} output tokens",
                request.source(),
                request.page_index() + 1,
                response.prompt_tokens,
                response.completion_tokens
            );
            Ok(response.content)
        }
        Err(e) => Err(classify_provider_error(&format!("{e}"))),
    }
}

/// Providers surface errors as text; sort them by what the text says.
///
/// Status codes only count as whole numbers, so `max_tokens 1500` is not a
/// server error.
pub fn classify_provider_error(message: &str) -> ModelFailure {
    let m = message.to_lowercase();
    let kind = if AUTH_STATUS.is_match(&m)
        || ["unauthorized", "forbidden", "api key", "authentication"]
            .iter()
            .any(|k| m.contains(k))
    {
        FailureKind::AuthError
    } else if m.contains("timed out") || m.contains("timeout") {
        FailureKind::Timeout
    } else if TRANSIENT_STATUS.is_match(&m)
        || [
            "rate limit",
            "connection refused",
            "connection reset",
            "connection closed",
            "error sending request",
            "network",
        ]
        .iter()
        .any(|k| m.contains(k))
    {
        FailureKind::TransportError
    } else if ["parse", "deserial", "json", "empty response"]
        .iter()
        .any(|k| m.contains(k))
    {
        FailureKind::InvalidResponse
    } else {
        FailureKind::ModelRuntimeError
    };
    ModelFailure::new(kind, message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenerationParams;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn request() -> ModelRequest {
        ModelRequest::new(
            Arc::from(&b"\x89PNG"[..]),
            "image/png",
            Arc::from("describe"),
            GenerationParams::default(),
        )
    }

    /// Serve canned HTTP responses in order, one per connection.
    async fn stub_server(responses: Vec<(u16, String)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                read_request(&mut sock).await;
                counter.fetch_add(1, Ordering::SeqCst);
                let reply = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = sock.write_all(reply.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        (format!("http://{addr}/v1"), hits)
    }

    async fn read_request(sock: &mut tokio::net::TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = sock.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(head_end) = text.find("\r\n\r\n") {
                let len = text[..head_end]
                    .lines()
                    .find_map(|l| {
                        let l = l.to_ascii_lowercase();
                        l.strip_prefix("content-length:")
                            .and_then(|v| v.trim().parse::<usize>().ok())
                    })
                    .unwrap_or(0);
                if buf.len() >= head_end + 4 + len {
                    return;
                }
            }
        }
    }

    fn backend(base_url: &str, retries: u32) -> RemoteBackend {
        let config = BatchConfig::builder()
            .max_retries(retries)
            .retry_backoff_ms(1)
            .request_timeout_secs(5)
            .build()
            .unwrap();
        let client = OpenAiCompatClient::new(base_url, "sk-test", "qwen-vl", config.request_timeout())
            .unwrap();
        RemoteBackend::new(RemoteTransport::OpenAiCompatible(client), &config)
    }

    fn completion(text: &str) -> String {
        serde_json::json!({"choices": [{"message": {"role": "assistant", "content": text}}]})
            .to_string()
    }

    #[test]
    fn endpoint_is_appended_once() {
        assert_eq!(chat_endpoint("http://h/v1"), "http://h/v1/chat/completions");
        assert_eq!(chat_endpoint("http://h/v1/"), "http://h/v1/chat/completions");
        assert_eq!(
            chat_endpoint("http://h/v1/chat/completions"),
            "http://h/v1/chat/completions"
        );
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(401, "").kind, FailureKind::AuthError);
        assert_eq!(classify_status(403, "").kind, FailureKind::AuthError);
        assert_eq!(classify_status(429, "").kind, FailureKind::TransportError);
        assert_eq!(classify_status(503, "").kind, FailureKind::TransportError);
        assert_eq!(classify_status(400, "bad").kind, FailureKind::InvalidResponse);
    }

    #[test]
    fn parses_string_and_part_content() {
        assert_eq!(parse_completion(&completion("# Hi")).unwrap(), "# Hi");
        let parts = r#"{"choices":[{"message":{"content":[{"type":"text","text":"a"},{"type":"text","text":"b"}]}}]}"#;
        assert_eq!(parse_completion(parts).unwrap(), "ab");
    }

    #[test]
    fn missing_content_is_invalid() {
        for body in [r#"{"choices":[]}"#, r#"{"choices":[{"message":{}}]}"#, "not json"] {
            assert_eq!(
                parse_completion(body).unwrap_err().kind,
                FailureKind::InvalidResponse,
                "body: {body}"
            );
        }
    }

    #[test]
    fn provider_error_classification() {
        assert_eq!(
            classify_provider_error("API error 401: invalid api key").kind,
            FailureKind::AuthError
        );
        assert_eq!(
            classify_provider_error("request timed out").kind,
            FailureKind::Timeout
        );
        assert_eq!(
            classify_provider_error("HTTP 429 rate limit exceeded").kind,
            FailureKind::TransportError
        );
        assert_eq!(
            classify_provider_error("model refused").kind,
            FailureKind::ModelRuntimeError
        );
        assert_eq!(
            classify_provider_error("upstream returned 503 Service Unavailable").kind,
            FailureKind::TransportError
        );
        assert_eq!(
            classify_provider_error("connection reset by peer").kind,
            FailureKind::TransportError
        );
    }

    #[test]
    fn numbers_inside_messages_are_not_status_codes() {
        assert_eq!(
            classify_provider_error("max_tokens 1500 exceeds limit").kind,
            FailureKind::ModelRuntimeError
        );
        assert_eq!(
            classify_provider_error("image is 4010 px wide, too large").kind,
            FailureKind::ModelRuntimeError
        );
    }

    #[test]
    fn backoff_doubles_and_is_capped() {
        assert_eq!(backoff_ms(500, 1), 500);
        assert_eq!(backoff_ms(500, 2), 1_000);
        assert_eq!(backoff_ms(500, 3), 2_000);
        assert_eq!(backoff_ms(500, 56), MAX_BACKOFF_MS);
        assert_eq!(backoff_ms(500, 200), MAX_BACKOFF_MS);
        assert_eq!(backoff_ms(u64::MAX, 2), MAX_BACKOFF_MS);
    }

    #[test]
    fn debug_redacts_key() {
        let client =
            OpenAiCompatClient::new("http://h/v1", "sk-secret", "m", Duration::from_secs(1)).unwrap();
        let dbg = format!("{client:?}");
        assert!(!dbg.contains("sk-secret"));
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let (url, hits) = stub_server(vec![(200, completion("# Page"))]).await;
        let resp = backend(&url, 2).invoke(&request()).await;
        assert_eq!(resp.text(), Some("# Page"));
        assert_eq!(resp.attempts, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_error_is_retried() {
        let (url, hits) = stub_server(vec![
            (503, "{}".into()),
            (200, completion("recovered")),
        ])
        .await;
        let resp = backend(&url, 2).invoke(&request()).await;
        assert_eq!(resp.text(), Some("recovered"));
        assert_eq!(resp.attempts, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn auth_error_is_not_retried() {
        let (url, hits) = stub_server(vec![
            (401, r#"{"error":"bad key"}"#.into()),
            (200, completion("never")),
        ])
        .await;
        let resp = backend(&url, 3).invoke(&request()).await;
        assert_eq!(resp.failure().unwrap().kind, FailureKind::AuthError);
        assert_eq!(resp.attempts, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_content_is_invalid_response() {
        let (url, _) = stub_server(vec![(200, completion("   "))]).await;
        let resp = backend(&url, 2).invoke(&request()).await;
        assert_eq!(resp.failure().unwrap().kind, FailureKind::InvalidResponse);
        assert_eq!(resp.attempts, 1);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let resp = backend(&format!("http://{addr}/v1"), 0).invoke(&request()).await;
        assert_eq!(resp.failure().unwrap().kind, FailureKind::TransportError);
    }
}
