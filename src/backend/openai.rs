//! Networked backend: OpenAI-style chat completions over SSE
//!
//! The request/stream consumption runs directly on the controller's
//! async I/O — no worker thread and no coalescing, the stream is the
//! identity pass-through of whatever increments the endpoint yields.

use super::{BackendError, ModelBackend};
use crate::bridge::{UpdateSender, UpdateStream};
use crate::config::ModelConfig;
use crate::session::{Message, Role, Update};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Parameter keys consumed by the backend itself rather than forwarded
/// in the request body.
const RESERVED_PARAMS: &[&str] = &["api_key", "base_url", "model"];

/// OpenAI-style chat completions backend.
#[derive(Clone)]
pub struct OpenAiBackend {
    client: Client,
    config: ModelConfig,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiBackend {
    /// Constructor bound to [`crate::config::BackendKind::OpenAi`] in the
    /// backend cache. The API key comes from the `api_key` param or the
    /// `OPENAI_API_KEY` environment variable.
    pub fn from_config(config: &ModelConfig) -> Result<Arc<dyn ModelBackend>, BackendError> {
        let api_key = config
            .str_param("api_key")
            .map(str::to_string)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| {
                BackendError::auth(format!(
                    "model '{}' needs an api_key param or OPENAI_API_KEY",
                    config.title
                ))
            })?;

        let base_url = config
            .str_param("base_url")
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        let model = config
            .str_param("model")
            .unwrap_or(DEFAULT_MODEL)
            .to_string();

        Ok(Arc::new(OpenAiBackend {
            client: Client::new(),
            config: config.clone(),
            endpoint: format!("{base_url}/chat/completions"),
            api_key,
            model,
        }))
    }

    fn request_body(&self, history: &[Message]) -> Value {
        let mut messages: Vec<Value> = Vec::with_capacity(history.len() + 1);
        if let Some(system) = &self.config.system_message {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for message in history {
            let role = match message.role {
                Some(Role::User) => "user",
                Some(Role::Assistant) => "assistant",
                Some(Role::System) => "system",
                // Error turns and the pending placeholder are not part
                // of the prompt.
                Some(Role::Error) | None => continue,
            };
            messages.push(json!({ "role": role, "content": message.content }));
        }

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        let table = body.as_object_mut().expect("body is an object");
        for (key, value) in &self.config.params {
            if !RESERVED_PARAMS.contains(&key.as_str()) {
                table.insert(key.clone(), value.to_json());
            }
        }
        body
    }

    async fn run_stream(&self, body: Value, tx: &UpdateSender) -> Result<(), BackendError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    BackendError::network(format!("request failed: {e}"))
                } else {
                    BackendError::unknown(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &detail));
        }

        pump_sse(response.bytes_stream(), tx).await
    }
}

/// Consume an SSE byte stream, forwarding the updates each complete
/// line carries. A final line without a trailing newline is still
/// parsed when the stream ends.
async fn pump_sse<B, E>(
    mut bytes: impl futures::Stream<Item = Result<B, E>> + Unpin,
    tx: &UpdateSender,
) -> Result<(), BackendError>
where
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut pending = String::new();
    while let Some(chunk) = bytes.next().await {
        if tx.is_cancelled() {
            return Ok(());
        }
        let chunk = chunk.map_err(|e| BackendError::network(format!("stream interrupted: {e}")))?;
        pending.push_str(&String::from_utf8_lossy(chunk.as_ref()));

        while let Some(newline) = pending.find('\n') {
            let line: String = pending.drain(..=newline).collect();
            for update in parse_sse_line(line.trim())? {
                if !tx.send(update).await {
                    return Ok(());
                }
            }
        }
    }
    for update in parse_sse_line(pending.trim())? {
        if !tx.send(update).await {
            return Ok(());
        }
    }
    Ok(())
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    async fn query(&self, history: &[Message]) -> UpdateStream {
        let (tx, stream) = UpdateStream::pipe();
        let body = self.request_body(history);
        let backend = self.clone();
        tokio::spawn(async move {
            if let Err(err) = backend.run_stream(body, &tx).await {
                tracing::warn!(model = %backend.model, error = %err, "chat completion failed");
                tx.send(Update::error(err.to_string())).await;
            }
        });
        stream
    }

    /// Deterministic approximation: roughly four characters per token
    /// for GPT-family tokenizers. Exact counting would need the
    /// provider's tokenizer; the engine only relies on purity.
    fn token_count(&self, text: &str) -> usize {
        approximate_tokens(text)
    }
}

pub(crate) fn approximate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Parse one SSE line into the updates it carries, in delta order:
/// role, then content, then finish reason.
fn parse_sse_line(line: &str) -> Result<Vec<Update>, BackendError> {
    let Some(data) = line.strip_prefix("data:") else {
        // Blank keep-alives and comment lines carry nothing.
        return Ok(Vec::new());
    };
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(Vec::new());
    }

    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| BackendError::unknown(format!("malformed stream chunk: {e}")))?;

    let mut updates = Vec::new();
    if let Some(choice) = chunk.choices.into_iter().next() {
        if let Some(role) = choice.delta.role.as_deref() {
            updates.push(Update::role(parse_role(role)));
        }
        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                updates.push(Update::content(content));
            }
        }
        if let Some(reason) = choice.finish_reason {
            updates.push(Update::finish(reason));
        }
    }
    Ok(updates)
}

fn parse_role(role: &str) -> Role {
    match role {
        "user" => Role::User,
        "system" => Role::System,
        _ => Role::Assistant,
    }
}

fn classify_status(status: reqwest::StatusCode, detail: &str) -> BackendError {
    match status.as_u16() {
        401 | 403 => BackendError::auth(format!("authentication failed: {detail}")),
        429 => BackendError::rate_limit(format!("rate limited: {detail}")),
        400 => BackendError::invalid_request(format!("invalid request: {detail}")),
        500..=599 => BackendError::server_error(format!("server error: {detail}")),
        _ => BackendError::unknown(format!("HTTP {status}: {detail}")),
    }
}

// Wire types

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendErrorKind;
    use crate::config::{BackendKind, ParamValue};

    fn test_config() -> ModelConfig {
        ModelConfig::new("Test", BackendKind::OpenAi)
            .with_param("api_key", ParamValue::Str("sk-test".to_string()))
            .with_param("model", ParamValue::Str("gpt-4o-mini".to_string()))
            .with_param("temperature", ParamValue::Float(0.2))
    }

    fn test_backend() -> OpenAiBackend {
        let config = test_config();
        OpenAiBackend {
            client: Client::new(),
            endpoint: format!("{DEFAULT_BASE_URL}/chat/completions"),
            api_key: "sk-test".to_string(),
            model: "gpt-4o-mini".to_string(),
            config,
        }
    }

    #[test]
    fn sse_role_content_and_finish() {
        let updates = parse_sse_line(
            r#"data: {"choices":[{"delta":{"role":"assistant"},"finish_reason":null}]}"#,
        )
        .unwrap();
        assert_eq!(updates, vec![Update::role(Role::Assistant)]);

        let updates =
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"He"},"finish_reason":null}]}"#)
                .unwrap();
        assert_eq!(updates, vec![Update::content("He")]);

        let updates =
            parse_sse_line(r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#).unwrap();
        assert_eq!(updates, vec![Update::finish("stop")]);
    }

    #[test]
    fn sse_ignores_keepalives_and_done() {
        assert!(parse_sse_line("").unwrap().is_empty());
        assert!(parse_sse_line(": keep-alive").unwrap().is_empty());
        assert!(parse_sse_line("data: [DONE]").unwrap().is_empty());
    }

    #[test]
    fn sse_rejects_malformed_chunks() {
        let err = parse_sse_line("data: {not json").unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Unknown);
    }

    #[test]
    fn request_body_injects_system_message_and_params() {
        let mut config = test_config();
        config.system_message = Some("Be brief.".to_string());
        let backend = OpenAiBackend {
            config,
            ..test_backend()
        };

        let history = vec![
            Message::new(Role::User, "hi"),
            Message::new(Role::Assistant, "hello"),
            Message::new(Role::Error, "old failure"),
            Message::pending(),
        ];
        let body = backend.request_body(&history);

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3); // system + user + assistant
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "Be brief.");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[2]["role"], "assistant");

        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["stream"], true);
        assert_eq!(body["temperature"], 0.2);
        // Reserved params never leak into the request.
        assert!(body.get("api_key").is_none());
        assert!(body.get("base_url").is_none());
    }

    #[test]
    fn status_classification() {
        use reqwest::StatusCode;
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, "").kind,
            BackendErrorKind::Auth
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "").kind,
            BackendErrorKind::RateLimit
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, "").kind,
            BackendErrorKind::InvalidRequest
        );
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, "").kind,
            BackendErrorKind::ServerError
        );
    }

    #[tokio::test]
    async fn unterminated_final_line_is_not_dropped() {
        let chunks: Vec<Result<&[u8], BackendError>> = vec![
            Ok(br#"data: {"choices":[{"delta":{"content":"He"},"finish_reason":null}]}"#
                .as_ref()),
            Ok(b"\n\n".as_ref()),
            // The stream ends without a trailing newline.
            Ok(br#"data: {"choices":[{"delta":{"content":"llo"},"finish_reason":null}]}"#
                .as_ref()),
        ];
        let (tx, mut stream) = UpdateStream::pipe();
        pump_sse(futures::stream::iter(chunks), &tx).await.unwrap();
        drop(tx);

        let mut content = String::new();
        while let Some(update) = stream.next().await {
            if let Some(delta) = update.content {
                content.push_str(&delta);
            }
        }
        assert_eq!(content, "Hello");
    }

    #[test]
    fn token_count_is_pure_and_monotonic_enough() {
        assert_eq!(approximate_tokens(""), 0);
        assert_eq!(approximate_tokens("hi"), 1);
        let text = "The quick brown fox jumps over the lazy dog.";
        assert_eq!(approximate_tokens(text), approximate_tokens(text));
        assert!(approximate_tokens(text) > approximate_tokens("fox"));
    }

    #[test]
    fn from_config_requires_an_api_key() {
        // Guard against ambient credentials leaking into the test.
        if std::env::var("OPENAI_API_KEY").is_ok() {
            return;
        }
        let config = ModelConfig::new("Keyless", BackendKind::OpenAi);
        let err = OpenAiBackend::from_config(&config).map(|_| ()).unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Auth);
    }
}
