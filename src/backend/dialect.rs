//! Client for a locally hosted model server of unknown dialect.
//!
//! Local model hosts expose one (or both) of two HTTP dialects:
//!
//! - [`Dialect::ChatCompletions`]: `POST /v1/chat/completions`, answers with
//!   `choices[0].message.content`, streams SSE frames carrying
//!   `choices[0].delta.content`.
//! - [`Dialect::Generate`]: `POST /api/generate`, answers with a flat
//!   `response` field, streams NDJSON frames with `response` and a `done` flag.
//!
//! [`DialectClient`] keeps the last dialect that worked. When the active
//! dialect looks absent (connection refused, timeout, 404/405/501, or a body
//! without the dialect's shape) it switches and retries exactly once. Any
//! other failure is an application error and surfaces unchanged.

use super::frames::{FrameDecoder, FrameFormat};
use super::{ChatMessage, LlmRequest, LlmResponse, ProviderClient, Role, TokenStream};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex;

/// The two wire protocols a local host may speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    ChatCompletions,
    Generate,
}

impl Dialect {
    pub fn endpoint(&self) -> &'static str {
        match self {
            Dialect::ChatCompletions => "/v1/chat/completions",
            Dialect::Generate => "/api/generate",
        }
    }

    /// The dialect to try when this one looks absent.
    pub fn other(&self) -> Dialect {
        match self {
            Dialect::ChatCompletions => Dialect::Generate,
            Dialect::Generate => Dialect::ChatCompletions,
        }
    }

    pub fn frame_format(&self) -> FrameFormat {
        match self {
            Dialect::ChatCompletions => FrameFormat::Sse,
            Dialect::Generate => FrameFormat::Ndjson,
        }
    }

    /// Build the request body for this dialect.
    pub fn build_body(&self, request: &LlmRequest, stream: bool) -> Value {
        let opts = &request.options;
        match self {
            Dialect::ChatCompletions => {
                let messages: Vec<Value> = request
                    .messages
                    .iter()
                    .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
                    .collect();
                let mut body = json!({
                    "model": request.model,
                    "messages": messages,
                    "temperature": opts.temperature,
                    "max_tokens": opts.max_tokens,
                    "stream": stream,
                });
                if opts.json_mode {
                    body["response_format"] = json!({"type": "json_object"});
                }
                body
            }
            Dialect::Generate => {
                let (system, prompt) = flatten_messages(&request.messages);
                let mut body = json!({
                    "model": request.model,
                    "prompt": prompt,
                    "stream": stream,
                    "options": {
                        "temperature": opts.temperature,
                        "num_predict": opts.max_tokens,
                    },
                });
                if let Some(system) = system {
                    body["system"] = json!(system);
                }
                if opts.json_mode {
                    body["format"] = json!("json");
                }
                body
            }
        }
    }

    /// Text of a blocking response, or `None` when the body lacks this
    /// dialect's shape.
    pub fn extract_text(&self, body: &Value) -> Option<String> {
        let text = match self {
            Dialect::ChatCompletions => body
                .get("choices")?
                .get(0)?
                .get("message")?
                .get("content")?
                .as_str()?,
            Dialect::Generate => body.get("response")?.as_str()?,
        };
        Some(text.to_string())
    }

    /// Token carried by one stream frame, if any.
    pub fn token_from_frame<'a>(&self, frame: &'a Value) -> Option<&'a str> {
        match self {
            Dialect::ChatCompletions => frame
                .get("choices")?
                .get(0)?
                .get("delta")?
                .get("content")?
                .as_str(),
            Dialect::Generate => frame.get("response")?.as_str(),
        }
    }

    /// Whether a frame belongs to this dialect at all.
    fn recognizes_frame(&self, frame: &Value) -> bool {
        match self {
            Dialect::ChatCompletions => frame.get("choices").is_some(),
            Dialect::Generate => frame.get("response").is_some() || frame.get("done").is_some(),
        }
    }

    fn is_terminal_frame(&self, frame: &Value) -> bool {
        match self {
            Dialect::ChatCompletions => false,
            Dialect::Generate => frame.get("done").and_then(Value::as_bool) == Some(true),
        }
    }

    pub(crate) fn extract_metadata(&self, body: &Value) -> Option<Value> {
        let keys: &[&str] = match self {
            Dialect::ChatCompletions => &["model", "usage"],
            Dialect::Generate => &[
                "model",
                "total_duration",
                "eval_count",
                "eval_duration",
                "prompt_eval_count",
            ],
        };
        let meta: serde_json::Map<String, Value> = keys
            .iter()
            .filter_map(|k| body.get(*k).map(|v| ((*k).to_string(), v.clone())))
            .collect();
        if meta.is_empty() {
            None
        } else {
            Some(Value::Object(meta))
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::ChatCompletions => f.write_str("chat-completions"),
            Dialect::Generate => f.write_str("generate"),
        }
    }
}

/// Split a conversation into the generate dialect's `system` and `prompt`.
fn flatten_messages(messages: &[ChatMessage]) -> (Option<String>, String) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let turns: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != Role::System).collect();

    let prompt = match turns.as_slice() {
        [only] => only.content.clone(),
        _ => turns
            .iter()
            .map(|m| {
                let label = match m.role {
                    Role::Assistant => "Assistant",
                    _ => "User",
                };
                format!("{label}: {}", m.content)
            })
            .collect::<Vec<_>>()
            .join("\n\n"),
    };
    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, prompt)
}

/// Outcome of one attempt against one dialect.
enum CallFailure {
    /// The dialect looks absent on this host; the other one may work.
    Mismatch(RelayError),
    /// A real failure. Switching dialects would not help.
    Fatal(RelayError),
}

impl CallFailure {
    fn into_error(self) -> RelayError {
        match self {
            CallFailure::Mismatch(e) | CallFailure::Fatal(e) => e,
        }
    }
}

/// HTTP client for one local model host, auto-detecting its dialect.
///
/// The remembered dialect is per instance; share one instance (see
/// [`HttpClientFactory`](super::HttpClientFactory)) to keep it across calls.
#[derive(Debug)]
pub struct DialectClient {
    http: Client,
    base_url: String,
    label: String,
    active: Mutex<Dialect>,
}

impl DialectClient {
    /// Create a client that tries chat-completions first.
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            label: "local".to_string(),
            active: Mutex::new(Dialect::ChatCompletions),
        }
    }

    /// Start from a different dialect.
    pub fn with_dialect(self, dialect: Dialect) -> Self {
        self.remember(dialect);
        self
    }

    /// Name used in errors and logs.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The dialect the next call will try first.
    pub fn current_dialect(&self) -> Dialect {
        *self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn remember(&self, dialect: Dialect) {
        *self.active.lock().unwrap_or_else(|p| p.into_inner()) = dialect;
    }

    fn url(&self, dialect: Dialect) -> String {
        format!("{}{}", self.base_url, dialect.endpoint())
    }

    /// Blocking call. Switches dialect and retries once on a mismatch.
    pub async fn invoke(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let first = self.current_dialect();
        match self.invoke_with(first, request).await {
            Ok(resp) => Ok(resp),
            Err(CallFailure::Fatal(e)) => Err(e),
            Err(CallFailure::Mismatch(e)) => {
                let second = first.other();
                tracing::info!(
                    host = %self.base_url,
                    from = %first,
                    to = %second,
                    error = %e,
                    "dialect mismatch, switching"
                );
                let resp = self
                    .invoke_with(second, request)
                    .await
                    .map_err(CallFailure::into_error)?;
                self.remember(second);
                Ok(resp)
            }
        }
    }

    /// Open a token stream. The dialect switch applies only while opening;
    /// once a token has been yielded, failures end the stream with
    /// [`RelayError::StreamInterrupted`].
    pub async fn stream(&self, request: &LlmRequest) -> Result<TokenStream> {
        let first = self.current_dialect();
        match self.open_with(first, request).await {
            Ok(tokens) => Ok(tokens),
            Err(CallFailure::Fatal(e)) => Err(e),
            Err(CallFailure::Mismatch(e)) => {
                let second = first.other();
                tracing::info!(
                    host = %self.base_url,
                    from = %first,
                    to = %second,
                    error = %e,
                    "dialect mismatch on stream open, switching"
                );
                let tokens = self
                    .open_with(second, request)
                    .await
                    .map_err(CallFailure::into_error)?;
                self.remember(second);
                Ok(tokens)
            }
        }
    }

    async fn send(
        &self,
        dialect: Dialect,
        request: &LlmRequest,
        stream: bool,
    ) -> std::result::Result<reqwest::Response, CallFailure> {
        let url = self.url(dialect);
        let body = dialect.build_body(request, stream);
        let resp = self.http.post(&url).json(&body).send().await.map_err(|e| {
            let switchable = e.is_connect() || e.is_timeout();
            let err = RelayError::Transport {
                url: url.clone(),
                message: e.to_string(),
            };
            if switchable {
                CallFailure::Mismatch(err)
            } else {
                CallFailure::Fatal(err)
            }
        })?;

        let status = resp.status().as_u16();
        if resp.status().is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let err = RelayError::HttpError { status, body };
        match status {
            404 | 405 | 501 => Err(CallFailure::Mismatch(err)),
            _ => Err(CallFailure::Fatal(err)),
        }
    }

    async fn invoke_with(
        &self,
        dialect: Dialect,
        request: &LlmRequest,
    ) -> std::result::Result<LlmResponse, CallFailure> {
        let resp = self.send(dialect, request, false).await?;
        let body: Value = resp.json().await.map_err(|e| {
            CallFailure::Mismatch(RelayError::Transport {
                url: self.url(dialect),
                message: format!("unreadable body: {e}"),
            })
        })?;
        let text = dialect.extract_text(&body).ok_or_else(|| {
            CallFailure::Mismatch(RelayError::EmptyResponse {
                provider: self.label.clone(),
            })
        })?;
        Ok(LlmResponse {
            text,
            metadata: dialect.extract_metadata(&body),
        })
    }

    async fn open_with(
        &self,
        dialect: Dialect,
        request: &LlmRequest,
    ) -> std::result::Result<TokenStream, CallFailure> {
        let url = self.url(dialect);
        let resp = self.send(dialect, request, true).await?;
        let bytes = resp
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| e.to_string()))
            .boxed();
        let mut frames = TokenFrames::new(dialect, url, bytes);

        // Read up to the first token so a wrong dialect is caught before
        // anything reaches the caller.
        match frames.next_token().await {
            Ok(Some(token)) => frames.pending.push_front(token),
            Ok(None) if !frames.recognized => {
                return Err(CallFailure::Mismatch(RelayError::EmptyResponse {
                    provider: self.label.clone(),
                }))
            }
            Ok(None) => {}
            Err(e @ RelayError::Transport { .. }) => return Err(CallFailure::Mismatch(e)),
            Err(e) => return Err(CallFailure::Fatal(e)),
        }
        Ok(frames.into_stream())
    }
}

#[async_trait]
impl ProviderClient for DialectClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        self.invoke(request).await
    }

    async fn stream(&self, request: &LlmRequest) -> Result<TokenStream> {
        DialectClient::stream(self, request).await
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Incremental token extraction over a response byte stream.
pub(crate) struct TokenFrames {
    dialect: Dialect,
    url: String,
    bytes: BoxStream<'static, std::result::Result<Vec<u8>, String>>,
    decoder: FrameDecoder,
    pending: VecDeque<String>,
    recognized: bool,
    /// `done: true` frame or `[DONE]` sentinel seen.
    terminated: bool,
    truncated: bool,
    done: bool,
    yielded: usize,
}

impl TokenFrames {
    pub(crate) fn new(
        dialect: Dialect,
        url: String,
        bytes: BoxStream<'static, std::result::Result<Vec<u8>, String>>,
    ) -> Self {
        Self {
            dialect,
            url,
            bytes,
            decoder: FrameDecoder::new(dialect.frame_format()),
            pending: VecDeque::new(),
            recognized: false,
            terminated: false,
            truncated: false,
            done: false,
            yielded: 0,
        }
    }

    /// Next non-empty token, `Ok(None)` once the stream has ended.
    async fn next_token(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return Ok(Some(token));
            }
            if self.done {
                if std::mem::take(&mut self.truncated) {
                    return Err(RelayError::Transport {
                        url: self.url.clone(),
                        message: "stream ended without done sentinel".to_string(),
                    });
                }
                return Ok(None);
            }
            match self.bytes.next().await {
                Some(Ok(chunk)) => {
                    let values = self.decoder.decode(&chunk);
                    self.absorb(values)?;
                    if self.decoder.is_finished() {
                        self.terminated = true;
                        self.done = true;
                    }
                }
                Some(Err(message)) => {
                    self.done = true;
                    return Err(RelayError::Transport {
                        url: self.url.clone(),
                        message,
                    });
                }
                None => {
                    let values = self.decoder.flush();
                    self.absorb(values)?;
                    self.done = true;
                    if self.decoder.is_finished() {
                        self.terminated = true;
                    }
                    // a clean close is only an end if the server said so
                    self.truncated = self.recognized && !self.terminated;
                }
            }
        }
    }

    fn absorb(&mut self, values: Vec<Value>) -> Result<()> {
        for value in values {
            if let Some(message) = value.get("error").and_then(Value::as_str) {
                self.done = true;
                return Err(RelayError::Other(format!("provider error: {message}")));
            }
            if !self.dialect.recognizes_frame(&value) {
                continue;
            }
            self.recognized = true;
            if let Some(token) = self.dialect.token_from_frame(&value) {
                if !token.is_empty() {
                    self.pending.push_back(token.to_string());
                }
            }
            if self.dialect.is_terminal_frame(&value) {
                self.terminated = true;
                self.done = true;
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn into_stream(self) -> TokenStream {
        futures::stream::unfold(Some(self), |state| async move {
            let mut frames = state?;
            match frames.next_token().await {
                Ok(Some(token)) => {
                    frames.yielded += 1;
                    Some((Ok(token), Some(frames)))
                }
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(
                        url = %frames.url,
                        tokens = frames.yielded,
                        error = %e,
                        "token stream broke off"
                    );
                    let err = RelayError::StreamInterrupted {
                        tokens: frames.yielded,
                        message: e.to_string(),
                    };
                    Some((Err(err), None))
                }
            }
        })
        .boxed()
    }
}
