//! Provider clients and normalized request/response types.
//!
//! The [`ProviderClient`] trait abstracts over the two ways this crate talks
//! to a model: [`DialectClient`] for a locally hosted server that may speak
//! either response dialect, and [`HostedClient`] for credentialed cloud
//! providers. Both translate a normalized [`LlmRequest`] into HTTP.
//!
//! ## Architecture
//!
//! ```text
//! ResilientInvoker ──► ClientFactory ──► ProviderClient::complete()/stream()
//!                                              │
//!                                  ┌───────────┴───────────┐
//!                             DialectClient            HostedClient
//!                     chat-completions ⇄ generate    chat-completions
//!                     (remembers last good)           bearer auth, SSE
//! ```

pub mod dialect;
pub mod factory;
pub mod frames;
pub mod hosted;
pub mod mock;

pub use dialect::{Dialect, DialectClient};
pub use factory::{ClientFactory, HttpClientFactory};
pub use hosted::HostedClient;
pub use mock::{Scripted, ScriptedClient, ScriptedFactory};

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// A stream of generated tokens. Ends after the last token; an `Err` item is
/// terminal.
pub type TokenStream = BoxStream<'static, Result<String>>;

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling options shared by every dialect.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    /// Temperature (0.0 = deterministic, 1.0 = creative).
    pub temperature: f64,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Ask the model for a JSON object.
    pub json_mode: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2048,
            json_mode: false,
        }
    }
}

impl GenerationOptions {
    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }
}

/// A normalized, provider-agnostic request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Model identifier (e.g. `"llama3.2:3b"`, `"gpt-4o-mini"`).
    pub model: String,
    /// Ordered conversation.
    pub messages: Vec<ChatMessage>,
    pub options: GenerationOptions,
}

impl LlmRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            options: GenerationOptions::default(),
        }
    }

    /// Same request against another model.
    pub fn with_model(&self, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..self.clone()
        }
    }
}

/// A normalized response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// The generated text.
    pub text: String,
    /// Provider-specific metadata (token counts, model id), kept as raw JSON.
    pub metadata: Option<serde_json::Value>,
}

/// A client bound to one provider endpoint.
///
/// # Object Safety
///
/// This trait is object-safe and designed to be used as `Arc<dyn ProviderClient>`.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Blocking completion.
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Open a token stream.
    ///
    /// Errors returned here happened before any token was produced. Errors
    /// yielded by the stream happened after, and must not be retried.
    async fn stream(&self, request: &LlmRequest) -> Result<TokenStream>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &str;
}
