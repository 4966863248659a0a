//! Scripted clients for testing without a live model.
//!
//! [`ScriptedClient`] plays back a queue of outcomes (text, error, token
//! sequence, or a stream that breaks partway) and records every call, so
//! tests can assert that a short-circuited call never reached the network.
//! [`ScriptedFactory`] hands out scripted clients by provider name.
//!
//! # Example
//!
//! ```
//! use llm_relay::backend::ScriptedClient;
//!
//! let client = ScriptedClient::new("ollama")
//!     .then_text("first")
//!     .then_tokens(["a", "b"]);
//! assert_eq!(client.calls(), 0);
//! ```

use super::factory::ClientFactory;
use super::{LlmRequest, LlmResponse, ProviderClient, TokenStream};
use crate::error::{RelayError, Result};
use crate::provider::ProviderSelection;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One scripted outcome.
#[derive(Debug)]
pub enum Scripted {
    Text(String),
    Fail(RelayError),
    Tokens(Vec<String>),
    /// Yields the tokens, then a terminal [`RelayError::StreamInterrupted`].
    Broken { tokens: Vec<String>, message: String },
}

/// A [`ProviderClient`] that returns canned outcomes in order.
///
/// When the script runs out, the `fixed` text is returned if one was set;
/// otherwise calls fail.
#[derive(Debug)]
pub struct ScriptedClient {
    label: String,
    script: Mutex<VecDeque<Scripted>>,
    fixed: Option<String>,
    calls: AtomicUsize,
    models: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            script: Mutex::new(VecDeque::new()),
            fixed: None,
            calls: AtomicUsize::new(0),
            models: Mutex::new(Vec::new()),
        }
    }

    /// A client that always answers with `text`.
    pub fn fixed(label: impl Into<String>, text: impl Into<String>) -> Self {
        let mut client = Self::new(label);
        client.fixed = Some(text.into());
        client
    }

    pub fn then(self, outcome: Scripted) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(outcome);
        self
    }

    pub fn then_text(self, text: impl Into<String>) -> Self {
        self.then(Scripted::Text(text.into()))
    }

    pub fn then_error(self, err: RelayError) -> Self {
        self.then(Scripted::Fail(err))
    }

    /// Shorthand for a connection-refused style failure.
    pub fn then_transport_failure(self) -> Self {
        let url = format!("scripted://{}", self.label);
        self.then_error(RelayError::Transport {
            url,
            message: "connection refused".to_string(),
        })
    }

    pub fn then_tokens<I, S>(self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.then(Scripted::Tokens(tokens.into_iter().map(Into::into).collect()))
    }

    pub fn then_broken<I, S>(self, tokens: I, message: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.then(Scripted::Broken {
            tokens: tokens.into_iter().map(Into::into).collect(),
            message: message.into(),
        })
    }

    /// Number of `complete` and `stream` calls received.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Models requested, in call order.
    pub fn models(&self) -> Vec<String> {
        self.models.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn next(&self, request: &LlmRequest) -> Result<Scripted> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.models
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.model.clone());
        let next = self
            .script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        match (next, &self.fixed) {
            (Some(outcome), _) => Ok(outcome),
            (None, Some(text)) => Ok(Scripted::Text(text.clone())),
            (None, None) => Err(RelayError::Other(format!(
                "script for '{}' exhausted",
                self.label
            ))),
        }
    }
}

#[async_trait]
impl ProviderClient for ScriptedClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let text = match self.next(request)? {
            Scripted::Text(text) => text,
            Scripted::Tokens(tokens) => tokens.concat(),
            Scripted::Fail(err) => return Err(err),
            Scripted::Broken { message, .. } => {
                return Err(RelayError::Transport {
                    url: format!("scripted://{}", self.label),
                    message,
                })
            }
        };
        Ok(LlmResponse {
            text,
            metadata: None,
        })
    }

    async fn stream(&self, request: &LlmRequest) -> Result<TokenStream> {
        match self.next(request)? {
            Scripted::Text(text) => Ok(futures::stream::iter(vec![Ok(text)]).boxed()),
            Scripted::Tokens(tokens) => {
                Ok(futures::stream::iter(tokens.into_iter().map(Ok)).boxed())
            }
            Scripted::Fail(err) => Err(err),
            Scripted::Broken { tokens, message } => {
                let count = tokens.len();
                let items = tokens
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(RelayError::StreamInterrupted {
                        tokens: count,
                        message,
                    })));
                Ok(futures::stream::iter(items).boxed())
            }
        }
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// A [`ClientFactory`] that maps provider names to scripted clients.
#[derive(Debug, Default)]
pub struct ScriptedFactory {
    clients: HashMap<String, Arc<ScriptedClient>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(mut self, provider: impl Into<String>, client: Arc<ScriptedClient>) -> Self {
        self.clients.insert(provider.into(), client);
        self
    }
}

impl ClientFactory for ScriptedFactory {
    fn client_for(&self, selection: &ProviderSelection) -> Result<Arc<dyn ProviderClient>> {
        self.clients
            .get(&selection.name)
            .map(|c| c.clone() as Arc<dyn ProviderClient>)
            .ok_or_else(|| RelayError::NoProviderAvailable {
                purpose: selection.name.clone(),
                detail: "no scripted client".to_string(),
            })
    }
}
