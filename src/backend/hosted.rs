//! Client for credentialed cloud providers.
//!
//! Every built-in cloud provider is reached through its chat-completions
//! compatible endpoint, so [`HostedClient`] reuses the
//! [`Dialect::ChatCompletions`] body and frame handling and adds bearer auth.
//! There is no dialect switching here: a hosted endpoint either answers or
//! fails.

use super::dialect::{Dialect, TokenFrames};
use super::{LlmRequest, LlmResponse, ProviderClient, TokenStream};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;

/// Chat-completions client with `Authorization: Bearer` auth.
///
/// # Example
///
/// ```
/// use llm_relay::backend::HostedClient;
///
/// let client = HostedClient::new(reqwest::Client::new(), "openai", "https://api.openai.com", "sk-...");
/// assert_eq!(client.base_url(), "https://api.openai.com");
/// ```
#[derive(Clone)]
pub struct HostedClient {
    http: Client,
    label: String,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for HostedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let key = if self.api_key.chars().count() > 6 {
            let prefix: String = self.api_key.chars().take(6).collect();
            format!("{prefix}***")
        } else {
            "***".to_string()
        };
        f.debug_struct("HostedClient")
            .field("label", &self.label)
            .field("base_url", &self.base_url)
            .field("api_key", &key)
            .finish()
    }
}

impl HostedClient {
    pub fn new(
        http: Client,
        label: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http,
            label: label.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self) -> String {
        format!("{}{}", self.base_url, Dialect::ChatCompletions.endpoint())
    }

    fn build_http_request(&self, url: &str, body: &Value) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .json(body)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    async fn send(&self, request: &LlmRequest, stream: bool) -> Result<reqwest::Response> {
        let url = self.url();
        let body = Dialect::ChatCompletions.build_body(request, stream);
        let resp = self
            .build_http_request(&url, &body)
            .send()
            .await
            .map_err(|e| RelayError::Transport {
                url: url.clone(),
                message: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::HttpError { status, body });
        }
        Ok(resp)
    }
}

#[async_trait]
impl ProviderClient for HostedClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let resp = self.send(request, false).await?;
        let body: Value = resp.json().await.map_err(|e| RelayError::Transport {
            url: self.url(),
            message: format!("unreadable body: {e}"),
        })?;
        let text = Dialect::ChatCompletions
            .extract_text(&body)
            .ok_or_else(|| RelayError::EmptyResponse {
                provider: self.label.clone(),
            })?;
        Ok(LlmResponse {
            text,
            metadata: Dialect::ChatCompletions.extract_metadata(&body),
        })
    }

    async fn stream(&self, request: &LlmRequest) -> Result<TokenStream> {
        let resp = self.send(request, true).await?;
        let bytes = resp
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| e.to_string()))
            .boxed();
        Ok(TokenFrames::new(Dialect::ChatCompletions, self.url(), bytes).into_stream())
    }

    fn name(&self) -> &str {
        &self.label
    }
}
