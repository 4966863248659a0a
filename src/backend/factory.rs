//! Turning a [`ProviderSelection`] into a live client.

use super::{DialectClient, HostedClient, ProviderClient};
use crate::config::Environment;
use crate::error::{RelayError, Result};
use crate::provider::ProviderSelection;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Builds (or reuses) the client that serves a selection.
pub trait ClientFactory: Send + Sync {
    fn client_for(&self, selection: &ProviderSelection) -> Result<Arc<dyn ProviderClient>>;
}

/// Production factory over one shared `reqwest::Client`.
///
/// Local providers get a [`DialectClient`] that is cached per base URL, so
/// the dialect it learned survives across invocations. Credentialed
/// providers get a fresh [`HostedClient`] with the credential read at call
/// time.
pub struct HttpClientFactory {
    http: Client,
    env: Arc<dyn Environment>,
    local: Mutex<HashMap<String, Arc<DialectClient>>>,
}

impl std::fmt::Debug for HttpClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cached = self.local.lock().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("HttpClientFactory")
            .field("cached_local_clients", &cached)
            .finish()
    }
}

impl HttpClientFactory {
    pub fn new(env: Arc<dyn Environment>, request_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RelayError::InvalidConfig(format!("http client: {e}")))?;
        Ok(Self::with_client(env, http))
    }

    /// Use an existing `reqwest::Client`.
    pub fn with_client(env: Arc<dyn Environment>, http: Client) -> Self {
        Self {
            http,
            env,
            local: Mutex::new(HashMap::new()),
        }
    }

    fn local_client(&self, selection: &ProviderSelection) -> Arc<DialectClient> {
        let mut cache = self.local.lock().unwrap_or_else(|p| p.into_inner());
        cache
            .entry(selection.base_url.clone())
            .or_insert_with(|| {
                tracing::debug!(base_url = %selection.base_url, "new local dialect client");
                Arc::new(
                    DialectClient::new(self.http.clone(), selection.base_url.clone())
                        .with_label(selection.name.clone()),
                )
            })
            .clone()
    }
}

impl ClientFactory for HttpClientFactory {
    fn client_for(&self, selection: &ProviderSelection) -> Result<Arc<dyn ProviderClient>> {
        if selection.is_local() {
            return Ok(self.local_client(selection));
        }
        let key = self
            .env
            .var(&selection.credential_env_key)
            .ok_or_else(|| RelayError::NoProviderAvailable {
                purpose: selection.name.clone(),
                detail: format!("{} not set", selection.credential_env_key),
            })?;
        Ok(Arc::new(HostedClient::new(
            self.http.clone(),
            selection.name.clone(),
            selection.base_url.clone(),
            key,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapEnv;

    fn selection(name: &str, base_url: &str, requires_credential: bool) -> ProviderSelection {
        ProviderSelection {
            name: name.into(),
            model: "m".into(),
            credential_env_key: format!("{}_API_KEY", name.to_uppercase()),
            base_url_env_key: format!("{}_BASE_URL", name.to_uppercase()),
            default_base_url: base_url.into(),
            base_url: base_url.into(),
            requires_credential,
        }
    }

    #[test]
    fn test_local_client_is_memoized_per_base_url() {
        let factory = HttpClientFactory::new(Arc::new(MapEnv::new()), Duration::from_secs(5)).unwrap();
        let a = factory.client_for(&selection("ollama", "http://localhost:11434", false)).unwrap();
        let b = factory.client_for(&selection("ollama", "http://localhost:11434", false)).unwrap();
        let c = factory.client_for(&selection("ollama", "http://10.0.0.2:11434", false)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.name(), "ollama");
    }

    #[test]
    fn test_hosted_requires_credential() {
        let factory = HttpClientFactory::new(Arc::new(MapEnv::new()), Duration::from_secs(5)).unwrap();
        let err = factory
            .client_for(&selection("openai", "https://api.openai.com", true))
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::NoProviderAvailable { ref detail, .. } if detail.contains("OPENAI_API_KEY")));
    }

    #[test]
    fn test_hosted_client_built_with_credential() {
        let env = MapEnv::new().with("OPENAI_API_KEY", "sk-x");
        let factory = HttpClientFactory::new(Arc::new(env), Duration::from_secs(5)).unwrap();
        let client = factory
            .client_for(&selection("openai", "https://api.openai.com", true))
            .unwrap();
        assert_eq!(client.name(), "openai");
    }
}
