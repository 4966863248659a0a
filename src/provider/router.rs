//! Purpose-keyed provider selection.
//!
//! [`ProviderRouter::select`] walks a priority list for the caller's
//! [`Purpose`] and returns the first provider that is available right now.
//! A forced provider from configuration is tried ahead of the list; if it is
//! also marked `force` and unavailable, selection fails loudly instead of
//! quietly moving on.

use super::catalog::{ProviderCatalog, ProviderSpec};
use super::probe::ReachabilityProbe;
use crate::config::{Environment, RoutingConfig};
use crate::error::{RelayError, Result};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// What the caller is generating for. Picks a priority order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Purpose {
    /// Chat turns: cost-optimized providers first.
    Conversation,
    /// Reviews and policy checks: higher-capability providers first.
    Governance,
    /// Documents and code.
    Generation,
    /// Any other tag. Uses the generation order.
    Other(String),
}

impl Purpose {
    /// Provider names in the order they are tried.
    pub fn priority(&self) -> &'static [&'static str] {
        match self {
            Purpose::Conversation => &["deepseek", "groq", "openai", "anthropic", "ollama"],
            Purpose::Governance => &["anthropic", "openai", "deepseek", "groq", "ollama"],
            Purpose::Generation | Purpose::Other(_) => {
                &["openai", "anthropic", "deepseek", "groq", "ollama"]
            }
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Purpose::Conversation => "conversation",
            Purpose::Governance => "governance",
            Purpose::Generation => "generation",
            Purpose::Other(tag) => tag,
        }
    }
}

impl FromStr for Purpose {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "conversation" | "chat" => Purpose::Conversation,
            "governance" | "review" => Purpose::Governance,
            "generation" | "" => Purpose::Generation,
            other => Purpose::Other(other.to_string()),
        })
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved provider/model pair. Recomputed for every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSelection {
    pub name: String,
    pub model: String,
    pub credential_env_key: String,
    pub base_url_env_key: String,
    pub default_base_url: String,
    /// Base URL after applying the environment override.
    pub base_url: String,
    pub requires_credential: bool,
}

impl ProviderSelection {
    pub fn is_local(&self) -> bool {
        !self.requires_credential
    }

    /// Same provider, different model.
    pub fn with_model(&self, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..self.clone()
        }
    }
}

/// Selects a provider per purpose, honoring overrides and the allow-list.
pub struct ProviderRouter {
    catalog: ProviderCatalog,
    env: Arc<dyn Environment>,
    probe: Arc<dyn ReachabilityProbe>,
    config: RoutingConfig,
}

impl fmt::Debug for ProviderRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRouter")
            .field("config", &self.config)
            .finish()
    }
}

impl ProviderRouter {
    pub fn new(
        catalog: ProviderCatalog,
        env: Arc<dyn Environment>,
        probe: Arc<dyn ReachabilityProbe>,
        config: RoutingConfig,
    ) -> Self {
        Self {
            catalog,
            env,
            probe,
            config,
        }
    }

    pub fn catalog(&self) -> &ProviderCatalog {
        &self.catalog
    }

    pub fn environment(&self) -> &Arc<dyn Environment> {
        &self.env
    }

    /// Return the first available provider for `purpose`.
    pub async fn select(&self, purpose: &Purpose) -> Result<ProviderSelection> {
        let mut skipped: Vec<String> = Vec::new();

        if let Some(forced) = self.config.forced_provider.as_deref() {
            match self.check_named(forced).await {
                Ok(spec) => {
                    let selection = self.selection(spec, None);
                    tracing::debug!(
                        purpose = %purpose,
                        provider = %selection.name,
                        model = %selection.model,
                        "selected forced provider"
                    );
                    return Ok(selection);
                }
                Err(reason) if self.config.force => {
                    tracing::warn!(provider = forced, %reason, "forced provider unavailable");
                    return Err(RelayError::NoProviderAvailable {
                        purpose: purpose.to_string(),
                        detail: format!("forced provider '{forced}' unavailable: {reason}"),
                    });
                }
                Err(reason) => {
                    tracing::debug!(provider = forced, %reason, "preferred provider skipped");
                    skipped.push(format!("{forced}: {reason}"));
                }
            }
        }

        for name in purpose.priority() {
            if self
                .config
                .forced_provider
                .as_deref()
                .is_some_and(|f| f.eq_ignore_ascii_case(name))
            {
                continue;
            }
            match self.check_named(name).await {
                Ok(spec) => {
                    let selection = self.selection(spec, None);
                    tracing::debug!(
                        purpose = %purpose,
                        provider = %selection.name,
                        model = %selection.model,
                        skipped = skipped.len(),
                        "selected provider"
                    );
                    return Ok(selection);
                }
                Err(reason) => skipped.push(format!("{name}: {reason}")),
            }
        }

        Err(RelayError::NoProviderAvailable {
            purpose: purpose.to_string(),
            detail: if skipped.is_empty() {
                "no candidates".to_string()
            } else {
                skipped.join("; ")
            },
        })
    }

    /// Resolve a provider by name, checking availability.
    ///
    /// Used for per-request overrides and for the cloud fallback hop.
    pub async fn resolve(
        &self,
        name: &str,
        model_override: Option<&str>,
    ) -> Result<ProviderSelection> {
        match self.check_named(name).await {
            Ok(spec) => Ok(self.selection(spec, model_override)),
            Err(reason) => Err(RelayError::NoProviderAvailable {
                purpose: name.to_string(),
                detail: reason,
            }),
        }
    }

    /// Look up `name` and check it is allow-listed and available.
    async fn check_named(&self, name: &str) -> std::result::Result<&ProviderSpec, String> {
        let spec = self
            .catalog
            .get(name)
            .ok_or_else(|| "not in catalog".to_string())?;
        if !self.config.allows(spec.name) {
            return Err("not allow-listed".to_string());
        }
        self.availability(spec).await?;
        Ok(spec)
    }

    async fn availability(&self, spec: &ProviderSpec) -> std::result::Result<(), String> {
        if spec.requires_credential {
            return match self.env.var(spec.credential_env) {
                Some(_) => Ok(()),
                None => Err(format!("{} not set", spec.credential_env)),
            };
        }

        let forced = self
            .config
            .forced_provider
            .as_deref()
            .is_some_and(|f| f.eq_ignore_ascii_case(spec.name));
        if !self.config.local_enabled && !forced {
            return Err("local providers disabled".to_string());
        }

        let base_url = self.base_url(spec);
        if self.probe.reachable(&base_url).await {
            Ok(())
        } else {
            Err(format!("unreachable at {base_url}"))
        }
    }

    fn base_url(&self, spec: &ProviderSpec) -> String {
        self.env
            .var(spec.base_url_env)
            .unwrap_or_else(|| spec.default_base_url.to_string())
    }

    fn selection(&self, spec: &ProviderSpec, model_override: Option<&str>) -> ProviderSelection {
        let model = model_override
            .map(str::to_string)
            .or_else(|| self.env.var(spec.model_env))
            .unwrap_or_else(|| spec.default_model.to_string());
        ProviderSelection {
            name: spec.name.to_string(),
            model,
            credential_env_key: spec.credential_env.to_string(),
            base_url_env_key: spec.base_url_env.to_string(),
            default_base_url: spec.default_base_url.to_string(),
            base_url: self.base_url(spec),
            requires_credential: spec.requires_credential,
        }
    }
}
