//! Relay configuration and environment access.
//!
//! [`RelayConfig`] groups every tunable knob. It can be built in code with
//! the `with_*` methods or loaded from environment variables with
//! [`RelayConfig::from_env`]. Environment reads go through the
//! [`Environment`] trait so tests can supply a [`MapEnv`].

use crate::error::{RelayError, Result};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Read-only view of environment variables.
pub trait Environment: Send + Sync {
    /// Look up a variable. Empty values are treated as unset.
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl Environment for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

/// An in-memory environment.
///
/// # Example
///
/// ```
/// use llm_relay::config::{Environment, MapEnv};
///
/// let env = MapEnv::new().with("OPENAI_API_KEY", "sk-test");
/// assert_eq!(env.var("OPENAI_API_KEY").as_deref(), Some("sk-test"));
/// assert!(env.var("MISSING").is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }
}

impl Environment for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars
            .get(key)
            .filter(|v| !v.trim().is_empty())
            .cloned()
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit. Default: 2.
    pub threshold: u32,
    /// Time the circuit stays open before a probe may be admitted. Default: 60s.
    pub cooldown: Duration,
    /// Minimum gap between two probes. Must be `<= cooldown`. Default: 15s.
    pub probe_interval: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 2,
            cooldown: Duration::from_secs(60),
            probe_interval: Duration::from_secs(15),
        }
    }
}

/// Provider selection policy.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Allow credential-free (local) providers. Default: `false`.
    pub local_enabled: bool,
    /// Provider tried before the purpose's priority list.
    pub forced_provider: Option<String>,
    /// If set, an unavailable forced provider is a hard failure.
    pub force: bool,
    /// Restrict candidates to these names. `None` allows all.
    pub allow_list: Option<Vec<String>>,
    /// Timeout for the TCP reachability probe of local providers. Default: 1.5s.
    pub probe_timeout: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            local_enabled: false,
            forced_provider: None,
            force: false,
            allow_list: None,
            probe_timeout: Duration::from_millis(1500),
        }
    }
}

impl RoutingConfig {
    /// Whether `name` passes the allow-list.
    pub fn allows(&self, name: &str) -> bool {
        self.allow_list
            .as_ref()
            .map_or(true, |list| list.iter().any(|n| n.eq_ignore_ascii_case(name)))
    }
}

/// Hops tried after the selected provider fails.
#[derive(Debug, Clone, Default)]
pub struct FallbackConfig {
    /// Model retried on the same local host before leaving it.
    pub alternate_local_model: Option<String>,
    /// Cloud provider used as the last hop.
    pub cloud_provider: Option<String>,
    /// Model for the cloud hop. `None` uses the provider's default.
    pub cloud_model: Option<String>,
}

/// Artifact streaming cadence.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Quiet time after which a heartbeat frame is sent. Default: 15s.
    pub heartbeat_interval: Duration,
    /// Upper bound on a single wait for new entries. Default: 500ms.
    pub poll_interval: Duration,
    /// Queue entries retained per session. Default: 256.
    pub queue_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            poll_interval: Duration::from_millis(500),
            queue_capacity: 256,
        }
    }
}

/// Top-level relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub breaker: BreakerConfig,
    pub routing: RoutingConfig,
    pub fallback: FallbackConfig,
    pub stream: StreamConfig,
    /// Maximum lines kept in an artifact diff summary. Default: 40.
    pub diff_max_lines: usize,
    /// HTTP request timeout for provider calls. Default: 120s.
    pub request_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            routing: RoutingConfig::default(),
            fallback: FallbackConfig::default(),
            stream: StreamConfig::default(),
            diff_max_lines: 40,
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl RelayConfig {
    /// Load from an [`Environment`], falling back to defaults per key.
    pub fn from_env(env: &dyn Environment) -> Result<Self> {
        let defaults = Self::default();

        let breaker = BreakerConfig {
            threshold: parse_or(env, "RELAY_BREAKER_THRESHOLD", defaults.breaker.threshold)?,
            cooldown: secs_or(env, "RELAY_BREAKER_COOLDOWN_SECS", defaults.breaker.cooldown)?,
            probe_interval: secs_or(
                env,
                "RELAY_BREAKER_PROBE_SECS",
                defaults.breaker.probe_interval,
            )?,
        };

        let routing = RoutingConfig {
            local_enabled: flag_or(env, "RELAY_LOCAL_ENABLED", false)?,
            forced_provider: env.var("RELAY_PROVIDER").map(|p| p.trim().to_lowercase()),
            force: flag_or(env, "RELAY_PROVIDER_FORCE", false)?,
            allow_list: env.var("RELAY_PROVIDER_ALLOWLIST").map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            }),
            probe_timeout: millis_or(
                env,
                "RELAY_PROBE_TIMEOUT_MS",
                defaults.routing.probe_timeout,
            )?,
        };

        let fallback = FallbackConfig {
            alternate_local_model: env.var("RELAY_LOCAL_ALT_MODEL"),
            cloud_provider: env
                .var("RELAY_CLOUD_FALLBACK_PROVIDER")
                .map(|p| p.trim().to_lowercase()),
            cloud_model: env.var("RELAY_CLOUD_FALLBACK_MODEL"),
        };

        let stream = StreamConfig {
            heartbeat_interval: secs_or(
                env,
                "RELAY_HEARTBEAT_SECS",
                defaults.stream.heartbeat_interval,
            )?,
            poll_interval: millis_or(env, "RELAY_POLL_MS", defaults.stream.poll_interval)?,
            queue_capacity: parse_or(env, "RELAY_QUEUE_CAPACITY", defaults.stream.queue_capacity)?,
        };

        let config = Self {
            breaker,
            routing,
            fallback,
            stream,
            diff_max_lines: parse_or(env, "RELAY_DIFF_MAX_LINES", defaults.diff_max_lines)?,
            request_timeout: secs_or(env, "RELAY_REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.breaker.threshold == 0 {
            return Err(RelayError::InvalidConfig(
                "breaker threshold must be at least 1".into(),
            ));
        }
        if self.breaker.probe_interval > self.breaker.cooldown {
            return Err(RelayError::InvalidConfig(format!(
                "breaker probe interval ({:?}) exceeds cooldown ({:?})",
                self.breaker.probe_interval, self.breaker.cooldown
            )));
        }
        if self.stream.poll_interval.is_zero() {
            return Err(RelayError::InvalidConfig(
                "poll interval must be greater than zero".into(),
            ));
        }
        if self.stream.poll_interval >= self.stream.heartbeat_interval {
            return Err(RelayError::InvalidConfig(format!(
                "poll interval ({:?}) must be below heartbeat interval ({:?})",
                self.stream.poll_interval, self.stream.heartbeat_interval
            )));
        }
        if self.stream.queue_capacity == 0 {
            return Err(RelayError::InvalidConfig(
                "queue capacity must be at least 1".into(),
            ));
        }
        if self.fallback.cloud_model.is_some() && self.fallback.cloud_provider.is_none() {
            return Err(RelayError::InvalidConfig(
                "cloud fallback model set without a cloud fallback provider".into(),
            ));
        }
        Ok(())
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackConfig) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }
}

fn parse_or<T: FromStr>(env: &dyn Environment, key: &str, default: T) -> Result<T> {
    match env.var(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| RelayError::InvalidConfig(format!("{key}: cannot parse '{raw}'"))),
    }
}

fn secs_or(env: &dyn Environment, key: &str, default: Duration) -> Result<Duration> {
    parse_or(env, key, default.as_secs()).map(Duration::from_secs)
}

fn millis_or(env: &dyn Environment, key: &str, default: Duration) -> Result<Duration> {
    parse_or(env, key, default.as_millis() as u64).map(Duration::from_millis)
}

fn flag_or(env: &dyn Environment, key: &str, default: bool) -> Result<bool> {
    match env.var(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(RelayError::InvalidConfig(format!(
                "{key}: expected a boolean, got '{raw}'"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_env() {
        let config = RelayConfig::from_env(&MapEnv::new()).unwrap();
        assert_eq!(config.breaker.threshold, 2);
        assert_eq!(config.breaker.cooldown, Duration::from_secs(60));
        assert_eq!(config.breaker.probe_interval, Duration::from_secs(15));
        assert!(!config.routing.local_enabled);
        assert!(config.routing.forced_provider.is_none());
        assert!(config.routing.allow_list.is_none());
        assert_eq!(config.stream.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.diff_max_lines, 40);
    }

    #[test]
    fn test_env_overrides() {
        let env = MapEnv::new()
            .with("RELAY_BREAKER_THRESHOLD", "4")
            .with("RELAY_BREAKER_COOLDOWN_SECS", "30")
            .with("RELAY_BREAKER_PROBE_SECS", "10")
            .with("RELAY_LOCAL_ENABLED", "yes")
            .with("RELAY_PROVIDER", " Ollama ")
            .with("RELAY_PROVIDER_FORCE", "1")
            .with("RELAY_PROVIDER_ALLOWLIST", "openai, ollama,,")
            .with("RELAY_LOCAL_ALT_MODEL", "qwen2.5:7b")
            .with("RELAY_CLOUD_FALLBACK_PROVIDER", "openai")
            .with("RELAY_CLOUD_FALLBACK_MODEL", "gpt-4o-mini")
            .with("RELAY_POLL_MS", "250");

        let config = RelayConfig::from_env(&env).unwrap();
        assert_eq!(config.breaker.threshold, 4);
        assert_eq!(config.breaker.cooldown, Duration::from_secs(30));
        assert!(config.routing.local_enabled);
        assert_eq!(config.routing.forced_provider.as_deref(), Some("ollama"));
        assert!(config.routing.force);
        assert_eq!(
            config.routing.allow_list,
            Some(vec!["openai".to_string(), "ollama".to_string()])
        );
        assert_eq!(
            config.fallback.alternate_local_model.as_deref(),
            Some("qwen2.5:7b")
        );
        assert_eq!(config.fallback.cloud_provider.as_deref(), Some("openai"));
        assert_eq!(config.stream.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_probe_interval_longer_than_cooldown_rejected() {
        let env = MapEnv::new()
            .with("RELAY_BREAKER_COOLDOWN_SECS", "5")
            .with("RELAY_BREAKER_PROBE_SECS", "10");
        let err = RelayConfig::from_env(&env).unwrap_err();
        assert!(matches!(err, RelayError::InvalidConfig(ref m) if m.contains("probe interval")));
    }

    #[test]
    fn test_poll_not_below_heartbeat_rejected() {
        let env = MapEnv::new()
            .with("RELAY_HEARTBEAT_SECS", "1")
            .with("RELAY_POLL_MS", "1000");
        assert!(RelayConfig::from_env(&env).is_err());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let env = MapEnv::new().with("RELAY_POLL_MS", "0");
        let err = RelayConfig::from_env(&env).unwrap_err();
        assert!(matches!(err, RelayError::InvalidConfig(ref m) if m.contains("greater than zero")));
    }

    #[test]
    fn test_unparsable_values_rejected() {
        let env = MapEnv::new().with("RELAY_BREAKER_THRESHOLD", "two");
        assert!(matches!(
            RelayConfig::from_env(&env),
            Err(RelayError::InvalidConfig(_))
        ));

        let env = MapEnv::new().with("RELAY_LOCAL_ENABLED", "maybe");
        assert!(RelayConfig::from_env(&env).is_err());
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let config = RelayConfig::default().with_breaker(BreakerConfig {
            threshold: 0,
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cloud_model_requires_provider() {
        let env = MapEnv::new().with("RELAY_CLOUD_FALLBACK_MODEL", "gpt-4o");
        assert!(RelayConfig::from_env(&env).is_err());
    }

    #[test]
    fn test_allow_list_is_case_insensitive() {
        let routing = RoutingConfig {
            allow_list: Some(vec!["openai".into()]),
            ..Default::default()
        };
        assert!(routing.allows("OpenAI"));
        assert!(!routing.allows("ollama"));
        assert!(RoutingConfig::default().allows("anything"));
    }

    #[test]
    fn test_blank_values_are_unset() {
        let env = MapEnv::new().with("RELAY_PROVIDER", "   ");
        let config = RelayConfig::from_env(&env).unwrap();
        assert!(config.routing.forced_provider.is_none());
    }
}
