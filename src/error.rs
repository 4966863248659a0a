use std::time::Duration;
use thiserror::Error;

/// Errors produced by the relay and its components.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The router exhausted every candidate for a purpose, or a forced
    /// provider was unavailable.
    #[error("no provider available for '{purpose}': {detail}")]
    NoProviderAvailable {
        /// Purpose tag (or provider name for named resolution).
        purpose: String,
        /// Which candidates were considered and why they were skipped.
        detail: String,
    },

    /// The circuit breaker short-circuited the call. No network I/O happened.
    #[error("circuit open; next probe admissible in {retry_in:?}")]
    CircuitOpen {
        /// Time until the next probe could be admitted.
        retry_in: Duration,
    },

    /// Connection refused, DNS failure, timeout, or a body that broke off.
    #[error("transport failure talking to {url}: {message}")]
    Transport { url: String, message: String },

    /// Non-success HTTP status returned by a provider.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The provider answered, but with nothing usable.
    #[error("provider '{provider}' returned an empty response")]
    EmptyResponse { provider: String },

    /// Structured generation output could not be parsed.
    ///
    /// Callers substitute a deterministic fallback payload instead of
    /// propagating this.
    #[error("malformed payload: {reason}")]
    MalformedPayload { reason: String },

    /// A token stream failed after it had started yielding. Never retried.
    #[error("stream interrupted after {tokens} tokens: {message}")]
    StreamInterrupted { tokens: usize, message: String },

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The session does not exist (never created, or discarded).
    #[error("unknown session '{0}'")]
    SessionNotFound(String),

    /// A generation task is already writing to this session.
    #[error("session '{0}' already has an active generation task")]
    SessionBusy(String),

    /// Invalid configuration detected at load or build time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Whether the fallback chain may retry after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RelayError::Transport { .. }
                | RelayError::HttpError { .. }
                | RelayError::EmptyResponse { .. }
        )
    }

    /// Whether this is the breaker's "we chose not to try" error.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, RelayError::CircuitOpen { .. })
    }

    /// Text suitable for a status artifact shown to an end user.
    pub fn user_message(&self) -> String {
        match self {
            RelayError::NoProviderAvailable { .. } => {
                "No language model provider is currently available.".to_string()
            }
            RelayError::CircuitOpen { retry_in } => format!(
                "The model service is paused after repeated failures. Try again in about {}s.",
                retry_in.as_secs().max(1)
            ),
            RelayError::Transport { .. } | RelayError::HttpError { .. } => {
                "The model service could not be reached.".to_string()
            }
            RelayError::EmptyResponse { .. } => "The model returned an empty answer.".to_string(),
            RelayError::StreamInterrupted { .. } => {
                "Generation stopped partway through. Partial results were kept.".to_string()
            }
            RelayError::MalformedPayload { .. } => {
                "The model answer could not be understood.".to_string()
            }
            RelayError::SessionBusy(_) => {
                "Another generation is already running for this session.".to_string()
            }
            _ => "Generation failed unexpectedly.".to_string(),
        }
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(RelayError::Transport {
            url: "http://x".into(),
            message: "refused".into()
        }
        .is_recoverable());
        assert!(RelayError::HttpError {
            status: 503,
            body: String::new()
        }
        .is_recoverable());
        assert!(RelayError::EmptyResponse {
            provider: "ollama".into()
        }
        .is_recoverable());

        assert!(!RelayError::CircuitOpen {
            retry_in: Duration::from_secs(3)
        }
        .is_recoverable());
        assert!(!RelayError::StreamInterrupted {
            tokens: 4,
            message: "reset".into()
        }
        .is_recoverable());
        assert!(!RelayError::InvalidConfig("x".into()).is_recoverable());
    }

    #[test]
    fn test_circuit_open_is_distinct_from_transport() {
        let open = RelayError::CircuitOpen {
            retry_in: Duration::from_secs(1),
        };
        let transport = RelayError::Transport {
            url: "http://x".into(),
            message: "refused".into(),
        };
        assert!(open.is_circuit_open());
        assert!(!transport.is_circuit_open());
    }

    #[test]
    fn test_user_message_hides_internals() {
        let err = RelayError::Transport {
            url: "http://10.0.0.3:11434".into(),
            message: "connection refused".into(),
        };
        let msg = err.user_message();
        assert!(!msg.contains("10.0.0.3"));
        assert!(!msg.contains("refused"));
    }

    #[test]
    fn test_from_anyhow() {
        let err: RelayError = anyhow::anyhow!("task blew up").into();
        assert!(matches!(err, RelayError::Other(ref m) if m == "task blew up"));
    }
}
