//! Cheap reachability checks for local model hosts.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// Decides whether a base URL currently accepts connections.
///
/// Implementations must be inexpensive and must never error: an unreachable
/// host is simply `false`.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn reachable(&self, base_url: &str) -> bool;
}

/// Single TCP connect attempt bounded by a timeout.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Extract `host:port` from a base URL, using the scheme's default port.
    fn socket_addr(base_url: &str) -> Option<String> {
        let url = reqwest::Url::parse(base_url).ok()?;
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        Some(format!("{host}:{port}"))
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(1500))
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn reachable(&self, base_url: &str) -> bool {
        let Some(addr) = Self::socket_addr(base_url) else {
            tracing::debug!(base_url, "unparsable base url, treating as unreachable");
            return false;
        };
        match tokio::time::timeout(self.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!(%addr, error = %e, "reachability probe refused");
                false
            }
            Err(_) => {
                tracing::debug!(%addr, timeout = ?self.timeout, "reachability probe timed out");
                false
            }
        }
    }
}

/// A probe with a fixed answer, for tests and for wiring without a network.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub bool);

#[async_trait]
impl ReachabilityProbe for StaticProbe {
    async fn reachable(&self, _base_url: &str) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_addr_default_ports() {
        assert_eq!(
            TcpProbe::socket_addr("http://localhost:11434").as_deref(),
            Some("localhost:11434")
        );
        assert_eq!(
            TcpProbe::socket_addr("https://api.openai.com").as_deref(),
            Some("api.openai.com:443")
        );
        assert_eq!(
            TcpProbe::socket_addr("http://10.1.2.3/api").as_deref(),
            Some("10.1.2.3:80")
        );
        assert!(TcpProbe::socket_addr("not a url").is_none());
    }

    #[tokio::test]
    async fn test_probe_listening_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpProbe::new(Duration::from_millis(500));
        assert!(probe.reachable(&format!("http://127.0.0.1:{port}")).await);
    }

    #[tokio::test]
    async fn test_probe_refused_is_false_not_error() {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let probe = TcpProbe::new(Duration::from_millis(500));
        assert!(!probe.reachable(&format!("http://127.0.0.1:{port}")).await);
    }

    #[tokio::test]
    async fn test_probe_garbage_url() {
        assert!(!TcpProbe::default().reachable("::::").await);
    }
}
