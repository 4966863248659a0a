//! One-stop wiring of router, invoker, store, publisher, and streamer.
//!
//! [`Relay`] is constructed once and shared. Everything it owns is behind an
//! `Arc`, so cloning the handles it hands out is cheap.

use crate::artifact::SessionStore;
use crate::backend::{ClientFactory, HttpClientFactory};
use crate::breaker::CircuitBreaker;
use crate::clock::{Clock, SystemClock};
use crate::config::{Environment, ProcessEnv, RelayConfig};
use crate::error::Result;
use crate::invoker::{InvocationOutcome, InvocationRequest, ResilientInvoker};
use crate::provider::{ProviderCatalog, ProviderRouter, ReachabilityProbe, TcpProbe};
use crate::publisher::{ArtifactPublisher, GenerationTask};
use crate::streamer::{ArtifactStreamer, StreamFrame};
use futures::stream::BoxStream;
use reqwest::Client;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// The assembled relay.
///
/// # Example
///
/// ```no_run
/// use llm_relay::{InvocationRequest, Purpose, Relay};
/// use llm_relay::backend::ChatMessage;
///
/// # async fn demo() -> llm_relay::Result<()> {
/// let relay = Relay::from_env()?;
/// let request = InvocationRequest::new(Purpose::Conversation, vec![ChatMessage::user("hi")]);
/// let answer = relay.invoker().invoke(&request).await?;
/// println!("{} via {}", answer.text, answer.provider);
/// # Ok(())
/// # }
/// ```
pub struct Relay {
    config: RelayConfig,
    invoker: Arc<ResilientInvoker>,
    store: Arc<SessionStore>,
    publisher: ArtifactPublisher,
    streamer: ArtifactStreamer,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("breaker", &self.invoker.breaker().phase())
            .field("store", &self.store)
            .field("active_streams", &self.streamer.active_streams())
            .finish()
    }
}

impl Relay {
    pub fn builder(config: RelayConfig) -> RelayBuilder {
        RelayBuilder {
            config,
            env: None,
            probe: None,
            clock: None,
            catalog: None,
            factory: None,
            http: None,
        }
    }

    /// Configuration and credentials from the process environment.
    pub fn from_env() -> Result<Self> {
        let env: Arc<dyn Environment> = Arc::new(ProcessEnv);
        let config = RelayConfig::from_env(env.as_ref())?;
        Self::builder(config).env(env).build()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn invoker(&self) -> &Arc<ResilientInvoker> {
        &self.invoker
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn publisher(&self) -> &ArtifactPublisher {
        &self.publisher
    }

    pub fn streamer(&self) -> &ArtifactStreamer {
        &self.streamer
    }

    /// See [`ResilientInvoker::run`].
    pub async fn run(&self, request: &InvocationRequest) -> Result<InvocationOutcome> {
        self.invoker.run(request).await
    }

    pub fn create_session(&self) -> String {
        self.store.create_session()
    }

    /// See [`ArtifactPublisher::schedule`].
    pub fn schedule(
        &self,
        session_id: &str,
        task: Box<dyn GenerationTask>,
    ) -> Result<JoinHandle<()>> {
        self.publisher.schedule(session_id, task)
    }

    /// See [`ArtifactStreamer::open`].
    pub fn stream(
        &self,
        session_id: &str,
        start_revision: u64,
    ) -> Result<BoxStream<'static, StreamFrame>> {
        self.streamer.open(session_id, start_revision)
    }
}

/// Builder for [`Relay`].
pub struct RelayBuilder {
    config: RelayConfig,
    env: Option<Arc<dyn Environment>>,
    probe: Option<Arc<dyn ReachabilityProbe>>,
    clock: Option<Arc<dyn Clock>>,
    catalog: Option<ProviderCatalog>,
    factory: Option<Arc<dyn ClientFactory>>,
    http: Option<Client>,
}

impl RelayBuilder {
    /// Where credentials and base URLs are read. Default: the process
    /// environment.
    pub fn env(mut self, env: Arc<dyn Environment>) -> Self {
        self.env = Some(env);
        self
    }

    /// Reachability check for local providers. Default: [`TcpProbe`] with
    /// the configured probe timeout.
    pub fn probe(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Time source for the breaker. Default: [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn catalog(mut self, catalog: ProviderCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Replace the HTTP client factory entirely.
    pub fn factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Use this `reqwest::Client` in the default factory. Its own timeout
    /// applies instead of `request_timeout`.
    pub fn http_client(mut self, client: Client) -> Self {
        self.http = Some(client);
        self
    }

    pub fn build(self) -> Result<Relay> {
        let config = self.config;
        config.validate()?;

        let env = self.env.unwrap_or_else(|| Arc::new(ProcessEnv));
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(TcpProbe::new(config.routing.probe_timeout)));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let factory: Arc<dyn ClientFactory> = match (self.factory, self.http) {
            (Some(factory), _) => factory,
            (None, Some(http)) => Arc::new(HttpClientFactory::with_client(env.clone(), http)),
            (None, None) => Arc::new(HttpClientFactory::new(env.clone(), config.request_timeout)?),
        };

        let router = ProviderRouter::new(
            self.catalog.unwrap_or_default(),
            env,
            probe,
            config.routing.clone(),
        );
        let breaker = CircuitBreaker::new(config.breaker.clone(), clock);
        let invoker = Arc::new(ResilientInvoker::new(
            Arc::new(router),
            factory,
            Arc::new(breaker),
            config.fallback.clone(),
        ));
        let store = Arc::new(SessionStore::new(
            config.stream.queue_capacity,
            config.diff_max_lines,
        ));
        let publisher = ArtifactPublisher::new(store.clone(), invoker.clone());
        let streamer = ArtifactStreamer::new(store.clone(), config.stream.clone());

        tracing::info!(
            local_enabled = config.routing.local_enabled,
            forced = config.routing.forced_provider.as_deref().unwrap_or("-"),
            threshold = config.breaker.threshold,
            "relay ready"
        );
        Ok(Relay {
            config,
            invoker,
            store,
            publisher,
            streamer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{QueuePayload, StatusPhase};
    use crate::backend::{ChatMessage, ScriptedClient, ScriptedFactory};
    use crate::config::{BreakerConfig, MapEnv, RoutingConfig};
    use crate::error::RelayError;
    use crate::provider::{Purpose, StaticProbe};
    use crate::publisher::FileSetTask;
    use futures::StreamExt;
    use std::time::Duration;

    fn relay(local: ScriptedClient) -> Relay {
        let config = RelayConfig::default().with_routing(RoutingConfig {
            local_enabled: true,
            ..RoutingConfig::default()
        });
        let factory = ScriptedFactory::new().with_client("ollama", Arc::new(local));
        Relay::builder(config)
            .env(Arc::new(MapEnv::new()))
            .probe(Arc::new(StaticProbe(true)))
            .factory(Arc::new(factory))
            .build()
            .unwrap()
    }

    fn request() -> InvocationRequest {
        InvocationRequest::new(Purpose::Generation, vec![ChatMessage::user("go")])
    }

    #[tokio::test]
    async fn test_run_through_local_provider() {
        let relay = relay(ScriptedClient::fixed("local", "hello"));
        match relay.run(&request()).await.unwrap() {
            InvocationOutcome::Text(answer) => {
                assert_eq!(answer.text, "hello");
                assert_eq!(answer.provider, "ollama");
            }
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_build() {
        let config = RelayConfig::default().with_breaker(BreakerConfig {
            threshold: 0,
            ..BreakerConfig::default()
        });
        let err = Relay::builder(config)
            .env(Arc::new(MapEnv::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_default_factory_builds_without_network() {
        let relay = Relay::builder(RelayConfig::default())
            .env(Arc::new(MapEnv::new()))
            .build()
            .unwrap();
        // nothing enabled, nothing credentialed
        let err = relay.invoker().invoke(&request()).await.unwrap_err();
        assert!(matches!(err, RelayError::NoProviderAvailable { .. }));
    }

    #[tokio::test]
    async fn test_schedule_and_stream_end_to_end() {
        let answer = r#"{"summary": "one file", "files": [{"path": "src/main.rs", "content": "fn main() {}"}]}"#;
        let relay = relay(ScriptedClient::new("local").then_text(answer));
        let id = relay.create_session();
        let mut frames = relay.stream(&id, 0).unwrap();
        assert!(matches!(frames.next().await, Some(StreamFrame::Snapshot { revision: 0, .. })));

        let _worker = relay
            .schedule(&id, Box::new(FileSetTask::new(request())))
            .unwrap();

        let mut paths = Vec::new();
        let done = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(frame) = frames.next().await {
                let StreamFrame::Updates { updates, .. } = frame else {
                    continue;
                };
                for entry in updates {
                    match entry.payload {
                        QueuePayload::Artifact { artifact } => paths.push(artifact.path),
                        QueuePayload::Status(s) if s.phase == StatusPhase::Completed => return true,
                        QueuePayload::Status(_) => {}
                    }
                }
            }
            false
        })
        .await
        .unwrap();

        assert!(done);
        assert_eq!(paths, vec!["src/main.rs", "bundle.json"]);
        assert_eq!(relay.store().revision(&id).unwrap(), 2);
    }
}
