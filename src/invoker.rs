//! Breaker-gated invocation with a multi-hop fallback chain.
//!
//! ```text
//! admit ──► select ──► primary call ──ok──► record_success
//!   │                      │
//!   │                  recoverable failure (and not a probe)
//!   │                      ▼
//!   │          alternate local model ──► cloud provider
//!   │                      │ all failed
//!   │                      ▼
//!   │              original error returned
//!   ▼
//! CircuitOpen (no network I/O)
//! ```
//!
//! The invoker never fabricates content: it either proxies a provider answer
//! or fails. A token stream is gated the same way before it opens; once it
//! has started, failures are surfaced to the consumer and never retried.

use crate::backend::{
    ChatMessage, ClientFactory, GenerationOptions, LlmRequest, ProviderClient, TokenStream,
};
use crate::breaker::{Admission, CircuitBreaker};
use crate::config::FallbackConfig;
use crate::error::{RelayError, Result};
use crate::provider::{ProviderRouter, ProviderSelection, Purpose};
use futures::StreamExt;
use std::sync::Arc;

/// A request from a collaborator.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub purpose: Purpose,
    /// Use this provider instead of purpose-based selection.
    pub provider_override: Option<String>,
    pub model_override: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub options: GenerationOptions,
    /// Ask [`ResilientInvoker::run`] for a token stream.
    pub streaming: bool,
}

impl InvocationRequest {
    pub fn new(purpose: Purpose, messages: Vec<ChatMessage>) -> Self {
        Self {
            purpose,
            provider_override: None,
            model_override: None,
            messages,
            options: GenerationOptions::default(),
            streaming: false,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider_override = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }
}

/// A completed blocking invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub text: String,
    /// Provider that actually answered (may be a fallback hop).
    pub provider: String,
    pub model: String,
}

/// An open token stream plus where it comes from.
pub struct InvocationStream {
    pub tokens: TokenStream,
    pub provider: String,
    pub model: String,
}

impl std::fmt::Debug for InvocationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationStream")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// Result of [`ResilientInvoker::run`].
#[derive(Debug)]
pub enum InvocationOutcome {
    Text(Invocation),
    Stream(InvocationStream),
}

/// Routes, gates, and retries provider calls.
///
/// Owns its breaker; share one invoker to share breaker state.
pub struct ResilientInvoker {
    router: Arc<ProviderRouter>,
    factory: Arc<dyn ClientFactory>,
    breaker: Arc<CircuitBreaker>,
    fallback: FallbackConfig,
}

impl std::fmt::Debug for ResilientInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientInvoker")
            .field("router", &self.router)
            .field("breaker", &self.breaker)
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl ResilientInvoker {
    pub fn new(
        router: Arc<ProviderRouter>,
        factory: Arc<dyn ClientFactory>,
        breaker: Arc<CircuitBreaker>,
        fallback: FallbackConfig,
    ) -> Self {
        Self {
            router,
            factory,
            breaker,
            fallback,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn router(&self) -> &ProviderRouter {
        &self.router
    }

    /// Dispatch on `request.streaming`.
    pub async fn run(&self, request: &InvocationRequest) -> Result<InvocationOutcome> {
        if request.streaming {
            self.invoke_stream(request).await.map(InvocationOutcome::Stream)
        } else {
            self.invoke(request).await.map(InvocationOutcome::Text)
        }
    }

    /// Blocking invocation.
    pub async fn invoke(&self, request: &InvocationRequest) -> Result<Invocation> {
        let admission = self.breaker.admit()?;
        let selection = self.select(request).await?;
        let client = self.client(&selection)?;

        let err = match Self::complete_with(client.as_ref(), &selection, request).await {
            Ok(text) => {
                self.breaker.record_success();
                return Ok(Invocation {
                    text,
                    provider: selection.name,
                    model: selection.model,
                });
            }
            Err(e) => e,
        };
        self.breaker.record_failure();
        let probe = admission == Admission::Probe;
        tracing::warn!(
            provider = %selection.name,
            model = %selection.model,
            error = %err,
            probe,
            "primary provider call failed"
        );
        if probe || !err.is_recoverable() {
            return Err(err);
        }

        for hop in self.fallback_hops(&selection).await {
            match self.complete_on(&hop, request).await {
                Ok(text) => {
                    tracing::info!(
                        provider = %hop.name,
                        model = %hop.model,
                        "fallback hop succeeded"
                    );
                    self.breaker.record_success();
                    return Ok(Invocation {
                        text,
                        provider: hop.name,
                        model: hop.model,
                    });
                }
                Err(e) => {
                    tracing::warn!(provider = %hop.name, model = %hop.model, error = %e, "fallback hop failed");
                }
            }
        }
        Err(err)
    }

    /// Open a token stream.
    ///
    /// The breaker outcome is recorded when the stream finishes: a clean end
    /// is a success, an error item is a failure. Dropping the stream early
    /// records nothing.
    pub async fn invoke_stream(&self, request: &InvocationRequest) -> Result<InvocationStream> {
        let admission = self.breaker.admit()?;
        let selection = self.select(request).await?;
        let client = self.client(&selection)?;

        let err = match Self::open_with(client.as_ref(), &selection, request).await {
            Ok(tokens) => return Ok(self.settle(tokens, selection)),
            Err(e) => e,
        };
        self.breaker.record_failure();
        let probe = admission == Admission::Probe;
        tracing::warn!(
            provider = %selection.name,
            model = %selection.model,
            error = %err,
            probe,
            "primary stream failed to open"
        );
        if probe || !err.is_recoverable() {
            return Err(err);
        }

        for hop in self.fallback_hops(&selection).await {
            match self.open_on(&hop, request).await {
                Ok(tokens) => {
                    tracing::info!(provider = %hop.name, model = %hop.model, "fallback stream opened");
                    return Ok(self.settle(tokens, hop));
                }
                Err(e) => {
                    tracing::warn!(provider = %hop.name, model = %hop.model, error = %e, "fallback stream failed to open");
                }
            }
        }
        Err(err)
    }

    async fn select(&self, request: &InvocationRequest) -> Result<ProviderSelection> {
        let model = request.model_override.as_deref();
        match request.provider_override.as_deref() {
            Some(name) => self.router.resolve(name, model).await,
            None => {
                let selection = self.router.select(&request.purpose).await?;
                Ok(match model {
                    Some(model) => selection.with_model(model),
                    None => selection,
                })
            }
        }
    }

    /// Alternate local model first, then the cloud provider.
    async fn fallback_hops(&self, failed: &ProviderSelection) -> Vec<ProviderSelection> {
        let mut hops = Vec::new();

        if let Some(alt) = self.fallback.alternate_local_model.as_deref() {
            if failed.is_local() && alt != failed.model {
                hops.push(failed.with_model(alt));
            }
        }

        if let Some(cloud) = self.fallback.cloud_provider.as_deref() {
            match self
                .router
                .resolve(cloud, self.fallback.cloud_model.as_deref())
                .await
            {
                Ok(hop) if hop.name == failed.name && hop.model == failed.model => {}
                Ok(hop) => hops.push(hop),
                Err(e) => {
                    tracing::warn!(provider = cloud, error = %e, "cloud fallback unavailable");
                }
            }
        }
        hops
    }

    fn client(&self, selection: &ProviderSelection) -> Result<Arc<dyn ProviderClient>> {
        self.factory.client_for(selection)
    }

    fn llm_request(selection: &ProviderSelection, request: &InvocationRequest) -> LlmRequest {
        LlmRequest {
            model: selection.model.clone(),
            messages: request.messages.clone(),
            options: request.options.clone(),
        }
    }

    async fn complete_on(
        &self,
        selection: &ProviderSelection,
        request: &InvocationRequest,
    ) -> Result<String> {
        let client = self.client(selection)?;
        Self::complete_with(client.as_ref(), selection, request).await
    }

    async fn complete_with(
        client: &dyn ProviderClient,
        selection: &ProviderSelection,
        request: &InvocationRequest,
    ) -> Result<String> {
        let response = client
            .complete(&Self::llm_request(selection, request))
            .await?;
        if response.text.trim().is_empty() {
            return Err(RelayError::EmptyResponse {
                provider: selection.name.clone(),
            });
        }
        Ok(response.text)
    }

    async fn open_on(
        &self,
        selection: &ProviderSelection,
        request: &InvocationRequest,
    ) -> Result<TokenStream> {
        let client = self.client(selection)?;
        Self::open_with(client.as_ref(), selection, request).await
    }

    async fn open_with(
        client: &dyn ProviderClient,
        selection: &ProviderSelection,
        request: &InvocationRequest,
    ) -> Result<TokenStream> {
        client.stream(&Self::llm_request(selection, request)).await
    }

    /// Wrap a token stream so its outcome reaches the breaker.
    fn settle(&self, tokens: TokenStream, selection: ProviderSelection) -> InvocationStream {
        struct Tracked {
            tokens: TokenStream,
            breaker: Arc<CircuitBreaker>,
            provider: String,
            yielded: usize,
        }

        let state = Tracked {
            tokens,
            breaker: self.breaker.clone(),
            provider: selection.name.clone(),
            yielded: 0,
        };
        let tokens = futures::stream::unfold(Some(state), |state| async move {
            let mut st = state?;
            match st.tokens.next().await {
                Some(Ok(token)) => {
                    st.yielded += 1;
                    Some((Ok(token), Some(st)))
                }
                Some(Err(e)) => {
                    st.breaker.record_failure();
                    Some((Err(e), None))
                }
                None if st.yielded == 0 => {
                    st.breaker.record_failure();
                    let err = RelayError::EmptyResponse {
                        provider: st.provider.clone(),
                    };
                    Some((Err(err), None))
                }
                None => {
                    st.breaker.record_success();
                    None
                }
            }
        })
        .boxed();

        InvocationStream {
            tokens,
            provider: selection.name,
            model: selection.model,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ScriptedClient, ScriptedFactory};
    use crate::breaker::BreakerPhase;
    use crate::clock::ManualClock;
    use crate::config::{BreakerConfig, MapEnv, RoutingConfig};
    use crate::provider::{ProviderCatalog, StaticProbe};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        invoker: ResilientInvoker,
        local: Arc<ScriptedClient>,
        cloud: Arc<ScriptedClient>,
        clock: Arc<ManualClock>,
    }

    /// Local provider forced as primary, OpenAI credential present for the
    /// cloud hop.
    fn harness(local: ScriptedClient, cloud: ScriptedClient, fallback: FallbackConfig) -> Harness {
        let env = MapEnv::new().with("OPENAI_API_KEY", "sk-test");
        let routing = RoutingConfig {
            forced_provider: Some("ollama".into()),
            ..RoutingConfig::default()
        };
        let router = ProviderRouter::new(
            ProviderCatalog::builtin(),
            Arc::new(env),
            Arc::new(StaticProbe(true)),
            routing,
        );
        let local = Arc::new(local);
        let cloud = Arc::new(cloud);
        let factory = ScriptedFactory::new()
            .with_client("ollama", local.clone())
            .with_client("openai", cloud.clone());
        let clock = Arc::new(ManualClock::new());
        let breaker = CircuitBreaker::new(BreakerConfig::default(), clock.clone());
        Harness {
            invoker: ResilientInvoker::new(
                Arc::new(router),
                Arc::new(factory),
                Arc::new(breaker),
                fallback,
            ),
            local,
            cloud,
            clock,
        }
    }

    fn full_fallback() -> FallbackConfig {
        FallbackConfig {
            alternate_local_model: Some("qwen2.5:0.5b".into()),
            cloud_provider: Some("openai".into()),
            cloud_model: Some("gpt-4o".into()),
        }
    }

    fn request() -> InvocationRequest {
        InvocationRequest::new(Purpose::Generation, vec![ChatMessage::user("write a haiku")])
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let h = harness(
            ScriptedClient::new("ollama").then_text("an old pond"),
            ScriptedClient::new("openai"),
            FallbackConfig::default(),
        );
        let out = h.invoker.invoke(&request()).await.unwrap();
        assert_eq!(out.text, "an old pond");
        assert_eq!(out.provider, "ollama");
        assert_eq!(out.model, "llama3.2:3b");
    }

    #[tokio::test]
    async fn test_two_failures_open_breaker_and_third_call_skips_network() {
        let h = harness(
            ScriptedClient::new("ollama")
                .then_transport_failure()
                .then_transport_failure()
                .then_text("never reached"),
            ScriptedClient::new("openai"),
            FallbackConfig::default(),
        );

        let first = h.invoker.invoke(&request()).await.unwrap_err();
        assert!(matches!(first, RelayError::Transport { .. }));
        let second = h.invoker.invoke(&request()).await.unwrap_err();
        assert!(matches!(second, RelayError::Transport { .. }));
        assert_eq!(h.invoker.breaker().phase(), BreakerPhase::Open);

        let third = h.invoker.invoke(&request()).await.unwrap_err();
        assert!(third.is_circuit_open());
        assert_eq!(h.local.calls(), 2);
    }

    #[tokio::test]
    async fn test_blank_answer_is_empty_response() {
        let h = harness(
            ScriptedClient::new("ollama").then_text("   "),
            ScriptedClient::new("openai"),
            FallbackConfig::default(),
        );
        let err = h.invoker.invoke(&request()).await.unwrap_err();
        assert!(matches!(err, RelayError::EmptyResponse { ref provider } if provider == "ollama"));
        assert_eq!(h.invoker.breaker().state().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_alternate_local_model_hop() {
        let h = harness(
            ScriptedClient::new("ollama")
                .then_transport_failure()
                .then_text("from the small model"),
            ScriptedClient::new("openai"),
            full_fallback(),
        );
        let out = h.invoker.invoke(&request()).await.unwrap();
        assert_eq!(out.text, "from the small model");
        assert_eq!(out.model, "qwen2.5:0.5b");
        assert_eq!(h.local.models(), vec!["llama3.2:3b", "qwen2.5:0.5b"]);
        assert_eq!(h.cloud.calls(), 0);
        // a hop success counts as a success
        assert_eq!(h.invoker.breaker().state().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_cloud_hop_after_local_hops_fail() {
        let h = harness(
            ScriptedClient::new("ollama")
                .then_transport_failure()
                .then_transport_failure(),
            ScriptedClient::new("openai").then_text("from the cloud"),
            full_fallback(),
        );
        let out = h.invoker.invoke(&request()).await.unwrap();
        assert_eq!(out.text, "from the cloud");
        assert_eq!(out.provider, "openai");
        assert_eq!(out.model, "gpt-4o");
        assert_eq!(h.cloud.models(), vec!["gpt-4o"]);
    }

    #[tokio::test]
    async fn test_exhausted_chain_returns_original_error() {
        let h = harness(
            ScriptedClient::new("ollama")
                .then_transport_failure()
                .then_error(RelayError::HttpError {
                    status: 500,
                    body: "alt".into(),
                }),
            ScriptedClient::new("openai").then_error(RelayError::HttpError {
                status: 503,
                body: "cloud".into(),
            }),
            full_fallback(),
        );
        let err = h.invoker.invoke(&request()).await.unwrap_err();
        match err {
            RelayError::Transport { message, .. } => assert_eq!(message, "connection refused"),
            other => panic!("expected the original transport error, got {other:?}"),
        }
        assert_eq!(h.local.calls(), 2);
        assert_eq!(h.cloud.calls(), 1);
        // only the primary attempt counts against the breaker
        assert_eq!(h.invoker.breaker().state().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_unrecoverable_error_skips_fallback() {
        let h = harness(
            ScriptedClient::new("ollama").then_error(RelayError::Other("bad request shape".into())),
            ScriptedClient::new("openai").then_text("unused"),
            full_fallback(),
        );
        assert_err!(h.invoker.invoke(&request()).await);
        assert_eq!(h.local.calls(), 1);
        assert_eq!(h.cloud.calls(), 0);
    }

    #[tokio::test]
    async fn test_circuit_open_never_falls_back() {
        let h = harness(
            ScriptedClient::new("ollama")
                .then_transport_failure()
                .then_transport_failure(),
            ScriptedClient::fixed("openai", "cloud"),
            FallbackConfig::default(),
        );
        assert_err!(h.invoker.invoke(&request()).await);
        assert_err!(h.invoker.invoke(&request()).await);

        let with_fallback = ResilientInvoker {
            fallback: full_fallback(),
            ..h.invoker
        };
        let err = with_fallback.invoke(&request()).await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(h.cloud.calls(), 0);
    }

    #[tokio::test]
    async fn test_hop_success_keeps_breaker_closed() {
        let h = harness(
            ScriptedClient::new("ollama")
                .then_transport_failure()
                .then_transport_failure(),
            ScriptedClient::fixed("openai", "cloud"),
            FallbackConfig {
                alternate_local_model: None,
                ..full_fallback()
            },
        );
        assert_ok!(h.invoker.invoke(&request()).await);
        assert_ok!(h.invoker.invoke(&request()).await);
        assert_eq!(h.invoker.breaker().phase(), BreakerPhase::Closed);
        assert_eq!(h.cloud.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens_then_next_window_recovers() {
        let h = harness(
            ScriptedClient::new("ollama")
                .then_transport_failure()
                .then_transport_failure()
                .then_transport_failure()
                .then_text("recovered"),
            ScriptedClient::fixed("openai", "cloud"),
            FallbackConfig::default(),
        );
        assert_err!(h.invoker.invoke(&request()).await);
        assert_err!(h.invoker.invoke(&request()).await);
        h.clock.advance(Duration::from_secs(60));

        let probe = h.invoker.invoke(&request()).await.unwrap_err();
        assert!(matches!(probe, RelayError::Transport { .. }));
        assert_eq!(h.local.calls(), 3);
        assert!(h.invoker.invoke(&request()).await.unwrap_err().is_circuit_open());

        h.clock.advance(Duration::from_secs(15));
        let out = h.invoker.invoke(&request()).await.unwrap();
        assert_eq!(out.text, "recovered");
        assert_eq!(h.invoker.breaker().phase(), BreakerPhase::Closed);
    }

    #[tokio::test]
    async fn test_provider_and_model_override() {
        let h = harness(
            ScriptedClient::new("ollama"),
            ScriptedClient::new("openai").then_text("override"),
            FallbackConfig::default(),
        );
        let req = request().with_provider("openai").with_model("gpt-4.1");
        let out = h.invoker.invoke(&req).await.unwrap();
        assert_eq!(out.provider, "openai");
        assert_eq!(out.model, "gpt-4.1");
        assert_eq!(h.local.calls(), 0);
    }

    #[tokio::test]
    async fn test_stream_success_records_success_on_completion() {
        let h = harness(
            ScriptedClient::new("ollama")
                .then_transport_failure()
                .then_tokens(["old ", "pond"]),
            ScriptedClient::new("openai"),
            FallbackConfig::default(),
        );
        assert_err!(h.invoker.invoke(&request()).await);
        assert_eq!(h.invoker.breaker().state().consecutive_failures, 1);

        let stream = h.invoker.invoke_stream(&request()).await.unwrap();
        assert_eq!(stream.provider, "ollama");
        let tokens: Vec<String> = stream.tokens.map(|t| t.unwrap()).collect().await;
        assert_eq!(tokens.concat(), "old pond");
        assert_eq!(h.invoker.breaker().state().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_is_not_retried() {
        let h = harness(
            ScriptedClient::new("ollama")
                .then_broken(["one ", "two "], "connection reset")
                .then_tokens(["should", "not", "replay"]),
            ScriptedClient::fixed("openai", "cloud"),
            full_fallback(),
        );
        let stream = h.invoker.invoke_stream(&request()).await.unwrap();
        let items: Vec<Result<String>> = stream.tokens.collect().await;
        assert_eq!(items.len(), 3);
        assert!(matches!(
            items[2],
            Err(RelayError::StreamInterrupted { tokens: 2, .. })
        ));
        assert_eq!(h.local.calls(), 1);
        assert_eq!(h.cloud.calls(), 0);
        assert_eq!(h.invoker.breaker().state().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_stream_open_failure_uses_fallback() {
        let h = harness(
            ScriptedClient::new("ollama")
                .then_transport_failure()
                .then_tokens(["alt"]),
            ScriptedClient::new("openai"),
            full_fallback(),
        );
        let stream = h.invoker.invoke_stream(&request()).await.unwrap();
        assert_eq!(stream.model, "qwen2.5:0.5b");
        let tokens: Vec<String> = stream.tokens.map(|t| t.unwrap()).collect().await;
        assert_eq!(tokens, vec!["alt"]);
    }

    #[tokio::test]
    async fn test_empty_stream_is_empty_response() {
        let h = harness(
            ScriptedClient::new("ollama").then_tokens(Vec::<String>::new()),
            ScriptedClient::new("openai"),
            FallbackConfig::default(),
        );
        let stream = h.invoker.invoke_stream(&request()).await.unwrap();
        let items: Vec<Result<String>> = stream.tokens.collect().await;
        assert!(matches!(items.as_slice(), [Err(RelayError::EmptyResponse { .. })]));
    }

    #[tokio::test]
    async fn test_run_dispatches_on_streaming_flag() {
        let h = harness(
            ScriptedClient::new("ollama")
                .then_text("blocking")
                .then_tokens(["stream"]),
            ScriptedClient::new("openai"),
            FallbackConfig::default(),
        );
        match h.invoker.run(&request()).await.unwrap() {
            InvocationOutcome::Text(inv) => assert_eq!(inv.text, "blocking"),
            other => panic!("expected text, got {other:?}"),
        }
        match h.invoker.run(&request().streaming(true)).await.unwrap() {
            InvocationOutcome::Stream(s) => {
                let tokens: Vec<String> = s.tokens.map(|t| t.unwrap()).collect().await;
                assert_eq!(tokens, vec!["stream"]);
            }
            other => panic!("expected stream, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_provider_is_not_a_breaker_failure() {
        let router = ProviderRouter::new(
            ProviderCatalog::builtin(),
            Arc::new(MapEnv::new()),
            Arc::new(StaticProbe(false)),
            RoutingConfig {
                local_enabled: true,
                ..RoutingConfig::default()
            },
        );
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig::default(),
            Arc::new(ManualClock::new()),
        ));
        let invoker = ResilientInvoker::new(
            Arc::new(router),
            Arc::new(ScriptedFactory::new()),
            breaker.clone(),
            FallbackConfig::default(),
        );
        let err = invoker.invoke(&request()).await.unwrap_err();
        assert!(matches!(err, RelayError::NoProviderAvailable { .. }));
        assert_eq!(breaker.state().consecutive_failures, 0);
    }
}
