//! # LLM Relay
//!
//! Resilient, multi-provider access to language models, plus ordered
//! delivery of the artifacts a long-running generation produces.
//!
//! ## Core Concepts
//!
//! - **[`ProviderRouter`]**: picks a provider and model for a [`Purpose`]
//!   from the built-in [`ProviderCatalog`], honouring credentials, a local
//!   enablement flag, a forced provider, and an allow-list.
//! - **[`DialectClient`](backend::DialectClient)**: talks to a local server
//!   that may speak either the chat-completions or the generate dialect, and
//!   remembers whichever worked last.
//! - **[`ResilientInvoker`]**: gates every call with a [`CircuitBreaker`]
//!   and, on a recoverable failure, walks a fallback chain (alternate local
//!   model, then a cloud provider).
//! - **[`ArtifactPublisher`]**: runs a [`GenerationTask`] in the background
//!   and stores each output as a versioned artifact in a [`SessionStore`].
//! - **[`ArtifactStreamer`]**: serves a snapshot, then updates and
//!   heartbeats, to consumers that may reconnect at any time.
//! - **[`Relay`]**: wires all of the above from one [`RelayConfig`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use futures::StreamExt;
//! use llm_relay::backend::ChatMessage;
//! use llm_relay::{FileSetTask, InvocationRequest, Purpose, Relay};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     llm_relay::telemetry::init_tracing();
//!     let relay = Relay::from_env()?;
//!
//!     let session = relay.create_session();
//!     let mut frames = relay.stream(&session, 0)?;
//!
//!     let request = InvocationRequest::new(
//!         Purpose::Generation,
//!         vec![ChatMessage::user("Write a hello-world CLI in Rust")],
//!     );
//!     relay.schedule(&session, Box::new(FileSetTask::new(request)))?;
//!
//!     while let Some(frame) = frames.next().await {
//!         print!("{}", frame.to_event()?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod artifact;
pub mod backend;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod invoker;
pub mod provider;
pub mod publisher;
pub mod relay;
pub mod streamer;
pub mod structured;
pub mod telemetry;

pub use artifact::{
    ArtifactDraft, ArtifactKind, ArtifactVersion, QueuePayload, Session, SessionStatus,
    SessionStore, StatusPhase,
};
pub use breaker::{BreakerPhase, CircuitBreaker};
pub use config::{BreakerConfig, FallbackConfig, RelayConfig, RoutingConfig, StreamConfig};
pub use error::{RelayError, Result};
pub use invoker::{Invocation, InvocationOutcome, InvocationRequest, InvocationStream, ResilientInvoker};
pub use provider::{ProviderCatalog, ProviderRouter, ProviderSelection, Purpose};
pub use publisher::{ArtifactPublisher, DraftTask, FileSetTask, FnTask, GenerationTask, TaskContext};
pub use relay::{Relay, RelayBuilder};
pub use streamer::{ArtifactStreamer, StreamFrame};
