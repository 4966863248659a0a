//! Background generation tasks that publish versioned artifacts.
//!
//! [`ArtifactPublisher::schedule`] runs a [`GenerationTask`] on its own tokio
//! task. The task reports through a [`TaskContext`]:
//!
//! ```text
//! schedule ──► status "started" ──► spawn ──► task.run(ctx)
//!                                                │ ctx.publish(draft)  ─► store + queue
//!                                                │ ctx.status(msg)     ─► queue
//!                                                ▼
//!                         Ok  ─► status "completed"
//!                         Err ─► status "failed" (user-facing text)
//!                         panic ─► status "failed"
//!                                                ▼
//!                                 session ready, writer slot released
//! ```
//!
//! Nothing a task does can leave the session stuck in `thinking`.

pub mod tasks;

pub use tasks::{DraftTask, FileSetTask};

use crate::artifact::{
    ArtifactDraft, QueuePayload, SaveOutcome, SessionStatus, SessionStore, StatusPhase,
};
use crate::error::Result;
use crate::invoker::ResilientInvoker;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// A boxed, pinned, Send future.
pub type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One unit of background generation work.
///
/// Object-safe so heterogeneous tasks can be scheduled as
/// `Box<dyn GenerationTask>`.
pub trait GenerationTask: Send + 'static {
    /// Instance name for logs.
    fn name(&self) -> &str;

    /// Do the work. Returning an error (or panicking) turns into a failed
    /// status entry for the session.
    fn run(self: Box<Self>, ctx: TaskContext) -> BoxFut<'static, Result<()>>;
}

/// A task built from a closure. Handy for ad hoc work and tests.
pub struct FnTask<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnTask<F>
where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F, Fut> GenerationTask for FnTask<F>
where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(self: Box<Self>, ctx: TaskContext) -> BoxFut<'static, Result<()>> {
        Box::pin((self.f)(ctx))
    }
}

/// What a running task can reach.
#[derive(Clone)]
pub struct TaskContext {
    session_id: String,
    store: Arc<SessionStore>,
    invoker: Arc<ResilientInvoker>,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl TaskContext {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn invoker(&self) -> &ResilientInvoker {
        &self.invoker
    }

    /// Store `draft` as the next version of its path and, if a version was
    /// created, queue it for streaming consumers.
    ///
    /// A failed save is returned. A failed enqueue is only logged: the
    /// version is stored and the next snapshot carries it.
    pub fn publish(&self, draft: ArtifactDraft) -> Result<SaveOutcome> {
        let outcome = self.store.save_artifact(&self.session_id, draft)?;
        if let SaveOutcome::Created(version) = &outcome {
            let payload = QueuePayload::Artifact {
                artifact: version.clone(),
            };
            if let Err(e) = self.store.enqueue(&self.session_id, payload) {
                tracing::warn!(session = %self.session_id, error = %e, "artifact stored but not queued");
            }
        }
        Ok(outcome)
    }

    /// Queue a progress message. Never fails the task.
    pub fn status(&self, message: impl Into<String>) {
        report(&self.store, &self.session_id, StatusPhase::Progress, message.into());
    }
}

fn report(store: &SessionStore, session_id: &str, phase: StatusPhase, message: String) {
    if let Err(e) = store.enqueue(session_id, QueuePayload::status(phase, message)) {
        tracing::warn!(session = %session_id, ?phase, error = %e, "status not queued");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Runs generation tasks against a shared store and invoker.
#[derive(Debug, Clone)]
pub struct ArtifactPublisher {
    store: Arc<SessionStore>,
    invoker: Arc<ResilientInvoker>,
}

impl ArtifactPublisher {
    pub fn new(store: Arc<SessionStore>, invoker: Arc<ResilientInvoker>) -> Self {
        Self { store, invoker }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Start `task` for `session_id`, creating the session if needed.
    ///
    /// A "started" status is queued before this returns, so it is visible
    /// before the first model round-trip. Fails with
    /// [`SessionBusy`](crate::RelayError::SessionBusy) while another task
    /// owns the session. Must be called within a tokio runtime.
    pub fn schedule(
        &self,
        session_id: &str,
        task: Box<dyn GenerationTask>,
    ) -> Result<JoinHandle<()>> {
        self.store.ensure_session(session_id);
        self.store.try_acquire_writer(session_id)?;

        let name = task.name().to_string();
        if let Err(e) = self.store.set_status(session_id, SessionStatus::Thinking) {
            tracing::warn!(session = %session_id, error = %e, "status not updated");
        }
        report(
            &self.store,
            session_id,
            StatusPhase::Started,
            format!("{name} started"),
        );
        tracing::info!(session = %session_id, task = %name, "generation scheduled");

        let ctx = TaskContext {
            session_id: session_id.to_string(),
            store: self.store.clone(),
            invoker: self.invoker.clone(),
        };
        let store = self.store.clone();
        let id = session_id.to_string();
        let span = tracing::info_span!("generation", session = %id, task = %name);

        let handle = tokio::spawn(
            async move {
                let outcome = AssertUnwindSafe(async move { task.run(ctx).await })
                    .catch_unwind()
                    .await;
                let (phase, message) = match outcome {
                    Ok(Ok(())) => {
                        tracing::info!("generation completed");
                        (StatusPhase::Completed, format!("{name} completed"))
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "generation failed");
                        (StatusPhase::Failed, e.user_message())
                    }
                    Err(panic) => {
                        tracing::error!(panic = %panic_message(panic.as_ref()), "generation task panicked");
                        (
                            StatusPhase::Failed,
                            "Generation failed unexpectedly.".to_string(),
                        )
                    }
                };
                report(&store, &id, phase, message);
                if let Err(e) = store.set_status(&id, SessionStatus::Ready) {
                    tracing::warn!(error = %e, "session not marked ready");
                }
                store.release_writer(&id);
            }
            .instrument(span),
        );
        Ok(handle)
    }
}
