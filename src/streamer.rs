//! Pull-based delivery of a session's artifacts to a (re)connecting consumer.
//!
//! Every stream opens with a [`StreamFrame::Snapshot`] holding the full
//! artifact history, then loops:
//!
//! 1. drain queued entries past this consumer's cursor into one
//!    [`StreamFrame::Updates`] frame
//! 2. send a fresh snapshot if the revision moved further than the drained
//!    artifact entries account for, or if entries were evicted unseen
//! 3. otherwise wait for the store's change signal, bounded by the poll
//!    interval, and send a [`StreamFrame::Heartbeat`] once the heartbeat
//!    interval passes without any frame
//!
//! The stream ends when the session is discarded. Dropping it at any point
//! releases its slot in [`ArtifactStreamer::active_streams`].

use crate::artifact::{ArtifactVersion, QueueCursor, QueueEntry, QueuePayload, SessionStore};
use crate::config::StreamConfig;
use crate::error::Result;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

/// One frame sent to a streaming consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamFrame {
    /// Full artifact history at `revision`.
    Snapshot {
        revision: u64,
        artifacts: Vec<ArtifactVersion>,
    },
    /// Queue entries in enqueue order.
    Updates {
        revision: u64,
        updates: Vec<QueueEntry>,
    },
    Heartbeat {
        revision: u64,
        timestamp: DateTime<Utc>,
    },
}

impl StreamFrame {
    pub fn revision(&self) -> u64 {
        match self {
            StreamFrame::Snapshot { revision, .. }
            | StreamFrame::Updates { revision, .. }
            | StreamFrame::Heartbeat { revision, .. } => *revision,
        }
    }

    /// Encode as one server-sent event: `data: {json}\n\n`.
    pub fn to_event(&self) -> Result<String> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }

    /// Encode as one NDJSON line.
    pub fn to_json_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Decrements the active-stream gauge exactly once, however the stream ends.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn acquire(gauge: &Arc<AtomicUsize>) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(gauge.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct StreamState {
    store: Arc<SessionStore>,
    session_id: String,
    cursor: QueueCursor,
    changed: watch::Receiver<u64>,
    reported_revision: u64,
    last_emit: Instant,
    pending: VecDeque<StreamFrame>,
    config: StreamConfig,
    _guard: ActiveGuard,
}

impl StreamState {
    fn snapshot(&self) -> Option<StreamFrame> {
        let session = self.store.snapshot(&self.session_id).ok()?;
        Some(StreamFrame::Snapshot {
            revision: session.revision,
            artifacts: session.artifacts,
        })
    }

    async fn next_frame(mut self) -> Option<(StreamFrame, Self)> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                self.last_emit = Instant::now();
                return Some((frame, self));
            }

            // everything up to here is covered by the drain below
            self.changed.borrow_and_update();
            let drain = self.store.drain(&self.session_id, &mut self.cursor).ok()?;
            let revision = self.store.revision(&self.session_id).ok()?;

            let delivered = drain
                .entries
                .iter()
                .filter(|e| matches!(e.payload, QueuePayload::Artifact { .. }))
                .count() as u64;
            let advanced = revision.saturating_sub(self.reported_revision);

            if !drain.entries.is_empty() {
                self.pending.push_back(StreamFrame::Updates {
                    revision,
                    updates: drain.entries,
                });
            }
            if drain.missed > 0 || advanced > delivered {
                tracing::debug!(
                    session = %self.session_id,
                    missed = drain.missed,
                    advanced,
                    delivered,
                    "resynchronizing with a snapshot"
                );
                let snapshot = self.snapshot()?;
                self.pending.push_back(snapshot);
            }
            self.reported_revision = revision;
            if !self.pending.is_empty() {
                continue;
            }

            let quiet = self.last_emit.elapsed();
            if quiet >= self.config.heartbeat_interval {
                self.pending.push_back(StreamFrame::Heartbeat {
                    revision,
                    timestamp: Utc::now(),
                });
                continue;
            }

            let wait = self
                .config
                .poll_interval
                .min(self.config.heartbeat_interval - quiet);
            match tokio::time::timeout(wait, self.changed.changed()).await {
                Ok(Ok(())) | Err(_) => {}
                Ok(Err(_)) => {
                    tracing::debug!(session = %self.session_id, "session closed, ending stream");
                    return None;
                }
            }
        }
    }
}

/// Opens artifact streams over a shared [`SessionStore`].
#[derive(Debug, Clone)]
pub struct ArtifactStreamer {
    store: Arc<SessionStore>,
    config: StreamConfig,
    active: Arc<AtomicUsize>,
}

impl ArtifactStreamer {
    pub fn new(store: Arc<SessionStore>, config: StreamConfig) -> Self {
        Self {
            store,
            config,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Streams currently open.
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Open a stream for `session_id`.
    ///
    /// The first frame is always a snapshot of the current history, whatever
    /// `start_revision` says: the store only moves forward, so a consumer
    /// that asks for a revision it cannot get is served from the present.
    pub fn open(
        &self,
        session_id: &str,
        start_revision: u64,
    ) -> Result<BoxStream<'static, StreamFrame>> {
        // subscribe and position the cursor before reading the snapshot so
        // nothing falls between them
        let changed = self.store.subscribe(session_id)?;
        let cursor = self.store.open_cursor(session_id)?;
        let session = self.store.snapshot(session_id)?;

        if start_revision > session.revision {
            tracing::debug!(
                session = %session_id,
                start_revision,
                revision = session.revision,
                "requested revision is ahead of the session"
            );
        }
        tracing::debug!(session = %session_id, revision = session.revision, "artifact stream opened");

        let state = StreamState {
            store: self.store.clone(),
            session_id: session_id.to_string(),
            cursor,
            changed,
            reported_revision: session.revision,
            last_emit: Instant::now(),
            pending: VecDeque::from([StreamFrame::Snapshot {
                revision: session.revision,
                artifacts: session.artifacts,
            }]),
            config: self.config.clone(),
            _guard: ActiveGuard::acquire(&self.active),
        };
        Ok(futures::stream::unfold(state, StreamState::next_frame).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactDraft, ArtifactKind, StatusPhase};
    use crate::error::RelayError;
    use std::time::Duration;

    fn setup() -> (ArtifactStreamer, Arc<SessionStore>, String) {
        let store = Arc::new(SessionStore::new(16, 40));
        let id = store.create_session();
        (ArtifactStreamer::new(store.clone(), StreamConfig::default()), store, id)
    }

    fn publish(store: &SessionStore, id: &str, path: &str, content: &str) {
        let outcome = store
            .save_artifact(id, ArtifactDraft::content(path, ArtifactKind::Code, content))
            .unwrap();
        store
            .enqueue(
                id,
                QueuePayload::Artifact {
                    artifact: outcome.version().clone(),
                },
            )
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_frame_is_full_snapshot() {
        let (streamer, store, id) = setup();
        publish(&store, &id, "a.rs", "1");
        publish(&store, &id, "b.rs", "1");
        publish(&store, &id, "a.rs", "2");

        let mut stream = streamer.open(&id, 0).unwrap();
        match stream.next().await.unwrap() {
            StreamFrame::Snapshot { revision, artifacts } => {
                assert_eq!(revision, 3);
                assert_eq!(artifacts.len(), 3);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_sent_even_for_future_revision() {
        let (streamer, _store, id) = setup();
        let mut stream = streamer.open(&id, 99).unwrap();
        let first = stream.next().await.unwrap();
        assert!(matches!(first, StreamFrame::Snapshot { revision: 0, ref artifacts } if artifacts.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_published_artifact_arrives_as_update_only() {
        let (streamer, store, id) = setup();
        let mut stream = streamer.open(&id, 0).unwrap();
        stream.next().await.unwrap();

        publish(&store, &id, "a.rs", "x");
        match stream.next().await.unwrap() {
            StreamFrame::Updates { revision, updates } => {
                assert_eq!(revision, 1);
                assert_eq!(updates.len(), 1);
                assert!(matches!(updates[0].payload, QueuePayload::Artifact { .. }));
            }
            other => panic!("expected updates, got {other:?}"),
        }

        // nothing else happens until the heartbeat
        let before = Instant::now();
        let frame = stream.next().await.unwrap();
        assert!(matches!(frame, StreamFrame::Heartbeat { revision: 1, .. }));
        assert!(before.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_keep_enqueue_order() {
        let (streamer, store, id) = setup();
        let mut stream = streamer.open(&id, 0).unwrap();
        stream.next().await.unwrap();

        store
            .enqueue(&id, QueuePayload::status(StatusPhase::Started, "go"))
            .unwrap();
        publish(&store, &id, "a.rs", "x");
        store
            .enqueue(&id, QueuePayload::status(StatusPhase::Completed, "done"))
            .unwrap();

        let StreamFrame::Updates { updates, .. } = stream.next().await.unwrap() else {
            panic!("expected updates");
        };
        let seqs: Vec<u64> = updates.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unqueued_revision_change_triggers_snapshot() {
        let (streamer, store, id) = setup();
        let mut stream = streamer.open(&id, 0).unwrap();
        stream.next().await.unwrap();

        store
            .save_artifact(&id, ArtifactDraft::content("a.rs", ArtifactKind::Code, "x"))
            .unwrap();
        match stream.next().await.unwrap() {
            StreamFrame::Snapshot { revision, artifacts } => {
                assert_eq!(revision, 1);
                assert_eq!(artifacts.len(), 1);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicted_entries_force_snapshot_after_updates() {
        let store = Arc::new(SessionStore::new(2, 40));
        let id = store.create_session();
        let streamer = ArtifactStreamer::new(store.clone(), StreamConfig::default());
        let mut stream = streamer.open(&id, 0).unwrap();
        stream.next().await.unwrap();

        for i in 0..5 {
            store
                .enqueue(&id, QueuePayload::status(StatusPhase::Progress, format!("{i}")))
                .unwrap();
        }
        let StreamFrame::Updates { updates, .. } = stream.next().await.unwrap() else {
            panic!("expected updates");
        };
        assert_eq!(updates.len(), 2);
        assert!(matches!(stream.next().await.unwrap(), StreamFrame::Snapshot { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_stream_wakes_on_change() {
        let (streamer, store, id) = setup();
        let mut stream = streamer.open(&id, 0).unwrap();
        stream.next().await.unwrap();

        let writer = {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                publish(&store, &id, "late.rs", "x");
            })
        };
        let frame = stream.next().await.unwrap();
        assert!(matches!(frame, StreamFrame::Updates { revision: 1, .. }));
        writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_gauge_released_on_drop_and_on_discard() {
        let (streamer, store, id) = setup();
        let first = streamer.open(&id, 0).unwrap();
        let mut second = streamer.open(&id, 0).unwrap();
        assert_eq!(streamer.active_streams(), 2);

        drop(first);
        assert_eq!(streamer.active_streams(), 1);

        second.next().await.unwrap();
        store.discard(&id);
        assert!(second.next().await.is_none());
        assert_eq!(streamer.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_unknown_session_rejected() {
        let (streamer, _store, _id) = setup();
        assert!(matches!(
            streamer.open("missing", 0),
            Err(RelayError::SessionNotFound(_))
        ));
        assert_eq!(streamer.active_streams(), 0);
    }

    #[test]
    fn test_frame_encodings() {
        let frame = StreamFrame::Updates {
            revision: 4,
            updates: Vec::new(),
        };
        assert_eq!(
            frame.to_event().unwrap(),
            "data: {\"type\":\"updates\",\"revision\":4,\"updates\":[]}\n\n"
        );
        let line = frame.to_json_line().unwrap();
        assert!(line.ends_with("}\n"));
        let back: StreamFrame = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(back, frame);
    }
}
