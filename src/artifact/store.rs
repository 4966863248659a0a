//! In-memory session store with per-session update queues.
//!
//! Each session has one bounded, append-only queue of [`QueueEntry`]s.
//! Readers never remove entries: each holds a [`QueueCursor`] and drains
//! everything past it, so several streamers can follow the same session
//! without stealing each other's updates. When the queue is full the oldest
//! entry is evicted; a reader that falls behind learns how many entries it
//! missed and can resynchronize from a snapshot.
//!
//! Every mutation bumps a `watch` counter so waiting readers wake without
//! polling. One coarse mutex guards all sessions; it is never held across an
//! await point.

use super::diff;
use super::{
    ArtifactDraft, ArtifactVersion, QueueEntry, QueuePayload, Session, SessionStatus,
    StatusUpdate,
};
use crate::error::{RelayError, Result};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

/// Result of [`SessionStore::save_artifact`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// A new version was appended and the revision advanced.
    Created(ArtifactVersion),
    /// Content matched the latest version; only metadata was merged.
    Unchanged(ArtifactVersion),
}

impl SaveOutcome {
    pub fn version(&self) -> &ArtifactVersion {
        match self {
            SaveOutcome::Created(v) | SaveOutcome::Unchanged(v) => v,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, SaveOutcome::Created(_))
    }
}

/// A reader's position in a session queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCursor {
    next_seq: u64,
}

impl QueueCursor {
    /// Resume at a known sequence number. `from_seq(0)` reads everything
    /// still retained.
    pub fn from_seq(next_seq: u64) -> Self {
        Self { next_seq }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

/// Entries returned by [`SessionStore::drain`].
#[derive(Debug, Clone, Default)]
pub struct Drain {
    pub entries: Vec<QueueEntry>,
    /// Entries evicted before this reader saw them.
    pub missed: u64,
}

struct SessionRecord {
    session: Session,
    queue: VecDeque<QueueEntry>,
    next_seq: u64,
    last_status: Option<StatusUpdate>,
    writer_active: bool,
    changed: watch::Sender<u64>,
}

impl SessionRecord {
    fn new(id: &str) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            session: Session::new(id),
            queue: VecDeque::new(),
            next_seq: 0,
            last_status: None,
            writer_active: false,
            changed,
        }
    }

    fn notify(&self) {
        self.changed.send_modify(|n| *n = n.wrapping_add(1));
    }
}

/// Thread-safe store for sessions, artifact versions, and update queues.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    queue_capacity: usize,
    diff_max_lines: usize,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.lock().len())
            .field("queue_capacity", &self.queue_capacity)
            .field("diff_max_lines", &self.diff_max_lines)
            .finish()
    }
}

impl SessionStore {
    pub fn new(queue_capacity: usize, diff_max_lines: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            diff_max_lines,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionRecord>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn with_record<T>(&self, id: &str, f: impl FnOnce(&mut SessionRecord) -> T) -> Result<T> {
        let mut sessions = self.lock();
        let record = sessions
            .get_mut(id)
            .ok_or_else(|| RelayError::SessionNotFound(id.to_string()))?;
        Ok(f(record))
    }

    /// Create a session with a fresh id.
    pub fn create_session(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.lock().insert(id.clone(), SessionRecord::new(&id));
        tracing::debug!(session = %id, "session created");
        id
    }

    /// Create `id` if it does not exist. Returns `true` if it was created.
    pub fn ensure_session(&self, id: &str) -> bool {
        let mut sessions = self.lock();
        if sessions.contains_key(id) {
            return false;
        }
        sessions.insert(id.to_string(), SessionRecord::new(id));
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Drop a session. Waiting readers observe the closed signal and stop.
    pub fn discard(&self, id: &str) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            tracing::debug!(session = %id, "session discarded");
        }
        removed
    }

    /// Copy of the session and its full artifact history.
    pub fn snapshot(&self, id: &str) -> Result<Session> {
        self.with_record(id, |r| r.session.clone())
    }

    pub fn revision(&self, id: &str) -> Result<u64> {
        self.with_record(id, |r| r.session.revision)
    }

    pub fn set_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        self.with_record(id, |r| {
            r.session.status = status;
        })
    }

    /// Store a draft as the next version of its path.
    ///
    /// Byte-identical content does not create a version or advance the
    /// revision; a provided summary and new requirement refs are merged into
    /// the existing version instead.
    pub fn save_artifact(&self, id: &str, draft: ArtifactDraft) -> Result<SaveOutcome> {
        let max_lines = self.diff_max_lines;
        self.with_record(id, |record| {
            let session = &mut record.session;
            let latest = session
                .artifacts
                .iter()
                .rposition(|a| a.path == draft.path);

            if let Some(idx) = latest {
                if session.artifacts[idx].body == draft.body {
                    let existing = &mut session.artifacts[idx];
                    if draft.summary.is_some() {
                        existing.summary = draft.summary;
                    }
                    for req in draft.requirement_refs {
                        if !existing.requirement_refs.contains(&req) {
                            existing.requirement_refs.push(req);
                        }
                    }
                    tracing::debug!(
                        session = %session.id,
                        path = %existing.path,
                        version = existing.version,
                        "identical content, metadata merged"
                    );
                    return SaveOutcome::Unchanged(existing.clone());
                }
            }

            let previous = latest.map(|idx| &session.artifacts[idx]);
            let version = previous.map_or(1, |p| p.version + 1);
            let diff_summary = match draft.body.content() {
                Some(current) => diff::summarize(
                    previous.and_then(|p| p.body.content()),
                    current,
                    max_lines,
                ),
                None => format!("reference updated (v{version})"),
            };

            let artifact = ArtifactVersion {
                path: draft.path,
                kind: draft.kind,
                version,
                body: draft.body,
                diff_summary,
                summary: draft.summary,
                requirement_refs: draft.requirement_refs,
                created_at: Utc::now(),
            };
            session.artifacts.push(artifact.clone());
            session.revision += 1;
            tracing::debug!(
                session = %session.id,
                path = %artifact.path,
                version,
                revision = session.revision,
                "artifact version stored"
            );
            record.notify();
            SaveOutcome::Created(artifact)
        })
    }

    /// Append a payload to the session queue and return its sequence number.
    pub fn enqueue(&self, id: &str, payload: QueuePayload) -> Result<u64> {
        let capacity = self.queue_capacity;
        self.with_record(id, |record| {
            let seq = record.next_seq;
            record.next_seq += 1;
            if let QueuePayload::Status(status) = &payload {
                record.last_status = Some(status.clone());
            }
            record.queue.push_back(QueueEntry {
                session_id: id.to_string(),
                seq,
                payload,
            });
            while record.queue.len() > capacity {
                if let Some(evicted) = record.queue.pop_front() {
                    tracing::warn!(
                        session = %id,
                        seq = evicted.seq,
                        capacity,
                        "update queue full, oldest entry evicted"
                    );
                }
            }
            record.notify();
            seq
        })
    }

    /// A cursor positioned after everything currently queued.
    pub fn open_cursor(&self, id: &str) -> Result<QueueCursor> {
        self.with_record(id, |r| QueueCursor {
            next_seq: r.next_seq,
        })
    }

    /// Change signal for the session. Closed once the session is discarded.
    pub fn subscribe(&self, id: &str) -> Result<watch::Receiver<u64>> {
        self.with_record(id, |r| r.changed.subscribe())
    }

    /// Everything queued after `cursor`, in enqueue order. Advances the cursor.
    pub fn drain(&self, id: &str, cursor: &mut QueueCursor) -> Result<Drain> {
        self.with_record(id, |record| {
            let oldest = record.queue.front().map_or(record.next_seq, |e| e.seq);
            let missed = oldest.saturating_sub(cursor.next_seq);
            if missed > 0 {
                tracing::debug!(session = %id, missed, "reader fell behind the queue");
            }
            let entries: Vec<QueueEntry> = record
                .queue
                .iter()
                .filter(|e| e.seq >= cursor.next_seq)
                .cloned()
                .collect();
            cursor.next_seq = record.next_seq;
            Drain { entries, missed }
        })
    }

    /// The most recent status message, kept after its queue entry is gone.
    pub fn last_status(&self, id: &str) -> Result<Option<StatusUpdate>> {
        self.with_record(id, |r| r.last_status.clone())
    }

    /// Claim the single writer slot of a session.
    pub fn try_acquire_writer(&self, id: &str) -> Result<()> {
        self.with_record(id, |r| {
            if r.writer_active {
                Err(RelayError::SessionBusy(id.to_string()))
            } else {
                r.writer_active = true;
                Ok(())
            }
        })?
    }

    /// Release the writer slot. A missing session is not an error here.
    pub fn release_writer(&self, id: &str) {
        if let Some(record) = self.lock().get_mut(id) {
            record.writer_active = false;
        }
    }
}
