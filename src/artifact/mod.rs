//! Sessions, versioned artifacts, and queued stream payloads.
//!
//! A [`Session`] owns an ordered history of [`ArtifactVersion`]s. Its
//! `revision` moves forward only when that history changes. Everything a
//! streaming consumer should see incrementally, including status messages
//! that are never stored as versions, travels as a [`QueuePayload`].

pub mod diff;
pub mod store;

pub use store::{Drain, QueueCursor, SaveOutcome, SessionStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What kind of output an artifact holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Code,
    Test,
    Config,
    Summary,
    Bundle,
    Preview,
    Status,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Code => "code",
            ArtifactKind::Test => "test",
            ArtifactKind::Config => "config",
            ArtifactKind::Summary => "summary",
            ArtifactKind::Bundle => "bundle",
            ArtifactKind::Preview => "preview",
            ArtifactKind::Status => "status",
        }
    }

    /// Best guess from a file path, used when generated output omits a kind.
    pub fn infer(path: &str) -> ArtifactKind {
        let lower = path.to_ascii_lowercase();
        let file = lower.rsplit('/').next().unwrap_or(&lower);
        if lower.split('/').any(|seg| seg == "tests" || seg == "test")
            || file.starts_with("test_")
            || file.contains("_test.")
            || file.contains(".test.")
            || file.contains(".spec.")
        {
            return ArtifactKind::Test;
        }
        match file.rsplit_once('.').map(|(_, ext)| ext) {
            Some("toml" | "yaml" | "yml" | "json" | "ini" | "cfg" | "env") => ArtifactKind::Config,
            Some("md" | "txt" | "rst") => ArtifactKind::Summary,
            Some("html" | "svg" | "png") => ArtifactKind::Preview,
            _ => ArtifactKind::Code,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inline content or a reference to content held elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactBody {
    Content(String),
    /// Opaque key into an external blob store.
    Ref(String),
}

impl ArtifactBody {
    pub fn content(&self) -> Option<&str> {
        match self {
            ArtifactBody::Content(text) => Some(text),
            ArtifactBody::Ref(_) => None,
        }
    }
}

/// One stored version of one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactVersion {
    pub path: String,
    pub kind: ArtifactKind,
    /// Starts at 1 and increases by one per distinct content for `path`.
    pub version: u32,
    #[serde(flatten)]
    pub body: ArtifactBody,
    /// Unified-style diff against the previous version of `path`.
    pub diff_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub requirement_refs: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Content a generation task wants to publish. The store assigns the
/// version, diff, and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDraft {
    pub path: String,
    pub kind: ArtifactKind,
    pub body: ArtifactBody,
    pub summary: Option<String>,
    pub requirement_refs: Vec<String>,
}

impl ArtifactDraft {
    pub fn content(path: impl Into<String>, kind: ArtifactKind, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            body: ArtifactBody::Content(content.into()),
            summary: None,
            requirement_refs: Vec::new(),
        }
    }

    pub fn reference(path: impl Into<String>, kind: ArtifactKind, key: impl Into<String>) -> Self {
        Self {
            body: ArtifactBody::Ref(key.into()),
            ..Self::content(path, kind, String::new())
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_requirements<I, S>(mut self, refs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requirement_refs = refs.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Draft,
    Thinking,
    Ready,
}

/// A generation session and its full artifact history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub revision: u64,
    pub artifacts: Vec<ArtifactVersion>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: SessionStatus::Draft,
            revision: 0,
            artifacts: Vec::new(),
        }
    }

    /// Newest version stored for `path`.
    pub fn latest(&self, path: &str) -> Option<&ArtifactVersion> {
        self.artifacts.iter().rev().find(|a| a.path == path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusPhase {
    Started,
    Progress,
    Completed,
    Failed,
}

/// A user-facing progress message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub phase: StatusPhase,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn new(phase: StatusPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// What a streaming consumer receives inside an updates frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueuePayload {
    Status(StatusUpdate),
    Artifact { artifact: ArtifactVersion },
}

impl QueuePayload {
    pub fn status(phase: StatusPhase, message: impl Into<String>) -> Self {
        QueuePayload::Status(StatusUpdate::new(phase, message))
    }
}

/// A payload stamped with its position in the session queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub session_id: String,
    /// Enqueue order within the session, starting at 0.
    pub seq: u64,
    pub payload: QueuePayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_inference() {
        assert_eq!(ArtifactKind::infer("src/main.rs"), ArtifactKind::Code);
        assert_eq!(ArtifactKind::infer("tests/api.rs"), ArtifactKind::Test);
        assert_eq!(ArtifactKind::infer("app/test_models.py"), ArtifactKind::Test);
        assert_eq!(ArtifactKind::infer("web/button.spec.ts"), ArtifactKind::Test);
        assert_eq!(ArtifactKind::infer("Cargo.toml"), ArtifactKind::Config);
        assert_eq!(ArtifactKind::infer("README.md"), ArtifactKind::Summary);
        assert_eq!(ArtifactKind::infer("Makefile"), ArtifactKind::Code);
    }

    #[test]
    fn test_version_serializes_flat_body() {
        let v = ArtifactVersion {
            path: "src/lib.rs".into(),
            kind: ArtifactKind::Code,
            version: 2,
            body: ArtifactBody::Content("fn x() {}".into()),
            diff_summary: String::new(),
            summary: None,
            requirement_refs: vec!["REQ-1".into()],
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["kind"], "code");
        assert_eq!(json["content"], "fn x() {}");
        assert!(json.get("summary").is_none());
        assert_eq!(json["requirement_refs"][0], "REQ-1");

        let by_ref = ArtifactVersion {
            body: ArtifactBody::Ref("blob/42".into()),
            ..v
        };
        let json = serde_json::to_value(&by_ref).unwrap();
        assert_eq!(json["ref"], "blob/42");
        assert!(json.get("content").is_none());
    }

    #[test]
    fn test_payload_tagging() {
        let status = QueuePayload::status(StatusPhase::Started, "working");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["event"], "status");
        assert_eq!(json["phase"], "started");
        assert_eq!(json["message"], "working");
    }

    #[test]
    fn test_latest_picks_newest_for_path() {
        let mut session = Session::new("s");
        for (path, version) in [("a", 1), ("b", 1), ("a", 2)] {
            session.artifacts.push(ArtifactVersion {
                path: path.into(),
                kind: ArtifactKind::Code,
                version,
                body: ArtifactBody::Content(format!("{path}{version}")),
                diff_summary: String::new(),
                summary: None,
                requirement_refs: Vec::new(),
                created_at: Utc::now(),
            });
        }
        assert_eq!(session.latest("a").unwrap().version, 2);
        assert_eq!(session.latest("b").unwrap().version, 1);
        assert!(session.latest("c").is_none());
    }
}
