//! Session identity, status lifecycle and the serializable snapshot.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Identity ────────────────────────────────────────────────────────

/// Opaque session id. Random, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

// ── Status ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether `self -> next` respects `pending -> running -> {succeeded|failed}`.
    /// `pending -> failed` is allowed for tasks that never launched.
    pub fn can_advance_to(self, next: Self) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failed) | (Running, Succeeded) | (Running, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Record ──────────────────────────────────────────────────────────

/// Mutable per-session state. Owned by the registry, written only by the
/// runner driving the session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: SessionId,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Monotonic twin of `finished_at`, used for retention.
    pub finished_instant: Option<Instant>,
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    pub input_dir: PathBuf,
    pub key_concepts_file: PathBuf,
}

impl SessionRecord {
    pub fn new(id: SessionId, input_dir: PathBuf, key_concepts_file: PathBuf) -> Self {
        Self {
            id,
            status: SessionStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            finished_instant: None,
            exit_code: None,
            pid: None,
            input_dir,
            key_concepts_file,
        }
    }

    /// Apply a status transition. Returns false (and changes nothing) when the
    /// transition would leave a terminal state or move backwards.
    pub fn advance(&mut self, next: SessionStatus) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
            self.finished_instant = Some(Instant::now());
            self.pid = None;
        }
        true
    }
}

/// Read-only view handed out over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub input_dir: PathBuf,
    pub key_concepts_file: PathBuf,
    /// Number of events in the session's buffer.
    pub events: u64,
    /// Currently attached stream subscribers.
    pub subscribers: usize,
}
