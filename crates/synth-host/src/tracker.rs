//! Client-side session tracking that survives restarts of the viewer.
//!
//! State lives in one JSON file keyed to the project root it was written for.
//! Opening it for a different root discards everything in a single
//! replacement, so a session, its cached lines and any selections from one
//! project never show up in another.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ansi;
use crate::error::{Result, SynthError};
use crate::protocol::WireMessage;
use crate::session::{SessionId, SessionStatus};
use crate::workspace::atomic_write_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedSession {
    pub session_id: SessionId,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerState {
    #[serde(default)]
    pub project_root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<TrackedSession>,
    #[serde(default)]
    pub log_lines: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_source_dir: Option<String>,
}

impl TrackerState {
    fn fresh(project_root: &str) -> Self {
        Self {
            project_root: project_root.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct SessionTracker {
    path: PathBuf,
    state: TrackerState,
}

impl SessionTracker {
    /// Load state from `path` for `project_root`. A missing or unreadable file
    /// starts fresh; a file written for another root is discarded.
    pub fn open(path: impl Into<PathBuf>, project_root: &str) -> Result<Self> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<TrackerState>(&content) {
                Ok(state) => Some(state),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "discarding corrupt tracker state");
                    None
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(SynthError::io(&path, e)),
        };

        let mut tracker = Self {
            path,
            state: TrackerState::fresh(project_root),
        };
        match state {
            Some(state) if state.project_root == project_root => tracker.state = state,
            Some(state) => {
                tracing::info!(
                    previous = %state.project_root,
                    current = %project_root,
                    "project changed; clearing tracked session"
                );
                tracker.save()?;
            }
            None => tracker.save()?,
        }
        Ok(tracker)
    }

    pub fn state(&self) -> &TrackerState {
        &self.state
    }

    pub fn session(&self) -> Option<TrackedSession> {
        self.state.session
    }

    pub fn log_lines(&self) -> &[String] {
        &self.state.log_lines
    }

    /// Whether a start may be issued. Refused while the tracked session is
    /// still running, so one view never drives two runs.
    pub fn request_start(&self) -> bool {
        !matches!(
            self.state.session,
            Some(TrackedSession {
                status: SessionStatus::Running,
                ..
            })
        )
    }

    pub fn begin_session(&mut self, session_id: SessionId) -> Result<()> {
        self.state.session = Some(TrackedSession {
            session_id,
            status: SessionStatus::Running,
        });
        self.state.log_lines.clear();
        self.save()
    }

    /// Every connection replays from the start, so cached lines are rebuilt
    /// rather than merged.
    pub fn begin_replay(&mut self) {
        self.state.log_lines.clear();
    }

    pub fn apply(&mut self, message: &WireMessage) -> Result<()> {
        match message {
            WireMessage::Log { line } => {
                self.state.log_lines.push(line.clone());
                Ok(())
            }
            WireMessage::Status { status, .. } => {
                if let Some(session) = self.state.session.as_mut() {
                    session.status = *status;
                }
                self.save()
            }
        }
    }

    /// False once a terminal status has been seen (or nothing is tracked).
    pub fn expects_events(&self) -> bool {
        self.state
            .session
            .is_some_and(|s| !s.status.is_terminal())
    }

    /// Drop a session the server no longer knows about.
    pub fn forget_session(&mut self) -> Result<()> {
        self.state.session = None;
        self.save()
    }

    pub fn select_file(&mut self, file: Option<String>) -> Result<()> {
        self.state.selected_file = file;
        self.save()
    }

    pub fn select_source_dir(&mut self, dir: Option<String>) -> Result<()> {
        self.state.selected_source_dir = dir;
        self.save()
    }

    pub fn render_html(&self) -> String {
        let mut html = String::new();
        for line in &self.state.log_lines {
            html.push_str(&ansi::ansi_to_html(line));
            html.push('\n');
        }
        html
    }

    pub fn save(&self) -> Result<()> {
        atomic_write_json(&self.path, &self.state).map_err(|e| SynthError::io(&self.path, e))
    }
}
