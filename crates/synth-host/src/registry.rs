//! Process-wide session table. Created at server start, cleared at stop.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::RwLock;
use tokio::task::JoinHandle;

use crate::buffer::{LogBuffer, Subscriber};
use crate::config::RegistryConfig;
use crate::error::{Result, SynthError};
use crate::runner;
use crate::session::{SessionId, SessionRecord, SessionSnapshot, SessionStatus};
use crate::workspace::Workspace;

// ── Entry ───────────────────────────────────────────────────────────

/// One session: its record and its log. The record is written only by the
/// runner that owns the buffer's writer.
#[derive(Debug)]
pub struct SessionEntry {
    id: SessionId,
    record: RwLock<SessionRecord>,
    buffer: Arc<LogBuffer>,
}

impl SessionEntry {
    pub fn new(record: SessionRecord, buffer: Arc<LogBuffer>) -> Self {
        Self {
            id: record.id,
            record: RwLock::new(record),
            buffer,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn record(&self) -> SessionRecord {
        self.record.read().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.record.read().status
    }

    pub fn buffer(&self) -> &Arc<LogBuffer> {
        &self.buffer
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let record = self.record.read();
        SessionSnapshot {
            id: record.id,
            status: record.status,
            started_at: record.started_at,
            finished_at: record.finished_at,
            exit_code: record.exit_code,
            input_dir: record.input_dir.clone(),
            key_concepts_file: record.key_concepts_file.clone(),
            events: self.buffer.len(),
            subscribers: self.buffer.subscriber_count(),
        }
    }

    pub(crate) fn mark_running(&self, pid: Option<u32>) {
        let mut record = self.record.write();
        if record.advance(SessionStatus::Running) {
            record.pid = pid;
        }
    }

    pub(crate) fn complete(&self, status: SessionStatus, exit_code: Option<i32>) {
        let mut record = self.record.write();
        if record.advance(status) {
            record.exit_code = exit_code;
        }
    }

    fn running_pid(&self) -> Option<u32> {
        let record = self.record.read();
        match record.status {
            SessionStatus::Running => record.pid,
            _ => None,
        }
    }

    /// Terminal for longer than `retention` and nobody is watching.
    fn is_expired(&self, retention: Duration, now: Instant) -> bool {
        let finished = self.record.read().finished_instant;
        match finished {
            Some(at) => {
                now.saturating_duration_since(at) >= retention && self.buffer.subscriber_count() == 0
            }
            None => false,
        }
    }
}

// ── Registry ────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
    workspace: Workspace,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            workspace: Workspace::new(config.project_root.clone()),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Allocate a session and launch its task in the background. Returns as
    /// soon as the session is registered; launch failures show up in the
    /// session's stream, not here.
    pub fn create(&self, input_dir: &str, key_concepts_file: &str) -> Result<SessionId> {
        if input_dir.trim().is_empty() || key_concepts_file.trim().is_empty() {
            return Err(SynthError::invalid(
                "inputDir and keyConceptsFile are required",
            ));
        }
        let input_dir = self.workspace.resolve(input_dir)?;
        let key_concepts_file = self.workspace.resolve(key_concepts_file)?;

        let id = SessionId::new();
        let (writer, buffer) = LogBuffer::channel();
        let record = SessionRecord::new(id, input_dir.clone(), key_concepts_file.clone());
        let entry = Arc::new(SessionEntry::new(record, buffer));
        self.sessions.insert(id, Arc::clone(&entry));

        let task = self
            .config
            .task
            .render(&input_dir, &key_concepts_file, &self.config.project_root);
        tracing::info!(
            session_id = %id,
            input_dir = %input_dir.display(),
            key_concepts_file = %key_concepts_file.display(),
            "session created"
        );
        tokio::spawn(runner::run(entry, writer, task));
        Ok(id)
    }

    pub fn get(&self, id: &SessionId) -> Result<Arc<SessionEntry>> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SynthError::not_found(format!("session not found: {id}")))
    }

    pub fn snapshot(&self, id: &SessionId) -> Result<SessionSnapshot> {
        Ok(self.get(id)?.snapshot())
    }

    pub fn subscribe(&self, id: &SessionId, from_seq: u64) -> Result<Subscriber> {
        Ok(self.get(id)?.buffer().subscribe(from_seq))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop terminal sessions past retention with no attached subscribers.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let retention = self.config.retention;
        let before = self.sessions.len();
        self.sessions.retain(|id, entry| {
            let expired = entry.is_expired(retention, now);
            if expired {
                tracing::info!(session_id = %id, "session evicted");
            }
            !expired
        });
        before.saturating_sub(self.sessions.len())
    }

    /// Periodic eviction. Stops once the registry is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        let period = self.config.reap_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let evicted = registry.evict_expired();
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = registry.len(), "reaper pass");
                }
            }
        })
    }

    /// Server stop: SIGTERM every running task and clear the table. Runners
    /// still observe the exits and close their buffers.
    pub fn shutdown(&self) -> usize {
        let mut signalled = 0;
        for entry in self.sessions.iter() {
            let Some(pid) = entry.running_pid() else {
                continue;
            };
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    signalled += 1;
                    tracing::info!(session_id = %entry.key(), pid, "sent SIGTERM to task");
                }
                Err(e) => tracing::warn!(session_id = %entry.key(), pid, error = %e, "failed to signal task"),
            }
        }
        self.sessions.clear();
        signalled
    }
}

// ── Unit tests ──────────────────────────────────────────────────────
