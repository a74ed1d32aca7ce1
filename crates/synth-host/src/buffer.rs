//! Per-session, append-only event log with replay for any number of readers.
//!
//! One [`BufferWriter`] exists per buffer and is the only way to append, so the
//! single-writer rule is enforced by ownership. Readers are [`Subscriber`]s:
//! each holds its own cursor, replays history from its join point and then
//! suspends on a `watch` channel until the writer appends or closes. Readers
//! never take the write lock and never wait on each other.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::{self, Stream};
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::session::SessionStatus;

// ── Events ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    Log { line: String },
    Status { status: SessionStatus, exit_code: Option<i32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Log,
    Status,
}

/// One entry of the log. `seq` starts at 0 and has no gaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub seq: u64,
    pub payload: EventPayload,
}

impl LogEvent {
    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::Log { .. } => EventKind::Log,
            EventPayload::Status { .. } => EventKind::Status,
        }
    }
}

// ── Buffer ──────────────────────────────────────────────────────────

/// Published to readers after every append.
#[derive(Debug, Clone, Copy, Default)]
struct BufferState {
    len: u64,
    closed: bool,
}

pub struct LogBuffer {
    events: RwLock<Vec<LogEvent>>,
    state: watch::Sender<BufferState>,
    subscribers: AtomicUsize,
}

impl std::fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = *self.state.borrow();
        f.debug_struct("LogBuffer")
            .field("len", &state.len)
            .field("closed", &state.closed)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl LogBuffer {
    /// Create an empty buffer and its one writer.
    pub fn channel() -> (BufferWriter, Arc<LogBuffer>) {
        let (state, _) = watch::channel(BufferState::default());
        let buffer = Arc::new(LogBuffer {
            events: RwLock::new(Vec::new()),
            state,
            subscribers: AtomicUsize::new(0),
        });
        let writer = BufferWriter {
            buffer: Arc::clone(&buffer),
            closed: false,
        };
        (writer, buffer)
    }

    pub fn len(&self) -> u64 {
        self.state.borrow().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the writer has appended its terminal status (or gone away).
    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Acquire)
    }

    /// Copy of every event currently in the buffer.
    pub fn snapshot(&self) -> Vec<LogEvent> {
        self.events.read().clone()
    }

    /// Start reading at `from_seq`. `0` replays everything; a later value
    /// resumes from a checkpoint.
    pub fn subscribe(self: &Arc<Self>, from_seq: u64) -> Subscriber {
        self.subscribers.fetch_add(1, Ordering::AcqRel);
        Subscriber {
            buffer: Arc::clone(self),
            rx: self.state.subscribe(),
            next_seq: from_seq,
            last_delivered_seq: None,
            pending: VecDeque::new(),
        }
    }

    fn push(&self, payload: EventPayload, close: bool) -> u64 {
        let seq = {
            let mut events = self.events.write();
            let seq = events.len() as u64;
            events.push(LogEvent { seq, payload });
            seq
        };
        // Publish only after the event is visible so readers never see a
        // length they cannot read.
        self.state.send_modify(|state| {
            state.len = seq + 1;
            state.closed |= close;
        });
        seq
    }

    fn close(&self) {
        self.state.send_modify(|state| state.closed = true);
    }

    fn read_range(&self, from: u64, to: u64) -> Vec<LogEvent> {
        let events = self.events.read();
        let to = (to as usize).min(events.len());
        let from = (from as usize).min(to);
        events[from..to].to_vec()
    }
}

// ── Writer ──────────────────────────────────────────────────────────

/// The single append handle for a buffer. Dropping it without calling
/// [`BufferWriter::finish`] closes the buffer so readers do not hang.
#[derive(Debug)]
pub struct BufferWriter {
    buffer: Arc<LogBuffer>,
    closed: bool,
}

impl BufferWriter {
    pub fn append_log(&mut self, line: impl Into<String>) -> u64 {
        self.buffer
            .push(EventPayload::Log { line: line.into() }, false)
    }

    /// Append the final status event and close the buffer.
    pub fn finish(mut self, status: SessionStatus, exit_code: Option<i32>) -> u64 {
        debug_assert!(status.is_terminal(), "final status must be terminal");
        self.closed = true;
        self.buffer
            .push(EventPayload::Status { status, exit_code }, true)
    }

}

impl Drop for BufferWriter {
    fn drop(&mut self) {
        if !self.closed {
            self.buffer.close();
        }
    }
}

// ── Subscriber ──────────────────────────────────────────────────────

/// One reader's cursor into a buffer. Lives as long as one stream connection.
pub struct Subscriber {
    buffer: Arc<LogBuffer>,
    rx: watch::Receiver<BufferState>,
    next_seq: u64,
    last_delivered_seq: Option<u64>,
    pending: VecDeque<LogEvent>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("next_seq", &self.next_seq)
            .field("last_delivered_seq", &self.last_delivered_seq)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Subscriber {
    pub fn last_delivered_seq(&self) -> Option<u64> {
        self.last_delivered_seq
    }

    /// Next event in `seq` order. Suspends while caught up on a live buffer;
    /// returns `None` once the buffer is closed and fully drained.
    pub async fn next(&mut self) -> Option<LogEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                self.last_delivered_seq = Some(event.seq);
                return Some(event);
            }

            let state = *self.rx.borrow_and_update();
            if self.next_seq < state.len {
                let batch = self.buffer.read_range(self.next_seq, state.len);
                self.next_seq += batch.len() as u64;
                self.pending.extend(batch);
                continue;
            }
            if state.closed {
                return None;
            }
            if self.rx.changed().await.is_err() {
                // The sender lives inside the buffer we hold, so this only
                // happens during teardown.
                return None;
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = LogEvent> + Send + 'static {
        stream::unfold(self, |mut subscriber| async move {
            let event = subscriber.next().await?;
            Some((event, subscriber))
        })
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.buffer.subscribers.fetch_sub(1, Ordering::AcqRel);
    }
}

// ── Unit tests ──────────────────────────────────────────────────────
