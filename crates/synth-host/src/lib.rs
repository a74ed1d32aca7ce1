//! Session-based task runner with live, replayable log streaming.
//!
//! A start request creates a session and launches the external task in the
//! background. The task's combined output becomes an append-only event log
//! that any number of SSE viewers can replay and follow.

pub mod ansi;
pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod runner;
pub mod server;
pub mod session;
pub mod tracker;
pub mod workspace;

pub use error::{Result, SynthError};
