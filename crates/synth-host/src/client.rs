//! HTTP client for a running server, and the reconnecting follow loop used by
//! the `start` and `watch` commands.

use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use eventsource_stream::Eventsource;
use futures::stream::{BoxStream, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::protocol::{StartRequest, StartResponse, WireMessage};
use crate::session::{SessionId, SessionStatus};
use crate::tracker::SessionTracker;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3000";

const MAX_RECONNECTS: u32 = 5;
const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(250);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(5);

/// One decoded stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamedEvent {
    pub seq: Option<u64>,
    pub message: WireMessage,
}

#[derive(Debug, Clone)]
pub struct SynthClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct DirBody {
    cwd: String,
}

impl SynthClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// The server's project root, used as the tracker's invalidation key.
    pub async fn project_root(&self) -> anyhow::Result<String> {
        let response = self
            .http
            .get(self.url("/api/dir"))
            .send()
            .await
            .context("failed to reach server")?;
        let body: DirBody = check(response).await?.json().await?;
        Ok(body.cwd)
    }

    pub async fn start(&self, input_dir: &str, key_concepts_file: &str) -> anyhow::Result<SessionId> {
        let request = StartRequest {
            input_dir: input_dir.to_string(),
            key_concepts_file: key_concepts_file.to_string(),
        };
        let response = self
            .http
            .post(self.url("/api/synthesize/start"))
            .json(&request)
            .send()
            .await
            .context("failed to reach server")?;
        let body: StartResponse = check(response).await?.json().await?;
        Ok(body.session_id)
    }

    /// Open the event stream for `session_id` from `from_seq`. `Ok(None)` when
    /// the server does not know the session.
    pub async fn stream(
        &self,
        session_id: SessionId,
        from_seq: u64,
    ) -> anyhow::Result<Option<BoxStream<'static, anyhow::Result<StreamedEvent>>>> {
        let response = self
            .http
            .get(self.url("/api/synthesize/stream"))
            .query(&[("session", session_id.to_string()), ("from", from_seq.to_string())])
            .send()
            .await
            .context("failed to reach server")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(response).await?;

        let events = response
            .bytes_stream()
            .eventsource()
            .filter_map(|item| async move {
                match item {
                    Ok(event) if event.data.is_empty() => None,
                    Ok(event) => Some(
                        serde_json::from_str::<WireMessage>(&event.data)
                            .map(|message| StreamedEvent {
                                seq: event.id.parse().ok(),
                                message,
                            })
                            .with_context(|| format!("malformed stream message: {}", event.data)),
                    ),
                    Err(e) => Some(Err(anyhow!("event stream failed: {e}"))),
                }
            })
            .boxed();
        Ok(Some(events))
    }
}

async fn check(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    bail!("server returned {status}: {message}")
}

// ── Follow loop ─────────────────────────────────────────────────────

/// Follow `session_id` until a terminal status arrives, reconnecting with
/// bounded backoff. Each connection replays from the start and rebuilds the
/// tracker's lines; `on_line` only sees lines it has not seen before.
pub async fn follow(
    client: &SynthClient,
    tracker: &mut SessionTracker,
    session_id: SessionId,
    mut on_line: impl FnMut(&str),
) -> anyhow::Result<SessionStatus> {
    let mut shown = 0usize;
    let mut failures = 0u32;

    loop {
        let connected = client.stream(session_id, 0).await;
        match connected {
            Ok(Some(mut events)) => {
                tracker.begin_replay();
                while let Some(item) = events.next().await {
                    let event = match item {
                        Ok(event) => event,
                        Err(e) => {
                            tracing::warn!(session_id = %session_id, error = %e, "stream interrupted");
                            break;
                        }
                    };
                    failures = 0;
                    tracker.apply(&event.message)?;
                    let lines = tracker.log_lines();
                    while shown < lines.len() {
                        on_line(&lines[shown]);
                        shown += 1;
                    }
                    if let WireMessage::Status { status, .. } = event.message {
                        if status.is_terminal() {
                            tracker.save()?;
                            return Ok(status);
                        }
                    }
                }
                tracker.save()?;
            }
            Ok(None) => {
                tracker.forget_session()?;
                bail!("session {session_id} is no longer available on the server");
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "connect failed");
            }
        }

        failures += 1;
        if failures > MAX_RECONNECTS {
            bail!("gave up on session {session_id} after {MAX_RECONNECTS} reconnect attempts");
        }
        let delay = reconnect_delay(failures);
        tracing::info!(session_id = %session_id, attempt = failures, ?delay, "reconnecting");
        tokio::time::sleep(delay).await;
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(8);
    RECONNECT_BASE_DELAY
        .saturating_mul(factor)
        .min(RECONNECT_MAX_DELAY)
}
