//! HTTP surface: session start, the SSE log stream, session snapshots and
//! the filesystem collaborators.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::buffer::LogEvent;
use crate::config::{load_project_info, ProjectInfo};
use crate::error::{Result, SynthError};
use crate::protocol::{StartRequest, StartResponse, WireMessage};
use crate::registry::SessionRegistry;
use crate::session::{SessionId, SessionSnapshot};
use crate::workspace::{DirListing, FileContent, Workspace, KNOWLEDGE_BASE_DOC};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub workspace: Workspace,
    pub project_name: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/synthesize/start", post(start_session))
        .route("/api/synthesize/stream", get(stream_session))
        .route("/api/synthesize/sessions/:id", get(session_snapshot))
        .route("/api/dir", get(list_dir))
        .route("/api/file", get(read_file))
        .route("/api/files", get(list_files))
        .route(
            "/api/knowledge-base",
            get(read_knowledge_base).post(save_knowledge_base),
        )
        .route("/api/compose/kb/delete", post(delete_prompt))
        .route("/api/compose/list", get(list_concept_units))
        .route("/api/compose/output", get(compose_output))
        .route("/api/project-info", get(project_info))
        .with_state(state)
}

/// Serve until `shutdown` resolves. Open streams end once their sessions do.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, root = %state.workspace.root().display(), "listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

// ── Sessions ────────────────────────────────────────────────────────

async fn start_session(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Result<Json<StartResponse>> {
    let session_id = state.registry.create(&req.input_dir, &req.key_concepts_file)?;
    Ok(Json(StartResponse { session_id }))
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    session: Option<String>,
    from: Option<u64>,
}

async fn stream_session(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let raw = params
        .session
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| SynthError::invalid("session is required"))?;
    let session_id = parse_session_id(&raw)?;
    let from_seq = resume_point(params.from, &headers);

    let subscriber = state.registry.subscribe(&session_id, from_seq)?;
    tracing::debug!(session_id = %session_id, from_seq, "subscriber connected");

    let guard = DisconnectLog(session_id);
    let events = subscriber.into_stream().map(move |event| {
        let _ = &guard;
        Ok::<_, Infallible>(sse_event(&event))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}

/// `Last-Event-ID` wins over `from`: a browser reconnect resumes after the
/// last event it saw.
fn resume_point(from: Option<u64>, headers: &HeaderMap) -> u64 {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|seq| seq.saturating_add(1))
        .or(from)
        .unwrap_or(0)
}

fn sse_event(event: &LogEvent) -> Event {
    let base = Event::default().id(event.seq.to_string());
    match base.json_data(WireMessage::from(event)) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!(seq = event.seq, error = %e, "failed to encode stream event");
            Event::default().comment("encode error")
        }
    }
}

struct DisconnectLog(SessionId);

impl Drop for DisconnectLog {
    fn drop(&mut self) {
        tracing::debug!(session_id = %self.0, "subscriber disconnected");
    }
}

fn parse_session_id(raw: &str) -> Result<SessionId> {
    raw.parse()
        .map_err(|_| SynthError::not_found(format!("session not found: {raw}")))
}

async fn session_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>> {
    let session_id = parse_session_id(&id)?;
    Ok(Json(state.registry.snapshot(&session_id)?))
}

// ── Collaborators ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DirParams {
    dir: Option<String>,
}

async fn list_dir(
    State(state): State<AppState>,
    Query(params): Query<DirParams>,
) -> Result<Json<DirListing>> {
    Ok(Json(state.workspace.list_dir(params.dir.as_deref()).await?))
}

#[derive(Debug, Deserialize)]
struct FileParams {
    path: Option<String>,
}

async fn read_file(
    State(state): State<AppState>,
    Query(params): Query<FileParams>,
) -> Result<Json<FileContent>> {
    let path = params.path.unwrap_or_default();
    Ok(Json(state.workspace.read_file(&path).await?))
}

async fn list_files(State(state): State<AppState>) -> Result<Json<Value>> {
    let files = state.workspace.list_files().await?;
    Ok(Json(json!({ "files": files })))
}

async fn read_knowledge_base(State(state): State<AppState>) -> Result<Json<Value>> {
    let doc = state.workspace.documents().read(KNOWLEDGE_BASE_DOC).await?;
    Ok(Json(match doc {
        Some(data) => json!({ "exists": true, "data": data }),
        None => json!({ "exists": false }),
    }))
}

#[derive(Debug, Deserialize)]
struct KnowledgeBaseBody {
    #[serde(default)]
    knowledge_units: Value,
}

async fn save_knowledge_base(
    State(state): State<AppState>,
    Json(body): Json<KnowledgeBaseBody>,
) -> Result<Json<Value>> {
    state
        .workspace
        .documents()
        .save_knowledge_units(body.knowledge_units)
        .await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeletePromptBody {
    #[serde(default)]
    prompt_name: String,
}

async fn delete_prompt(
    State(state): State<AppState>,
    Json(body): Json<DeletePromptBody>,
) -> Result<Json<Value>> {
    state.workspace.documents().delete_prompt(&body.prompt_name).await?;
    Ok(Json(json!({ "success": true })))
}

async fn list_concept_units(State(state): State<AppState>) -> Result<Json<Value>> {
    let units = state.workspace.documents().concept_units().await?;
    Ok(Json(json!({ "units": units })))
}

/// Newest compose output, or 404 with `notYetRun` before the first run.
async fn compose_output(State(state): State<AppState>) -> Result<Response> {
    Ok(match state.workspace.documents().latest_compose_output().await? {
        Some(output) => Json(output).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "No compose output files found", "notYetRun": true })),
        )
            .into_response(),
    })
}

async fn project_info(State(state): State<AppState>) -> Result<Json<ProjectInfo>> {
    Ok(Json(
        load_project_info(state.workspace.root(), &state.project_name).await?,
    ))
}
