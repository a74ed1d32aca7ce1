//! Reusable test harness for synth-host integration tests.
//!
//! Starts the real router in-process on an ephemeral port over a scratch
//! project root, and parses the SSE stream into frames.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use synth_host::config::{RegistryConfig, TaskTemplate};
use synth_host::registry::SessionRegistry;
use synth_host::server::{self, AppState};
use synth_host::workspace::Workspace;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const STREAM_TIMEOUT: Duration = Duration::from_secs(10);

// ── SSE frames ──────────────────────────────────────────────────────

/// One dispatched SSE event: `id` and the parsed JSON `data`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub id: Option<u64>,
    pub data: Value,
}

impl Frame {
    pub fn kind(&self) -> &str {
        self.data["type"].as_str().unwrap_or("")
    }

    pub fn line(&self) -> Option<&str> {
        self.data["line"].as_str()
    }

    pub fn status(&self) -> Option<&str> {
        self.data["status"].as_str()
    }
}

/// Parse a complete SSE body. Comment lines (keep-alives) are skipped.
pub fn parse_sse(body: &str) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut id = None;
    let mut data = String::new();
    for raw in body.split('\n') {
        let line = raw.trim_end_matches('\r');
        if line.is_empty() {
            if !data.is_empty() {
                frames.push(Frame {
                    id,
                    data: serde_json::from_str(&data).expect("stream data is JSON"),
                });
            }
            id = None;
            data.clear();
        } else if let Some(value) = line.strip_prefix("id:") {
            id = value.trim().parse().ok();
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push_str(value.strip_prefix(' ').unwrap_or(value));
        }
    }
    frames
}

pub fn lines(frames: &[Frame]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| f.line().map(str::to_string))
        .collect()
}

// ── TestServer ──────────────────────────────────────────────────────

/// In-process server over a temp project root. Stops the server and
/// terminates any running tasks on drop.
pub struct TestServer {
    pub base_url: String,
    pub root: PathBuf,
    pub registry: Arc<SessionRegistry>,
    pub http: reqwest::Client,
    _dir: tempfile::TempDir,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// `script` runs under `/bin/sh -c` with `$1` = input dir and
    /// `$2` = key concepts file. The root holds `in/` and `concepts.txt`.
    pub async fn start(script: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = std::fs::canonicalize(dir.path()).expect("canonical root");
        std::fs::create_dir(root.join("in")).expect("input dir");
        std::fs::write(root.join("concepts.txt"), "socratic method\n").expect("concepts file");

        let task = TaskTemplate::new(
            "/bin/sh",
            vec![
                "-c".into(),
                script.into(),
                "sh".into(),
                "{input_dir}".into(),
                "{key_concepts_file}".into(),
            ],
        );
        let registry = Arc::new(SessionRegistry::new(RegistryConfig {
            project_root: root.clone(),
            task,
            retention: Duration::from_secs(3600),
            reap_interval: Duration::from_secs(60),
        }));
        let state = AppState {
            registry: Arc::clone(&registry),
            workspace: Workspace::new(root.clone()),
            project_name: "Test Project".into(),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = server::serve(listener, state, async move {
                let _ = stopped.await;
            })
            .await;
        });

        Self {
            base_url: format!("http://{addr}"),
            root,
            registry,
            http: reqwest::Client::new(),
            _dir: dir,
            stop: Some(stop),
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub async fn post_start(&self, input_dir: &str, key_concepts_file: &str) -> reqwest::Response {
        self.http
            .post(self.url("/api/synthesize/start"))
            .json(&serde_json::json!({
                "inputDir": input_dir,
                "keyConceptsFile": key_concepts_file,
            }))
            .send()
            .await
            .expect("start request")
    }

    /// Start a session on the default inputs and return its id.
    pub async fn start_session(&self) -> String {
        let response = self.post_start("in", "concepts.txt").await;
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.expect("start body");
        body["sessionId"].as_str().expect("sessionId").to_string()
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.http.get(self.url(path)).send().await.expect("GET")
    }

    pub async fn open_stream(&self, query: &str) -> reqwest::Response {
        self.get(&format!("/api/synthesize/stream?{query}")).await
    }

    /// Read a session's stream to completion.
    pub async fn read_stream(&self, session_id: &str) -> Vec<Frame> {
        self.read_stream_query(&format!("session={session_id}")).await
    }

    pub async fn read_stream_query(&self, query: &str) -> Vec<Frame> {
        let response = self.open_stream(query).await;
        assert_eq!(response.status(), 200, "stream refused for {query}");
        let body = tokio::time::timeout(STREAM_TIMEOUT, response.text())
            .await
            .expect("stream did not close")
            .expect("stream body");
        parse_sse(&body)
    }

    pub async fn snapshot(&self, session_id: &str) -> Value {
        self.get(&format!("/api/synthesize/sessions/{session_id}"))
            .await
            .json()
            .await
            .expect("snapshot body")
    }

    /// Poll the snapshot until `status` is reached.
    pub async fn wait_for_status(&self, session_id: &str, status: &str) -> Value {
        tokio::time::timeout(STREAM_TIMEOUT, async {
            loop {
                let snap = self.snapshot(session_id).await;
                if snap["status"] == status {
                    return snap;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("session never reached {status}"))
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("parent dir");
        }
        std::fs::write(path, content).expect("write fixture");
    }

    pub fn root_str(&self) -> &str {
        self.root.to_str().expect("utf-8 root")
    }

    pub fn exists(&self, rel: &str) -> bool {
        Path::new(&self.path(rel)).exists()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.registry.shutdown();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.handle.abort();
    }
}
