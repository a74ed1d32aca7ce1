//! `socratic-synth-host`: serve the synthesis API, or start and follow a
//! session against a running server.
//!
//! Usage:
//!   socratic-synth-host serve [--bind ADDR] [--project-root DIR] ...
//!   socratic-synth-host start --input-dir DIR --key-concepts-file FILE
//!   socratic-synth-host watch

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use synth_host::client::{follow, SynthClient, DEFAULT_SERVER_URL};
use synth_host::config::ServerConfig;
use synth_host::registry::SessionRegistry;
use synth_host::server::{self, AppState};
use synth_host::session::SessionStatus;
use synth_host::tracker::SessionTracker;
use synth_host::workspace::Workspace;

const DEFAULT_STATE_FILE: &str = ".synth-session.json";

#[derive(Parser, Debug)]
#[command(name = "socratic-synth-host", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server.
    Serve(ServerConfig),
    /// Start a session and follow its output until it finishes.
    Start {
        #[command(flatten)]
        client: ClientArgs,
        #[arg(long)]
        input_dir: String,
        #[arg(long)]
        key_concepts_file: String,
    },
    /// Reattach to the tracked session, replaying its full log.
    Watch {
        #[command(flatten)]
        client: ClientArgs,
    },
}

#[derive(clap::Args, Debug)]
struct ClientArgs {
    #[arg(long, env = "SYNTH_URL", default_value = DEFAULT_SERVER_URL)]
    url: String,
    /// Where the tracked session and its cached lines are kept.
    #[arg(long, env = "SYNTH_STATE_FILE", default_value = DEFAULT_STATE_FILE)]
    state_file: PathBuf,
    /// Also write the rendered log as HTML.
    #[arg(long)]
    html: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve(config) => serve(config).await.map(|()| ExitCode::SUCCESS),
        Command::Start {
            client,
            input_dir,
            key_concepts_file,
        } => start(client, &input_dir, &key_concepts_file).await,
        Command::Watch { client } => watch(client).await,
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// ── serve ───────────────────────────────────────────────────────────

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let root = config
        .resolve_project_root()
        .context("project root is not accessible")?;
    let registry = Arc::new(SessionRegistry::new(config.registry_config(root.clone())));
    let reaper = registry.spawn_reaper();

    let state = AppState {
        registry: Arc::clone(&registry),
        workspace: Workspace::new(root),
        project_name: config.project_name.clone(),
    };
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;

    let on_stop = Arc::clone(&registry);
    server::serve(listener, state, async move {
        shutdown_signal().await;
        let signalled = on_stop.shutdown();
        tracing::info!(signalled, "shutting down");
    })
    .await
    .context("server error")?;

    reaper.abort();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ── start / watch ───────────────────────────────────────────────────

async fn start(args: ClientArgs, input_dir: &str, key_concepts_file: &str) -> anyhow::Result<ExitCode> {
    let client = SynthClient::new(&args.url);
    let project_root = client.project_root().await?;
    let mut tracker = SessionTracker::open(&args.state_file, &project_root)?;

    if !tracker.request_start() {
        if let Some(session) = tracker.session() {
            bail!(
                "session {} is still running; use `watch` to follow it",
                session.session_id
            );
        }
    }

    let session_id = client.start(input_dir, key_concepts_file).await?;
    tracker.begin_session(session_id)?;
    tracing::info!(session_id = %session_id, "session started");

    let status = follow(&client, &mut tracker, session_id, print_line).await?;
    finish(&tracker, args.html.as_deref(), status)
}

async fn watch(args: ClientArgs) -> anyhow::Result<ExitCode> {
    let client = SynthClient::new(&args.url);
    let project_root = client.project_root().await?;
    let mut tracker = SessionTracker::open(&args.state_file, &project_root)?;

    let Some(session) = tracker.session() else {
        bail!("no tracked session for {project_root}");
    };

    let status = if tracker.expects_events() {
        tracing::info!(session_id = %session.session_id, "reconnecting");
        follow(&client, &mut tracker, session.session_id, print_line).await?
    } else {
        for line in tracker.log_lines() {
            print_line(line);
        }
        session.status
    };
    finish(&tracker, args.html.as_deref(), status)
}

fn print_line(line: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{line}");
}

fn finish(tracker: &SessionTracker, html: Option<&Path>, status: SessionStatus) -> anyhow::Result<ExitCode> {
    if let Some(path) = html {
        std::fs::write(path, tracker.render_html())
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    tracing::info!(%status, "session finished");
    Ok(match status {
        SessionStatus::Succeeded => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}
