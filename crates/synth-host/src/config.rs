//! Server configuration, the external task template and the project file.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::error::{Result, SynthError};

pub const DEFAULT_BIND: &str = "127.0.0.1:3000";
pub const DEFAULT_PROJECT_NAME: &str = "Socratic Project";
pub const DEFAULT_TASK_PROGRAM: &str = "socratic";
pub const DEFAULT_TASK_ARGS: &[&str] = &[
    "synth",
    "--input-dir",
    "{input_dir}",
    "--concepts",
    "{key_concepts_file}",
];
pub const PROJECT_FILE: &str = "project.yaml";

const INPUT_DIR_PLACEHOLDER: &str = "{input_dir}";
const KEY_CONCEPTS_PLACEHOLDER: &str = "{key_concepts_file}";

// ── Server options ──────────────────────────────────────────────────

#[derive(Debug, Clone, clap::Args)]
pub struct ServerConfig {
    /// Address the HTTP server listens on.
    #[arg(long, env = "SYNTH_BIND", default_value = DEFAULT_BIND)]
    pub bind: SocketAddr,

    /// Root for relative paths and the JSON document store. Defaults to the
    /// current directory.
    #[arg(long, env = "PROJECT_ROOT")]
    pub project_root: Option<PathBuf>,

    #[arg(long, env = "PROJECT_NAME", default_value = DEFAULT_PROJECT_NAME)]
    pub project_name: String,

    /// Program launched for each session.
    #[arg(long, env = "SYNTH_TASK_PROGRAM", default_value = DEFAULT_TASK_PROGRAM)]
    pub task_program: String,

    /// Argument template; `{input_dir}` and `{key_concepts_file}` are filled
    /// per session.
    #[arg(
        long = "task-arg",
        env = "SYNTH_TASK_ARGS",
        value_delimiter = ' ',
        allow_hyphen_values = true
    )]
    pub task_args: Vec<String>,

    /// How long a finished session stays streamable.
    #[arg(long, env = "SYNTH_RETENTION_SECS", default_value_t = 3600)]
    pub retention_secs: u64,

    #[arg(long, env = "SYNTH_REAP_INTERVAL_SECS", default_value_t = 60)]
    pub reap_interval_secs: u64,
}

impl ServerConfig {
    pub fn task_template(&self) -> TaskTemplate {
        if self.task_args.is_empty() {
            TaskTemplate::new(
                &self.task_program,
                DEFAULT_TASK_ARGS.iter().map(|a| a.to_string()).collect(),
            )
        } else {
            TaskTemplate::new(&self.task_program, self.task_args.clone())
        }
    }

    /// Absolute, symlink-free project root.
    pub fn resolve_project_root(&self) -> std::io::Result<PathBuf> {
        let root = match &self.project_root {
            Some(root) => root.clone(),
            None => std::env::current_dir()?,
        };
        std::fs::canonicalize(root)
    }

    pub fn registry_config(&self, project_root: PathBuf) -> RegistryConfig {
        RegistryConfig {
            project_root,
            task: self.task_template(),
            retention: Duration::from_secs(self.retention_secs),
            reap_interval: Duration::from_secs(self.reap_interval_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub project_root: PathBuf,
    pub task: TaskTemplate,
    pub retention: Duration,
    pub reap_interval: Duration,
}

// ── Task template ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TaskTemplate {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl TaskTemplate {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: vec![
                ("FORCE_COLOR".into(), "1".into()),
                ("PYTHONUNBUFFERED".into(), "1".into()),
            ],
        }
    }

    pub fn render(&self, input_dir: &Path, key_concepts_file: &Path, cwd: &Path) -> TaskSpec {
        let input = input_dir.to_string_lossy();
        let concepts = key_concepts_file.to_string_lossy();
        let args = self
            .args
            .iter()
            .map(|arg| {
                arg.replace(INPUT_DIR_PLACEHOLDER, &input)
                    .replace(KEY_CONCEPTS_PLACEHOLDER, &concepts)
            })
            .collect();
        TaskSpec {
            program: self.program.clone(),
            args,
            cwd: cwd.to_path_buf(),
            env: self.env.clone(),
            input_dir: input_dir.to_path_buf(),
            key_concepts_file: key_concepts_file.to_path_buf(),
        }
    }
}

/// A fully rendered command for one session.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub input_dir: PathBuf,
    pub key_concepts_file: PathBuf,
}

impl TaskSpec {
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ── Project file ────────────────────────────────────────────────────

/// Parse `key: value` lines. Blank lines, `#` comments, lines without a colon
/// and entries with an empty key or value are skipped.
pub fn parse_key_values(content: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if !key.is_empty() && !value.is_empty() {
            values.insert(key.to_string(), value.to_string());
        }
    }
    values
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub project_name: String,
    pub input_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

pub async fn load_project_info(project_root: &Path, default_name: &str) -> Result<ProjectInfo> {
    let path = project_root.join(PROJECT_FILE);
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SynthError::not_found("Project configuration not found"),
            _ => SynthError::io(&path, e),
        })?;
    let mut values = parse_key_values(&content);
    let input_dir = values
        .remove("input_dir")
        .ok_or_else(|| SynthError::invalid("input_dir not found in project configuration"))?;
    Ok(ProjectInfo {
        project_name: values
            .remove("project_name")
            .unwrap_or_else(|| default_name.to_string()),
        input_dir,
        created_at: values.remove("created_at"),
    })
}
