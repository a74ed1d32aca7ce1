//! Drives one session: launch the task, turn its combined output into log
//! events, and record the terminal status.

use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};

use crate::buffer::BufferWriter;
use crate::config::TaskSpec;
use crate::error::{Result, SynthError};
use crate::registry::SessionEntry;
use crate::session::SessionStatus;

const READ_BUF_SIZE: usize = 65536;

// ── Line splitting ──────────────────────────────────────────────────

/// Reassembles `\n`-terminated lines from arbitrary read chunks. Bytes are
/// held until the line is complete so multi-byte characters split across
/// reads decode correctly.
#[derive(Debug, Default)]
pub struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    /// Feed one chunk; returns every line it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            lines.push(take_line(&mut self.partial));
            rest = &rest[pos + 1..];
        }
        self.partial.extend_from_slice(rest);
        lines
    }

    /// The unterminated tail left at end of input, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(take_line(&mut self.partial))
        }
    }
}

fn take_line(buf: &mut Vec<u8>) -> String {
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    line
}

// ── Runner ──────────────────────────────────────────────────────────

/// Run `task` to completion for `entry`. Always leaves the session terminal
/// and the buffer closed with a final status event.
pub async fn run(entry: Arc<SessionEntry>, mut writer: BufferWriter, task: TaskSpec) -> SessionStatus {
    let session_id = entry.id();

    if let Err(err) = preflight(&task).await {
        return fail(&entry, writer, &err, None);
    }

    let (mut child, output) = match spawn(&task) {
        Ok(spawned) => spawned,
        Err(e) => {
            let err = SynthError::SpawnFailure(format!("{}: {e}", task.program));
            return fail(&entry, writer, &err, None);
        }
    };

    let pid = child.id();
    entry.mark_running(pid);
    tracing::info!(session_id = %session_id, pid, command = %task.display(), "task started");

    let read_result = pump(output, &mut writer).await;
    if read_result.is_err() {
        // Nobody is draining the pipe any more.
        let _ = child.start_kill();
    }
    let exit = child.wait().await;

    match (read_result, exit) {
        (Ok(()), Ok(status)) => {
            let code = exit_code(status);
            tracing::info!(session_id = %session_id, exit_code = code, "task exited");
            if code == 0 {
                entry.complete(SessionStatus::Succeeded, Some(code));
                writer.finish(SessionStatus::Succeeded, Some(code));
                SessionStatus::Succeeded
            } else {
                writer.append_log(format!("[ERR] task exited with code {code}"));
                entry.complete(SessionStatus::Failed, Some(code));
                writer.finish(SessionStatus::Failed, Some(code));
                SessionStatus::Failed
            }
        }
        (Err(source), exit) => {
            let code = exit.ok().map(exit_code);
            fail(&entry, writer, &SynthError::StreamIo { source }, code)
        }
        (Ok(()), Err(source)) => fail(&entry, writer, &SynthError::StreamIo { source }, None),
    }
}

async fn preflight(task: &TaskSpec) -> Result<()> {
    let is_dir = tokio::fs::metadata(&task.input_dir)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return Err(SynthError::SpawnFailure(format!(
            "input directory not found: {}",
            task.input_dir.display()
        )));
    }
    let is_file = tokio::fs::metadata(&task.key_concepts_file)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !is_file {
        return Err(SynthError::SpawnFailure(format!(
            "key concepts file not found: {}",
            task.key_concepts_file.display()
        )));
    }
    Ok(())
}

/// Spawn with stdout and stderr sharing one pipe, so the parent reads a single
/// stream in write order.
fn spawn(task: &TaskSpec) -> io::Result<(Child, pipe::Receiver)> {
    let (reader, stdout) = io::pipe()?;
    let stderr = stdout.try_clone()?;

    let mut command = Command::new(&task.program);
    command
        .args(&task.args)
        .current_dir(&task.cwd)
        .envs(task.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);
    let child = command.spawn()?;
    // Release our copies of the write end, otherwise EOF never arrives.
    drop(command);

    let output = pipe::Receiver::from_file(File::from(OwnedFd::from(reader)))?;
    Ok((child, output))
}

/// Copy output into the buffer line by line until EOF. A trailing partial line
/// is flushed even when reading fails.
async fn pump(mut output: pipe::Receiver, writer: &mut BufferWriter) -> io::Result<()> {
    let mut splitter = LineSplitter::default();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    let result = loop {
        match output.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    writer.append_log(line);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(e),
        }
    };

    if let Some(rest) = splitter.finish() {
        writer.append_log(rest);
    }
    result
}

fn fail(
    entry: &SessionEntry,
    mut writer: BufferWriter,
    err: &SynthError,
    exit_code: Option<i32>,
) -> SessionStatus {
    tracing::warn!(session_id = %entry.id(), error = %err, "task failed");
    writer.append_log(format!("[ERR] {err}"));
    entry.complete(SessionStatus::Failed, exit_code);
    writer.finish(SessionStatus::Failed, exit_code);
    SessionStatus::Failed
}

/// Process exit code, or `128 + signal` when the task was killed.
fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

// ── Unit tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{EventPayload, LogBuffer};
    use crate::config::TaskTemplate;
    use crate::session::{SessionId, SessionRecord};
    use std::path::Path;

    #[test]
    fn splitter_joins_partial_lines_across_chunks() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(b"hel").is_empty());
        assert_eq!(splitter.push(b"lo\nwor"), vec!["hello"]);
        assert_eq!(splitter.push(b"ld\r\n\nx"), vec!["world", ""]);
        assert_eq!(splitter.finish().as_deref(), Some("x"));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn splitter_keeps_multibyte_chars_split_across_reads() {
        let bytes = "héllo\n".as_bytes();
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(&bytes[..2]).is_empty());
        assert_eq!(splitter.push(&bytes[2..]), vec!["héllo"]);
    }

    #[test]
    fn splitter_strips_carriage_return_on_trailing_line() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(b"tail\r").is_empty());
        assert_eq!(splitter.finish().as_deref(), Some("tail"));
    }

    #[test]
    fn exit_code_reports_signals_as_128_plus() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        // Raw wait status 9 = killed by SIGKILL.
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
    }

    fn entry_for(input: &Path, concepts: &Path) -> (Arc<SessionEntry>, BufferWriter) {
        let (writer, buffer) = LogBuffer::channel();
        let record = SessionRecord::new(SessionId::new(), input.into(), concepts.into());
        (Arc::new(SessionEntry::new(record, buffer)), writer)
    }

    fn sh(script: &str, root: &Path) -> TaskSpec {
        TaskTemplate::new(
            "/bin/sh",
            vec![
                "-c".into(),
                script.into(),
                "sh".into(),
                "{input_dir}".into(),
                "{key_concepts_file}".into(),
            ],
        )
        .render(&root.join("in"), &root.join("concepts.txt"), root)
    }

    fn scratch() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("in")).unwrap();
        std::fs::write(dir.path().join("concepts.txt"), "a\nb\n").unwrap();
        dir
    }

    fn lines(buffer: &LogBuffer) -> Vec<String> {
        buffer
            .snapshot()
            .into_iter()
            .filter_map(|e| match e.payload {
                EventPayload::Log { line } => Some(line),
                EventPayload::Status { .. } => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn successful_task_streams_combined_output() {
        let dir = scratch();
        let task = sh("echo out; echo err >&2; printf 'no newline'", dir.path());
        let (entry, writer) = entry_for(&task.input_dir, &task.key_concepts_file);

        let status = run(Arc::clone(&entry), writer, task).await;
        assert_eq!(status, SessionStatus::Succeeded);
        assert_eq!(lines(entry.buffer()), vec!["out", "err", "no newline"]);

        let events = entry.buffer().snapshot();
        assert_eq!(
            events.last().unwrap().payload,
            EventPayload::Status {
                status: SessionStatus::Succeeded,
                exit_code: Some(0)
            }
        );
        let record = entry.record();
        assert_eq!(record.status, SessionStatus::Succeeded);
        assert_eq!(record.exit_code, Some(0));
        assert!(record.pid.is_none());
    }

    #[tokio::test]
    async fn task_receives_rendered_arguments_and_env() {
        let dir = scratch();
        let task = sh("cat \"$2\"; echo \"color=$FORCE_COLOR\"", dir.path());
        let (entry, writer) = entry_for(&task.input_dir, &task.key_concepts_file);
        run(Arc::clone(&entry), writer, task).await;
        assert_eq!(lines(entry.buffer()), vec!["a", "b", "color=1"]);
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_code() {
        let dir = scratch();
        let task = sh("echo working; exit 3", dir.path());
        let (entry, writer) = entry_for(&task.input_dir, &task.key_concepts_file);

        assert_eq!(run(Arc::clone(&entry), writer, task).await, SessionStatus::Failed);
        assert_eq!(lines(entry.buffer()), vec!["working", "[ERR] task exited with code 3"]);
        assert_eq!(entry.record().exit_code, Some(3));
        assert!(entry.buffer().is_closed());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_failure() {
        let dir = scratch();
        let mut task = sh("true", dir.path());
        task.program = "/definitely/not/here".into();
        let (entry, writer) = entry_for(&task.input_dir, &task.key_concepts_file);

        assert_eq!(run(Arc::clone(&entry), writer, task).await, SessionStatus::Failed);
        let lines = lines(entry.buffer());
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("[ERR] failed to start task: /definitely/not/here"));
        assert_eq!(entry.record().exit_code, None);
    }

    #[tokio::test]
    async fn missing_concepts_file_fails_before_spawn() {
        let dir = scratch();
        std::fs::remove_file(dir.path().join("concepts.txt")).unwrap();
        let task = sh("echo should-not-run", dir.path());
        let (entry, writer) = entry_for(&task.input_dir, &task.key_concepts_file);

        assert_eq!(run(Arc::clone(&entry), writer, task).await, SessionStatus::Failed);
        let lines = lines(entry.buffer());
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("key concepts file not found"));
        assert_eq!(entry.record().status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn high_volume_output_keeps_every_line_in_order() {
        let dir = scratch();
        let task = sh("i=0; while [ $i -lt 5000 ]; do echo line-$i; i=$((i+1)); done", dir.path());
        let (entry, writer) = entry_for(&task.input_dir, &task.key_concepts_file);
        run(Arc::clone(&entry), writer, task).await;

        let lines = lines(entry.buffer());
        assert_eq!(lines.len(), 5000);
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(line, &format!("line-{i}"));
        }
    }
}
