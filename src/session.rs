/// Workload spawning: start the command in its own process group with
/// stdout/stderr piped back so every line can be fingerprinted.
use crate::tracked::ProcessId;
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// A freshly spawned workload.
#[derive(Debug)]
pub struct Session {
    pub child: Child,
    pub id: ProcessId,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

/// Errors that can occur while starting a workload.
#[derive(Debug)]
pub enum SessionError {
    /// No command was given.
    EmptyCommand,
    /// Failed to spawn the subprocess.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// The child exited before its pid could be read.
    NoPid { command: String },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::EmptyCommand => write!(f, "no command given"),
            SessionError::Spawn { command, source } => {
                write!(f, "failed to spawn {command}: {source}")
            }
            SessionError::NoPid { command } => {
                write!(f, "{command} exited before it could be tracked")
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Spawn `command[0]` with `command[1..]` as arguments.
///
/// The subprocess leads a new process group (`process_group(0)`), so its
/// pgid equals its pid and the reaper can signal the whole tree later.
pub fn spawn(command: &[String]) -> Result<Session, SessionError> {
    let (program, args) = command.split_first().ok_or(SessionError::EmptyCommand)?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|e| SessionError::Spawn {
            command: program.clone(),
            source: e,
        })?;

    let pid = child.id().ok_or_else(|| SessionError::NoPid {
        command: program.clone(),
    })? as i32;
    let id = ProcessId { pid, pgid: pid };
    tracing::info!(%id, command = %program, args = ?args, "workload started");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    Ok(Session {
        child,
        id,
        stdout,
        stderr,
    })
}
