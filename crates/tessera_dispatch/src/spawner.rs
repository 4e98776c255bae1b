//! Starting worker processes on local and remote hosts.
//!
//! A [`Session`] is one running process whose stdout the supervisor reads
//! line by line. [`LocalSpawner`] runs every worker as its own child process;
//! [`RemoteSpawner`] keeps one remote shell per host and types a background
//! launch command into it for each worker.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::DispatchError;
use crate::protocol::{WorkerId, CONNECT_MARKER, STDERR_MARKER};

/// A running process with line-oriented output.
#[derive(Debug)]
pub struct Session {
    host: String,
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
    queued: Vec<String>,
}

impl Session {
    /// Starts `argv` with piped stdout, and piped stdin when `interactive`.
    fn start(host: &str, argv: &[String], interactive: bool) -> Result<Self, DispatchError> {
        let spawn_error = |source| DispatchError::Spawn {
            host: host.to_string(),
            command: argv.join(" "),
            source,
        };
        let (program, args) = argv.split_first().ok_or_else(|| {
            spawn_error(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command line",
            ))
        })?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(if interactive {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        let stdout = child.stdout.take().ok_or_else(|| {
            spawn_error(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdout was not captured",
            ))
        })?;
        Ok(Self {
            host: host.to_string(),
            stdin: child.stdin.take(),
            child,
            lines: BufReader::new(stdout).lines(),
            queued: Vec::new(),
        })
    }

    /// Host this session runs on.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Queues a line for the process's stdin. Queued lines are written when
    /// the supervisor next waits on this session.
    pub fn queue_line(&mut self, line: impl Into<String>) {
        self.queued.push(line.into());
    }

    async fn flush_queued(&mut self) -> Result<(), DispatchError> {
        for line in std::mem::take(&mut self.queued) {
            self.send_line(&line).await?;
        }
        Ok(())
    }

    /// Writes one line to the process's stdin.
    pub async fn send_line(&mut self, line: &str) -> Result<(), DispatchError> {
        let context = format!("writing to session on {}", self.host);
        let stdin = self.stdin.as_mut().ok_or_else(|| DispatchError::Io {
            context: context.clone(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin is closed"),
        })?;
        stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(DispatchError::io(context.clone()))?;
        stdin.flush().await.map_err(DispatchError::io(context))
    }

    /// Waits for worker `id` to print [`CONNECT_MARKER`] followed by
    /// [`STDERR_MARKER`], returning the lines printed between them.
    ///
    /// Queued input is written first. Lines before the first marker are
    /// discarded.
    pub async fn await_markers(
        &mut self,
        id: WorkerId,
        timeout: Duration,
    ) -> Result<Vec<String>, DispatchError> {
        self.flush_queued().await?;
        let host = self.host.clone();
        let lines = &mut self.lines;
        let wait = async {
            let mut connected = false;
            let mut between = Vec::new();
            loop {
                let line = lines
                    .next_line()
                    .await
                    .map_err(DispatchError::io(format!("reading output of worker {id}")))?;
                let Some(line) = line else {
                    return Err(DispatchError::WorkerExited {
                        id,
                        host: host.clone(),
                    });
                };
                if !connected {
                    if line.contains(CONNECT_MARKER) {
                        connected = true;
                    } else {
                        tracing::debug!(id, "pre-handshake output: {line}");
                    }
                } else if line.contains(STDERR_MARKER) {
                    return Ok(between);
                } else {
                    between.push(line);
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::LaunchTimeout {
                id,
                host: self.host.clone(),
                waited: timeout,
            }),
        }
    }

    /// Closes stdin and waits up to `grace` for the process to exit.
    /// A process still running afterwards is killed.
    pub async fn close(mut self, grace: Duration) {
        drop(self.stdin.take());
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(host = %self.host, %status, "session ended"),
            Ok(Err(e)) => tracing::warn!(host = %self.host, "cannot wait for session: {e}"),
            Err(_) => {
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(host = %self.host, "cannot kill session: {e}");
                }
            }
        }
    }
}

/// Starts worker processes on some class of hosts.
pub trait Spawner {
    /// Launches `command` on `host`, returning the session whose output
    /// carries the new worker's readiness markers.
    fn spawn(&mut self, host: &str, command: &str) -> Result<&mut Session, DispatchError>;

    /// Hands over every session started so far.
    fn into_sessions(self: Box<Self>) -> Vec<Session>;
}

/// Runs each worker as a direct child process.
#[derive(Debug, Default)]
pub struct LocalSpawner {
    sessions: Vec<Session>,
}

impl LocalSpawner {
    /// A spawner with no sessions.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Spawner for LocalSpawner {
    fn spawn(&mut self, host: &str, command: &str) -> Result<&mut Session, DispatchError> {
        let argv = shell_words::split(command).map_err(|e| DispatchError::InvalidCommand {
            template: command.to_string(),
            reason: e.to_string(),
        })?;
        let index = self.sessions.len();
        self.sessions.push(Session::start(host, &argv, false)?);
        Ok(&mut self.sessions[index])
    }

    fn into_sessions(self: Box<Self>) -> Vec<Session> {
        self.sessions
    }
}

/// Runs workers through one remote shell per host.
///
/// The first worker on a host opens the shell and queues the optional
/// environment command; every worker is then started as a background job of
/// that shell so its output arrives on the shell's stdout.
#[derive(Debug)]
pub struct RemoteSpawner {
    shell: Vec<String>,
    env_command: Option<String>,
    sessions: BTreeMap<String, Session>,
}

impl RemoteSpawner {
    /// `shell` is the remote shell argv with a `{host}` placeholder.
    pub fn new(shell: Vec<String>, env_command: Option<String>) -> Self {
        Self {
            shell,
            env_command,
            sessions: BTreeMap::new(),
        }
    }

    fn shell_argv(&self, host: &str) -> Vec<String> {
        self.shell
            .iter()
            .map(|arg| arg.replace("{host}", host))
            .collect()
    }
}

impl Spawner for RemoteSpawner {
    fn spawn(&mut self, host: &str, command: &str) -> Result<&mut Session, DispatchError> {
        let argv = self.shell_argv(host);
        let session = match self.sessions.entry(host.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut session = Session::start(host, &argv, true)?;
                if let Some(env) = &self.env_command {
                    session.queue_line(env.clone());
                }
                entry.insert(session)
            }
        };
        session.queue_line(format!("{command} &"));
        Ok(session)
    }

    fn into_sessions(self: Box<Self>) -> Vec<Session> {
        self.sessions.into_values().collect()
    }
}
