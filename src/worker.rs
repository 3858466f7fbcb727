//! # Transcoder worker processes
//!
//! One worker is an `avconv`/`ffmpeg` process remuxing a single upstream
//! source into MPEG-TS on its standard output.
//!
//! ## Invocation
//!
//! ```text
//! avconv -re -i <source> -vcodec copy -acodec copy \
//!        -metadata service_provider=<provider> -metadata service_name=<name> \
//!        -f mpegts -
//! ```
//!
//! ## Exit classification
//!
//! `ExitPolicy` decides whether a dead worker is replaced or the whole stream
//! is abandoned. The transcoder exits with 255 when the upstream drops, which
//! is the only code retried by default.

use std::fmt;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

use crate::errors::{GatewayError, Result};
use crate::sources::SourceDescriptor;

/// Exit code the transcoder uses for a recoverable failure.
pub const TRANSIENT_EXIT_CODE: i32 = 255;

/// Program plus arguments for one worker launch. Identical for every respawn
/// within a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Stream-copy remux of `source` into MPEG-TS on stdout.
    pub fn for_source(program: impl Into<String>, source: &SourceDescriptor) -> Self {
        Self::new(
            program,
            [
                "-re".to_string(),
                "-i".to_string(),
                source.upstream.clone(),
                "-vcodec".to_string(),
                "copy".to_string(),
                "-acodec".to_string(),
                "copy".to_string(),
                "-metadata".to_string(),
                format!("service_provider={}", source.provider),
                "-metadata".to_string(),
                format!("service_name={}", source.name),
                "-f".to_string(),
                "mpegts".to_string(),
                "-".to_string(), // stdout
            ],
        )
    }
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// What to do after a worker has died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    /// Transient failure: start an identical worker on the same response.
    Respawn,
    /// Give up on the session and end the response.
    Abort,
}

/// Maps a worker's exit code to an [`ExitDecision`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitPolicy {
    retry_codes: Vec<i32>,
}

impl ExitPolicy {
    pub fn new(retry_codes: Vec<i32>) -> Self {
        Self { retry_codes }
    }

    /// `None` means the process was terminated by a signal, which never
    /// counts as transient.
    pub fn classify(&self, code: Option<i32>) -> ExitDecision {
        match code {
            Some(code) if self.retry_codes.contains(&code) => ExitDecision::Respawn,
            _ => ExitDecision::Abort,
        }
    }

    pub fn retry_codes(&self) -> &[i32] {
        &self.retry_codes
    }
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self::new(vec![TRANSIENT_EXIT_CODE])
    }
}

/// A running worker process.
///
/// The handle is owned by exactly one supervisor and is replaced, not reused,
/// when the worker is respawned.
pub struct Worker {
    pid: Option<u32>,
    child: Child,
    stdout: Option<ChildStdout>,
    killed: bool,
}

impl Worker {
    /// Spawn the process described by `command`.
    ///
    /// stderr is drained in the background and logged at debug so the
    /// transcoder never blocks on a full pipe.
    pub fn launch(command: &WorkerCommand, session_id: u64) -> Result<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| GatewayError::WorkerSpawn {
                program: command.program.clone(),
                source,
            })?;

        let pid = child.id();

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(session = session_id, pid, "worker stderr: {}", line);
                }
            });
        }

        let stdout = child.stdout.take();

        Ok(Self {
            pid,
            child,
            stdout,
            killed: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the output stream. Returns `None` after the first call.
    pub fn take_output(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Send a kill signal without waiting for the process to go away.
    ///
    /// Only the first call signals; later calls are no-ops. The exit status is
    /// reaped by tokio once the handle is dropped.
    pub fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;

        if let Err(e) = self.child.start_kill() {
            warn!(pid = self.pid, error = %e, "failed to kill worker process");
        }
    }

    #[cfg(test)]
    fn is_killed(&self) -> bool {
        self.killed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn source() -> SourceDescriptor {
        SourceDescriptor {
            route: "/tv".to_string(),
            upstream: "rtsp://camera.local/live".to_string(),
            provider: "Acme Broadcasting".to_string(),
            name: "Channel One".to_string(),
        }
    }

    #[test]
    fn test_command_for_source() {
        let cmd = WorkerCommand::for_source("ffmpeg", &source());

        assert_eq!(cmd.program, "ffmpeg");
        assert_eq!(
            cmd.args,
            vec![
                "-re",
                "-i",
                "rtsp://camera.local/live",
                "-vcodec",
                "copy",
                "-acodec",
                "copy",
                "-metadata",
                "service_provider=Acme Broadcasting",
                "-metadata",
                "service_name=Channel One",
                "-f",
                "mpegts",
                "-",
            ]
        );
    }

    #[test]
    fn test_default_policy_retries_sentinel_only() {
        let policy = ExitPolicy::default();

        assert_eq!(policy.classify(Some(255)), ExitDecision::Respawn);
        assert_eq!(policy.classify(Some(0)), ExitDecision::Abort);
        assert_eq!(policy.classify(Some(1)), ExitDecision::Abort);
        assert_eq!(policy.classify(None), ExitDecision::Abort);
    }

    #[test]
    fn test_custom_policy() {
        let policy = ExitPolicy::new(vec![1, 2]);

        assert_eq!(policy.classify(Some(2)), ExitDecision::Respawn);
        assert_eq!(policy.classify(Some(255)), ExitDecision::Abort);
    }

    #[tokio::test]
    async fn test_launch_reads_output_and_exit_code() {
        let cmd = WorkerCommand::new("sh", ["-c", "printf hello; exit 7"]);
        let mut worker = Worker::launch(&cmd, 1).unwrap();
        assert!(worker.pid().is_some());

        let mut out = String::new();
        worker.take_output().unwrap().read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello");
        assert!(worker.take_output().is_none());

        let status = worker.wait().await.unwrap();
        assert_eq!(status.code(), Some(7));
    }

    #[tokio::test]
    async fn test_launch_missing_binary() {
        let cmd = WorkerCommand::new("/nonexistent/avconv", Vec::<String>::new());
        assert!(matches!(
            Worker::launch(&cmd, 1),
            Err(GatewayError::WorkerSpawn { program, .. }) if program == "/nonexistent/avconv"
        ));
    }

    #[tokio::test]
    async fn test_kill_is_signalled_once() {
        let cmd = WorkerCommand::new("sh", ["-c", "exec sleep 30"]);
        let mut worker = Worker::launch(&cmd, 1).unwrap();

        worker.kill();
        worker.kill();
        assert!(worker.is_killed());

        let status = worker.wait().await.unwrap();
        assert_eq!(status.code(), None);
    }
}
