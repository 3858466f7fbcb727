//! # Process Supervisor
//!
//! Owns the worker process of one streaming session and keeps the response
//! fed across transient worker deaths.
//!
//! ## States
//!
//! ```text
//!  Starting ──spawn ok──▶ Streaming ──death, Respawn──▶ Respawning ──spawn ok──┐
//!                            ▲                                                │
//!                            └────────────────────────────────────────────────┘
//!
//!  any non-terminal ──stop()──────────────────▶ Stopped      (terminal)
//!  any non-terminal ──Abort / spawn failure──▶ Terminating  (terminal)
//! ```
//!
//! A worker's death is observed as two events: its stdout reaching end of
//! data and the process exiting. They can arrive in either order. The
//! supervisor waits for both before deciding, so every death produces exactly
//! one decision. The output is drained whatever the exit code, so bytes
//! written just before a fatal exit still reach the client.
//!
//! The response sink is closed in exactly one place, when the event loop
//! returns, whichever path ended it.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::Result;
use crate::pipe::{self, PipeEnd, ResponseSink};
use crate::worker::{ExitDecision, ExitPolicy, Worker, WorkerCommand};

/// Lifecycle of a session's worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Streaming,
    Respawning,
    Terminating,
    Stopped,
}

impl SupervisorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SupervisorState::Terminating | SupervisorState::Stopped)
    }

    /// The state reached when `next` is requested. Terminal states are never
    /// left.
    pub fn transition(self, next: SupervisorState) -> SupervisorState {
        if self.is_terminal() {
            self
        } else {
            next
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// `stop()` was called or the client disconnected.
    Cancelled,
    /// A worker exited with a code the policy does not retry.
    WorkerFatal { code: Option<i32> },
    /// A replacement worker could not be started.
    SpawnFailed,
}

/// Returned by [`SupervisorHandle::join`] once the session is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: u64,
    pub spawns: u32,
    pub state: SupervisorState,
    pub end: SessionEnd,
}

/// Cloneable cancellation switch for one supervisor.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Request cancellation. Returns `true` only for the call that actually
    /// stopped the session.
    pub fn stop(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Owner-side handle of a running supervisor.
#[derive(Debug)]
pub struct SupervisorHandle {
    stopper: StopHandle,
    task: JoinHandle<SessionSummary>,
}

impl SupervisorHandle {
    pub fn stop(&self) -> bool {
        self.stopper.stop()
    }

    pub fn stopper(&self) -> StopHandle {
        self.stopper.clone()
    }

    /// Wait for the session to end.
    pub async fn join(self) -> std::result::Result<SessionSummary, tokio::task::JoinError> {
        self.task.await
    }
}

/// How supervising a single worker ended.
enum WorkerEnd {
    Stopped,
    Died { decision: ExitDecision, code: Option<i32> },
}

pub struct Supervisor {
    session_id: u64,
    command: WorkerCommand,
    policy: ExitPolicy,
    state: SupervisorState,
    spawns: u32,
}

impl Supervisor {
    /// Spawn the first worker and hand its output to `sink`.
    ///
    /// The first spawn happens before this returns so a missing or
    /// non-executable transcoder is reported to the caller while the response
    /// can still carry an error status. Everything after that runs on its own
    /// task.
    pub fn start(
        session_id: u64,
        command: WorkerCommand,
        policy: ExitPolicy,
        sink: ResponseSink,
    ) -> Result<SupervisorHandle> {
        let mut supervisor = Supervisor {
            session_id,
            command,
            policy,
            state: SupervisorState::Starting,
            spawns: 0,
        };

        let worker = supervisor.launch()?;

        let (tx, rx) = watch::channel(false);
        let stopper = StopHandle { tx: Arc::new(tx) };
        let task = tokio::spawn(supervisor.run(worker, sink, rx));

        Ok(SupervisorHandle { stopper, task })
    }

    fn enter(&mut self, next: SupervisorState) {
        let reached = self.state.transition(next);
        if reached != self.state {
            debug!(
                session = self.session_id,
                from = ?self.state,
                to = ?reached,
                "supervisor state change"
            );
        }
        self.state = reached;
    }

    fn launch(&mut self) -> Result<Worker> {
        let worker = Worker::launch(&self.command, self.session_id)?;
        self.spawns += 1;

        debug!(
            session = self.session_id,
            pid = worker.pid(),
            spawn = self.spawns,
            cmd = %self.command,
            "worker started"
        );
        Ok(worker)
    }

    async fn run(
        mut self,
        mut worker: Worker,
        sink: ResponseSink,
        mut stop_rx: watch::Receiver<bool>,
    ) -> SessionSummary {
        let end = loop {
            self.enter(SupervisorState::Streaming);

            match self.supervise(&mut worker, &sink, &mut stop_rx).await {
                WorkerEnd::Stopped => {
                    self.enter(SupervisorState::Stopped);
                    break SessionEnd::Cancelled;
                }
                WorkerEnd::Died {
                    decision: ExitDecision::Abort,
                    code,
                } => {
                    self.enter(SupervisorState::Terminating);
                    break SessionEnd::WorkerFatal { code };
                }
                WorkerEnd::Died {
                    decision: ExitDecision::Respawn,
                    ..
                } => {}
            }

            // stop() may have landed while the old worker was dying.
            let stopped = *stop_rx.borrow();
            if stopped {
                self.enter(SupervisorState::Stopped);
                break SessionEnd::Cancelled;
            }

            self.enter(SupervisorState::Respawning);
            match self.launch() {
                Ok(next) => worker = next,
                Err(e) => {
                    error!(
                        session = self.session_id,
                        error = %e,
                        "failed to respawn worker, aborting"
                    );
                    self.enter(SupervisorState::Terminating);
                    break SessionEnd::SpawnFailed;
                }
            }
        };

        drop(worker);
        sink.close();

        info!(
            session = self.session_id,
            spawns = self.spawns,
            end = ?end,
            "session ended"
        );

        SessionSummary {
            session_id: self.session_id,
            spawns: self.spawns,
            state: self.state,
            end,
        }
    }

    /// Forward one worker's output until it dies or the session is stopped.
    async fn supervise(
        &self,
        worker: &mut Worker,
        sink: &ResponseSink,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> WorkerEnd {
        let session = self.session_id;
        let pid = worker.pid();

        let output = worker.take_output();
        let pipe = async move {
            match output {
                Some(output) => pipe::forward(output, sink).await,
                None => PipeEnd::Eof,
            }
        };
        tokio::pin!(pipe);

        let mut output_ended = false;
        let mut exited: Option<(ExitDecision, Option<i32>)> = None;

        loop {
            if let (true, Some((decision, code))) = (output_ended, exited) {
                return WorkerEnd::Died { decision, code };
            }

            tokio::select! {
                _ = stop_requested(stop_rx) => {
                    debug!(session, pid, "stop requested, killing worker");
                    worker.kill();
                    return WorkerEnd::Stopped;
                }

                end = &mut pipe, if !output_ended => {
                    match end {
                        PipeEnd::Eof => debug!(session, pid, "worker output ended"),
                        PipeEnd::ReadError(e) => {
                            warn!(session, pid, error = %e, "failed reading worker output");
                        }
                        PipeEnd::SinkClosed => {
                            debug!(session, pid, "response closed, killing worker");
                            worker.kill();
                            return WorkerEnd::Stopped;
                        }
                    }
                    output_ended = true;
                }

                status = worker.wait(), if exited.is_none() => {
                    let code = match status {
                        Ok(status) => status.code(),
                        Err(e) => {
                            warn!(session, pid, error = %e, "failed waiting for worker");
                            None
                        }
                    };

                    // The decision waits for the output to drain.
                    let decision = self.policy.classify(code);
                    match decision {
                        ExitDecision::Respawn => {
                            warn!(session, pid, code, "transient worker exit, restarting");
                        }
                        ExitDecision::Abort => {
                            error!(session, pid, code, "worker exited, aborting");
                        }
                    }
                    exited = Some((decision, code));
                }
            }
        }
    }
}

/// Resolves once a stop has been requested, or once nobody is left who could
/// request one.
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        let stopped = *rx.borrow_and_update();
        if stopped {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
