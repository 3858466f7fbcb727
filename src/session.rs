//! Stream sessions: one accepted request, one supervised worker, one body.
//!
//! The response body doubles as the disconnect observer. hyper drops it when
//! the client goes away, which stops the supervisor; a second stop from any
//! other path is a no-op.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Bytes;
use futures::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::errors::Result;
use crate::pipe::{ResponseSink, SINK_CAPACITY};
use crate::sources::SourceDescriptor;
use crate::supervisor::{StopHandle, Supervisor, SupervisorHandle};
use crate::worker::{ExitPolicy, WorkerCommand};

pub struct StreamSession {
    id: u64,
    source: Arc<SourceDescriptor>,
    #[cfg_attr(not(test), allow(dead_code))]
    supervisor: SupervisorHandle, // Dropping it detaches the task
}

impl StreamSession {
    /// Start the worker for `source` and return the body that streams its
    /// output. Fails only if the first worker cannot be spawned.
    pub fn start(
        id: u64,
        source: Arc<SourceDescriptor>,
        program: &str,
        policy: ExitPolicy,
    ) -> Result<(Self, SessionBody)> {
        let command = WorkerCommand::for_source(program, &source);
        let (sink, rx) = ResponseSink::channel(SINK_CAPACITY);
        let supervisor = Supervisor::start(id, command, policy, sink)?;

        let body = SessionBody {
            session_id: id,
            inner: ReceiverStream::new(rx),
            stopper: supervisor.stopper(),
            finished: false,
        };

        Ok((
            Self {
                id,
                source,
                supervisor,
            },
            body,
        ))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    /// End the session. Returns `false` if it had already been stopped.
    #[cfg(test)]
    fn stop(&self) -> bool {
        self.supervisor.stop()
    }

    #[cfg(test)]
    async fn join(
        self,
    ) -> std::result::Result<crate::supervisor::SessionSummary, tokio::task::JoinError> {
        self.supervisor.join().await
    }
}

/// Streaming response body of a session.
pub struct SessionBody {
    session_id: u64,
    inner: ReceiverStream<std::io::Result<Bytes>>,
    stopper: StopHandle,
    finished: bool, // Supervisor closed the sink on its own
}

impl Stream for SessionBody {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(None) = poll {
            self.finished = true;
        }
        poll
    }
}

impl Drop for SessionBody {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.stopper.stop() {
            info!(session = self.session_id, "Client disconnected, stopping worker");
        }
    }
}
