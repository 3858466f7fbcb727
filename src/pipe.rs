//! Output pipe between a worker's stdout and the HTTP response body.
//!
//! The response side is a bounded channel: when the client reads slower than
//! the worker writes, `send` waits and the worker's stdout is not read until
//! the channel drains.

use axum::body::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

/// Size of a single read from the worker.
const READ_CHUNK: usize = 64 * 1024;

/// Number of chunks buffered between the pipe and the HTTP connection.
pub const SINK_CAPACITY: usize = 16;

/// Sending half of a streaming response body.
///
/// Dropping or [`close`](ResponseSink::close)-ing the sink ends the response.
#[derive(Debug)]
pub struct ResponseSink {
    tx: mpsc::Sender<std::io::Result<Bytes>>,
}

impl ResponseSink {
    /// Create a sink and the receiver the response body reads from.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<std::io::Result<Bytes>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Returns `false` once the receiving side (the client) is gone.
    pub async fn send(&self, chunk: Bytes) -> bool {
        self.tx.send(Ok(chunk)).await.is_ok()
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// End the response. Consumes the sink so it can only happen once.
    pub fn close(self) {
        drop(self.tx);
    }
}

/// Why [`forward`] stopped.
#[derive(Debug)]
pub enum PipeEnd {
    /// The worker closed its output.
    Eof,
    /// The client went away.
    SinkClosed,
    /// Reading from the worker failed; treated like end of output.
    ReadError(std::io::Error),
}

/// Copy `reader` into `sink` in order until either side ends.
///
/// The sink is left open on `Eof` so a replacement worker can continue the
/// same response.
pub async fn forward<R>(mut reader: R, sink: &ResponseSink) -> PipeEnd
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return PipeEnd::Eof,
            Ok(n) => n,
            Err(e) => return PipeEnd::ReadError(e),
        };

        if !sink.send(Bytes::copy_from_slice(&buf[..n])).await {
            return PipeEnd::SinkClosed;
        }
    }
}
