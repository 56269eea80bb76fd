use std::{
    future::{poll_fn, Future},
    pin::Pin,
    task::{Context, Poll},
};

use proto::{ConnectionError, FinishError, StreamId};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{connection::ConnectionRef, VarInt};

/// A stream that can only be used to send data
///
/// If dropped, streams that haven't been explicitly [`reset()`] will be implicitly [`finish()`]ed,
/// continuing to (re)transmit previously written data until it has been fully acknowledged or the
/// connection is closed.
///
/// Every pending call completes with [`WriteError::Cancelled`] once the stream's
/// [`CancellationToken`] is cancelled.
///
/// [`reset()`]: SendStream::reset
/// [`finish()`]: SendStream::finish
#[derive(Debug)]
pub struct SendStream {
    conn: ConnectionRef,
    stream: StreamId,
    finishing: Option<oneshot::Receiver<Option<WriteError>>>,
    reset: bool,
    cancel: CancellationToken,
}

impl SendStream {
    pub(crate) fn new(conn: ConnectionRef, stream: StreamId, cancel: CancellationToken) -> Self {
        Self {
            conn,
            stream,
            finishing: None,
            reset: false,
            cancel,
        }
    }

    /// Write bytes to the stream
    ///
    /// Yields the number of bytes written on success. Congestion and flow control may cause this
    /// to be shorter than `buf.len()`, indicating that only a prefix of `buf` was written. Waits
    /// while no credit is available at all.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, WriteError> {
        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            res = poll_fn(|cx| self.poll_write(cx, buf)) => res,
            _ = cancel.cancelled() => Err(WriteError::Cancelled),
        }
    }

    /// Convenience method to write an entire buffer to the stream
    pub async fn write_all(&mut self, mut buf: &[u8]) -> Result<(), WriteError> {
        while !buf.is_empty() {
            let written = self.write(buf).await?;
            buf = &buf[written..];
        }
        Ok(())
    }

    fn poll_write(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, WriteError>> {
        let mut conn = self.conn.state.lock("SendStream::poll_write");
        if let Some(ref x) = conn.error {
            return Poll::Ready(Err(WriteError::ConnectionLost(x.clone())));
        }

        use proto::WriteError::*;
        match conn.inner.send_stream(self.stream).write(buf) {
            Ok(n) => {
                conn.wake();
                Poll::Ready(Ok(n))
            }
            Err(Blocked) => {
                conn.blocked_writers.insert(self.stream, cx.waker().clone());
                Poll::Pending
            }
            Err(Stopped(error_code)) => Poll::Ready(Err(WriteError::Stopped(error_code))),
            Err(ClosedStream) => Poll::Ready(Err(WriteError::ClosedStream)),
        }
    }

    /// Shut down the send stream gracefully
    ///
    /// No new data may be written after calling this method. Completes when the peer has
    /// acknowledged all sent data, retransmitting data as needed.
    pub async fn finish(&mut self) -> Result<(), WriteError> {
        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            res = poll_fn(|cx| self.poll_finish(cx)) => res,
            _ = cancel.cancelled() => Err(WriteError::Cancelled),
        }
    }

    fn poll_finish(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), WriteError>> {
        if self.finishing.is_none() {
            let mut conn = self.conn.state.lock("SendStream::poll_finish");
            if let Some(ref x) = conn.error {
                return Poll::Ready(Err(WriteError::ConnectionLost(x.clone())));
            }
            match conn.inner.send_stream(self.stream).finish() {
                Ok(()) => {
                    let (send, recv) = oneshot::channel();
                    conn.finishing.insert(self.stream, send);
                    self.finishing = Some(recv);
                    conn.wake();
                }
                Err(FinishError::Stopped(error_code)) => {
                    return Poll::Ready(Err(WriteError::Stopped(error_code)));
                }
                Err(FinishError::ClosedStream) => {
                    return Poll::Ready(Err(WriteError::ClosedStream));
                }
            }
        }

        let Some(ref mut finishing) = self.finishing else {
            return Poll::Ready(Err(WriteError::ClosedStream));
        };
        match std::task::ready!(Pin::new(finishing).poll(cx)) {
            Ok(None) => Poll::Ready(Ok(())),
            Ok(Some(e)) => Poll::Ready(Err(e)),
            Err(_) => Poll::Ready(Err(WriteError::ClosedStream)),
        }
    }

    /// Close the send stream immediately
    ///
    /// No new data can be written after calling this method. Locally buffered data is dropped, and
    /// previously transmitted data will no longer be retransmitted if lost. If an attempt has
    /// already been made to finish the stream, the peer may still receive all written data.
    pub fn reset(&mut self, error_code: VarInt) -> Result<(), WriteError> {
        let mut conn = self.conn.state.lock("SendStream::reset");
        if let Some(ref x) = conn.error {
            return Err(WriteError::ConnectionLost(x.clone()));
        }
        conn.inner
            .send_stream(self.stream)
            .reset(error_code)
            .map_err(|_| WriteError::ClosedStream)?;
        self.reset = true;
        conn.wake();
        Ok(())
    }

    /// Set the priority of the send stream
    ///
    /// Every send stream has an initial priority of 0. Locally buffered data from streams with
    /// higher priority will be transmitted before data from streams with lower priority. Changing
    /// the priority of a stream with pending data may only take effect after that data has been
    /// transmitted. Using many different priority levels per connection may have a negative
    /// impact on performance.
    pub fn set_priority(&self, priority: i32) -> Result<(), WriteError> {
        let mut conn = self.conn.state.lock("SendStream::set_priority");
        conn.inner
            .send_stream(self.stream)
            .set_priority(priority)
            .map_err(|_| WriteError::ClosedStream)
    }

    /// Get the identity of this stream
    pub fn id(&self) -> StreamId {
        self.stream
    }

    /// Token cancelling every pending call on this stream
    ///
    /// Shared with the other half of a bidirectional stream.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for SendStream {
    fn drop(&mut self) {
        let mut conn = self.conn.state.lock("SendStream::drop");
        conn.blocked_writers.remove(&self.stream);
        if self.finishing.is_some() {
            conn.finishing.remove(&self.stream);
        }
        if conn.error.is_some() || self.reset || self.finishing.is_some() {
            return;
        }
        if conn.inner.send_stream(self.stream).finish().is_ok() {
            conn.wake();
        }
    }
}

/// Errors that arise from writing to a stream
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// The peer is no longer accepting data on this stream
    ///
    /// Carries an application-defined error code.
    #[error("sending stopped by peer: error {0}")]
    Stopped(VarInt),
    /// The connection was lost
    #[error("connection lost")]
    ConnectionLost(#[from] ConnectionError),
    /// The stream has already been finished or reset
    #[error("closed stream")]
    ClosedStream,
    /// The stream's cancellation token was cancelled
    #[error("cancelled")]
    Cancelled,
}
