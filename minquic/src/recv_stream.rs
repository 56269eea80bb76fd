use std::{
    future::poll_fn,
    task::{Context, Poll},
};

use bytes::Bytes;
use proto::{ConnectionError, StreamId};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{connection::ConnectionRef, VarInt};

/// A stream that can only be used to receive data
///
/// `stop(0)` is implicitly called on drop unless the stream was read to its end or reset by the
/// peer.
///
/// Every pending call completes with [`ReadError::Cancelled`] once the stream's
/// [`CancellationToken`] is cancelled.
#[derive(Debug)]
pub struct RecvStream {
    conn: ConnectionRef,
    stream: StreamId,
    all_data_read: bool,
    reset: Option<VarInt>,
    cancel: CancellationToken,
}

impl RecvStream {
    pub(crate) fn new(conn: ConnectionRef, stream: StreamId, cancel: CancellationToken) -> Self {
        Self {
            conn,
            stream,
            all_data_read: false,
            reset: None,
            cancel,
        }
    }

    /// Read data contiguously from the stream
    ///
    /// Yields the number of bytes read into `buf` on success, or `None` if the stream was
    /// finished.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, ReadError> {
        Ok(self.read_chunk(buf.len()).await?.map(|chunk| {
            buf[..chunk.len()].copy_from_slice(&chunk);
            chunk.len()
        }))
    }

    /// Read the next contiguous chunk of at most `max_length` bytes
    ///
    /// Yields `None` if the stream was finished. Otherwise, yields a chunk of data without
    /// copying.
    pub async fn read_chunk(&mut self, max_length: usize) -> Result<Option<Bytes>, ReadError> {
        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            res = poll_fn(|cx| self.poll_read_chunk(cx, max_length)) => res,
            _ = cancel.cancelled() => Err(ReadError::Cancelled),
        }
    }

    /// Convenience method to read all remaining data into a buffer
    ///
    /// Fails with [`ReadToEndError::TooLong`] on reading more than `size_limit` bytes, discarding
    /// all data read. `size_limit` should be set to limit worst-case memory use.
    pub async fn read_to_end(&mut self, size_limit: usize) -> Result<Vec<u8>, ReadToEndError> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.read_chunk(usize::MAX).await? {
            if buf.len() + chunk.len() > size_limit {
                return Err(ReadToEndError::TooLong);
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf)
    }

    fn poll_read_chunk(
        &mut self,
        cx: &mut Context<'_>,
        max_length: usize,
    ) -> Poll<Result<Option<Bytes>, ReadError>> {
        if self.all_data_read {
            return Poll::Ready(Ok(None));
        }
        if let Some(error_code) = self.reset {
            return Poll::Ready(Err(ReadError::Reset(error_code)));
        }

        let mut conn = self.conn.state.lock("RecvStream::poll_read");
        use proto::ReadError::*;
        match conn.inner.recv_stream(self.stream).read(max_length) {
            Ok(Some(chunk)) => {
                // Reading may free up flow control credit
                conn.wake();
                Poll::Ready(Ok(Some(chunk)))
            }
            Ok(None) => {
                self.all_data_read = true;
                conn.wake();
                Poll::Ready(Ok(None))
            }
            Err(Blocked) => {
                if let Some(ref x) = conn.error {
                    return Poll::Ready(Err(ReadError::ConnectionLost(x.clone())));
                }
                conn.blocked_readers.insert(self.stream, cx.waker().clone());
                Poll::Pending
            }
            Err(Reset(error_code)) => {
                self.reset = Some(error_code);
                Poll::Ready(Err(ReadError::Reset(error_code)))
            }
            Err(ClosedStream) => Poll::Ready(Err(ReadError::ClosedStream)),
        }
    }

    /// Stop accepting data
    ///
    /// Discards unread data and notifies the peer to stop transmitting. Once stopped, further
    /// attempts to operate on a stream will yield `ClosedStream` errors.
    pub fn stop(&mut self, error_code: VarInt) -> Result<(), ReadError> {
        let mut conn = self.conn.state.lock("RecvStream::stop");
        if let Some(ref x) = conn.error {
            return Err(ReadError::ConnectionLost(x.clone()));
        }
        conn.inner
            .recv_stream(self.stream)
            .stop(error_code)
            .map_err(|_| ReadError::ClosedStream)?;
        conn.wake();
        self.all_data_read = true;
        Ok(())
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

impl Drop for RecvStream {
    fn drop(&mut self) {
        let mut conn = self.conn.state.lock("RecvStream::drop");
        conn.blocked_readers.remove(&self.stream);
        if conn.error.is_some() || self.all_data_read || self.reset.is_some() {
            return;
        }
        // Ignore ClosedStream errors
        let _ = conn.inner.recv_stream(self.stream).stop(0u32.into());
        conn.wake();
    }
}

/// Errors that arise from reading from a stream
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// The peer abandoned transmitting data on this stream
    ///
    /// Carries an application-defined error code.
    #[error("stream reset by peer: error {0}")]
    Reset(VarInt),
    /// The connection was lost
    #[error("connection lost")]
    ConnectionLost(#[from] ConnectionError),
    /// The stream has already been stopped, finished, or reset
    #[error("closed stream")]
    ClosedStream,
    /// The stream's cancellation token was cancelled
    #[error("cancelled")]
    Cancelled,
}

/// Errors from [`RecvStream::read_to_end`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadToEndError {
    /// An error occurred during reading
    #[error("read error: {0}")]
    Read(#[from] ReadError),
    /// The stream is larger than the user-supplied limit
    #[error("stream too long")]
    TooLong,
}
