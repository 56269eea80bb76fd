use std::{
    fmt,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use bytes::Bytes;
use proto::{
    ConnectionError, ConnectionHandle, ConnectionState, ConnectionStats, Dir, StreamEvent,
    StreamId,
};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, Notify},
    time::{sleep_until, Instant as TokioInstant, Sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span};

use crate::{
    mutex::Mutex,
    recv_stream::RecvStream,
    send_stream::{SendStream, WriteError},
    ConnectionEvent, EndpointEvent, VarInt,
};

/// In-progress connection attempt future
#[derive(Debug)]
#[must_use = "futures/streams/sinks do nothing unless you `.await` or poll them"]
pub struct Connecting {
    conn: Option<ConnectionRef>,
    connected: oneshot::Receiver<bool>,
}

impl Connecting {
    pub(crate) fn new(
        handle: ConnectionHandle,
        conn: proto::Connection,
        endpoint_events: mpsc::UnboundedSender<(ConnectionHandle, EndpointEvent)>,
        conn_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Self {
        let (on_connected_send, on_connected_recv) = oneshot::channel();
        let conn = ConnectionRef::new(
            handle,
            conn,
            endpoint_events,
            conn_events,
            on_connected_send,
        );

        tokio::spawn(ConnectionDriver(conn.clone()));

        Self {
            conn: Some(conn),
            connected: on_connected_recv,
        }
    }

    /// The peer's UDP address
    ///
    /// Will panic if called after `poll` has returned `Ready`.
    pub fn remote_address(&self) -> SocketAddr {
        let conn_ref: &ConnectionRef = self.conn.as_ref().expect("used after yielding Ready");
        conn_ref.state.lock("remote_address").inner.remote_address()
    }
}

impl Future for Connecting {
    type Output = Result<Connection, ConnectionError>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.connected).poll(cx).map(|_| {
            let conn = self.conn.take().expect("polled after yielding Ready");
            let state = conn.state.lock("connecting");
            if state.connected {
                drop(state);
                Ok(Connection::new(conn))
            } else {
                Err(state
                    .error
                    .clone()
                    .expect("connected signaled without connection success or error"))
            }
        })
    }
}

/// A future that drives protocol logic for a connection
///
/// This future handles the protocol logic for a single connection, routing events from the
/// `Connection` API object to the `Endpoint` task and the related stream-related interfaces.
/// It also keeps track of outstanding timeouts for the `Connection`.
///
/// Unlike other connection-related futures, this waits for the draining period to complete to
/// ensure that packets still in flight from the peer are handled gracefully.
#[must_use = "connection drivers must be spawned for their connections to function"]
#[derive(Debug)]
struct ConnectionDriver(ConnectionRef);

impl Future for ConnectionDriver {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner: &ConnectionInner = &self.0;
        let conn = &mut *inner.state.lock("poll");

        let span = info_span!("drive", id = conn.handle.0);
        let _guard = span.enter();

        loop {
            if let Err(e) = conn.process_conn_events(&inner.shared, cx) {
                conn.terminate(e, &inner.shared);
                return Poll::Ready(());
            }
            conn.drive_transmit();
            // If a timer expires, there might be more to transmit. When we transmit something, we
            // might need to reset a timer. Hence, we must loop until neither happens.
            let keep_going = conn.drive_timer(cx);
            conn.forward_endpoint_events();
            conn.forward_app_events(&inner.shared);
            if !keep_going || conn.inner.is_drained() {
                break;
            }
        }

        if !conn.inner.is_drained() {
            conn.driver = Some(cx.waker().clone());
            return Poll::Pending;
        }
        if conn.error.is_none() {
            unreachable!("drained connections always have an error");
        }
        Poll::Ready(())
    }
}

/// A QUIC connection
///
/// If all references to a connection (including every clone of the `Connection` handle and every
/// stream) have been dropped, then the connection will be automatically closed with an
/// `error_code` of 0 and an empty `reason`. You can also close the connection explicitly by
/// calling [`Connection::close()`].
///
/// May be cloned to obtain another handle to the same connection. Clones share one
/// [`CancellationToken`], a child of the connection's own token.
#[derive(Debug, Clone)]
pub struct Connection {
    conn: ConnectionRef,
    cancel: CancellationToken,
}

impl Connection {
    fn new(conn: ConnectionRef) -> Self {
        let cancel = conn.shared.cancel.child_token();
        Self { conn, cancel }
    }

    /// Initiate a new outgoing unidirectional stream
    ///
    /// Streams are cheap and instantaneous to open unless the peer's stream limit is reached, in
    /// which case this waits for the peer to raise it. The peer won't be notified that a stream
    /// has been opened until the stream is actually used.
    pub async fn open_uni(&self) -> Result<SendStream, StreamError> {
        let id = self.conn.open(Dir::Uni, &self.cancel).await?;
        Ok(SendStream::new(self.conn.clone(), id, self.cancel.child_token()))
    }

    /// Initiate a new outgoing bidirectional stream
    ///
    /// See [`open_uni()`](Self::open_uni) for details.
    pub async fn open_bi(&self) -> Result<(SendStream, RecvStream), StreamError> {
        let id = self.conn.open(Dir::Bi, &self.cancel).await?;
        Ok(self.bi_halves(id))
    }

    /// Accept the next incoming unidirectional stream
    pub async fn accept_uni(&self) -> Result<RecvStream, StreamError> {
        let id = self.conn.accept(Dir::Uni, &self.cancel).await?;
        Ok(RecvStream::new(self.conn.clone(), id, self.cancel.child_token()))
    }

    /// Accept the next incoming bidirectional stream
    ///
    /// The peer only announces a stream once it sends data on it, so a stream opened by the peer
    /// does not become available here until then.
    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), StreamError> {
        let id = self.conn.accept(Dir::Bi, &self.cancel).await?;
        Ok(self.bi_halves(id))
    }

    fn bi_halves(&self, id: StreamId) -> (SendStream, RecvStream) {
        // Both halves of a stream are cancelled together
        let cancel = self.cancel.child_token();
        (
            SendStream::new(self.conn.clone(), id, cancel.clone()),
            RecvStream::new(self.conn.clone(), id, cancel),
        )
    }

    /// Wait for the connection to be closed for any reason
    pub async fn closed(&self) -> ConnectionError {
        loop {
            let closed = self.conn.shared.closed.notified();
            let error = self.conn.state.lock("closed").error.clone();
            if let Some(error) = error {
                return error;
            }
            closed.await;
        }
    }

    /// If the connection is closed, the reason why
    ///
    /// Returns `None` if the connection is still open.
    pub fn close_reason(&self) -> Option<ConnectionError> {
        self.conn.state.lock("close_reason").error.clone()
    }

    /// Close the connection immediately
    ///
    /// Pending operations will fail immediately with [`ConnectionError::LocallyClosed`]. Delivery
    /// of data on unfinished streams is not guaranteed, so the application must call this only
    /// when all important communications have been completed, e.g. by calling
    /// [`SendStream::finish`] on outstanding streams and waiting for it to complete.
    ///
    /// `error_code` and `reason` are not interpreted, and are provided directly to the peer.
    pub fn close(&self, error_code: VarInt, reason: &[u8]) {
        let conn = &mut *self.conn.state.lock("close");
        conn.close(error_code, Bytes::copy_from_slice(reason), &self.conn.shared);
    }

    /// Token cancelling every pending `open`/`accept` on this handle and its clones
    ///
    /// Streams created through this handle use child tokens, so cancelling this one also
    /// cancels their pending reads and writes. The connection itself stays open.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The peer's UDP address
    pub fn remote_address(&self) -> SocketAddr {
        self.conn.state.lock("remote_address").inner.remote_address()
    }

    /// Current best estimate of this connection's latency (round-trip-time)
    pub fn rtt(&self) -> Duration {
        self.conn.state.lock("rtt").inner.rtt()
    }

    /// Returns connection statistics
    pub fn stats(&self) -> ConnectionStats {
        self.conn.state.lock("stats").inner.stats()
    }

    /// Current lifecycle stage
    pub fn state(&self) -> ConnectionState {
        self.conn.state.lock("state").inner.state()
    }

    /// A stable identifier for this connection
    ///
    /// Peer addresses and connection IDs can change, but this value will remain fixed for the
    /// lifetime of the connection.
    pub fn stable_id(&self) -> usize {
        self.conn.stable_id()
    }
}

/// Errors from opening or accepting streams
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The connection was lost
    #[error("connection lost")]
    ConnectionLost(#[from] ConnectionError),
    /// The handle's cancellation token was cancelled
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug)]
pub(crate) struct ConnectionRef(Arc<ConnectionInner>);

impl ConnectionRef {
    fn new(
        handle: ConnectionHandle,
        conn: proto::Connection,
        endpoint_events: mpsc::UnboundedSender<(ConnectionHandle, EndpointEvent)>,
        conn_events: mpsc::UnboundedReceiver<ConnectionEvent>,
        on_connected: oneshot::Sender<bool>,
    ) -> Self {
        Self(Arc::new(ConnectionInner {
            state: Mutex::new(State {
                inner: conn,
                driver: None,
                handle,
                on_connected: Some(on_connected),
                connected: false,
                timer: None,
                timer_deadline: None,
                conn_events,
                endpoint_events,
                blocked_writers: FxHashMap::default(),
                blocked_readers: FxHashMap::default(),
                finishing: FxHashMap::default(),
                error: None,
                ref_count: 0,
            }),
            shared: Shared::default(),
        }))
    }

    fn stable_id(&self) -> usize {
        &*self.0 as *const _ as usize
    }

    async fn open(&self, dir: Dir, cancel: &CancellationToken) -> Result<StreamId, StreamError> {
        loop {
            let available = self.shared.stream_budget_available[dir as usize].notified();
            {
                let mut state = self.state.lock("open");
                if let Some(ref e) = state.error {
                    return Err(e.clone().into());
                }
                if let Some(id) = state.inner.streams().open(dir) {
                    return Ok(id);
                }
            }
            tokio::select! {
                biased;
                _ = available => {}
                _ = cancel.cancelled() => return Err(StreamError::Cancelled),
            }
        }
    }

    async fn accept(&self, dir: Dir, cancel: &CancellationToken) -> Result<StreamId, StreamError> {
        loop {
            let incoming = self.shared.stream_incoming[dir as usize].notified();
            {
                let mut state = self.state.lock("accept");
                if let Some(id) = state.inner.streams().accept(dir) {
                    state.wake();
                    return Ok(id);
                }
                if let Some(ref e) = state.error {
                    return Err(e.clone().into());
                }
            }
            tokio::select! {
                biased;
                _ = incoming => {}
                _ = cancel.cancelled() => return Err(StreamError::Cancelled),
            }
        }
    }
}

impl Clone for ConnectionRef {
    fn clone(&self) -> Self {
        self.state.lock("clone").ref_count += 1;
        Self(self.0.clone())
    }
}

impl Drop for ConnectionRef {
    fn drop(&mut self) {
        let conn = &mut *self.state.lock("drop");
        if let Some(x) = conn.ref_count.checked_sub(1) {
            conn.ref_count = x;
            if x == 0 && !conn.inner.is_closed() {
                // If the driver is alive, it's just it and us, so we'd better shut it down. If it's
                // not, we can't do any harm.
                conn.implicit_close(&self.shared);
            }
        }
    }
}

impl std::ops::Deref for ConnectionRef {
    type Target = ConnectionInner;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug)]
pub(crate) struct ConnectionInner {
    pub(crate) state: Mutex<State>,
    pub(crate) shared: Shared,
}

/// Wakeup sources that are waited on without holding the state lock
#[derive(Debug, Default)]
pub(crate) struct Shared {
    /// Notified when the peer raises a stream limit, indexed by `Dir`
    stream_budget_available: [Notify; 2],
    /// Notified when the peer opens a stream, indexed by `Dir`
    stream_incoming: [Notify; 2],
    closed: Notify,
    /// Cancelled once the connection is lost
    cancel: CancellationToken,
}

pub(crate) struct State {
    pub(crate) inner: proto::Connection,
    driver: Option<Waker>,
    handle: ConnectionHandle,
    on_connected: Option<oneshot::Sender<bool>>,
    connected: bool,
    timer: Option<Pin<Box<Sleep>>>,
    timer_deadline: Option<TokioInstant>,
    conn_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    endpoint_events: mpsc::UnboundedSender<(ConnectionHandle, EndpointEvent)>,
    pub(crate) blocked_writers: FxHashMap<StreamId, Waker>,
    pub(crate) blocked_readers: FxHashMap<StreamId, Waker>,
    pub(crate) finishing: FxHashMap<StreamId, oneshot::Sender<Option<WriteError>>>,
    /// Always set to Some before the connection becomes drained
    pub(crate) error: Option<ConnectionError>,
    /// Number of live handles that can be used to initiate or handle I/O; excludes the driver
    ref_count: usize,
}

impl State {
    fn drive_transmit(&mut self) {
        let now = Instant::now();
        while let Some(t) = self.inner.poll_transmit(now) {
            // If the endpoint driver is gone, noop.
            let _ = self
                .endpoint_events
                .send((self.handle, EndpointEvent::Transmit(t)));
        }
    }

    fn forward_endpoint_events(&mut self) {
        while let Some(event) = self.inner.poll_endpoint_events() {
            // If the endpoint driver is gone, noop.
            let _ = self
                .endpoint_events
                .send((self.handle, EndpointEvent::Proto(event)));
        }
    }

    /// If this returns `Err`, the endpoint is dead, so the driver should exit immediately.
    fn process_conn_events(
        &mut self,
        shared: &Shared,
        cx: &mut Context<'_>,
    ) -> Result<(), ConnectionError> {
        loop {
            match self.conn_events.poll_recv(cx) {
                Poll::Ready(Some(ConnectionEvent::Proto(event))) => {
                    self.inner.handle_event(event);
                }
                Poll::Ready(Some(ConnectionEvent::Close { reason, error_code })) => {
                    self.close(error_code, reason, shared);
                }
                Poll::Ready(None) => {
                    return Err(ConnectionError::TransportError(proto::TransportError {
                        code: proto::TransportErrorCode::INTERNAL_ERROR,
                        frame: None,
                        reason: "endpoint driver future was dropped".to_string(),
                    }));
                }
                Poll::Pending => {
                    return Ok(());
                }
            }
        }
    }

    fn forward_app_events(&mut self, shared: &Shared) {
        while let Some(event) = self.inner.poll() {
            use proto::Event::*;
            match event {
                Connected => {
                    self.connected = true;
                    if let Some(x) = self.on_connected.take() {
                        // We don't care if the on-connected future was dropped
                        let _ = x.send(true);
                    }
                }
                ConnectionLost { reason } => {
                    self.terminate(reason, shared);
                }
                Stream(StreamEvent::Writable { id }) => {
                    if let Some(writer) = self.blocked_writers.remove(&id) {
                        writer.wake();
                    }
                }
                Stream(StreamEvent::Opened { dir }) => {
                    shared.stream_incoming[dir as usize].notify_waiters();
                }
                Stream(StreamEvent::Readable { id }) => {
                    if let Some(reader) = self.blocked_readers.remove(&id) {
                        reader.wake();
                    }
                }
                Stream(StreamEvent::Available { dir }) => {
                    shared.stream_budget_available[dir as usize].notify_waiters();
                }
                Stream(StreamEvent::Finished { id }) => {
                    if let Some(finishing) = self.finishing.remove(&id) {
                        // If the finishing stream was already dropped, there's nothing more to do.
                        let _ = finishing.send(None);
                    }
                }
                Stream(StreamEvent::Stopped { id, error_code }) => {
                    if let Some(finishing) = self.finishing.remove(&id) {
                        let _ = finishing.send(Some(WriteError::Stopped(error_code)));
                    }
                    if let Some(writer) = self.blocked_writers.remove(&id) {
                        writer.wake();
                    }
                }
            }
        }
    }

    fn drive_timer(&mut self, cx: &mut Context<'_>) -> bool {
        // Check whether we need to (re)set the timer. If so, we must poll again to ensure the
        // timer is registered with the runtime (and check whether it's already expired).
        let Some(deadline) = self.inner.poll_timeout().map(TokioInstant::from_std) else {
            self.timer_deadline = None;
            return false;
        };
        let delay = self
            .timer
            .get_or_insert_with(|| Box::pin(sleep_until(deadline)));
        if self.timer_deadline != Some(deadline) {
            delay.as_mut().reset(deadline);
            self.timer_deadline = Some(deadline);
        }

        if delay.as_mut().poll(cx).is_pending() {
            // Since there wasn't a timeout event, there is nothing new for the connection to do
            return false;
        }

        // A timer expired, so the caller needs to check for new transmits, which might cause new
        // timers to be set.
        self.inner.handle_timeout(Instant::now());
        self.timer_deadline = None;
        true
    }

    /// Wake up a blocked `Driver` task to process I/O
    pub(crate) fn wake(&mut self) {
        if let Some(x) = self.driver.take() {
            x.wake();
        }
    }

    /// Used to wake up all blocked futures when the connection becomes closed for any reason
    fn terminate(&mut self, reason: ConnectionError, shared: &Shared) {
        debug!(%reason, "connection lost");
        self.error = Some(reason.clone());
        for (_, writer) in self.blocked_writers.drain() {
            writer.wake()
        }
        for (_, reader) in self.blocked_readers.drain() {
            reader.wake()
        }
        for (_, x) in self.finishing.drain() {
            let _ = x.send(Some(WriteError::ConnectionLost(reason.clone())));
        }
        if let Some(x) = self.on_connected.take() {
            let _ = x.send(false);
        }
        for notify in shared
            .stream_budget_available
            .iter()
            .chain(&shared.stream_incoming)
        {
            notify.notify_waiters();
        }
        shared.closed.notify_waiters();
        shared.cancel.cancel();
    }

    fn close(&mut self, error_code: VarInt, reason: Bytes, shared: &Shared) {
        self.inner.close(Instant::now(), error_code, reason);
        self.terminate(ConnectionError::LocallyClosed, shared);
        self.wake();
    }

    /// Close for a reason other than the application's explicit request
    fn implicit_close(&mut self, shared: &Shared) {
        self.close(0u32.into(), Bytes::new(), shared);
    }
}

impl Drop for State {
    fn drop(&mut self) {
        if !self.inner.is_drained() {
            // Ensure the endpoint can tidy up
            let _ = self.endpoint_events.send((
                self.handle,
                EndpointEvent::Proto(proto::EndpointEvent::drained()),
            ));
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("inner", &self.inner)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}
