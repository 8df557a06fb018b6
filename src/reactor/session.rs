use crate::buffer::BufferWindow;
use crate::Error;
use futures_util::task::AtomicWaker;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

/// Status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Closing,
    Closed,
}

/// How to close a session or reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Flush pending output and shut the transport down.
    Graceful,
    /// Drop the transport at once.
    Immediate,
}

/// Interest in I/O events.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EventMask(u8);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const READ: EventMask = EventMask(1);
    pub const WRITE: EventMask = EventMask(2);
    pub const READ_WRITE: EventMask = EventMask(3);

    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for EventMask {
    type Output = EventMask;
    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

/// Details of an encrypted session.
#[derive(Debug, Clone, Default)]
pub struct TlsDetails {
    /// Negotiated ALPN protocol id.
    pub alpn: Option<Vec<u8>>,
    /// Server name indicated by the client.
    pub sni: Option<String>,
}

/// The transport under a session: plain TCP or TLS.
pub(crate) trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<S> Transport for S where S: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

const STATUS_ACTIVE: u8 = 0;
const STATUS_CLOSING: u8 = 1;
const STATUS_CLOSED: u8 = 2;

const CLOSE_NONE: u8 = 0;
const CLOSE_GRACEFUL: u8 = 1;
const CLOSE_IMMEDIATE: u8 = 2;

/// State shared between the owning reactor thread and any `SessionHandle`.
pub(crate) struct SessionShared {
    id: u64,
    local: SocketAddr,
    remote: SocketAddr,
    status: AtomicU8,
    close_req: AtomicU8,
    events: AtomicU8,
    idle_timeout_ms: AtomicU64,
    shutdown_req: AtomicBool,
    last_activity: Mutex<Instant>,
    waker: AtomicWaker,
}

impl SessionShared {
    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }
}

/// Thread-safe view of a session.
#[derive(Clone)]
pub struct SessionHandle(pub(crate) Arc<SessionShared>);

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.0.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.0.remote
    }

    pub fn status(&self) -> SessionStatus {
        match self.0.status.load(Ordering::Acquire) {
            STATUS_ACTIVE => SessionStatus::Active,
            STATUS_CLOSING => SessionStatus::Closing,
            _ => SessionStatus::Closed,
        }
    }

    /// Request the session to close. The owning reactor thread carries it out.
    pub fn close(&self, mode: CloseMode) {
        let req = match mode {
            CloseMode::Graceful => CLOSE_GRACEFUL,
            CloseMode::Immediate => CLOSE_IMMEDIATE,
        };
        // an immediate request is never downgraded to graceful.
        self.0.close_req.fetch_max(req, Ordering::AcqRel);
        let _ = self.0.status.compare_exchange(
            STATUS_ACTIVE,
            STATUS_CLOSING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.wake();
    }

    pub fn event_mask(&self) -> EventMask {
        EventMask(self.0.events.load(Ordering::Acquire))
    }

    /// Add interest in events.
    pub fn set_event(&self, mask: EventMask) {
        let prev = self.0.events.fetch_or(mask.0, Ordering::AcqRel);
        if prev & mask.0 != mask.0 {
            self.wake();
        }
    }

    /// Remove interest in events.
    pub fn clear_event(&self, mask: EventMask) {
        self.0.events.fetch_and(!mask.0, Ordering::AcqRel);
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.0.idle_timeout_ms.load(Ordering::Acquire))
    }

    /// Change the idle timeout. `Duration::ZERO` disables it.
    pub fn set_idle_timeout(&self, timeout: Duration) {
        self.0
            .idle_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Release);
        self.wake();
    }

    /// Wake the owning reactor thread to poll the session again.
    pub fn wake(&self) {
        self.0.waker.wake();
    }

    pub(crate) fn register(&self, cx: &Context<'_>) {
        self.0.waker.register(cx.waker());
    }

    pub(crate) fn last_activity(&self) -> Instant {
        *self.0.last_activity.lock().unwrap()
    }

    pub(crate) fn touch(&self) {
        self.0.touch();
    }

    pub(crate) fn take_close_request(&self) -> Option<CloseMode> {
        match self.0.close_req.load(Ordering::Acquire) {
            CLOSE_GRACEFUL => Some(CloseMode::Graceful),
            CLOSE_IMMEDIATE => Some(CloseMode::Immediate),
            _ => None,
        }
    }

    pub(crate) fn request_shutdown(&self) {
        self.0.shutdown_req.store(true, Ordering::Release);
        self.wake();
    }

    pub(crate) fn take_shutdown_request(&self) -> bool {
        self.0.shutdown_req.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn set_closed(&self) {
        self.0.status.store(STATUS_CLOSED, Ordering::Release);
    }
}

/// One physical connection, owned by a single reactor thread.
///
/// The session is itself `AsyncRead + AsyncWrite` over its transport. A protocol
/// that wants to own the I/O can [`take_io`](Self::take_io) it.
pub struct IoSession {
    handle: SessionHandle,
    io: Option<SessionIo>,
    tls: Option<TlsDetails>,
}

impl IoSession {
    pub(crate) fn new(
        id: u64,
        local: SocketAddr,
        remote: SocketAddr,
        idle_timeout: Duration,
        transport: Box<dyn Transport>,
        tls: Option<TlsDetails>,
    ) -> Self {
        let shared = Arc::new(SessionShared {
            id,
            local,
            remote,
            status: AtomicU8::new(STATUS_ACTIVE),
            close_req: AtomicU8::new(CLOSE_NONE),
            events: AtomicU8::new(EventMask::READ_WRITE.0),
            idle_timeout_ms: AtomicU64::new(idle_timeout.as_millis() as u64),
            shutdown_req: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            waker: AtomicWaker::new(),
        });

        let handle = SessionHandle(shared);

        let io = SessionIo {
            transport,
            replay: BufferWindow::with_capacity(0),
            handle: handle.clone(),
        };

        IoSession {
            handle,
            io: Some(io),
            tls,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.handle.remote_addr()
    }

    pub fn status(&self) -> SessionStatus {
        self.handle.status()
    }

    pub fn close(&self, mode: CloseMode) {
        self.handle.close(mode)
    }

    pub fn set_event(&self, mask: EventMask) {
        self.handle.set_event(mask)
    }

    pub fn clear_event(&self, mask: EventMask) {
        self.handle.clear_event(mask)
    }

    pub fn event_mask(&self) -> EventMask {
        self.handle.event_mask()
    }

    pub fn tls_details(&self) -> Option<&TlsDetails> {
        self.tls.as_ref()
    }

    /// Push bytes back to be read again before anything else from the transport.
    pub fn unread(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let io = self.io.as_mut().ok_or(Error::Closed)?;

        let mut replay = BufferWindow::with_capacity(bytes.len() + io.replay.len());
        replay.append(bytes);
        replay.append(io.replay.chunk());
        io.replay = replay;

        Ok(())
    }

    /// Take the I/O out of the session, for protocols driving their own I/O.
    pub fn take_io(&mut self) -> Result<SessionIo, Error> {
        self.io.take().ok_or(Error::Closed)
    }

    pub(crate) fn has_io(&self) -> bool {
        self.io.is_some()
    }

    pub(crate) fn drop_io(&mut self) {
        self.io.take();
    }

    fn io_mut(&mut self) -> io::Result<&mut SessionIo> {
        self.io.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "Session I/O is taken")
        })
    }
}

/// Session transport with activity tracking, read interest and replay of unread bytes.
pub struct SessionIo {
    transport: Box<dyn Transport>,
    replay: BufferWindow,
    handle: SessionHandle,
}

impl SessionIo {
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }
}

impl AsyncRead for SessionIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.replay.is_empty() {
            let n = this.replay.read(buf.initialize_unfilled());
            buf.advance(n);
            return Ok(()).into();
        }

        if !this.handle.event_mask().contains(EventMask::READ) {
            // backpressure: don't touch the socket until READ is set again.
            this.handle.register(cx);
            if !this.handle.event_mask().contains(EventMask::READ) {
                return Poll::Pending;
            }
        }

        let before = buf.filled().len();
        let res = Pin::new(&mut this.transport).poll_read(cx, buf);

        if let Poll::Ready(Ok(())) = &res {
            if buf.filled().len() > before {
                this.handle.touch();
            }
        }

        res
    }
}

impl AsyncWrite for SessionIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let res = Pin::new(&mut this.transport).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &res {
            if *n > 0 {
                this.handle.touch();
            }
        }
        res
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().transport).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().transport).poll_shutdown(cx)
    }
}

impl AsyncRead for IoSession {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let io = self.get_mut().io_mut()?;
        Pin::new(io).poll_read(cx, buf)
    }
}

impl AsyncWrite for IoSession {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let io = self.get_mut().io_mut()?;
        Pin::new(io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let io = self.get_mut().io_mut()?;
        Pin::new(io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let io = self.get_mut().io_mut()?;
        Pin::new(io).poll_shutdown(cx)
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => write!(f, "NONE"),
            1 => write!(f, "READ"),
            2 => write!(f, "WRITE"),
            _ => write!(f, "READ_WRITE"),
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Session({}) {} -> {} {:?}",
            self.id(),
            self.local_addr(),
            self.remote_addr(),
            self.status()
        )
    }
}

impl fmt::Debug for IoSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.handle, f)
    }
}

impl fmt::Debug for SessionIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionIo({})", self.handle.id())
    }
}
