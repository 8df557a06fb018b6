use super::endpoint::{ListenerEndpoint, Scheme};
use super::handler::IoEventHandler;
use super::session::{CloseMode, IoSession, SessionHandle, TlsDetails, Transport};
use super::ReactorShared;
use crate::Error;
use futures_channel::oneshot;
use futures_util::ready;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinSet;
use tokio::time::{Instant, Sleep};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, Error>>;

/// Instructions to an I/O thread.
pub(crate) enum Command {
    /// Take over an accepted socket.
    Register(std::net::TcpStream, Scheme),
    Listen(SocketAddr, Scheme, Reply<ListenerEndpoint>),
    Connect {
        host: String,
        port: u16,
        timeout: Duration,
        /// Handler of the new session, instead of one from the factory.
        handler: Option<Box<dyn IoEventHandler>>,
        reply: Reply<SessionHandle>,
    },
    /// Shut down, gracefully within the given period, or at once for `None`.
    Shutdown(Option<Duration>),
}

/// Round-robin distribution of commands over the I/O threads.
pub(crate) struct Dispatcher {
    senders: Vec<UnboundedSender<Command>>,
    next: AtomicUsize,
}

impl Dispatcher {
    pub fn new(senders: Vec<UnboundedSender<Command>>) -> Self {
        Dispatcher {
            senders,
            next: AtomicUsize::new(0),
        }
    }

    /// Send to the next thread in turn.
    ///
    /// A command that can't be delivered is dropped, which cancels any reply in it.
    pub fn send(&self, cmd: Command) {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        if self.senders[idx].send(cmd).is_err() {
            trace!("I/O thread {} is gone", idx);
        }
    }

    pub fn broadcast(&self, f: impl Fn() -> Command) {
        for tx in &self.senders {
            tx.send(f()).ok();
        }
    }
}

/// Live sessions of one I/O thread.
#[derive(Clone, Default)]
pub(crate) struct SessionRegistry(Arc<Mutex<Sessions>>);

#[derive(Default)]
struct Sessions {
    live: HashMap<u64, SessionHandle>,
    draining: bool,
}

impl SessionRegistry {
    /// Sessions arriving after draining started (TLS handshakes in progress)
    /// are asked to shut down right away.
    fn insert(&self, handle: SessionHandle) {
        let mut lock = self.0.lock().unwrap();
        if lock.draining {
            handle.request_shutdown();
        }
        lock.live.insert(handle.id(), handle);
    }

    fn remove(&self, id: u64) {
        let mut lock = self.0.lock().unwrap();
        lock.live.remove(&id);
    }

    fn handles(&self) -> Vec<SessionHandle> {
        let lock = self.0.lock().unwrap();
        lock.live.values().cloned().collect()
    }

    /// Ask every live session, and every later one, to shut down.
    fn start_draining(&self) {
        let mut lock = self.0.lock().unwrap();
        lock.draining = true;
        for h in lock.live.values() {
            h.request_shutdown();
        }
    }
}

/// Entry point of an I/O thread.
pub(crate) fn run(index: usize, shared: Arc<ReactorShared>, rx: UnboundedReceiver<Command>) {
    let _guard = ExitGuard {
        index,
        shared: shared.clone(),
    };

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(v) => v,
        Err(e) => {
            shared
                .exceptions
                .record(format!("I/O thread {} failed to start: {}", index, e));
            shared.fail();
            return;
        }
    };

    let worker = Worker {
        index,
        shared,
        sessions: SessionRegistry::default(),
        tasks: JoinSet::new(),
    };

    rt.block_on(worker.event_loop(rx));
}

struct ExitGuard {
    index: usize,
    shared: Arc<ReactorShared>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.shared
                .exceptions
                .record(format!("I/O thread {} died", self.index));
            self.shared.fail();
        }
        self.shared.worker_exited(self.index);
    }
}

struct Worker {
    index: usize,
    shared: Arc<ReactorShared>,
    sessions: SessionRegistry,
    tasks: JoinSet<()>,
}

impl Worker {
    async fn event_loop(mut self, mut rx: UnboundedReceiver<Command>) {
        debug!("I/O thread {} running", self.index);

        let mut draining = false;
        let mut deadline: Option<Instant> = None;

        loop {
            if draining && self.tasks.is_empty() {
                break;
            }

            tokio::select! {
                cmd = rx.recv() => {
                    let cmd = match cmd {
                        Some(v) => v,
                        None => break,
                    };
                    match cmd {
                        Command::Shutdown(Some(grace)) => {
                            if !draining {
                                debug!("I/O thread {} draining for {:?}", self.index, grace);
                                draining = true;
                                deadline = Some(Instant::now() + grace);
                                self.sessions.start_draining();
                            }
                        }
                        Command::Shutdown(None) => break,
                        cmd if draining => reject(cmd),
                        Command::Register(stream, scheme) => self.register(stream, scheme),
                        Command::Listen(addr, scheme, reply) => self.listen(addr, scheme, reply).await,
                        Command::Connect { host, port, timeout, handler, reply } => {
                            self.connect(host, port, timeout, handler, reply)
                        }
                    }
                }

                Some(res) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = res {
                        if e.is_panic() {
                            warn!("Session task panicked");
                            self.shared.exceptions.record("Session task panicked".into());
                        }
                    }
                }

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    debug!("I/O thread {} grace period over", self.index);
                    break;
                }
            }
        }

        for h in self.sessions.handles() {
            h.close(CloseMode::Immediate);
        }
        // aborted session tasks finalize their sessions on drop.
        self.tasks.shutdown().await;

        debug!("I/O thread {} exits", self.index);
    }

    fn register(&mut self, stream: std::net::TcpStream, scheme: Scheme) {
        let shared = self.shared.clone();
        let sessions = self.sessions.clone();

        self.tasks.spawn(async move {
            match accept_session(shared.clone(), sessions, stream, scheme).await {
                Ok(task) => task.await,
                Err(e) => {
                    debug!("Accept failed: {}", e);
                    shared.exceptions.record(format!("Accept failed: {}", e));
                }
            }
        });
    }

    async fn listen(&mut self, addr: SocketAddr, scheme: Scheme, reply: Reply<ListenerEndpoint>) {
        let listener = match TcpListener::bind(addr).await {
            Ok(v) => v,
            Err(e) => {
                debug!("Bind {} failed: {}", addr, e);
                reply.send(Err(e.into())).ok();
                return;
            }
        };

        let bound = match listener.local_addr() {
            Ok(v) => v,
            Err(e) => {
                reply.send(Err(e.into())).ok();
                return;
            }
        };

        let endpoint = ListenerEndpoint::new(bound, scheme, &self.shared.endpoints);
        self.shared.endpoints.insert(endpoint.clone());

        info!("Listening on {:?}", endpoint);

        if reply.send(Ok(endpoint.clone())).is_err() {
            // nobody waits for the endpoint, it stays registered until closed.
            trace!("Listen result dropped: {}", bound);
        }

        let shared = self.shared.clone();
        self.tasks.spawn(accept_loop(shared, listener, endpoint));
    }

    fn connect(
        &mut self,
        host: String,
        port: u16,
        timeout: Duration,
        handler: Option<Box<dyn IoEventHandler>>,
        reply: Reply<SessionHandle>,
    ) {
        let shared = self.shared.clone();
        let sessions = self.sessions.clone();

        self.tasks.spawn(async move {
            match connect_session(shared.clone(), sessions, &host, port, timeout, handler).await {
                Ok(task) => {
                    reply.send(Ok(task.handle.clone())).ok();
                    task.await;
                }
                Err(e) => {
                    debug!("Connect {}:{} failed: {}", host, port, e);
                    shared
                        .exceptions
                        .record(format!("Connect {}:{} failed: {}", host, port, e));
                    reply.send(Err(e)).ok();
                }
            }
        });
    }
}

fn reject(cmd: Command) {
    match cmd {
        Command::Listen(_, _, reply) => {
            reply.send(Err(Error::Closed)).ok();
        }
        Command::Connect { reply, .. } => {
            reply.send(Err(Error::Closed)).ok();
        }
        // dropping closes the socket.
        Command::Register(..) | Command::Shutdown(_) => {}
    }
}

async fn accept_loop(shared: Arc<ReactorShared>, listener: TcpListener, endpoint: ListenerEndpoint) {
    loop {
        tokio::select! {
            _ = endpoint.closed() => break,
            res = listener.accept() => match res {
                Ok((stream, remote)) => {
                    trace!("Accepted {} on {}", remote, endpoint.address());
                    match stream.into_std() {
                        Ok(stream) => shared.dispatch.send(Command::Register(stream, endpoint.scheme())),
                        Err(e) => warn!("Failed to detach accepted socket: {}", e),
                    }
                }
                Err(e) => {
                    // mostly resource exhaustion, the listener itself is fine.
                    warn!("Accept on {} failed: {}", endpoint.address(), e);
                    shared
                        .exceptions
                        .record(format!("Accept on {} failed: {}", endpoint.address(), e));
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    // dropping the listener unbinds.
    endpoint.close();
    debug!("Stopped listening on {}", endpoint.address());
}

async fn accept_session(
    shared: Arc<ReactorShared>,
    sessions: SessionRegistry,
    stream: std::net::TcpStream,
    scheme: Scheme,
) -> Result<SessionTask, Error> {
    let stream = TcpStream::from_std(stream)?;
    stream.set_nodelay(shared.config.tcp_nodelay)?;

    let local = stream.local_addr()?;
    let remote = stream.peer_addr()?;

    let (transport, tls): (Box<dyn Transport>, _) = match scheme {
        Scheme::Http => (Box::new(stream), None),
        Scheme::Https => {
            let acceptor = shared
                .tls
                .as_ref()
                .ok_or_else(|| Error::User("Https endpoint without TLS config".into()))?;

            let limit = shared.config.tls_handshake_timeout;
            let stream = tokio::time::timeout(limit, acceptor.accept(stream))
                .await
                .map_err(|_| Error::Timeout(limit))??;

            let (_, conn) = stream.get_ref();
            let details = TlsDetails {
                alpn: conn.alpn_protocol().map(|p| p.to_vec()),
                sni: conn.server_name().map(|s| s.to_string()),
            };
            debug!("TLS handshake with {} done: {:?}", remote, details);

            (Box::new(stream), Some(details))
        }
    };

    Ok(SessionTask::new(shared, sessions, local, remote, transport, tls, None))
}

async fn connect_session(
    shared: Arc<ReactorShared>,
    sessions: SessionRegistry,
    host: &str,
    port: u16,
    timeout: Duration,
    handler: Option<Box<dyn IoEventHandler>>,
) -> Result<SessionTask, Error> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| Error::Timeout(timeout))??;

    stream.set_nodelay(shared.config.tcp_nodelay)?;

    let local = stream.local_addr()?;
    let remote = stream.peer_addr()?;

    debug!("Connected {} -> {}", local, remote);

    Ok(SessionTask::new(
        shared,
        sessions,
        local,
        remote,
        Box::new(stream),
        None,
        handler,
    ))
}

/// Drives one session and its event handler on the owning I/O thread.
struct SessionTask {
    shared: Arc<ReactorShared>,
    sessions: SessionRegistry,
    handle: SessionHandle,
    session: IoSession,
    handler: Box<dyn IoEventHandler>,
    idle: Pin<Box<Sleep>>,
    connected: bool,
    finished: bool,
}

impl SessionTask {
    fn new(
        shared: Arc<ReactorShared>,
        sessions: SessionRegistry,
        local: SocketAddr,
        remote: SocketAddr,
        transport: Box<dyn Transport>,
        tls: Option<TlsDetails>,
        handler: Option<Box<dyn IoEventHandler>>,
    ) -> Self {
        let id = shared.next_session_id();
        let session = IoSession::new(id, local, remote, shared.config.so_timeout, transport, tls);
        let handler = handler.unwrap_or_else(|| shared.factory.create(&session));
        let handle = session.handle();

        sessions.insert(handle.clone());

        SessionTask {
            shared,
            sessions,
            handle,
            session,
            handler,
            idle: Box::pin(tokio::time::sleep_until(Instant::now())),
            connected: false,
            finished: false,
        }
    }

    fn fail(&mut self, e: Error) {
        debug!("Session {} failed: {}", self.handle.id(), e);
        self.handler.exception(&mut self.session, &e);
        self.shared.exceptions.record(format!(
            "Session {} ({}): {}",
            self.handle.id(),
            self.handle.remote_addr(),
            e
        ));
        self.session.close(CloseMode::Immediate);
    }

    fn drive(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            if !self.connected {
                self.connected = true;
                if let Err(e) = self.handler.connected(&mut self.session) {
                    self.fail(e);
                }
            }

            if self.handle.take_shutdown_request() {
                self.handler.shutdown_requested(&mut self.session);
            }

            match self.handle.take_close_request() {
                Some(CloseMode::Immediate) => return Poll::Ready(()),
                Some(CloseMode::Graceful) => {
                    if self.session.has_io() {
                        let res = ready!(Pin::new(&mut self.session).poll_shutdown(cx));
                        if let Err(e) = res {
                            trace!("Shutdown of session {}: {}", self.handle.id(), e);
                        }
                    }
                    return Poll::Ready(());
                }
                None => {}
            }

            match self.handler.poll_event(cx, &mut self.session) {
                Poll::Ready(Ok(())) => {
                    trace!("Session {} handler done", self.handle.id());
                    self.session.close(CloseMode::Graceful);
                    continue;
                }
                Poll::Ready(Err(e)) => {
                    self.fail(e);
                    continue;
                }
                Poll::Pending => {}
            }

            if self.handle.take_close_request().is_some() {
                continue;
            }

            let timeout = self.handle.idle_timeout();

            if timeout > Duration::ZERO {
                let deadline = self.handle.last_activity() + timeout;

                if deadline <= Instant::now() {
                    // restart the idle period, the handler may keep the session.
                    self.handle.touch();
                    if let Err(e) = self.handler.timeout(&mut self.session, timeout) {
                        self.fail(e);
                    }
                    continue;
                }

                self.idle.as_mut().reset(deadline);
                if self.idle.as_mut().poll(cx).is_ready() {
                    continue;
                }
            }

            return Poll::Pending;
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        self.handle.set_closed();
        self.session.drop_io();
        self.handler.disconnected(&mut self.session);
        self.sessions.remove(self.handle.id());

        trace!("Session {} closed", self.handle.id());
    }
}

impl Future for SessionTask {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if this.finished {
            return Poll::Ready(());
        }

        this.handle.register(cx);

        ready!(this.drive(cx));
        this.finish();

        Poll::Ready(())
    }
}

impl Drop for SessionTask {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: u64) -> IoSession {
        let (io, _) = tokio::io::duplex(64);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        IoSession::new(id, addr, addr, Duration::ZERO, Box::new(io), None)
    }

    #[test]
    fn draining_reaches_live_sessions() {
        let registry = SessionRegistry::default();
        let s = session(1);
        registry.insert(s.handle());

        registry.start_draining();

        assert!(s.handle().take_shutdown_request());
    }

    #[test]
    fn late_session_is_asked_to_shut_down() {
        let registry = SessionRegistry::default();
        registry.start_draining();

        // e.g. a TLS handshake that finished after draining started.
        let s = session(2);
        registry.insert(s.handle());

        assert!(s.handle().take_shutdown_request());
        assert_eq!(registry.handles().len(), 1);

        registry.remove(2);
        assert!(registry.handles().is_empty());
    }

    #[test]
    fn no_shutdown_request_before_draining() {
        let registry = SessionRegistry::default();
        let s = session(3);
        registry.insert(s.handle());

        assert!(!s.handle().take_shutdown_request());
    }
}
