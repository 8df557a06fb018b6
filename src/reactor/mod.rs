//! Event loops multiplexing connections over a fixed set of I/O threads.

mod config;
mod endpoint;
mod handler;
mod session;
mod worker;

pub use config::IoReactorConfig;
pub use endpoint::{ListenerEndpoint, Scheme};
pub use handler::{IoEventHandler, IoEventHandlerFactory, NoopConfig, NoopEventHandler, NoopFactory};
pub use session::{CloseMode, EventMask, IoSession, SessionHandle, SessionIo, SessionStatus};
pub use session::TlsDetails;

use crate::tls::TlsConfig;
use crate::Error;
use endpoint::EndpointRegistry;
use futures_channel::oneshot;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use worker::{Command, Dispatcher};

/// Lifecycle of a reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IoReactorStatus {
    Inactive,
    Active,
    ShuttingDown,
    ShutDown,
}

/// A recorded transport-level failure.
#[derive(Debug, Clone)]
pub struct ExceptionEvent {
    pub time: SystemTime,
    pub message: String,
}

/// Ring of the most recent failures.
pub(crate) struct ExceptionLog {
    events: Mutex<VecDeque<ExceptionEvent>>,
    capacity: usize,
}

impl ExceptionLog {
    fn new(capacity: usize) -> Self {
        ExceptionLog {
            events: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn record(&self, message: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lock = self.events.lock().unwrap();
        if lock.len() == self.capacity {
            lock.pop_front();
        }
        lock.push_back(ExceptionEvent {
            time: SystemTime::now(),
            message,
        });
    }

    fn events(&self) -> Vec<ExceptionEvent> {
        self.events.lock().unwrap().iter().cloned().collect()
    }
}

struct StatusCell {
    status: Mutex<IoReactorStatus>,
    cond: Condvar,
}

impl StatusCell {
    fn get(&self) -> IoReactorStatus {
        *self.status.lock().unwrap()
    }

    /// Move forward to `to`. Never goes back.
    fn advance(&self, to: IoReactorStatus) -> IoReactorStatus {
        let mut lock = self.status.lock().unwrap();
        let prev = *lock;
        if to > prev {
            info!("Reactor {:?} -> {:?}", prev, to);
            *lock = to;
            self.cond.notify_all();
        }
        prev
    }

    fn wait_for(&self, target: IoReactorStatus, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut lock = self.status.lock().unwrap();

        while *lock < target {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            lock = self.cond.wait_timeout(lock, deadline - now).unwrap().0;
        }

        true
    }
}

/// State shared by the reactor and its I/O threads.
pub(crate) struct ReactorShared {
    config: IoReactorConfig,
    factory: Arc<dyn IoEventHandlerFactory>,
    tls: Option<tokio_rustls::TlsAcceptor>,
    endpoints: EndpointRegistry,
    status: StatusCell,
    exceptions: ExceptionLog,
    dispatch: Dispatcher,
    running: AtomicUsize,
    next_id: AtomicU64,
}

impl ReactorShared {
    fn next_session_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn shutdown(&self, grace: Option<Duration>) {
        self.status.advance(IoReactorStatus::ShuttingDown);
        self.endpoints.close_all();
        self.dispatch.broadcast(|| Command::Shutdown(grace));
    }

    /// Fatal failure of an I/O thread takes the whole reactor down.
    fn fail(&self) {
        warn!("Reactor failure, shutting down");
        self.shutdown(None);
    }

    fn worker_exited(&self, index: usize) {
        trace!("I/O thread {} exited", index);
        if self.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.status.advance(IoReactorStatus::ShutDown);
        }
    }
}

/// Multi-threaded non-blocking I/O reactor.
///
/// Each I/O thread runs its own event loop over a disjoint subset of the
/// sessions. Accepted connections are spread round-robin over the threads.
pub struct IoReactor {
    shared: Arc<ReactorShared>,
    receivers: Mutex<Vec<UnboundedReceiver<Command>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl IoReactor {
    pub fn new(
        config: IoReactorConfig,
        factory: Arc<dyn IoEventHandlerFactory>,
        tls: Option<TlsConfig>,
    ) -> Self {
        let count = config.io_thread_count.max(1);

        let (senders, receivers): (Vec<_>, Vec<_>) = (0..count)
            .map(|_| mpsc::unbounded_channel::<Command>())
            .unzip();

        let exceptions = ExceptionLog::new(config.exception_log_size);

        let shared = Arc::new(ReactorShared {
            config,
            factory,
            tls: tls.map(|t| t.acceptor()),
            endpoints: EndpointRegistry::default(),
            status: StatusCell {
                status: Mutex::new(IoReactorStatus::Inactive),
                cond: Condvar::new(),
            },
            exceptions,
            dispatch: Dispatcher::new(senders),
            running: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        });

        IoReactor {
            shared,
            receivers: Mutex::new(receivers),
            threads: Mutex::new(vec![]),
        }
    }

    /// Start the I/O threads.
    pub fn start(&self) -> Result<(), Error> {
        let mut receivers = self.receivers.lock().unwrap();

        if receivers.is_empty() || self.status() != IoReactorStatus::Inactive {
            return Err(Error::User("Reactor already started".into()));
        }

        self.shared
            .running
            .store(receivers.len(), Ordering::Release);

        let mut threads = self.threads.lock().unwrap();

        for (index, rx) in receivers.drain(..).enumerate() {
            let shared = self.shared.clone();
            let name = format!("{}-{}", self.shared.config.thread_name, index);

            let spawned = std::thread::Builder::new()
                .name(name)
                .spawn(move || worker::run(index, shared, rx));

            match spawned {
                Ok(h) => threads.push(h),
                Err(e) => {
                    // the unspawned receivers are dropped with the iterator.
                    let missing = self.shared.config.io_thread_count.max(1) - index;
                    for _ in 0..missing {
                        self.shared.worker_exited(index);
                    }
                    self.shared.fail();
                    return Err(e.into());
                }
            }
        }

        self.shared.status.advance(IoReactorStatus::Active);

        Ok(())
    }

    /// Bind a listening socket.
    ///
    /// Failures such as "address in use" complete the future with an error and leave
    /// the reactor running.
    pub fn listen(&self, address: SocketAddr, scheme: Scheme) -> ListenFuture {
        if let Err(e) = self.check_active() {
            return ReactorFuture::failed(e);
        }
        if scheme == Scheme::Https && self.shared.tls.is_none() {
            return ReactorFuture::failed(Error::User("Https requires a TLS config".into()));
        }

        let (tx, rx) = oneshot::channel();
        self.shared.dispatch.send(Command::Listen(address, scheme, tx));

        ReactorFuture(rx)
    }

    /// Open an outbound connection. `timeout` covers resolution and connecting.
    ///
    /// The session gets its event handler from the reactor's factory.
    pub fn connect(&self, host: &str, port: u16, timeout: Duration) -> ConnectFuture {
        self.send_connect(host, port, timeout, None)
    }

    /// Open an outbound connection driven by `handler`, bypassing the factory.
    pub fn connect_with(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
        handler: Box<dyn IoEventHandler>,
    ) -> ConnectFuture {
        self.send_connect(host, port, timeout, Some(handler))
    }

    fn send_connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
        handler: Option<Box<dyn IoEventHandler>>,
    ) -> ConnectFuture {
        if let Err(e) = self.check_active() {
            return ReactorFuture::failed(e);
        }

        let (tx, rx) = oneshot::channel();
        self.shared.dispatch.send(Command::Connect {
            host: host.to_string(),
            port,
            timeout,
            handler,
            reply: tx,
        });

        ReactorFuture(rx)
    }

    /// Currently bound endpoints.
    pub fn endpoints(&self) -> HashSet<ListenerEndpoint> {
        self.shared.endpoints.endpoints().into_iter().collect()
    }

    /// Graceful shutdown: stop accepting, let sessions finish, then force close
    /// whatever remains after `grace`.
    pub fn shutdown(&self, grace: Duration) {
        self.initiate(Some(grace));
    }

    pub fn close(&self, mode: CloseMode) {
        match mode {
            CloseMode::Graceful => self.initiate(Some(self.shared.config.graceful_timeout)),
            CloseMode::Immediate => self.initiate(None),
        }
    }

    fn initiate(&self, grace: Option<Duration>) {
        if self.status() == IoReactorStatus::Inactive {
            // never started, nothing to drain.
            let mut receivers = self.receivers.lock().unwrap();
            receivers.clear();
            self.shared.status.advance(IoReactorStatus::ShutDown);
            return;
        }
        self.shared.shutdown(grace);
    }

    /// Block until shut down or `timeout` elapses. Must not be called from an I/O thread.
    pub fn await_shutdown(&self, timeout: Duration) -> bool {
        let done = self
            .shared
            .status
            .wait_for(IoReactorStatus::ShutDown, timeout);

        if done {
            let mut threads = self.threads.lock().unwrap();
            for h in threads.drain(..) {
                h.join().ok();
            }
        }

        done
    }

    pub fn status(&self) -> IoReactorStatus {
        self.shared.status.get()
    }

    /// Transport-level failures recorded so far.
    pub fn exceptions(&self) -> Vec<ExceptionEvent> {
        self.shared.exceptions.events()
    }

    fn check_active(&self) -> Result<(), Error> {
        match self.status() {
            IoReactorStatus::Active => Ok(()),
            IoReactorStatus::Inactive => Err(Error::User("Reactor not started".into())),
            _ => Err(Error::Closed),
        }
    }
}

impl Drop for IoReactor {
    fn drop(&mut self) {
        if self.status() < IoReactorStatus::ShutDown {
            self.close(CloseMode::Immediate);
            self.await_shutdown(self.shared.config.graceful_timeout);
        }
    }
}

/// Pending result from an I/O thread.
///
/// Resolves to [`Error::Closed`] if the reactor goes away before answering.
pub struct ReactorFuture<T>(oneshot::Receiver<Result<T, Error>>);

pub type ListenFuture = ReactorFuture<ListenerEndpoint>;
pub type ConnectFuture = ReactorFuture<SessionHandle>;

impl<T> ReactorFuture<T> {
    fn failed(e: Error) -> Self {
        let (tx, rx) = oneshot::channel();
        tx.send(Err(e)).ok();
        ReactorFuture(rx)
    }
}

impl<T> Future for ReactorFuture<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.0).poll(cx) {
            Poll::Ready(Ok(v)) => Poll::Ready(v),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for IoReactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IoReactor({:?})", self.status())
    }
}

impl<T> fmt::Debug for ReactorFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReactorFuture")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_log_keeps_most_recent() {
        let log = ExceptionLog::new(3);
        for i in 0..10 {
            log.record(format!("failure {}", i));
        }

        let messages: Vec<_> = log.events().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["failure 7", "failure 8", "failure 9"]);
    }

    #[test]
    fn exception_log_disabled() {
        let log = ExceptionLog::new(0);
        log.record("lost".into());
        assert!(log.events().is_empty());
    }
}
