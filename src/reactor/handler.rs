use super::session::{CloseMode, IoSession};
use crate::Error;
use std::fmt;
use std::task::{Context, Poll};
use std::time::Duration;

/// Session-level event callbacks.
///
/// All callbacks run on the reactor thread owning the session, strictly ordered.
/// `poll_event` is called whenever the session transport or any waker registered
/// through the session becomes ready; returning `Ready(Ok(()))` means the handler
/// is done and the session is closed gracefully.
pub trait IoEventHandler: Send {
    /// Session established (after the TLS handshake, if any).
    fn connected(&mut self, session: &mut IoSession) -> Result<(), Error> {
        let _ = session;
        Ok(())
    }

    /// Make progress on whatever I/O is ready.
    fn poll_event(
        &mut self,
        cx: &mut Context<'_>,
        session: &mut IoSession,
    ) -> Poll<Result<(), Error>>;

    /// No I/O activity for the session's idle timeout.
    fn timeout(&mut self, session: &mut IoSession, timeout: Duration) -> Result<(), Error> {
        debug!("Session {} idle for {:?}, closing", session.id(), timeout);
        session.close(CloseMode::Graceful);
        Ok(())
    }

    /// The reactor is shutting down gracefully.
    fn shutdown_requested(&mut self, session: &mut IoSession) {
        session.close(CloseMode::Graceful);
    }

    /// Any failure ending the session.
    fn exception(&mut self, session: &mut IoSession, cause: &Error) {
        let _ = (session, cause);
    }

    /// Session is closed. Called exactly once.
    fn disconnected(&mut self, session: &mut IoSession) {
        let _ = session;
    }
}

/// Creates an event handler per session.
pub trait IoEventHandlerFactory: Send + Sync {
    fn create(&self, session: &IoSession) -> Box<dyn IoEventHandler>;
}

/// Event handler doing nothing but holding the session open.
#[derive(Debug, Clone, Default)]
pub struct NoopEventHandler {
    config: NoopConfig,
}

/// What the [`NoopEventHandler`] does.
#[derive(Debug, Clone, Copy)]
pub struct NoopConfig {
    /// Close on idle timeout.
    pub close_on_timeout: bool,
    /// Close right after connecting.
    pub close_on_connect: bool,
}

impl Default for NoopConfig {
    fn default() -> Self {
        NoopConfig {
            close_on_timeout: true,
            close_on_connect: false,
        }
    }
}

impl NoopEventHandler {
    pub fn new(config: NoopConfig) -> Self {
        NoopEventHandler { config }
    }
}

impl IoEventHandler for NoopEventHandler {
    fn connected(&mut self, session: &mut IoSession) -> Result<(), Error> {
        if self.config.close_on_connect {
            session.close(CloseMode::Graceful);
        }
        Ok(())
    }

    fn poll_event(&mut self, _: &mut Context<'_>, _: &mut IoSession) -> Poll<Result<(), Error>> {
        Poll::Pending
    }

    fn timeout(&mut self, session: &mut IoSession, _: Duration) -> Result<(), Error> {
        if self.config.close_on_timeout {
            session.close(CloseMode::Graceful);
        }
        Ok(())
    }
}

/// Factory of [`NoopEventHandler`].
#[derive(Debug, Clone, Default)]
pub struct NoopFactory(pub NoopConfig);

impl IoEventHandlerFactory for NoopFactory {
    fn create(&self, _: &IoSession) -> Box<dyn IoEventHandler> {
        Box::new(NoopEventHandler::new(self.0))
    }
}

impl fmt::Debug for dyn IoEventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IoEventHandler")
    }
}
