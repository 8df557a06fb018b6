//! Choice between HTTP/1.1 and HTTP/2 per connection.

use crate::exchange::HandlerFactory;
use crate::http2::{Http2Config, Http2Handler};
use crate::reactor::{IoEventHandler, IoEventHandlerFactory, IoSession};
use crate::server::{Http1Config, Http1Handler};
use crate::tls::{ALPN_H2, ALPN_HTTP11};
use crate::Error;
use futures_util::ready;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};

/// HTTP/2 client connection preface.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Protocol a connection runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpProtocol {
    Http1,
    Http2,
}

/// How the protocol is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionPolicy {
    ForceHttp1,
    ForceHttp2,
    /// ALPN when encrypted, prior knowledge preface detection in plaintext.
    Negotiate,
}

/// Negotiation settings.
#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    pub policy: VersionPolicy,
    /// Reject a connection whose outcome is not allowed, instead of degrading
    /// it to HTTP/1.1.
    pub strict: bool,
    pub allowed: Vec<HttpProtocol>,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        NegotiationConfig {
            policy: VersionPolicy::Negotiate,
            strict: false,
            allowed: vec![HttpProtocol::Http1, HttpProtocol::Http2],
        }
    }
}

/// What the peer signalled, if anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSignal<'a> {
    /// Negotiated ALPN id of an encrypted connection.
    Alpn(Option<&'a [u8]>),
    /// Whether a plaintext connection started with the HTTP/2 preface.
    PriorKnowledge(bool),
}

/// Decide the protocol of a connection.
pub fn negotiate(config: &NegotiationConfig, signal: PeerSignal<'_>) -> Result<HttpProtocol, Error> {
    let outcome = match config.policy {
        VersionPolicy::ForceHttp1 => HttpProtocol::Http1,
        VersionPolicy::ForceHttp2 => HttpProtocol::Http2,
        VersionPolicy::Negotiate => match signal {
            PeerSignal::Alpn(Some(id)) if id == ALPN_H2 => HttpProtocol::Http2,
            PeerSignal::Alpn(Some(id)) if id == ALPN_HTTP11 => HttpProtocol::Http1,
            PeerSignal::Alpn(Some(id)) => {
                return Err(Error::Protocol(format!(
                    "Unknown ALPN protocol: {}",
                    String::from_utf8_lossy(id)
                )))
            }
            PeerSignal::Alpn(None) => HttpProtocol::Http1,
            PeerSignal::PriorKnowledge(true) => HttpProtocol::Http2,
            PeerSignal::PriorKnowledge(false) => HttpProtocol::Http1,
        },
    };

    if config.allowed.contains(&outcome) {
        return Ok(outcome);
    }

    if config.strict {
        return Err(Error::Protocol(format!("{:?} is not allowed", outcome)));
    }

    debug!("{:?} not allowed, degrade to HTTP/1.1", outcome);

    Ok(HttpProtocol::Http1)
}

/// Complete server setup: negotiation, protocol settings and the exchange handlers.
///
/// Used as the reactor's session handler factory.
#[derive(Clone)]
pub struct ServerConfig {
    pub negotiation: NegotiationConfig,
    pub http1: Http1Config,
    pub http2: Http2Config,
    pub handler_factory: Arc<dyn HandlerFactory>,
}

impl ServerConfig {
    pub fn new(handler_factory: Arc<dyn HandlerFactory>) -> Self {
        ServerConfig {
            negotiation: NegotiationConfig::default(),
            http1: Http1Config::default(),
            http2: Http2Config::default(),
            handler_factory,
        }
    }
}

impl IoEventHandlerFactory for ServerConfig {
    fn create(&self, _: &IoSession) -> Box<dyn IoEventHandler> {
        Box::new(ProtocolNegotiator::new(self.clone()))
    }
}

/// Session handler that picks the protocol, then hands the session over to the
/// protocol's own handler.
pub struct ProtocolNegotiator {
    config: ServerConfig,
    state: State,
}

enum State {
    Start,
    /// Reading the first bytes of a plaintext connection.
    Sniffing(Vec<u8>),
    Installed(Box<dyn IoEventHandler>, HttpProtocol),
}

impl ProtocolNegotiator {
    pub fn new(config: ServerConfig) -> Self {
        ProtocolNegotiator {
            config,
            state: State::Start,
        }
    }

    /// The chosen protocol, once decided.
    pub fn protocol(&self) -> Option<HttpProtocol> {
        match &self.state {
            State::Installed(_, p) => Some(*p),
            _ => None,
        }
    }

    fn install(&mut self, protocol: HttpProtocol, session: &mut IoSession) -> Result<(), Error> {
        debug!("Session {} negotiated {:?}", session.id(), protocol);

        let factory = self.config.handler_factory.clone();

        let mut handler: Box<dyn IoEventHandler> = match protocol {
            HttpProtocol::Http1 => Box::new(Http1Handler::new(self.config.http1.clone(), factory)),
            HttpProtocol::Http2 => Box::new(Http2Handler::new(self.config.http2.clone(), factory)),
        };

        handler.connected(session)?;

        self.state = State::Installed(handler, protocol);

        Ok(())
    }

    fn poll_sniff(&mut self, cx: &mut Context<'_>, session: &mut IoSession) -> Poll<Result<Option<bool>, Error>> {
        let buf = match &mut self.state {
            State::Sniffing(buf) => buf,
            _ => return Ok(None).into(),
        };

        loop {
            // the first mismatching byte decides.
            if !PREFACE.starts_with(&buf[..]) {
                return Ok(Some(false)).into();
            }
            if buf.len() == PREFACE.len() {
                return Ok(Some(true)).into();
            }

            let mut tmp = [0_u8; 24];
            let want = PREFACE.len() - buf.len();

            let amount = {
                let mut rb = ReadBuf::new(&mut tmp[..want]);
                ready!(Pin::new(&mut *session).poll_read(cx, &mut rb))?;
                rb.filled().len()
            };

            if amount == 0 {
                trace!("EOF while sniffing protocol");
                return Ok(None).into();
            }

            buf.extend_from_slice(&tmp[..amount]);
        }
    }
}

impl IoEventHandler for ProtocolNegotiator {
    fn connected(&mut self, session: &mut IoSession) -> Result<(), Error> {
        let signal = match session.tls_details() {
            Some(tls) => Some(PeerSignal::Alpn(tls.alpn.as_deref())),
            None if self.config.negotiation.policy == VersionPolicy::Negotiate => None,
            None => Some(PeerSignal::PriorKnowledge(false)),
        };

        match signal {
            Some(signal) => {
                let protocol = negotiate(&self.config.negotiation, signal)?;
                self.install(protocol, session)
            }
            None => {
                self.state = State::Sniffing(Vec::with_capacity(PREFACE.len()));
                Ok(())
            }
        }
    }

    fn poll_event(&mut self, cx: &mut Context<'_>, session: &mut IoSession) -> Poll<Result<(), Error>> {
        loop {
            match &mut self.state {
                State::Start => {
                    // connected() was never called.
                    return Err(Error::Protocol("Negotiation never started".into())).into();
                }

                State::Sniffing(_) => {
                    let prior = match ready!(self.poll_sniff(cx, session))? {
                        Some(v) => v,
                        // peer left before sending anything useful.
                        None => return Ok(()).into(),
                    };

                    if let State::Sniffing(buf) = std::mem::replace(&mut self.state, State::Start) {
                        session.unread(&buf)?;
                    }

                    let protocol = negotiate(&self.config.negotiation, PeerSignal::PriorKnowledge(prior))?;
                    self.install(protocol, session)?;
                }

                State::Installed(handler, _) => return handler.poll_event(cx, session),
            }
        }
    }

    fn timeout(&mut self, session: &mut IoSession, timeout: Duration) -> Result<(), Error> {
        match &mut self.state {
            State::Installed(handler, _) => handler.timeout(session, timeout),
            _ => {
                session.close(crate::reactor::CloseMode::Graceful);
                Ok(())
            }
        }
    }

    fn shutdown_requested(&mut self, session: &mut IoSession) {
        match &mut self.state {
            State::Installed(handler, _) => handler.shutdown_requested(session),
            _ => session.close(crate::reactor::CloseMode::Graceful),
        }
    }

    fn exception(&mut self, session: &mut IoSession, cause: &Error) {
        warn!("Session {} exception: {}", session.id(), cause);
        if let State::Installed(handler, _) = &mut self.state {
            handler.exception(session, cause);
        }
    }

    fn disconnected(&mut self, session: &mut IoSession) {
        if let State::Installed(handler, _) = &mut self.state {
            handler.disconnected(session);
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("negotiation", &self.negotiation)
            .field("http1", &self.http1)
            .field("http2", &self.http2)
            .finish()
    }
}

impl fmt::Debug for ProtocolNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtocolNegotiator {:?}", self.protocol())
    }
}
