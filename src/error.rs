use std::fmt;
use std::io;
use std::time::Duration;

/// Possible errors from this crate.
#[derive(Debug)]
pub enum Error {
    /// A user/usage problem such as sending more bytes than a content-length header specifies.
    User(String),
    /// A wrapped std::io::Error from the underlying transport (socket).
    Io(io::Error),
    /// HTTP/1.1 parse errors from the `httparse` crate.
    Http11Parser(httparse::Error),
    /// Http errors from the `http` crate.
    Http(http::Error),
    /// HTTP/2 errors from the `h2` crate.
    H2(h2::Error),
    /// TLS errors from the `rustls` crate.
    Tls(rustls::Error),
    /// Protocol violations, including a negotiated protocol that is not allowed.
    Protocol(String),
    /// Some wait exceeded its configured duration.
    Timeout(Duration),
    /// The resource is closed, released or the pending result was cancelled.
    Closed,
}

impl Error {
    /// Tells if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Tells if this error is due to a closed/released resource.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }

    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Error::Io(i) => i,
            Error::Timeout(d) => io::Error::new(
                io::ErrorKind::TimedOut,
                format!("Timeout after {:?}", d),
            ),
            Error::Closed => io::Error::new(io::ErrorKind::ConnectionAborted, "Closed"),
            e => io::Error::new(io::ErrorKind::Other, e.to_string()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::User(v) => write!(f, "{}", v),
            Error::Io(v) => fmt::Display::fmt(v, f),
            Error::Http11Parser(v) => write!(f, "http11 parser: {}", v),
            Error::Http(v) => write!(f, "http api: {}", v),
            Error::H2(v) => write!(f, "h2: {}", v),
            Error::Tls(v) => write!(f, "tls: {}", v),
            Error::Protocol(v) => write!(f, "protocol: {}", v),
            Error::Timeout(v) => write!(f, "timeout after {:?}", v),
            Error::Closed => write!(f, "closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Self {
        Error::Http11Parser(e)
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Error::Http(e)
    }
}

impl From<h2::Error> for Error {
    fn from(e: h2::Error) -> Self {
        if e.is_io() {
            if let Some(io) = e.into_io() {
                return Error::Io(io);
            }
            return Error::Closed;
        }
        Error::H2(e)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e)
    }
}
