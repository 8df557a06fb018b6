//! Server side of the HTTP/1.1 protocol, driven as a session event handler.
//!
//! One exchange at a time per connection. Request bodies are delivered to the
//! exchange handler within the capacity it grants; when the window is exhausted
//! the session stops reading the socket until the handler updates its capacity.
//! Pipelined request bytes stay buffered for the next exchange.

use crate::buffer::BufferWindow;
use crate::capacity::CapacityWindow;
use crate::chunked::Decoded;
use crate::exchange::{AsyncExchangeHandler, DataStreamChannel, HandlerFactory, ResponseChannel};
use crate::http11::{try_parse_req, write_http1x_res};
use crate::limit::{allow_reuse, is_chunked, LimitRead, LimitWrite};
use crate::reactor::{EventMask, IoEventHandler, IoSession, SessionHandle};
use crate::try_write::try_write;
use crate::Error;
use futures_util::ready;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};

/// Least free space offered to a socket read.
const READ_MIN: usize = 1024;

/// HTTP/1.1 connection settings.
#[derive(Debug, Clone)]
pub struct Http1Config {
    /// Initial size of the connection read buffer.
    pub buffer_size: usize,
    /// Max size of a request head.
    pub max_head_size: usize,
    /// Max encoded response bytes queued for the socket. Writes beyond it are
    /// refused until the socket catches up.
    pub max_outbound: usize,
}

impl Default for Http1Config {
    fn default() -> Self {
        Http1Config {
            buffer_size: 8192,
            max_head_size: 16_384,
            max_outbound: 65_536,
        }
    }
}

/// Session event handler serving HTTP/1.1 exchanges.
pub struct Http1Handler {
    config: Http1Config,
    factory: Arc<dyn HandlerFactory>,
    read_buf: BufferWindow,
    eof: bool,
    shutdown: bool,
    state: State,
}

enum State {
    /// Waiting for the next request.
    Waiting,
    /// An exchange is ongoing.
    Exchange(Box<Exchange>),
    /// Flush what is left, then close.
    Closing(Option<Arc<H1Channel>>),
    Closed,
}

struct Exchange {
    handler: Box<dyn AsyncExchangeHandler>,
    limit: LimitRead,
    capacity: Arc<CapacityWindow>,
    channel: Arc<H1Channel>,
    input_done: bool,
    /// produce() has been called at least once.
    attached: bool,
    released: bool,
}

#[derive(Debug)]
enum DriveResult {
    /// Loop the drive_state again.
    Loop,
    /// Connection is done.
    Close,
}

impl Http1Handler {
    pub fn new(config: Http1Config, factory: Arc<dyn HandlerFactory>) -> Self {
        let read_buf = BufferWindow::with_capacity(config.buffer_size);
        Http1Handler {
            config,
            factory,
            read_buf,
            eof: false,
            shutdown: false,
            state: State::Waiting,
        }
    }

    fn poll_drive(
        &mut self,
        cx: &mut Context<'_>,
        session: &mut IoSession,
    ) -> Poll<Result<(), Error>> {
        loop {
            let ret = match ready!(self.drive_state(cx, session)) {
                Ok(v) => v,
                // the transport is gone, nobody to answer.
                Err(e @ Error::Io(_)) => {
                    self.fail_transport(&e);
                    return Err(e).into();
                }
                Err(e) => {
                    // an exchange failing before its response is committed
                    // is answered with a 500, the connection survives until flushed.
                    ready!(self.fail_exchange(&e, session))?;
                    continue;
                }
            };

            match ret {
                DriveResult::Loop => continue,
                DriveResult::Close => {
                    self.state = State::Closed;
                    return Ok(()).into();
                }
            }
        }
    }

    fn drive_state(
        &mut self,
        cx: &mut Context<'_>,
        session: &mut IoSession,
    ) -> Poll<Result<DriveResult, Error>> {
        trace!("drive_state: {:?}", self.state);

        match &mut self.state {
            State::Closed => Ok(DriveResult::Close).into(),

            State::Closing(channel) => {
                if let Some(channel) = channel {
                    let flush = channel.flush(cx, session)?;
                    if !flush.done {
                        return Poll::Pending;
                    }
                }
                Ok(DriveResult::Close).into()
            }

            State::Waiting => {
                if self.shutdown {
                    return Ok(DriveResult::Close).into();
                }

                if !self.read_buf.is_empty() {
                    if let Some((req, size)) = try_parse_req(self.read_buf.chunk())? {
                        self.read_buf.consume(size);
                        self.start_exchange(req, session)?;
                        return Ok(DriveResult::Loop).into();
                    }

                    if self.read_buf.len() > self.config.max_head_size {
                        return Err(Error::Protocol("Request head too large".into())).into();
                    }
                }

                if self.eof {
                    trace!("Connection closed");
                    return Ok(DriveResult::Close).into();
                }

                session.set_event(EventMask::READ);
                ready!(poll_read(cx, session, &mut self.read_buf, &mut self.eof))?;

                Ok(DriveResult::Loop).into()
            }

            State::Exchange(ex) => {
                let flush = ex.channel.flush(cx, session)?;

                // progress on input.
                if !ex.input_done {
                    // a response that is already complete makes the rest of the
                    // body irrelevant, it is read only to keep the connection usable.
                    let discard = ex.channel.is_ended();

                    let cap = if discard {
                        usize::max_value()
                    } else {
                        ex.capacity.available()
                    };

                    match ex.limit.decode(self.read_buf.chunk(), cap)? {
                        Decoded::Data { consumed, data } => {
                            if !discard {
                                ex.capacity.take(data.len());
                                ex.handler.consume(&self.read_buf.chunk()[data])?;
                            }
                            self.read_buf.consume(consumed);
                            return Ok(DriveResult::Loop).into();
                        }

                        Decoded::End { consumed, trailers } => {
                            self.read_buf.consume(consumed);
                            ex.input_done = true;
                            trace!("Request body done");
                            if !discard {
                                ex.handler.stream_end(trailers)?;
                            }
                            return Ok(DriveResult::Loop).into();
                        }

                        Decoded::NeedMore { consumed } => {
                            self.read_buf.consume(consumed);

                            if cap == 0 {
                                ex.capacity.register(cx.waker());
                                if ex.capacity.available() > 0 {
                                    return Ok(DriveResult::Loop).into();
                                }
                                // backpressure to the socket.
                                trace!("Capacity exhausted, clear READ");
                                session.clear_event(EventMask::READ);
                            } else if self.eof {
                                return Err(Error::Protocol(
                                    "Connection closed before end of request body".into(),
                                ))
                                .into();
                            } else {
                                session.set_event(EventMask::READ);
                                if let Poll::Ready(r) =
                                    poll_read(cx, session, &mut self.read_buf, &mut self.eof)
                                {
                                    r?;
                                    return Ok(DriveResult::Loop).into();
                                }
                            }
                        }
                    }
                }

                // progress on output.
                if ex.channel.is_committed() && !ex.channel.is_ended() {
                    let wanted =
                        !ex.attached || ex.channel.take_output_request() || ex.handler.available() > 0;

                    if wanted && ex.channel.has_room() {
                        ex.attached = true;
                        let before = ex.channel.progress();
                        ex.handler.produce(ex.channel.clone())?;
                        if ex.channel.progress() != before {
                            return Ok(DriveResult::Loop).into();
                        }
                    }
                }

                if flush.written > 0 {
                    return Ok(DriveResult::Loop).into();
                }

                if ex.input_done && ex.channel.is_ended() && flush.done && ex.channel.is_drained() {
                    let keep_alive = ex.channel.keep_alive() && !self.shutdown;
                    ex.release();

                    trace!("Exchange done, keep-alive: {}", keep_alive);

                    self.state = if keep_alive {
                        State::Waiting
                    } else {
                        State::Closing(None)
                    };

                    return Ok(DriveResult::Loop).into();
                }

                Poll::Pending
            }
        }
    }

    fn start_exchange(&mut self, req: http::Request<()>, session: &IoSession) -> Result<(), Error> {
        let limit = LimitRead::from_headers(req.headers())?;

        let keep_alive = allow_reuse(req.headers(), req.version());
        let head_request = req.method() == http::Method::HEAD;
        let has_body = !limit.is_no_body();

        let channel = Arc::new(H1Channel::new(
            req.version(),
            head_request,
            keep_alive,
            self.config.max_outbound,
            session.handle(),
        ));

        let capacity = Arc::new(CapacityWindow::new());

        let handler = self.factory.create();

        self.state = State::Exchange(Box::new(Exchange {
            handler,
            limit,
            capacity: capacity.clone(),
            channel: channel.clone(),
            input_done: !has_body,
            attached: false,
            released: false,
        }));

        if let State::Exchange(ex) = &mut self.state {
            ex.handler.handle_request(req, has_body, channel)?;
            if has_body {
                ex.handler.update_capacity(capacity)?;
            }
        }

        Ok(())
    }

    /// Fail the current exchange. Before a response is committed, a 500 is sent
    /// and the connection closes afterwards. Otherwise the connection can't be
    /// saved and the error propagates. A request head that can't be made sense of
    /// gets a 400.
    fn fail_exchange(&mut self, e: &Error, session: &IoSession) -> Poll<Result<(), Error>> {
        let status = match std::mem::replace(&mut self.state, State::Closed) {
            State::Exchange(mut ex) => {
                warn!("Exchange failed: {}", e);
                ex.handler.failed(e);
                ex.release();

                if ex.channel.is_committed() {
                    return Err(Error::Protocol(format!("Exchange failed after response: {}", e)))
                        .into();
                }

                http::StatusCode::INTERNAL_SERVER_ERROR
            }
            State::Waiting => {
                debug!("Bad request: {}", e);
                http::StatusCode::BAD_REQUEST
            }
            _ => {
                return Err(Error::Protocol(e.to_string())).into();
            }
        };

        let channel = Arc::new(H1Channel::new(
            http::Version::HTTP_11,
            false,
            false,
            self.config.max_outbound,
            session.handle(),
        ));

        let res = http::Response::builder()
            .status(status)
            .header(http::header::CONTENT_LENGTH, "0")
            .body(())?;

        channel.send_response(res, true)?;

        self.state = State::Closing(Some(channel));

        Ok(()).into()
    }

    fn fail_transport(&mut self, e: &Error) {
        if let State::Exchange(ex) = &mut self.state {
            ex.handler.failed(e);
            ex.release();
        }
        self.state = State::Closed;
    }

    fn has_uncommitted_exchange(&self) -> bool {
        match &self.state {
            State::Exchange(ex) => !ex.channel.is_committed(),
            _ => false,
        }
    }
}

impl Exchange {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.handler.release_resources();
        self.capacity.close();
        self.channel.close();
    }
}

fn poll_read(
    cx: &mut Context<'_>,
    session: &mut IoSession,
    read_buf: &mut BufferWindow,
    eof: &mut bool,
) -> Poll<Result<(), Error>> {
    let amount = {
        let spare = read_buf.spare_mut(READ_MIN);
        let mut buf = ReadBuf::new(spare);
        ready!(Pin::new(&mut *session).poll_read(cx, &mut buf))?;
        buf.filled().len()
    };

    trace!("Read from socket: {}", amount);

    if amount == 0 {
        *eof = true;
    }

    read_buf.advance(amount);

    Ok(()).into()
}

impl IoEventHandler for Http1Handler {
    fn poll_event(
        &mut self,
        cx: &mut Context<'_>,
        session: &mut IoSession,
    ) -> Poll<Result<(), Error>> {
        self.poll_drive(cx, session)
    }

    fn timeout(&mut self, session: &mut IoSession, timeout: Duration) -> Result<(), Error> {
        if self.has_uncommitted_exchange() {
            // answer the hanging exchange with a 500 before closing.
            if let Poll::Ready(Err(e)) = self.fail_exchange(&Error::Timeout(timeout), session) {
                return Err(e);
            }
            return Ok(());
        }

        debug!("HTTP/1.1 session {} idle, closing", session.id());
        session.close(crate::reactor::CloseMode::Graceful);

        Ok(())
    }

    fn shutdown_requested(&mut self, session: &mut IoSession) {
        self.shutdown = true;
        // wake up to close an idle connection.
        session.handle().wake();
    }

    fn disconnected(&mut self, _: &mut IoSession) {
        if let State::Exchange(ex) = &mut self.state {
            if !ex.released {
                ex.handler.failed(&Error::Closed);
                ex.release();
            }
        }
        self.state = State::Closed;
    }
}

/// Flush outcome.
struct Flush {
    written: usize,
    done: bool,
}

/// Response side of one HTTP/1.1 exchange. Encodes into a bounded buffer that the
/// connection flushes to the socket.
pub(crate) struct H1Channel {
    state: Mutex<ChannelState>,
    session: SessionHandle,
}

struct ChannelState {
    buf: BufferWindow,
    flush_after: bool,
    max: usize,
    version: http::Version,
    head_request: bool,
    keep_alive: bool,
    committed: bool,
    limit: Option<LimitWrite>,
    ended: bool,
    closed: bool,
    output_requested: bool,
    /// Bytes accepted plus end of stream, to detect progress.
    progress: u64,
}

impl H1Channel {
    fn new(
        version: http::Version,
        head_request: bool,
        keep_alive: bool,
        max: usize,
        session: SessionHandle,
    ) -> Self {
        H1Channel {
            state: Mutex::new(ChannelState {
                buf: BufferWindow::with_capacity(0),
                flush_after: false,
                max,
                version,
                head_request,
                keep_alive,
                committed: false,
                limit: None,
                ended: false,
                closed: false,
                output_requested: false,
                progress: 0,
            }),
            session,
        }
    }

    fn flush(&self, cx: &mut Context<'_>, session: &mut IoSession) -> Result<Flush, Error> {
        let mut lock = self.state.lock().unwrap();
        let st = &mut *lock;

        let before = st.buf.len();

        let done = match try_write(cx, session, &mut st.buf, &mut st.flush_after) {
            Poll::Ready(r) => {
                r?;
                true
            }
            Poll::Pending => false,
        };

        Ok(Flush {
            written: before - st.buf.len(),
            done,
        })
    }

    fn is_committed(&self) -> bool {
        self.state.lock().unwrap().committed
    }

    fn is_ended(&self) -> bool {
        self.state.lock().unwrap().ended
    }

    fn is_drained(&self) -> bool {
        let lock = self.state.lock().unwrap();
        lock.buf.is_empty() && !lock.flush_after
    }

    fn keep_alive(&self) -> bool {
        self.state.lock().unwrap().keep_alive
    }

    fn has_room(&self) -> bool {
        let lock = self.state.lock().unwrap();
        let overhead = lock.limit.as_ref().map(|l| l.overhead()).unwrap_or(0);
        lock.buf.len() + overhead < lock.max
    }

    fn take_output_request(&self) -> bool {
        let mut lock = self.state.lock().unwrap();
        std::mem::replace(&mut lock.output_requested, false)
    }

    fn progress(&self) -> u64 {
        self.state.lock().unwrap().progress
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }
}

impl ResponseChannel for H1Channel {
    fn send_response(&self, response: http::Response<()>, end_stream: bool) -> Result<(), Error> {
        let mut lock = self.state.lock().unwrap();
        let st = &mut *lock;

        if st.closed {
            return Err(Error::Closed);
        }
        if st.committed {
            return Err(Error::User("Response already sent".into()));
        }

        let mut res = response;
        let status = res.status();

        if status.is_informational() {
            return Err(Error::User("Interim responses are not supported".into()));
        }

        *res.version_mut() = st.version;

        // https://tools.ietf.org/html/rfc7230#page-31
        // any response with a 1xx (Informational), 204 (No Content), or
        // 304 (Not Modified) status code is always terminated by the first
        // empty line after the header fields, regardless of the header fields
        // present in the message, and thus cannot contain a message body.
        let no_body = st.head_request
            || status == http::StatusCode::NO_CONTENT
            || status == http::StatusCode::NOT_MODIFIED;

        let headers = res.headers_mut();

        if !allow_reuse(headers, st.version) {
            st.keep_alive = false;
        }

        let limit = if no_body {
            LimitWrite::NoBody
        } else if is_chunked(headers) && st.version == http::Version::HTTP_11 {
            LimitWrite::ChunkedEncoder
        } else if headers.contains_key(http::header::CONTENT_LENGTH) {
            LimitWrite::from_headers(headers)
        } else if end_stream {
            headers.insert(http::header::CONTENT_LENGTH, http::HeaderValue::from(0));
            LimitWrite::from_headers(headers)
        } else if st.version == http::Version::HTTP_11 {
            headers.insert(
                http::header::TRANSFER_ENCODING,
                http::HeaderValue::from_static("chunked"),
            );
            LimitWrite::ChunkedEncoder
        } else {
            // HTTP/1.0 without length, the body ends when the connection closes.
            headers.remove(http::header::TRANSFER_ENCODING);
            st.keep_alive = false;
            LimitWrite::CloseDelimited
        };

        if !st.keep_alive && st.version == http::Version::HTTP_11 {
            headers.insert(http::header::CONNECTION, http::HeaderValue::from_static("close"));
        }

        let mut head = Vec::with_capacity(256);
        write_http1x_res(&res, &mut head)?;
        st.buf.append(&head);

        st.committed = true;
        st.limit = Some(limit);

        if end_stream {
            if let Some(limit) = st.limit.as_mut() {
                limit.finish(None, &mut st.buf)?;
            }
            st.ended = true;
            st.progress += 1;
        }

        drop(lock);
        self.session.wake();

        Ok(())
    }
}

impl DataStreamChannel for H1Channel {
    fn request_output(&self) {
        self.state.lock().unwrap().output_requested = true;
        self.session.wake();
    }

    fn write(&self, src: &[u8]) -> Result<usize, Error> {
        let mut lock = self.state.lock().unwrap();
        let st = &mut *lock;

        if st.closed {
            return Err(Error::Closed);
        }
        if !st.committed {
            return Err(Error::User("Body data before response".into()));
        }
        if st.ended {
            return Err(Error::User("Body data after end of stream".into()));
        }
        if st.head_request {
            // response to HEAD never has a body, swallow it.
            return Ok(src.len());
        }

        let limit = match st.limit.as_mut() {
            Some(v) => v,
            None => return Err(Error::User("Body data before response".into())),
        };

        let room = st.max.saturating_sub(st.buf.len() + limit.overhead());
        let amount = src.len().min(room);

        if amount == 0 {
            st.output_requested = true;
            return Ok(0);
        }

        limit.write(&src[..amount], &mut st.buf)?;
        st.progress += amount as u64;

        drop(lock);
        self.session.wake();

        Ok(amount)
    }

    fn end_stream(&self, trailers: Option<http::HeaderMap>) -> Result<(), Error> {
        let mut lock = self.state.lock().unwrap();
        let st = &mut *lock;

        if st.closed {
            return Err(Error::Closed);
        }
        if !st.committed {
            return Err(Error::User("End of stream before response".into()));
        }
        if st.ended {
            return Ok(());
        }

        if let Some(limit) = st.limit.as_mut() {
            limit.finish(trailers.as_ref(), &mut st.buf)?;
        }

        st.ended = true;
        st.progress += 1;

        drop(lock);
        self.session.wake();

        Ok(())
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Waiting => write!(f, "Waiting"),
            State::Exchange(ex) => write!(
                f,
                "Exchange input_done: {}, capacity: {}",
                ex.input_done,
                ex.capacity.available()
            ),
            State::Closing(_) => write!(f, "Closing"),
            State::Closed => write!(f, "Closed"),
        }
    }
}

impl fmt::Debug for Http1Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Http1Handler {:?}", self.state)
    }
}

impl fmt::Debug for H1Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "H1Channel")
    }
}
