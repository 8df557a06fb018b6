//! Server side of HTTP/2, driven as a session event handler.
//!
//! The `h2` connection takes over the session I/O. Every stream becomes one
//! exchange; the stream receive window follows the capacity the exchange
//! handler grants, so a slow handler slows down its peer.

use crate::capacity::{CapacityChannel, CapacityWindow};
use crate::exchange::{AsyncExchangeHandler, DataStreamChannel, HandlerFactory, ResponseChannel};
use crate::reactor::{CloseMode, IoEventHandler, IoSession, SessionHandle, SessionIo};
use crate::Error;
use bytes::Bytes;
use futures_util::ready;
use h2::server::{Builder, Connection, Handshake, SendResponse};
use h2::{FlowControl, Reason, RecvStream, SendStream};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

/// HTTP/2 connection settings.
#[derive(Debug, Clone)]
pub struct Http2Config {
    /// Initial stream and connection receive window.
    pub initial_window_size: u32,
    pub max_concurrent_streams: u32,
    pub max_frame_size: u32,
    /// Max response bytes buffered per stream ahead of the send window.
    pub max_send_buffer: usize,
}

impl Default for Http2Config {
    fn default() -> Self {
        Http2Config {
            initial_window_size: 65_535,
            max_concurrent_streams: 100,
            max_frame_size: 16_384,
            max_send_buffer: 65_536,
        }
    }
}

/// Session event handler serving HTTP/2 streams.
pub struct Http2Handler {
    config: Http2Config,
    factory: Arc<dyn HandlerFactory>,
    state: State,
    streams: Vec<H2Exchange>,
    shutdown: bool,
}

enum State {
    Start,
    Handshaking(Pin<Box<Handshake<SessionIo, Bytes>>>),
    Serving(Connection<SessionIo, Bytes>),
    Closed,
}

impl Http2Handler {
    pub fn new(config: Http2Config, factory: Arc<dyn HandlerFactory>) -> Self {
        Http2Handler {
            config,
            factory,
            state: State::Start,
            streams: vec![],
            shutdown: false,
        }
    }

    fn builder(&self) -> Builder {
        let mut builder = Builder::new();
        builder
            .initial_window_size(self.config.initial_window_size)
            .initial_connection_window_size(self.config.initial_window_size)
            .max_concurrent_streams(self.config.max_concurrent_streams)
            .max_frame_size(self.config.max_frame_size);
        builder
    }

    fn start_stream(
        &mut self,
        req: http::Request<RecvStream>,
        respond: SendResponse<Bytes>,
        session: &IoSession,
    ) -> Result<(), Error> {
        let stream_id = respond.stream_id();
        let (parts, mut body) = req.into_parts();
        let req = http::Request::from_parts(parts, ());

        trace!("Stream {:?} request: {} {}", stream_id, req.method(), req.uri());

        let has_body = !body.is_end_stream();
        let head_request = req.method() == http::Method::HEAD;

        let flow = body.flow_control().clone();

        let capacity = Arc::new(H2Capacity {
            window: CapacityWindow::new(),
            session: session.handle(),
        });

        let channel = Arc::new(H2Channel::new(
            respond,
            head_request,
            self.config.max_send_buffer,
            session.handle(),
        ));

        let mut ex = H2Exchange {
            stream_id,
            handler: self.factory.create(),
            body,
            flow,
            initial_window: self.config.initial_window_size as usize,
            received: 0,
            released: 0,
            pending: None,
            capacity: capacity.clone(),
            channel: channel.clone(),
            input_done: !has_body,
            attached: false,
            released_all: false,
        };

        let started = ex
            .handler
            .handle_request(req, has_body, channel)
            .and_then(|_| {
                if has_body {
                    ex.handler.update_capacity(capacity)
                } else {
                    Ok(())
                }
            });

        match started {
            Ok(()) => self.streams.push(ex),
            Err(e) => ex.fail(&e),
        }

        Ok(())
    }

    /// Drive every stream, dropping the ones that are done.
    fn drive_streams(&mut self, cx: &mut Context<'_>) {
        self.streams.retain_mut(|ex| match ex.drive(cx) {
            Ok(done) => !done,
            Err(e) => {
                ex.fail(&e);
                false
            }
        });
    }

    fn fail_all(&mut self, cause: &Error) {
        for mut ex in self.streams.drain(..) {
            ex.fail(cause);
        }
    }
}

impl IoEventHandler for Http2Handler {
    fn poll_event(
        &mut self,
        cx: &mut Context<'_>,
        session: &mut IoSession,
    ) -> Poll<Result<(), Error>> {
        loop {
            match &mut self.state {
                State::Start => {
                    let io = session.take_io()?;
                    let handshake = self.builder().handshake::<_, Bytes>(io);
                    self.state = State::Handshaking(Box::pin(handshake));
                }

                State::Handshaking(handshake) => {
                    let mut conn = ready!(handshake.as_mut().poll(cx))?;
                    debug!("HTTP/2 session {} handshake done", session.id());
                    if self.shutdown {
                        conn.graceful_shutdown();
                    }
                    self.state = State::Serving(conn);
                }

                State::Serving(_) => {
                    let mut accept_done = false;

                    loop {
                        let conn = match &mut self.state {
                            State::Serving(c) => c,
                            _ => unreachable!(),
                        };

                        match conn.poll_accept(cx) {
                            Poll::Ready(Some(Ok((req, respond)))) => {
                                self.start_stream(req, respond, session)?;
                            }
                            Poll::Ready(Some(Err(e))) => {
                                let e: Error = e.into();
                                self.fail_all(&e);
                                self.state = State::Closed;
                                return Err(e).into();
                            }
                            Poll::Ready(None) => {
                                accept_done = true;
                                break;
                            }
                            Poll::Pending => break,
                        }
                    }

                    self.drive_streams(cx);

                    if !accept_done {
                        return Poll::Pending;
                    }

                    if let State::Serving(conn) = &mut self.state {
                        ready!(conn.poll_closed(cx))?;
                    }

                    trace!("HTTP/2 connection closed");
                    self.fail_all(&Error::Closed);
                    self.state = State::Closed;
                }

                State::Closed => return Ok(()).into(),
            }
        }
    }

    fn timeout(&mut self, session: &mut IoSession, timeout: Duration) -> Result<(), Error> {
        match &mut self.state {
            State::Serving(conn) => {
                if self.streams.is_empty() {
                    debug!("HTTP/2 session {} idle for {:?}, going away", session.id(), timeout);
                    conn.graceful_shutdown();
                    session.handle().wake();
                } else {
                    trace!("HTTP/2 session {} idle with {} streams", session.id(), self.streams.len());
                }
            }
            _ => session.close(CloseMode::Graceful),
        }
        Ok(())
    }

    fn shutdown_requested(&mut self, session: &mut IoSession) {
        self.shutdown = true;
        match &mut self.state {
            State::Serving(conn) => conn.graceful_shutdown(),
            State::Start => session.close(CloseMode::Graceful),
            _ => {}
        }
        session.handle().wake();
    }

    fn disconnected(&mut self, _: &mut IoSession) {
        self.fail_all(&Error::Closed);
        self.state = State::Closed;
    }
}

/// One stream being served.
struct H2Exchange {
    stream_id: h2::StreamId,
    handler: Box<dyn AsyncExchangeHandler>,
    body: RecvStream,
    flow: FlowControl,
    initial_window: usize,
    /// Request body bytes received from the peer.
    received: usize,
    /// Bytes handed back to the peer as window updates.
    released: usize,
    /// Received, but beyond what the handler has granted so far.
    pending: Option<Bytes>,
    capacity: Arc<H2Capacity>,
    channel: Arc<H2Channel>,
    input_done: bool,
    attached: bool,
    released_all: bool,
}

impl H2Exchange {
    /// Make progress. Returns `true` when the exchange is complete.
    fn drive(&mut self, cx: &mut Context<'_>) -> Result<bool, Error> {
        loop {
            let mut progress = false;

            if !self.input_done {
                progress |= self.drive_input(cx)?;
            }

            self.channel.poll_capacity(cx)?;

            if self.channel.is_committed() && !self.channel.is_ended() {
                let wanted = !self.attached
                    || self.channel.take_output_request()
                    || self.handler.available() > 0;

                if wanted && self.channel.has_room() {
                    self.attached = true;
                    let before = self.channel.progress();
                    self.handler.produce(self.channel.clone())?;
                    if self.channel.progress() != before {
                        progress = true;
                    }
                }
            }

            if self.input_done && self.channel.is_ended() {
                trace!("Stream {:?} done", self.stream_id);
                self.release();
                return Ok(true);
            }

            if !progress {
                return Ok(false);
            }
        }
    }

    fn drive_input(&mut self, cx: &mut Context<'_>) -> Result<bool, Error> {
        // the response is complete, the rest of the body is of no interest.
        let discard = self.channel.is_ended();

        if let Some(mut data) = self.pending.take() {
            let n = if discard {
                data.len()
            } else {
                self.capacity.window.take(data.len())
            };

            if n > 0 {
                let chunk = data.split_to(n);
                if !discard {
                    self.handler.consume(&chunk)?;
                }
            }

            if !data.is_empty() {
                self.pending = Some(data);
                self.capacity.window.register(cx.waker());
                self.sync_flow(discard)?;
                return Ok(n > 0);
            }

            self.sync_flow(discard)?;
            return Ok(true);
        }

        match self.body.poll_data(cx) {
            Poll::Ready(Some(Ok(data))) => {
                self.received += data.len();
                self.pending = Some(data);
                Ok(true)
            }
            Poll::Ready(Some(Err(e))) => Err(e.into()),
            Poll::Ready(None) => match self.body.poll_trailers(cx) {
                Poll::Ready(Ok(trailers)) => {
                    self.input_done = true;
                    trace!("Stream {:?} request body done", self.stream_id);
                    if !discard {
                        self.handler.stream_end(trailers)?;
                    }
                    Ok(true)
                }
                Poll::Ready(Err(e)) => Err(e.into()),
                Poll::Pending => Ok(false),
            },
            Poll::Pending => {
                self.sync_flow(discard)?;
                Ok(false)
            }
        }
    }

    /// Hand window back to the peer so that what it may send in total never
    /// exceeds the initial window plus what the handler granted.
    fn sync_flow(&mut self, discard: bool) -> Result<(), Error> {
        let target = if discard {
            self.received
        } else {
            self.capacity
                .window
                .granted()
                .saturating_sub(self.initial_window)
                .min(self.received)
        };

        if target > self.released {
            self.flow.release_capacity(target - self.released)?;
            self.released = target;
        }

        Ok(())
    }

    fn fail(&mut self, cause: &Error) {
        if self.released_all {
            return;
        }
        warn!("Stream {:?} failed: {}", self.stream_id, cause);
        self.handler.failed(cause);
        self.channel.fail();
        self.release();
    }

    fn release(&mut self) {
        if self.released_all {
            return;
        }
        self.released_all = true;
        self.handler.release_resources();
        self.capacity.window.close();
        self.channel.close();
    }
}

/// Request body capacity of one stream.
struct H2Capacity {
    window: CapacityWindow,
    session: SessionHandle,
}

impl CapacityChannel for H2Capacity {
    fn update(&self, increment: usize) -> Result<(), Error> {
        self.window.update(increment)?;
        // window updates are sent from the session thread.
        self.session.wake();
        Ok(())
    }
}

/// Response side of one stream.
pub(crate) struct H2Channel {
    state: Mutex<H2ChannelState>,
    session: SessionHandle,
}

struct H2ChannelState {
    respond: Option<SendResponse<Bytes>>,
    send: Option<SendStream<Bytes>>,
    head_request: bool,
    max_buffer: usize,
    /// The handler sees no body, writes are swallowed.
    no_body: bool,
    committed: bool,
    /// END_STREAM went out.
    eos_sent: bool,
    /// The handler ended the stream.
    ended: bool,
    closed: bool,
    output_requested: bool,
    waiting_capacity: bool,
    progress: u64,
}

impl H2Channel {
    fn new(
        respond: SendResponse<Bytes>,
        head_request: bool,
        max_buffer: usize,
        session: SessionHandle,
    ) -> Self {
        H2Channel {
            state: Mutex::new(H2ChannelState {
                respond: Some(respond),
                send: None,
                head_request,
                max_buffer,
                no_body: false,
                committed: false,
                eos_sent: false,
                ended: false,
                closed: false,
                output_requested: false,
                waiting_capacity: false,
                progress: 0,
            }),
            session,
        }
    }

    fn poll_capacity(&self, cx: &mut Context<'_>) -> Result<(), Error> {
        let mut lock = self.state.lock().unwrap();
        let st = &mut *lock;

        if !st.waiting_capacity {
            return Ok(());
        }

        if let Some(send) = st.send.as_mut() {
            match send.poll_capacity(cx) {
                Poll::Ready(Some(Ok(n))) if n > 0 => {
                    st.waiting_capacity = false;
                    st.output_requested = true;
                    st.progress += 1;
                }
                Poll::Ready(Some(Err(e))) => return Err(e.into()),
                _ => {}
            }
        }

        Ok(())
    }

    fn is_committed(&self) -> bool {
        self.state.lock().unwrap().committed
    }

    fn is_ended(&self) -> bool {
        self.state.lock().unwrap().ended
    }

    fn has_room(&self) -> bool {
        let lock = self.state.lock().unwrap();
        !lock.waiting_capacity || lock.no_body
    }

    fn take_output_request(&self) -> bool {
        let mut lock = self.state.lock().unwrap();
        std::mem::replace(&mut lock.output_requested, false)
    }

    fn progress(&self) -> u64 {
        self.state.lock().unwrap().progress
    }

    /// Answer a failed exchange: a 500 if nothing is sent yet, else reset the stream.
    fn fail(&self) {
        let mut lock = self.state.lock().unwrap();
        let st = &mut *lock;

        if st.closed || st.eos_sent {
            return;
        }

        if let Some(mut respond) = st.respond.take() {
            let res = http::Response::builder()
                .status(http::StatusCode::INTERNAL_SERVER_ERROR)
                .body(());
            match res {
                Ok(res) => {
                    if respond.send_response(res, true).is_err() {
                        respond.send_reset(Reason::INTERNAL_ERROR);
                    }
                }
                Err(_) => respond.send_reset(Reason::INTERNAL_ERROR),
            }
        } else if let Some(send) = st.send.as_mut() {
            send.send_reset(Reason::INTERNAL_ERROR);
        }

        st.eos_sent = true;
    }

    fn close(&self) {
        let mut lock = self.state.lock().unwrap();
        lock.closed = true;
        lock.respond = None;
        lock.send = None;
    }
}

/// Headers that are specific to one HTTP/1.1 connection and illegal in HTTP/2.
const CONNECTION_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

impl ResponseChannel for H2Channel {
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

        *res.version_mut() = http::Version::HTTP_2;

        for name in CONNECTION_HEADERS {
            res.headers_mut().remove(*name);
        }

        let no_body = st.head_request
            || status == http::StatusCode::NO_CONTENT
            || status == http::StatusCode::NOT_MODIFIED;

        let eos = end_stream || no_body;

        let mut respond = st.respond.take().ok_or(Error::Closed)?;
        let send = respond.send_response(res, eos)?;

        st.send = Some(send);
        st.committed = true;
        st.no_body = no_body;
        st.eos_sent = eos;

        if end_stream {
            st.ended = true;
            st.progress += 1;
        }

        drop(lock);
        self.session.wake();

        Ok(())
    }
}

impl DataStreamChannel for H2Channel {
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
        if st.no_body {
            return Ok(src.len());
        }
        if src.is_empty() {
            return Ok(0);
        }

        let send = st.send.as_mut().ok_or(Error::Closed)?;

        if send.capacity() == 0 {
            send.reserve_capacity(src.len().min(st.max_buffer));
        }

        let amount = send.capacity().min(src.len());

        if amount == 0 {
            st.waiting_capacity = true;
            st.output_requested = true;
            drop(lock);
            // the connection polls for the window on the session thread.
            self.session.wake();
            return Ok(0);
        }

        send.send_data(Bytes::copy_from_slice(&src[..amount]), false)?;
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

        if !st.eos_sent {
            let send = st.send.as_mut().ok_or(Error::Closed)?;
            match trailers {
                Some(t) if !t.is_empty() => send.send_trailers(t)?,
                _ => send.send_data(Bytes::new(), true)?,
            }
            st.eos_sent = true;
        }

        st.ended = true;
        st.progress += 1;

        drop(lock);
        self.session.wake();

        Ok(())
    }
}

impl fmt::Debug for Http2Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Start => "Start",
            State::Handshaking(_) => "Handshaking",
            State::Serving(_) => "Serving",
            State::Closed => "Closed",
        };
        write!(f, "Http2Handler {} streams: {}", state, self.streams.len())
    }
}

impl fmt::Debug for H2Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "H2Channel")
    }
}
