//! Blocking request handlers on top of the non-blocking exchange contract.
//!
//! A [`ClassicHandler`] runs on the runtime's blocking pool and sees plain
//! `std::io::Read`/`Write` streams. The reactor side is a
//! [`ClassicToAsyncAdapter`], moving bytes through two bounded buffers. The
//! blocking side waits on those buffers with a timeout, and any release or
//! failure wakes it with an error.

use crate::buffer::BufferWindow;
use crate::capacity::{CapacityAccumulator, CapacityChannel};
use crate::exchange::{AsyncExchangeHandler, DataStreamChannel, HandlerFactory, ResponseChannel};
use crate::Error;
use std::fmt;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default size of the handoff buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 16_384;

/// Default time the blocking side waits for the reactor.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Blocking request handler.
pub trait ClassicHandler: Send + Sync + 'static {
    /// Handle a request. The response head is sent on the first body write, or
    /// when this returns.
    fn handle(
        &self,
        request: http::Request<InputStream>,
        response: &mut ClassicResponse,
    ) -> Result<(), Error>;
}

impl<F> ClassicHandler for F
where
    F: Fn(http::Request<InputStream>, &mut ClassicResponse) -> Result<(), Error> + Send + Sync + 'static,
{
    fn handle(
        &self,
        request: http::Request<InputStream>,
        response: &mut ClassicResponse,
    ) -> Result<(), Error> {
        (self)(request, response)
    }
}

/// Wait on `cond` until `done` gives a value, or the deadline passes.
fn block_waiting<'a, T, R>(
    cond: &Condvar,
    mut lock: MutexGuard<'a, T>,
    timeout: Duration,
    mut done: impl FnMut(&mut T) -> Option<R>,
) -> Result<(MutexGuard<'a, T>, R), Error> {
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(r) = done(&mut *lock) {
            return Ok((lock, r));
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout(timeout));
        }

        let (l, _) = cond.wait_timeout(lock, deadline - now).unwrap();
        lock = l;
    }
}

/// Request body handoff. Filled by the reactor, read by the blocking handler.
pub struct SharedInputBuffer {
    state: Mutex<InputState>,
    cond: Condvar,
    size: usize,
    timeout: Duration,
}

struct InputState {
    buf: BufferWindow,
    end: bool,
    trailers: Option<http::HeaderMap>,
    aborted: bool,
    capacity: Option<Arc<dyn CapacityChannel>>,
    increment: CapacityAccumulator,
}

impl SharedInputBuffer {
    pub fn new(size: usize, timeout: Duration) -> Self {
        SharedInputBuffer {
            state: Mutex::new(InputState {
                buf: BufferWindow::with_capacity(size),
                end: false,
                trailers: None,
                aborted: false,
                capacity: None,
                // coalesce in quarters of the buffer.
                increment: CapacityAccumulator::new((size / 4).max(1)),
            }),
            cond: Condvar::new(),
            size,
            timeout,
        }
    }

    /// Reactor side: take the capacity channel and announce the free space.
    pub fn update_capacity(&self, channel: Arc<dyn CapacityChannel>) -> Result<(), Error> {
        let mut lock = self.state.lock().unwrap();
        if lock.aborted {
            return Ok(());
        }
        let window = self.size.saturating_sub(lock.buf.len()) + lock.increment.take();
        lock.capacity = Some(channel.clone());
        drop(lock);

        channel.update(window)
    }

    /// Reactor side: add received bytes. Never blocks; more than the granted
    /// capacity is refused.
    pub fn fill(&self, src: &[u8]) -> Result<usize, Error> {
        let mut lock = self.state.lock().unwrap();

        if lock.aborted {
            return Err(Error::Closed);
        }
        if lock.buf.len() + src.len() > self.size {
            return Err(Error::Protocol("Request body beyond granted capacity".into()));
        }

        lock.buf.append(src);
        let len = lock.buf.len();

        self.cond.notify_all();

        Ok(len)
    }

    /// Reactor side: no more data.
    pub fn mark_end(&self, trailers: Option<http::HeaderMap>) {
        let mut lock = self.state.lock().unwrap();
        lock.end = true;
        lock.trailers = trailers;
        self.cond.notify_all();
    }

    /// Blocking side: read, waiting for data up to the timeout.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize, Error> {
        if dst.is_empty() {
            return Ok(0);
        }

        let lock = self.state.lock().unwrap();

        let (mut lock, ready) = block_waiting(&self.cond, lock, self.timeout, |st| {
            if st.aborted {
                Some(Err(Error::Closed))
            } else if !st.buf.is_empty() {
                Some(Ok(true))
            } else if st.end {
                Some(Ok(false))
            } else {
                None
            }
        })?;

        if !ready? {
            return Ok(0);
        }

        let amount = lock.buf.read(dst);

        let flush = match lock.increment.add(amount) {
            Some(n) => Some(n),
            // an empty buffer gives back everything held back.
            None if lock.buf.is_empty() => Some(lock.increment.take()).filter(|n| *n > 0),
            None => None,
        };

        let channel = lock.capacity.clone();
        drop(lock);

        if let (Some(n), Some(channel)) = (flush, channel) {
            trace!("Input capacity update: {}", n);
            channel.update(n)?;
        }

        Ok(amount)
    }

    /// Trailers of the request, available once the body is read to the end.
    pub fn trailers(&self) -> Option<http::HeaderMap> {
        self.state.lock().unwrap().trailers.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Either side: give up. Waiting readers get an error.
    pub fn abort(&self) {
        let mut lock = self.state.lock().unwrap();
        lock.aborted = true;
        lock.buf.clear();
        lock.capacity = None;
        self.cond.notify_all();
    }
}

/// Response body handoff. Written by the blocking handler, drained by the reactor.
pub struct SharedOutputBuffer {
    state: Mutex<OutputState>,
    cond: Condvar,
    size: usize,
    timeout: Duration,
}

struct OutputState {
    buf: BufferWindow,
    end: bool,
    trailers: Option<http::HeaderMap>,
    ended: bool,
    aborted: bool,
    failure: Option<String>,
    channel: Option<Arc<dyn DataStreamChannel>>,
}

impl SharedOutputBuffer {
    pub fn new(size: usize, timeout: Duration) -> Self {
        SharedOutputBuffer {
            state: Mutex::new(OutputState {
                buf: BufferWindow::with_capacity(size),
                end: false,
                trailers: None,
                ended: false,
                aborted: false,
                failure: None,
                channel: None,
            }),
            cond: Condvar::new(),
            size,
            timeout,
        }
    }

    /// Blocking side: write, waiting for room up to the timeout.
    pub fn write(&self, src: &[u8]) -> Result<usize, Error> {
        if src.is_empty() {
            return Ok(0);
        }

        let lock = self.state.lock().unwrap();
        let size = self.size;

        let (mut lock, room) = block_waiting(&self.cond, lock, self.timeout, |st| {
            if st.aborted {
                Some(Err(Error::Closed))
            } else if st.end {
                Some(Err(Error::User("Write after end of response body".into())))
            } else if st.buf.len() < size {
                Some(Ok(size - st.buf.len()))
            } else {
                None
            }
        })?;

        let amount = src.len().min(room?);
        lock.buf.append(&src[..amount]);

        let channel = lock.channel.clone();
        drop(lock);

        if let Some(channel) = channel {
            channel.request_output();
        }

        Ok(amount)
    }

    /// Blocking side: wait until everything written is handed to the reactor.
    pub fn flush(&self) -> Result<(), Error> {
        let lock = self.state.lock().unwrap();
        block_waiting(&self.cond, lock, self.timeout, |st| {
            if st.aborted {
                Some(Err(Error::Closed))
            } else if st.buf.is_empty() {
                Some(Ok(()))
            } else {
                None
            }
        })?
        .1
    }

    /// Blocking side: no more data.
    pub fn write_completed(&self, trailers: Option<http::HeaderMap>) -> Result<(), Error> {
        let mut lock = self.state.lock().unwrap();
        if lock.aborted {
            return Err(Error::Closed);
        }
        lock.end = true;
        lock.trailers = trailers;
        let channel = lock.channel.clone();
        drop(lock);

        if let Some(channel) = channel {
            channel.request_output();
        }

        Ok(())
    }

    /// Blocking side: the body can't be completed. The reactor fails the exchange.
    pub fn fail(&self, reason: String) {
        let mut lock = self.state.lock().unwrap();
        lock.failure = Some(reason);
        let channel = lock.channel.clone();
        drop(lock);

        if let Some(channel) = channel {
            channel.request_output();
        }
    }

    /// Reactor side: bytes waiting to be produced.
    pub fn len(&self) -> usize {
        let lock = self.state.lock().unwrap();
        if lock.failure.is_some() || (lock.end && !lock.ended) {
            // something to tell the reactor even without data.
            return lock.buf.len().max(1);
        }
        lock.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reactor side: move buffered bytes into the channel. Never blocks.
    pub fn produce(&self, channel: Arc<dyn DataStreamChannel>) -> Result<(), Error> {
        let mut lock = self.state.lock().unwrap();
        let st = &mut *lock;

        if let Some(reason) = st.failure.take() {
            st.aborted = true;
            self.cond.notify_all();
            return Err(Error::User(reason));
        }
        if st.aborted || st.ended {
            return Ok(());
        }

        st.channel = Some(channel.clone());

        let written = st.buf.drain(|b| channel.write(b))?;

        if written > 0 {
            trace!("Output produced: {}", written);
            self.cond.notify_all();
        }

        if st.end && st.buf.is_empty() {
            st.ended = true;
            channel.end_stream(st.trailers.take())?;
            st.channel = None;
        }

        Ok(())
    }

    /// Either side: give up. Waiting writers get an error.
    pub fn abort(&self) {
        let mut lock = self.state.lock().unwrap();
        lock.aborted = true;
        lock.buf.clear();
        lock.channel = None;
        self.cond.notify_all();
    }
}

/// Request body as a blocking reader.
pub struct InputStream {
    shared: Arc<SharedInputBuffer>,
}

impl InputStream {
    /// Trailers, once the body is read to the end.
    pub fn trailers(&self) -> Option<http::HeaderMap> {
        self.shared.trailers()
    }
}

impl io::Read for InputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.shared.read(buf).map_err(|e| e.into_io())
    }
}

impl Drop for InputStream {
    fn drop(&mut self) {
        // nobody reads anymore, let the peer's data go to waste instead of stalling.
        self.shared.abort();
    }
}

/// Response body as a blocking writer. The first write sends the response head.
pub struct OutputStream {
    shared: Arc<SharedOutputBuffer>,
    head: Option<http::Response<()>>,
    responder: Arc<dyn ResponseChannel>,
}

impl OutputStream {
    fn commit(&mut self, end_stream: bool) -> Result<(), Error> {
        if let Some(head) = self.head.take() {
            debug!("Classic response: {}", head.status());
            self.responder.send_response(head, end_stream)?;
        }
        Ok(())
    }

    pub fn is_committed(&self) -> bool {
        self.head.is_none()
    }
}

impl io::Write for OutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.commit(false).map_err(|e| e.into_io())?;
        self.shared.write(buf).map_err(|e| e.into_io())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.commit(false).map_err(|e| e.into_io())?;
        self.shared.flush().map_err(|e| e.into_io())
    }
}

/// Response handed to a [`ClassicHandler`].
pub struct ClassicResponse {
    body: OutputStream,
    trailers: Option<http::HeaderMap>,
}

impl ClassicResponse {
    fn new(shared: Arc<SharedOutputBuffer>, responder: Arc<dyn ResponseChannel>) -> Self {
        let mut head = http::Response::new(());
        *head.status_mut() = http::StatusCode::OK;
        ClassicResponse {
            body: OutputStream {
                shared,
                head: Some(head),
                responder,
            },
            trailers: None,
        }
    }

    pub fn status(&self) -> Option<http::StatusCode> {
        self.body.head.as_ref().map(|h| h.status())
    }

    /// Set the status. Fails once the head is sent.
    pub fn set_status(&mut self, status: http::StatusCode) -> Result<(), Error> {
        match self.body.head.as_mut() {
            Some(h) => {
                *h.status_mut() = status;
                Ok(())
            }
            None => Err(Error::User("Response already committed".into())),
        }
    }

    /// Headers to send, `None` once the head is sent.
    pub fn headers_mut(&mut self) -> Option<&mut http::HeaderMap> {
        self.body.head.as_mut().map(|h| h.headers_mut())
    }

    pub fn set_trailers(&mut self, trailers: http::HeaderMap) {
        self.trailers = Some(trailers);
    }

    pub fn is_committed(&self) -> bool {
        self.body.is_committed()
    }

    /// The body writer.
    pub fn body(&mut self) -> &mut OutputStream {
        &mut self.body
    }

    /// The handler returned normally.
    fn finish(mut self) -> Result<(), Error> {
        if !self.body.is_committed() {
            self.body.commit(true)?;
            return Ok(());
        }
        self.body.shared.write_completed(self.trailers.take())
    }

    /// The handler failed. Before commit a 500 goes out instead.
    fn abort(mut self, cause: &Error) {
        if !self.body.is_committed() {
            let mut res = http::Response::new(());
            *res.status_mut() = http::StatusCode::INTERNAL_SERVER_ERROR;
            self.body.head = Some(res);
            if let Err(e) = self.body.commit(true) {
                warn!("Failed to send 500: {}", e);
            }
            return;
        }
        self.body.shared.fail(format!("Handler failed after commit: {}", cause));
    }
}

/// Exchange handler running a [`ClassicHandler`] on the blocking pool.
pub struct ClassicToAsyncAdapter {
    handler: Arc<dyn ClassicHandler>,
    input: Arc<SharedInputBuffer>,
    output: Arc<SharedOutputBuffer>,
    started: bool,
}

impl ClassicToAsyncAdapter {
    pub fn new(handler: Arc<dyn ClassicHandler>, buffer_size: usize, timeout: Duration) -> Self {
        ClassicToAsyncAdapter {
            handler,
            input: Arc::new(SharedInputBuffer::new(buffer_size, timeout)),
            output: Arc::new(SharedOutputBuffer::new(buffer_size, timeout)),
            started: false,
        }
    }
}

impl AsyncExchangeHandler for ClassicToAsyncAdapter {
    fn handle_request(
        &mut self,
        request: http::Request<()>,
        has_body: bool,
        responder: Arc<dyn ResponseChannel>,
    ) -> Result<(), Error> {
        if self.started {
            return Err(Error::User("Classic adapter reused for another request".into()));
        }
        self.started = true;

        if !has_body {
            self.input.mark_end(None);
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::User("Classic handler needs a tokio runtime".into()))?;

        let (parts, _) = request.into_parts();
        let request = http::Request::from_parts(
            parts,
            InputStream {
                shared: self.input.clone(),
            },
        );

        let handler = self.handler.clone();
        let response = ClassicResponse::new(self.output.clone(), responder);

        runtime.spawn_blocking(move || {
            let mut response = response;
            match handler.handle(request, &mut response) {
                Ok(()) => {
                    if let Err(e) = response.finish() {
                        warn!("Classic response not completed: {}", e);
                    }
                }
                Err(e) => {
                    warn!("Classic handler failed: {}", e);
                    response.abort(&e);
                }
            }
        });

        Ok(())
    }

    fn update_capacity(&mut self, channel: Arc<dyn CapacityChannel>) -> Result<(), Error> {
        self.input.update_capacity(channel)
    }

    fn consume(&mut self, src: &[u8]) -> Result<(), Error> {
        match self.input.fill(src) {
            // the handler stopped reading, drop what arrives.
            Err(Error::Closed) => Ok(()),
            r => r.map(|_| ()),
        }
    }

    fn stream_end(&mut self, trailers: Option<http::HeaderMap>) -> Result<(), Error> {
        self.input.mark_end(trailers);
        Ok(())
    }

    fn available(&self) -> usize {
        self.output.len()
    }

    fn produce(&mut self, channel: Arc<dyn DataStreamChannel>) -> Result<(), Error> {
        self.output.produce(channel)
    }

    fn failed(&mut self, cause: &Error) {
        warn!("Classic exchange failed: {}", cause);
        self.release_resources();
    }

    fn release_resources(&mut self) {
        self.input.abort();
        self.output.abort();
    }
}

/// [`HandlerFactory`] wrapping a [`ClassicHandler`].
#[derive(Clone)]
pub struct ClassicFactory {
    handler: Arc<dyn ClassicHandler>,
    buffer_size: usize,
    timeout: Duration,
}

impl ClassicFactory {
    pub fn new<H: ClassicHandler>(handler: H) -> Self {
        ClassicFactory {
            handler: Arc::new(handler),
            buffer_size: DEFAULT_BUFFER_SIZE,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// How long the blocking handler waits for the reactor.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl HandlerFactory for ClassicFactory {
    fn create(&self) -> Box<dyn AsyncExchangeHandler> {
        Box::new(ClassicToAsyncAdapter::new(
            self.handler.clone(),
            self.buffer_size,
            self.timeout,
        ))
    }
}

impl fmt::Debug for ClassicToAsyncAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClassicToAsyncAdapter input: {}, output: {}",
            self.input.len(),
            self.output.len()
        )
    }
}

impl fmt::Debug for ClassicFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassicFactory buffer_size: {}", self.buffer_size)
    }
}

impl fmt::Debug for ClassicResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassicResponse committed: {}", self.is_committed())
    }
}
