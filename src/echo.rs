//! Exchange handler that echoes the request body back as response body.

use crate::buffer::BufferWindow;
use crate::capacity::{CapacityAccumulator, CapacityChannel, DEFAULT_CAPACITY_THRESHOLD};
use crate::exchange::{AsyncExchangeHandler, DataStreamChannel, ExchangeState};
use crate::exchange::{HandlerFactory, ResponseChannel};
use crate::Error;
use std::fmt;
use std::sync::Arc;

/// Default initial window for a new echo exchange.
pub const DEFAULT_INITIAL_WINDOW: usize = 65_535;

/// Echoes request bodies.
///
/// Received data is passed straight through to the output channel when possible
/// and buffered otherwise. Bytes leaving the buffer are given back to the peer as
/// capacity, coalesced via a [`CapacityAccumulator`].
pub struct EchoHandler {
    state: ExchangeState,
    buffer: BufferWindow,
    initial_window: usize,
    increment: CapacityAccumulator,
    capacity: Option<Arc<dyn CapacityChannel>>,
    output: Option<Arc<dyn DataStreamChannel>>,
    input_end: bool,
    trailers: Option<http::HeaderMap>,
}

impl EchoHandler {
    pub fn new(initial_window: usize) -> Self {
        EchoHandler {
            state: ExchangeState::AwaitingRequest,
            buffer: BufferWindow::with_capacity(initial_window),
            initial_window,
            // held back increments must never eat up more than half the window.
            increment: CapacityAccumulator::new(
                DEFAULT_CAPACITY_THRESHOLD.min(initial_window / 2).max(1),
            ),
            capacity: None,
            output: None,
            input_end: false,
            trailers: None,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    fn signal_capacity(&mut self, freed: usize) -> Result<(), Error> {
        if let Some(flush) = self.increment.add(freed) {
            if let Some(channel) = &self.capacity {
                trace!("Echo capacity update: {}", flush);
                channel.update(flush)?;
            }
        }
        Ok(())
    }

    fn end_output(&mut self, channel: &Arc<dyn DataStreamChannel>) -> Result<(), Error> {
        channel.end_stream(self.trailers.take())?;
        self.state = ExchangeState::Complete;
        trace!("Echo exchange complete");
        Ok(())
    }
}

impl Default for EchoHandler {
    fn default() -> Self {
        EchoHandler::new(DEFAULT_INITIAL_WINDOW)
    }
}

impl AsyncExchangeHandler for EchoHandler {
    fn handle_request(
        &mut self,
        request: http::Request<()>,
        has_body: bool,
        responder: Arc<dyn ResponseChannel>,
    ) -> Result<(), Error> {
        if self.state != ExchangeState::AwaitingRequest {
            return Err(Error::User("Echo handler reused for another request".into()));
        }

        let mut res = http::Response::builder().status(http::StatusCode::OK);

        for name in &[http::header::CONTENT_TYPE, http::header::CONTENT_LENGTH] {
            if let Some(v) = request.headers().get(name) {
                res = res.header(name, v);
            }
        }

        let res = res.body(())?;

        if has_body {
            responder.send_response(res, false)?;
            self.state = ExchangeState::Processing;
        } else {
            // empty body goes straight to the end of output.
            responder.send_response(res, true)?;
            self.input_end = true;
            self.state = ExchangeState::Complete;
        }

        Ok(())
    }

    fn update_capacity(&mut self, channel: Arc<dyn CapacityChannel>) -> Result<(), Error> {
        let window = self.initial_window.min(self.buffer.free()) + self.increment.take();

        trace!("Echo initial window: {}", window);

        channel.update(window)?;
        self.capacity = Some(channel);

        Ok(())
    }

    fn consume(&mut self, mut src: &[u8]) -> Result<(), Error> {
        let mut freed = 0;

        if let Some(output) = &self.output {
            if self.buffer.is_empty() {
                // nothing queued before us, try a direct write.
                let n = output.write(src)?;
                src = &src[n..];
                freed += n;
            }
        }

        if !src.is_empty() {
            self.buffer.append(src);
            if let Some(output) = &self.output {
                output.request_output();
            }
        }

        self.signal_capacity(freed)
    }

    fn stream_end(&mut self, trailers: Option<http::HeaderMap>) -> Result<(), Error> {
        self.input_end = true;
        self.trailers = trailers;

        if self.state.is_terminal() {
            return Ok(());
        }

        match self.output.clone() {
            Some(output) if self.buffer.is_empty() => self.end_output(&output),
            Some(output) => {
                self.state = ExchangeState::SendingResponse;
                output.request_output();
                Ok(())
            }
            None => {
                // produce() ends the stream once the channel is known.
                self.state = ExchangeState::SendingResponse;
                Ok(())
            }
        }
    }

    fn available(&self) -> usize {
        self.buffer.len()
    }

    fn produce(&mut self, channel: Arc<dyn DataStreamChannel>) -> Result<(), Error> {
        self.output = Some(channel.clone());

        if self.state.is_terminal() {
            return Ok(());
        }

        let written = self.buffer.drain(|b| channel.write(b))?;

        if written > 0 {
            self.signal_capacity(written)?;
        }

        if self.buffer.is_empty() && self.input_end {
            self.end_output(&channel)?;
        }

        Ok(())
    }

    fn failed(&mut self, cause: &Error) {
        warn!("Echo exchange failed: {}", cause);
        self.state = ExchangeState::Failed;
        self.release_resources();
    }

    fn release_resources(&mut self) {
        if let Some(channel) = self.capacity.take() {
            let rest = self.increment.take();
            if rest > 0 {
                channel.update(rest).ok();
            }
        }
        self.output = None;
        self.buffer.clear();
    }
}

/// [`HandlerFactory`] of [`EchoHandler`].
#[derive(Debug, Clone)]
pub struct EchoFactory {
    initial_window: usize,
}

impl EchoFactory {
    pub fn new(initial_window: usize) -> Self {
        EchoFactory { initial_window }
    }
}

impl Default for EchoFactory {
    fn default() -> Self {
        EchoFactory::new(DEFAULT_INITIAL_WINDOW)
    }
}

impl HandlerFactory for EchoFactory {
    fn create(&self) -> Box<dyn AsyncExchangeHandler> {
        Box::new(EchoHandler::new(self.initial_window))
    }
}

impl fmt::Debug for EchoHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EchoHandler {:?} buffered: {}, input_end: {}",
            self.state,
            self.buffer.len(),
            self.input_end
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::capacity::CapacityWindow;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Sink {
        room: Mutex<usize>,
        data: Mutex<Vec<u8>>,
        response: Mutex<Option<(http::StatusCode, bool)>>,
        ended: Mutex<bool>,
        requested: Mutex<usize>,
    }

    impl ResponseChannel for Sink {
        fn send_response(&self, res: http::Response<()>, end: bool) -> Result<(), Error> {
            *self.response.lock().unwrap() = Some((res.status(), end));
            Ok(())
        }
    }

    impl DataStreamChannel for Sink {
        fn request_output(&self) {
            *self.requested.lock().unwrap() += 1;
        }
        fn write(&self, src: &[u8]) -> Result<usize, Error> {
            let mut room = self.room.lock().unwrap();
            let n = src.len().min(*room);
            *room -= n;
            self.data.lock().unwrap().extend_from_slice(&src[..n]);
            Ok(n)
        }
        fn end_stream(&self, _: Option<http::HeaderMap>) -> Result<(), Error> {
            *self.ended.lock().unwrap() = true;
            Ok(())
        }
    }

    fn request() -> http::Request<()> {
        http::Request::post("/echo").body(()).unwrap()
    }

    #[test]
    fn empty_body_ends_without_buffering() {
        let sink = Arc::new(Sink::default());
        let mut h = EchoHandler::new(1024);

        h.handle_request(request(), false, sink.clone()).unwrap();

        assert_eq!(*sink.response.lock().unwrap(), Some((http::StatusCode::OK, true)));
        assert_eq!(h.state(), ExchangeState::Complete);
        assert_eq!(h.available(), 0);
    }

    #[test]
    fn initial_window_is_bounded_by_buffer() {
        let sink = Arc::new(Sink::default());
        let win = Arc::new(CapacityWindow::new());
        let mut h = EchoHandler::new(512);

        h.handle_request(request(), true, sink).unwrap();
        h.update_capacity(win.clone()).unwrap();

        assert_eq!(win.available(), 512);
    }

    #[test]
    fn buffers_then_produces_and_ends() {
        let sink = Arc::new(Sink::default());
        let win = Arc::new(CapacityWindow::new());
        let mut h = EchoHandler::new(16);

        h.handle_request(request(), true, sink.clone()).unwrap();
        h.update_capacity(win.clone()).unwrap();

        // no output channel yet, everything is buffered (and the buffer grows).
        h.consume(b"hello ").unwrap();
        h.consume(b"big wide world").unwrap();
        assert_eq!(h.available(), 20);

        h.stream_end(None).unwrap();
        assert_eq!(h.state(), ExchangeState::SendingResponse);

        *sink.room.lock().unwrap() = 8;
        h.produce(sink.clone()).unwrap();
        assert_eq!(h.available(), 12);
        assert!(!*sink.ended.lock().unwrap());

        *sink.room.lock().unwrap() = 100;
        h.produce(sink.clone()).unwrap();
        assert_eq!(h.available(), 0);
        assert!(*sink.ended.lock().unwrap());
        assert_eq!(&sink.data.lock().unwrap()[..], b"hello big wide world");
        assert_eq!(h.state(), ExchangeState::Complete);
    }

    #[test]
    fn passthrough_when_buffer_empty() {
        let sink = Arc::new(Sink::default());
        let win = Arc::new(CapacityWindow::new());
        let mut h = EchoHandler::new(16);

        h.handle_request(request(), true, sink.clone()).unwrap();
        h.update_capacity(win.clone()).unwrap();
        h.produce(sink.clone()).unwrap();

        *sink.room.lock().unwrap() = 3;
        h.consume(b"abcdef").unwrap();

        assert_eq!(&sink.data.lock().unwrap()[..], b"abc");
        assert_eq!(h.available(), 3);
        assert_eq!(*sink.requested.lock().unwrap(), 1);

        h.stream_end(None).unwrap();
        *sink.room.lock().unwrap() = 3;
        h.produce(sink.clone()).unwrap();
        assert!(*sink.ended.lock().unwrap());
    }

    #[test]
    fn release_flushes_pending_capacity() {
        let sink = Arc::new(Sink::default());
        let win = Arc::new(CapacityWindow::new());
        let mut h = EchoHandler::new(16);

        h.handle_request(request(), true, sink.clone()).unwrap();
        h.update_capacity(win.clone()).unwrap();
        let initial = win.available();

        *sink.room.lock().unwrap() = 100;
        h.produce(sink.clone()).unwrap();
        h.consume(b"tiny").unwrap();

        // below threshold, nothing signalled yet.
        assert_eq!(win.available(), initial);

        h.release_resources();
        assert_eq!(win.available(), initial + 4);

        // idempotent
        h.release_resources();
        h.failed(&Error::Closed);
        assert_eq!(h.state(), ExchangeState::Failed);
    }
}
