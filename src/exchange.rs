//! Per request/response exchange contract between the protocol layer and application code.
//!
//! All [`AsyncExchangeHandler`] callbacks are invoked on the reactor thread owning the
//! connection, strictly ordered for a single exchange, and must never block. The
//! channels handed to a handler are thread-safe and can be signalled from anywhere.

use crate::capacity::CapacityChannel;
use crate::Error;
use std::sync::Arc;

/// State of a single exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Nothing received yet.
    AwaitingRequest,
    /// Request head received, request body flowing.
    Processing,
    /// Request body ended, response still being sent.
    SendingResponse,
    /// Both directions ended.
    Complete,
    /// Failed. Resources are released.
    Failed,
}

impl ExchangeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExchangeState::Complete | ExchangeState::Failed)
    }
}

/// Channel used to send the response head.
pub trait ResponseChannel: Send + Sync {
    /// Send the response head. With `end_stream` there will be no body.
    fn send_response(&self, response: http::Response<()>, end_stream: bool) -> Result<(), Error>;
}

/// Channel the response body is written into.
pub trait DataStreamChannel: Send + Sync {
    /// Ask the protocol layer to invoke `produce` again.
    fn request_output(&self);

    /// Write as much of `src` as currently possible. Returns the amount taken,
    /// which may be `0` when the downstream has no room.
    fn write(&self, src: &[u8]) -> Result<usize, Error>;

    /// End the response body, optionally with trailers.
    fn end_stream(&self, trailers: Option<http::HeaderMap>) -> Result<(), Error>;
}

/// Handler of one logical request/response exchange.
pub trait AsyncExchangeHandler: Send {
    /// Request head arrived. `has_body` tells whether request body data follows.
    fn handle_request(
        &mut self,
        request: http::Request<()>,
        has_body: bool,
        responder: Arc<dyn ResponseChannel>,
    ) -> Result<(), Error>;

    /// The protocol layer can accept input. The handler announces its initial window
    /// through the channel and keeps it for later increments.
    fn update_capacity(&mut self, channel: Arc<dyn CapacityChannel>) -> Result<(), Error>;

    /// Request body data, never more than the capacity granted.
    fn consume(&mut self, src: &[u8]) -> Result<(), Error>;

    /// End of request body.
    fn stream_end(&mut self, trailers: Option<http::HeaderMap>) -> Result<(), Error>;

    /// Bytes of response body ready to be produced.
    fn available(&self) -> usize;

    /// The output channel can accept data.
    fn produce(&mut self, channel: Arc<dyn DataStreamChannel>) -> Result<(), Error>;

    /// Transport or protocol failure. Must release resources.
    fn failed(&mut self, cause: &Error);

    /// Release all held resources. Idempotent, valid in any state.
    fn release_resources(&mut self);
}

/// Creates a handler per exchange.
pub trait HandlerFactory: Send + Sync {
    fn create(&self) -> Box<dyn AsyncExchangeHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn() -> Box<dyn AsyncExchangeHandler> + Send + Sync,
{
    fn create(&self) -> Box<dyn AsyncExchangeHandler> {
        (self)()
    }
}
