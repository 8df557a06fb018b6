#![warn(clippy::all)]

//! Non-blocking HTTP transport core.
//!
//! An I/O reactor multiplexes connections over a fixed number of threads, each
//! thread running its own event loop. Every connection gets a session event
//! handler, normally the [`ProtocolNegotiator`] which decides between HTTP/1.1
//! and HTTP/2 and then hands the connection to the matching protocol driver.
//!
//! The protocol drivers turn each request/response into an exchange, served by an
//! [`AsyncExchangeHandler`]. Exchange handlers never block. They receive request
//! body data only within the capacity they grant through a [`CapacityChannel`],
//! and write response data through a channel that accepts only what the
//! connection can currently take.
//!
//! Blocking application code plugs in via the [`bridge`] module, which runs a
//! [`ClassicHandler`] on the runtime's blocking pool.
//!
//! # Layout
//!
//! * [`reactor`] owns threads, sockets, sessions and listener endpoints.
//! * [`server`] and [`http2`] are the protocol drivers.
//! * [`negotiate`] picks the protocol per connection.
//! * Buffers, capacity and the exchange contract live in the crate root.
//!
//! [`ProtocolNegotiator`]: negotiate::ProtocolNegotiator
//! [`AsyncExchangeHandler`]: exchange::AsyncExchangeHandler
//! [`CapacityChannel`]: capacity::CapacityChannel
//! [`ClassicHandler`]: bridge::ClassicHandler

#[macro_use]
extern crate log;

mod error;
mod limit;
mod try_write;

#[doc(hidden)]
pub mod http11;

#[doc(hidden)]
pub mod chunked;

pub mod bridge;
pub mod buffer;
pub mod capacity;
pub mod echo;
pub mod exchange;
pub mod http2;
pub mod negotiate;
pub mod reactor;
pub mod server;
pub mod tls;

pub use error::Error;

pub use buffer::BufferWindow;
pub use capacity::{CapacityAccumulator, CapacityChannel, CapacityWindow};
pub use exchange::{AsyncExchangeHandler, DataStreamChannel, ExchangeState};
pub use exchange::{HandlerFactory, ResponseChannel};
pub use negotiate::{HttpProtocol, NegotiationConfig, ServerConfig, VersionPolicy};
pub use reactor::{IoReactor, IoReactorConfig, IoReactorStatus, ListenerEndpoint, Scheme};
pub use tls::TlsConfig;
