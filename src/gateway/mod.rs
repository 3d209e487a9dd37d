//! Client side of the gateway WebSocket protocol.
//!
//! [`GatewayClient`] manages one connection: handshake, request/response
//! correlation, event fan-out and reconnect with backoff. The wire types
//! live in [`protocol`]; the socket itself sits behind [`transport`] so
//! tests can drive the client without a network.

mod client;
mod correlator;
pub mod listeners;
pub mod protocol;
pub mod transport;

pub use client::{ClientOptions, ConnectionState, DEFAULT_ROLE, GatewayClient, StateChange};
pub use listeners::{Listeners, Subscription};
pub use transport::{Connector, TransportEvent, TransportHandle, WebSocketConnector};
