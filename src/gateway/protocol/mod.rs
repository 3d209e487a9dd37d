//! Gateway wire protocol.
//!
//! JSON text frames over a single WebSocket. See [`frames`] for the
//! envelope and handshake types and [`events`] for typed server pushes.

pub mod events;
pub mod frames;

pub use events::{
    AGENT_EVENT, AgentEvent, AgentStream, GatewayEvent, PAIR_APPROVED_EVENT, PAIR_REJECTED_EVENT,
    PairApproved, PairRejected,
};
pub use frames::{
    AuthParams, CONNECT_METHOD, ClientInfo, ConnectParams, DeviceInfo, ErrorShape, Frame,
    GatewayInfo, HelloOk, MAX_PROTOCOL, MIN_PROTOCOL,
};
