//! Error taxonomy for the gateway protocol client.
//!
//! Transport and protocol failures belong to the connection; `Remote`
//! errors belong to the single request whose response carried them.

use std::time::Duration;

use thiserror::Error;

use crate::gateway::protocol::ErrorShape;

/// Result alias used throughout the gateway client.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// `request()` was called while the link was not in the connected state.
    #[error("not connected to gateway")]
    NotConnected,

    /// The socket closed before a response arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// Socket open or send failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The gateway accepted the socket but has not approved this device yet.
    #[error("device is awaiting pairing approval")]
    PairingRequired,

    /// Response frame with `ok: false`.
    #[error("gateway error {}: {}", .0.code, .0.message)]
    Remote(ErrorShape),

    #[error("request timed out")]
    Timeout,

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Frame or payload that does not match the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl GatewayError {
    /// Error code reported by the gateway, if this is an application error.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Remote(shape) => Some(shape.code.as_str()),
            _ => None,
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote(shape) => shape.retryable.unwrap_or(false),
            Self::NotConnected
            | Self::ConnectionClosed
            | Self::Transport(_)
            | Self::Timeout => true,
            _ => false,
        }
    }

    /// Server-suggested delay before retrying.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Remote(shape) => shape.retry_after_ms.map(Duration::from_millis),
            _ => None,
        }
    }
}
