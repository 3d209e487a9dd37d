//! Wire frames for the gateway WebSocket protocol.
//!
//! Every socket message is a single JSON object tagged by `type`:
//!
//! - `req`: client → server, answered by exactly one `res` with the same `id`
//! - `res`: server → client, carries either `payload` or `error`
//! - `event`: unsolicited server push, no `id`
//!
//! Objects with any other `type` fail to decode and are dropped by the
//! reader instead of being passed inward as untyped JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lowest protocol version this client speaks.
pub const MIN_PROTOCOL: u32 = 3;
/// Highest protocol version this client speaks.
pub const MAX_PROTOCOL: u32 = 3;

/// Handshake method sent immediately after the socket opens.
pub const CONNECT_METHOD: &str = "connect";

/// Handshake error codes meaning "socket accepted, device not approved yet".
const PAIRING_REQUIRED_CODES: &[&str] = &["NOT_PAIRED", "PAIRING_REQUIRED"];

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Request {
        id: String,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },

    #[serde(rename = "res")]
    Response {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorShape>,
    },

    #[serde(rename = "event")]
    Event {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
}

impl Frame {
    pub fn request(
        id: impl Into<String>,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Self {
        Self::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Correlation id for request and response frames.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => Some(id),
            Self::Event { .. } => None,
        }
    }
}

/// Structured error carried by an `ok: false` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: None,
            retry_after_ms: None,
        }
    }

    /// Stand-in for `ok: false` responses that omit the error object.
    pub fn unspecified() -> Self {
        Self::new("UNKNOWN", "gateway returned an error without details")
    }

    pub fn requires_pairing(&self) -> bool {
        PAIRING_REQUIRED_CODES.contains(&self.code.as_str())
    }
}

// ── Handshake ───────────────────────────────────────────────────────────────

/// Params of the `connect` handshake request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    pub device: DeviceInfo,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
}

/// Identity of the client application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

/// Identity of this physical device, stable across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Successful handshake payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloOk {
    pub protocol: u32,
    pub gateway: GatewayInfo,
    /// Initial state snapshot, shape defined by the gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayInfo {
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl HelloOk {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.gateway.capabilities.iter().any(|c| c == capability)
    }
}
