//! Typed server-pushed events.
//!
//! Event frames are parsed into [`GatewayEvent`] before they reach any
//! subscriber. Known event names must carry the expected payload shape;
//! names this client does not model are passed through as `Other`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PAIR_APPROVED_EVENT: &str = "node.pair.approved";
pub const PAIR_REJECTED_EVENT: &str = "node.pair.rejected";
pub const AGENT_EVENT: &str = "agent";

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    PairApproved(PairApproved),
    PairRejected(PairRejected),
    Agent(AgentEvent),
    Other { event: String, payload: Option<Value> },
}

impl GatewayEvent {
    /// Validate an event frame's payload against its name.
    pub fn parse(event: &str, payload: Option<Value>) -> Result<Self, serde_json::Error> {
        Ok(match event {
            PAIR_APPROVED_EVENT => Self::PairApproved(from_payload(payload)?),
            PAIR_REJECTED_EVENT => Self::PairRejected(from_payload(payload)?),
            AGENT_EVENT => Self::Agent(from_payload(payload)?),
            _ => Self::Other {
                event: event.to_string(),
                payload,
            },
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::PairApproved(_) => PAIR_APPROVED_EVENT,
            Self::PairRejected(_) => PAIR_REJECTED_EVENT,
            Self::Agent(_) => AGENT_EVENT,
            Self::Other { event, .. } => event,
        }
    }
}

fn from_payload<T: serde::de::DeserializeOwned>(
    payload: Option<Value>,
) -> Result<T, serde_json::Error> {
    serde_json::from_value(payload.unwrap_or(Value::Null))
}

/// `node.pair.approved`: the gateway issued this node an auth token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairApproved {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    pub token: String,
}

/// `node.pair.rejected`: an operator declined the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRejected {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStream {
    Lifecycle,
    Tool,
    Assistant,
}

/// One step of a streaming agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub run_id: String,
    pub stream: AgentStream,
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(default)]
    pub ts: Option<i64>,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl AgentEvent {
    fn data_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }

    /// `start`, `end` or `error` for lifecycle events.
    pub fn lifecycle_phase(&self) -> Option<&str> {
        match self.stream {
            AgentStream::Lifecycle => self.data_str("phase"),
            _ => None,
        }
    }

    /// True once the run has ended, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(self.lifecycle_phase(), Some("end") | Some("error"))
    }

    /// Cumulative assistant text so far.
    pub fn assistant_text(&self) -> Option<&str> {
        match self.stream {
            AgentStream::Assistant => self.data_str("text"),
            _ => None,
        }
    }

    /// Incremental assistant text, when the gateway sends deltas.
    pub fn assistant_delta(&self) -> Option<&str> {
        match self.stream {
            AgentStream::Assistant => self.data_str("delta"),
            _ => None,
        }
    }

    pub fn tool_name(&self) -> Option<&str> {
        match self.stream {
            AgentStream::Tool => self.data_str("name"),
            _ => None,
        }
    }

    pub fn tool_phase(&self) -> Option<&str> {
        match self.stream {
            AgentStream::Tool => self.data_str("phase"),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.data_str("error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_pair_approved() {
        let event = GatewayEvent::parse(
            PAIR_APPROVED_EVENT,
            Some(json!({"requestId": "r1", "nodeId": "n1", "token": "tok"})),
        )
        .unwrap();
        match event {
            GatewayEvent::PairApproved(approved) => {
                assert_eq!(approved.token, "tok");
                assert_eq!(approved.node_id.as_deref(), Some("n1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn approval_without_token_is_rejected() {
        assert!(GatewayEvent::parse(PAIR_APPROVED_EVENT, None).is_err());
        assert!(GatewayEvent::parse(PAIR_APPROVED_EVENT, Some(json!({"nodeId": "n1"}))).is_err());
    }

    #[test]
    fn unknown_agent_stream_is_rejected() {
        let payload = json!({"runId": "run-1", "stream": "telemetry", "data": {}});
        assert!(GatewayEvent::parse(AGENT_EVENT, Some(payload)).is_err());
    }

    #[test]
    fn lifecycle_helpers() {
        let event: AgentEvent = serde_json::from_value(json!({
            "runId": "run-1",
            "stream": "lifecycle",
            "seq": 4,
            "data": {"phase": "end"}
        }))
        .unwrap();
        assert_eq!(event.lifecycle_phase(), Some("end"));
        assert!(event.is_terminal());
        assert_eq!(event.assistant_text(), None);
    }

    #[test]
    fn assistant_helpers() {
        let event: AgentEvent = serde_json::from_value(json!({
            "runId": "run-1",
            "stream": "assistant",
            "sessionKey": "main",
            "data": {"text": "Hello wor", "delta": "wor"}
        }))
        .unwrap();
        assert_eq!(event.assistant_text(), Some("Hello wor"));
        assert_eq!(event.assistant_delta(), Some("wor"));
        assert!(!event.is_terminal());
        assert_eq!(event.session_key.as_deref(), Some("main"));
    }

    #[test]
    fn unmodelled_events_pass_through() {
        let event = GatewayEvent::parse("presence", Some(json!({"count": 2}))).unwrap();
        assert_eq!(event.name(), "presence");
        assert!(matches!(event, GatewayEvent::Other { payload: Some(_), .. }));
    }
}
