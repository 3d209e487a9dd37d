//! Chat backend that runs turns on a gateway.
//!
//! A turn is a `send` request followed by `agent` events for the returned
//! run id, ending with a lifecycle `end` (or `error`) event.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    ChatEvent, ChatMessage, ChatProvider, ProviderCapabilities, SendParams, SessionSummary,
};
use crate::gateway::protocol::{AgentEvent, AgentStream, GatewayEvent};
use crate::gateway::{ConnectionState, GatewayClient};

pub const SEND_METHOD: &str = "send";
pub const HISTORY_METHOD: &str = "chat.history";
pub const RESET_METHOD: &str = "sessions.reset";
pub const LIST_METHOD: &str = "sessions.list";

enum TurnSignal {
    Agent(AgentEvent),
    Closed(ConnectionState),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSession {
    key: String,
    #[serde(default)]
    updated_at: Option<i64>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    message_count: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct GatewayChatProvider {
    client: GatewayClient,
    capabilities: ProviderCapabilities,
}

impl GatewayChatProvider {
    pub fn new(client: GatewayClient, capabilities: ProviderCapabilities) -> Self {
        Self {
            client,
            capabilities,
        }
    }

    pub fn client(&self) -> &GatewayClient {
        &self.client
    }
}

#[async_trait]
impl ChatProvider for GatewayChatProvider {
    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    async fn send_message(
        &self,
        params: SendParams,
        on_event: &(dyn for<'e> Fn(&'e ChatEvent) + Send + Sync),
    ) -> Result<()> {
        // Subscribe before sending so no event of this run is missed.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _events = self.client.add_event_listener({
            let tx = tx.clone();
            move |event| {
                if let GatewayEvent::Agent(agent) = event {
                    let _ = tx.send(TurnSignal::Agent(agent.clone()));
                }
            }
        });
        let _states = self.client.on_state_change(move |change| {
            if change.state != ConnectionState::Connected {
                let _ = tx.send(TurnSignal::Closed(change.state));
            }
        });

        let request = json!({
            "sessionKey": params.session_key,
            "message": params.text,
            "attachments": params.attachments,
            "idempotencyKey": uuid::Uuid::new_v4().to_string(),
        });
        let payload = self
            .client
            .request(SEND_METHOD, Some(request))
            .await
            .context("Failed to start chat turn")?;
        let run_id = payload
            .get("runId")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| anyhow!("gateway did not return a run id"))?;
        debug!(run_id = %run_id, session_key = %params.session_key, "chat turn started");
        on_event(&ChatEvent::Started {
            run_id: run_id.clone(),
        });

        let mut seen = String::new();
        while let Some(signal) = rx.recv().await {
            let event = match signal {
                TurnSignal::Closed(state) => bail!("connection {state} before the reply finished"),
                TurnSignal::Agent(event) if event.run_id != run_id => continue,
                TurnSignal::Agent(event) => event,
            };
            match event.stream {
                AgentStream::Assistant => {
                    if let Some(reply) = reply_event(&mut seen, &event) {
                        on_event(&reply);
                    }
                }
                AgentStream::Tool => {
                    if let Some(name) = event.tool_name() {
                        on_event(&ChatEvent::Tool {
                            name: name.to_string(),
                            phase: event.tool_phase().map(str::to_owned),
                        });
                    }
                }
                AgentStream::Lifecycle => match event.lifecycle_phase() {
                    Some("end") => {
                        on_event(&ChatEvent::Done);
                        return Ok(());
                    }
                    Some("error") => {
                        let message = event
                            .error_message()
                            .unwrap_or("agent run failed")
                            .to_string();
                        on_event(&ChatEvent::Error {
                            message: message.clone(),
                        });
                        bail!(message);
                    }
                    _ => {}
                },
            }
        }
        bail!("event stream ended before the reply finished")
    }

    async fn get_chat_history(
        &self,
        session_key: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ChatMessage>> {
        let mut params = json!({"sessionKey": session_key});
        if let Some(limit) = limit {
            params["limit"] = json!(limit);
        }
        let payload = self
            .client
            .request(HISTORY_METHOD, Some(params))
            .await
            .context("Failed to fetch chat history")?;

        let raw = match payload.get("messages") {
            Some(Value::Array(raw)) => raw.clone(),
            _ => Vec::new(),
        };
        Ok(raw
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<ChatMessage>(value) {
                Ok(message) => Some(message),
                Err(err) => {
                    debug!(error = %err, "skipping history entry");
                    None
                }
            })
            .collect())
    }

    async fn reset_session(&self, session_key: &str) -> Result<()> {
        self.client
            .request(RESET_METHOD, Some(json!({"key": session_key})))
            .await
            .context("Failed to reset session")?;
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let payload = self
            .client
            .request(LIST_METHOD, Some(json!({})))
            .await
            .context("Failed to list sessions")?;
        let sessions: Vec<WireSession> = match payload.get("sessions") {
            Some(sessions) => {
                serde_json::from_value(sessions.clone()).context("Malformed session list")?
            }
            None => Vec::new(),
        };
        Ok(sessions
            .into_iter()
            .map(|session| SessionSummary {
                key: session.key,
                message_count: session.message_count,
                last_activity: session.updated_at,
                label: session.label,
            })
            .collect())
    }
}

/// Reply progress carried by `event`, given the text already emitted.
///
/// Uses the explicit `delta` when present; otherwise diffs the cumulative
/// `text` snapshot against what was already seen. A snapshot that no longer
/// starts with the seen text replaces the reply.
fn reply_event(seen: &mut String, event: &AgentEvent) -> Option<ChatEvent> {
    if let Some(delta) = event.assistant_delta() {
        seen.push_str(delta);
        return (!delta.is_empty()).then(|| ChatEvent::Delta {
            text: delta.to_string(),
        });
    }
    let text = event.assistant_text()?;
    let reply = match text.strip_prefix(seen.as_str()) {
        Some("") => None,
        Some(rest) => Some(ChatEvent::Delta {
            text: rest.to_string(),
        }),
        None => Some(ChatEvent::Snapshot {
            text: text.to_string(),
        }),
    };
    *seen = text.to_string();
    reply
}
