//! Chat provider contract and message model.
//!
//! A [`ChatProvider`] is any backend that can run a chat turn and answer
//! history and session queries. [`GatewayChatProvider`] talks to a gateway;
//! [`CachedChatProvider`] wraps any provider with an on-device history
//! cache and session index.

pub mod cache;
pub mod cached;
pub mod gateway;
pub mod session_index;
pub mod store;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub use cache::ChatCache;
pub use cached::CachedChatProvider;
pub use gateway::GatewayChatProvider;
pub use session_index::{SessionIndex, SessionIndexEntry};
pub use store::{FileStore, KeyValueStore, MemoryStore, UpdateFn};

// ── Messages ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// One piece of structured message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        /// Base64 image data.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    ToolCall {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        #[serde(default)]
        arguments: Value,
    },
    ToolResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default)]
        output: Value,
        #[serde(default)]
        is_error: bool,
    },
    /// Block types this client does not render.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    /// Either a plain string or a list of blocks on the wire.
    #[serde(deserialize_with = "content_from_wire")]
    pub content: Vec<ContentBlock>,
    /// Unix milliseconds.
    #[serde(default)]
    pub timestamp: i64,
}

impl ChatMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::Text { text: text.into() }],
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn content_from_wire<'de, D>(deserializer: D) -> Result<Vec<ContentBlock>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Text(String),
        Blocks(Vec<ContentBlock>),
    }

    Ok(match Wire::deserialize(deserializer)? {
        Wire::Text(text) => vec![ContentBlock::Text { text }],
        Wire::Blocks(blocks) => blocks,
    })
}

// ── Provider contract ───────────────────────────────────────────────────────

/// Behavioural guarantees a backend makes about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCapabilities {
    /// The backend can list sessions itself.
    pub server_sessions: bool,
    /// The backend remembers history across its own restarts.
    pub persistent_history: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Base64 content.
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendParams {
    pub session_key: String,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl SendParams {
    pub fn new(session_key: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            text: text.into(),
            attachments: Vec::new(),
        }
    }
}

/// Progress of one chat turn, in the order the backend produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Started { run_id: String },
    /// Incremental assistant text.
    Delta { text: String },
    /// Replaces the reply text accumulated so far.
    Snapshot { text: String },
    Tool { name: String, phase: Option<String> },
    /// End of turn.
    Done,
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub key: String,
    #[serde(default)]
    pub message_count: Option<u64>,
    /// Unix milliseconds.
    #[serde(default)]
    pub last_activity: Option<i64>,
    #[serde(default)]
    pub label: Option<String>,
}

/// A chat backend.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn capabilities(&self) -> ProviderCapabilities;

    /// Run one turn. `on_event` sees every event of the turn; the future
    /// resolves once the backend signals end of turn.
    async fn send_message(
        &self,
        params: SendParams,
        on_event: &(dyn for<'e> Fn(&'e ChatEvent) + Send + Sync),
    ) -> Result<()>;

    /// Most recent messages of a session, oldest first.
    async fn get_chat_history(
        &self,
        session_key: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ChatMessage>>;

    async fn reset_session(&self, session_key: &str) -> Result<()>;

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>>;
}

#[async_trait]
impl<P: ChatProvider + ?Sized> ChatProvider for Arc<P> {
    fn capabilities(&self) -> ProviderCapabilities {
        (**self).capabilities()
    }

    async fn send_message(
        &self,
        params: SendParams,
        on_event: &(dyn for<'e> Fn(&'e ChatEvent) + Send + Sync),
    ) -> Result<()> {
        (**self).send_message(params, on_event).await
    }

    async fn get_chat_history(
        &self,
        session_key: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ChatMessage>> {
        (**self).get_chat_history(session_key, limit).await
    }

    async fn reset_session(&self, session_key: &str) -> Result<()> {
        (**self).reset_session(session_key).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        (**self).list_sessions().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_accepts_plain_string() {
        let message: ChatMessage = serde_json::from_value(json!({
            "role": "assistant",
            "content": "hello",
            "timestamp": 12
        }))
        .unwrap();
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.text(), "hello");
        assert_eq!(message.timestamp, 12);
    }

    #[test]
    fn content_accepts_blocks() {
        let message: ChatMessage = serde_json::from_value(json!({
            "role": "assistant",
            "content": [
                {"type": "text", "text": "looking"},
                {"type": "tool_call", "id": "c1", "name": "search", "arguments": {"q": "rust"}},
                {"type": "tool_result", "id": "c1", "output": "ok", "isError": false},
                {"type": "canvas", "html": "<p>"}
            ]
        }))
        .unwrap();
        assert_eq!(message.content.len(), 4);
        assert!(matches!(
            &message.content[1],
            ContentBlock::ToolCall { name, .. } if name == "search"
        ));
        assert_eq!(message.content[3], ContentBlock::Other);
        assert_eq!(message.text(), "looking");
        assert_eq!(message.timestamp, 0);
    }

    #[test]
    fn blocks_serialize_with_camel_case_fields() {
        let block = ContentBlock::Image {
            mime_type: Some("image/png".into()),
            url: None,
            data: Some("AAAA".into()),
        };
        assert_eq!(
            serde_json::to_value(&block).unwrap(),
            json!({"type": "image", "mimeType": "image/png", "data": "AAAA"})
        );
    }

    #[test]
    fn unknown_role_is_rejected() {
        let result: std::result::Result<ChatMessage, _> =
            serde_json::from_value(json!({"role": "narrator", "content": "x"}));
        assert!(result.is_err());
    }
}
