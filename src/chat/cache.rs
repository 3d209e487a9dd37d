//! Per-server, per-session message cache.
//!
//! Each session's history is one JSON array stored under
//! `chat_cache:<serverId>:<sessionKey>`, with the server id percent-encoded
//! so a `:` in it cannot run into the session key. Servers without an id
//! share the `_local` namespace.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::warn;

use super::ChatMessage;
use super::store::KeyValueStore;

pub const LOCAL_SERVER_ID: &str = "_local";

/// Messages kept per session; older ones are dropped first.
pub const DEFAULT_MAX_MESSAGES: usize = 200;

/// Storage namespace for a server id.
pub fn namespace(server_id: Option<&str>) -> &str {
    match server_id {
        Some(id) if !id.is_empty() => id,
        _ => LOCAL_SERVER_ID,
    }
}

pub fn cache_key(namespace: &str, session_key: &str) -> String {
    format!("chat_cache:{}:{session_key}", urlencoding::encode(namespace))
}

#[derive(Clone)]
pub struct ChatCache {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
    max_messages: usize,
}

impl ChatCache {
    pub fn new(store: Arc<dyn KeyValueStore>, server_id: Option<&str>) -> Self {
        Self {
            store,
            namespace: namespace(server_id).to_string(),
            max_messages: DEFAULT_MAX_MESSAGES,
        }
    }

    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages.max(1);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, session_key: &str) -> String {
        cache_key(&self.namespace, session_key)
    }

    /// Whole cached history, oldest first. Unreadable entries count as empty.
    pub fn load(&self, session_key: &str) -> Result<Vec<ChatMessage>> {
        let key = self.key(session_key);
        Ok(decode(&key, self.store.get(&key)?))
    }

    /// The most recent `limit` messages (all if `None`), in original order.
    pub fn tail(&self, session_key: &str, limit: Option<usize>) -> Result<Vec<ChatMessage>> {
        let mut messages = self.load(session_key)?;
        if let Some(limit) = limit {
            let skip = messages.len().saturating_sub(limit);
            messages.drain(..skip);
        }
        Ok(messages)
    }

    pub fn append(&self, session_key: &str, message: ChatMessage) -> Result<()> {
        let key = self.key(session_key);
        let mut message = Some(message);
        self.store.update(&key, &mut |raw| {
            let mut messages = decode(&key, raw);
            messages.extend(message.take());
            self.encode(messages).map(Some)
        })
    }

    /// Overwrite the session's history.
    pub fn replace(&self, session_key: &str, messages: &[ChatMessage]) -> Result<()> {
        self.write(session_key, messages.to_vec())
    }

    pub fn clear(&self, session_key: &str) -> Result<()> {
        self.store.remove(&self.key(session_key))
    }

    fn write(&self, session_key: &str, messages: Vec<ChatMessage>) -> Result<()> {
        let raw = self.encode(messages)?;
        self.store.set(&self.key(session_key), &raw)
    }

    fn encode(&self, mut messages: Vec<ChatMessage>) -> Result<String> {
        let excess = messages.len().saturating_sub(self.max_messages);
        messages.drain(..excess);
        serde_json::to_string(&messages).context("Failed to serialize chat cache")
    }
}

/// Unreadable entries count as empty.
fn decode(key: &str, raw: Option<String>) -> Vec<ChatMessage> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    serde_json::from_str(&raw).unwrap_or_else(|err| {
        warn!(%key, error = %err, "ignoring corrupt chat cache entry");
        Vec::new()
    })
}
