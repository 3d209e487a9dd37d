//! Locally maintained session directory, for backends that cannot list
//! their own sessions.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::SessionSummary;
use super::cache::namespace;
use super::store::KeyValueStore;

/// The namespace is percent-encoded the same way as cache keys.
pub fn index_key(namespace: &str) -> String {
    format!("session_index:{}", urlencoding::encode(namespace))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIndexEntry {
    pub key: String,
    pub message_count: u64,
    /// Unix milliseconds.
    pub last_activity: i64,
}

impl From<SessionIndexEntry> for SessionSummary {
    fn from(entry: SessionIndexEntry) -> Self {
        Self {
            key: entry.key,
            message_count: Some(entry.message_count),
            last_activity: Some(entry.last_activity),
            label: None,
        }
    }
}

#[derive(Clone)]
pub struct SessionIndex {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl SessionIndex {
    pub fn new(store: Arc<dyn KeyValueStore>, server_id: Option<&str>) -> Self {
        Self {
            store,
            key: index_key(namespace(server_id)),
        }
    }

    fn load(&self) -> Result<Vec<SessionIndexEntry>> {
        Ok(self.decode(self.store.get(&self.key)?))
    }

    fn decode(&self, raw: Option<String>) -> Vec<SessionIndexEntry> {
        let Some(raw) = raw else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(key = %self.key, error = %err, "ignoring corrupt session index");
            Vec::new()
        })
    }

    /// Apply `change` to the entries under the store's update guard. The
    /// index is written back only when `change` returns true.
    fn modify(&self, mut change: impl FnMut(&mut Vec<SessionIndexEntry>) -> bool) -> Result<()> {
        self.store.update(&self.key, &mut |raw| {
            let mut entries = self.decode(raw);
            if !change(&mut entries) {
                return Ok(None);
            }
            serde_json::to_string(&entries)
                .map(Some)
                .context("Failed to serialize session index")
        })
    }

    /// Count one more message in `session_key`, creating the entry if needed.
    pub fn record_message(&self, session_key: &str, at: i64) -> Result<SessionIndexEntry> {
        let mut recorded = None;
        self.modify(|entries| {
            let entry = match entries.iter_mut().find(|entry| entry.key == session_key) {
                Some(entry) => {
                    entry.message_count += 1;
                    entry.last_activity = entry.last_activity.max(at);
                    entry.clone()
                }
                None => {
                    let entry = SessionIndexEntry {
                        key: session_key.to_string(),
                        message_count: 1,
                        last_activity: at,
                    };
                    entries.push(entry.clone());
                    entry
                }
            };
            recorded = Some(entry);
            true
        })?;
        recorded.context("session index update did not run")
    }

    /// Returns whether an entry was removed.
    pub fn remove(&self, session_key: &str) -> Result<bool> {
        let mut removed = false;
        self.modify(|entries| {
            let before = entries.len();
            entries.retain(|entry| entry.key != session_key);
            removed = entries.len() != before;
            removed
        })?;
        Ok(removed)
    }

    /// Most recently active first.
    pub fn list(&self) -> Result<Vec<SessionIndexEntry>> {
        let mut entries = self.load()?;
        entries.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(entries)
    }
}
