//! Caching decorator for any [`ChatProvider`].
//!
//! The wrapper keeps a local copy of every session's history and a local
//! session index, so callers always have a last-known-good conversation:
//!
//! - Sent user messages and non-empty assistant replies are appended to
//!   the cache as the turn runs.
//! - A non-empty history from the backend is authoritative and replaces
//!   the cache.
//! - A failed history call falls back to the cache.
//! - An empty history is trusted only from a backend that persists
//!   history; otherwise the cache is served instead.
//!
//! Cache write failures are logged and never fail the call that caused
//! them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use super::cache::ChatCache;
use super::session_index::SessionIndex;
use super::store::KeyValueStore;
use super::{
    ChatEvent, ChatMessage, ChatProvider, ProviderCapabilities, SendParams, SessionSummary,
};
use crate::lock;

pub struct CachedChatProvider<P> {
    inner: P,
    cache: ChatCache,
    index: SessionIndex,
}

impl<P: ChatProvider> CachedChatProvider<P> {
    /// `server_id` namespaces the cache; `None` uses the shared local namespace.
    pub fn new(inner: P, store: Arc<dyn KeyValueStore>, server_id: Option<&str>) -> Self {
        Self {
            inner,
            cache: ChatCache::new(store.clone(), server_id),
            index: SessionIndex::new(store, server_id),
        }
    }

    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.cache = self.cache.with_max_messages(max_messages);
        self
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn cache(&self) -> &ChatCache {
        &self.cache
    }

    /// Sessions known from this device's own traffic, most recent first.
    /// Answers without the backend, so it also works offline.
    pub fn local_sessions(&self) -> Result<Vec<SessionSummary>> {
        Ok(self
            .index
            .list()?
            .into_iter()
            .map(SessionSummary::from)
            .collect())
    }

    fn record(&self, session_key: &str, message: ChatMessage) {
        let at = message.timestamp;
        if let Err(err) = self.cache.append(session_key, message) {
            warn!(session_key, error = %err, "failed to cache chat message");
        }
        if let Err(err) = self.index.record_message(session_key, at) {
            warn!(session_key, error = %err, "failed to update session index");
        }
    }

    fn cached_tail(&self, session_key: &str, limit: Option<usize>) -> Vec<ChatMessage> {
        self.cache.tail(session_key, limit).unwrap_or_else(|err| {
            warn!(session_key, error = %err, "chat cache unreadable");
            Vec::new()
        })
    }
}

#[async_trait]
impl<P: ChatProvider> ChatProvider for CachedChatProvider<P> {
    /// History always looks persistent to callers; the cache backstops it.
    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            persistent_history: true,
            ..self.inner.capabilities()
        }
    }

    async fn send_message(
        &self,
        params: SendParams,
        on_event: &(dyn for<'e> Fn(&'e ChatEvent) + Send + Sync),
    ) -> Result<()> {
        let session_key = params.session_key.clone();
        self.record(&session_key, ChatMessage::user(params.text.clone()));

        let reply = Mutex::new(String::new());
        let finished = AtomicBool::new(false);
        let finish = || {
            if finished.swap(true, Ordering::SeqCst) {
                return;
            }
            let text = std::mem::take(&mut *lock(&reply));
            if text.trim().is_empty() {
                debug!(session_key = %session_key, "empty assistant reply not cached");
                return;
            }
            self.record(&session_key, ChatMessage::assistant(text));
        };
        let forward = |event: &ChatEvent| {
            match event {
                ChatEvent::Delta { text } => lock(&reply).push_str(text),
                ChatEvent::Snapshot { text } => *lock(&reply) = text.clone(),
                // Cache before the caller sees the turn end, so a history
                // read triggered by `Done` already includes the reply.
                ChatEvent::Done => finish(),
                _ => {}
            }
            on_event(event);
        };

        let result = self.inner.send_message(params, &forward).await;
        if result.is_ok() {
            finish();
        }
        result
    }

    async fn get_chat_history(
        &self,
        session_key: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ChatMessage>> {
        match self.inner.get_chat_history(session_key, limit).await {
            Ok(messages) if !messages.is_empty() => {
                if let Err(err) = self.cache.replace(session_key, &messages) {
                    warn!(session_key, error = %err, "failed to refresh chat cache");
                }
                Ok(messages)
            }
            Ok(messages) if self.inner.capabilities().persistent_history => Ok(messages),
            Ok(_) => {
                debug!(session_key, "backend reported no history, serving chat cache");
                Ok(self.cached_tail(session_key, limit))
            }
            Err(err) => {
                warn!(session_key, error = %err, "backend history unavailable, serving chat cache");
                Ok(self.cached_tail(session_key, limit))
            }
        }
    }

    async fn reset_session(&self, session_key: &str) -> Result<()> {
        let result = self.inner.reset_session(session_key).await;
        let cleared = self.cache.clear(session_key);
        let unindexed = self.index.remove(session_key);
        result?;
        cleared?;
        unindexed?;
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        if self.inner.capabilities().server_sessions {
            return self.inner.list_sessions().await;
        }
        self.local_sessions()
    }
}
