//! Offline cache behaviour of `CachedChatProvider` over a scripted backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use clawlink::chat::{
    CachedChatProvider, ChatEvent, ChatMessage, ChatProvider, KeyValueStore, MemoryStore,
    ProviderCapabilities, Role, SendParams, SessionSummary, UpdateFn,
};

/// Backend whose answers are set by the test.
#[derive(Default)]
struct ScriptedBackend {
    capabilities: ProviderCapabilities,
    /// Streamed as deltas by `send_message`.
    reply: Vec<String>,
    fail_send: bool,
    /// `None` makes `get_chat_history` fail.
    history: Mutex<Option<Vec<ChatMessage>>>,
    fail_reset: bool,
    sessions: Vec<SessionSummary>,
    resets: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    fn with_history(self, history: Option<Vec<ChatMessage>>) -> Self {
        *self.history.lock().unwrap() = history;
        self
    }
}

#[async_trait]
impl ChatProvider for ScriptedBackend {
    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    async fn send_message(
        &self,
        _params: SendParams,
        on_event: &(dyn for<'e> Fn(&'e ChatEvent) + Send + Sync),
    ) -> Result<()> {
        if self.fail_send {
            bail!("gateway unavailable");
        }
        on_event(&ChatEvent::Started {
            run_id: "run-1".into(),
        });
        for chunk in &self.reply {
            on_event(&ChatEvent::Delta {
                text: chunk.clone(),
            });
        }
        on_event(&ChatEvent::Done);
        Ok(())
    }

    async fn get_chat_history(
        &self,
        _session_key: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ChatMessage>> {
        let history = self
            .history
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("not connected"))?;
        let skip = limit.map_or(0, |limit| history.len().saturating_sub(limit));
        Ok(history[skip..].to_vec())
    }

    async fn reset_session(&self, session_key: &str) -> Result<()> {
        self.resets.lock().unwrap().push(session_key.to_string());
        if self.fail_reset {
            bail!("not connected");
        }
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        Ok(self.sessions.clone())
    }
}

/// Store that refuses every write.
struct ReadOnlyStore;

impl KeyValueStore for ReadOnlyStore {
    fn get(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: &str) -> Result<()> {
        bail!("disk full")
    }

    fn remove(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    fn update(&self, _key: &str, apply: &mut UpdateFn<'_>) -> Result<()> {
        match apply(None)? {
            Some(_) => bail!("disk full"),
            None => Ok(()),
        }
    }
}

fn local_backend() -> ScriptedBackend {
    ScriptedBackend {
        capabilities: ProviderCapabilities {
            server_sessions: false,
            persistent_history: false,
        },
        ..Default::default()
    }
}

fn wrap(backend: ScriptedBackend) -> (CachedChatProvider<ScriptedBackend>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let provider = CachedChatProvider::new(backend, store.clone(), Some("home"));
    (provider, store)
}

async fn send(
    provider: &CachedChatProvider<ScriptedBackend>,
    session: &str,
    text: &str,
) -> Result<Vec<ChatEvent>> {
    let events = Mutex::new(Vec::new());
    let on_event = |event: &ChatEvent| events.lock().unwrap().push(event.clone());
    provider
        .send_message(SendParams::new(session, text), &on_event)
        .await?;
    Ok(events.into_inner().unwrap())
}

fn texts(messages: &[ChatMessage]) -> Vec<(Role, String)> {
    messages.iter().map(|m| (m.role, m.text())).collect()
}

#[tokio::test]
async fn send_caches_user_message_and_reply() {
    let (provider, _store) = wrap(ScriptedBackend {
        reply: vec!["Hel".into(), "lo!".into()],
        ..local_backend()
    });

    let events = send(&provider, "main", "hi").await.unwrap();
    assert_eq!(events.first(), Some(&ChatEvent::Started { run_id: "run-1".into() }));
    assert_eq!(events.last(), Some(&ChatEvent::Done));

    let cached = provider.cache().load("main").unwrap();
    assert_eq!(
        texts(&cached),
        vec![(Role::User, "hi".to_string()), (Role::Assistant, "Hello!".to_string())]
    );
}

#[tokio::test]
async fn reply_is_cached_before_done_is_forwarded() {
    let (provider, _store) = wrap(ScriptedBackend {
        reply: vec!["pong".into()],
        ..local_backend()
    });

    let seen_at_done = Mutex::new(None);
    let on_event = |event: &ChatEvent| {
        if *event == ChatEvent::Done {
            *seen_at_done.lock().unwrap() = Some(provider.cache().load("main").unwrap().len());
        }
    };
    provider
        .send_message(SendParams::new("main", "ping"), &on_event)
        .await
        .unwrap();

    assert_eq!(*seen_at_done.lock().unwrap(), Some(2));
    assert_eq!(provider.cache().load("main").unwrap().len(), 2);
}

#[tokio::test]
async fn empty_reply_is_not_cached() {
    let (provider, _store) = wrap(ScriptedBackend {
        reply: vec!["  ".into(), "\n".into()],
        ..local_backend()
    });

    send(&provider, "main", "hi").await.unwrap();
    let cached = provider.cache().load("main").unwrap();
    assert_eq!(texts(&cached), vec![(Role::User, "hi".to_string())]);
}

#[tokio::test]
async fn failed_send_keeps_the_user_message() {
    let (provider, _store) = wrap(ScriptedBackend {
        fail_send: true,
        ..local_backend()
    });

    assert!(send(&provider, "main", "hello?").await.is_err());
    let cached = provider.cache().load("main").unwrap();
    assert_eq!(texts(&cached), vec![(Role::User, "hello?".to_string())]);
}

#[tokio::test]
async fn non_empty_backend_history_replaces_cache() {
    let server_history = vec![ChatMessage::user("from server"), ChatMessage::assistant("ok")];
    let (provider, _store) = wrap(local_backend().with_history(Some(server_history.clone())));
    provider
        .cache()
        .replace("main", &[ChatMessage::user("stale")])
        .unwrap();

    let history = provider.get_chat_history("main", None).await.unwrap();
    assert_eq!(history, server_history);
    assert_eq!(provider.cache().load("main").unwrap(), server_history);
}

#[tokio::test]
async fn failed_history_falls_back_to_cache_with_limit() {
    let (provider, _store) = wrap(local_backend().with_history(None));
    for text in ["one", "two", "three"] {
        provider.cache().append("main", ChatMessage::user(text)).unwrap();
    }

    let history = provider.get_chat_history("main", Some(2)).await.unwrap();
    assert_eq!(
        texts(&history),
        vec![(Role::User, "two".to_string()), (Role::User, "three".to_string())]
    );

    let everything = provider.get_chat_history("main", None).await.unwrap();
    assert_eq!(everything.len(), 3);
}

#[tokio::test]
async fn empty_history_from_forgetful_backend_serves_cache() {
    let (provider, _store) = wrap(local_backend().with_history(Some(Vec::new())));
    provider.cache().append("main", ChatMessage::user("kept")).unwrap();

    let history = provider.get_chat_history("main", None).await.unwrap();
    assert_eq!(texts(&history), vec![(Role::User, "kept".to_string())]);
}

#[tokio::test]
async fn empty_history_from_persistent_backend_is_trusted() {
    let backend = ScriptedBackend {
        capabilities: ProviderCapabilities {
            server_sessions: true,
            persistent_history: true,
        },
        ..Default::default()
    }
    .with_history(Some(Vec::new()));
    let (provider, _store) = wrap(backend);
    provider.cache().append("main", ChatMessage::user("old")).unwrap();

    let history = provider.get_chat_history("main", None).await.unwrap();
    assert!(history.is_empty());
    // Trusting the empty answer does not wipe the local copy.
    assert_eq!(provider.cache().load("main").unwrap().len(), 1);
}

#[tokio::test]
async fn reset_clears_cache_and_index_even_when_backend_fails() {
    let (provider, _store) = wrap(ScriptedBackend {
        reply: vec!["hi".into()],
        fail_reset: true,
        ..local_backend()
    });
    send(&provider, "main", "hello").await.unwrap();
    send(&provider, "other", "hello").await.unwrap();

    assert!(provider.reset_session("main").await.is_err());
    assert_eq!(*provider.inner().resets.lock().unwrap(), vec!["main"]);
    assert!(provider.cache().load("main").unwrap().is_empty());

    let sessions = provider.list_sessions().await.unwrap();
    let keys: Vec<_> = sessions.iter().map(|s| s.key.as_str()).collect();
    assert_eq!(keys, vec!["other"]);
}

#[tokio::test]
async fn local_index_lists_sessions_by_recent_activity() {
    let (provider, _store) = wrap(ScriptedBackend {
        reply: vec!["ok".into()],
        ..local_backend()
    });
    send(&provider, "first", "a").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    send(&provider, "second", "b").await.unwrap();

    let sessions = provider.list_sessions().await.unwrap();
    let summary: HashMap<_, _> = sessions
        .iter()
        .map(|s| (s.key.clone(), s.message_count))
        .collect();
    assert_eq!(sessions[0].key, "second");
    assert_eq!(summary["first"], Some(2));
    assert_eq!(summary["second"], Some(2));
    assert!(sessions.iter().all(|s| s.last_activity.is_some()));
}

#[tokio::test]
async fn server_side_session_listing_is_delegated() {
    let remote = vec![SessionSummary {
        key: "remote".into(),
        message_count: Some(12),
        last_activity: Some(1_700_000_000_000),
        label: Some("Remote".into()),
    }];
    let (provider, _store) = wrap(ScriptedBackend {
        capabilities: ProviderCapabilities {
            server_sessions: true,
            persistent_history: false,
        },
        reply: vec!["ok".into()],
        sessions: remote.clone(),
        ..Default::default()
    });
    send(&provider, "local-only", "hi").await.unwrap();

    assert_eq!(provider.list_sessions().await.unwrap(), remote);
}

#[tokio::test]
async fn capabilities_always_report_persistent_history() {
    let (provider, _store) = wrap(local_backend());
    let capabilities = provider.capabilities();
    assert!(capabilities.persistent_history);
    assert!(!capabilities.server_sessions);
}

#[tokio::test]
async fn caches_are_namespaced_per_server() {
    let store = Arc::new(MemoryStore::new());
    let home = CachedChatProvider::new(local_backend(), store.clone(), Some("home"));
    let work = CachedChatProvider::new(local_backend(), store.clone(), Some("work"));

    home.cache().append("main", ChatMessage::user("home only")).unwrap();
    assert!(work.cache().load("main").unwrap().is_empty());
    assert_eq!(home.cache().load("main").unwrap().len(), 1);
}

#[tokio::test]
async fn cache_write_failures_do_not_fail_the_turn() {
    let provider = CachedChatProvider::new(
        ScriptedBackend {
            reply: vec!["still here".into()],
            ..local_backend()
        },
        Arc::new(ReadOnlyStore),
        None,
    );

    let events = Mutex::new(Vec::new());
    let on_event = |event: &ChatEvent| events.lock().unwrap().push(event.clone());
    provider
        .send_message(SendParams::new("main", "hi"), &on_event)
        .await
        .unwrap();
    assert!(events.lock().unwrap().contains(&ChatEvent::Delta {
        text: "still here".into()
    }));
}

#[tokio::test]
async fn cache_respects_message_cap() {
    let store = Arc::new(MemoryStore::new());
    let provider = CachedChatProvider::new(
        ScriptedBackend {
            reply: vec!["r".into()],
            ..local_backend()
        },
        store,
        None,
    )
    .with_max_messages(3);

    for text in ["a", "b"] {
        let on_event = |_: &ChatEvent| {};
        provider
            .send_message(SendParams::new("main", text), &on_event)
            .await
            .unwrap();
    }
    let cached = provider.cache().load("main").unwrap();
    assert_eq!(
        texts(&cached),
        vec![
            (Role::Assistant, "r".to_string()),
            (Role::User, "b".to_string()),
            (Role::Assistant, "r".to_string()),
        ]
    );
}
