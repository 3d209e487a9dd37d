//! Request/response correlation by frame id.
//!
//! Ids come from a counter that restarts at 1 for every new socket, so
//! they are unique per connection only. Every registered waiter is
//! settled exactly once: by its response, by removal on timeout, or by
//! `reject_all` when the socket goes away.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::GatewayError;
use crate::lock;

pub(crate) type Reply = Result<Value, GatewayError>;

pub(crate) struct PendingRequests {
    next_id: AtomicU64,
    waiting: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            waiting: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next id and register a waiter for it.
    pub(crate) fn register(&self) -> (String, oneshot::Receiver<Reply>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.waiting).insert(id.clone(), tx);
        (id, rx)
    }

    /// Settle the waiter for `id`. Returns false for unknown ids.
    pub(crate) fn resolve(&self, id: &str, reply: Reply) -> bool {
        let Some(tx) = lock(&self.waiting).remove(id) else {
            return false;
        };
        // The caller may have stopped waiting (timeout, dropped future).
        let _ = tx.send(reply);
        true
    }

    pub(crate) fn remove(&self, id: &str) -> bool {
        lock(&self.waiting).remove(id).is_some()
    }

    /// Reject every outstanding waiter with a fresh error from `make_error`.
    pub(crate) fn reject_all(&self, make_error: impl Fn() -> GatewayError) -> usize {
        let drained: Vec<_> = lock(&self.waiting).drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(make_error()));
        }
        count
    }

    /// Start numbering from 1 again for a new socket.
    pub(crate) fn restart_numbering(&self) {
        self.next_id.store(1, Ordering::Relaxed);
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.waiting).len()
    }
}
