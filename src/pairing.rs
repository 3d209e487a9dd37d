//! Device pairing state machine.
//!
//! A device without an auth token asks the gateway to be paired and then
//! waits for an operator to approve it out of band. The gateway answers
//! with a `node.pair.approved` event carrying the token (or with
//! `node.pair.rejected`).
//!
//! ## States
//!
//! ```text
//! unpaired --request_pairing--> requesting --(request sent)--> waiting --(approved)--> paired
//!                                    \                            \
//!                                     `------ error <--------------`  (rejected / transport failure)
//! ```
//!
//! `cancel()` returns to `unpaired` from anywhere and tears down the
//! connection if an attempt was still in flight. Only one attempt is
//! active per machine: starting a new one first tears down the old one.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let pairing = PairingMachine::new(client.clone(), device_id);
//! let request = pairing.request_pairing("laptop").await?;
//! println!("approve request {:?} on the gateway", request.request_id);
//! if let PairingState::Paired { token } = pairing.wait_for_outcome().await {
//!     // client.auth_token() now holds `token`
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::protocol::GatewayEvent;
use crate::gateway::{ConnectionState, GatewayClient, StateChange, Subscription};
use crate::lock;

pub const PAIR_REQUEST_METHOD: &str = "node.pair.request";
pub const PAIR_VERIFY_METHOD: &str = "node.pair.verify";

/// What the gateway returned for `node.pair.request`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    /// Short code an operator can match against, if the gateway issues one.
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Unix milliseconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl PairingRequest {
    /// Accepts both `{requestId, ...}` and `{status, request: {requestId, ...}}`.
    fn from_response(payload: Value) -> Self {
        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let body = if payload.get("request").is_some_and(Value::is_object) {
            payload["request"].clone()
        } else {
            payload
        };
        let mut request: Self = serde_json::from_value(body).unwrap_or_default();
        if request.status.is_none() {
            request.status = status;
        }
        request
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingState {
    Unpaired,
    Requesting,
    Waiting { request: PairingRequest },
    Paired { token: String },
    Error { message: String },
}

impl PairingState {
    /// An attempt is in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Requesting | Self::Waiting { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unpaired => "unpaired",
            Self::Requesting => "requesting",
            Self::Waiting { .. } => "waiting",
            Self::Paired { .. } => "paired",
            Self::Error { .. } => "error",
        }
    }
}

struct Shared {
    client: GatewayClient,
    node_id: String,
    caps: Vec<String>,
    state: watch::Sender<PairingState>,
    /// Bumped by every new attempt and by `cancel()`; callbacks carrying an
    /// older value are ignored.
    attempt: AtomicU64,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Shared {
    fn is_current(&self, attempt: u64) -> bool {
        self.attempt.load(Ordering::SeqCst) == attempt
    }

    /// Move to `next` if `attempt` is still current and the state is in flight.
    fn advance(&self, attempt: u64, next: PairingState) -> bool {
        let applied = self.state.send_if_modified(|state| {
            if !self.is_current(attempt) || !state.is_active() {
                return false;
            }
            if let PairingState::Paired { token } = &next {
                self.client.set_auth_token(Some(token.clone()));
            }
            debug!(from = state.as_str(), to = next.as_str(), "pairing state changed");
            *state = next.clone();
            true
        });
        if applied && !next.is_active() {
            self.release(attempt);
        }
        applied
    }

    fn fail(&self, attempt: u64, message: String) -> bool {
        warn!(%message, "pairing failed");
        self.advance(attempt, PairingState::Error { message })
    }

    /// Drop the attempt's event subscriptions.
    fn release(&self, attempt: u64) {
        if !self.is_current(attempt) {
            return;
        }
        let released = std::mem::take(&mut *lock(&self.subscriptions));
        drop(released);
    }

    fn concerns(&self, node_id: Option<&str>) -> bool {
        node_id.is_none_or(|id| id == self.node_id)
    }

    fn on_event(&self, attempt: u64, event: &GatewayEvent) {
        match event {
            GatewayEvent::PairApproved(approved) if self.concerns(approved.node_id.as_deref()) => {
                if self.advance(
                    attempt,
                    PairingState::Paired {
                        token: approved.token.clone(),
                    },
                ) {
                    info!(node_id = %self.node_id, "pairing approved");
                }
            }
            GatewayEvent::PairRejected(rejected) if self.concerns(rejected.node_id.as_deref()) => {
                let message = rejected
                    .reason
                    .clone()
                    .unwrap_or_else(|| "pairing request rejected".to_string());
                self.fail(attempt, message);
            }
            _ => {}
        }
    }

    fn on_state_change(&self, attempt: u64, change: &StateChange) {
        // Failures while the request itself is in flight surface through
        // `request_pairing`; only a drop during the wait lands here.
        let waiting = matches!(*self.state.borrow(), PairingState::Waiting { .. });
        if waiting && change.state == ConnectionState::Disconnected {
            let message = change
                .error
                .as_ref()
                .map(|err| err.to_string())
                .unwrap_or_else(|| GatewayError::ConnectionClosed.to_string());
            self.fail(attempt, message);
        }
    }
}

/// Drives one device's pairing flow over a [`GatewayClient`].
#[derive(Clone)]
pub struct PairingMachine {
    shared: Arc<Shared>,
}

impl PairingMachine {
    pub fn new(client: GatewayClient, node_id: impl Into<String>) -> Self {
        let caps = client.options().caps.clone();
        let (state, _) = watch::channel(PairingState::Unpaired);
        Self {
            shared: Arc::new(Shared {
                client,
                node_id: node_id.into(),
                caps,
                state,
                attempt: AtomicU64::new(0),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn state(&self) -> PairingState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PairingState> {
        self.shared.state.subscribe()
    }

    pub fn node_id(&self) -> &str {
        &self.shared.node_id
    }

    /// Start a pairing attempt and return once the gateway has accepted the
    /// request. Approval arrives later; watch [`subscribe`](Self::subscribe)
    /// or await [`wait_for_outcome`](Self::wait_for_outcome).
    pub async fn request_pairing(&self, name: &str) -> GatewayResult<PairingRequest> {
        let shared = &self.shared;
        let replacing = self.state().is_active();
        let attempt = self.teardown();
        if replacing {
            info!("replacing in-flight pairing attempt");
            shared.client.disconnect();
        }
        shared.state.send_replace(PairingState::Requesting);
        self.watch(attempt);

        match shared.client.connect().await {
            Ok(_) | Err(GatewayError::PairingRequired) => {}
            Err(err) => {
                shared.fail(attempt, err.to_string());
                return Err(err);
            }
        }

        let params = json!({
            "nodeId": shared.node_id,
            "name": name,
            "caps": shared.caps,
        });
        let payload = match shared.client.call(PAIR_REQUEST_METHOD, Some(params)).await {
            Ok(payload) => payload,
            Err(err) => {
                shared.fail(attempt, err.to_string());
                return Err(err);
            }
        };

        let request = PairingRequest::from_response(payload);
        info!(request_id = ?request.request_id, "pairing requested, waiting for approval");
        // The approval may already have arrived while the request was in flight.
        shared.state.send_if_modified(|state| {
            if !shared.is_current(attempt) || *state != PairingState::Requesting {
                return false;
            }
            *state = PairingState::Waiting {
                request: request.clone(),
            };
            true
        });
        Ok(request)
    }

    /// Abandon the current attempt and return to `Unpaired`.
    pub fn cancel(&self) {
        let previous = self.state();
        self.teardown();
        if !matches!(previous, PairingState::Unpaired | PairingState::Paired { .. }) {
            self.shared.client.disconnect();
        }
        if previous != PairingState::Unpaired {
            info!(from = previous.as_str(), "pairing cancelled");
        }
        self.shared.state.send_replace(PairingState::Unpaired);
    }

    /// Resolves once the current attempt is paired, failed or cancelled.
    pub async fn wait_for_outcome(&self) -> PairingState {
        let mut rx = self.subscribe();
        match rx.wait_for(|state| !state.is_active()).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }

    /// Ask the gateway whether the held token is still valid.
    ///
    /// Needs an open socket. Returns `false` without a round trip when no
    /// token is held.
    pub async fn verify(&self) -> GatewayResult<bool> {
        let Some(token) = self.shared.client.auth_token() else {
            return Ok(false);
        };
        let params = json!({"nodeId": self.shared.node_id, "token": token});
        let payload = self.shared.client.call(PAIR_VERIFY_METHOD, Some(params)).await?;
        Ok(payload.get("ok").and_then(Value::as_bool).unwrap_or(false))
    }

    /// Invalidate the current attempt and drop its subscriptions. Returns
    /// the id of the next attempt.
    fn teardown(&self) -> u64 {
        let attempt = self.shared.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        let released = std::mem::take(&mut *lock(&self.shared.subscriptions));
        drop(released);
        attempt
    }

    fn watch(&self, attempt: u64) {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let events = self.shared.client.add_event_listener({
            let weak = weak.clone();
            move |event| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_event(attempt, event);
                }
            }
        });
        let states = self.shared.client.on_state_change(move |change| {
            if let Some(shared) = weak.upgrade() {
                shared.on_state_change(attempt, change);
            }
        });
        lock(&self.shared.subscriptions).extend([events, states]);
    }
}
