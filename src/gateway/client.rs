//! Gateway connection manager.
//!
//! [`GatewayClient`] owns one socket to a gateway. It performs the
//! `connect` handshake as soon as the socket opens, correlates requests
//! with responses, fans out server events, and reconnects with
//! exponential backoff when an established link drops unexpectedly.
//!
//! Every socket gets a generation number. Frames, closes and handshake
//! results from a superseded socket are ignored, which is what keeps a
//! deliberate `disconnect()` from ever triggering a reconnect.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::correlator::PendingRequests;
use super::listeners::{Listeners, Subscription};
use super::protocol::{
    AuthParams, CONNECT_METHOD, ClientInfo, ConnectParams, DeviceInfo, ErrorShape, Frame,
    GatewayEvent, HelloOk, MAX_PROTOCOL, MIN_PROTOCOL,
};
use super::transport::{Connector, TransportEvent, TransportHandle, WebSocketConnector};
use crate::error::{GatewayError, GatewayResult};
use crate::lock;
use crate::retry::RetryPolicy;

/// Role announced in the handshake unless configured otherwise.
pub const DEFAULT_ROLE: &str = "operator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the backoff delay, or handshaking again, after an unexpected close.
    Reconnecting,
    /// Socket open and handshaken, but the gateway has not approved this device.
    AwaitingApproval,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::AwaitingApproval => "awaitingApproval",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivered to state listeners on every transition.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub state: ConnectionState,
    /// Current reconnect attempt (0 outside the backoff loop).
    pub attempt: u32,
    /// Set when the transition is terminal, e.g. reconnects exhausted.
    pub error: Option<Arc<GatewayError>>,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub url: String,
    pub client: ClientInfo,
    pub device: DeviceInfo,
    pub role: String,
    pub caps: Vec<String>,
    /// Bearer token sent in the handshake, if already paired.
    pub auth_token: Option<String>,
    pub reconnect: RetryPolicy,
    /// Reject requests that get no response within this long. `None` waits
    /// until a response or a close.
    pub request_timeout: Option<Duration>,
}

impl ClientOptions {
    pub fn new(url: impl Into<String>, client: ClientInfo, device: DeviceInfo) -> Self {
        Self {
            url: url.into(),
            client,
            device,
            role: DEFAULT_ROLE.to_string(),
            caps: Vec::new(),
            auth_token: None,
            reconnect: RetryPolicy::reconnect_default(),
            request_timeout: None,
        }
    }
}

struct Link {
    state: ConnectionState,
    generation: u64,
    attempt: u32,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    reader: Option<JoinHandle<()>>,
    reconnect: Option<CancellationToken>,
}

struct Inner {
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    auth_token: Mutex<Option<String>>,
    link: Mutex<Link>,
    /// Held for the duration of a handshake so manual connects and
    /// reconnect attempts never overlap.
    connecting: tokio::sync::Mutex<()>,
    pending: PendingRequests,
    hello: Mutex<Option<HelloOk>>,
    events: Listeners<GatewayEvent>,
    state_listeners: Listeners<StateChange>,
}

/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayClient")
            .field("url", &self.inner.options.url)
            .field("state", &self.state())
            .finish()
    }
}

impl GatewayClient {
    pub fn new(options: ClientOptions) -> Self {
        Self::with_connector(options, Arc::new(WebSocketConnector))
    }

    pub fn with_connector(options: ClientOptions, connector: Arc<dyn Connector>) -> Self {
        let auth_token = options.auth_token.clone();
        Self {
            inner: Arc::new(Inner {
                options,
                connector,
                auth_token: Mutex::new(auth_token),
                link: Mutex::new(Link {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    attempt: 0,
                    outgoing: None,
                    reader: None,
                    reconnect: None,
                }),
                connecting: tokio::sync::Mutex::new(()),
                pending: PendingRequests::new(),
                hello: Mutex::new(None),
                events: Listeners::new(),
                state_listeners: Listeners::new(),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.options.url
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.link).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Handshake result of the current connection.
    pub fn hello(&self) -> Option<HelloOk> {
        lock(&self.inner.hello).clone()
    }

    pub fn auth_token(&self) -> Option<String> {
        lock(&self.inner.auth_token).clone()
    }

    /// Token for the next handshake. Does not affect an open connection.
    pub fn set_auth_token(&self, token: Option<String>) {
        *lock(&self.inner.auth_token) = token;
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn on_state_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.inner.state_listeners.subscribe(listener)
    }

    /// Subscribe to every server event. Listeners filter for what they need
    /// and drop the subscription when their unit of work is done.
    pub fn add_event_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&GatewayEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    /// Open the socket and complete the handshake.
    ///
    /// Returns the cached handshake result if already connected. A failure
    /// here leaves the client disconnected and does not start the backoff
    /// loop; that only follows the loss of an established connection.
    pub async fn connect(&self) -> GatewayResult<HelloOk> {
        self.cancel_reconnect();
        let _guard = self.inner.connecting.lock().await;

        if self.is_connected() {
            if let Some(hello) = self.hello() {
                return Ok(hello);
            }
        }

        lock(&self.inner.link).attempt = 0;
        self.set_state(ConnectionState::Connecting, None);

        match self.establish().await {
            Ok(hello) => Ok(hello),
            Err(GatewayError::PairingRequired) => Err(GatewayError::PairingRequired),
            Err(err) => {
                warn!(url = %self.inner.options.url, error = %err, "gateway connect failed");
                if self.state() != ConnectionState::Disconnected {
                    self.set_state(ConnectionState::Disconnected, None);
                }
                Err(err)
            }
        }
    }

    /// Close the connection and stop any reconnect loop.
    ///
    /// All pending requests are rejected with `ConnectionClosed` before the
    /// `Disconnected` state is reported.
    pub fn disconnect(&self) {
        let previous = {
            let mut link = lock(&self.inner.link);
            if let Some(token) = link.reconnect.take() {
                token.cancel();
            }
            link.generation += 1;
            link.attempt = 0;
            link.outgoing = None;
            if let Some(reader) = link.reader.take() {
                reader.abort();
            }
            link.state
        };

        let rejected = self.inner.pending.reject_all(|| GatewayError::ConnectionClosed);
        lock(&self.inner.hello).take();

        if previous != ConnectionState::Disconnected {
            info!(rejected, "gateway disconnected by client");
            self.set_state(ConnectionState::Disconnected, None);
        }
    }

    /// Send a request and wait for its response payload.
    ///
    /// Fails immediately with `NotConnected` unless the client is in the
    /// connected state; nothing is queued.
    pub async fn request(&self, method: &str, params: Option<Value>) -> GatewayResult<Value> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        self.send_request(method, params).await
    }

    /// [`request`](Self::request) with typed params and payload.
    pub async fn request_as<P, R>(&self, method: &str, params: &P) -> GatewayResult<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let payload = self.request(method, Some(params)).await?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Request over any open socket, including one awaiting approval.
    pub(crate) async fn call(&self, method: &str, params: Option<Value>) -> GatewayResult<Value> {
        self.send_request(method, params).await
    }

    // ── Connection lifecycle ────────────────────────────────────────────────

    fn set_state(&self, state: ConnectionState, error: Option<GatewayError>) {
        let (previous, attempt) = {
            let mut link = lock(&self.inner.link);
            let previous = link.state;
            link.state = state;
            (previous, link.attempt)
        };
        info!(from = %previous, to = %state, attempt, "gateway connection state changed");
        self.inner.state_listeners.emit(&StateChange {
            state,
            attempt,
            error: error.map(Arc::new),
        });
    }

    fn cancel_reconnect(&self) {
        if let Some(token) = lock(&self.inner.link).reconnect.take() {
            token.cancel();
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.inner.link).generation == generation
    }

    /// Open a socket, install it, and handshake. Callers hold `connecting`.
    async fn establish(&self) -> GatewayResult<HelloOk> {
        let expected = lock(&self.inner.link).generation;
        let handle = self.inner.connector.open(&self.inner.options.url).await?;
        let generation = self
            .install(expected, handle)
            .ok_or(GatewayError::ConnectionClosed)?;

        match self.handshake().await {
            Ok(hello) => {
                {
                    let mut link = lock(&self.inner.link);
                    if link.generation != generation {
                        return Err(GatewayError::ConnectionClosed);
                    }
                    link.attempt = 0;
                    link.reconnect = None;
                }
                *lock(&self.inner.hello) = Some(hello.clone());
                info!(
                    protocol = hello.protocol,
                    gateway_version = %hello.gateway.version,
                    "gateway handshake complete"
                );
                self.set_state(ConnectionState::Connected, None);
                Ok(hello)
            }
            Err(GatewayError::Remote(shape)) if shape.requires_pairing() => {
                if !self.is_current(generation) {
                    return Err(GatewayError::ConnectionClosed);
                }
                info!(code = %shape.code, "gateway is waiting for device approval");
                self.set_state(ConnectionState::AwaitingApproval, None);
                Err(GatewayError::PairingRequired)
            }
            Err(err) => {
                self.abandon(generation);
                Err(err)
            }
        }
    }

    async fn handshake(&self) -> GatewayResult<HelloOk> {
        let options = &self.inner.options;
        let params = ConnectParams {
            min_protocol: MIN_PROTOCOL,
            max_protocol: MAX_PROTOCOL,
            client: options.client.clone(),
            role: options.role.clone(),
            device: options.device.clone(),
            caps: options.caps.clone(),
            auth: self.auth_token().map(|token| AuthParams { token: Some(token) }),
        };
        let payload = self
            .send_request(CONNECT_METHOD, Some(serde_json::to_value(&params)?))
            .await?;
        let hello: HelloOk = serde_json::from_value(payload)
            .map_err(|err| GatewayError::Handshake(format!("invalid hello payload: {err}")))?;
        if !(MIN_PROTOCOL..=MAX_PROTOCOL).contains(&hello.protocol) {
            return Err(GatewayError::Handshake(format!(
                "unsupported protocol version {}",
                hello.protocol
            )));
        }
        Ok(hello)
    }

    /// Make `handle` the live socket unless the link moved on while it was
    /// opening (e.g. `disconnect()` was called).
    fn install(&self, expected: u64, handle: TransportHandle) -> Option<u64> {
        let TransportHandle { outgoing, incoming } = handle;
        let mut link = lock(&self.inner.link);
        if link.generation != expected {
            debug!("dropping socket opened for a superseded connection");
            return None;
        }

        link.generation += 1;
        let generation = link.generation;
        if link.outgoing.replace(outgoing).is_some() {
            self.inner.pending.reject_all(|| GatewayError::ConnectionClosed);
        }
        if let Some(reader) = link.reader.take() {
            reader.abort();
        }
        self.inner.pending.restart_numbering();
        link.reader = Some(self.spawn_reader(generation, incoming));
        Some(generation)
    }

    /// Tear down a socket whose handshake failed.
    fn abandon(&self, generation: u64) {
        {
            let mut link = lock(&self.inner.link);
            if link.generation != generation {
                return;
            }
            link.generation += 1;
            link.outgoing = None;
            if let Some(reader) = link.reader.take() {
                reader.abort();
            }
        }
        self.inner.pending.reject_all(|| GatewayError::ConnectionClosed);
    }

    fn spawn_reader(
        &self,
        generation: u64,
        mut incoming: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let reason = loop {
                match incoming.recv().await {
                    Some(TransportEvent::Frame(text)) => {
                        let Some(client) = upgrade(&inner) else {
                            return;
                        };
                        client.handle_frame(generation, &text);
                    }
                    Some(TransportEvent::Closed(reason)) => break reason,
                    None => break None,
                }
            };
            if let Some(client) = upgrade(&inner) {
                client.handle_close(generation, reason);
            }
        })
    }

    fn handle_frame(&self, generation: u64, text: &str) {
        if !self.is_current(generation) {
            return;
        }
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "dropping malformed gateway frame");
                return;
            }
        };

        match frame {
            Frame::Response {
                id,
                ok,
                payload,
                error,
            } => {
                let reply = if ok {
                    Ok(payload.unwrap_or(Value::Null))
                } else {
                    Err(GatewayError::Remote(
                        error.unwrap_or_else(ErrorShape::unspecified),
                    ))
                };
                if !self.inner.pending.resolve(&id, reply) {
                    debug!(id = %id, "response for unknown request id");
                }
            }
            Frame::Event { event, payload } => match GatewayEvent::parse(&event, payload) {
                Ok(event) => {
                    debug!(event = event.name(), "gateway event");
                    self.inner.events.emit(&event);
                }
                Err(err) => {
                    warn!(event = %event, error = %err, "dropping event with unexpected payload")
                }
            },
            Frame::Request { method, .. } => {
                warn!(method = %method, "ignoring request frame sent by gateway");
            }
        }
    }

    fn handle_close(&self, generation: u64, reason: Option<String>) {
        let previous = {
            let mut link = lock(&self.inner.link);
            if link.generation != generation {
                return;
            }
            link.outgoing = None;
            link.reader = None;
            link.state
        };

        let rejected = self.inner.pending.reject_all(|| GatewayError::ConnectionClosed);
        info!(
            reason = reason.as_deref().unwrap_or("none"),
            rejected,
            state = %previous,
            "gateway socket closed"
        );

        match previous {
            ConnectionState::Connected => self.schedule_reconnect(),
            ConnectionState::AwaitingApproval => {
                self.set_state(ConnectionState::Disconnected, Some(GatewayError::ConnectionClosed));
            }
            // A handshake in flight sees its request rejected and reports
            // the failure itself.
            _ => {}
        }
    }

    fn schedule_reconnect(&self) {
        let token = CancellationToken::new();
        {
            let mut link = lock(&self.inner.link);
            if let Some(previous) = link.reconnect.replace(token.clone()) {
                previous.cancel();
            }
            link.attempt = 0;
        }
        tokio::spawn(reconnect_loop(Arc::downgrade(&self.inner), token));
    }

    // ── Requests ────────────────────────────────────────────────────────────

    async fn send_request(&self, method: &str, params: Option<Value>) -> GatewayResult<Value> {
        // Registration happens under the link lock so a concurrent close
        // either sees this waiter in `reject_all` or we see no socket.
        let (id, reply) = {
            let link = lock(&self.inner.link);
            let outgoing = link.outgoing.as_ref().ok_or(GatewayError::NotConnected)?;
            let (id, reply) = self.inner.pending.register();
            let text = match Frame::request(id.clone(), method, params).encode() {
                Ok(text) => text,
                Err(err) => {
                    self.inner.pending.remove(&id);
                    return Err(err.into());
                }
            };
            if outgoing.send(text).is_err() {
                self.inner.pending.remove(&id);
                return Err(GatewayError::ConnectionClosed);
            }
            (id, reply)
        };
        debug!(id = %id, method, "gateway request sent");

        let reply = match self.inner.options.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, reply).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.inner.pending.remove(&id);
                    warn!(id = %id, method, "gateway request timed out");
                    return Err(GatewayError::Timeout);
                }
            },
            None => reply.await,
        };
        reply.unwrap_or_else(|_| Err(GatewayError::ConnectionClosed))
    }
}

fn upgrade(inner: &Weak<Inner>) -> Option<GatewayClient> {
    inner.upgrade().map(|inner| GatewayClient { inner })
}

/// Retry with `base * 2^(n-1)` delays until a handshake succeeds, the
/// token is cancelled, or attempts run out.
async fn reconnect_loop(inner: Weak<Inner>, token: CancellationToken) {
    let Some(policy) = inner.upgrade().map(|inner| inner.options.reconnect.clone()) else {
        return;
    };
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let delay = policy.with_jitter(policy.backoff_delay(attempt));
        {
            let Some(client) = upgrade(&inner) else {
                return;
            };
            lock(&client.inner.link).attempt = attempt;
            client.set_state(ConnectionState::Reconnecting, None);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "gateway reconnect scheduled");
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let Some(client) = upgrade(&inner) else {
            return;
        };
        let _guard = client.inner.connecting.lock().await;
        if token.is_cancelled() {
            return;
        }
        match client.establish().await {
            Ok(_) | Err(GatewayError::PairingRequired) => return,
            Err(err) => warn!(attempt, error = %err, "gateway reconnect attempt failed"),
        }
    }

    let Some(client) = upgrade(&inner) else {
        return;
    };
    if token.is_cancelled() {
        return;
    }
    lock(&client.inner.link).reconnect = None;
    warn!(attempts = max_attempts, "gateway reconnect attempts exhausted");
    client.set_state(
        ConnectionState::Disconnected,
        Some(GatewayError::ReconnectExhausted {
            attempts: max_attempts,
        }),
    );
}
