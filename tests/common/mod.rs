//! In-memory gateway used by the integration tests.
//!
//! `FakeConnector` hands every opened socket's server side to the test
//! through a channel, so a test plays the gateway frame by frame.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use clawlink::gateway::protocol::{ClientInfo, DeviceInfo};
use clawlink::gateway::{ClientOptions, Connector, GatewayClient, TransportEvent, TransportHandle};
use clawlink::{GatewayError, GatewayResult};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const DEVICE_ID: &str = "dev-1";

pub struct FakeConnector {
    accepted: mpsc::UnboundedSender<ServerEnd>,
    refuse: AtomicBool,
    opens: Mutex<Vec<Instant>>,
}

impl FakeConnector {
    /// Make subsequent opens fail with a transport error.
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// When each open was attempted.
    pub fn opens(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, _url: &str) -> GatewayResult<TransportHandle> {
        self.opens.lock().unwrap().push(Instant::now());
        if self.refuse.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("connection refused".into()));
        }
        let (outgoing, from_client) = mpsc::unbounded_channel();
        let (to_client, incoming) = mpsc::unbounded_channel();
        let _ = self.accepted.send(ServerEnd {
            from_client,
            to_client,
        });
        Ok(TransportHandle { outgoing, incoming })
    }
}

pub fn fake_gateway() -> (Arc<FakeConnector>, mpsc::UnboundedReceiver<ServerEnd>) {
    let (accepted, sockets) = mpsc::unbounded_channel();
    let connector = Arc::new(FakeConnector {
        accepted,
        refuse: AtomicBool::new(false),
        opens: Mutex::new(Vec::new()),
    });
    (connector, sockets)
}

/// A request as the gateway received it.
#[derive(Debug)]
pub struct Received {
    pub id: String,
    pub method: String,
    pub params: Value,
}

/// Gateway side of one socket.
pub struct ServerEnd {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<TransportEvent>,
}

impl ServerEnd {
    /// Next frame sent by the client; `None` once the client dropped the socket.
    pub async fn next_frame(&mut self) -> Option<Value> {
        let text = self.from_client.recv().await?;
        Some(serde_json::from_str(&text).expect("client sent invalid JSON"))
    }

    pub async fn next_request(&mut self) -> Received {
        let frame = self.next_frame().await.expect("socket closed");
        assert_eq!(frame["type"], "req", "expected a request frame: {frame}");
        Received {
            id: frame["id"].as_str().unwrap().to_string(),
            method: frame["method"].as_str().unwrap().to_string(),
            params: frame.get("params").cloned().unwrap_or(Value::Null),
        }
    }

    /// Resolves once the client has closed its side.
    pub async fn closed_by_client(&mut self) {
        while self.from_client.recv().await.is_some() {}
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.to_client.send(TransportEvent::Frame(text.to_string()));
    }

    pub fn reply_ok(&self, id: &str, payload: Value) {
        let frame = json!({"type": "res", "id": id, "ok": true, "payload": payload});
        self.send_raw(&frame.to_string());
    }

    pub fn reply_err(&self, id: &str, code: &str, message: &str) {
        self.send_raw(
            &json!({
                "type": "res",
                "id": id,
                "ok": false,
                "error": {"code": code, "message": message}
            })
            .to_string(),
        );
    }

    pub fn push_event(&self, event: &str, payload: Value) {
        self.send_raw(&json!({"type": "event", "event": event, "payload": payload}).to_string());
    }

    pub fn close(&self, reason: Option<&str>) {
        let _ = self
            .to_client
            .send(TransportEvent::Closed(reason.map(str::to_owned)));
    }

    /// Answer the `connect` handshake successfully; returns its params.
    pub async fn complete_handshake(&mut self) -> Value {
        let request = self.next_request().await;
        assert_eq!(request.method, "connect");
        self.reply_ok(&request.id, hello());
        request.params
    }

    /// Answer the `connect` handshake with `NOT_PAIRED`; returns its params.
    pub async fn refuse_unpaired(&mut self) -> Value {
        let request = self.next_request().await;
        assert_eq!(request.method, "connect");
        self.reply_err(&request.id, "NOT_PAIRED", "device is not paired");
        request.params
    }
}

pub fn hello() -> Value {
    json!({
        "protocol": 3,
        "gateway": {"version": "2026.2.1", "capabilities": ["sessions", "chat"]},
        "snapshot": {"sessions": 2}
    })
}

pub fn options() -> ClientOptions {
    ClientOptions::new(
        "ws://gateway.test/ws",
        ClientInfo {
            id: "clawlink".into(),
            display_name: Some("clawlink tests".into()),
            version: "0.1.0".into(),
            platform: "linux".into(),
            mode: "cli".into(),
        },
        DeviceInfo {
            id: DEVICE_ID.into(),
            name: "test device".into(),
        },
    )
}

/// Client connected to a fresh fake gateway.
pub async fn connected_client(
    options: ClientOptions,
) -> (
    GatewayClient,
    ServerEnd,
    Arc<FakeConnector>,
    mpsc::UnboundedReceiver<ServerEnd>,
) {
    let (connector, mut sockets) = fake_gateway();
    let client = GatewayClient::with_connector(options, connector.clone());
    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    let mut server = sockets.recv().await.expect("client never opened a socket");
    server.complete_handshake().await;
    connecting.await.unwrap().expect("handshake failed");
    (client, server, connector, sockets)
}
