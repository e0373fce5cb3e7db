//! Client sessions over WebSocket
//!
//! Each browser client gets one socket. It receives every global event plus
//! the events for the room (player address) it joined with
//! `wallet_connected`, and sends requests as
//! `{"type": ..., "request_id": ..., "data": ...}`.

use super::handlers::AppState;
use crate::{
    broadcast::{Broadcaster, ClientEvent},
    errors::{ArcadeError, QueueError},
    lobby::{JoinRequest, Lobby},
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Inbound request frame
#[derive(Debug, Deserialize)]
pub struct RequestFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
struct WalletData {
    address: String,
}

#[derive(Debug, Deserialize)]
struct MoveData {
    bitmask: u32,
}

fn error_reply(err: &ArcadeError) -> Value {
    json!({ "status": "error", "code": err.code(), "message": err.to_string() })
}

fn bad_request(message: String) -> Value {
    json!({ "status": "error", "code": "bad_request", "message": message })
}

/// Tracks sessions and the room each one joined
#[derive(Clone)]
pub struct SessionManager {
    broadcaster: Broadcaster,
    lobby: Lobby,
    rooms: Arc<DashMap<u64, String>>,
    client_count: Arc<AtomicU64>,
    next_client_id: Arc<AtomicU64>,
}

impl SessionManager {
    pub fn new(lobby: Lobby) -> Self {
        Self {
            broadcaster: lobby.engine().broadcaster.clone(),
            lobby,
            rooms: Arc::new(DashMap::new()),
            client_count: Arc::new(AtomicU64::new(0)),
            next_client_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn client_count(&self) -> u64 {
        self.client_count.load(Ordering::SeqCst)
    }

    /// Allocate an id for a new session
    pub fn register(&self) -> u64 {
        let client_id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        let total = self.client_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.lobby.engine().metrics.client_connected();
        info!(client_id, total, "Client connected");
        client_id
    }

    pub fn unregister(&self, client_id: u64) {
        self.rooms.remove(&client_id);
        let remaining = self.client_count.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        self.lobby.engine().metrics.client_disconnected();
        info!(client_id, remaining, "Client disconnected");
    }

    /// Address the session joined, if any
    pub fn room_of(&self, client_id: u64) -> Option<String> {
        self.rooms.get(&client_id).map(|r| r.value().clone())
    }

    /// Events a fresh session receives before anything else
    pub fn welcome_events(&self) -> Vec<ClientEvent> {
        let engine = self.lobby.engine();
        let totals = engine.state.totals();
        vec![
            ClientEvent::GameState {
                state: [totals.wagered, totals.won],
            },
            ClientEvent::LinkStatus {
                connected: engine.hardware.is_healthy(),
            },
        ]
    }

    /// Handle one client request and build its reply.
    ///
    /// Requests that move funds run on their own task so they finish and
    /// persist even if the session is torn down while they are in flight.
    pub async fn dispatch(&self, client_id: u64, frame: RequestFrame) -> Value {
        if matches!(frame.kind.as_str(), "join_queue" | "withdraw") {
            let manager = self.clone();
            let request_id = frame.request_id.clone();
            let handle =
                tokio::spawn(async move { manager.handle_request(client_id, frame).await });
            return match handle.await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(client_id, "Request task failed: {}", e);
                    let mut reply = json!({
                        "type": "reply",
                        "status": "error",
                        "code": "internal",
                    });
                    if let Some(request_id) = request_id {
                        reply["request_id"] = json!(request_id);
                    }
                    reply
                }
            };
        }
        self.handle_request(client_id, frame).await
    }

    async fn handle_request(&self, client_id: u64, frame: RequestFrame) -> Value {
        let mut reply = match frame.kind.as_str() {
            "wallet_connected" => match serde_json::from_value::<WalletData>(frame.data) {
                Ok(data) => {
                    self.rooms.insert(client_id, data.address.clone());
                    match self.lobby.wallet_connected(&data.address).await {
                        Ok(status) => json!({ "status": "ok", "data": status }),
                        Err(e) => error_reply(&e),
                    }
                }
                Err(e) => bad_request(e.to_string()),
            },
            "wallet_disconnected" => {
                self.rooms.remove(&client_id);
                json!({ "status": "ok" })
            }
            "join_queue" => match serde_json::from_value::<JoinRequest>(frame.data) {
                Ok(request) => {
                    let result = match self.room_of(client_id) {
                        Some(address) => self.lobby.join_queue(&address, request).await,
                        None => Err(QueueError::WalletNotConnected.into()),
                    };
                    match result {
                        Ok(position) => json!({ "status": "ok", "position": position }),
                        Err(e) => {
                            let mut reply = error_reply(&e);
                            reply["position"] = json!(-1);
                            reply
                        }
                    }
                }
                Err(e) => {
                    let mut reply = bad_request(e.to_string());
                    reply["position"] = json!(-1);
                    reply
                }
            },
            "move" => match serde_json::from_value::<MoveData>(frame.data) {
                Ok(data) => {
                    let forwarded = self
                        .room_of(client_id)
                        .map_or(false, |address| self.lobby.request_move(&address, data.bitmask));
                    if forwarded {
                        json!({ "status": "ok" })
                    } else {
                        json!({ "status": "error", "code": "not_your_turn" })
                    }
                }
                Err(e) => bad_request(e.to_string()),
            },
            "withdraw" => match self.room_of(client_id) {
                Some(address) => match self.lobby.withdraw(&address).await {
                    Ok(withdrawal) => json!({ "status": "ok", "data": { "withdrawn": withdrawal.amount } }),
                    Err(e) => error_reply(&e),
                },
                None => error_reply(&QueueError::WalletNotConnected.into()),
            },
            "check_balance" => {
                let result = match self.room_of(client_id) {
                    Some(address) => self.lobby.check_balance(&address).await,
                    None => Err(QueueError::WalletNotConnected.into()),
                };
                match result {
                    Ok(balance) => json!({ "status": "ok", "balance": balance }),
                    Err(e) => {
                        let mut reply = error_reply(&e);
                        reply["balance"] = json!(-1);
                        reply
                    }
                }
            }
            other => {
                debug!(client_id, request = other, "Unknown request type");
                json!({ "status": "error", "code": "unknown_request" })
            }
        };

        reply["type"] = json!("reply");
        if let Some(request_id) = frame.request_id {
            reply["request_id"] = json!(request_id);
        }
        reply
    }

    pub async fn handle_upgrade(&self, ws: WebSocketUpgrade) -> Response {
        let manager = self.clone();
        ws.on_upgrade(move |socket| async move { manager.handle_connection(socket).await })
    }

    async fn handle_connection(&self, socket: WebSocket) {
        let client_id = self.register();
        let (mut sender, mut receiver) = socket.split();
        let mut events = self.broadcaster.subscribe();
        let (reply_tx, mut reply_rx) = mpsc::channel::<Value>(32);

        for event in self.welcome_events() {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sender.send(Message::Text(text)).await.is_err() {
                self.unregister(client_id);
                return;
            }
        }

        let manager = self.clone();
        let mut receive_task = tokio::spawn(async move {
            while let Some(msg) = receiver.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let reply = match serde_json::from_str::<RequestFrame>(&text) {
                            Ok(frame) => manager.dispatch(client_id, frame).await,
                            Err(e) => bad_request(e.to_string()),
                        };
                        if reply_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!(client_id, "Client requested close");
                        break;
                    }
                    Err(e) => {
                        warn!(client_id, "WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        let manager = self.clone();
        let mut send_task = tokio::spawn(async move {
            loop {
                let outgoing = tokio::select! {
                    event = events.recv() => match event {
                        Ok(envelope) => {
                            if !envelope.is_visible_to(manager.room_of(client_id).as_deref()) {
                                continue;
                            }
                            serde_json::to_string(&envelope.event)
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(client_id, skipped, "Client lagging, events dropped");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    reply = reply_rx.recv() => match reply {
                        Some(reply) => serde_json::to_string(&reply),
                        None => break,
                    },
                };

                let text = match outgoing {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to serialize outgoing message: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        tokio::select! {
            _ = &mut receive_task => send_task.abort(),
            _ = &mut send_task => receive_task.abort(),
        }

        self.unregister(client_id);
    }
}

/// WebSocket endpoint handler
/// GET /ws
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    state.sessions.handle_upgrade(ws).await
}
