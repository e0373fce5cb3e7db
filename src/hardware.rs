//! Link to the physical machine controller
//!
//! `HardwareLink` is the outbound half used by the engine: `emit` never fails
//! loudly, it reports whether the command was handed to the driver.
//! `HardwareDriver` owns the WebSocket connection, reconnects forever and
//! turns controller frames and connectivity changes into `HardwareEvent`s on
//! one ordered channel.

use crate::errors::HardwareError;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Connectivity flags: transport connected and controller namespace ready
#[derive(Debug, Default)]
pub struct LinkHealth {
    transport: AtomicBool,
    namespace: AtomicBool,
}

impl LinkHealth {
    pub fn is_healthy(&self) -> bool {
        self.transport.load(Ordering::SeqCst) && self.namespace.load(Ordering::SeqCst)
    }

    pub fn transport_connected(&self) -> bool {
        self.transport.load(Ordering::SeqCst)
    }

    pub fn namespace_ready(&self) -> bool {
        self.namespace.load(Ordering::SeqCst)
    }

    pub fn set(&self, transport: bool, namespace: bool) {
        self.transport.store(transport, Ordering::SeqCst);
        self.namespace.store(namespace, Ordering::SeqCst);
    }
}

/// Commands sent to the controller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum HardwareCommand {
    TurnStart,
    Move { bitmask: u32 },
}

/// Everything the reconciler learns from the link, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum HardwareEvent {
    /// Controller reported the turn over; stamped when the frame arrived
    TurnEnd { received_at: Instant },
    PrizeWon,
    Connect,
    ConnectError(String),
    Disconnect(String),
}

impl HardwareEvent {
    pub fn turn_end() -> Self {
        HardwareEvent::TurnEnd {
            received_at: Instant::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
}

/// Decode a controller frame; unknown frame types yield `None`
pub fn parse_frame(text: &str) -> Result<Option<HardwareEvent>, HardwareError> {
    let frame: InboundFrame =
        serde_json::from_str(text).map_err(|e| HardwareError::MalformedFrame(e.to_string()))?;
    Ok(match frame.kind.as_str() {
        "turn_end" => Some(HardwareEvent::turn_end()),
        "prize_won" => Some(HardwareEvent::PrizeWon),
        other => {
            debug!(frame = other, "Ignoring controller frame");
            None
        }
    })
}

/// Outbound handle to the controller
#[derive(Clone)]
pub struct HardwareLink {
    health: Arc<LinkHealth>,
    commands: mpsc::Sender<HardwareCommand>,
}

impl HardwareLink {
    /// Create a link and the command queue its driver drains
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<HardwareCommand>) {
        let (commands, rx) = mpsc::channel(buffer);
        (
            Self {
                health: Arc::new(LinkHealth::default()),
                commands,
            },
            rx,
        )
    }

    pub fn health(&self) -> &LinkHealth {
        &self.health
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    /// Queue a command for the controller if the link is healthy
    pub fn emit(&self, command: HardwareCommand) -> bool {
        if !self.health.is_healthy() {
            warn!(?command, "Hardware link down, command not forwarded");
            return false;
        }
        match self.commands.try_send(command) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to queue hardware command: {}", e);
                false
            }
        }
    }
}

pub struct HardwareDriver {
    url: String,
    reconnect_delay: Duration,
    commands: mpsc::Receiver<HardwareCommand>,
    events: mpsc::Sender<HardwareEvent>,
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

impl HardwareDriver {
    pub fn new(
        url: impl Into<String>,
        reconnect_delay: Duration,
        commands: mpsc::Receiver<HardwareCommand>,
        events: mpsc::Sender<HardwareEvent>,
    ) -> Self {
        Self {
            url: url.into(),
            reconnect_delay,
            commands,
            events,
        }
    }

    /// Connect, serve, reconnect; returns only on shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(url = %self.url, "Hardware driver started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = tokio::select! {
                result = connect_async(self.url.as_str()) => Some(result),
                _ = shutdown.changed() => None,
            };

            match outcome {
                None => break,
                Some(Ok((socket, _response))) => {
                    info!("Hardware link connected");
                    self.report(HardwareEvent::Connect).await;
                    match self.serve(socket, &mut shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(reason) => {
                            warn!(%reason, "Hardware link disconnected");
                            self.report(HardwareEvent::Disconnect(reason)).await;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!("Hardware connect error: {}", e);
                    self.report(HardwareEvent::ConnectError(e.to_string())).await;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("Hardware driver stopped");
    }

    async fn serve<S>(
        &mut self,
        socket: tokio_tungstenite::WebSocketStream<S>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = socket.split();
        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                        Ok(Some(event)) => self.report(event).await,
                        Ok(None) => {}
                        Err(e) => warn!("{}", e),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map_or_else(|| "closed".to_string(), |f| f.reason.to_string());
                        return SessionEnd::Lost(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("stream ended".to_string()),
                },
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return SessionEnd::Shutdown;
                    };
                    let text = match serde_json::to_string(&command) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode hardware command: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                }
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    async fn report(&self, event: HardwareEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Hardware event dropped, reconciler gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frames() {
        assert!(matches!(
            parse_frame(r#"{"type":"turn_end"}"#).unwrap(),
            Some(HardwareEvent::TurnEnd { .. })
        ));
        assert_eq!(
            parse_frame(r#"{"type":"prize_won","data":{}}"#).unwrap(),
            Some(HardwareEvent::PrizeWon)
        );
        assert_eq!(parse_frame(r#"{"type":"heartbeat"}"#).unwrap(), None);
        assert!(parse_frame("not json").is_err());
    }

    #[test]
    fn test_command_wire_format() {
        let json = serde_json::to_value(HardwareCommand::Move { bitmask: 5 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "move", "data": {"bitmask": 5}}));

        let json = serde_json::to_value(HardwareCommand::TurnStart).unwrap();
        assert_eq!(json["type"], "turn_start");
    }

    #[tokio::test]
    async fn test_emit_gated_on_health() {
        let (link, mut rx) = HardwareLink::new(4);
        assert!(!link.emit(HardwareCommand::TurnStart));

        link.health().set(true, false);
        assert!(!link.emit(HardwareCommand::TurnStart));

        link.health().set(true, true);
        assert!(link.emit(HardwareCommand::TurnStart));
        assert_eq!(rx.recv().await, Some(HardwareCommand::TurnStart));
    }

    #[tokio::test]
    async fn test_emit_full_queue_returns_false() {
        let (link, _rx) = HardwareLink::new(1);
        link.health().set(true, true);
        assert!(link.emit(HardwareCommand::TurnStart));
        assert!(!link.emit(HardwareCommand::TurnStart));
    }
}
