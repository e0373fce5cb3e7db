//! Fan-out of game events to connected clients
//!
//! Every event goes through one `tokio::sync::broadcast` channel. An event
//! carries an optional room (a player address); client sessions forward
//! global events plus events for the room they joined.

use crate::models::GameTotals;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Global snapshot sent on every sync cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalSnapshot {
    /// `[total wagered, total won]`
    pub state: [u64; 2],
    pub queue_length: u64,
    pub hardware_connected: bool,
    pub seconds_to_round_end: i64,
}

impl GlobalSnapshot {
    pub fn new(
        totals: GameTotals,
        queue_length: u64,
        hardware_connected: bool,
        seconds_to_round_end: i64,
    ) -> Self {
        Self {
            state: [totals.wagered, totals.won],
            queue_length,
            hardware_connected,
            seconds_to_round_end,
        }
    }
}

/// Events pushed to clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    TurnStart { address: String },
    /// Sent to the new player's room only
    YourTurn,
    TurnEnd,
    PrizeWon { address: String },
    PlayerQueued,
    GameState { state: [u64; 2] },
    GlobalSync(GlobalSnapshot),
    PersonalSync { position: u64 },
    LinkStatus { connected: bool },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::TurnStart { .. } => "turn_start",
            ClientEvent::YourTurn => "your_turn",
            ClientEvent::TurnEnd => "turn_end",
            ClientEvent::PrizeWon { .. } => "prize_won",
            ClientEvent::PlayerQueued => "player_queued",
            ClientEvent::GameState { .. } => "game_state",
            ClientEvent::GlobalSync(_) => "global_sync",
            ClientEvent::PersonalSync { .. } => "personal_sync",
            ClientEvent::LinkStatus { .. } => "link_status",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub room: Option<String>,
    pub event: ClientEvent,
}

impl Envelope {
    /// Whether a client that joined `joined` should see this event
    pub fn is_visible_to(&self, joined: Option<&str>) -> bool {
        match &self.room {
            None => true,
            Some(room) => joined == Some(room.as_str()),
        }
    }
}

#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Envelope>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    /// Send to every client
    pub fn emit(&self, event: ClientEvent) {
        self.send(Envelope { room: None, event });
    }

    /// Send to the clients that joined `room`
    pub fn emit_to(&self, room: &str, event: ClientEvent) {
        self.send(Envelope {
            room: Some(room.to_string()),
            event,
        });
    }

    fn send(&self, envelope: Envelope) {
        let name = envelope.event.name();
        if let Err(e) = self.tx.send(envelope) {
            debug!("No clients to receive {} event: {}", name, e);
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}
