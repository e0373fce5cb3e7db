//! Shared fixtures for integration tests
#![allow(dead_code)]

use claw_arcade::{
    broadcast::{Broadcaster, ClientEvent, Envelope},
    config::GameConfig,
    engine::Engine,
    hardware::{HardwareCommand, HardwareLink},
    lobby::{JoinRequest, Lobby},
    metrics::ArcadeMetrics,
    queue_store::{InMemoryQueueStore, QueueStore},
    settlement::{RetryPolicy, RetryingSettlement, SettlementClient, SimulatedLedger},
    state::ProcessState,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

pub struct Harness {
    pub engine: Arc<Engine>,
    pub ledger: Arc<SimulatedLedger>,
    pub commands: mpsc::Receiver<HardwareCommand>,
    pub events: broadcast::Receiver<Envelope>,
}

impl Harness {
    pub fn lobby(&self) -> Lobby {
        Lobby::new(self.engine.clone())
    }

    /// Queue `address` through the normal bet-then-insert path
    pub async fn join(&self, address: &str) -> u64 {
        self.lobby()
            .join_queue(address, join_request(20))
            .await
            .expect("join_queue failed")
    }

    /// Every event broadcast since the last drain
    pub fn drain_events(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = self.events.try_recv() {
            out.push(envelope);
        }
        out
    }

    pub fn drain_event_names(&mut self) -> Vec<&'static str> {
        self.drain_events().iter().map(|e| e.event.name()).collect()
    }
}

/// 30 second turns, 3 second inter-turn delay
pub fn game_config() -> GameConfig {
    GameConfig {
        turn_duration_secs: 30,
        inter_turn_delay_secs: 3,
        sync_period_secs: 1,
        ..GameConfig::default()
    }
}

pub fn join_request(amount: u64) -> JoinRequest {
    JoinRequest {
        amount,
        deadline: 1_900_000_000,
        signature: "0xsig".to_string(),
    }
}

pub async fn harness() -> Harness {
    harness_with(Arc::new(InMemoryQueueStore::new()), game_config()).await
}

pub async fn harness_with(store: Arc<dyn QueueStore>, config: GameConfig) -> Harness {
    let ledger = Arc::new(SimulatedLedger::new());
    harness_with_ledger(store, config, ledger).await
}

pub async fn harness_with_ledger(
    store: Arc<dyn QueueStore>,
    config: GameConfig,
    ledger: Arc<SimulatedLedger>,
) -> Harness {
    store
        .ensure_first_round(config.default_max_fee, config.default_fee_growth)
        .await
        .expect("first round");

    let (hardware, commands) = HardwareLink::new(64);
    let broadcaster = Broadcaster::new(4096);
    let events = broadcaster.subscribe();
    let client: Arc<dyn SettlementClient> = ledger.clone();

    let engine = Arc::new(Engine {
        store,
        state: Arc::new(ProcessState::new()),
        broadcaster,
        hardware,
        settlement: RetryingSettlement::new(client, RetryPolicy::default()),
        config,
        metrics: ArcadeMetrics::new().expect("metrics"),
    });

    Harness {
        engine,
        ledger,
        commands,
        events,
    }
}

pub fn is_turn_start_for(envelope: &Envelope, address: &str) -> bool {
    matches!(&envelope.event, ClientEvent::TurnStart { address: a } if a == address)
}
