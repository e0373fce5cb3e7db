//! Hardware reconciliation
//!
//! Consumes controller events one at a time from a single queue, so events
//! are applied in arrival order. Slot changes take the same lock as the
//! scheduler.

use crate::{
    broadcast::ClientEvent,
    engine::Engine,
    errors::ArcadeResult,
    hardware::HardwareEvent,
    metrics::{anomaly, CloseSource},
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub struct Reconciler {
    engine: Arc<Engine>,
    events: mpsc::Receiver<HardwareEvent>,
}

impl Reconciler {
    pub fn new(engine: Arc<Engine>, events: mpsc::Receiver<HardwareEvent>) -> Self {
        Self { engine, events }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Hardware reconciler started");
        loop {
            let event = tokio::select! {
                event = self.events.recv() => event,
                _ = shutdown.changed() => None,
            };
            let Some(event) = event else {
                break;
            };
            if let Err(e) = handle_event(&self.engine, event).await {
                error!("Hardware event handling failed: {}", e);
            }
        }
        info!("Hardware reconciler stopped");
    }
}

/// Apply one hardware event
pub async fn handle_event(engine: &Arc<Engine>, event: HardwareEvent) -> ArcadeResult<()> {
    debug!(?event, "Hardware event");
    match event {
        HardwareEvent::TurnEnd { received_at } => on_turn_end(engine, received_at).await,
        HardwareEvent::PrizeWon => on_prize_won(engine).await,
        HardwareEvent::Connect => {
            engine.hardware.health().set(true, true);
            publish_link_status(engine);
            Ok(())
        }
        HardwareEvent::ConnectError(reason) => {
            warn!(%reason, "Hardware link connect error");
            engine.hardware.health().set(false, false);
            publish_link_status(engine);
            Ok(())
        }
        HardwareEvent::Disconnect(reason) => {
            warn!(%reason, "Hardware link disconnected");
            engine.hardware.health().set(false, false);
            publish_link_status(engine);
            Ok(())
        }
    }
}

fn publish_link_status(engine: &Engine) {
    engine.broadcaster.emit(ClientEvent::LinkStatus {
        connected: engine.hardware.is_healthy(),
    });
}

async fn on_turn_end(engine: &Arc<Engine>, received_at: Instant) -> ArcadeResult<()> {
    let mut slot = engine.state.lock_slot().await;

    // A report received before the current turn started belongs to the turn
    // before it, which the scheduler closed while this event waited on the lock
    if slot.current_player().is_some() {
        if let Some(started_at) = slot.turn_started_at() {
            if received_at < started_at {
                warn!(
                    anomaly = anomaly::STALE_TURN_END,
                    early_by = ?(started_at - received_at),
                    "Ignoring turn_end for a finished turn"
                );
                engine.metrics.anomaly(anomaly::STALE_TURN_END);
                return Ok(());
            }
        }
    }

    let closed = engine.close_current(&mut slot, CloseSource::Hardware).await?;
    if closed.is_none() {
        warn!(
            anomaly = anomaly::UNMATCHED_TURN_END,
            player = ?slot.current_player(),
            "turn_end with no matching active entry"
        );
        engine.metrics.anomaly(anomaly::UNMATCHED_TURN_END);
    }

    engine.advance(&mut slot, true).await?;
    Ok(())
}

async fn on_prize_won(engine: &Arc<Engine>) -> ArcadeResult<()> {
    let mut slot = engine.state.lock_slot().await;

    let Some(key) = slot.current_key().cloned() else {
        info!("prize_won with no active settlement key, ignoring");
        return Ok(());
    };
    let address = slot.current_player().unwrap_or_default().to_string();

    if !slot.record_win() {
        warn!(anomaly = anomaly::DOUBLE_WIN, %address, "Second prize_won for the same turn");
        engine.metrics.anomaly(anomaly::DOUBLE_WIN);
        return Ok(());
    }

    if let Some(entry_id) = slot.current_entry_id() {
        if let Some(mut entry) = engine.store.entry(entry_id).await? {
            entry.win = true;
            engine.store.save_entry(&entry).await?;
        }
    }
    drop(slot);

    info!(%address, %key, "Prize won");
    engine.broadcaster.emit(ClientEvent::PrizeWon {
        address: address.clone(),
    });

    let settlement = engine.settlement.clone();
    let metrics = engine.metrics.clone();
    tokio::spawn(async move {
        match settlement.client().notify_win(&key).await {
            Ok(()) => info!(%address, %key, "Win settled"),
            Err(e) => {
                error!(%address, %key, "Win settlement failed: {}", e);
                metrics.settlement_failure("notify_win");
            }
        }
    });

    Ok(())
}
