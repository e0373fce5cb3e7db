//! Periodic state broadcast
//!
//! Every period the loop sends a global snapshot to all clients and each
//! queued player's position to that player's room. The time spent building
//! a cycle is subtracted from the following sleep so the cadence does not
//! drift.

use crate::{
    broadcast::{ClientEvent, GlobalSnapshot},
    engine::Engine,
    errors::ArcadeResult,
    rounds::seconds_until_boundary,
};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub struct SyncBroadcaster {
    engine: Arc<Engine>,
}

impl SyncBroadcaster {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Build and send one round of sync events
    pub async fn cycle(&self) -> ArcadeResult<GlobalSnapshot> {
        let engine = &self.engine;

        match engine.settlement.client().game_totals().await {
            Ok(totals) => engine.state.set_totals(totals),
            Err(e) => warn!("Keeping last known totals: {}", e),
        }

        let queued = engine.store.queued_entries().await?;
        let snapshot = GlobalSnapshot::new(
            engine.state.totals(),
            queued.len() as u64,
            engine.hardware.is_healthy(),
            seconds_until_boundary(Utc::now(), engine.config.round_boundary_hour_utc),
        );
        engine.metrics.set_queue_length(snapshot.queue_length);
        engine.broadcaster.emit(ClientEvent::GlobalSync(snapshot.clone()));

        for (i, entry) in queued.iter().enumerate() {
            engine.broadcaster.emit_to(
                &entry.address,
                ClientEvent::PersonalSync {
                    position: i as u64 + 1,
                },
            );
        }

        debug!(queue_length = snapshot.queue_length, "Sync broadcast sent");
        Ok(snapshot)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = self.engine.config.sync_period();
        info!(?period, "Sync broadcaster started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            if let Err(e) = self.cycle().await {
                error!("Sync cycle failed: {}", e);
            }
            let pause = period.saturating_sub(started.elapsed());

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("Sync broadcaster stopped");
    }
}
