//! Turn scheduler
//!
//! A polling loop that ends turns the hardware never reported on and starts
//! the next one. Each tick takes the slot lock, so a tick and a hardware
//! event can never both promote an entry.

use crate::{engine::Advance, engine::Engine, errors::ArcadeResult, metrics::CloseSource};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Rollover in progress; the slot was left alone
    RoundChanging,
    /// The current turn window has not elapsed
    Busy,
    /// Nobody was waiting
    Idle,
    /// This entry now holds the slot
    Started(u64),
}

pub struct TurnScheduler {
    engine: Arc<Engine>,
}

impl TurnScheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// One scheduling step
    pub async fn tick(&self) -> ArcadeResult<TickOutcome> {
        let engine = &self.engine;
        if engine.state.is_round_changing() {
            return Ok(TickOutcome::RoundChanging);
        }

        let mut slot = engine.state.lock_slot().await;
        // Re-check under the lock; a rollover may have begun while we waited
        if engine.state.is_round_changing() {
            return Ok(TickOutcome::RoundChanging);
        }
        if let Some(elapsed) = slot.elapsed() {
            if elapsed < engine.config.turn_window() {
                return Ok(TickOutcome::Busy);
            }
        }

        let closed = engine.close_current(&mut slot, CloseSource::Scheduler).await?;
        if closed.is_some() {
            info!("Turn expired without a hardware report");
        }
        engine.close_orphans(&slot).await?;

        Ok(match engine.advance(&mut slot, closed.is_some()).await? {
            Advance::Paused => TickOutcome::RoundChanging,
            Advance::Idle => TickOutcome::Idle,
            Advance::Started(entry) => TickOutcome::Started(entry.id),
        })
    }

    /// Run until `shutdown` flips. A failed tick is logged and retried after
    /// the configured backoff.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Turn scheduler started");
        let config = self.engine.config.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.tick().await {
                Ok(TickOutcome::Idle) => config.inter_turn_delay().max(config.scheduler_poll()),
                Ok(outcome) => {
                    debug!(?outcome, "Scheduler tick");
                    config.scheduler_poll()
                }
                Err(e) => {
                    error!("Scheduler tick failed: {}", e);
                    config.error_backoff()
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("Turn scheduler stopped");
    }
}
