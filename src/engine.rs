//! Shared turn-transition logic
//!
//! `Engine` bundles the collaborators the core loops need. The scheduler and
//! the hardware reconciler both drive the slot through the same two steps,
//! `close_current` then `advance`, always while holding the slot lock:
//!
//! close old entry, commit, select next, mark active, commit, broadcast
//! `turn_end`, inter-turn delay, take the slot, stamp played-at, commit,
//! broadcast `turn_start`, forward the start command.

use crate::{
    broadcast::{Broadcaster, ClientEvent},
    config::GameConfig,
    errors::ArcadeResult,
    hardware::{HardwareCommand, HardwareLink},
    metrics::{anomaly, ArcadeMetrics, CloseSource},
    models::QueueEntry,
    queue_store::QueueStore,
    settlement::RetryingSettlement,
    state::{ProcessState, SlotGuard},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of trying to hand the slot to the next player
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// A round rollover is in progress; nobody was promoted
    Paused,
    /// Nobody is waiting for this round
    Idle,
    Started(QueueEntry),
}

pub struct Engine {
    pub store: Arc<dyn QueueStore>,
    pub state: Arc<ProcessState>,
    pub broadcaster: Broadcaster,
    pub hardware: HardwareLink,
    pub settlement: RetryingSettlement,
    pub config: GameConfig,
    pub metrics: ArcadeMetrics,
}

impl Engine {
    /// Force every entry left active by a previous process to played.
    /// Must run before any loop starts.
    pub async fn recover(&self) -> ArcadeResult<usize> {
        let _slot = self.state.lock_slot().await;
        let stale = self.store.active_entries().await?;
        let now = Utc::now();
        for mut entry in stale.iter().cloned() {
            entry.finish(now);
            self.store.save_entry(&entry).await?;
            self.metrics.turn_closed(CloseSource::Recovery);
            info!(entry_id = entry.id, address = %entry.address, "Recovered abandoned turn");
        }
        Ok(stale.len())
    }

    /// Close the active entry of the slot's current player, if any
    pub async fn close_current(
        &self,
        slot: &mut SlotGuard<'_>,
        source: CloseSource,
    ) -> ArcadeResult<Option<QueueEntry>> {
        let Some(address) = slot.current_player().map(str::to_string) else {
            return Ok(None);
        };
        let Some(mut entry) = self.store.active_entry_for(&address).await? else {
            debug!(%address, "No active entry to close");
            return Ok(None);
        };

        entry.finish(Utc::now());
        self.store.save_entry(&entry).await?;
        slot.clear();
        self.metrics.turn_closed(source);
        info!(entry_id = entry.id, %address, ?source, "Turn closed");
        Ok(Some(entry))
    }

    /// Close active entries the slot does not know about. They can only come
    /// from a transition that failed between its commits.
    pub async fn close_orphans(&self, slot: &SlotGuard<'_>) -> ArcadeResult<usize> {
        let current = slot.current_entry_id();
        let now = Utc::now();
        let mut closed = 0;
        for mut entry in self.store.active_entries().await? {
            if Some(entry.id) == current {
                continue;
            }
            warn!(anomaly = anomaly::ORPHANED_ACTIVE, entry_id = entry.id, address = %entry.address, "Closing orphaned active entry");
            self.metrics.anomaly(anomaly::ORPHANED_ACTIVE);
            entry.finish(now);
            self.store.save_entry(&entry).await?;
            self.metrics.turn_closed(CloseSource::Scheduler);
            closed += 1;
        }
        Ok(closed)
    }

    /// Promote the oldest queued entry of the current round.
    /// `closed` says whether a turn was just closed, which decides whether
    /// clients need a `turn_end` when nobody is waiting.
    pub async fn advance(&self, slot: &mut SlotGuard<'_>, closed: bool) -> ArcadeResult<Advance> {
        if self.state.is_round_changing() {
            slot.clear();
            if closed {
                self.broadcaster.emit(ClientEvent::TurnEnd);
            }
            return Ok(Advance::Paused);
        }

        let next = match self.store.current_round().await? {
            Some(round) => self.store.next_queued(round.id).await?,
            None => None,
        };

        let Some(mut entry) = next else {
            slot.clear();
            if closed {
                self.broadcaster.emit(ClientEvent::TurnEnd);
            }
            return Ok(Advance::Idle);
        };

        entry.activate();
        self.store.save_entry(&entry).await?;
        self.broadcaster.emit(ClientEvent::TurnEnd);

        tokio::time::sleep(self.config.inter_turn_delay()).await;

        slot.begin_turn(&entry);
        entry.played_at = Some(Utc::now());
        self.store.save_entry(&entry).await?;

        self.broadcaster.emit(ClientEvent::TurnStart {
            address: entry.address.clone(),
        });
        self.broadcaster.emit_to(&entry.address, ClientEvent::YourTurn);
        self.metrics.turn_started();

        self.hardware.emit(HardwareCommand::TurnStart);

        info!(entry_id = entry.id, address = %entry.address, "Turn started");
        Ok(Advance::Started(entry))
    }

    /// Forward a movement command from `address` if it holds the slot
    pub fn forward_move(&self, address: &str, bitmask: u32) -> bool {
        if self.state.current_player().as_deref() != Some(address) {
            debug!(%address, "Ignoring move from player without the slot");
            return false;
        }
        self.hardware.emit(HardwareCommand::Move { bitmask })
    }
}
