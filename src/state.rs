//! Process-wide transient state
//!
//! The slot (who currently controls the machine) is behind one async mutex.
//! The scheduler and the hardware reconciler are the only writers and each
//! holds the lock for a whole transition. Readers that must not wait on a
//! transition (sync loop, HTTP status, move forwarding) read a snapshot that
//! the guard republishes on every mutation.

use crate::models::{GameTotals, QueueEntry, SettlementKey};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

#[derive(Debug, Default)]
struct SlotState {
    current_player: Option<String>,
    current_key: Option<SettlementKey>,
    current_entry_id: Option<u64>,
    turn_started_at: Option<Instant>,
    win_recorded: bool,
}

/// Copy of the slot published for lock-free readers
#[derive(Clone, Debug, Default)]
pub struct SlotView {
    pub current_player: Option<String>,
    pub current_entry_id: Option<u64>,
    pub turn_started_at: Option<Instant>,
}

pub struct ProcessState {
    slot: Mutex<SlotState>,
    view: RwLock<SlotView>,
    round_changing: AtomicBool,
    totals: RwLock<GameTotals>,
}

impl Default for ProcessState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessState {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(SlotState::default()),
            view: RwLock::new(SlotView::default()),
            round_changing: AtomicBool::new(false),
            totals: RwLock::new(GameTotals::default()),
        }
    }

    /// Acquire exclusive ownership of the slot for one transition
    pub async fn lock_slot(&self) -> SlotGuard<'_> {
        SlotGuard {
            slot: self.slot.lock().await,
            view: &self.view,
        }
    }

    pub fn view(&self) -> SlotView {
        read(&self.view).clone()
    }

    pub fn current_player(&self) -> Option<String> {
        read(&self.view).current_player.clone()
    }

    pub fn is_round_changing(&self) -> bool {
        self.round_changing.load(Ordering::SeqCst)
    }

    /// Raise the round-changing flag; it is lowered when the guard drops
    pub fn begin_round_change(&self) -> RoundChangeGuard<'_> {
        self.round_changing.store(true, Ordering::SeqCst);
        RoundChangeGuard {
            flag: &self.round_changing,
        }
    }

    pub fn totals(&self) -> GameTotals {
        *read(&self.totals)
    }

    pub fn set_totals(&self, totals: GameTotals) {
        *write(&self.totals) = totals;
    }

    pub fn add_wager(&self, amount: u64) {
        let mut totals = write(&self.totals);
        *totals = totals.with_wager(amount);
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Exclusive handle on the slot; every mutation goes through here
pub struct SlotGuard<'a> {
    slot: MutexGuard<'a, SlotState>,
    view: &'a RwLock<SlotView>,
}

impl SlotGuard<'_> {
    pub fn current_player(&self) -> Option<&str> {
        self.slot.current_player.as_deref()
    }

    pub fn current_key(&self) -> Option<&SettlementKey> {
        self.slot.current_key.as_ref()
    }

    pub fn current_entry_id(&self) -> Option<u64> {
        self.slot.current_entry_id
    }

    pub fn turn_started_at(&self) -> Option<Instant> {
        self.slot.turn_started_at
    }

    /// Time since the current turn started; `None` if no turn has started
    /// since the process came up
    pub fn elapsed(&self) -> Option<Duration> {
        self.slot.turn_started_at.map(|t| t.elapsed())
    }

    /// Hand the slot to `entry`, stamping the turn start now
    pub fn begin_turn(&mut self, entry: &QueueEntry) {
        self.slot.current_player = Some(entry.address.clone());
        self.slot.current_key = entry.key.clone();
        self.slot.current_entry_id = Some(entry.id);
        self.slot.turn_started_at = Some(Instant::now());
        self.slot.win_recorded = false;
        self.publish();
    }

    /// Nobody holds the slot. The turn start time is kept so pacing still
    /// applies to the next promotion.
    pub fn clear(&mut self) {
        self.slot.current_player = None;
        self.slot.current_key = None;
        self.slot.current_entry_id = None;
        self.slot.win_recorded = false;
        self.publish();
    }

    /// Mark the current turn as won; false if it already was
    pub fn record_win(&mut self) -> bool {
        if self.slot.win_recorded {
            return false;
        }
        self.slot.win_recorded = true;
        true
    }

    fn publish(&self) {
        let mut view = write(self.view);
        view.current_player = self.slot.current_player.clone();
        view.current_entry_id = self.slot.current_entry_id;
        view.turn_started_at = self.slot.turn_started_at;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.publish();
    }
}

pub struct RoundChangeGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RoundChangeGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
