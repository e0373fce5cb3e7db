//! Queue store: rounds, queue entries and withdrawals
//!
//! The store is plain data access. Turn policy lives in the engine; the only
//! rule enforced here is that a player holds at most one open (queued or
//! active) entry per round, checked and written inside one critical section.

use crate::{
    errors::{ArcadeError, ArcadeResult, QueueError, StorageError},
    models::{EntryStatus, NewEntry, QueueEntry, Round, Withdrawal},
    storage::{BatchOp, OptimizedStorage},
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Return the current round, creating round 1 if the store is empty
    async fn ensure_first_round(&self, max_fee: u64, fee_growth: u64) -> ArcadeResult<Round>;

    /// Most recently created round
    async fn current_round(&self) -> ArcadeResult<Option<Round>>;

    /// Record the closing round's multiplier and open the next round in one commit.
    /// Entries still queued in the closing round move to the new round.
    async fn rollover_round(
        &self,
        closing_id: u64,
        multiplier: u64,
        max_fee: u64,
        fee_growth: u64,
    ) -> ArcadeResult<Round>;

    /// Insert a queued entry; fails with `QueueError::Conflict` if the player
    /// already holds an open entry in that round. An entry aimed at a round
    /// that has since rolled over is placed in the current round.
    async fn insert(&self, entry: NewEntry) -> ArcadeResult<QueueEntry>;

    async fn has_open_entry(&self, round_id: u64, address: &str) -> ArcadeResult<bool>;

    /// Oldest queued entry of the round
    async fn next_queued(&self, round_id: u64) -> ArcadeResult<Option<QueueEntry>>;

    async fn count_queued(&self) -> ArcadeResult<u64>;

    /// Every queued entry, oldest first
    async fn queued_entries(&self) -> ArcadeResult<Vec<QueueEntry>>;

    async fn active_entries(&self) -> ArcadeResult<Vec<QueueEntry>>;

    async fn active_entry(&self) -> ArcadeResult<Option<QueueEntry>>;

    async fn active_entry_for(&self, address: &str) -> ArcadeResult<Option<QueueEntry>>;

    async fn entry(&self, id: u64) -> ArcadeResult<Option<QueueEntry>>;

    /// Persist an updated entry together with its index changes
    async fn save_entry(&self, entry: &QueueEntry) -> ArcadeResult<()>;

    /// 1-based position among queued entries, if the player is queued
    async fn queue_position(&self, address: &str) -> ArcadeResult<Option<u64>>;

    async fn record_withdrawal(&self, address: &str, amount: u64) -> ArcadeResult<Withdrawal>;

    async fn withdrawals_for(&self, address: &str) -> ArcadeResult<Vec<Withdrawal>>;
}

fn retarget(requested: u64, current: u64) -> u64 {
    if requested < current {
        tracing::info!(requested, current, "Round rolled over before insert, using current round");
        current
    } else {
        requested
    }
}

fn fifo_order(a: &QueueEntry, b: &QueueEntry) -> std::cmp::Ordering {
    a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id))
}

#[derive(Default)]
struct MemoryTables {
    rounds: Vec<Round>,
    entries: BTreeMap<u64, QueueEntry>,
    withdrawals: Vec<Withdrawal>,
    next_entry_id: u64,
}

impl MemoryTables {
    fn queued_sorted(&self) -> Vec<QueueEntry> {
        let mut queued: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by(fifo_order);
        queued
    }
}

/// Store kept entirely in memory; used by tests and `--ephemeral` runs
#[derive(Default)]
pub struct InMemoryQueueStore {
    tables: Mutex<MemoryTables>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn ensure_first_round(&self, max_fee: u64, fee_growth: u64) -> ArcadeResult<Round> {
        let mut tables = self.tables.lock().await;
        if let Some(round) = tables.rounds.last() {
            return Ok(round.clone());
        }
        let round = Round::new(1, max_fee, fee_growth);
        tables.rounds.push(round.clone());
        Ok(round)
    }

    async fn current_round(&self) -> ArcadeResult<Option<Round>> {
        Ok(self.tables.lock().await.rounds.last().cloned())
    }

    async fn rollover_round(
        &self,
        closing_id: u64,
        multiplier: u64,
        max_fee: u64,
        fee_growth: u64,
    ) -> ArcadeResult<Round> {
        let mut tables = self.tables.lock().await;
        let next_id = tables.rounds.last().map_or(1, |r| r.id + 1);
        let closing = tables
            .rounds
            .iter_mut()
            .find(|r| r.id == closing_id)
            .ok_or(QueueError::NoRound)?;
        closing.multiplier = Some(multiplier);

        let round = Round::new(next_id, max_fee, fee_growth);
        for entry in tables.entries.values_mut() {
            if entry.round_id == closing_id && entry.status == EntryStatus::Queued {
                entry.round_id = next_id;
            }
        }
        tables.rounds.push(round.clone());
        Ok(round)
    }

    async fn insert(&self, mut new: NewEntry) -> ArcadeResult<QueueEntry> {
        let mut tables = self.tables.lock().await;
        if let Some(current) = tables.rounds.last() {
            new.round_id = retarget(new.round_id, current.id);
        }
        let conflict = tables
            .entries
            .values()
            .any(|e| e.round_id == new.round_id && e.address == new.address && e.status.is_open());
        if conflict {
            return Err(QueueError::Conflict {
                address: new.address,
                round_id: new.round_id,
            }
            .into());
        }

        tables.next_entry_id += 1;
        let entry = QueueEntry::from_new(tables.next_entry_id, new, Utc::now());
        tables.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn has_open_entry(&self, round_id: u64, address: &str) -> ArcadeResult<bool> {
        let tables = self.tables.lock().await;
        Ok(tables
            .entries
            .values()
            .any(|e| e.round_id == round_id && e.address == address && e.status.is_open()))
    }

    async fn next_queued(&self, round_id: u64) -> ArcadeResult<Option<QueueEntry>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .queued_sorted()
            .into_iter()
            .find(|e| e.round_id == round_id))
    }

    async fn count_queued(&self) -> ArcadeResult<u64> {
        let tables = self.tables.lock().await;
        Ok(tables
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Queued)
            .count() as u64)
    }

    async fn queued_entries(&self) -> ArcadeResult<Vec<QueueEntry>> {
        Ok(self.tables.lock().await.queued_sorted())
    }

    async fn active_entries(&self) -> ArcadeResult<Vec<QueueEntry>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Active)
            .cloned()
            .collect())
    }

    async fn active_entry(&self) -> ArcadeResult<Option<QueueEntry>> {
        Ok(self.active_entries().await?.into_iter().next())
    }

    async fn active_entry_for(&self, address: &str) -> ArcadeResult<Option<QueueEntry>> {
        Ok(self
            .active_entries()
            .await?
            .into_iter()
            .find(|e| e.address == address))
    }

    async fn entry(&self, id: u64) -> ArcadeResult<Option<QueueEntry>> {
        Ok(self.tables.lock().await.entries.get(&id).cloned())
    }

    async fn save_entry(&self, entry: &QueueEntry) -> ArcadeResult<()> {
        let mut tables = self.tables.lock().await;
        if !tables.entries.contains_key(&entry.id) {
            return Err(QueueError::EntryNotFound(entry.id).into());
        }
        tables.entries.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn queue_position(&self, address: &str) -> ArcadeResult<Option<u64>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .queued_sorted()
            .iter()
            .position(|e| e.address == address)
            .map(|i| i as u64 + 1))
    }

    async fn record_withdrawal(&self, address: &str, amount: u64) -> ArcadeResult<Withdrawal> {
        let mut tables = self.tables.lock().await;
        let withdrawal = Withdrawal {
            id: tables.withdrawals.len() as u64 + 1,
            address: address.to_string(),
            amount,
            created_at: Utc::now(),
        };
        tables.withdrawals.push(withdrawal.clone());
        Ok(withdrawal)
    }

    async fn withdrawals_for(&self, address: &str) -> ArcadeResult<Vec<Withdrawal>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .withdrawals
            .iter()
            .filter(|w| w.address == address)
            .cloned()
            .collect())
    }
}

const ROUND_PREFIX: &str = "round:";
const ENTRY_PREFIX: &str = "entry:";
const WITHDRAWAL_PREFIX: &str = "withdrawal:";
const QUEUED_INDEX_PREFIX: &str = "index:queued:";
const ACTIVE_INDEX_PREFIX: &str = "index:active:";
const OPEN_INDEX_PREFIX: &str = "index:open:";

fn round_key(id: u64) -> Vec<u8> {
    format!("{}{:020}", ROUND_PREFIX, id).into_bytes()
}

fn entry_key(id: u64) -> Vec<u8> {
    format!("{}{:020}", ENTRY_PREFIX, id).into_bytes()
}

fn withdrawal_key(address: &str, id: u64) -> Vec<u8> {
    format!("{}{}:{:020}", WITHDRAWAL_PREFIX, address, id).into_bytes()
}

fn queued_index_key(entry: &QueueEntry) -> Vec<u8> {
    // Key layout sorts FIFO: creation millis, then id as tie-break
    let created_ms = entry.created_at.timestamp_millis().max(0) as u64;
    format!("{}{:020}:{:020}", QUEUED_INDEX_PREFIX, created_ms, entry.id).into_bytes()
}

fn active_index_key(id: u64) -> Vec<u8> {
    format!("{}{:020}", ACTIVE_INDEX_PREFIX, id).into_bytes()
}

fn open_index_key(round_id: u64, address: &str) -> Vec<u8> {
    format!("{}{:020}:{}", OPEN_INDEX_PREFIX, round_id, address).into_bytes()
}

/// Trailing id of an index key
fn id_suffix(key: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(key).ok()?;
    text.rsplit(':').next()?.parse().ok()
}

fn encode<T: Serialize>(value: &T, what: &str) -> ArcadeResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        ArcadeError::Storage(StorageError::WriteFailed(format!("Failed to encode {}: {}", what, e)))
    })
}

fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> ArcadeResult<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        ArcadeError::Storage(StorageError::CorruptedData(format!("Failed to decode {}: {}", what, e)))
    })
}

/// Index rows an entry should have in its current state
fn index_rows(entry: &QueueEntry) -> Vec<Vec<u8>> {
    let mut rows = Vec::new();
    match entry.status {
        EntryStatus::Queued => rows.push(queued_index_key(entry)),
        EntryStatus::Active => rows.push(active_index_key(entry.id)),
        EntryStatus::Played | EntryStatus::Cancelled => {}
    }
    if entry.status.is_open() {
        rows.push(open_index_key(entry.round_id, &entry.address));
    }
    rows
}

/// Record write plus index maintenance for one entry transition
fn entry_ops(previous: Option<&QueueEntry>, entry: &QueueEntry) -> ArcadeResult<Vec<BatchOp>> {
    let mut ops = Vec::new();
    if let Some(previous) = previous {
        ops.extend(index_rows(previous).into_iter().map(BatchOp::Delete));
    }
    ops.push(BatchOp::Put(entry_key(entry.id), encode(entry, "queue entry")?));
    ops.extend(
        index_rows(entry)
            .into_iter()
            .map(|key| BatchOp::Put(key, entry.id.to_string().into_bytes())),
    );
    Ok(ops)
}

struct Counters {
    next_entry_id: u64,
    next_withdrawal_id: u64,
}

/// RocksDB-backed store; every transition commits in a single write batch
pub struct RocksQueueStore {
    storage: OptimizedStorage,
    // Serializes check-then-write sequences and id allocation
    write_lock: Mutex<Counters>,
}

impl RocksQueueStore {
    pub fn open(storage: OptimizedStorage) -> ArcadeResult<Self> {
        let last_entry = storage
            .scan_prefix(ENTRY_PREFIX.as_bytes())?
            .last()
            .and_then(|(key, _)| id_suffix(key))
            .unwrap_or(0);
        let last_withdrawal = storage
            .scan_prefix(WITHDRAWAL_PREFIX.as_bytes())?
            .iter()
            .filter_map(|(key, _)| id_suffix(key))
            .max()
            .unwrap_or(0);

        tracing::info!(last_entry, last_withdrawal, "Opened queue store");

        Ok(Self {
            storage,
            write_lock: Mutex::new(Counters {
                next_entry_id: last_entry + 1,
                next_withdrawal_id: last_withdrawal + 1,
            }),
        })
    }

    fn load_entry(&self, id: u64) -> ArcadeResult<Option<QueueEntry>> {
        match self.storage.get(&entry_key(id))? {
            Some(bytes) => Ok(Some(decode(&bytes, "queue entry")?)),
            None => Ok(None),
        }
    }

    fn load_indexed(&self, prefix: &str) -> ArcadeResult<Vec<QueueEntry>> {
        let mut entries = Vec::new();
        for (key, _) in self.storage.scan_prefix(prefix.as_bytes())? {
            let Some(id) = id_suffix(&key) else {
                continue;
            };
            match self.load_entry(id)? {
                Some(entry) => entries.push(entry),
                None => tracing::warn!(entry_id = id, "Index points at missing entry"),
            }
        }
        Ok(entries)
    }

    fn last_round(&self) -> ArcadeResult<Option<Round>> {
        match self.storage.scan_prefix(ROUND_PREFIX.as_bytes())?.last() {
            Some((_, bytes)) => Ok(Some(decode(bytes, "round")?)),
            None => Ok(None),
        }
    }

    fn write(&self, ops: Vec<BatchOp>) -> ArcadeResult<()> {
        self.storage
            .batch_write(ops)
            .map_err(|e| ArcadeError::Storage(StorageError::WriteFailed(e.to_string())))
    }
}

#[async_trait]
impl QueueStore for RocksQueueStore {
    async fn ensure_first_round(&self, max_fee: u64, fee_growth: u64) -> ArcadeResult<Round> {
        let _guard = self.write_lock.lock().await;
        if let Some(round) = self.last_round()? {
            return Ok(round);
        }
        let round = Round::new(1, max_fee, fee_growth);
        self.write(vec![BatchOp::Put(round_key(round.id), encode(&round, "round")?)])?;
        tracing::info!(round_id = round.id, "Created first round");
        Ok(round)
    }

    async fn current_round(&self) -> ArcadeResult<Option<Round>> {
        self.last_round()
    }

    async fn rollover_round(
        &self,
        closing_id: u64,
        multiplier: u64,
        max_fee: u64,
        fee_growth: u64,
    ) -> ArcadeResult<Round> {
        let _guard = self.write_lock.lock().await;
        let mut closing: Round = match self.storage.get(&round_key(closing_id))? {
            Some(bytes) => decode(&bytes, "round")?,
            None => return Err(QueueError::NoRound.into()),
        };
        let next_id = self.last_round()?.map_or(closing_id, |r| r.id) + 1;
        closing.multiplier = Some(multiplier);
        let round = Round::new(next_id, max_fee, fee_growth);

        let mut ops = vec![
            BatchOp::Put(round_key(closing.id), encode(&closing, "round")?),
            BatchOp::Put(round_key(round.id), encode(&round, "round")?),
        ];
        for entry in self.load_indexed(QUEUED_INDEX_PREFIX)? {
            if entry.round_id != closing_id {
                continue;
            }
            let mut moved = entry.clone();
            moved.round_id = round.id;
            ops.extend(entry_ops(Some(&entry), &moved)?);
        }
        self.write(ops)?;
        Ok(round)
    }

    async fn insert(&self, mut new: NewEntry) -> ArcadeResult<QueueEntry> {
        let mut counters = self.write_lock.lock().await;
        if let Some(current) = self.last_round()? {
            new.round_id = retarget(new.round_id, current.id);
        }
        if self.storage.get(&open_index_key(new.round_id, &new.address))?.is_some() {
            return Err(QueueError::Conflict {
                address: new.address,
                round_id: new.round_id,
            }
            .into());
        }

        let entry = QueueEntry::from_new(counters.next_entry_id, new, Utc::now());
        self.write(entry_ops(None, &entry)?)?;
        counters.next_entry_id += 1;
        Ok(entry)
    }

    async fn has_open_entry(&self, round_id: u64, address: &str) -> ArcadeResult<bool> {
        Ok(self.storage.get(&open_index_key(round_id, address))?.is_some())
    }

    async fn next_queued(&self, round_id: u64) -> ArcadeResult<Option<QueueEntry>> {
        Ok(self
            .load_indexed(QUEUED_INDEX_PREFIX)?
            .into_iter()
            .find(|e| e.round_id == round_id))
    }

    async fn count_queued(&self) -> ArcadeResult<u64> {
        Ok(self.storage.scan_prefix(QUEUED_INDEX_PREFIX.as_bytes())?.len() as u64)
    }

    async fn queued_entries(&self) -> ArcadeResult<Vec<QueueEntry>> {
        self.load_indexed(QUEUED_INDEX_PREFIX)
    }

    async fn active_entries(&self) -> ArcadeResult<Vec<QueueEntry>> {
        self.load_indexed(ACTIVE_INDEX_PREFIX)
    }

    async fn active_entry(&self) -> ArcadeResult<Option<QueueEntry>> {
        Ok(self.load_indexed(ACTIVE_INDEX_PREFIX)?.into_iter().next())
    }

    async fn active_entry_for(&self, address: &str) -> ArcadeResult<Option<QueueEntry>> {
        Ok(self
            .load_indexed(ACTIVE_INDEX_PREFIX)?
            .into_iter()
            .find(|e| e.address == address))
    }

    async fn entry(&self, id: u64) -> ArcadeResult<Option<QueueEntry>> {
        self.load_entry(id)
    }

    async fn save_entry(&self, entry: &QueueEntry) -> ArcadeResult<()> {
        let _guard = self.write_lock.lock().await;
        let previous = self
            .load_entry(entry.id)?
            .ok_or(QueueError::EntryNotFound(entry.id))?;
        self.write(entry_ops(Some(&previous), entry)?)
    }

    async fn queue_position(&self, address: &str) -> ArcadeResult<Option<u64>> {
        Ok(self
            .load_indexed(QUEUED_INDEX_PREFIX)?
            .iter()
            .position(|e| e.address == address)
            .map(|i| i as u64 + 1))
    }

    async fn record_withdrawal(&self, address: &str, amount: u64) -> ArcadeResult<Withdrawal> {
        let mut counters = self.write_lock.lock().await;
        let withdrawal = Withdrawal {
            id: counters.next_withdrawal_id,
            address: address.to_string(),
            amount,
            created_at: Utc::now(),
        };
        self.write(vec![BatchOp::Put(
            withdrawal_key(address, withdrawal.id),
            encode(&withdrawal, "withdrawal")?,
        )])?;
        counters.next_withdrawal_id += 1;
        Ok(withdrawal)
    }

    async fn withdrawals_for(&self, address: &str) -> ArcadeResult<Vec<Withdrawal>> {
        let prefix = format!("{}{}:", WITHDRAWAL_PREFIX, address);
        self.storage
            .scan_prefix(prefix.as_bytes())?
            .iter()
            .map(|(_, bytes)| decode(bytes, "withdrawal"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_entry(address: &str, round_id: u64) -> NewEntry {
        NewEntry {
            address: address.to_string(),
            round_id,
            bet: 20,
            key: None,
        }
    }

    #[tokio::test]
    async fn test_memory_conflict_on_open_entry() {
        let store = InMemoryQueueStore::new();
        let round = store.ensure_first_round(20, 50).await.unwrap();

        store.insert(new_entry("0xa", round.id)).await.unwrap();
        let err = store.insert(new_entry("0xa", round.id)).await.unwrap_err();
        assert!(matches!(err, ArcadeError::Queue(QueueError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_memory_played_entry_allows_rejoin() {
        let store = InMemoryQueueStore::new();
        let round = store.ensure_first_round(20, 50).await.unwrap();

        let mut entry = store.insert(new_entry("0xa", round.id)).await.unwrap();
        entry.finish(Utc::now());
        store.save_entry(&entry).await.unwrap();

        assert!(!store.has_open_entry(round.id, "0xa").await.unwrap());
        assert!(store.insert(new_entry("0xa", round.id)).await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_positions_are_fifo() {
        let store = InMemoryQueueStore::new();
        let round = store.ensure_first_round(20, 50).await.unwrap();
        for addr in ["0xa", "0xb", "0xc"] {
            store.insert(new_entry(addr, round.id)).await.unwrap();
        }

        assert_eq!(store.queue_position("0xa").await.unwrap(), Some(1));
        assert_eq!(store.queue_position("0xc").await.unwrap(), Some(3));
        assert_eq!(store.queue_position("0xz").await.unwrap(), None);
        assert_eq!(store.next_queued(round.id).await.unwrap().unwrap().address, "0xa");
    }

    #[tokio::test]
    async fn test_memory_rollover_moves_queued_entries() {
        let store = InMemoryQueueStore::new();
        let first = store.ensure_first_round(20, 50).await.unwrap();
        store.insert(new_entry("0xa", first.id)).await.unwrap();

        let second = store.rollover_round(first.id, 3, 20, 50).await.unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(store.current_round().await.unwrap().unwrap().id, 2);
        assert!(store.next_queued(first.id).await.unwrap().is_none());
        assert_eq!(store.next_queued(second.id).await.unwrap().unwrap().address, "0xa");
    }

    #[tokio::test]
    async fn test_memory_insert_after_rollover_lands_in_current_round() {
        let store = InMemoryQueueStore::new();
        let first = store.ensure_first_round(20, 50).await.unwrap();
        let second = store.rollover_round(first.id, 3, 20, 50).await.unwrap();

        let entry = store.insert(new_entry("0xa", first.id)).await.unwrap();
        assert_eq!(entry.round_id, second.id);
        assert_eq!(store.next_queued(second.id).await.unwrap().unwrap().id, entry.id);
        assert!(!store.has_open_entry(first.id, "0xa").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_save_unknown_entry_fails() {
        let store = InMemoryQueueStore::new();
        let entry = QueueEntry::from_new(99, new_entry("0xa", 1), Utc::now());
        assert!(store.save_entry(&entry).await.is_err());
    }

    #[test]
    fn test_id_suffix() {
        assert_eq!(id_suffix(&active_index_key(42)), Some(42));
        assert_eq!(id_suffix(b"index:queued:00000000000000000001:00000000000000000007"), Some(7));
        assert_eq!(id_suffix(b"garbage"), None);
    }
}
