//! Persisted records for rounds, queue entries and withdrawals

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A betting epoch
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Round {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub max_fee: u64,
    pub fee_growth: u64,
    /// Settlement multiplier, unset until the round is closed
    pub multiplier: Option<u64>,
}

impl Round {
    pub fn new(id: u64, max_fee: u64, fee_growth: u64) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            max_fee,
            fee_growth,
            multiplier: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.multiplier.is_some()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Queued,
    Active,
    Played,
    Cancelled,
}

impl EntryStatus {
    /// Queued and active entries count against the one-per-round limit
    pub fn is_open(self) -> bool {
        matches!(self, EntryStatus::Queued | EntryStatus::Active)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryStatus::Queued => "queued",
            EntryStatus::Active => "active",
            EntryStatus::Played => "played",
            EntryStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Opaque identifier of an on-chain bet, hex encoded on the wire
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SettlementKey(Vec<u8>);

impl SettlementKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s.trim_start_matches("0x")).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for SettlementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SettlementKey({})", self.to_hex())
    }
}

impl fmt::Display for SettlementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for SettlementKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SettlementKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        SettlementKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Fields supplied by the caller when a player joins the queue
#[derive(Clone, Debug)]
pub struct NewEntry {
    pub address: String,
    pub round_id: u64,
    pub bet: u64,
    pub key: Option<SettlementKey>,
}

/// One participant's claim on a turn
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub id: u64,
    pub address: String,
    pub round_id: u64,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
    pub played_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub bet: u64,
    pub win: bool,
    pub key: Option<SettlementKey>,
}

impl QueueEntry {
    pub fn from_new(id: u64, new: NewEntry, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            address: new.address,
            round_id: new.round_id,
            status: EntryStatus::Queued,
            created_at,
            played_at: None,
            ended_at: None,
            cancelled_at: None,
            bet: new.bet,
            win: false,
            key: new.key,
        }
    }

    pub fn activate(&mut self) {
        self.status = EntryStatus::Active;
    }

    /// Close the turn
    pub fn finish(&mut self, now: DateTime<Utc>) {
        self.status = EntryStatus::Played;
        self.ended_at = Some(now);
    }
}

/// Funds paid out to an address
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Withdrawal {
    pub id: u64,
    pub address: String,
    pub amount: u64,
    pub created_at: DateTime<Utc>,
}

/// Aggregate amounts mirrored from the settlement ledger
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameTotals {
    pub wagered: u64,
    pub won: u64,
}

impl GameTotals {
    pub fn with_wager(self, amount: u64) -> Self {
        Self {
            wagered: self.wagered.saturating_add(amount),
            won: self.won,
        }
    }
}
