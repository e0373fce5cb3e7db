//! Claw Arcade - turn-based queue service for a physical claw machine
//!
//! Players join a per-round FIFO queue by placing a bet through the
//! settlement layer. One player at a time holds the machine for a fixed turn;
//! turns end on a timer or when the hardware controller reports the end of
//! play. Rounds roll over daily at a fixed UTC hour.

pub mod api;
pub mod broadcast;
pub mod config;
pub mod engine;
pub mod errors;
pub mod hardware;
pub mod lobby;
pub mod metrics;
pub mod models;
pub mod queue_store;
pub mod reconciler;
pub mod rounds;
pub mod scheduler;
pub mod settlement;
pub mod state;
pub mod storage;
pub mod sync;

pub use config::{ArcadeConfig, ConfigLoader};
pub use engine::{Advance, Engine};
pub use errors::{ArcadeError, ArcadeResult};
pub use models::{EntryStatus, QueueEntry, Round, SettlementKey};
pub use queue_store::{InMemoryQueueStore, QueueStore, RocksQueueStore};
