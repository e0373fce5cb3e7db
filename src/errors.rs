//! Error types for the claw arcade service
//!
//! Errors are grouped by the collaborator that produced them so callers can
//! tell a transient infrastructure failure from a settlement rejection or a
//! queue conflict without string matching.

use thiserror::Error;

/// Root error type for all arcade operations
#[derive(Debug, Error)]
pub enum ArcadeError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Hardware link error: {0}")]
    Hardware(#[from] HardwareError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArcadeError {
    /// Stable code reported to clients in error replies
    pub fn code(&self) -> &'static str {
        match self {
            ArcadeError::Queue(QueueError::Conflict { .. }) => "already_queued",
            ArcadeError::Queue(QueueError::WalletNotConnected) => "wallet_not_connected",
            ArcadeError::Queue(QueueError::NoRound) => "no_round",
            ArcadeError::Settlement(_) => "settlement_failed",
            ArcadeError::Hardware(_) => "hardware_unavailable",
            _ => "internal",
        }
    }

    /// Settlement transport failures that may succeed on another attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, ArcadeError::Settlement(e) if e.is_transient())
    }
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Missing required field: {0}")]
    MissingRequired(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),
}

/// Persistent store errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database open failed: {0}")]
    DatabaseOpenFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),
}

/// Queue policy errors
#[derive(Debug, Error)]
pub enum QueueError {
    /// An open (queued or active) entry already exists for this player in the round
    #[error("Player {address} already holds an open entry in round {round_id}")]
    Conflict { address: String, round_id: u64 },

    #[error("No round exists yet")]
    NoRound,

    #[error("Entry {0} not found")]
    EntryNotFound(u64),

    #[error("Wallet not connected")]
    WalletNotConnected,
}

/// Settlement layer errors
#[derive(Debug, Error)]
pub enum SettlementError {
    /// Network or RPC failure; safe to retry
    #[error("Settlement transport failure: {0}")]
    Transport(String),

    /// Transaction receipt reported failure
    #[error("Settlement transaction rejected: {0}")]
    Rejected(String),

    /// Receipt succeeded but did not carry the expected event
    #[error("Expected settlement event {0} not found in receipt")]
    MissingEvent(String),

    #[error("Settlement unavailable: {0}")]
    Unavailable(String),
}

impl SettlementError {
    /// Whether the failure is worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, SettlementError::Transport(_))
    }
}

/// Hardware controller link errors
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("Malformed hardware frame: {0}")]
    MalformedFrame(String),
}

// External error conversions
impl From<rocksdb::Error> for ArcadeError {
    fn from(e: rocksdb::Error) -> Self {
        ArcadeError::Storage(StorageError::WriteFailed(e.to_string()))
    }
}

impl From<reqwest::Error> for SettlementError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            SettlementError::Transport(e.to_string())
        } else {
            SettlementError::Unavailable(e.to_string())
        }
    }
}

/// Convenience type alias for Results
pub type ArcadeResult<T> = Result<T, ArcadeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn test_error_display() {
        let err: ArcadeError = ConfigurationError::MissingRequired("hardware.url".to_string()).into();
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("hardware.url"));
    }

    #[test]
    fn test_conflict_details() {
        let err = QueueError::Conflict {
            address: "0xabc".to_string(),
            round_id: 7,
        };
        assert!(err.to_string().contains("0xabc"));
        assert!(err.to_string().contains("round 7"));
    }

    #[test]
    fn test_only_transport_is_transient() {
        assert!(SettlementError::Transport("reset".into()).is_transient());
        assert!(!SettlementError::Rejected("status 0".into()).is_transient());
        assert!(!SettlementError::MissingEvent("PlayerBet".into()).is_transient());
    }

    #[test]
    fn test_root_transient_only_for_settlement_transport() {
        let err: ArcadeError = SettlementError::Transport("reset".into()).into();
        assert!(err.is_transient());
        let err: ArcadeError = QueueError::NoRound.into();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_error_source() {
        let err: ArcadeError = SettlementError::Rejected("status 0".into()).into();
        assert!(err.source().is_some());
    }
}
