//! HTTP response bodies

use crate::models::GameTotals;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LinkInfo {
    pub transport_connected: bool,
    pub namespace_ready: bool,
    pub healthy: bool,
}

/// GET /status
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub current_player: Option<String>,
    pub current_entry_id: Option<u64>,
    pub turn_elapsed_secs: Option<u64>,
    pub queue_length: u64,
    pub round_id: Option<u64>,
    pub round_changing: bool,
    pub seconds_to_round_end: i64,
    pub link: LinkInfo,
    pub totals: GameTotals,
    pub connected_clients: u64,
}
