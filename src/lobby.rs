//! Client-initiated operations: joining the queue, balances, withdrawals

use crate::{
    broadcast::ClientEvent,
    engine::Engine,
    errors::{ArcadeResult, QueueError, SettlementError},
    models::{NewEntry, Withdrawal},
    settlement::BetRequest,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Signed bet parameters sent with `join_queue`
#[derive(Debug, Clone, Deserialize)]
pub struct JoinRequest {
    pub amount: u64,
    pub deadline: u64,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WalletStatus {
    /// 1-based queue position, -1 when not queued
    pub position: i64,
    pub balance: u64,
}

#[derive(Clone)]
pub struct Lobby {
    engine: Arc<Engine>,
}

impl Lobby {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub async fn wallet_connected(&self, address: &str) -> ArcadeResult<WalletStatus> {
        let position = self
            .engine
            .store
            .queue_position(address)
            .await?
            .map_or(-1, |p| p as i64);
        let balance = self.check_balance(address).await?;
        Ok(WalletStatus { position, balance })
    }

    pub async fn check_balance(&self, address: &str) -> ArcadeResult<u64> {
        Ok(self.engine.settlement.client().total_balance(address).await?)
    }

    /// Lock the bet on the settlement layer, then queue the player.
    /// Returns the number of queued entries after the insert.
    pub async fn join_queue(&self, address: &str, request: JoinRequest) -> ArcadeResult<u64> {
        let engine = &self.engine;
        let round = engine.store.current_round().await?.ok_or(QueueError::NoRound)?;

        if engine.store.has_open_entry(round.id, address).await? {
            warn!(%address, round_id = round.id, "Rejected player for double entry");
            return Err(QueueError::Conflict {
                address: address.to_string(),
                round_id: round.id,
            }
            .into());
        }

        info!(%address, amount = request.amount, "Placing bet");
        let bet = BetRequest {
            address: address.to_string(),
            amount: request.amount,
            deadline: request.deadline,
            signature: request.signature,
        };
        let Some(key) = engine.settlement.place_bet(&bet).await else {
            engine.metrics.settlement_failure("place_bet");
            return Err(SettlementError::Unavailable("bet was not placed".to_string()).into());
        };

        let entry = engine
            .store
            .insert(NewEntry {
                address: address.to_string(),
                round_id: round.id,
                bet: request.amount,
                key: Some(key.clone()),
            })
            .await
            .map_err(|e| {
                error!(%address, %key, "Bet placed but entry not stored: {}", e);
                e
            })?;

        engine.state.add_wager(request.amount);
        let totals = engine.state.totals();
        engine.broadcaster.emit(ClientEvent::GameState {
            state: [totals.wagered, totals.won],
        });
        engine.broadcaster.emit(ClientEvent::PlayerQueued);

        let position = engine.store.count_queued().await?;
        engine.metrics.set_queue_length(position);
        info!(%address, entry_id = entry.id, position, "Player queued");
        Ok(position)
    }

    /// Pay out the player's full balance; never retried
    pub async fn withdraw(&self, address: &str) -> ArcadeResult<Withdrawal> {
        let amount = match self.engine.settlement.client().withdraw_full(address).await {
            Ok(amount) => amount,
            Err(e) => {
                self.engine.metrics.settlement_failure("withdraw");
                error!(%address, "Withdrawal failed: {}", e);
                return Err(e.into());
            }
        };
        let withdrawal = self.engine.store.record_withdrawal(address, amount).await?;
        info!(%address, amount, "Withdrawal recorded");
        Ok(withdrawal)
    }

    pub fn request_move(&self, address: &str, bitmask: u32) -> bool {
        self.engine.forward_move(address, bitmask)
    }
}
