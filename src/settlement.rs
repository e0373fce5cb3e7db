//! Bet settlement clients
//!
//! The engine talks to the settlement layer through `SettlementClient`.
//! `GatewaySettlement` forwards to a signing gateway that owns the contract
//! and keys, `SimulatedLedger` keeps an in-process ledger for development
//! and tests. `RetryingSettlement` adds the bounded retry used for bets.

use crate::config::SettlementConfig;
use crate::errors::SettlementError;
use crate::models::{GameTotals, SettlementKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// A signed bet authorisation from the player
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetRequest {
    pub address: String,
    pub amount: u64,
    pub deadline: u64,
    pub signature: String,
}

#[async_trait]
pub trait SettlementClient: Send + Sync {
    /// Lock the player's funds; returns the key identifying the bet
    async fn place_bet(&self, bet: &BetRequest) -> Result<SettlementKey, SettlementError>;

    async fn notify_win(&self, key: &SettlementKey) -> Result<(), SettlementError>;

    /// Pay out the full balance; the amount comes from the confirmed event
    async fn withdraw_full(&self, address: &str) -> Result<u64, SettlementError>;

    async fn total_balance(&self, address: &str) -> Result<u64, SettlementError>;

    async fn game_totals(&self) -> Result<GameTotals, SettlementError>;

    async fn round_multiplier(&self, round_id: u64) -> Result<u64, SettlementError>;

    async fn end_round(&self, round_id: u64, multiplier: u64) -> Result<(), SettlementError>;
}

/// Attempt count and exponential backoff between attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
}

impl RetryPolicy {
    /// Pause after failed attempt `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.mul_f64(self.factor.powi(attempt as i32))
    }
}

impl From<&SettlementConfig> for RetryPolicy {
    fn from(config: &SettlementConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.backoff_base_ms),
            factor: config.backoff_factor,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_500),
            factor: 1.5,
        }
    }
}

/// Settlement client plus retry for bet placement
#[derive(Clone)]
pub struct RetryingSettlement {
    inner: Arc<dyn SettlementClient>,
    policy: RetryPolicy,
}

impl RetryingSettlement {
    pub fn new(inner: Arc<dyn SettlementClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Place a bet, retrying transport failures. `None` once attempts are
    /// exhausted or on any non-transient error.
    pub async fn place_bet(&self, bet: &BetRequest) -> Option<SettlementKey> {
        for attempt in 0..self.policy.max_attempts {
            match self.inner.place_bet(bet).await {
                Ok(key) => return Some(key),
                Err(e) if e.is_transient() => {
                    warn!(
                        address = %bet.address,
                        "Settlement error: {} (retry {}/{})",
                        e,
                        attempt + 1,
                        self.policy.max_attempts
                    );
                    if attempt + 1 < self.policy.max_attempts {
                        tokio::time::sleep(self.policy.delay(attempt)).await;
                    }
                }
                Err(e) => {
                    warn!(address = %bet.address, "Bet not placed: {}", e);
                    return None;
                }
            }
        }
        None
    }

    /// Underlying client for operations that are never retried
    pub fn client(&self) -> &Arc<dyn SettlementClient> {
        &self.inner
    }
}

#[derive(Debug, Deserialize)]
struct GatewayReceipt {
    status: u8,
    #[serde(default)]
    tx_hash: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    amount: Option<u64>,
}

impl GatewayReceipt {
    fn ensure_success(self) -> Result<Self, SettlementError> {
        if self.status == 1 {
            Ok(self)
        } else {
            Err(SettlementError::Rejected(
                self.tx_hash
                    .unwrap_or_else(|| format!("receipt status {}", self.status)),
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
struct BalanceReply {
    balance: u64,
}

#[derive(Debug, Deserialize)]
struct MultiplierReply {
    multiplier: u64,
}

/// JSON-over-HTTP client for the signing gateway
pub struct GatewaySettlement {
    client: reqwest::Client,
    base_url: String,
}

impl GatewaySettlement {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SettlementError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SettlementError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<GatewayReceipt, SettlementError> {
        let receipt: GatewayReceipt = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        receipt.ensure_success()
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, SettlementError> {
        Ok(self
            .client
            .get(self.url(path))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}

#[async_trait]
impl SettlementClient for GatewaySettlement {
    async fn place_bet(&self, bet: &BetRequest) -> Result<SettlementKey, SettlementError> {
        let receipt = self.post("/bet", bet).await?;
        let key = receipt
            .key
            .ok_or_else(|| SettlementError::MissingEvent("PlayerBet".to_string()))?;
        let key = SettlementKey::from_hex(&key)
            .map_err(|e| SettlementError::Unavailable(format!("bad settlement key: {}", e)))?;
        info!(address = %bet.address, %key, "Bet placed");
        Ok(key)
    }

    async fn notify_win(&self, key: &SettlementKey) -> Result<(), SettlementError> {
        self.post("/win", &serde_json::json!({ "key": key })).await?;
        Ok(())
    }

    async fn withdraw_full(&self, address: &str) -> Result<u64, SettlementError> {
        self.post("/withdraw", &serde_json::json!({ "address": address }))
            .await?
            .amount
            .ok_or_else(|| SettlementError::MissingEvent("Withdrawal".to_string()))
    }

    async fn total_balance(&self, address: &str) -> Result<u64, SettlementError> {
        let reply: BalanceReply = self.get(&format!("/balance/{}", address)).await?;
        Ok(reply.balance)
    }

    async fn game_totals(&self) -> Result<GameTotals, SettlementError> {
        self.get("/totals").await
    }

    async fn round_multiplier(&self, round_id: u64) -> Result<u64, SettlementError> {
        let reply: MultiplierReply = self.get(&format!("/rounds/{}/multiplier", round_id)).await?;
        Ok(reply.multiplier)
    }

    async fn end_round(&self, round_id: u64, multiplier: u64) -> Result<(), SettlementError> {
        self.post(
            &format!("/rounds/{}/end", round_id),
            &serde_json::json!({ "multiplier": multiplier }),
        )
        .await?;
        Ok(())
    }
}

/// Payout credited for a won bet, in units of the bet amount
const WIN_PAYOUT_FACTOR: u64 = 2;

#[derive(Debug)]
struct SimulatedBet {
    address: String,
    amount: u64,
    won: bool,
}

#[derive(Default)]
struct Ledger {
    balances: HashMap<String, u64>,
    bets: HashMap<SettlementKey, SimulatedBet>,
    totals: GameTotals,
    nonce: u64,
    ended_rounds: HashSet<u64>,
    multipliers: HashMap<u64, u64>,
    transient_failures: u32,
    end_round_failures: u32,
    reject_bets: bool,
    wins_notified: Vec<SettlementKey>,
}

/// In-process ledger with the gateway's semantics
#[derive(Default)]
pub struct SimulatedLedger {
    ledger: Mutex<Ledger>,
}

impl SimulatedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` bet placements with a transport error
    pub async fn fail_next_bets(&self, count: u32) {
        self.ledger.lock().await.transient_failures = count;
    }

    /// Fail the next `count` end_round calls with a transport error
    pub async fn fail_next_end_rounds(&self, count: u32) {
        self.ledger.lock().await.end_round_failures = count;
    }

    /// Make every bet come back with a failed receipt
    pub async fn reject_bets(&self, reject: bool) {
        self.ledger.lock().await.reject_bets = reject;
    }

    pub async fn set_round_multiplier(&self, round_id: u64, multiplier: u64) {
        self.ledger.lock().await.multipliers.insert(round_id, multiplier);
    }

    pub async fn credit(&self, address: &str, amount: u64) {
        *self
            .ledger
            .lock()
            .await
            .balances
            .entry(address.to_string())
            .or_default() += amount;
    }

    /// Keys for which a win was notified, in order
    pub async fn wins_notified(&self) -> Vec<SettlementKey> {
        self.ledger.lock().await.wins_notified.clone()
    }

    pub async fn round_ended(&self, round_id: u64) -> bool {
        self.ledger.lock().await.ended_rounds.contains(&round_id)
    }
}

fn derive_key(bet: &BetRequest, nonce: u64) -> SettlementKey {
    let mut hasher = Sha256::new();
    hasher.update(bet.address.as_bytes());
    hasher.update(bet.amount.to_be_bytes());
    hasher.update(bet.deadline.to_be_bytes());
    hasher.update(nonce.to_be_bytes());
    SettlementKey::new(hasher.finalize().to_vec())
}

#[async_trait]
impl SettlementClient for SimulatedLedger {
    async fn place_bet(&self, bet: &BetRequest) -> Result<SettlementKey, SettlementError> {
        let mut ledger = self.ledger.lock().await;
        if ledger.transient_failures > 0 {
            ledger.transient_failures -= 1;
            return Err(SettlementError::Transport("simulated connection reset".to_string()));
        }
        if ledger.reject_bets {
            return Err(SettlementError::Rejected("receipt status 0".to_string()));
        }

        ledger.nonce += 1;
        let key = derive_key(bet, ledger.nonce);
        ledger.bets.insert(
            key.clone(),
            SimulatedBet {
                address: bet.address.clone(),
                amount: bet.amount,
                won: false,
            },
        );
        ledger.totals = ledger.totals.with_wager(bet.amount);
        Ok(key)
    }

    async fn notify_win(&self, key: &SettlementKey) -> Result<(), SettlementError> {
        let mut ledger = self.ledger.lock().await;
        let bet = ledger
            .bets
            .get_mut(key)
            .ok_or_else(|| SettlementError::Rejected(format!("unknown bet {}", key)))?;
        if bet.won {
            return Err(SettlementError::Rejected(format!("bet {} already paid", key)));
        }
        bet.won = true;
        let payout = bet.amount.saturating_mul(WIN_PAYOUT_FACTOR);
        let address = bet.address.clone();

        *ledger.balances.entry(address).or_default() += payout;
        ledger.totals.won = ledger.totals.won.saturating_add(payout);
        ledger.wins_notified.push(key.clone());
        Ok(())
    }

    async fn withdraw_full(&self, address: &str) -> Result<u64, SettlementError> {
        let mut ledger = self.ledger.lock().await;
        Ok(ledger.balances.remove(address).unwrap_or(0))
    }

    async fn total_balance(&self, address: &str) -> Result<u64, SettlementError> {
        Ok(self
            .ledger
            .lock()
            .await
            .balances
            .get(address)
            .copied()
            .unwrap_or(0))
    }

    async fn game_totals(&self) -> Result<GameTotals, SettlementError> {
        Ok(self.ledger.lock().await.totals)
    }

    async fn round_multiplier(&self, round_id: u64) -> Result<u64, SettlementError> {
        let ledger = self.ledger.lock().await;
        Ok(ledger.multipliers.get(&round_id).copied().unwrap_or(100))
    }

    async fn end_round(&self, round_id: u64, _multiplier: u64) -> Result<(), SettlementError> {
        let mut ledger = self.ledger.lock().await;
        if ledger.end_round_failures > 0 {
            ledger.end_round_failures -= 1;
            return Err(SettlementError::Transport("simulated connection reset".to_string()));
        }
        if !ledger.ended_rounds.insert(round_id) {
            return Err(SettlementError::Rejected(format!("round {} already ended", round_id)));
        }
        Ok(())
    }
}
