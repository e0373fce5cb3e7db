//! Round lifecycle
//!
//! Rounds roll over once a day at a fixed UTC hour. While a rollover runs the
//! round-changing flag keeps the scheduler from starting turns; the flag is
//! lowered on every exit path by its guard.

use crate::{engine::Engine, errors::ArcadeResult, models::Round};
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const ROLLOVER_ATTEMPTS: u32 = 3;
const ROLLOVER_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Next instant at `hour:00:00` UTC strictly after `now`
pub fn next_boundary(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or_default();
    let today = now.date_naive().and_time(time).and_utc();
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

pub fn seconds_until_boundary(now: DateTime<Utc>, hour: u32) -> i64 {
    (next_boundary(now, hour) - now).num_seconds()
}

pub struct RoundManager {
    engine: Arc<Engine>,
}

impl RoundManager {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Round manager started");
        loop {
            let now = Utc::now();
            let boundary = next_boundary(now, self.engine.config.round_boundary_hour_utc);
            let wait = (boundary - now).to_std().unwrap_or_default();
            info!(%boundary, "Next round boundary");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => break,
            }

            match self.rollover_with_retry(&mut shutdown).await {
                Ok(Some(round)) => info!(round_id = round.id, "Round opened"),
                Ok(None) => break,
                Err(e) => {
                    error!("Round rollover failed: {}", e);
                    tokio::time::sleep(self.engine.config.error_backoff()).await;
                }
            }
        }
        info!("Round manager stopped");
    }

    /// `rollover`, retried a bounded number of times on transient
    /// settlement failures
    pub async fn rollover_with_retry(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ArcadeResult<Option<Round>> {
        let mut attempt = 1;
        loop {
            match self.rollover(shutdown).await {
                Err(e) if e.is_transient() && attempt < ROLLOVER_ATTEMPTS => {
                    warn!(attempt, "Round rollover failed, retrying: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(ROLLOVER_RETRY_DELAY) => {}
                        _ = shutdown.changed() => return Ok(None),
                    }
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Close the current round and open the next one. Returns `None` if
    /// shutdown arrived while waiting for the in-flight turn.
    pub async fn rollover(&self, shutdown: &mut watch::Receiver<bool>) -> ArcadeResult<Option<Round>> {
        let engine = &self.engine;
        let _changing = engine.state.begin_round_change();
        info!("Round change started, pausing new turns");

        tokio::select! {
            _ = tokio::time::sleep(engine.config.rollover_grace()) => {}
            _ = shutdown.changed() => return Ok(None),
        }

        let closing = engine
            .store
            .ensure_first_round(engine.config.default_max_fee, engine.config.default_fee_growth)
            .await?;

        let settlement = engine.settlement.client();
        let multiplier = match settlement.round_multiplier(closing.id).await {
            Ok(multiplier) => multiplier,
            Err(e) => {
                engine.metrics.settlement_failure("round_multiplier");
                return Err(e.into());
            }
        };
        if let Err(e) = settlement.end_round(closing.id, multiplier).await {
            engine.metrics.settlement_failure("end_round");
            return Err(e.into());
        }
        info!(round_id = closing.id, multiplier, "Round ended on settlement layer");

        let round = engine
            .store
            .rollover_round(
                closing.id,
                multiplier,
                engine.config.default_max_fee,
                engine.config.default_fee_growth,
            )
            .await?;
        Ok(Some(round))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_next_boundary_later_today() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        assert_eq!(
            next_boundary(now, 18),
            Utc.with_ymd_and_hms(2024, 5, 1, 18, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_next_boundary_rolls_to_tomorrow() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        assert_eq!(
            next_boundary(now, 0),
            Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_exact_boundary_is_not_next() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        assert_eq!(seconds_until_boundary(now, 0), 86_400);
    }
}
