//! Round rollover against the simulated ledger

mod common;

use claw_arcade::{
    models::EntryStatus,
    rounds::RoundManager,
    scheduler::{TickOutcome, TurnScheduler},
    settlement::SettlementClient,
};
use common::{harness, join_request};
use std::time::Duration;
use tokio::sync::watch;

#[tokio::test(start_paused = true)]
async fn test_rollover_closes_round_and_carries_queue() {
    let h = harness().await;
    h.join("0xA").await;
    h.join("0xB").await;
    h.ledger.set_round_multiplier(1, 140).await;

    let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let manager = RoundManager::new(h.engine.clone());

    let started = tokio::time::Instant::now();
    let round = manager.rollover(&mut shutdown_rx).await.unwrap().unwrap();

    // In-flight turns get one and a half turn lengths to finish
    assert_eq!(started.elapsed(), Duration::from_secs(45));
    assert_eq!(round.id, 2);
    assert!(!round.is_closed());
    assert!(h.ledger.round_ended(1).await);
    assert!(!h.engine.state.is_round_changing());

    let current = h.engine.store.current_round().await.unwrap().unwrap();
    assert_eq!(current.id, 2);

    let queued = h.engine.store.queued_entries().await.unwrap();
    assert_eq!(queued.len(), 2);
    assert!(queued.iter().all(|e| e.round_id == 2 && e.status == EntryStatus::Queued));
    assert_eq!(queued[0].address, "0xA");
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_resumes_in_new_round() {
    let h = harness().await;
    h.join("0xA").await;

    let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
    RoundManager::new(h.engine.clone())
        .rollover(&mut shutdown_rx)
        .await
        .unwrap();

    match TurnScheduler::new(h.engine.clone()).tick().await.unwrap() {
        TickOutcome::Started(id) => {
            let entry = h.engine.store.entry(id).await.unwrap().unwrap();
            assert_eq!(entry.address, "0xA");
            assert_eq!(entry.round_id, 2);
        }
        other => panic!("expected a started turn, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_player_may_rejoin_after_rollover_once_played() {
    let h = harness().await;
    h.join("0xA").await;
    TurnScheduler::new(h.engine.clone()).tick().await.unwrap();

    let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
    RoundManager::new(h.engine.clone())
        .rollover(&mut shutdown_rx)
        .await
        .unwrap();

    // A is still active in round 1, which does not block round 2
    assert_eq!(h.join("0xA").await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_end_round_lowers_flag() {
    let h = harness().await;
    let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let manager = RoundManager::new(h.engine.clone());

    manager.rollover(&mut shutdown_rx).await.unwrap();
    // Round 2 already ended on the ledger, so closing it again is rejected
    h.ledger.end_round(2, 100).await.unwrap();

    let result = manager.rollover(&mut shutdown_rx).await;
    assert!(result.is_err());
    assert!(!h.engine.state.is_round_changing());
    assert_eq!(h.engine.metrics.settlement_failure_count("end_round"), 1);
    assert_eq!(h.engine.store.current_round().await.unwrap().unwrap().id, 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_rollover_wait() {
    let h = harness().await;
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let engine = h.engine.clone();

    let task = tokio::spawn(async move {
        RoundManager::new(engine).rollover(&mut shutdown_rx).await
    });
    shutdown_tx.send(true).unwrap();

    assert!(task.await.unwrap().unwrap().is_none());
    assert!(!h.engine.state.is_round_changing());
    assert_eq!(h.engine.store.current_round().await.unwrap().unwrap().id, 1);
    assert!(!h.ledger.round_ended(1).await);
}

#[tokio::test(start_paused = true)]
async fn test_join_straddling_rollover_lands_in_new_round() {
    let h = harness().await;
    h.ledger.fail_next_bets(1).await;

    let lobby = h.lobby();
    let join = tokio::spawn(async move { lobby.join_queue("0xA", join_request(20)).await });

    // The first bet attempt failed; roll over while the retry is pending
    tokio::time::sleep(Duration::from_millis(500)).await;
    let next = h.engine.store.rollover_round(1, 100, 20, 50).await.unwrap();
    assert_eq!(next.id, 2);

    assert_eq!(join.await.unwrap().unwrap(), 1);
    let queued = h.engine.store.queued_entries().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].round_id, 2);

    match TurnScheduler::new(h.engine.clone()).tick().await.unwrap() {
        TickOutcome::Started(id) => {
            assert_eq!(h.engine.store.entry(id).await.unwrap().unwrap().address, "0xA");
        }
        other => panic!("expected a started turn, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_end_round_failure_is_retried() {
    let h = harness().await;
    h.join("0xA").await;
    h.ledger.fail_next_end_rounds(1).await;
    let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let started = tokio::time::Instant::now();
    let round = RoundManager::new(h.engine.clone())
        .rollover_with_retry(&mut shutdown_rx)
        .await
        .unwrap()
        .unwrap();

    // Two grace periods around one retry delay
    assert_eq!(started.elapsed(), Duration::from_secs(150));
    assert_eq!(round.id, 2);
    assert!(h.ledger.round_ended(1).await);
    assert_eq!(h.engine.metrics.settlement_failure_count("end_round"), 1);
    assert_eq!(h.engine.store.next_queued(2).await.unwrap().unwrap().address, "0xA");
}

#[tokio::test(start_paused = true)]
async fn test_rollover_retries_are_bounded() {
    let h = harness().await;
    h.ledger.fail_next_end_rounds(10).await;
    let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let result = RoundManager::new(h.engine.clone())
        .rollover_with_retry(&mut shutdown_rx)
        .await;

    assert!(result.is_err());
    assert_eq!(h.engine.metrics.settlement_failure_count("end_round"), 3);
    assert!(!h.engine.state.is_round_changing());
    assert_eq!(h.engine.store.current_round().await.unwrap().unwrap().id, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_end_round_is_not_retried() {
    let h = harness().await;
    h.ledger.end_round(1, 100).await.unwrap();
    let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let started = tokio::time::Instant::now();
    let result = RoundManager::new(h.engine.clone())
        .rollover_with_retry(&mut shutdown_rx)
        .await;

    assert!(result.is_err());
    assert_eq!(started.elapsed(), Duration::from_secs(45));
    assert_eq!(h.engine.metrics.settlement_failure_count("end_round"), 1);
}
