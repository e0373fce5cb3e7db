//! Hardware reconciliation: turn_end and prize_won reports, link status,
//! command forwarding.

mod common;

use claw_arcade::{
    broadcast::ClientEvent,
    hardware::{HardwareCommand, HardwareEvent},
    metrics::anomaly,
    models::EntryStatus,
    reconciler::{handle_event, Reconciler},
    scheduler::{TickOutcome, TurnScheduler},
};
use common::harness;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

async fn start_first_turn(h: &common::Harness) -> u64 {
    match TurnScheduler::new(h.engine.clone()).tick().await.unwrap() {
        TickOutcome::Started(id) => id,
        other => panic!("expected a started turn, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_turn_end_closes_turn_and_starts_next() {
    let h = harness().await;
    h.join("0xA").await;
    h.join("0xB").await;
    let a = start_first_turn(&h).await;

    sleep(Duration::from_secs(12)).await;
    handle_event(&h.engine, HardwareEvent::turn_end()).await.unwrap();

    assert_eq!(h.engine.store.entry(a).await.unwrap().unwrap().status, EntryStatus::Played);
    let active = h.engine.store.active_entry().await.unwrap().unwrap();
    assert_eq!(active.address, "0xB");
    assert_eq!(h.engine.state.current_player().as_deref(), Some("0xB"));
}

#[tokio::test(start_paused = true)]
async fn test_turn_end_with_empty_queue_clears_slot() {
    let mut h = harness().await;
    h.join("0xA").await;
    start_first_turn(&h).await;
    h.drain_events();

    sleep(Duration::from_secs(5)).await;
    handle_event(&h.engine, HardwareEvent::turn_end()).await.unwrap();

    assert!(h.engine.state.current_player().is_none());
    assert_eq!(h.drain_event_names(), vec!["turn_end"]);
}

#[tokio::test(start_paused = true)]
async fn test_turn_end_received_before_turn_start_is_ignored() {
    let h = harness().await;
    h.join("0xA").await;

    // Reported while the slot was being handed over
    let late_report = HardwareEvent::turn_end();
    let a = start_first_turn(&h).await;

    handle_event(&h.engine, late_report).await.unwrap();

    assert_eq!(h.engine.metrics.anomaly_count(anomaly::STALE_TURN_END), 1);
    assert_eq!(h.engine.store.entry(a).await.unwrap().unwrap().status, EntryStatus::Active);
    assert_eq!(h.engine.state.current_player().as_deref(), Some("0xA"));
}

#[tokio::test(start_paused = true)]
async fn test_immediate_turn_end_closes_new_turn() {
    let h = harness().await;
    h.join("0xA").await;
    h.join("0xB").await;
    let a = start_first_turn(&h).await;

    sleep(Duration::from_millis(200)).await;
    handle_event(&h.engine, HardwareEvent::turn_end()).await.unwrap();

    assert_eq!(h.engine.metrics.anomaly_count(anomaly::STALE_TURN_END), 0);
    assert_eq!(h.engine.store.entry(a).await.unwrap().unwrap().status, EntryStatus::Played);
    assert_eq!(h.engine.state.current_player().as_deref(), Some("0xB"));
}

#[tokio::test(start_paused = true)]
async fn test_unmatched_turn_end_counts_anomaly_and_selects_next() {
    let h = harness().await;
    h.join("0xA").await;

    handle_event(&h.engine, HardwareEvent::turn_end()).await.unwrap();

    assert_eq!(h.engine.metrics.anomaly_count(anomaly::UNMATCHED_TURN_END), 1);
    let active = h.engine.store.active_entry().await.unwrap().unwrap();
    assert_eq!(active.address, "0xA");
}

#[tokio::test(start_paused = true)]
async fn test_prize_won_without_key_submits_nothing() {
    let mut h = harness().await;
    h.drain_events();

    handle_event(&h.engine, HardwareEvent::PrizeWon).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    assert!(h.ledger.wins_notified().await.is_empty());
    assert!(h.drain_events().is_empty());
    assert_eq!(h.engine.metrics.settlement_failure_count("notify_win"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_prize_won_settles_current_key() {
    let mut h = harness().await;
    h.join("0xA").await;
    let a = start_first_turn(&h).await;
    h.drain_events();

    handle_event(&h.engine, HardwareEvent::PrizeWon).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    let entry = h.engine.store.entry(a).await.unwrap().unwrap();
    assert!(entry.win);
    assert_eq!(h.ledger.wins_notified().await, vec![entry.key.clone().unwrap()]);

    let events = h.drain_events();
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].event,
        ClientEvent::PrizeWon {
            address: "0xA".to_string()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_second_prize_won_in_one_turn_is_an_anomaly() {
    let h = harness().await;
    h.join("0xA").await;
    start_first_turn(&h).await;

    handle_event(&h.engine, HardwareEvent::PrizeWon).await.unwrap();
    handle_event(&h.engine, HardwareEvent::PrizeWon).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    assert_eq!(h.engine.metrics.anomaly_count(anomaly::DOUBLE_WIN), 1);
    assert_eq!(h.ledger.wins_notified().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_win_flag_resets_for_next_turn() {
    let h = harness().await;
    h.join("0xA").await;
    h.join("0xB").await;
    start_first_turn(&h).await;

    handle_event(&h.engine, HardwareEvent::PrizeWon).await.unwrap();
    sleep(Duration::from_secs(10)).await;
    handle_event(&h.engine, HardwareEvent::turn_end()).await.unwrap();
    handle_event(&h.engine, HardwareEvent::PrizeWon).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    assert_eq!(h.engine.metrics.anomaly_count(anomaly::DOUBLE_WIN), 0);
    assert_eq!(h.ledger.wins_notified().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_link_events_update_health() {
    let mut h = harness().await;
    h.drain_events();

    handle_event(&h.engine, HardwareEvent::Connect).await.unwrap();
    assert!(h.engine.hardware.is_healthy());

    handle_event(&h.engine, HardwareEvent::Disconnect("reset".to_string()))
        .await
        .unwrap();
    assert!(!h.engine.hardware.is_healthy());
    assert!(!h.engine.hardware.health().transport_connected());

    let statuses: Vec<_> = h.drain_events().into_iter().map(|e| e.event).collect();
    assert_eq!(
        statuses,
        vec![
            ClientEvent::LinkStatus { connected: true },
            ClientEvent::LinkStatus { connected: false },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_commands_only_forwarded_when_link_healthy() {
    let mut h = harness().await;
    h.join("0xA").await;
    start_first_turn(&h).await;

    // Link was down when the turn started
    assert!(h.commands.try_recv().is_err());
    assert!(!h.lobby().request_move("0xA", 1));

    handle_event(&h.engine, HardwareEvent::Connect).await.unwrap();
    assert!(h.lobby().request_move("0xA", 5));
    assert!(!h.lobby().request_move("0xB", 5));
    assert_eq!(h.commands.try_recv().unwrap(), HardwareCommand::Move { bitmask: 5 });
    assert!(h.commands.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_turn_start_command_sent_to_healthy_link() {
    let mut h = harness().await;
    handle_event(&h.engine, HardwareEvent::Connect).await.unwrap();
    h.join("0xA").await;
    start_first_turn(&h).await;

    assert_eq!(h.commands.try_recv().unwrap(), HardwareCommand::TurnStart);
}

#[tokio::test(start_paused = true)]
async fn test_reconciler_applies_events_in_order() {
    let h = harness().await;
    h.join("0xA").await;
    h.join("0xB").await;
    start_first_turn(&h).await;
    sleep(Duration::from_secs(10)).await;

    let (events_tx, events_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(Reconciler::new(h.engine.clone(), events_rx).run(shutdown_rx));

    // The win belongs to A; the turn_end then hands the slot to B
    events_tx.send(HardwareEvent::PrizeWon).await.unwrap();
    events_tx.send(HardwareEvent::turn_end()).await.unwrap();
    sleep(Duration::from_secs(5)).await;

    assert_eq!(h.engine.state.current_player().as_deref(), Some("0xB"));
    let wins = h.ledger.wins_notified().await;
    assert_eq!(wins.len(), 1);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}
