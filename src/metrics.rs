//! Prometheus metrics for the arcade engine

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Anomaly kinds counted under `claw_anomalies_total`
pub mod anomaly {
    pub const UNMATCHED_TURN_END: &str = "unmatched_turn_end";
    pub const STALE_TURN_END: &str = "stale_turn_end";
    pub const DOUBLE_WIN: &str = "double_win";
    pub const ORPHANED_ACTIVE: &str = "orphaned_active";
}

/// Where a turn was closed from
#[derive(Debug, Clone, Copy)]
pub enum CloseSource {
    Scheduler,
    Hardware,
    Recovery,
}

impl CloseSource {
    fn label(self) -> &'static str {
        match self {
            CloseSource::Scheduler => "scheduler",
            CloseSource::Hardware => "hardware",
            CloseSource::Recovery => "recovery",
        }
    }
}

#[derive(Clone)]
pub struct ArcadeMetrics {
    registry: Registry,
    turns_started: IntCounter,
    turns_closed: IntCounterVec,
    anomalies: IntCounterVec,
    settlement_failures: IntCounterVec,
    connected_clients: IntGauge,
    queue_length: IntGauge,
}

impl ArcadeMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let turns_started = IntCounter::new("claw_turns_started_total", "Turns handed to a player")?;
        let turns_closed = IntCounterVec::new(
            Opts::new("claw_turns_closed_total", "Turns closed, by source"),
            &["source"],
        )?;
        let anomalies = IntCounterVec::new(
            Opts::new("claw_anomalies_total", "Divergence between durable and in-memory state"),
            &["kind"],
        )?;
        let settlement_failures = IntCounterVec::new(
            Opts::new("claw_settlement_failures_total", "Failed settlement operations"),
            &["operation"],
        )?;
        let connected_clients = IntGauge::new("claw_connected_clients", "Open client sessions")?;
        let queue_length = IntGauge::new("claw_queue_length", "Entries waiting for a turn")?;

        registry.register(Box::new(turns_started.clone()))?;
        registry.register(Box::new(turns_closed.clone()))?;
        registry.register(Box::new(anomalies.clone()))?;
        registry.register(Box::new(settlement_failures.clone()))?;
        registry.register(Box::new(connected_clients.clone()))?;
        registry.register(Box::new(queue_length.clone()))?;

        Ok(Self {
            registry,
            turns_started,
            turns_closed,
            anomalies,
            settlement_failures,
            connected_clients,
            queue_length,
        })
    }

    pub fn turn_started(&self) {
        self.turns_started.inc();
    }

    pub fn turn_closed(&self, source: CloseSource) {
        self.turns_closed.with_label_values(&[source.label()]).inc();
    }

    pub fn anomaly(&self, kind: &str) {
        self.anomalies.with_label_values(&[kind]).inc();
    }

    pub fn anomaly_count(&self, kind: &str) -> u64 {
        self.anomalies.with_label_values(&[kind]).get()
    }

    pub fn settlement_failure(&self, operation: &str) {
        self.settlement_failures.with_label_values(&[operation]).inc();
    }

    pub fn settlement_failure_count(&self, operation: &str) -> u64 {
        self.settlement_failures.with_label_values(&[operation]).get()
    }

    pub fn turns_started_count(&self) -> u64 {
        self.turns_started.get()
    }

    pub fn client_connected(&self) {
        self.connected_clients.inc();
    }

    pub fn client_disconnected(&self) {
        self.connected_clients.dec();
    }

    pub fn set_queue_length(&self, length: u64) {
        self.queue_length.set(length as i64);
    }

    /// Text exposition format for `/metrics`
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let metrics = ArcadeMetrics::new().unwrap();
        metrics.turn_started();
        metrics.turn_closed(CloseSource::Hardware);
        metrics.anomaly(anomaly::DOUBLE_WIN);
        metrics.set_queue_length(4);

        let text = metrics.render().unwrap();
        assert!(text.contains("claw_turns_started_total 1"));
        assert!(text.contains("claw_turns_closed_total{source=\"hardware\"} 1"));
        assert!(text.contains("claw_anomalies_total{kind=\"double_win\"} 1"));
        assert!(text.contains("claw_queue_length 4"));
    }

    #[test]
    fn test_independent_registries() {
        let first = ArcadeMetrics::new().unwrap();
        let second = ArcadeMetrics::new().unwrap();
        first.anomaly(anomaly::UNMATCHED_TURN_END);
        assert_eq!(first.anomaly_count(anomaly::UNMATCHED_TURN_END), 1);
        assert_eq!(second.anomaly_count(anomaly::UNMATCHED_TURN_END), 0);
    }
}
