//! # Prometheus Metrics
//!
//! Operational metrics for the devnet cluster, scraped at `/metrics` on the
//! configured metrics address. Gauges are labelled by node id and refreshed
//! periodically from each node's stats map — the runtime itself stays
//! metrics-agnostic.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, GaugeVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Holds all Prometheus metric handles for the cluster.
#[derive(Clone)]
pub struct ClusterMetrics {
    registry: Registry,
    /// Index of the last decided block, per node (-1 until the first).
    pub last_block_index: IntGaugeVec,
    /// Events settled by the ordering, per node.
    pub consensus_events: IntGaugeVec,
    /// Transactions carried by settled events, per node.
    pub consensus_transactions: IntGaugeVec,
    /// Transactions waiting in the pending pool, per node.
    pub transaction_pool: IntGaugeVec,
    /// Events the ordering has not settled yet, per node.
    pub undetermined_events: IntGaugeVec,
    /// Fraction of outbound sync requests that succeeded, per node.
    pub sync_rate: GaugeVec,
    /// Events settled per second since start, per node.
    pub events_per_second: GaugeVec,
}

impl ClusterMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("weft".into()), None)
            .expect("failed to create prometheus registry");

        fn int_gauge(registry: &Registry, name: &str, help: &str) -> IntGaugeVec {
            let gauge =
                IntGaugeVec::new(Opts::new(name, help), &["node"]).expect("metric creation");
            registry
                .register(Box::new(gauge.clone()))
                .expect("metric registration");
            gauge
        }

        fn gauge(registry: &Registry, name: &str, help: &str) -> GaugeVec {
            let gauge = GaugeVec::new(Opts::new(name, help), &["node"]).expect("metric creation");
            registry
                .register(Box::new(gauge.clone()))
                .expect("metric registration");
            gauge
        }

        Self {
            last_block_index: int_gauge(
                &registry,
                "last_block_index",
                "Index of the last decided block",
            ),
            consensus_events: int_gauge(
                &registry,
                "consensus_events",
                "Events settled by the ordering",
            ),
            consensus_transactions: int_gauge(
                &registry,
                "consensus_transactions",
                "Transactions carried by settled events",
            ),
            transaction_pool: int_gauge(
                &registry,
                "transaction_pool",
                "Transactions waiting in the pending pool",
            ),
            undetermined_events: int_gauge(
                &registry,
                "undetermined_events",
                "Events not yet settled by the ordering",
            ),
            sync_rate: gauge(
                &registry,
                "sync_rate",
                "Fraction of outbound sync requests that succeeded",
            ),
            events_per_second: gauge(
                &registry,
                "events_per_second",
                "Events settled per second since node start",
            ),
            registry,
        }
    }

    /// Refreshes the gauges for one node from its stats map. Unparseable
    /// values are skipped rather than defaulted, so a stale gauge is
    /// distinguishable from a zeroed one.
    pub fn observe(&self, node_id: &str, stats: &BTreeMap<String, String>) {
        let labels = &[node_id];

        if let Some(v) = stats.get("last_block_index").and_then(|s| s.parse().ok()) {
            self.last_block_index.with_label_values(labels).set(v);
        }
        if let Some(v) = stats.get("consensus_events").and_then(|s| s.parse().ok()) {
            self.consensus_events.with_label_values(labels).set(v);
        }
        if let Some(v) = stats
            .get("consensus_transactions")
            .and_then(|s| s.parse().ok())
        {
            self.consensus_transactions.with_label_values(labels).set(v);
        }
        if let Some(v) = stats.get("transaction_pool").and_then(|s| s.parse().ok()) {
            self.transaction_pool.with_label_values(labels).set(v);
        }
        if let Some(v) = stats
            .get("undetermined_events")
            .and_then(|s| s.parse().ok())
        {
            self.undetermined_events.with_label_values(labels).set(v);
        }
        if let Some(v) = stats.get("sync_rate").and_then(|s| s.parse().ok()) {
            self.sync_rate.with_label_values(labels).set(v);
        }
        if let Some(v) = stats
            .get("events_per_second")
            .and_then(|s| s.parse().ok())
        {
            self.events_per_second.with_label_values(labels).set(v);
        }
    }

    /// Encodes all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl Default for ClusterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics handle for axum handlers.
pub type SharedMetrics = Arc<ClusterMetrics>;

/// Axum handler rendering `/metrics`.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_updates_gauges_from_stats() {
        let metrics = ClusterMetrics::new();
        let stats: BTreeMap<String, String> = [
            ("last_block_index", "4"),
            ("consensus_events", "12"),
            ("consensus_transactions", "9"),
            ("transaction_pool", "2"),
            ("undetermined_events", "1"),
            ("sync_rate", "0.80"),
            ("events_per_second", "3.50"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        metrics.observe("0", &stats);

        assert_eq!(metrics.last_block_index.with_label_values(&["0"]).get(), 4);
        assert_eq!(metrics.consensus_events.with_label_values(&["0"]).get(), 12);
        assert!((metrics.sync_rate.with_label_values(&["0"]).get() - 0.8).abs() < 1e-9);

        let encoded = metrics.encode().unwrap();
        assert!(encoded.contains("weft_last_block_index"));
        assert!(encoded.contains("weft_sync_rate"));
    }

    #[test]
    fn unparseable_values_are_skipped() {
        let metrics = ClusterMetrics::new();
        let stats: BTreeMap<String, String> =
            [("last_block_index".to_string(), "nil".to_string())].into();
        metrics.observe("0", &stats);
        // Gauge stays at its default.
        assert_eq!(metrics.last_block_index.with_label_values(&["0"]).get(), 0);
    }
}
