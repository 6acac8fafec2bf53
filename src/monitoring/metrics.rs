//! Metrics collection and export
//!
//! This module provides Prometheus-style metrics collection.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Metric type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricType {
    /// Peers in the registry
    PeersTotal,
    /// Peers included in the server configuration
    PeersActive,
    /// Peers connected as of the last tick
    PeersConnected,
    /// Reconciliation ticks run
    ReconcileTicks,
    /// Ticks whose registry commit failed
    ReconcileFailures,
    /// Ticks on which the daemon could not be queried
    DaemonUnavailable,
    /// Public keys reported by the daemon but unknown to the registry
    UnmatchedKeys,
    /// Successful server config synchronizations
    SyncSuccess,
    /// Failed server config synchronizations
    SyncFailure,
    /// Bytes received from all peers, as last reported
    BytesReceived,
    /// Bytes sent to all peers, as last reported
    BytesTransmitted,
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PeersTotal => "wg_provisioner_peers_total",
            Self::PeersActive => "wg_provisioner_peers_active",
            Self::PeersConnected => "wg_provisioner_peers_connected",
            Self::ReconcileTicks => "wg_provisioner_reconcile_ticks_total",
            Self::ReconcileFailures => "wg_provisioner_reconcile_failures_total",
            Self::DaemonUnavailable => "wg_provisioner_daemon_unavailable_total",
            Self::UnmatchedKeys => "wg_provisioner_unmatched_keys",
            Self::SyncSuccess => "wg_provisioner_sync_success_total",
            Self::SyncFailure => "wg_provisioner_sync_failure_total",
            Self::BytesReceived => "wg_provisioner_bytes_received",
            Self::BytesTransmitted => "wg_provisioner_bytes_transmitted",
        };
        f.write_str(name)
    }
}

impl MetricType {
    /// Get metric help text
    pub fn help_text(&self) -> &'static str {
        match self {
            Self::PeersTotal => "Number of provisioned peers",
            Self::PeersActive => "Number of peers in the server configuration",
            Self::PeersConnected => "Number of peers with a recent handshake",
            Self::ReconcileTicks => "Total reconciliation ticks",
            Self::ReconcileFailures => "Total reconciliation ticks that failed to commit",
            Self::DaemonUnavailable => "Total ticks on which the tunnel daemon was unavailable",
            Self::UnmatchedKeys => "Daemon peers with no registry record at the last tick",
            Self::SyncSuccess => "Total successful server config synchronizations",
            Self::SyncFailure => "Total failed server config synchronizations",
            Self::BytesReceived => "Bytes received from peers as reported by the daemon",
            Self::BytesTransmitted => "Bytes sent to peers as reported by the daemon",
        }
    }

    /// Get metric type (counter, gauge)
    pub fn metric_kind(&self) -> &'static str {
        match self {
            Self::ReconcileTicks
            | Self::ReconcileFailures
            | Self::DaemonUnavailable
            | Self::SyncSuccess
            | Self::SyncFailure => "counter",
            Self::PeersTotal
            | Self::PeersActive
            | Self::PeersConnected
            | Self::UnmatchedKeys
            | Self::BytesReceived
            | Self::BytesTransmitted => "gauge",
        }
    }
}

/// Metric value with timestamp
#[derive(Debug, Clone)]
pub struct MetricValue {
    /// Value
    pub value: f64,
    /// Timestamp when recorded
    pub timestamp: Instant,
}

impl MetricValue {
    /// Create new metric value
    pub fn new(value: f64) -> Self {
        Self {
            value,
            timestamp: Instant::now(),
        }
    }

    /// Age of the metric
    pub fn age(&self) -> Duration {
        self.timestamp.elapsed()
    }
}

/// Metrics collector with thread-safe access
#[derive(Debug, Default)]
pub struct MetricsCollector {
    values: RwLock<BTreeMap<MetricType, MetricValue>>,
}

impl MetricsCollector {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a gauge
    pub fn record(&self, metric_type: MetricType, value: f64) {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.insert(metric_type, MetricValue::new(value));
    }

    /// Add to a counter
    pub fn increment(&self, metric_type: MetricType) {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        let current = values.get(&metric_type).map_or(0.0, |v| v.value);
        values.insert(metric_type, MetricValue::new(current + 1.0));
    }

    /// Get a metric value
    pub fn get(&self, metric_type: MetricType) -> Option<MetricValue> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        values.get(&metric_type).cloned()
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        let mut output = String::new();

        for (metric_type, value) in values.iter() {
            output.push_str(&format!("# HELP {} {}\n", metric_type, metric_type.help_text()));
            output.push_str(&format!("# TYPE {} {}\n", metric_type, metric_type.metric_kind()));
            output.push_str(&format!("{} {}\n", metric_type, value.value));
        }

        output
    }

    /// Get all metrics as JSON
    pub fn export_json(&self) -> serde_json::Value {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        let mut map = serde_json::Map::new();

        for (metric_type, value) in values.iter() {
            map.insert(
                metric_type.to_string(),
                serde_json::json!({
                    "value": value.value,
                    "age_secs": value.age().as_secs(),
                }),
            );
        }

        serde_json::Value::Object(map)
    }
}
