//! Monitoring and observability
//!
//! This module records reconciliation and synchronization outcomes, derives
//! service health from them and serves both over HTTP.

use crate::error::ProvisionError;
use crate::reconciler::TickReport;
use crate::registry::RegistryState;
use crate::VERSION;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use tracing::debug;

mod health;
mod metrics;

pub use health::{check_health, HealthCheck, HealthStatus, STALE_AFTER_PERIODS};
pub use metrics::{MetricType, MetricValue, MetricsCollector};

/// Reconciler and synchronizer bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Ticks run
    pub ticks: u64,
    /// Ticks whose registry commit failed
    pub failures: u64,
    /// When the last tick finished
    pub last_tick_at: Option<SystemTime>,
    /// When a tick last committed successfully
    pub last_success_at: Option<SystemTime>,
    /// Whether the daemon answered on the last successful tick
    pub daemon_available: bool,
    /// Commit error of the last tick, cleared by the next success
    pub last_error: Option<String>,
    /// Peers in the registry
    pub peers_total: usize,
    /// Peers in the server configuration
    pub peers_active: usize,
    /// Peers connected as of the last tick
    pub peers_connected: usize,
    /// Successful synchronizations
    pub syncs_ok: u64,
    /// Failed synchronizations
    pub syncs_failed: u64,
    /// Error of the last synchronization, cleared by the next success
    pub last_sync_error: Option<String>,
}

/// Monitor shared by the reconciler, the control server and the HTTP endpoint
pub struct Monitor {
    stats: RwLock<ReconcileStats>,
    metrics: Arc<MetricsCollector>,
    reconcile_interval: Duration,
}

impl Monitor {
    /// Create a monitor for a reconciler ticking every `reconcile_interval`
    pub fn new(reconcile_interval: Duration) -> Self {
        Self {
            stats: RwLock::new(ReconcileStats::default()),
            metrics: Arc::new(MetricsCollector::new()),
            reconcile_interval,
        }
    }

    fn update(&self, f: impl FnOnce(&mut ReconcileStats)) {
        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut stats);
    }

    /// Record a committed tick
    pub fn record_tick(&self, report: &TickReport, at: SystemTime) {
        self.update(|s| {
            s.ticks += 1;
            s.last_tick_at = Some(at);
            s.last_success_at = Some(at);
            s.daemon_available = report.daemon_available;
            s.last_error = None;
            s.peers_connected = report.online;
        });

        self.metrics.increment(MetricType::ReconcileTicks);
        if !report.daemon_available {
            self.metrics.increment(MetricType::DaemonUnavailable);
        }
        self.metrics.record(MetricType::PeersConnected, report.online as f64);
        self.metrics.record(MetricType::UnmatchedKeys, report.unmatched as f64);
        debug!("Recorded tick: {} online, {} offline", report.online, report.offline);
    }

    /// Record a tick whose registry commit failed
    pub fn record_tick_failure(&self, err: &ProvisionError, at: SystemTime) {
        self.update(|s| {
            s.ticks += 1;
            s.failures += 1;
            s.last_tick_at = Some(at);
            s.last_error = Some(err.to_string());
        });
        self.metrics.increment(MetricType::ReconcileTicks);
        self.metrics.increment(MetricType::ReconcileFailures);
    }

    /// Refresh registry gauges from a snapshot
    pub fn record_registry(&self, state: &RegistryState) {
        let total = state.peers.len();
        let active = state.peers.iter().filter(|p| p.active).count();
        let rx: u64 = state.peers.iter().map(|p| p.rx_bytes).sum();
        let tx: u64 = state.peers.iter().map(|p| p.tx_bytes).sum();

        self.update(|s| {
            s.peers_total = total;
            s.peers_active = active;
        });
        self.metrics.record(MetricType::PeersTotal, total as f64);
        self.metrics.record(MetricType::PeersActive, active as f64);
        self.metrics.record(MetricType::BytesReceived, rx as f64);
        self.metrics.record(MetricType::BytesTransmitted, tx as f64);
    }

    /// Record the outcome of a server config synchronization
    pub fn record_sync(&self, error: Option<&ProvisionError>) {
        match error {
            None => {
                self.update(|s| {
                    s.syncs_ok += 1;
                    s.last_sync_error = None;
                });
                self.metrics.increment(MetricType::SyncSuccess);
            }
            Some(err) => {
                self.update(|s| {
                    s.syncs_failed += 1;
                    s.last_sync_error = Some(err.to_string());
                });
                self.metrics.increment(MetricType::SyncFailure);
            }
        }
    }

    /// Current bookkeeping
    pub fn stats(&self) -> ReconcileStats {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Get metrics collector
    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    /// Perform health check
    pub fn health_check(&self) -> HealthCheck {
        check_health(&self.stats(), self.reconcile_interval, SystemTime::now())
    }
}

/// HTTP routes for `/healthz` and `/metrics`
pub fn router(monitor: Arc<Monitor>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(monitor)
}

/// Health check endpoint
async fn healthz(State(monitor): State<Arc<Monitor>>) -> impl IntoResponse {
    let health = monitor.health_check();
    let code = if health.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(health))
}

/// Metrics endpoint (Prometheus format)
async fn metrics(State(monitor): State<Arc<Monitor>>) -> impl IntoResponse {
    let mut output = String::new();
    output.push_str("# HELP wg_provisioner_info Provisioner information\n");
    output.push_str("# TYPE wg_provisioner_info gauge\n");
    output.push_str(&format!("wg_provisioner_info{{version=\"{}\"}} 1\n", VERSION));
    output.push_str(&monitor.metrics().export_prometheus());
    (StatusCode::OK, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    fn report(online: usize, daemon_available: bool) -> TickReport {
        TickReport {
            online,
            offline: 1,
            unmatched: 0,
            daemon_available,
        }
    }

    #[test]
    fn test_record_tick() {
        let monitor = Monitor::new(Duration::from_secs(30));
        monitor.record_tick(&report(2, true), SystemTime::now());

        let stats = monitor.stats();
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.peers_connected, 2);
        assert!(monitor.health_check().is_healthy());
    }

    #[test]
    fn test_failure_then_recovery() {
        let monitor = Monitor::new(Duration::from_secs(30));
        monitor.record_tick(&report(0, true), SystemTime::now());
        monitor.record_tick_failure(&ProvisionError::Storage("disk full".into()), SystemTime::now());
        assert!(monitor.health_check().is_unhealthy());
        assert_eq!(monitor.stats().failures, 1);

        monitor.record_tick(&report(0, false), SystemTime::now());
        assert_eq!(monitor.health_check().status, HealthStatus::Degraded);
    }

    #[test]
    fn test_record_sync() {
        let monitor = Monitor::new(Duration::from_secs(30));
        monitor.record_sync(Some(&ProvisionError::ReloadFailed("exit 1".into())));
        assert_eq!(monitor.stats().syncs_failed, 1);
        monitor.record_sync(None);
        let stats = monitor.stats();
        assert_eq!(stats.syncs_ok, 1);
        assert!(stats.last_sync_error.is_none());
    }

    #[tokio::test]
    async fn test_healthz_status_codes() {
        let monitor = Arc::new(Monitor::new(Duration::from_secs(30)));
        let response = healthz(State(monitor.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        monitor.record_tick(&report(1, true), SystemTime::now());
        let response = healthz(State(monitor)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let monitor = Arc::new(Monitor::new(Duration::from_secs(30)));
        monitor.record_tick(&report(1, true), SystemTime::now());

        let response = metrics(State(monitor)).await.into_response();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("wg_provisioner_info{version="));
        assert!(text.contains("wg_provisioner_peers_connected 1"));
    }
}
