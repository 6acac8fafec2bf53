//! Health check implementation
//!
//! Health is derived from the reconciler's recent history: a service whose
//! background loop stopped committing is unhealthy even if the daemon is up.

use super::ReconcileStats;
use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Number of reconciliation periods after which the last success is stale
pub const STALE_AFTER_PERIODS: u32 = 3;

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Service is healthy
    Healthy,
    /// Service is degraded
    Degraded,
    /// Service is unhealthy
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health check result
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// Overall health status
    pub status: HealthStatus,
    /// When the check ran, epoch seconds
    pub checked_at: u64,
    /// Peers connected as of the last tick
    pub peers_connected: usize,
    /// Peers in the server configuration
    pub peers_active: usize,
    /// Additional details
    pub details: String,
}

impl HealthCheck {
    /// Check if healthy
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// Check if unhealthy
    pub fn is_unhealthy(&self) -> bool {
        self.status == HealthStatus::Unhealthy
    }
}

/// Assess reconciler health as of `now`
pub fn check_health(stats: &ReconcileStats, reconcile_interval: Duration, now: SystemTime) -> HealthCheck {
    debug!("Performing health check");

    let mut status = HealthStatus::Healthy;
    let mut details = Vec::new();

    match stats.last_success_at {
        None => {
            status = HealthStatus::Unhealthy;
            details.push("no successful reconciliation yet".to_string());
        }
        Some(at) => {
            let age = now.duration_since(at).unwrap_or(Duration::ZERO);
            if age > reconcile_interval * STALE_AFTER_PERIODS {
                status = HealthStatus::Unhealthy;
                details.push(format!("last successful reconciliation {}s ago", age.as_secs()));
            }
        }
    }

    if let Some(err) = &stats.last_error {
        status = HealthStatus::Unhealthy;
        details.push(format!("registry commit failed: {}", err));
    }

    if !stats.daemon_available && stats.last_success_at.is_some() {
        if status == HealthStatus::Healthy {
            status = HealthStatus::Degraded;
        }
        details.push("tunnel daemon unavailable".to_string());
    }

    if let Some(err) = &stats.last_sync_error {
        if status == HealthStatus::Healthy {
            status = HealthStatus::Degraded;
        }
        details.push(format!("last sync failed: {}", err));
    }

    HealthCheck {
        status,
        checked_at: now.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs()),
        peers_connected: stats.peers_connected,
        peers_active: stats.peers_active,
        details: if details.is_empty() {
            "All systems operational".to_string()
        } else {
            details.join("; ")
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(30);

    fn healthy_stats(now: SystemTime) -> ReconcileStats {
        ReconcileStats {
            ticks: 1,
            last_tick_at: Some(now),
            last_success_at: Some(now),
            daemon_available: true,
            ..ReconcileStats::default()
        }
    }

    #[test]
    fn test_health_status_display() {
        assert_eq!(HealthStatus::Healthy.to_string(), "healthy");
        assert_eq!(HealthStatus::Degraded.to_string(), "degraded");
        assert_eq!(HealthStatus::Unhealthy.to_string(), "unhealthy");
    }

    #[test]
    fn test_no_ticks_is_unhealthy() {
        let health = check_health(&ReconcileStats::default(), INTERVAL, SystemTime::now());
        assert!(health.is_unhealthy());
    }

    #[test]
    fn test_recent_success_is_healthy() {
        let now = SystemTime::now();
        let health = check_health(&healthy_stats(now), INTERVAL, now + Duration::from_secs(60));
        assert!(health.is_healthy());
        assert_eq!(health.details, "All systems operational");
    }

    #[test]
    fn test_stale_success_is_unhealthy() {
        let now = SystemTime::now();
        let health = check_health(&healthy_stats(now), INTERVAL, now + Duration::from_secs(91));
        assert!(health.is_unhealthy());
    }

    #[test]
    fn test_daemon_down_is_degraded() {
        let now = SystemTime::now();
        let mut stats = healthy_stats(now);
        stats.daemon_available = false;
        let health = check_health(&stats, INTERVAL, now);
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(health.details.contains("daemon"));
    }

    #[test]
    fn test_commit_failure_is_unhealthy() {
        let now = SystemTime::now();
        let mut stats = healthy_stats(now);
        stats.last_error = Some("disk full".to_string());
        let health = check_health(&stats, INTERVAL, now);
        assert!(health.is_unhealthy());
    }

    #[test]
    fn test_serializes_lowercase_status() {
        let now = SystemTime::now();
        let health = check_health(&healthy_stats(now), INTERVAL, now);
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["status"], "healthy");
    }
}
