//! Connection status reconciliation
//!
//! A recurring task compares the daemon's per-peer handshake times with the
//! registry and records which peers are currently connected. Each tick is
//! committed as a single registry transaction. Tick failures are logged and
//! never stop the loop; the next tick starts from scratch.

use crate::error::{ProvisionError, Result};
use crate::monitoring::Monitor;
use crate::registry::{PeerObservation, PeerRegistry};
use crate::wireguard::{DaemonController, PeerDump};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Reconciler timing and target interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerSettings {
    /// Tunnel interface to query
    pub interface: String,
    /// A handshake younger than this marks a peer online
    pub online_threshold: Duration,
    /// Time between ticks
    pub interval: Duration,
    /// Upper bound on a single dump call
    pub daemon_timeout: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            interface: "wg0".to_string(),
            online_threshold: Duration::from_secs(180),
            interval: Duration::from_secs(30),
            daemon_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Peers marked connected
    pub online: usize,
    /// Peers marked disconnected
    pub offline: usize,
    /// Daemon peers with no registry record
    pub unmatched: usize,
    /// Whether the daemon answered the dump request
    pub daemon_available: bool,
}

/// Classify every dumped peer as online or offline as of `now`
pub fn observe(dump: &[PeerDump], now: SystemTime, threshold: Duration) -> HashMap<String, PeerObservation> {
    dump.iter()
        .map(|peer| {
            (
                peer.public_key.clone(),
                PeerObservation {
                    online: peer.is_online(now, threshold),
                    latest_handshake: peer.latest_handshake_time(),
                    endpoint: peer.endpoint.clone(),
                    rx_bytes: peer.rx_bytes,
                    tx_bytes: peer.tx_bytes,
                },
            )
        })
        .collect()
}

/// Background task keeping `connected` flags in line with the daemon
pub struct ConnectionStatusReconciler {
    registry: Arc<PeerRegistry>,
    daemon: Arc<dyn DaemonController>,
    monitor: Arc<Monitor>,
    settings: ReconcilerSettings,
}

impl ConnectionStatusReconciler {
    /// Create a reconciler
    pub fn new(
        registry: Arc<PeerRegistry>,
        daemon: Arc<dyn DaemonController>,
        monitor: Arc<Monitor>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            registry,
            daemon,
            monitor,
            settings,
        }
    }

    /// Dump the daemon's peers, bounded by the daemon timeout
    async fn fetch_dump(&self) -> Result<Vec<PeerDump>> {
        let daemon = self.daemon.clone();
        let interface = self.settings.interface.clone();
        let call = tokio::task::spawn_blocking(move || daemon.dump_peers(&interface));

        match tokio::time::timeout(self.settings.daemon_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ProvisionError::DaemonUnavailable(format!("dump task failed: {}", e))),
            Err(_) => Err(ProvisionError::DaemonUnavailable(format!(
                "dump timed out after {:?}",
                self.settings.daemon_timeout
            ))),
        }
    }

    /// Run one tick as of `now`
    pub async fn tick_at(&self, now: SystemTime) -> Result<TickReport> {
        let (observations, daemon_available) = match self.fetch_dump().await {
            Ok(dump) => {
                if dump.is_empty() {
                    debug!("Daemon reports no peers on {}", self.settings.interface);
                }
                (observe(&dump, now, self.settings.online_threshold), true)
            }
            Err(e) => {
                warn!("Treating all peers as offline: {}", e);
                (HashMap::new(), false)
            }
        };

        let registry = self.registry.clone();
        let applied = tokio::task::spawn_blocking(move || registry.apply_connection_states(&observations))
            .await
            .map_err(|e| ProvisionError::Storage(format!("reconcile task failed: {}", e)))
            .and_then(|result| result);

        match applied {
            Ok(update) => {
                let report = TickReport {
                    online: update.online,
                    offline: update.offline,
                    unmatched: update.unmatched,
                    daemon_available,
                };
                self.monitor.record_tick(&report, now);
                self.monitor.record_registry(&self.registry.snapshot());
                if report.unmatched > 0 {
                    debug!("Ignoring {} daemon peer(s) unknown to the registry", report.unmatched);
                }
                debug!(
                    "Reconciled: {} online, {} offline",
                    report.online, report.offline
                );
                Ok(report)
            }
            Err(e) => {
                self.monitor.record_tick_failure(&e, now);
                Err(e)
            }
        }
    }

    /// Run one tick against the wall clock
    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(SystemTime::now()).await
    }

    /// Start ticking every `interval` until the returned handle is stopped
    pub fn spawn(self) -> ReconcilerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        ReconcilerHandle { stop: stop_tx, task }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        info!(
            "Reconciler started for {} (every {:?})",
            self.settings.interface, self.settings.interval
        );

        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Reconciliation error: {}", e);
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }
}

/// Handle to a running reconciler
pub struct ReconcilerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Signal the loop to stop and wait for it to finish
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!("Reconciler task ended abnormally: {}", e);
        }
    }

    /// Whether the loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
