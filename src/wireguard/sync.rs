//! Server configuration synchronization
//!
//! Renders the server configuration from a registry snapshot, replaces the
//! live file atomically and asks the daemon to reload. The live file is only
//! replaced once the new one is completely written, so a failed write leaves
//! the running configuration untouched.

use crate::error::{ProvisionError, Result};
use crate::registry::PeerRegistry;
use crate::wireguard::daemon::DaemonController;
use crate::wireguard::render::ConfigRenderer;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Egress interface used when none is configured or detected
pub const FALLBACK_EGRESS_INTERFACE: &str = "eth0";

/// Outcome of a successful synchronization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// File that was written
    pub config_path: PathBuf,
    /// Number of peers in the written configuration
    pub peers: usize,
    /// Egress interface used in the NAT rules
    pub egress_interface: String,
}

/// Writes the server configuration and reloads the daemon
pub struct ServerConfigSynchronizer {
    renderer: ConfigRenderer,
    daemon: Arc<dyn DaemonController>,
    config_path: PathBuf,
    egress_interface: Option<String>,
}

impl ServerConfigSynchronizer {
    /// Create a synchronizer writing `<config_dir>/<interface>.conf`
    pub fn new(
        renderer: ConfigRenderer,
        daemon: Arc<dyn DaemonController>,
        config_dir: &Path,
        egress_interface: Option<String>,
    ) -> Self {
        let config_path = config_dir.join(format!("{}.conf", renderer.settings().interface));
        Self {
            renderer,
            daemon,
            config_path,
            egress_interface,
        }
    }

    /// Canonical configuration path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Renderer used for both documents
    pub fn renderer(&self) -> &ConfigRenderer {
        &self.renderer
    }

    /// Configured egress interface, else the default route's, else `eth0`
    pub fn egress_interface(&self) -> String {
        self.egress_interface
            .clone()
            .or_else(|| self.daemon.default_route_interface())
            .unwrap_or_else(|| FALLBACK_EGRESS_INTERFACE.to_string())
    }

    /// Render the current server configuration without applying it
    pub fn render(&self, registry: &PeerRegistry) -> String {
        self.renderer
            .render_server_config_for(&registry.snapshot(), &self.egress_interface())
    }

    /// Render, write atomically and reload
    pub fn apply(&self, registry: &PeerRegistry) -> Result<SyncReport> {
        let snapshot = registry.snapshot();
        let egress = self.egress_interface();
        let config = self.renderer.render_server_config_for(&snapshot, &egress);
        let peers = snapshot.active_peers().len();

        self.write_config(&config)?;
        self.daemon
            .reload(&self.renderer.settings().interface, &self.config_path)?;

        info!(
            "Applied server config with {} peer(s) to {:?}",
            peers, self.config_path
        );
        Ok(SyncReport {
            config_path: self.config_path.clone(),
            peers,
            egress_interface: egress,
        })
    }

    fn write_config(&self, contents: &str) -> Result<()> {
        let write_failed =
            |what: &str, e: std::io::Error| ProvisionError::ConfigWriteFailed(format!("{}: {}", what, e));

        let dir = match self.config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|e| write_failed("Failed to create config directory", e))?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| write_failed("Failed to create temp file", e))?;
        tmp.write_all(contents.as_bytes())
            .map_err(|e| write_failed("Failed to write config", e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| write_failed("Failed to flush config", e))?;
        tmp.persist(&self.config_path)
            .map_err(|e| write_failed("Failed to replace config", e.error))?;

        debug!("Wrote {} bytes to {:?}", contents.len(), self.config_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryStore;
    use crate::wireguard::daemon::MockDaemonController;
    use crate::wireguard::render::RenderSettings;
    use crate::wireguard::NativeKeyProvider;
    use mockall::predicate::*;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    fn renderer() -> ConfigRenderer {
        ConfigRenderer::new(RenderSettings {
            interface: "wg0".to_string(),
            server_address: Ipv4Addr::new(10, 8, 0, 1),
            subnet: "10.8.0.0/24".parse().unwrap(),
            listen_port: 51820,
            dns: vec!["1.1.1.1".to_string()],
            public_endpoint: "203.0.113.1:51820".to_string(),
            persistent_keepalive: 25,
        })
    }

    fn registry() -> PeerRegistry {
        let registry = PeerRegistry::open(
            Box::new(MemoryStore::new()),
            "10.8.0.0/24".parse().unwrap(),
            Arc::new(NativeKeyProvider),
        )
        .unwrap();
        registry.create_account("alice", 2).unwrap();
        registry.create_peer("alice", "laptop").unwrap();
        registry
    }

    #[test]
    fn test_apply_writes_and_reloads() {
        let dir = TempDir::new().unwrap();
        let expected_path = dir.path().join("wg0.conf");

        let mut daemon = MockDaemonController::new();
        daemon
            .expect_reload()
            .with(eq("wg0"), eq(expected_path.clone()))
            .times(2)
            .returning(|_, _| Ok(()));
        daemon.expect_default_route_interface().never();

        let sync = ServerConfigSynchronizer::new(
            renderer(),
            Arc::new(daemon),
            dir.path(),
            Some("ens3".to_string()),
        );
        let registry = registry();

        let report = sync.apply(&registry).unwrap();
        assert_eq!(report.peers, 1);
        assert_eq!(report.egress_interface, "ens3");
        let first = fs::read_to_string(&expected_path).unwrap();
        assert!(first.contains("-o ens3 -j MASQUERADE"));

        // applying an unchanged registry again rewrites the same bytes
        sync.apply(&registry).unwrap();
        assert_eq!(fs::read_to_string(&expected_path).unwrap(), first);
    }

    #[test]
    fn test_reload_failure_is_surfaced() {
        let dir = TempDir::new().unwrap();
        let mut daemon = MockDaemonController::new();
        daemon
            .expect_reload()
            .returning(|_, _| Err(ProvisionError::ReloadFailed("wg-quick up: exit 1".into())));
        daemon.expect_default_route_interface().returning(|| None);

        let sync = ServerConfigSynchronizer::new(renderer(), Arc::new(daemon), dir.path(), None);
        let err = sync.apply(&registry()).unwrap_err();
        assert!(matches!(err, ProvisionError::ReloadFailed(_)));
    }

    #[test]
    fn test_write_failure_keeps_live_file_and_skips_reload() {
        let dir = TempDir::new().unwrap();
        // a regular file where the config directory should be
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "x").unwrap();

        let mut daemon = MockDaemonController::new();
        daemon.expect_reload().never();
        daemon.expect_default_route_interface().returning(|| None);

        let sync = ServerConfigSynchronizer::new(renderer(), Arc::new(daemon), &blocker, None);
        let err = sync.apply(&registry()).unwrap_err();
        assert!(matches!(err, ProvisionError::ConfigWriteFailed(_)));
        assert_eq!(fs::read_to_string(&blocker).unwrap(), "x");
    }

    #[test]
    fn test_egress_fallbacks() {
        let mut detected = MockDaemonController::new();
        detected
            .expect_default_route_interface()
            .returning(|| Some("enp1s0".to_string()));
        let sync = ServerConfigSynchronizer::new(renderer(), Arc::new(detected), Path::new("/tmp"), None);
        assert_eq!(sync.egress_interface(), "enp1s0");

        let mut undetected = MockDaemonController::new();
        undetected.expect_default_route_interface().returning(|| None);
        let sync = ServerConfigSynchronizer::new(renderer(), Arc::new(undetected), Path::new("/tmp"), None);
        assert_eq!(sync.egress_interface(), FALLBACK_EGRESS_INTERFACE);
        assert_eq!(sync.config_path(), Path::new("/tmp/wg0.conf"));
    }
}
