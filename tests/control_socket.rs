//! Self-contained integration tests for the control server
//!
//! Each test starts its own server on a temporary socket and talks to it
//! through `ControlClient`, the same path the CLI uses.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use wg_provisioner::control::{
    ApiError, CommandHandler, ControlClient, ControlCommand, ControlServer, PeerView,
};
use wg_provisioner::monitoring::Monitor;
use wg_provisioner::registry::{MemoryStore, PeerRegistry, Subnet};
use wg_provisioner::wireguard::{
    ConfigRenderer, DaemonController, NativeKeyProvider, PeerDump, RenderSettings, ServerConfigSynchronizer,
};
use wg_provisioner::{ProvisionError, Result};

/// Counts reloads; fails them once `fail` is set
#[derive(Default)]
struct CountingDaemon {
    reloads: AtomicUsize,
    fail: std::sync::atomic::AtomicBool,
}

impl DaemonController for CountingDaemon {
    fn dump_peers(&self, _interface: &str) -> Result<Vec<PeerDump>> {
        Ok(Vec::new())
    }

    fn reload(&self, _interface: &str, _config_path: &Path) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProvisionError::ReloadFailed("wg-quick up exited with 1".to_string()));
        }
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    config_dir: PathBuf,
    daemon: Arc<CountingDaemon>,
    client: ControlClient,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::result::Result<(), ApiError>>,
}

impl Harness {
    async fn start() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let socket_path = dir.path().join("control.sock");
        let config_dir = dir.path().join("wireguard");
        let subnet: Subnet = "10.8.0.0/24".parse().unwrap();

        let registry = Arc::new(
            PeerRegistry::open(Box::new(MemoryStore::new()), subnet, Arc::new(NativeKeyProvider)).unwrap(),
        );
        let daemon = Arc::new(CountingDaemon::default());
        let renderer = ConfigRenderer::new(RenderSettings {
            interface: "wg0".to_string(),
            server_address: Ipv4Addr::new(10, 8, 0, 1),
            subnet,
            listen_port: 51820,
            dns: vec!["1.1.1.1".to_string()],
            public_endpoint: "vpn.example.com:51820".to_string(),
            persistent_keepalive: 25,
        });
        let synchronizer = Arc::new(ServerConfigSynchronizer::new(
            renderer,
            daemon.clone(),
            &config_dir,
            Some("eth0".to_string()),
        ));
        let monitor = Arc::new(Monitor::new(Duration::from_secs(30)));
        let handler = Arc::new(CommandHandler::new(registry, synchronizer, monitor, 2));

        let server = ControlServer::new(socket_path.clone(), handler);
        let listener = server.bind().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = stopped.await;
                })
                .await
        });

        Self {
            _dir: dir,
            config_dir,
            daemon,
            client: ControlClient::new(&socket_path),
            stop: Some(stop),
            task,
        }
    }

    async fn ok(&self, command: ControlCommand) -> serde_json::Value {
        let resp = self.client.send(command).await.unwrap();
        assert!(resp.success, "unexpected error: {:?}", resp.error);
        resp.data.unwrap_or_default()
    }

    async fn err(&self, command: ControlCommand) -> ApiError {
        let resp = self.client.send(command).await.unwrap();
        assert!(!resp.success);
        resp.error.unwrap()
    }

    fn server_config(&self) -> String {
        std::fs::read_to_string(self.config_dir.join("wg0.conf")).unwrap_or_default()
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

fn add_account(name: &str) -> ControlCommand {
    ControlCommand::CreateAccount {
        account: name.to_string(),
        max_connections: None,
    }
}

fn add_peer(account: &str, label: &str) -> ControlCommand {
    ControlCommand::CreatePeer {
        account: account.to_string(),
        label: label.to_string(),
    }
}

#[tokio::test]
async fn test_account_and_peer_lifecycle() {
    let h = Harness::start().await;

    h.ok(add_account("alice")).await;
    let laptop = h.ok(add_peer("alice", "laptop")).await;
    let phone = h.ok(add_peer("alice", "phone")).await;
    assert!(laptop["profile"].as_str().unwrap().contains("Address = 10.8.0.2/32"));
    assert_eq!(phone["peer"]["address"], "10.8.0.3");
    assert_eq!(h.daemon.reloads.load(Ordering::SeqCst), 2);

    assert!(matches!(h.err(add_peer("alice", "tablet")).await, ApiError::QuotaExceeded(_)));
    assert!(matches!(h.err(add_peer("alice", "laptop")).await, ApiError::DuplicateLabel(_)));
    assert_eq!(h.daemon.reloads.load(Ordering::SeqCst), 2);

    let phone_id = phone["peer"]["id"].as_u64().unwrap();
    h.ok(ControlCommand::SetPeerActive {
        peer_id: phone_id,
        active: false,
    })
    .await;
    assert!(!h.server_config().contains("10.8.0.3/32"));

    h.ok(add_peer("alice", "tablet")).await;
    let err = h
        .err(ControlCommand::SetPeerActive {
            peer_id: phone_id,
            active: true,
        })
        .await;
    assert!(matches!(err, ApiError::QuotaExceeded(_)));

    let peers: Vec<PeerView> = serde_json::from_value(
        h.ok(ControlCommand::ListPeers {
            account: Some("alice".to_string()),
        })
        .await,
    )
    .unwrap();
    assert_eq!(peers.len(), 3);
    assert_eq!(peers.iter().filter(|p| p.active).count(), 2);

    h.ok(ControlCommand::RemoveAccount {
        account: "alice".to_string(),
    })
    .await;
    assert!(!h.server_config().contains("[Peer]"));

    h.shutdown().await;
}

#[tokio::test]
async fn test_reissue_keys_returns_new_profile() {
    let h = Harness::start().await;
    h.ok(add_account("bob")).await;

    let created = h.ok(add_peer("bob", "desktop")).await;
    let id = created["peer"]["id"].as_u64().unwrap();
    let old_key = created["peer"]["public_key"].as_str().unwrap().to_string();

    let rotated = h.ok(ControlCommand::ReissueKeys { peer_id: id }).await;
    let new_key = rotated["peer"]["public_key"].as_str().unwrap();
    assert_ne!(new_key, old_key);
    assert_eq!(rotated["peer"]["address"], "10.8.0.2");
    assert_ne!(rotated["profile"], created["profile"]);

    let config = h.server_config();
    assert!(config.contains(new_key));
    assert!(!config.contains(&old_key));

    h.shutdown().await;
}

#[tokio::test]
async fn test_reload_failure_is_reported_but_committed() {
    let h = Harness::start().await;
    h.ok(add_account("carol")).await;
    h.daemon.fail.store(true, Ordering::SeqCst);

    let err = h.err(add_peer("carol", "laptop")).await;
    assert!(matches!(err, ApiError::ReloadFailed(_)));

    // the file was replaced before the reload was attempted
    assert!(h.server_config().contains("# carol/laptop"));

    let peers = h.ok(ControlCommand::ListPeers { account: None }).await;
    assert_eq!(peers.as_array().unwrap().len(), 1);

    h.daemon.fail.store(false, Ordering::SeqCst);
    let report = h.ok(ControlCommand::Sync).await;
    assert_eq!(report["peers"], 1);

    let status = h.ok(ControlCommand::Status).await;
    assert_eq!(status["peers_total"], 1);
    assert_eq!(status["addresses_remaining"], 252);

    h.shutdown().await;
}

#[tokio::test]
async fn test_invalid_input_is_rejected() {
    let h = Harness::start().await;

    assert!(matches!(h.err(add_account("")).await, ApiError::ValidationError(_)));
    h.ok(add_account("dave")).await;
    assert!(matches!(h.err(add_account("dave")).await, ApiError::ValidationError(_)));
    assert!(matches!(
        h.err(add_peer("dave", "bad\nlabel")).await,
        ApiError::ValidationError(_)
    ));
    assert!(matches!(
        h.err(ControlCommand::DeletePeer { peer_id: 99 }).await,
        ApiError::NotFound(_)
    ));
    assert_eq!(h.daemon.reloads.load(Ordering::SeqCst), 0);

    h.shutdown().await;
}
