//! Command handler for control API
//!
//! Dispatches control requests to the peer registry. Requests that change
//! the set of active peers are followed by a server configuration sync;
//! a failed sync is reported while the registry change stays committed.

use crate::control::api::{AccountView, PeerView};
use crate::control::{ApiError, ApiRequest, ApiResponse, ControlCommand};
use crate::monitoring::Monitor;
use crate::registry::{Peer, PeerId, PeerRegistry};
use crate::wireguard::{ServerConfigSynchronizer, SyncReport};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

type HandlerResult = Result<Option<Value>, ApiError>;

/// Command handler executes API commands against the registry
pub struct CommandHandler {
    registry: Arc<PeerRegistry>,
    synchronizer: Arc<ServerConfigSynchronizer>,
    monitor: Arc<Monitor>,
    default_max_connections: u32,
    /// Serializes write + reload pairs
    sync_lock: Mutex<()>,
}

impl CommandHandler {
    /// Create a new command handler
    pub fn new(
        registry: Arc<PeerRegistry>,
        synchronizer: Arc<ServerConfigSynchronizer>,
        monitor: Arc<Monitor>,
        default_max_connections: u32,
    ) -> Self {
        Self {
            registry,
            synchronizer,
            monitor,
            default_max_connections,
            sync_lock: Mutex::new(()),
        }
    }

    /// Handle an API request
    pub async fn handle_request(&self, request: ApiRequest) -> ApiResponse {
        let action = request.command.action_name();
        debug!("Handling request {}: {}", request.id, action);

        let result = self.dispatch(request.command).await;

        match result {
            Ok(data) => {
                info!("Request {} completed successfully: {}", request.id, action);
                ApiResponse::success(request.id, data)
            }
            Err(e) => {
                error!("Request {} failed: {}", request.id, e);
                ApiResponse::error(request.id, e)
            }
        }
    }

    async fn dispatch(&self, command: ControlCommand) -> HandlerResult {
        let resync = command.changes_active_set();

        let data = match command {
            ControlCommand::CreateAccount {
                account,
                max_connections,
            } => {
                let max = max_connections.unwrap_or(self.default_max_connections);
                self.account_change(move |r| r.create_account(&account, max)).await?
            }
            ControlCommand::SetMaxConnections {
                account,
                max_connections,
            } => {
                self.account_change(move |r| r.set_max_connections(&account, max_connections))
                    .await?
            }
            ControlCommand::RemoveAccount { account } => {
                let name = account.clone();
                let removed = self.blocking(move |r| r.remove_account(&account)).await?;
                json!({ "account": name, "removed_peers": removed.len() })
            }
            ControlCommand::ListAccounts => {
                let state = self.registry.snapshot();
                let views: Vec<AccountView> = state
                    .accounts
                    .iter()
                    .map(|a| AccountView::new(a, &state))
                    .collect();
                json!(views)
            }
            ControlCommand::CreatePeer { account, label } => {
                let peer = self.blocking(move |r| r.create_peer(&account, &label)).await?;
                self.peer_with_profile(&peer)
            }
            ControlCommand::DeletePeer { peer_id } => {
                let peer = self.blocking(move |r| r.delete_peer(PeerId(peer_id))).await?;
                json!({ "deleted": peer.id.0, "label": peer.label })
            }
            ControlCommand::SetPeerActive { peer_id, active } => {
                let peer = self
                    .blocking(move |r| r.set_active(PeerId(peer_id), active))
                    .await?;
                json!(PeerView::new(&peer, &self.registry.snapshot()))
            }
            ControlCommand::ReissueKeys { peer_id } => {
                let peer = self.blocking(move |r| r.reissue_keys(PeerId(peer_id))).await?;
                self.peer_with_profile(&peer)
            }
            ControlCommand::ClientProfile { peer_id } => {
                let peer = self
                    .registry
                    .get_peer(PeerId(peer_id))
                    .ok_or_else(|| ApiError::NotFound(format!("peer {}", peer_id)))?;
                self.peer_with_profile(&peer)
            }
            ControlCommand::ListPeers { account } => {
                let peers = self
                    .blocking(move |r| r.list_peers(account.as_deref()))
                    .await?;
                let state = self.registry.snapshot();
                let views: Vec<PeerView> = peers.iter().map(|p| PeerView::new(p, &state)).collect();
                json!(views)
            }
            ControlCommand::ServerConfig => {
                let registry = self.registry.clone();
                let synchronizer = self.synchronizer.clone();
                let config = tokio::task::spawn_blocking(move || synchronizer.render(&registry))
                    .await
                    .map_err(|e| ApiError::InternalError(format!("worker task failed: {}", e)))?;
                json!({ "config": config })
            }
            ControlCommand::Sync => {
                let report = self.synchronize().await?;
                sync_json(&report)
            }
            ControlCommand::Status => self.status(),
        };

        if resync {
            self.monitor.record_registry(&self.registry.snapshot());
            self.synchronize().await?;
        }

        Ok(Some(data))
    }

    /// Write the server configuration and reload the daemon
    ///
    /// Concurrent callers are serialized so a reload always sees the file
    /// written by the same call.
    pub async fn synchronize(&self) -> Result<SyncReport, ApiError> {
        let _guard = self.sync_lock.lock().await;

        let registry = self.registry.clone();
        let synchronizer = self.synchronizer.clone();
        let result = tokio::task::spawn_blocking(move || synchronizer.apply(&registry))
            .await
            .map_err(|e| ApiError::InternalError(format!("worker task failed: {}", e)))?;

        self.monitor.record_sync(result.as_ref().err());
        result.map_err(|e| {
            warn!("Server config sync failed: {}", e);
            ApiError::from(e)
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, ApiError>
    where
        F: FnOnce(&PeerRegistry) -> crate::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || op(&registry))
            .await
            .map_err(|e| ApiError::InternalError(format!("worker task failed: {}", e)))?
            .map_err(ApiError::from)
    }

    async fn account_change<F>(&self, op: F) -> Result<Value, ApiError>
    where
        F: FnOnce(&PeerRegistry) -> crate::Result<crate::registry::Account> + Send + 'static,
    {
        let account = self.blocking(op).await?;
        Ok(json!(AccountView::new(&account, &self.registry.snapshot())))
    }

    fn peer_with_profile(&self, peer: &Peer) -> Value {
        let state = self.registry.snapshot();
        let profile = self
            .synchronizer
            .renderer()
            .render_client_profile(peer, &state.identity);
        json!({
            "peer": PeerView::new(peer, &state),
            "profile": profile,
        })
    }

    fn status(&self) -> Value {
        let state = self.registry.snapshot();
        let health = self.monitor.health_check();
        let settings = self.synchronizer.renderer().settings();
        json!({
            "version": crate::VERSION,
            "interface": settings.interface,
            "server_public_key": state.identity.public_key.to_base64(),
            "subnet": state.subnet.to_string(),
            "accounts": state.accounts.len(),
            "peers_total": state.peers.len(),
            "peers_active": state.peers.iter().filter(|p| p.active).count(),
            "peers_connected": state.peers.iter().filter(|p| p.connected).count(),
            "addresses_remaining": self.registry.allocator().remaining(state.identity.last_assigned_offset),
            "health": health,
        })
    }
}

fn sync_json(report: &SyncReport) -> Value {
    json!({
        "config_path": report.config_path,
        "peers": report.peers,
        "egress_interface": report.egress_interface,
    })
}
