//! Control API request and response types
//!
//! One JSON object per line in each direction. A request carries an `id`,
//! an `action` and the action's parameters at the top level:
//!
//! ```json
//! {"id":"req-1","action":"create_peer","account":"alice","label":"laptop"}
//! ```

use crate::error::ProvisionError;
use crate::registry::{Account, Peer, RegistryState};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Action and parameters of a control request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Create an account
    CreateAccount {
        /// Account name
        account: String,
        /// Connection limit, server default when omitted
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_connections: Option<u32>,
    },
    /// Change an account's connection limit
    SetMaxConnections {
        /// Account name
        account: String,
        /// New limit
        max_connections: u32,
    },
    /// Remove an account and its peers
    RemoveAccount {
        /// Account name
        account: String,
    },
    /// List accounts
    ListAccounts,
    /// Provision a peer and return its client profile
    CreatePeer {
        /// Owning account
        account: String,
        /// Device label
        label: String,
    },
    /// Remove a peer
    DeletePeer {
        /// Peer id
        peer_id: u64,
    },
    /// Include or exclude a peer from the server configuration
    SetPeerActive {
        /// Peer id
        peer_id: u64,
        /// Desired state
        active: bool,
    },
    /// Rotate a peer's keys and return its new client profile
    ReissueKeys {
        /// Peer id
        peer_id: u64,
    },
    /// Render a peer's client profile
    ClientProfile {
        /// Peer id
        peer_id: u64,
    },
    /// List peers, optionally for one account
    ListPeers {
        /// Restrict to this account
        #[serde(default, skip_serializing_if = "Option::is_none")]
        account: Option<String>,
    },
    /// Render the server configuration without applying it
    ServerConfig,
    /// Write the server configuration and reload the daemon
    Sync,
    /// Service status
    Status,
}

impl ControlCommand {
    /// Whether a successful run changes the set of active peers
    pub fn changes_active_set(&self) -> bool {
        matches!(
            self,
            Self::CreatePeer { .. }
                | Self::DeletePeer { .. }
                | Self::SetPeerActive { .. }
                | Self::ReissueKeys { .. }
                | Self::RemoveAccount { .. }
        )
    }

    /// Action name as it appears on the wire
    pub fn action_name(&self) -> &'static str {
        match self {
            Self::CreateAccount { .. } => "create_account",
            Self::SetMaxConnections { .. } => "set_max_connections",
            Self::RemoveAccount { .. } => "remove_account",
            Self::ListAccounts => "list_accounts",
            Self::CreatePeer { .. } => "create_peer",
            Self::DeletePeer { .. } => "delete_peer",
            Self::SetPeerActive { .. } => "set_peer_active",
            Self::ReissueKeys { .. } => "reissue_keys",
            Self::ClientProfile { .. } => "client_profile",
            Self::ListPeers { .. } => "list_peers",
            Self::ServerConfig => "server_config",
            Self::Sync => "sync",
            Self::Status => "status",
        }
    }
}

/// API request from client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    /// Request ID for tracking
    #[serde(default = "default_request_id")]
    pub id: String,

    /// Action to perform
    #[serde(flatten)]
    pub command: ControlCommand,
}

impl ApiRequest {
    /// Create a new API request
    pub fn new(id: impl Into<String>, command: ControlCommand) -> Self {
        Self {
            id: id.into(),
            command,
        }
    }

    /// Parse from JSON string
    pub fn from_json(json: &str) -> Result<Self, ApiError> {
        serde_json::from_str(json).map_err(|e| ApiError::ParseError(e.to_string()))
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String, ApiError> {
        serde_json::to_string(self).map_err(|e| ApiError::SerializationError(e.to_string()))
    }
}

/// API response to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    /// Request ID this response corresponds to
    pub id: String,

    /// Whether the request was successful
    pub success: bool,

    /// Optional result data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Optional error information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl ApiResponse {
    /// Create a successful response
    pub fn success(id: String, data: Option<serde_json::Value>) -> Self {
        Self {
            id,
            success: true,
            data,
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: String, error: ApiError) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(error),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String, ApiError> {
        serde_json::to_string(self).map_err(|e| ApiError::SerializationError(e.to_string()))
    }

    /// Parse from JSON string
    pub fn from_json(json: &str) -> Result<Self, ApiError> {
        serde_json::from_str(json).map_err(|e| ApiError::ParseError(e.to_string()))
    }
}

/// API error types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", content = "message")]
pub enum ApiError {
    /// Failed to parse request
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Failed to serialize response
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Label already used by the account
    #[error("{0}")]
    DuplicateLabel(String),

    /// Account is at its connection limit
    #[error("{0}")]
    QuotaExceeded(String),

    /// No addresses left in the subnet
    #[error("{0}")]
    AllocationExhausted(String),

    /// Key material could not be produced
    #[error("{0}")]
    KeyGenerationFailed(String),

    /// Tunnel daemon could not be queried
    #[error("{0}")]
    DaemonUnavailable(String),

    /// Registry change committed but the daemon reload failed
    #[error("{0}")]
    ReloadFailed(String),

    /// Registry change committed but the config file could not be written
    #[error("{0}")]
    ConfigWriteFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Invalid request parameters
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Account or peer not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Registry persistence failed
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Operation timed out
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        let message = err.to_string();
        match err {
            ProvisionError::DuplicateLabel { .. } => ApiError::DuplicateLabel(message),
            ProvisionError::QuotaExceeded { .. } => ApiError::QuotaExceeded(message),
            ProvisionError::AllocationExhausted { .. } => ApiError::AllocationExhausted(message),
            ProvisionError::KeyGenerationFailed(_) => ApiError::KeyGenerationFailed(message),
            ProvisionError::DaemonUnavailable(_) => ApiError::DaemonUnavailable(message),
            ProvisionError::ReloadFailed(_) => ApiError::ReloadFailed(message),
            ProvisionError::ConfigWriteFailed(_) => ApiError::ConfigWriteFailed(message),
            ProvisionError::Config(msg) => ApiError::ConfigError(msg),
            ProvisionError::Validation(msg) => ApiError::ValidationError(msg),
            ProvisionError::NotFound(msg) => ApiError::NotFound(msg),
            ProvisionError::Storage(msg) => ApiError::StorageError(msg),
            ProvisionError::Timeout(msg) => ApiError::Timeout(msg),
            ProvisionError::Serialization(msg) => ApiError::SerializationError(msg),
            ProvisionError::Io(_) => ApiError::InternalError(message),
        }
    }
}

fn epoch_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

/// Public view of an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountView {
    /// Account id
    pub id: u64,
    /// Account name
    pub name: String,
    /// Connection limit
    pub max_connections: u32,
    /// Active peers
    pub active_peers: usize,
    /// All peers
    pub total_peers: usize,
}

impl AccountView {
    /// Build the view of `account` within `state`
    pub fn new(account: &Account, state: &RegistryState) -> Self {
        Self {
            id: account.id.0,
            name: account.name.clone(),
            max_connections: account.max_connections,
            active_peers: state.active_count(account.id),
            total_peers: state.peers.iter().filter(|p| p.account_id == account.id).count(),
        }
    }
}

/// Public view of a peer (no secret key material)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerView {
    /// Peer id
    pub id: u64,
    /// Owning account name
    pub account: String,
    /// Device label
    pub label: String,
    /// Overlay address
    pub address: String,
    /// Public key
    pub public_key: String,
    /// Allowed IPs in the client profile
    pub allowed_ips: String,
    /// In the server configuration
    pub active: bool,
    /// Connected as of the last tick
    pub connected: bool,
    /// Last handshake, epoch seconds
    #[serde(default)]
    pub last_handshake_at: Option<u64>,
    /// Last reported endpoint
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Received bytes
    pub rx_bytes: u64,
    /// Transmitted bytes
    pub tx_bytes: u64,
}

impl PeerView {
    /// Build the view of `peer` within `state`
    pub fn new(peer: &Peer, state: &RegistryState) -> Self {
        Self {
            id: peer.id.0,
            account: state
                .account_by_id(peer.account_id)
                .map(|a| a.name.clone())
                .unwrap_or_default(),
            label: peer.label.clone(),
            address: peer.address.to_string(),
            public_key: peer.public_key.to_base64(),
            allowed_ips: peer.allowed_ips.clone(),
            active: peer.active,
            connected: peer.connected,
            last_handshake_at: peer.last_handshake_at.map(epoch_secs),
            endpoint: peer.endpoint.clone(),
            rx_bytes: peer.rx_bytes,
            tx_bytes: peer.tx_bytes,
        }
    }
}

fn default_request_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("req-{}", COUNTER.fetch_add(1, Ordering::SeqCst))
}
