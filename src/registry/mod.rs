//! Peer registry
//!
//! The registry is the single source of truth for accounts, peers and the
//! server identity. Every mutation runs as a transaction: the current state
//! is cloned, the clone is mutated, committed to the backing store and only
//! then published to readers. A failure at any step leaves both the
//! in-memory state and the store untouched, and readers never observe a
//! half-applied change.

mod allocator;
mod store;

pub use allocator::{AddressAllocator, Subnet, FIRST_PEER_OFFSET, SERVER_OFFSET};
pub use store::{JsonFileStore, MemoryStore, RegistryStore};

#[cfg(test)]
pub use store::MockRegistryStore;

use crate::config::validation::{validate_account_name, validate_cidr_list, validate_label};
use crate::error::{ProvisionError, Result};
use crate::wireguard::{KeyMaterialProvider, KeyPair, PresharedKey, PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::SystemTime;
use tracing::{debug, info};

/// Default allowed-destinations handed to new peers (full tunnel)
pub const DEFAULT_ALLOWED_IPS: &str = "0.0.0.0/0";

/// Account identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub u64);

/// Peer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The server's key pair and the address allocation counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// Server private key
    pub private_key: PrivateKey,
    /// Server public key
    pub public_key: PublicKey,
    /// Host offset of the most recently allocated peer address
    pub last_assigned_offset: u32,
}

impl ServerIdentity {
    /// Identity for a freshly bootstrapped server
    pub fn new(keypair: KeyPair) -> Self {
        Self {
            private_key: keypair.private,
            public_key: keypair.public,
            last_assigned_offset: SERVER_OFFSET,
        }
    }
}

/// A human owner of peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account id
    pub id: AccountId,
    /// Unique account name
    pub name: String,
    /// Upper bound on simultaneously active peers
    pub max_connections: u32,
    /// Creation time
    pub created_at: SystemTime,
}

/// One provisioned device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Peer id
    pub id: PeerId,
    /// Owning account
    pub account_id: AccountId,
    /// Device label, unique per account
    pub label: String,
    /// Peer private key (handed to the client in its profile)
    pub private_key: PrivateKey,
    /// Peer public key, unique across the registry
    pub public_key: PublicKey,
    /// Pre-shared key shared with the server
    pub preshared_key: PresharedKey,
    /// Overlay address, unique across the registry
    pub address: Ipv4Addr,
    /// Destinations the client routes through the tunnel
    pub allowed_ips: String,
    /// Included in the server configuration
    pub active: bool,
    /// Handshake seen within the online threshold at the last tick
    pub connected: bool,
    /// Most recent handshake observed while online
    pub last_handshake_at: Option<SystemTime>,
    /// Last endpoint the daemon reported for this peer
    pub endpoint: Option<String>,
    /// Bytes received from the peer, as last reported
    pub rx_bytes: u64,
    /// Bytes sent to the peer, as last reported
    pub tx_bytes: u64,
    /// Creation time
    pub created_at: SystemTime,
}

/// An active peer together with its owner's name
#[derive(Debug, Clone, Copy)]
pub struct ActivePeer<'a> {
    /// Owning account name
    pub owner: &'a str,
    /// The peer
    pub peer: &'a Peer,
}

/// What the daemon reported about one public key during a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerObservation {
    /// Handshake within the online threshold
    pub online: bool,
    /// Latest handshake, `None` if never
    pub latest_handshake: Option<SystemTime>,
    /// Current endpoint
    pub endpoint: Option<String>,
    /// Received bytes
    pub rx_bytes: u64,
    /// Transmitted bytes
    pub tx_bytes: u64,
}

/// Outcome of applying one reconciliation tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionUpdate {
    /// Peers marked connected
    pub online: usize,
    /// Peers marked disconnected
    pub offline: usize,
    /// Reported keys with no registry record
    pub unmatched: usize,
}

/// Complete registry contents, as committed to the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryState {
    /// Subnet the allocation counter refers to
    pub subnet: Subnet,
    /// Server identity
    pub identity: ServerIdentity,
    /// Accounts in creation order
    pub accounts: Vec<Account>,
    /// Peers in creation order
    pub peers: Vec<Peer>,
    next_account_id: u64,
    next_peer_id: u64,
}

impl RegistryState {
    /// Empty registry for a freshly bootstrapped server
    pub fn new(subnet: Subnet, identity: ServerIdentity) -> Self {
        Self {
            subnet,
            identity,
            accounts: Vec::new(),
            peers: Vec::new(),
            next_account_id: 1,
            next_peer_id: 1,
        }
    }

    /// Look up an account by name
    pub fn account(&self, name: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.name == name)
    }

    /// Look up an account by id
    pub fn account_by_id(&self, id: AccountId) -> Option<&Account> {
        self.accounts.iter().find(|a| a.id == id)
    }

    /// Look up a peer by id
    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// Active peers in creation order, with owner names
    pub fn active_peers(&self) -> Vec<ActivePeer<'_>> {
        self.peers
            .iter()
            .filter(|p| p.active)
            .map(|peer| ActivePeer {
                owner: self
                    .account_by_id(peer.account_id)
                    .map(|a| a.name.as_str())
                    .unwrap_or("unknown"),
                peer,
            })
            .collect()
    }

    /// Number of active peers owned by `account`
    pub fn active_count(&self, account: AccountId) -> usize {
        self.peers
            .iter()
            .filter(|p| p.account_id == account && p.active)
            .count()
    }

    fn require_account(&self, name: &str) -> Result<Account> {
        self.account(name)
            .cloned()
            .ok_or_else(|| ProvisionError::NotFound(format!("account '{}'", name)))
    }

    fn peer_mut(&mut self, id: PeerId) -> Result<&mut Peer> {
        self.peers
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| ProvisionError::NotFound(format!("peer {}", id)))
    }

    fn check_quota(&self, account: &Account) -> Result<()> {
        if self.active_count(account.id) >= account.max_connections as usize {
            return Err(ProvisionError::QuotaExceeded {
                account: account.name.clone(),
                max: account.max_connections,
            });
        }
        Ok(())
    }

    fn issue_keys(
        &self,
        keys: &dyn KeyMaterialProvider,
    ) -> Result<(KeyPair, PresharedKey)> {
        let keypair = keys.generate_keypair()?;
        if self.peers.iter().any(|p| p.public_key == keypair.public)
            || keypair.public == self.identity.public_key
        {
            return Err(ProvisionError::KeyGenerationFailed(
                "generated public key collides with an existing key".to_string(),
            ));
        }
        let preshared = keys.generate_preshared_key()?;
        Ok((keypair, preshared))
    }
}

/// Shared, transactional registry of accounts and peers
pub struct PeerRegistry {
    state: RwLock<Arc<RegistryState>>,
    writer: Mutex<()>,
    store: Box<dyn RegistryStore>,
    allocator: AddressAllocator,
    keys: Arc<dyn KeyMaterialProvider>,
    default_allowed_ips: String,
}

impl fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRegistry").finish_non_exhaustive()
    }
}

impl PeerRegistry {
    /// Open the registry, bootstrapping a server identity on first use
    pub fn open(
        store: Box<dyn RegistryStore>,
        subnet: Subnet,
        keys: Arc<dyn KeyMaterialProvider>,
    ) -> Result<Self> {
        let state = match store.load()? {
            Some(state) => Self::check_loaded(state, subnet)?,
            None => {
                info!("Bootstrapping server identity for subnet {}", subnet);
                let state = RegistryState::new(subnet, ServerIdentity::new(keys.generate_keypair()?));
                store.commit(&state)?;
                info!("Server public key: {}", state.identity.public_key);
                state
            }
        };
        Ok(Self::with_state(store, state, subnet, keys))
    }

    /// Open a registry that must already exist; never writes to the store
    pub fn open_existing(
        store: Box<dyn RegistryStore>,
        subnet: Subnet,
        keys: Arc<dyn KeyMaterialProvider>,
    ) -> Result<Self> {
        let state = store.load()?.ok_or_else(|| {
            ProvisionError::NotFound("no registry state has been initialized; run `init` first".to_string())
        })?;
        let state = Self::check_loaded(state, subnet)?;
        Ok(Self::with_state(store, state, subnet, keys))
    }

    fn check_loaded(state: RegistryState, subnet: Subnet) -> Result<RegistryState> {
        if state.subnet != subnet {
            return Err(ProvisionError::Config(format!(
                "Stored registry uses subnet {} but {} is configured",
                state.subnet, subnet
            )));
        }
        debug!(
            "Loaded registry: {} accounts, {} peers",
            state.accounts.len(),
            state.peers.len()
        );
        Ok(state)
    }

    fn with_state(
        store: Box<dyn RegistryStore>,
        state: RegistryState,
        subnet: Subnet,
        keys: Arc<dyn KeyMaterialProvider>,
    ) -> Self {
        Self {
            state: RwLock::new(Arc::new(state)),
            writer: Mutex::new(()),
            store,
            allocator: AddressAllocator::new(subnet),
            keys,
            default_allowed_ips: DEFAULT_ALLOWED_IPS.to_string(),
        }
    }

    /// Override the allowed-destinations given to new peers
    pub fn with_default_allowed_ips(mut self, allowed_ips: &str) -> Result<Self> {
        validate_cidr_list(allowed_ips)?;
        self.default_allowed_ips = allowed_ips.to_string();
        Ok(self)
    }

    /// Consistent point-in-time view of the registry
    pub fn snapshot(&self) -> Arc<RegistryState> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Address allocator for this registry's subnet
    pub fn allocator(&self) -> AddressAllocator {
        self.allocator
    }

    /// Run `f` against a private copy of the state and publish it on success
    fn transact<T>(&self, f: impl FnOnce(&mut RegistryState) -> Result<T>) -> Result<T> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot();
        let mut next = (*current).clone();

        let value = f(&mut next)?;

        if next != *current {
            self.store.commit(&next)?;
            *self.state.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        }
        Ok(value)
    }

    /// Server identity
    pub fn identity(&self) -> ServerIdentity {
        self.snapshot().identity.clone()
    }

    /// Allocate the next overlay address without creating a peer
    pub fn allocate_address(&self) -> Result<Ipv4Addr> {
        let allocator = self.allocator;
        self.transact(|state| allocator.allocate(&mut state.identity.last_assigned_offset))
    }

    /// Create an account
    pub fn create_account(&self, name: &str, max_connections: u32) -> Result<Account> {
        validate_account_name(name)?;
        self.transact(|state| {
            if state.account(name).is_some() {
                return Err(ProvisionError::Validation(format!(
                    "Account '{}' already exists",
                    name
                )));
            }

            let account = Account {
                id: AccountId(state.next_account_id),
                name: name.to_string(),
                max_connections,
                created_at: SystemTime::now(),
            };
            state.next_account_id += 1;
            state.accounts.push(account.clone());
            info!("Created account '{}' (max {} connections)", name, max_connections);
            Ok(account)
        })
    }

    /// Change an account's connection limit
    ///
    /// Lowering the limit below the current active count does not deactivate
    /// anything; it only blocks further activations.
    pub fn set_max_connections(&self, name: &str, max_connections: u32) -> Result<Account> {
        self.transact(|state| {
            let account = state
                .accounts
                .iter_mut()
                .find(|a| a.name == name)
                .ok_or_else(|| ProvisionError::NotFound(format!("account '{}'", name)))?;
            account.max_connections = max_connections;
            Ok(account.clone())
        })
    }

    /// Remove an account together with all of its peers
    ///
    /// Returns the removed peers. Their addresses are not reclaimed.
    pub fn remove_account(&self, name: &str) -> Result<Vec<Peer>> {
        self.transact(|state| {
            let account = state.require_account(name)?;
            let (removed, kept): (Vec<Peer>, Vec<Peer>) = std::mem::take(&mut state.peers)
                .into_iter()
                .partition(|p| p.account_id == account.id);
            state.peers = kept;
            state.accounts.retain(|a| a.id != account.id);
            info!("Removed account '{}' and {} peer(s)", name, removed.len());
            Ok(removed)
        })
    }

    /// Look up an account by name
    pub fn get_account(&self, name: &str) -> Option<Account> {
        self.snapshot().account(name).cloned()
    }

    /// All accounts in creation order
    pub fn list_accounts(&self) -> Vec<Account> {
        self.snapshot().accounts.clone()
    }

    /// Provision a new peer for `account`
    ///
    /// Label uniqueness and the account's quota are checked before an
    /// address is allocated or keys are requested, so a rejected request
    /// consumes nothing.
    pub fn create_peer(&self, account: &str, label: &str) -> Result<Peer> {
        validate_label(label)?;
        let allocator = self.allocator;
        let keys = self.keys.clone();
        let allowed_ips = self.default_allowed_ips.clone();

        self.transact(|state| {
            let owner = state.require_account(account)?;

            if state
                .peers
                .iter()
                .any(|p| p.account_id == owner.id && p.label == label)
            {
                return Err(ProvisionError::DuplicateLabel {
                    account: account.to_string(),
                    label: label.to_string(),
                });
            }
            state.check_quota(&owner)?;

            let address = allocator.allocate(&mut state.identity.last_assigned_offset)?;
            let (keypair, preshared_key) = state.issue_keys(keys.as_ref())?;

            let peer = Peer {
                id: PeerId(state.next_peer_id),
                account_id: owner.id,
                label: label.to_string(),
                private_key: keypair.private,
                public_key: keypair.public,
                preshared_key,
                address,
                allowed_ips,
                active: true,
                connected: false,
                last_handshake_at: None,
                endpoint: None,
                rx_bytes: 0,
                tx_bytes: 0,
                created_at: SystemTime::now(),
            };
            state.next_peer_id += 1;
            state.peers.push(peer.clone());

            info!("Provisioned peer '{}/{}' at {}", account, label, address);
            Ok(peer)
        })
    }

    /// Include or exclude a peer from the server configuration
    ///
    /// Activation counts against the owner's quota.
    pub fn set_active(&self, id: PeerId, active: bool) -> Result<Peer> {
        self.transact(|state| {
            let current = state
                .peer(id)
                .cloned()
                .ok_or_else(|| ProvisionError::NotFound(format!("peer {}", id)))?;

            if active && !current.active {
                let owner = state
                    .account_by_id(current.account_id)
                    .cloned()
                    .ok_or_else(|| ProvisionError::NotFound(format!("owner of peer {}", id)))?;
                state.check_quota(&owner)?;
            }

            let peer = state.peer_mut(id)?;
            peer.active = active;
            if !active {
                peer.connected = false;
            }
            info!("Peer {} ({}) {}", id, peer.label, if active { "activated" } else { "deactivated" });
            Ok(peer.clone())
        })
    }

    /// Exclude a peer from the server configuration
    pub fn deactivate(&self, id: PeerId) -> Result<Peer> {
        self.set_active(id, false)
    }

    /// Remove a peer. Its address is not returned to the pool.
    pub fn delete_peer(&self, id: PeerId) -> Result<Peer> {
        self.transact(|state| {
            let index = state
                .peers
                .iter()
                .position(|p| p.id == id)
                .ok_or_else(|| ProvisionError::NotFound(format!("peer {}", id)))?;
            let peer = state.peers.remove(index);
            info!("Deleted peer {} ({}) at {}", id, peer.label, peer.address);
            Ok(peer)
        })
    }

    /// Rotate a peer's key pair and pre-shared key, keeping its address
    pub fn reissue_keys(&self, id: PeerId) -> Result<Peer> {
        let keys = self.keys.clone();
        self.transact(|state| {
            state
                .peer(id)
                .ok_or_else(|| ProvisionError::NotFound(format!("peer {}", id)))?;
            let (keypair, preshared_key) = state.issue_keys(keys.as_ref())?;

            let peer = state.peer_mut(id)?;
            peer.private_key = keypair.private;
            peer.public_key = keypair.public;
            peer.preshared_key = preshared_key;
            peer.connected = false;
            peer.last_handshake_at = None;
            peer.endpoint = None;
            info!("Reissued keys for peer {} ({})", id, peer.label);
            Ok(peer.clone())
        })
    }

    /// Look up a peer by id
    pub fn get_peer(&self, id: PeerId) -> Option<Peer> {
        self.snapshot().peer(id).cloned()
    }

    /// Look up a peer by owner and label
    pub fn find_by_label(&self, account: &str, label: &str) -> Option<Peer> {
        let state = self.snapshot();
        let owner = state.account(account)?;
        state
            .peers
            .iter()
            .find(|p| p.account_id == owner.id && p.label == label)
            .cloned()
    }

    /// Peers in creation order, optionally restricted to one account
    pub fn list_peers(&self, account: Option<&str>) -> Result<Vec<Peer>> {
        let state = self.snapshot();
        let owner = match account {
            Some(name) => Some(state.require_account(name)?.id),
            None => None,
        };
        Ok(state
            .peers
            .iter()
            .filter(|p| owner.map_or(true, |id| p.account_id == id))
            .cloned()
            .collect())
    }

    /// Active peers in creation order
    pub fn list_active(&self) -> Vec<Peer> {
        self.snapshot()
            .peers
            .iter()
            .filter(|p| p.active)
            .cloned()
            .collect()
    }

    /// Apply one reconciliation tick's observations as a single commit
    ///
    /// Peers whose public key is reported online are marked connected;
    /// every other peer is marked disconnected. Observations for keys the
    /// registry does not know are counted and otherwise ignored.
    pub fn apply_connection_states(
        &self,
        observations: &HashMap<String, PeerObservation>,
    ) -> Result<ConnectionUpdate> {
        self.transact(|state| {
            let mut update = ConnectionUpdate::default();
            let mut matched = 0;

            for peer in state.peers.iter_mut() {
                match observations.get(&peer.public_key.to_base64()) {
                    Some(obs) => {
                        matched += 1;
                        peer.endpoint = obs.endpoint.clone();
                        peer.rx_bytes = obs.rx_bytes;
                        peer.tx_bytes = obs.tx_bytes;
                        if obs.online {
                            peer.connected = true;
                            peer.last_handshake_at = obs.latest_handshake;
                        } else {
                            peer.connected = false;
                        }
                    }
                    None => peer.connected = false,
                }

                if peer.connected {
                    update.online += 1;
                } else {
                    update.offline += 1;
                }
            }

            update.unmatched = observations.len().saturating_sub(matched);
            Ok(update)
        })
    }

    /// Mark every peer disconnected (daemon down or no interface)
    pub fn mark_all_offline(&self) -> Result<ConnectionUpdate> {
        self.apply_connection_states(&HashMap::new())
    }
}
