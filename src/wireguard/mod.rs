//! WireGuard key material, configuration rendering and daemon control
//!
//! Everything that knows about WireGuard's textual formats or tooling lives
//! here; the registry and reconciler only see the types re-exported below.

pub mod daemon;
pub mod dump;
mod keys;
pub mod render;
pub mod sync;

pub use daemon::{DaemonController, WgQuickController};
pub use dump::PeerDump;
pub use keys::{KeyMaterialProvider, KeyPair, NativeKeyProvider, PresharedKey, PrivateKey, PublicKey};
pub use render::{ConfigRenderer, RenderSettings};
pub use sync::{ServerConfigSynchronizer, SyncReport};

#[cfg(test)]
pub use daemon::MockDaemonController;
#[cfg(test)]
pub use keys::MockKeyMaterialProvider;
