//! wg-provisioner: WireGuard peer provisioning and reconciliation
//!
//! Accounts own a bounded number of peers. Each peer gets an overlay
//! address and key material, and an importable client profile. The
//! server configuration is regenerated and reloaded whenever the active
//! set changes, and a background task tracks which peers are connected.
//!
//! # Modules
//!
//! - `registry`: Accounts, peers, address allocation and persistence
//! - `wireguard`: Key material, config rendering, daemon control and sync
//! - `reconciler`: Periodic connection status reconciliation
//! - `control`: Control API over a Unix socket
//! - `monitoring`: Health checks and metrics
//! - `config`: Configuration parsing and validation
//! - `service`: systemd readiness notification
//! - `error`: Error types and handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod control;
pub mod error;
pub mod monitoring;
pub mod reconciler;
pub mod registry;
pub mod service;
pub mod wireguard;

// Re-export commonly used types
pub use error::{ProvisionError, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
