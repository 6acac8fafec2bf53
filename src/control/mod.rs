//! Control API for operators and provisioning front ends
//!
//! JSON-lines over a Unix socket. The CLI's `account`, `peer`, `sync` and
//! `status` commands are thin wrappers over [`ControlClient`].

mod api;
mod client;
mod handler;
mod server;

pub use api::{AccountView, ApiError, ApiRequest, ApiResponse, ControlCommand, PeerView};
pub use client::ControlClient;
pub use handler::CommandHandler;
pub use server::{ControlServer, DEFAULT_SOCKET_PATH};
