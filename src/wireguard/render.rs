//! Configuration rendering
//!
//! Pure functions from registry data to the two `wg-quick` documents the
//! provisioner produces. Output depends only on the inputs, so rendering an
//! unchanged registry twice gives byte-identical text.

use crate::registry::{ActivePeer, Peer, RegistryState, ServerIdentity, Subnet};
use std::net::Ipv4Addr;

/// Network parameters that appear in rendered configurations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderSettings {
    /// Tunnel interface name (used in the NAT rules)
    pub interface: String,
    /// Server overlay address
    pub server_address: Ipv4Addr,
    /// Overlay subnet
    pub subnet: Subnet,
    /// UDP listen port
    pub listen_port: u16,
    /// DNS servers advertised to clients
    pub dns: Vec<String>,
    /// `host:port` clients connect to
    pub public_endpoint: String,
    /// Keepalive written into client profiles, 0 to omit
    pub persistent_keepalive: u16,
}

/// Renders client profiles and the server configuration
#[derive(Debug, Clone)]
pub struct ConfigRenderer {
    settings: RenderSettings,
}

impl ConfigRenderer {
    /// Create a renderer
    pub fn new(settings: RenderSettings) -> Self {
        Self { settings }
    }

    /// Rendering parameters
    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    /// Profile a client imports to connect as `peer`
    pub fn render_client_profile(&self, peer: &Peer, identity: &ServerIdentity) -> String {
        let mut out = String::new();

        out.push_str("[Interface]\n");
        out.push_str(&format!("PrivateKey = {}\n", peer.private_key.to_base64()));
        out.push_str(&format!("Address = {}/32\n", peer.address));
        if !self.settings.dns.is_empty() {
            out.push_str(&format!("DNS = {}\n", self.settings.dns.join(", ")));
        }

        out.push_str("\n[Peer]\n");
        out.push_str(&format!("PublicKey = {}\n", identity.public_key));
        out.push_str(&format!("PresharedKey = {}\n", peer.preshared_key.to_base64()));
        out.push_str(&format!("Endpoint = {}\n", self.settings.public_endpoint));
        out.push_str(&format!("AllowedIPs = {}\n", peer.allowed_ips));
        if self.settings.persistent_keepalive > 0 {
            out.push_str(&format!(
                "PersistentKeepalive = {}\n",
                self.settings.persistent_keepalive
            ));
        }

        out
    }

    /// Server configuration listing every peer in `active`, in order
    pub fn render_server_config(
        &self,
        identity: &ServerIdentity,
        egress_interface: &str,
        active: &[ActivePeer<'_>],
    ) -> String {
        let s = &self.settings;
        let mut out = String::new();

        out.push_str("[Interface]\n");
        out.push_str(&format!("Address = {}/{}\n", s.server_address, s.subnet.prefix_len()));
        out.push_str(&format!("ListenPort = {}\n", s.listen_port));
        out.push_str(&format!("PrivateKey = {}\n", identity.private_key.to_base64()));
        out.push_str(&format!(
            "PostUp = iptables -A FORWARD -i {wg} -j ACCEPT; iptables -t nat -A POSTROUTING -o {egress} -j MASQUERADE\n",
            wg = s.interface,
            egress = egress_interface
        ));
        out.push_str(&format!(
            "PostDown = iptables -D FORWARD -i {wg} -j ACCEPT; iptables -t nat -D POSTROUTING -o {egress} -j MASQUERADE\n",
            wg = s.interface,
            egress = egress_interface
        ));
        out.push('\n');

        for entry in active {
            out.push_str(&format!("# {}/{}\n", entry.owner, entry.peer.label));
            out.push_str("[Peer]\n");
            out.push_str(&format!("PublicKey = {}\n", entry.peer.public_key));
            out.push_str(&format!(
                "PresharedKey = {}\n",
                entry.peer.preshared_key.to_base64()
            ));
            out.push_str(&format!("AllowedIPs = {}/32\n", entry.peer.address));
            out.push('\n');
        }

        out
    }

    /// Server configuration for every active peer in `state`
    pub fn render_server_config_for(&self, state: &RegistryState, egress_interface: &str) -> String {
        self.render_server_config(&state.identity, egress_interface, &state.active_peers())
    }
}
