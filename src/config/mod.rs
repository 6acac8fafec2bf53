//! Configuration management
//!
//! Settings come from a TOML file with `WG_*` environment variables layered
//! on top, then are parsed into typed values and validated as a whole.

mod toml_parser;
pub mod validation;

pub use toml_parser::TomlConfig;

use crate::error::{ProvisionError, Result};
use crate::reconciler::ReconcilerSettings;
use crate::registry::Subnet;
use crate::wireguard::RenderSettings;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/wg-provisioner/config.toml";

/// Where peer and server key material is generated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySource {
    /// In-process x25519 generation
    #[default]
    Native,
    /// `wg genkey` / `wg pubkey` / `wg genpsk`
    Wg,
}

/// Main configuration structure
#[derive(Debug, Clone)]
pub struct Config {
    /// Tunnel server settings
    pub server: ServerSettings,
    /// Control socket settings
    pub control: ControlSettings,
    /// Health and metrics endpoint settings
    pub monitoring: MonitoringSettings,
}

/// Tunnel server settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// WireGuard interface name (e.g., "wg0")
    pub interface: String,
    /// Server overlay address
    pub server_address: Ipv4Addr,
    /// Overlay subnet
    pub subnet: Subnet,
    /// UDP listen port
    pub listen_port: u16,
    /// DNS servers advertised to clients
    pub dns: Vec<String>,
    /// Endpoint clients connect to (host:port)
    pub public_endpoint: String,
    /// Interface used for NAT, detected when unset
    pub egress_interface: Option<String>,
    /// Directory holding `<interface>.conf`
    pub config_dir: PathBuf,
    /// Registry state file
    pub state_path: PathBuf,
    /// Allowed IPs written into new client profiles
    pub default_allowed_ips: String,
    /// Connection limit for accounts created without one
    pub default_max_connections: u32,
    /// Keepalive written into client profiles
    pub persistent_keepalive_secs: u16,
    /// Handshake age below which a peer counts as online
    pub online_threshold_secs: u64,
    /// Seconds between reconciliation ticks
    pub reconcile_interval_secs: u64,
    /// Upper bound on a daemon dump call
    pub daemon_timeout_secs: u64,
    /// Where key material comes from
    pub key_source: KeySource,
}

/// Control socket settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSettings {
    /// Unix socket path
    pub socket_path: PathBuf,
}

/// Health and metrics endpoint settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringSettings {
    /// Serve `/healthz` and `/metrics`
    pub enabled: bool,
    /// HTTP bind address
    pub bind_address: String,
}

impl Config {
    /// Load the file at `path`, apply process environment overrides and validate
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut toml = TomlConfig::from_file(path)?;
        toml.apply_process_env()?;
        Self::from_toml(toml)
    }

    /// Parse a TOML string with overrides from `lookup` and validate
    pub fn from_str_with_env<F>(contents: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut toml = TomlConfig::parse(contents)?;
        toml.apply_env(lookup)?;
        Self::from_toml(toml)
    }

    fn from_toml(toml: TomlConfig) -> Result<Self> {
        let config = Config::try_from(toml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;

        self.monitoring
            .bind_address
            .parse::<std::net::SocketAddr>()
            .map_err(|e| {
                ProvisionError::Config(format!(
                    "Invalid monitoring bind address '{}': {}",
                    self.monitoring.bind_address, e
                ))
            })?;

        if self.control.socket_path.as_os_str().is_empty() {
            return Err(ProvisionError::Config("Control socket path cannot be empty".to_string()));
        }

        Ok(())
    }
}

impl ServerSettings {
    /// Validate server settings
    pub fn validate(&self) -> Result<()> {
        validation::validate_interface_name(&self.interface)?;
        if let Some(egress) = &self.egress_interface {
            validation::validate_interface_name(egress)?;
        }

        if self.subnet.offset_of(self.server_address) != Some(crate::registry::SERVER_OFFSET) {
            return Err(ProvisionError::Config(format!(
                "Server address {} must be the first host of {}",
                self.server_address, self.subnet
            )));
        }

        for dns in &self.dns {
            validation::validate_ip_address(dns)?;
        }

        validation::validate_endpoint(&self.public_endpoint)?;
        validation::validate_cidr_list(&self.default_allowed_ips)?;
        validation::validate_keepalive(self.persistent_keepalive_secs)?;
        validation::validate_nonzero_secs("online_threshold_secs", self.online_threshold_secs)?;
        validation::validate_nonzero_secs("reconcile_interval_secs", self.reconcile_interval_secs)?;
        validation::validate_nonzero_secs("daemon_timeout_secs", self.daemon_timeout_secs)?;

        Ok(())
    }

    /// Server config file path
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(format!("{}.conf", self.interface))
    }

    /// Parameters for rendering client profiles and the server config
    pub fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            interface: self.interface.clone(),
            server_address: self.server_address,
            subnet: self.subnet,
            listen_port: self.listen_port,
            dns: self.dns.clone(),
            public_endpoint: self.public_endpoint.clone(),
            persistent_keepalive: self.persistent_keepalive_secs,
        }
    }

    /// Reconciler timing
    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            interface: self.interface.clone(),
            online_threshold: Duration::from_secs(self.online_threshold_secs),
            interval: Duration::from_secs(self.reconcile_interval_secs),
            daemon_timeout: Duration::from_secs(self.daemon_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL: &str = r#"
        [server]
        public_endpoint = "vpn.example.com:51820"
    "#;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_minimal_config_is_valid() {
        let config = Config::from_str_with_env(MINIMAL, no_env).unwrap();
        assert_eq!(config.server.interface, "wg0");
        assert_eq!(config.server.config_path(), PathBuf::from("/etc/wireguard/wg0.conf"));

        let reconciler = config.server.reconciler_settings();
        assert_eq!(reconciler.online_threshold, Duration::from_secs(180));
        assert_eq!(reconciler.interval, Duration::from_secs(30));

        let render = config.server.render_settings();
        assert_eq!(render.persistent_keepalive, 25);
        assert_eq!(render.public_endpoint, "vpn.example.com:51820");
    }

    #[test]
    fn test_server_address_must_be_first_host() {
        let err = Config::from_str_with_env(MINIMAL, |name| {
            (name == "WG_SERVER_IP").then(|| "10.8.0.7".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("first host"));

        let err = Config::from_str_with_env(MINIMAL, |name| {
            (name == "WG_SUBNET").then(|| "10.9.0.0/24".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ProvisionError::Config(_)));
    }

    #[test]
    fn test_invalid_values_rejected() {
        for (name, value) in [
            ("WG_INTERFACE", "bad interface"),
            ("WG_DNS", "not-an-ip"),
            ("WG_SERVER_PUBLIC_ENDPOINT", "no-port"),
            ("WG_RECONCILE_INTERVAL_SECS", "0"),
            ("WG_SUBNET", "10.8.0.0/31"),
        ] {
            let result = Config::from_str_with_env(MINIMAL, |n| (n == name).then(|| value.to_string()));
            assert!(result.is_err(), "{}={} should be rejected", name, value);
        }
    }

    #[test]
    fn test_bad_keepalive_rejected() {
        let toml = format!("{}\npersistent_keepalive_secs = 3\n", MINIMAL);
        assert!(Config::from_str_with_env(&toml, no_env).is_err());
    }

    #[test]
    #[serial]
    fn test_from_file_applies_process_env() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        std::env::set_var("WG_SERVER_PORT", "51999");
        let result = Config::from_file(file.path());
        std::env::remove_var("WG_SERVER_PORT");

        assert_eq!(result.unwrap().server.listen_port, 51999);
    }

    #[test]
    #[serial]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/wg-provisioner.toml").unwrap_err();
        assert!(matches!(err, ProvisionError::Config(_)));
    }
}
