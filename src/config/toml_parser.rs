//! TOML configuration file parser
//!
//! The file mirrors the typed `Config` but keeps every value as written so
//! environment overrides can be layered on before anything is parsed into
//! addresses and subnets.

use crate::config::{Config, ControlSettings, KeySource, MonitoringSettings, ServerSettings};
use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Tunnel server settings
    #[serde(default)]
    pub server: TomlServerConfig,

    /// Control socket settings
    #[serde(default)]
    pub control: TomlControlConfig,

    /// Health and metrics endpoint settings
    #[serde(default)]
    pub monitoring: TomlMonitoringConfig,
}

/// TOML `[server]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlServerConfig {
    /// WireGuard interface name
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Server overlay address
    #[serde(default = "default_server_address")]
    pub server_address: String,

    /// Overlay subnet in CIDR notation
    #[serde(default = "default_subnet")]
    pub subnet: String,

    /// UDP listen port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// DNS servers advertised to clients
    #[serde(default = "default_dns")]
    pub dns: Vec<String>,

    /// Endpoint clients connect to (host:port)
    pub public_endpoint: Option<String>,

    /// Interface used for NAT, detected when unset
    pub egress_interface: Option<String>,

    /// Directory holding `<interface>.conf`
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Registry state file
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Allowed IPs written into new client profiles
    #[serde(default = "default_allowed_ips")]
    pub default_allowed_ips: String,

    /// Connection limit for accounts created without one
    #[serde(default = "default_max_connections")]
    pub default_max_connections: u32,

    /// Keepalive written into client profiles
    #[serde(default = "default_keepalive")]
    pub persistent_keepalive_secs: u16,

    /// Handshake age below which a peer counts as online
    #[serde(default = "default_online_threshold")]
    pub online_threshold_secs: u64,

    /// Seconds between reconciliation ticks
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Upper bound on a daemon dump call
    #[serde(default = "default_daemon_timeout")]
    pub daemon_timeout_secs: u64,

    /// Where key material comes from
    #[serde(default)]
    pub key_source: KeySource,
}

/// TOML `[control]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlControlConfig {
    /// Unix socket path
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

/// TOML `[monitoring]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlMonitoringConfig {
    /// Serve `/healthz` and `/metrics`
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for TomlServerConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            server_address: default_server_address(),
            subnet: default_subnet(),
            listen_port: default_listen_port(),
            dns: default_dns(),
            public_endpoint: None,
            egress_interface: None,
            config_dir: default_config_dir(),
            state_path: default_state_path(),
            default_allowed_ips: default_allowed_ips(),
            default_max_connections: default_max_connections(),
            persistent_keepalive_secs: default_keepalive(),
            online_threshold_secs: default_online_threshold(),
            reconcile_interval_secs: default_reconcile_interval(),
            daemon_timeout_secs: default_daemon_timeout(),
            key_source: KeySource::default(),
        }
    }
}

impl Default for TomlControlConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

impl Default for TomlMonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_bind_address(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ProvisionError::Config(format!("Invalid value for {}: '{}' ({})", name, value, e)))
}

impl TomlConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            ProvisionError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        Self::parse(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn parse(toml: &str) -> Result<Self> {
        toml::from_str(toml).map_err(|e| {
            ProvisionError::Config(format!("Failed to parse TOML: {}", e))
        })
    }

    /// Layer `WG_*` overrides from `lookup` over the file values
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server = &mut self.server;

        if let Some(v) = lookup("WG_INTERFACE") {
            server.interface = v;
        }
        if let Some(v) = lookup("WG_SERVER_IP") {
            server.server_address = v;
        }
        if let Some(v) = lookup("WG_SUBNET") {
            server.subnet = v;
        }
        if let Some(v) = lookup("WG_SERVER_PORT") {
            server.listen_port = parse_env("WG_SERVER_PORT", &v)?;
        }
        if let Some(v) = lookup("WG_DNS") {
            server.dns = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("WG_SERVER_PUBLIC_ENDPOINT") {
            server.public_endpoint = Some(v);
        }
        if let Some(v) = lookup("WG_NETWORK_INTERFACE") {
            server.egress_interface = Some(v);
        }
        if let Some(v) = lookup("WG_STATE_PATH") {
            server.state_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("WG_ONLINE_THRESHOLD_SECS") {
            server.online_threshold_secs = parse_env("WG_ONLINE_THRESHOLD_SECS", &v)?;
        }
        if let Some(v) = lookup("WG_RECONCILE_INTERVAL_SECS") {
            server.reconcile_interval_secs = parse_env("WG_RECONCILE_INTERVAL_SECS", &v)?;
        }

        Ok(())
    }

    /// Layer overrides from the process environment
    pub fn apply_process_env(&mut self) -> Result<()> {
        self.apply_env(|name| std::env::var(name).ok())
    }
}

// Convert TOML config to internal Config
impl TryFrom<TomlConfig> for Config {
    type Error = ProvisionError;

    fn try_from(toml: TomlConfig) -> Result<Self> {
        let s = toml.server;

        let server_address = s.server_address.trim().parse().map_err(|e| {
            ProvisionError::Config(format!("Invalid server address '{}': {}", s.server_address, e))
        })?;
        let public_endpoint = s.public_endpoint.ok_or_else(|| {
            ProvisionError::Config(
                "server.public_endpoint is required (or set WG_SERVER_PUBLIC_ENDPOINT)".to_string(),
            )
        })?;

        Ok(Config {
            server: ServerSettings {
                interface: s.interface,
                server_address,
                subnet: s.subnet.parse()?,
                listen_port: s.listen_port,
                dns: s.dns,
                public_endpoint,
                egress_interface: s.egress_interface.filter(|e| !e.is_empty()),
                config_dir: s.config_dir,
                state_path: s.state_path,
                default_allowed_ips: s.default_allowed_ips,
                default_max_connections: s.default_max_connections,
                persistent_keepalive_secs: s.persistent_keepalive_secs,
                online_threshold_secs: s.online_threshold_secs,
                reconcile_interval_secs: s.reconcile_interval_secs,
                daemon_timeout_secs: s.daemon_timeout_secs,
                key_source: s.key_source,
            },
            control: ControlSettings {
                socket_path: toml.control.socket_path,
            },
            monitoring: MonitoringSettings {
                enabled: toml.monitoring.enabled,
                bind_address: toml.monitoring.bind_address,
            },
        })
    }
}

// Default value functions
fn default_interface() -> String {
    "wg0".to_string()
}

fn default_server_address() -> String {
    "10.8.0.1".to_string()
}

fn default_subnet() -> String {
    "10.8.0.0/24".to_string()
}

fn default_listen_port() -> u16 {
    51820
}

fn default_dns() -> Vec<String> {
    vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()]
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/wireguard")
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/var/lib/wg-provisioner/state.json")
}

fn default_allowed_ips() -> String {
    crate::registry::DEFAULT_ALLOWED_IPS.to_string()
}

fn default_max_connections() -> u32 {
    3
}

fn default_keepalive() -> u16 {
    25
}

fn default_online_threshold() -> u64 {
    180
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_daemon_timeout() -> u64 {
    10
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(crate::control::DEFAULT_SOCKET_PATH)
}

fn default_bind_address() -> String {
    "127.0.0.1:9091".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            [server]
            interface = "wg1"
            server_address = "10.20.0.1"
            subnet = "10.20.0.0/24"
            listen_port = 51821
            dns = ["9.9.9.9"]
            public_endpoint = "vpn.example.com:51821"
            egress_interface = "ens3"
            key_source = "wg"

            [control]
            socket_path = "/run/wgp.sock"

            [monitoring]
            enabled = false
            bind_address = "0.0.0.0:9100"
        "#;

        let config = TomlConfig::parse(toml).expect("Failed to parse TOML");
        assert_eq!(config.server.interface, "wg1");
        assert_eq!(config.server.listen_port, 51821);
        assert_eq!(config.server.key_source, KeySource::Wg);
        assert_eq!(config.control.socket_path, PathBuf::from("/run/wgp.sock"));
        assert!(!config.monitoring.enabled);
    }

    #[test]
    fn test_parse_with_defaults() {
        let config = TomlConfig::parse("").expect("Failed to parse TOML");

        assert_eq!(config.server.interface, "wg0");
        assert_eq!(config.server.subnet, "10.8.0.0/24");
        assert_eq!(config.server.dns, vec!["1.1.1.1", "8.8.8.8"]);
        assert_eq!(config.server.online_threshold_secs, 180);
        assert_eq!(config.server.reconcile_interval_secs, 30);
        assert_eq!(config.server.key_source, KeySource::Native);
        assert!(config.server.public_endpoint.is_none());
        assert!(config.monitoring.enabled);
        assert_eq!(config.monitoring.bind_address, "127.0.0.1:9091");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = TomlConfig::parse("[server]\ninterface = \"wg9\"\n").unwrap();
        config
            .apply_env(env(&[
                ("WG_INTERFACE", "wg3"),
                ("WG_SERVER_PORT", "443"),
                ("WG_DNS", "10.0.0.53, 10.0.0.54"),
                ("WG_SERVER_PUBLIC_ENDPOINT", "198.51.100.1:443"),
                ("WG_NETWORK_INTERFACE", "ens5"),
                ("WG_ONLINE_THRESHOLD_SECS", "120"),
            ]))
            .unwrap();

        assert_eq!(config.server.interface, "wg3");
        assert_eq!(config.server.listen_port, 443);
        assert_eq!(config.server.dns, vec!["10.0.0.53", "10.0.0.54"]);
        assert_eq!(config.server.egress_interface.as_deref(), Some("ens5"));
        assert_eq!(config.server.online_threshold_secs, 120);
    }

    #[test]
    fn test_malformed_numeric_override_is_error() {
        let mut config = TomlConfig::default();
        let err = config
            .apply_env(env(&[("WG_SERVER_PORT", "not-a-port")]))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Config(_)));
    }

    #[test]
    fn test_convert_requires_endpoint() {
        let err = Config::try_from(TomlConfig::default()).unwrap_err();
        assert!(err.to_string().contains("public_endpoint"));
    }

    #[test]
    fn test_convert_to_config() {
        let toml = r#"
            [server]
            public_endpoint = "203.0.113.5:51820"
        "#;

        let config: Config = TomlConfig::parse(toml).unwrap().try_into().unwrap();
        assert_eq!(config.server.server_address.to_string(), "10.8.0.1");
        assert_eq!(config.server.subnet.to_string(), "10.8.0.0/24");
        assert_eq!(config.server.egress_interface, None);
    }
}
