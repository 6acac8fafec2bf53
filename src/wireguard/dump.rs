//! Parser for `wg show <interface> dump`
//!
//! The dump is tab separated. The first line describes the interface
//! (private key, public key, listen port, fwmark); every following line
//! describes one peer:
//!
//! ```text
//! public-key  preshared-key  endpoint  allowed-ips  latest-handshake  rx  tx  keepalive
//! ```
//!
//! `endpoint` is `(none)` until the peer has connected and
//! `latest-handshake` is 0 when no handshake has happened yet.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Minimum number of fields for a peer line to be usable
const MIN_PEER_FIELDS: usize = 5;

/// One peer as reported by the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDump {
    /// Base64 public key
    pub public_key: String,
    /// Base64 pre-shared key, `None` if the daemon reports `(none)`
    pub preshared_key: Option<String>,
    /// Remote endpoint, `None` if the peer has never connected
    pub endpoint: Option<String>,
    /// Allowed IPs as reported
    pub allowed_ips: String,
    /// Latest handshake in epoch seconds, `None` for never
    pub latest_handshake: Option<u64>,
    /// Bytes received
    pub rx_bytes: u64,
    /// Bytes transmitted
    pub tx_bytes: u64,
}

impl PeerDump {
    /// Latest handshake as a wall-clock time
    pub fn latest_handshake_time(&self) -> Option<SystemTime> {
        self.latest_handshake
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
    }

    /// Age of the latest handshake relative to `now`
    ///
    /// A handshake stamped in the future (clock skew) has age zero.
    pub fn handshake_age(&self, now: SystemTime) -> Option<Duration> {
        self.latest_handshake_time()
            .map(|at| now.duration_since(at).unwrap_or(Duration::ZERO))
    }

    /// Whether the latest handshake is strictly younger than `threshold`
    pub fn is_online(&self, now: SystemTime, threshold: Duration) -> bool {
        self.handshake_age(now).is_some_and(|age| age < threshold)
    }
}

fn optional(field: &str) -> Option<String> {
    match field {
        "" | "(none)" | "off" => None,
        value => Some(value.to_string()),
    }
}

fn counter(field: Option<&str>) -> u64 {
    field.and_then(|f| f.parse().ok()).unwrap_or(0)
}

/// Parse one peer line, returning `None` for malformed lines
pub fn parse_peer_line(line: &str) -> Option<PeerDump> {
    let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('\t').collect();
    if fields.len() < MIN_PEER_FIELDS || fields[0].is_empty() {
        return None;
    }

    let latest_handshake = match fields[4].parse::<u64>() {
        Ok(0) => None,
        Ok(secs) => Some(secs),
        Err(_) => return None,
    };

    Some(PeerDump {
        public_key: fields[0].to_string(),
        preshared_key: optional(fields[1]),
        endpoint: optional(fields[2]),
        allowed_ips: fields[3].to_string(),
        latest_handshake,
        rx_bytes: counter(fields.get(5).copied()),
        tx_bytes: counter(fields.get(6).copied()),
    })
}

/// Parse a full dump, skipping the interface line and malformed peer lines
pub fn parse_dump(output: &str) -> Vec<PeerDump> {
    let mut peers = Vec::new();

    for (index, line) in output.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        match parse_peer_line(line) {
            Some(peer) => peers.push(peer),
            None => debug!("Skipping malformed dump line {}", index + 1),
        }
    }

    peers
}
