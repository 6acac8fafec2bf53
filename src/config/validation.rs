//! Configuration and input validation functions
//!
//! This module provides validation for configuration fields (interface
//! names, addresses, endpoints) and for names supplied by operators
//! (account names, device labels).

use crate::error::{ProvisionError, Result};
use std::net::IpAddr;

/// Maximum length of an account name or device label
pub const MAX_LABEL_LEN: usize = 64;

/// Validate interface name (alphanumeric, max 15 chars)
pub fn validate_interface_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ProvisionError::Config(
            "Interface name cannot be empty".to_string(),
        ));
    }

    if name.len() > 15 {
        return Err(ProvisionError::Config(format!(
            "Interface name '{}' exceeds maximum length of 15 characters",
            name
        )));
    }

    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(ProvisionError::Config(format!(
            "Interface name '{}' contains invalid characters (only alphanumeric, '_', and '-' allowed)",
            name
        )));
    }

    Ok(())
}

/// Validate IP address
pub fn validate_ip_address(ip: &str) -> Result<()> {
    ip.parse::<IpAddr>()
        .map_err(|_| ProvisionError::Config(format!("Invalid IP address: {}", ip)))?;
    Ok(())
}

/// Validate CIDR notation (IP/prefix)
pub fn validate_cidr(cidr: &str) -> Result<()> {
    let (ip, prefix) = cidr.split_once('/').ok_or_else(|| {
        ProvisionError::Config(format!(
            "Invalid CIDR notation: {} (expected format: IP/prefix)",
            cidr
        ))
    })?;

    let ip: IpAddr = ip
        .parse()
        .map_err(|_| ProvisionError::Config(format!("Invalid IP address in CIDR: {}", cidr)))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| ProvisionError::Config(format!("Invalid prefix length in CIDR: {}", cidr)))?;

    let max_prefix = match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };

    if prefix > max_prefix {
        return Err(ProvisionError::Config(format!(
            "Prefix length {} exceeds maximum {} for IP address {}",
            prefix, max_prefix, ip
        )));
    }

    Ok(())
}

/// Validate a comma separated list of CIDRs, as used for `AllowedIPs`
pub fn validate_cidr_list(list: &str) -> Result<()> {
    if list.trim().is_empty() {
        return Err(ProvisionError::Config("Allowed IPs cannot be empty".to_string()));
    }
    list.split(',').try_for_each(|cidr| validate_cidr(cidr.trim()))
}

/// Validate endpoint format (host:port)
pub fn validate_endpoint(endpoint: &str) -> Result<()> {
    let (host, port) = endpoint.rsplit_once(':').ok_or_else(|| {
        ProvisionError::Config(format!(
            "Invalid endpoint format: {} (expected format: host:port)",
            endpoint
        ))
    })?;

    let port: u16 = port
        .parse()
        .map_err(|_| ProvisionError::Config(format!("Invalid port in endpoint: {}", endpoint)))?;

    if port == 0 {
        return Err(ProvisionError::Config(
            "Port number cannot be 0".to_string(),
        ));
    }

    // Host validation is lenient (can be hostname or IP)
    if host.is_empty() {
        return Err(ProvisionError::Config(
            "Host cannot be empty in endpoint".to_string(),
        ));
    }

    Ok(())
}

/// Validate keepalive interval
pub fn validate_keepalive(secs: u16) -> Result<()> {
    // 0 (disabled) or 10-300 seconds
    if secs > 0 && secs < 10 {
        return Err(ProvisionError::Config(format!(
            "Keepalive interval {} is too short (minimum 10 seconds or 0 to disable)",
            secs
        )));
    }

    if secs > 300 {
        return Err(ProvisionError::Config(format!(
            "Keepalive interval {} is too long (maximum 300 seconds)",
            secs
        )));
    }

    Ok(())
}

/// Validate a duration setting is non-zero
pub fn validate_nonzero_secs(name: &str, secs: u64) -> Result<()> {
    if secs == 0 {
        return Err(ProvisionError::Config(format!("{} must be greater than 0", name)));
    }
    Ok(())
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ProvisionError::Validation(format!("{} cannot be empty", kind)));
    }

    if name.chars().count() > MAX_LABEL_LEN {
        return Err(ProvisionError::Validation(format!(
            "{} '{}' exceeds maximum length of {} characters",
            kind, name, MAX_LABEL_LEN
        )));
    }

    // labels end up in a comment line of the server config
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.'))
    {
        return Err(ProvisionError::Validation(format!(
            "{} '{}' contains invalid characters (only alphanumeric, space, '-', '_' and '.' allowed)",
            kind,
            name.escape_debug()
        )));
    }

    Ok(())
}

/// Validate a device label
pub fn validate_label(label: &str) -> Result<()> {
    validate_name("Label", label)
}

/// Validate an account name
pub fn validate_account_name(name: &str) -> Result<()> {
    validate_name("Account name", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_interface_name() {
        assert!(validate_interface_name("wg0").is_ok());
        assert!(validate_interface_name("wg-test").is_ok());
        assert!(validate_interface_name("wg_test").is_ok());
        assert!(validate_interface_name("").is_err());
        assert!(validate_interface_name("wg@test").is_err());
        assert!(validate_interface_name("toolonginterfacename").is_err());
    }

    #[test]
    fn test_validate_ip_address() {
        assert!(validate_ip_address("1.1.1.1").is_ok());
        assert!(validate_ip_address("2606:4700:4700::1111").is_ok());
        assert!(validate_ip_address("invalid").is_err());
        assert!(validate_ip_address("256.1.1.1").is_err());
    }

    #[test]
    fn test_validate_cidr() {
        assert!(validate_cidr("0.0.0.0/0").is_ok());
        assert!(validate_cidr("10.0.0.0/8").is_ok());
        assert!(validate_cidr("::/0").is_ok());
        assert!(validate_cidr("192.168.1.1").is_err());
        assert!(validate_cidr("192.168.1.0/33").is_err());
        assert!(validate_cidr("fe80::/129").is_err());
    }

    #[test]
    fn test_validate_cidr_list() {
        assert!(validate_cidr_list("0.0.0.0/0, ::/0").is_ok());
        assert!(validate_cidr_list("10.8.0.0/24").is_ok());
        assert!(validate_cidr_list("").is_err());
        assert!(validate_cidr_list("10.8.0.0/24, nope").is_err());
    }

    #[test]
    fn test_validate_endpoint() {
        assert!(validate_endpoint("vpn.example.com:51820").is_ok());
        assert!(validate_endpoint("203.0.113.10:51820").is_ok());
        assert!(validate_endpoint("[2001:db8::1]:51820").is_ok());
        assert!(validate_endpoint("invalid").is_err());
        assert!(validate_endpoint("example.com:0").is_err());
        assert!(validate_endpoint(":51820").is_err());
    }

    #[test]
    fn test_validate_keepalive() {
        assert!(validate_keepalive(0).is_ok());
        assert!(validate_keepalive(25).is_ok());
        assert!(validate_keepalive(300).is_ok());
        assert!(validate_keepalive(5).is_err());
        assert!(validate_keepalive(301).is_err());
    }

    #[test]
    fn test_validate_label() {
        assert!(validate_label("laptop").is_ok());
        assert!(validate_label("Alice's phone").is_err());
        assert!(validate_label("work laptop 2.0").is_ok());
        assert!(validate_label("").is_err());
        assert!(validate_label("   ").is_err());
        assert!(validate_label("line\nbreak").is_err());
        assert!(validate_label(&"x".repeat(MAX_LABEL_LEN + 1)).is_err());
        assert!(matches!(
            validate_account_name("bad#name"),
            Err(ProvisionError::Validation(_))
        ));
    }
}
