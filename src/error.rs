//! Error types for wg-provisioner
//!
//! This module defines the error types used throughout the application.
//! We use `thiserror` for the library error and `anyhow` for error
//! propagation in the binary.

use thiserror::Error;

/// Main error type for provisioning, synchronization and reconciliation
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The account already owns a peer with this label
    #[error("Account '{account}' already has a peer labelled '{label}'")]
    DuplicateLabel {
        /// Owning account name
        account: String,
        /// Rejected label
        label: String,
    },

    /// The account already has `max` active peers
    #[error("Account '{account}' has reached its limit of {max} active peers")]
    QuotaExceeded {
        /// Owning account name
        account: String,
        /// Configured connection limit
        max: u32,
    },

    /// Every host offset in the overlay subnet has been handed out
    #[error("No more addresses available in subnet (last offset {max_offset})")]
    AllocationExhausted {
        /// Highest allocatable host offset
        max_offset: u32,
    },

    /// Key material could not be produced
    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// The tunnel daemon could not be queried
    #[error("Tunnel daemon unavailable: {0}")]
    DaemonUnavailable(String),

    /// Bringing the tunnel interface up with the new config failed
    #[error("Failed to reload tunnel interface: {0}")]
    ReloadFailed(String),

    /// Writing or renaming the server config file failed
    #[error("Failed to write server config: {0}")]
    ConfigWriteFailed(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Registry persistence errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias using ProvisionError
pub type Result<T> = std::result::Result<T, ProvisionError>;

impl ProvisionError {
    /// Whether the error came out of a server-config synchronization
    pub fn is_sync_failure(&self) -> bool {
        matches!(self, Self::ReloadFailed(_) | Self::ConfigWriteFailed(_))
    }
}

impl From<serde_json::Error> for ProvisionError {
    fn from(err: serde_json::Error) -> Self {
        ProvisionError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ProvisionError {
    fn from(err: toml::de::Error) -> Self {
        ProvisionError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ProvisionError::QuotaExceeded {
            account: "alice".to_string(),
            max: 2,
        };
        assert_eq!(
            err.to_string(),
            "Account 'alice' has reached its limit of 2 active peers"
        );

        let err = ProvisionError::AllocationExhausted { max_offset: 254 };
        assert!(err.to_string().contains("254"));
    }

    #[test]
    fn test_sync_failure_classification() {
        assert!(ProvisionError::ReloadFailed("x".into()).is_sync_failure());
        assert!(ProvisionError::ConfigWriteFailed("x".into()).is_sync_failure());
        assert!(!ProvisionError::DaemonUnavailable("x".into()).is_sync_failure());
    }

    #[test]
    fn test_from_toml_error() {
        let err = toml::from_str::<toml::Value>("not = [valid").unwrap_err();
        let converted: ProvisionError = err.into();
        assert!(matches!(converted, ProvisionError::Config(_)));
    }
}
