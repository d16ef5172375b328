//! Error types for silicore

use std::io;
use thiserror::Error;

/// Result type alias for silicore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Nix error (Unix)
    #[cfg(unix)]
    #[error("Nix error: {0}")]
    Nix(#[from] nix::Error),

    /// A bus mutex could not be acquired within the configured timeout
    #[error("Timed out waiting for the {0} bus")]
    BusTimeout(&'static str),

    /// The bus gateway was closed
    #[error("Bus access gateway is closed")]
    BusClosed,

    /// A register read did not produce a usable value
    #[error("Invalid read: {0}")]
    InvalidRead(String),

    /// Feature not supported
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Invalid value
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Vendor driver API returned a failure status
    #[error("Vendor API error: {0}")]
    Api(String),

    /// A control mode change could not be applied
    #[error("Control {identifier} failed: {reason}")]
    Control { identifier: String, reason: String },

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for transient contention that should be retried on the next tick
    pub fn is_contention(&self) -> bool {
        matches!(self, Error::BusTimeout(_))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Parse(format!("Failed to parse TOML: {}", err))
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Config(format!("Failed to serialize TOML: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contention_classification() {
        assert!(Error::BusTimeout("isa").is_contention());
        assert!(!Error::BusClosed.is_contention());
    }

    #[test]
    fn test_display() {
        let err = Error::Control {
            identifier: "/lpc/nct6798d/0/control/1".into(),
            reason: "write failed".into(),
        };
        assert_eq!(
            err.to_string(),
            "Control /lpc/nct6798d/0/control/1 failed: write failed"
        );
        assert_eq!(
            Error::BusTimeout("pci").to_string(),
            "Timed out waiting for the pci bus"
        );
    }
}
