//! Common error types

use protocol::{ImportStatus, ProtocolError, UrbStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Connect/send/receive failure on the USB/IP connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or inconsistent wire message
    #[error("Protocol error: {0}")]
    Protocol(#[source] ProtocolError),

    #[error("Incompatible USB/IP version {version:#06x} (expected {expected:#06x})")]
    IncompatibleVersion { version: u16, expected: u16 },

    #[error("Import refused by remote host: {0}")]
    Import(ImportStatus),

    #[error("No free port on the root hub")]
    NoFreePort,

    /// Operation on a device that is being or has been removed
    #[error("Device not present")]
    NotPresent,

    /// A relayed URB completed with a failure status
    #[error("USB transfer failed: {0:?}")]
    Urb(UrbStatus),

    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error concerns the connection rather than one request
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Io(_))
            || matches!(self, Self::Protocol(ProtocolError::Io(_)))
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::IncompatibleVersion { version, expected } => {
                Self::IncompatibleVersion { version, expected }
            }
            other => Self::Protocol(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_mismatch_is_distinct() {
        let err: Error = ProtocolError::IncompatibleVersion {
            version: 0x0106,
            expected: 0x0111,
        }
        .into();
        assert!(matches!(err, Error::IncompatibleVersion { version: 0x0106, .. }));
        assert!(!err.is_transport());
        assert_eq!(
            err.to_string(),
            "Incompatible USB/IP version 0x0106 (expected 0x0111)"
        );
    }

    #[test]
    fn test_transport_classification() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(Error::from(io).is_transport());
        assert!(Error::Transport("reset".into()).is_transport());
        assert!(!Error::NotPresent.is_transport());
        assert!(!Error::from(ProtocolError::UnknownCommand(7)).is_transport());
    }
}
