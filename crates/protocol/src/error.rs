//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
///
/// Every variant except `Io` describes a malformed or inconsistent message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Command field of a URB header is not one of the four USB/IP commands
    #[error("Unknown USB/IP command: {0:#010x}")]
    UnknownCommand(u32),

    /// Operation code of an attach-time message is not recognized
    #[error("Unknown operation code: {0:#06x}")]
    UnknownOpCode(u16),

    /// Direction field is neither USBIP_DIR_OUT nor USBIP_DIR_IN
    #[error("Invalid direction: {0}")]
    InvalidDirection(u32),

    /// Buffer too small for operation
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// A length or count field disagrees with the rest of the message
    #[error("Inconsistent {field}: {value} (limit {limit})")]
    InconsistentLength {
        field: &'static str,
        value: u64,
        limit: u64,
    },

    /// Unused bytes of a header's command block are not zero
    #[error("Non-zero header padding for command {0:#010x}")]
    NonZeroPadding(u32),

    /// Isochronous packet count outside the accepted range
    #[error("Too many iso packets: {count} (max: {max})")]
    TooManyPackets { count: i64, max: u32 },

    /// Incompatible protocol version detected
    #[error("Incompatible protocol version: {version:#06x} (expected {expected:#06x})")]
    IncompatibleVersion { version: u16, expected: u16 },

    /// Reply code does not answer the request that was sent
    #[error("Unexpected reply: expected {expected:#06x}, got {actual:#06x}")]
    UnexpectedReply { expected: u16, actual: u16 },

    /// I/O error during frame operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
