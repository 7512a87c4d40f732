//! Protocol version management

use crate::error::{ProtocolError, Result};

/// USB/IP protocol version spoken by this implementation (1.1.1)
pub const USBIP_VERSION: u16 = 0x0111;

/// Check the version field of an operation reply
///
/// USB/IP has no minor-version negotiation: anything other than
/// [`USBIP_VERSION`] is rejected.
pub fn validate_version(version: u16) -> Result<()> {
    if version != USBIP_VERSION {
        return Err(ProtocolError::IncompatibleVersion {
            version,
            expected: USBIP_VERSION,
        });
    }
    Ok(())
}
