//! Network subsystem
//!
//! TCP connection setup, the import/device-list handshake, and the
//! per-device transport pumps.

pub mod connection;
pub mod import;

pub use connection::Connection;
pub use import::{connect, import_device, list_devices};
