//! Common utilities for rust-usbip-vhci
//!
//! This crate provides shared functionality for the virtual host
//! controller: the error taxonomy, logging setup, the controller event
//! channel, and test utilities (a scripted USB/IP peer and fixtures).

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{EventReceiver, EventSender, RemovalReason, VhciEvent, create_event_channel};
pub use error::{Error, Result};
pub use logging::setup_logging;
