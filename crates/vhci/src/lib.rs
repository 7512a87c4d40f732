//! USB/IP virtual host controller
//!
//! Imports devices exported by a USB/IP host and relays their URBs over
//! the TCP connection. See [`virtual_usb`] for the controller roles and
//! the request pipeline.

pub mod config;
pub mod network;
pub mod virtual_usb;

pub use config::VhciConfig;
pub use virtual_usb::{
    ControllerOptions, DeviceRole, Urb, UrbCompletion, UrbHandle, VirtualDevice,
    VirtualHostController,
};
