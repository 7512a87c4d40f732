//! Virtual USB host controller
//!
//! The controller owns one root hub; each hub port holds at most one
//! [`VirtualDevice`] whose URBs are relayed to a USB/IP peer.
//!
//! # Architecture
//!
//! ```text
//! VirtualHostController
//!   └─ RootHub (ports 1..=num_ports)
//!        └─ VirtualDevice
//!             ├─ UrbPipeline ── RequestTable, ReceiveBuffer
//!             ├─ Lifecycle
//!             ├─ DescriptorCache
//!             └─ Connection (transmit + receive tasks)
//! ```
//!
//! Roles share the [`PnpDevice`] lifecycle; removal of the controller
//! cascades to the hub and every device on it.

pub mod descriptor;
pub mod device;
pub mod hub;
pub mod lifecycle;
pub mod pipeline;
pub mod request;
pub mod rx_buffer;
pub mod urb;

pub use descriptor::{ConfigurationDescriptor, DescriptorCache, EndpointInfo, InterfaceInfo};
pub use device::{ConnectionInfo, VirtualDevice};
pub use hub::RootHub;
pub use lifecycle::{Lifecycle, PnpDevice, PnpEvent, PnpState};
pub use pipeline::{CancelToken, UrbHandle, UrbPipeline};
pub use request::{RequestId, RequestState, RequestTable};
pub use rx_buffer::ReceiveBuffer;
pub use urb::{IsoPacket, TransferKind, Urb, UrbCompletion};

use common::{EventReceiver, EventSender, RemovalReason, Result, VhciEvent, create_event_channel};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

use crate::config::VhciConfig;
use crate::network;

/// The emulated roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceRole {
    Controller,
    RootHub,
    Port(u8),
}

impl std::fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Controller => write!(f, "vhci"),
            Self::RootHub => write!(f, "vhub"),
            Self::Port(port) => write!(f, "port {}", port),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    pub num_ports: u8,
    pub read_buffer_size: usize,
    pub max_outstanding_requests: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self::from(&VhciConfig::default())
    }
}

impl From<&VhciConfig> for ControllerOptions {
    fn from(config: &VhciConfig) -> Self {
        Self {
            num_ports: config.vhci.num_ports,
            read_buffer_size: config.vhci.read_buffer_size,
            max_outstanding_requests: config.vhci.max_outstanding_requests,
        }
    }
}

/// Process-wide controller context
///
/// Created once and shut down explicitly; dropping it does not detach
/// devices.
#[derive(Debug)]
pub struct VirtualHostController {
    hub: RootHub,
    lifecycle: Mutex<Lifecycle>,
    events: EventSender,
}

impl VirtualHostController {
    pub fn new(options: ControllerOptions) -> Result<(Arc<Self>, EventReceiver)> {
        let (events, receiver) = create_event_channel();
        let controller = Arc::new(Self {
            hub: RootHub::new(options, events.clone()),
            lifecycle: Mutex::new(Lifecycle::new()),
            events,
        });

        controller.pnp(PnpEvent::Start)?;
        controller.hub.pnp(PnpEvent::Start)?;
        info!("Virtual host controller started with {} ports", options.num_ports);
        Ok((controller, receiver))
    }

    pub fn hub(&self) -> &RootHub {
        &self.hub
    }

    /// Import `busid` over an open connection and plug it into a free port
    pub async fn attach<S>(&self, mut stream: S, busid: &str) -> Result<Arc<VirtualDevice>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let info = network::import_device(&mut stream, busid).await?;
        let device = self.hub.plug(info)?;
        if let Err(e) = device.attach_transport(stream) {
            let _ = device.detach();
            return Err(e);
        }

        info!(
            "Attached {} (devid {:#010x}) on port {}",
            device.busid(),
            device.devid(),
            device.port()
        );
        self.events.publish(VhciEvent::DeviceAttached {
            port: device.port(),
            busid: device.busid().to_string(),
            devid: device.devid(),
        });
        Ok(device)
    }

    /// Detach the device on `port`
    pub fn detach(&self, port: u8) -> Result<()> {
        self.hub.unplug(port)
    }

    /// Remove every device and stop the controller
    pub fn shutdown(&self) -> Result<()> {
        self.pnp_with_reason(PnpEvent::Remove, RemovalReason::Shutdown)?;
        Ok(())
    }
}

impl PnpDevice for VirtualHostController {
    fn role(&self) -> DeviceRole {
        DeviceRole::Controller
    }

    fn lifecycle(&self) -> &Mutex<Lifecycle> {
        &self.lifecycle
    }

    fn release(&self, reason: RemovalReason) {
        let _ = self.hub.pnp_with_reason(PnpEvent::Remove, reason);
    }
}
