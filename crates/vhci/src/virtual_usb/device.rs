//! One attached device on a root hub port

use common::{Error, EventSender, RemovalReason, Result, VhciEvent};
use protocol::{UsbDevice, UsbSpeed};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::descriptor::{ConfigurationDescriptor, DescriptorCache, EndpointInfo};
use super::lifecycle::{Lifecycle, PnpDevice, PnpEvent, PnpState};
use super::pipeline::{UrbHandle, UrbPipeline};
use super::urb::{Urb, UrbCompletion};
use super::DeviceRole;
use crate::network::Connection;

const USB_DT_DEVICE: u8 = 0x01;
const USB_DT_CONFIG: u8 = 0x02;
const USB_DT_DEVICE_SIZE: u16 = 18;
const USB_DT_CONFIG_SIZE: u16 = 9;
const USB_REQ_GET_DESCRIPTOR: u8 = 0x06;
const USB_REQ_SET_CONFIGURATION: u8 = 0x09;
const USB_REQ_SET_INTERFACE: u8 = 0x0B;

fn setup(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
    let [value_lo, value_hi] = value.to_le_bytes();
    let [index_lo, index_hi] = index.to_le_bytes();
    let [length_lo, length_hi] = length.to_le_bytes();
    [
        request_type,
        request,
        value_lo,
        value_hi,
        index_lo,
        index_hi,
        length_lo,
        length_hi,
    ]
}

/// Snapshot of a port's connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub port: u8,
    pub busid: String,
    pub connected: bool,
    pub speed: UsbSpeed,
    /// bConfigurationValue of the active configuration, if configured
    pub configuration_value: Option<u8>,
    pub interface: Option<(u8, u8)>,
    pub endpoints: Vec<EndpointInfo>,
}

pub struct VirtualDevice {
    port: u8,
    info: UsbDevice,
    pipeline: Arc<UrbPipeline>,
    lifecycle: Mutex<Lifecycle>,
    descriptors: Mutex<DescriptorCache>,
    /// Taken (exchanged for `None`) by teardown before closing
    connection: Mutex<Option<Connection>>,
    events: EventSender,
    read_buffer_size: usize,
}

impl std::fmt::Debug for VirtualDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualDevice")
            .field("port", &self.port)
            .field("busid", &self.info.busid)
            .field("devid", &self.info.devid())
            .field("state", &self.pnp_state())
            .finish()
    }
}

impl VirtualDevice {
    pub(crate) fn new(
        port: u8,
        info: UsbDevice,
        max_outstanding: usize,
        read_buffer_size: usize,
        events: EventSender,
    ) -> Arc<Self> {
        let pipeline = UrbPipeline::new(info.devid(), max_outstanding);
        Arc::new(Self {
            port,
            info,
            pipeline,
            lifecycle: Mutex::new(Lifecycle::new()),
            descriptors: Mutex::new(DescriptorCache::new()),
            connection: Mutex::new(None),
            events,
            read_buffer_size,
        })
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn busid(&self) -> &str {
        &self.info.busid
    }

    pub fn devid(&self) -> u32 {
        self.info.devid()
    }

    /// Device record from the import reply
    pub fn info(&self) -> &UsbDevice {
        &self.info
    }

    pub fn pipeline(&self) -> &Arc<UrbPipeline> {
        &self.pipeline
    }

    fn descriptors(&self) -> MutexGuard<'_, DescriptorCache> {
        self.descriptors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connection(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start relaying over `stream` and move the device to `Started`
    pub(crate) fn attach_transport<S>(self: &Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection = Connection::spawn(
            stream,
            Arc::downgrade(self),
            self.pipeline.clone(),
            self.read_buffer_size,
        );
        *self.connection() = Some(connection);
        if let Err(e) = self.pnp(PnpEvent::Start) {
            // Removed concurrently; release may already have run
            if let Some(connection) = self.connection().take() {
                connection.close();
            }
            return Err(e);
        }
        Ok(())
    }

    /// Queue a URB; rejected once the device is being removed
    pub fn submit(&self, urb: Urb) -> Result<UrbHandle> {
        let accepting = self
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .accepts_submissions();
        if !accepting {
            return Err(Error::NotPresent);
        }
        self.pipeline.submit(urb)
    }

    /// Submit and wait; a failed status is returned as [`Error::Urb`]
    pub async fn transfer(&self, urb: Urb) -> Result<UrbCompletion> {
        self.submit(urb)?.completion().await?.into_result()
    }

    pub async fn get_device_descriptor(&self) -> Result<Vec<u8>> {
        let urb = Urb::control_in(setup(
            0x80,
            USB_REQ_GET_DESCRIPTOR,
            (USB_DT_DEVICE as u16) << 8,
            0,
            USB_DT_DEVICE_SIZE,
        ));
        Ok(self.transfer(urb).await?.data().to_vec())
    }

    /// Fetch the full configuration descriptor at `index`
    pub async fn get_configuration_descriptor(&self, index: u8) -> Result<Vec<u8>> {
        let value = ((USB_DT_CONFIG as u16) << 8) | index as u16;
        let header = self
            .transfer(Urb::control_in(setup(
                0x80,
                USB_REQ_GET_DESCRIPTOR,
                value,
                0,
                USB_DT_CONFIG_SIZE,
            )))
            .await?;
        let header = header.data();
        if header.len() < USB_DT_CONFIG_SIZE as usize {
            return Err(Error::InvalidParameter(format!(
                "short configuration descriptor ({} bytes)",
                header.len()
            )));
        }

        let total = u16::from_le_bytes([header[2], header[3]]);
        let full = self
            .transfer(Urb::control_in(setup(
                0x80,
                USB_REQ_GET_DESCRIPTOR,
                value,
                0,
                total,
            )))
            .await?;
        Ok(full.data().to_vec())
    }

    /// Make `configuration` active, or unconfigure the device with `None`
    ///
    /// SET_CONFIGURATION is relayed first; the cache is only replaced once
    /// the device accepted it.
    pub async fn select_configuration(&self, configuration: Option<Vec<u8>>) -> Result<()> {
        let parsed = configuration.map(ConfigurationDescriptor::parse).transpose()?;
        let value = parsed.as_ref().map_or(0, |c| c.value());

        self.transfer(Urb::control(
            setup(0x00, USB_REQ_SET_CONFIGURATION, value as u16, 0, 0),
            Vec::new(),
        ))
        .await?;

        debug!("Port {}: configuration {} selected", self.port, value);
        self.descriptors().set_configuration(parsed);
        Ok(())
    }

    pub async fn select_interface(&self, number: u8, alternate_setting: u8) -> Result<()> {
        self.descriptors().lookup_interface(number, alternate_setting)?;

        self.transfer(Urb::control(
            setup(
                0x01,
                USB_REQ_SET_INTERFACE,
                alternate_setting as u16,
                number as u16,
                0,
            ),
            Vec::new(),
        ))
        .await?;

        debug!(
            "Port {}: interface {} alternate setting {} selected",
            self.port, number, alternate_setting
        );
        self.descriptors().record_interface(number, alternate_setting);
        Ok(())
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        let connected = self.connection().is_some() && !self.pipeline.is_removed();
        let descriptors = self.descriptors();
        ConnectionInfo {
            port: self.port,
            busid: self.info.busid.clone(),
            connected,
            speed: self.info.speed,
            configuration_value: descriptors.configuration().map(|c| c.value()),
            interface: descriptors.current_interface(),
            endpoints: descriptors.current_endpoints(),
        }
    }

    /// Detach explicitly
    pub fn detach(&self) -> Result<()> {
        if self.pnp_state() == PnpState::Removed {
            return Err(Error::NotPresent);
        }
        self.pnp(PnpEvent::Remove)
            .map(|_| ())
            .map_err(|_| Error::NotPresent)
    }

    /// The transport failed underneath the device
    pub(crate) fn surprise_removed(&self, reason: RemovalReason) {
        if self.pnp_state() == PnpState::Removed {
            return;
        }
        warn!("Port {}: surprise removal ({:?})", self.port, reason);
        // A concurrent detach may win; either way the device ends up removed
        if self
            .pnp_with_reason(PnpEvent::SurpriseRemoval, reason.clone())
            .is_ok()
        {
            let _ = self.pnp_with_reason(PnpEvent::Remove, reason);
        }
    }

    pub fn is_removed(&self) -> bool {
        self.pnp_state() == PnpState::Removed
    }
}

impl PnpDevice for VirtualDevice {
    fn role(&self) -> DeviceRole {
        DeviceRole::Port(self.port)
    }

    fn lifecycle(&self) -> &Mutex<Lifecycle> {
        &self.lifecycle
    }

    fn release(&self, reason: RemovalReason) {
        let cancelled = self.pipeline.shutdown();
        if let Some(connection) = self.connection().take() {
            connection.close();
        }
        self.descriptors().clear();

        info!(
            "Port {}: device {} removed ({} requests cancelled)",
            self.port, self.info.busid, cancelled
        );
        self.events.publish(VhciEvent::DeviceRemoved {
            port: self.port,
            reason,
        });
    }
}
