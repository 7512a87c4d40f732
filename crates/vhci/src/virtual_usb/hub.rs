//! Root hub: the fixed port table of the virtual host controller

use common::{Error, EventSender, RemovalReason, Result};
use protocol::UsbDevice;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::device::VirtualDevice;
use super::lifecycle::{Lifecycle, PnpDevice, PnpEvent};
use super::{ControllerOptions, DeviceRole};

#[derive(Debug)]
pub struct RootHub {
    /// Slot `n` is port `n + 1`
    ports: Mutex<Vec<Option<Arc<VirtualDevice>>>>,
    lifecycle: Mutex<Lifecycle>,
    options: ControllerOptions,
    events: EventSender,
}

impl RootHub {
    pub(crate) fn new(options: ControllerOptions, events: EventSender) -> Self {
        Self {
            ports: Mutex::new(vec![None; options.num_ports as usize]),
            lifecycle: Mutex::new(Lifecycle::new()),
            options,
            events,
        }
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Option<Arc<VirtualDevice>>>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn num_ports(&self) -> u8 {
        self.options.num_ports
    }

    /// Place a newly imported device on the lowest free port
    ///
    /// Ports whose device has been removed are free.
    pub fn plug(&self, info: UsbDevice) -> Result<Arc<VirtualDevice>> {
        let accepting = self
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .accepts_submissions();
        if !accepting {
            return Err(Error::NotPresent);
        }

        let mut slots = self.slots();
        let index = slots
            .iter()
            .position(|slot| slot.as_ref().is_none_or(|device| device.is_removed()))
            .ok_or(Error::NoFreePort)?;

        let port = index as u8 + 1;
        let device = VirtualDevice::new(
            port,
            info,
            self.options.max_outstanding_requests,
            self.options.read_buffer_size,
            self.events.clone(),
        );
        slots[index] = Some(device.clone());
        debug!("Device {} plugged into port {}", device.busid(), port);
        Ok(device)
    }

    /// Detach and free `port`
    pub fn unplug(&self, port: u8) -> Result<()> {
        let device = {
            let mut slots = self.slots();
            let slot = port
                .checked_sub(1)
                .and_then(|index| slots.get_mut(index as usize))
                .ok_or_else(|| Error::InvalidParameter(format!("no port {}", port)))?;
            slot.take().ok_or(Error::NotPresent)?
        };
        device.detach()
    }

    /// The live device on `port`
    pub fn find(&self, port: u8) -> Option<Arc<VirtualDevice>> {
        let index = port.checked_sub(1)? as usize;
        self.slots()
            .get(index)
            .and_then(|slot| slot.clone())
            .filter(|device| !device.is_removed())
    }

    /// Live devices in port order
    pub fn ports(&self) -> Vec<Arc<VirtualDevice>> {
        self.slots()
            .iter()
            .flatten()
            .filter(|device| !device.is_removed())
            .cloned()
            .collect()
    }
}

impl PnpDevice for RootHub {
    fn role(&self) -> DeviceRole {
        DeviceRole::RootHub
    }

    fn lifecycle(&self) -> &Mutex<Lifecycle> {
        &self.lifecycle
    }

    fn release(&self, reason: RemovalReason) {
        let devices: Vec<_> = self.slots().iter_mut().filter_map(Option::take).collect();
        for device in devices {
            // Already-removed devices reject the event
            let _ = device.pnp_with_reason(PnpEvent::Remove, reason.clone());
        }
    }
}
