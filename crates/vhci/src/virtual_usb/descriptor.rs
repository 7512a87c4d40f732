//! Configuration descriptor cache
//!
//! Holds the active configuration descriptor of an attached device and the
//! interface alternate setting last selected on it.

use common::{Error, Result};
use protocol::Direction;

const DT_CONFIG: u8 = 0x02;
const DT_INTERFACE: u8 = 0x04;
const DT_ENDPOINT: u8 = 0x05;
const CONFIG_HEADER_SIZE: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointInfo {
    pub fn direction(&self) -> Direction {
        Direction::from_address(self.address)
    }

    /// 0 control, 1 isochronous, 2 bulk, 3 interrupt
    pub fn transfer_type(&self) -> u8 {
        self.attributes & 0x03
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointInfo>,
}

/// A parsed configuration descriptor with its raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    raw: Vec<u8>,
    value: u8,
    interfaces: Vec<InterfaceInfo>,
}

impl ConfigurationDescriptor {
    /// Parse a full configuration descriptor (header plus all subordinates)
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        if raw.len() < CONFIG_HEADER_SIZE || raw[1] != DT_CONFIG {
            return Err(Error::InvalidParameter(
                "not a configuration descriptor".into(),
            ));
        }
        let total = u16::from_le_bytes([raw[2], raw[3]]) as usize;
        if total < CONFIG_HEADER_SIZE || total > raw.len() {
            return Err(Error::InvalidParameter(format!(
                "configuration wTotalLength {} with {} bytes",
                total,
                raw.len()
            )));
        }

        let mut interfaces: Vec<InterfaceInfo> = Vec::new();
        let mut pos = raw[0] as usize;
        while pos + 2 <= total {
            let len = raw[pos] as usize;
            if len < 2 || pos + len > total {
                return Err(Error::InvalidParameter(format!(
                    "descriptor of length {} at offset {}",
                    len, pos
                )));
            }
            let desc = &raw[pos..pos + len];
            match desc[1] {
                DT_INTERFACE if len >= 9 => interfaces.push(InterfaceInfo {
                    number: desc[2],
                    alternate_setting: desc[3],
                    class: desc[5],
                    subclass: desc[6],
                    protocol: desc[7],
                    endpoints: Vec::new(),
                }),
                DT_ENDPOINT if len >= 7 => {
                    // Endpoints before any interface are ignored
                    if let Some(interface) = interfaces.last_mut() {
                        interface.endpoints.push(EndpointInfo {
                            address: desc[2],
                            attributes: desc[3],
                            max_packet_size: u16::from_le_bytes([desc[4], desc[5]]),
                            interval: desc[6],
                        });
                    }
                }
                _ => {}
            }
            pos += len;
        }

        let value = raw[5];
        Ok(Self {
            raw,
            value,
            interfaces,
        })
    }

    /// bConfigurationValue
    pub fn value(&self) -> u8 {
        self.value
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn interfaces(&self) -> &[InterfaceInfo] {
        &self.interfaces
    }

    pub fn find_interface(&self, number: u8, alternate_setting: u8) -> Option<&InterfaceInfo> {
        self.interfaces
            .iter()
            .find(|i| i.number == number && i.alternate_setting == alternate_setting)
    }
}

#[derive(Debug, Default)]
pub struct DescriptorCache {
    configuration: Option<ConfigurationDescriptor>,
    interface: Option<(u8, u8)>,
}

impl DescriptorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configuration(&self) -> Option<&ConfigurationDescriptor> {
        self.configuration.as_ref()
    }

    /// Replace the active configuration; `None` leaves the device unconfigured
    pub fn set_configuration(&mut self, configuration: Option<ConfigurationDescriptor>) {
        self.configuration = configuration;
        self.interface = None;
    }

    /// Check that the active configuration has `number`/`alternate_setting`
    pub fn lookup_interface(&self, number: u8, alternate_setting: u8) -> Result<&InterfaceInfo> {
        let configuration = self
            .configuration
            .as_ref()
            .ok_or_else(|| Error::InvalidParameter("device is not configured".into()))?;
        configuration
            .find_interface(number, alternate_setting)
            .ok_or_else(|| {
                Error::InvalidParameter(format!(
                    "no interface {} alternate setting {} in configuration {}",
                    number,
                    alternate_setting,
                    configuration.value()
                ))
            })
    }

    pub fn record_interface(&mut self, number: u8, alternate_setting: u8) {
        self.interface = Some((number, alternate_setting));
    }

    pub fn current_interface(&self) -> Option<(u8, u8)> {
        self.interface
    }

    /// Endpoints of the selected interface, or empty when none is selected
    pub fn current_endpoints(&self) -> Vec<EndpointInfo> {
        self.interface
            .and_then(|(number, alt)| {
                self.configuration
                    .as_ref()
                    .and_then(|c| c.find_interface(number, alt))
            })
            .map(|i| i.endpoints.clone())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.configuration = None;
        self.interface = None;
    }
}
