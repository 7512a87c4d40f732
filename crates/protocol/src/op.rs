//! Attach-time operation messages
//!
//! Before URB traffic starts, the importing host asks the exporting host
//! for its device list or imports one device by bus id. These messages
//! share an 8-byte `op_common` prefix:
//!
//! ```text
//! [version: u16][code: u16][status: u32]
//! ```

use crate::error::{ProtocolError, Result};
use crate::types::{ImportStatus, UsbSpeed};
use crate::version::{USBIP_VERSION, validate_version};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

#[cfg(feature = "async")]
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Command code: Retrieve the list of exported USB devices
pub const OP_REQ_DEVLIST: u16 = 0x8005;
/// Reply code: The list of exported USB devices
pub const OP_REP_DEVLIST: u16 = 0x0005;
/// Command code: import a remote USB device
pub const OP_REQ_IMPORT: u16 = 0x8003;
/// Reply code: Reply to import
pub const OP_REP_IMPORT: u16 = 0x0003;

/// Size of the bus id field
pub const BUSID_SIZE: usize = 32;
/// Size of the sysfs path field
pub const PATH_SIZE: usize = 256;
/// Upper bound on devices accepted in one OP_REP_DEVLIST
pub const MAX_EXPORTED_DEVICES: u32 = 1024;

/// `op_common` prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCommon {
    pub version: u16,
    pub code: u16,
    pub status: u32,
}

impl OpCommon {
    pub const SIZE: usize = 8;

    /// Request prefix with the supported version
    pub fn request(code: u16) -> Self {
        Self {
            version: USBIP_VERSION,
            code,
            status: 0,
        }
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            version: reader.read_u16::<BigEndian>()?,
            code: reader.read_u16::<BigEndian>()?,
            status: reader.read_u32::<BigEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(self.version)?;
        writer.write_u16::<BigEndian>(self.code)?;
        writer.write_u32::<BigEndian>(self.status)?;
        Ok(())
    }

    /// Validate version and code of a reply prefix
    pub fn expect_reply(&self, code: u16) -> Result<()> {
        validate_version(self.version)?;
        if self.code != code {
            return Err(ProtocolError::UnexpectedReply {
                expected: code,
                actual: self.code,
            });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.version.to_be_bytes());
        buf[2..4].copy_from_slice(&self.code.to_be_bytes());
        buf[4..8].copy_from_slice(&self.status.to_be_bytes());
        buf
    }
}

/// `usbip_usb_device`: exported device record
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UsbDevice {
    pub path: String,
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: UsbSpeed,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
}

impl UsbDevice {
    pub const SIZE: usize = 312;

    /// Device id used in every URB header for this device
    pub fn devid(&self) -> u32 {
        (self.busnum << 16) | (self.devnum & 0xFFFF)
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut path = [0u8; PATH_SIZE];
        reader.read_exact(&mut path)?;
        let mut busid = [0u8; BUSID_SIZE];
        reader.read_exact(&mut busid)?;

        Ok(Self {
            path: c_string(&path),
            busid: c_string(&busid),
            busnum: reader.read_u32::<BigEndian>()?,
            devnum: reader.read_u32::<BigEndian>()?,
            speed: UsbSpeed::from_u32(reader.read_u32::<BigEndian>()?),
            id_vendor: reader.read_u16::<BigEndian>()?,
            id_product: reader.read_u16::<BigEndian>()?,
            bcd_device: reader.read_u16::<BigEndian>()?,
            device_class: reader.read_u8()?,
            device_subclass: reader.read_u8()?,
            device_protocol: reader.read_u8()?,
            configuration_value: reader.read_u8()?,
            num_configurations: reader.read_u8()?,
            num_interfaces: reader.read_u8()?,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&fixed_string::<PATH_SIZE>("path", &self.path)?)?;
        writer.write_all(&fixed_string::<BUSID_SIZE>("busid", &self.busid)?)?;
        writer.write_u32::<BigEndian>(self.busnum)?;
        writer.write_u32::<BigEndian>(self.devnum)?;
        writer.write_u32::<BigEndian>(self.speed.as_u32())?;
        writer.write_u16::<BigEndian>(self.id_vendor)?;
        writer.write_u16::<BigEndian>(self.id_product)?;
        writer.write_u16::<BigEndian>(self.bcd_device)?;
        writer.write_u8(self.device_class)?;
        writer.write_u8(self.device_subclass)?;
        writer.write_u8(self.device_protocol)?;
        writer.write_u8(self.configuration_value)?;
        writer.write_u8(self.num_configurations)?;
        writer.write_u8(self.num_interfaces)?;
        Ok(())
    }
}

/// `usbip_usb_interface`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsbInterface {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl UsbInterface {
    pub const SIZE: usize = 4;

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let interface = Self {
            class: reader.read_u8()?,
            subclass: reader.read_u8()?,
            protocol: reader.read_u8()?,
        };
        reader.read_u8()?; // padding
        Ok(interface)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[self.class, self.subclass, self.protocol, 0])?;
        Ok(())
    }
}

/// One entry of OP_REP_DEVLIST
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExportedDevice {
    pub device: UsbDevice,
    pub interfaces: Vec<UsbInterface>,
}

/// Outcome of OP_REQ_IMPORT
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportReply {
    Imported(UsbDevice),
    Refused(ImportStatus),
}

/// Encode OP_REQ_IMPORT for `busid`
pub fn encode_import_request(busid: &str) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(OpCommon::SIZE + BUSID_SIZE);
    OpCommon::request(OP_REQ_IMPORT).write_to(&mut buf)?;
    buf.extend_from_slice(&fixed_string::<BUSID_SIZE>("busid", busid)?);
    Ok(buf)
}

/// Encode OP_REQ_DEVLIST
pub fn encode_devlist_request() -> Vec<u8> {
    OpCommon::request(OP_REQ_DEVLIST).to_bytes().to_vec()
}

/// Read OP_REP_IMPORT from a blocking reader
pub fn read_import_reply<R: Read>(reader: &mut R) -> Result<ImportReply> {
    let common = OpCommon::read_from(reader)?;
    common.expect_reply(OP_REP_IMPORT)?;

    match ImportStatus::from_u32(common.status) {
        Some(status) => Ok(ImportReply::Refused(status)),
        None => Ok(ImportReply::Imported(UsbDevice::read_from(reader)?)),
    }
}

/// Read the body of OP_REP_DEVLIST (after its `op_common`) from a blocking reader
pub fn read_devlist_body<R: Read>(reader: &mut R) -> Result<Vec<ExportedDevice>> {
    let count = reader.read_u32::<BigEndian>()?;
    if count > MAX_EXPORTED_DEVICES {
        return Err(ProtocolError::InconsistentLength {
            field: "ndev",
            value: count as u64,
            limit: MAX_EXPORTED_DEVICES as u64,
        });
    }

    let mut devices = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let device = UsbDevice::read_from(reader)?;
        let interfaces = (0..device.num_interfaces)
            .map(|_| UsbInterface::read_from(reader))
            .collect::<Result<Vec<_>>>()?;
        devices.push(ExportedDevice { device, interfaces });
    }
    Ok(devices)
}

/// Encode a full OP_REP_DEVLIST (used by test peers)
pub fn encode_devlist_reply(devices: &[ExportedDevice]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    OpCommon {
        version: USBIP_VERSION,
        code: OP_REP_DEVLIST,
        status: 0,
    }
    .write_to(&mut buf)?;
    WriteBytesExt::write_u32::<BigEndian>(&mut buf, devices.len() as u32)?;
    for exported in devices {
        exported.device.write_to(&mut buf)?;
        for interface in &exported.interfaces {
            interface.write_to(&mut buf)?;
        }
    }
    Ok(buf)
}

/// Encode a full OP_REP_IMPORT (used by test peers)
pub fn encode_import_reply(reply: &ImportReply) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(OpCommon::SIZE + UsbDevice::SIZE);
    let status = match reply {
        ImportReply::Imported(_) => 0,
        ImportReply::Refused(status) => status.as_u32(),
    };
    OpCommon {
        version: USBIP_VERSION,
        code: OP_REP_IMPORT,
        status,
    }
    .write_to(&mut buf)?;
    if let ImportReply::Imported(device) = reply {
        device.write_to(&mut buf)?;
    }
    Ok(buf)
}

/// Async: send OP_REQ_IMPORT and read the reply
#[cfg(feature = "async")]
pub async fn import_async<S>(stream: &mut S, busid: &str) -> Result<ImportReply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&encode_import_request(busid)?).await?;
    stream.flush().await?;

    let mut common = [0u8; OpCommon::SIZE];
    stream.read_exact(&mut common).await?;
    let common = OpCommon::read_from(&mut &common[..])?;
    common.expect_reply(OP_REP_IMPORT)?;

    if let Some(status) = ImportStatus::from_u32(common.status) {
        return Ok(ImportReply::Refused(status));
    }

    let mut device = [0u8; UsbDevice::SIZE];
    stream.read_exact(&mut device).await?;
    Ok(ImportReply::Imported(UsbDevice::read_from(&mut &device[..])?))
}

/// Async: send OP_REQ_DEVLIST and read the exported device list
#[cfg(feature = "async")]
pub async fn devlist_async<S>(stream: &mut S) -> Result<Vec<ExportedDevice>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&encode_devlist_request()).await?;
    stream.flush().await?;

    let mut common = [0u8; OpCommon::SIZE];
    stream.read_exact(&mut common).await?;
    let common = OpCommon::read_from(&mut &common[..])?;
    common.expect_reply(OP_REP_DEVLIST)?;

    let count = stream.read_u32().await?;
    if count > MAX_EXPORTED_DEVICES {
        return Err(ProtocolError::InconsistentLength {
            field: "ndev",
            value: count as u64,
            limit: MAX_EXPORTED_DEVICES as u64,
        });
    }

    let mut devices = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut raw = [0u8; UsbDevice::SIZE];
        stream.read_exact(&mut raw).await?;
        let device = UsbDevice::read_from(&mut &raw[..])?;

        let mut raw = vec![0u8; device.num_interfaces as usize * UsbInterface::SIZE];
        stream.read_exact(&mut raw).await?;
        let mut reader = &raw[..];
        let interfaces = (0..device.num_interfaces)
            .map(|_| UsbInterface::read_from(&mut reader))
            .collect::<Result<Vec<_>>>()?;

        devices.push(ExportedDevice { device, interfaces });
    }
    Ok(devices)
}

fn c_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// NUL-padded fixed field; the string must leave room for the terminator
fn fixed_string<const N: usize>(field: &'static str, value: &str) -> Result<[u8; N]> {
    let bytes = value.as_bytes();
    if bytes.len() >= N {
        return Err(ProtocolError::InconsistentLength {
            field,
            value: bytes.len() as u64,
            limit: (N - 1) as u64,
        });
    }
    let mut buf = [0u8; N];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(buf)
}
