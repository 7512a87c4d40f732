//! USB and protocol type definitions
//!
//! Enumerations shared by the URB messages and the attach-time operations:
//! transfer direction, device speed, transfer flags, and the mapping of
//! Linux errno values carried in replies onto URB completion statuses.

use crate::error::{ProtocolError, Result};
use std::fmt;

/// Transfer direction as carried in `usbip_header_basic.direction`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    /// Host to device (USBIP_DIR_OUT)
    #[default]
    Out,
    /// Device to host (USBIP_DIR_IN)
    In,
}

impl Direction {
    /// Decode the wire value
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Out),
            1 => Ok(Self::In),
            other => Err(ProtocolError::InvalidDirection(other)),
        }
    }

    /// Wire value
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Out => 0,
            Self::In => 1,
        }
    }

    /// Direction encoded in bit 7 of an endpoint address or bmRequestType
    pub fn from_address(address: u8) -> Self {
        if address & 0x80 != 0 { Self::In } else { Self::Out }
    }
}

/// USB device speed (`enum usb_device_speed`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UsbSpeed {
    #[default]
    Unknown,
    /// Low speed - 1.5 Mbps
    Low,
    /// Full speed - 12 Mbps
    Full,
    /// High speed - 480 Mbps
    High,
    /// Wireless USB - 53.3-480 Mbps
    Wireless,
    /// SuperSpeed - 5 Gbps
    Super,
    /// SuperSpeed+ - 10 Gbps
    SuperPlus,
}

impl UsbSpeed {
    /// Decode the wire value; unknown values map to `Unknown`
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Low,
            2 => Self::Full,
            3 => Self::High,
            4 => Self::Wireless,
            5 => Self::Super,
            6 => Self::SuperPlus,
            _ => Self::Unknown,
        }
    }

    /// Wire value
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Low => 1,
            Self::Full => 2,
            Self::High => 3,
            Self::Wireless => 4,
            Self::Super => 5,
            Self::SuperPlus => 6,
        }
    }

    /// Human readable description
    pub fn description(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown Speed",
            Self::Low => "Low Speed(1.5Mbps)",
            Self::Full => "Full Speed(12Mbps)",
            Self::High => "High Speed(480Mbps)",
            Self::Wireless => "Wireless",
            Self::Super => "Super Speed(5000Mbps)",
            Self::SuperPlus => "Super Speed Plus(10 Gbit/s)",
        }
    }
}

impl fmt::Display for UsbSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// URB transfer flags (`transfer_flags` of CMD_SUBMIT, Linux values)
pub mod transfer_flags {
    pub const URB_SHORT_NOT_OK: u32 = 0x0001;
    pub const URB_ISO_ASAP: u32 = 0x0002;
    pub const URB_NO_TRANSFER_DMA_MAP: u32 = 0x0004;
    pub const URB_ZERO_PACKET: u32 = 0x0040;
    pub const URB_NO_INTERRUPT: u32 = 0x0080;
    pub const URB_FREE_BUFFER: u32 = 0x0100;
    pub const URB_DIR_IN: u32 = 0x0200;
}

/// Linux errno values that appear in RET_SUBMIT/RET_UNLINK status fields
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const ENODEV: i32 = 19;
    pub const EXDEV: i32 = 18;
    pub const EINVAL: i32 = 22;
    pub const EPIPE: i32 = 32;
    pub const ENOSR: i32 = 63;
    pub const ETIME: i32 = 62;
    pub const ECOMM: i32 = 70;
    pub const EPROTO: i32 = 71;
    pub const EOVERFLOW: i32 = 75;
    pub const EILSEQ: i32 = 84;
    pub const ECONNRESET: i32 = 104;
    pub const ESHUTDOWN: i32 = 108;
    pub const ETIMEDOUT: i32 = 110;
    pub const EINPROGRESS: i32 = 115;
    pub const EREMOTEIO: i32 = 121;
}

/// Completion status of a relayed URB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UrbStatus {
    Success,
    /// Endpoint halted (-EPIPE)
    Stall,
    /// Unlinked or cancelled locally (-ECONNRESET, -ENOENT)
    Cancelled,
    /// Device did not respond (-ETIME, -ETIMEDOUT)
    Timeout,
    /// Device sent more data than requested (-EOVERFLOW)
    Babble,
    /// Short read with URB_SHORT_NOT_OK set (-EREMOTEIO)
    ShortPacket,
    /// Device is gone (-ENODEV, -ESHUTDOWN)
    DeviceGone,
    /// CRC / bit-stuffing / protocol error (-EPROTO, -EILSEQ)
    Protocol,
    /// -ECOMM
    BufferOverrun,
    /// -ENOSR
    BufferUnderrun,
    /// Isochronous transfer only partially completed (-EXDEV)
    IsoPartial,
    /// Any other negative errno
    Error(i32),
}

impl UrbStatus {
    /// Map the status field of a reply
    pub fn from_errno(status: i32) -> Self {
        use errno::*;
        if status == 0 {
            return Self::Success;
        }
        match -status {
            EPIPE => Self::Stall,
            ECONNRESET | ENOENT => Self::Cancelled,
            ETIME | ETIMEDOUT => Self::Timeout,
            EOVERFLOW => Self::Babble,
            EREMOTEIO => Self::ShortPacket,
            ENODEV | ESHUTDOWN => Self::DeviceGone,
            EPROTO | EILSEQ => Self::Protocol,
            ECOMM => Self::BufferOverrun,
            ENOSR => Self::BufferUnderrun,
            EXDEV => Self::IsoPartial,
            _ => Self::Error(status),
        }
    }

    /// Canonical errno for this status (0 for success)
    pub fn to_errno(self) -> i32 {
        use errno::*;
        match self {
            Self::Success => 0,
            Self::Stall => -EPIPE,
            Self::Cancelled => -ECONNRESET,
            Self::Timeout => -ETIMEDOUT,
            Self::Babble => -EOVERFLOW,
            Self::ShortPacket => -EREMOTEIO,
            Self::DeviceGone => -ENODEV,
            Self::Protocol => -EPROTO,
            Self::BufferOverrun => -ECOMM,
            Self::BufferUnderrun => -ENOSR,
            Self::IsoPartial => -EXDEV,
            Self::Error(status) => status,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Import failure reported by the exporting host (`op_common.status`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportStatus {
    /// Device requested for import is not available (ST_NA)
    NotAvailable,
    /// Device busy, already exported (ST_DEV_BUSY)
    DeviceBusy,
    /// Device in error state (ST_DEV_ERR)
    DeviceError,
    /// No device with that bus id (ST_NODEV)
    NoDevice,
    /// Unexpected response (ST_ERROR)
    Error,
    /// Status value outside the known set
    Other(u32),
}

impl ImportStatus {
    /// Decode a non-zero op status; zero means success and yields `None`
    pub fn from_u32(status: u32) -> Option<Self> {
        match status {
            0 => None,
            1 => Some(Self::NotAvailable),
            2 => Some(Self::DeviceBusy),
            3 => Some(Self::DeviceError),
            4 => Some(Self::NoDevice),
            5 => Some(Self::Error),
            other => Some(Self::Other(other)),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::NotAvailable => 1,
            Self::DeviceBusy => 2,
            Self::DeviceError => 3,
            Self::NoDevice => 4,
            Self::Error => 5,
            Self::Other(status) => status,
        }
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAvailable => f.write_str("device not available"),
            Self::DeviceBusy => f.write_str("device busy (already exported)"),
            Self::DeviceError => f.write_str("device in error state"),
            Self::NoDevice => f.write_str("device not found"),
            Self::Error => f.write_str("unexpected response"),
            Self::Other(status) => write!(f, "import status #{}", status),
        }
    }
}
