//! USB/IP URB message definitions
//!
//! All URB traffic uses a fixed 48-byte header: the 20-byte
//! `usbip_header_basic` followed by a 28-byte command-specific block that is
//! zero padded. All integers are big-endian (network byte order).
//!
//! ```text
//! 0      4        8       12          16   20                          48
//! +------+--------+-------+-----------+----+---------------------------+
//! | cmd  | seqnum | devid | direction | ep | command-specific block    |
//! +------+--------+-------+-----------+----+---------------------------+
//! ```
//!
//! - CMD_SUBMIT may be followed by OUT data and iso packet descriptors
//! - RET_SUBMIT may be followed by IN data and iso packet descriptors
//! - CMD_UNLINK / RET_UNLINK never carry a payload

use crate::error::{ProtocolError, Result};
use crate::types::Direction;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

/// Command code: Submit an URB
pub const USBIP_CMD_SUBMIT: u32 = 0x0001;
/// Command code: Unlink an URB
pub const USBIP_CMD_UNLINK: u32 = 0x0002;
/// Reply code: Reply for submitting an URB
pub const USBIP_RET_SUBMIT: u32 = 0x0003;
/// Reply code: Reply for URB unlink
pub const USBIP_RET_UNLINK: u32 = 0x0004;

/// Size of every URB header in bytes
pub const HEADER_SIZE: usize = 48;
/// Size of `usbip_header_basic`
pub const HEADER_BASIC_SIZE: usize = 20;
/// Size of one `usbip_iso_packet_descriptor`
pub const ISO_PACKET_DESCRIPTOR_SIZE: usize = 16;
/// Upper bound on iso packets per URB accepted from the wire
pub const MAX_ISO_PACKETS: u32 = 1024;
/// `number_of_packets` value used by Linux for non-isochronous URBs
pub const NON_ISO_PACKETS: i32 = -1;

/// CMD_SUBMIT block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CmdSubmit {
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    /// Start frame for isochronous transfers
    pub start_frame: i32,
    /// Number of iso packets, 0 or -1 for other transfer types
    pub number_of_packets: i32,
    /// Polling interval for interrupt/isochronous transfers
    pub interval: i32,
    /// Setup packet for control transfers
    pub setup: [u8; 8],
}

/// RET_SUBMIT block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetSubmit {
    /// Status code (0 = success, negative errno = error)
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
}

impl RetSubmit {
    /// Create a successful return
    pub fn success(actual_length: u32) -> Self {
        Self {
            actual_length,
            ..Self::default()
        }
    }

    /// Create an error return
    pub fn error(status: i32) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }
}

/// CMD_UNLINK block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CmdUnlink {
    /// Sequence number of the CMD_SUBMIT to abort
    pub unlink_seqnum: u32,
}

/// RET_UNLINK block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetUnlink {
    /// -ECONNRESET if the URB was unlinked, 0 if it had already completed
    pub status: i32,
}

/// Command-specific part of a header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderBody {
    CmdSubmit(CmdSubmit),
    RetSubmit(RetSubmit),
    CmdUnlink(CmdUnlink),
    RetUnlink(RetUnlink),
}

impl HeaderBody {
    /// Command code written to the wire
    pub fn command(&self) -> u32 {
        match self {
            Self::CmdSubmit(_) => USBIP_CMD_SUBMIT,
            Self::RetSubmit(_) => USBIP_RET_SUBMIT,
            Self::CmdUnlink(_) => USBIP_CMD_UNLINK,
            Self::RetUnlink(_) => USBIP_RET_UNLINK,
        }
    }
}

/// Complete 48-byte URB header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbipHeader {
    /// Sequence number for matching requests/responses
    pub seqnum: u32,
    /// Remote device id (busnum << 16 | devnum)
    pub devid: u32,
    pub direction: Direction,
    /// Endpoint number (without direction bit)
    pub ep: u32,
    pub body: HeaderBody,
}

impl UsbipHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = HEADER_SIZE;

    /// Create a header with zero seqnum; the seqnum is assigned at send time
    pub fn new(devid: u32, direction: Direction, ep: u32, body: HeaderBody) -> Self {
        Self {
            seqnum: 0,
            devid,
            direction,
            ep,
            body,
        }
    }

    pub fn command(&self) -> u32 {
        self.body.command()
    }

    /// Read header from a reader
    ///
    /// The unused tail of the command block must be zero.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let command = reader.read_u32::<BigEndian>()?;
        let seqnum = reader.read_u32::<BigEndian>()?;
        let devid = reader.read_u32::<BigEndian>()?;
        let direction = Direction::from_u32(reader.read_u32::<BigEndian>()?)?;
        let ep = reader.read_u32::<BigEndian>()?;

        let mut raw = [0u8; HEADER_SIZE - HEADER_BASIC_SIZE];
        reader.read_exact(&mut raw)?;
        let mut block = Cursor::new(&raw[..]);

        let body = match command {
            USBIP_CMD_SUBMIT => {
                let transfer_flags = block.read_u32::<BigEndian>()?;
                let transfer_buffer_length = block.read_u32::<BigEndian>()?;
                let start_frame = block.read_i32::<BigEndian>()?;
                let number_of_packets = block.read_i32::<BigEndian>()?;
                let interval = block.read_i32::<BigEndian>()?;
                let mut setup = [0u8; 8];
                block.read_exact(&mut setup)?;

                check_packet_count(number_of_packets)?;
                check_length("transfer_buffer_length", transfer_buffer_length)?;

                HeaderBody::CmdSubmit(CmdSubmit {
                    transfer_flags,
                    transfer_buffer_length,
                    start_frame,
                    number_of_packets,
                    interval,
                    setup,
                })
            }
            USBIP_RET_SUBMIT => {
                let status = block.read_i32::<BigEndian>()?;
                let actual_length = block.read_u32::<BigEndian>()?;
                let start_frame = block.read_i32::<BigEndian>()?;
                let number_of_packets = block.read_i32::<BigEndian>()?;
                let error_count = block.read_i32::<BigEndian>()?;

                check_packet_count(number_of_packets)?;
                check_length("actual_length", actual_length)?;
                if error_count < 0 || error_count > number_of_packets.max(0) {
                    return Err(ProtocolError::InconsistentLength {
                        field: "error_count",
                        value: error_count as i64 as u64,
                        limit: number_of_packets.max(0) as u64,
                    });
                }

                HeaderBody::RetSubmit(RetSubmit {
                    status,
                    actual_length,
                    start_frame,
                    number_of_packets,
                    error_count,
                })
            }
            USBIP_CMD_UNLINK => HeaderBody::CmdUnlink(CmdUnlink {
                unlink_seqnum: block.read_u32::<BigEndian>()?,
            }),
            USBIP_RET_UNLINK => HeaderBody::RetUnlink(RetUnlink {
                status: block.read_i32::<BigEndian>()?,
            }),
            other => return Err(ProtocolError::UnknownCommand(other)),
        };

        // Padding must be zero so that a decoded header re-encodes byte for byte
        if raw[block.position() as usize..].iter().any(|&b| b != 0) {
            return Err(ProtocolError::NonZeroPadding(command));
        }

        Ok(Self {
            seqnum,
            devid,
            direction,
            ep,
            body,
        })
    }

    /// Write header to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.command())?;
        writer.write_u32::<BigEndian>(self.seqnum)?;
        writer.write_u32::<BigEndian>(self.devid)?;
        writer.write_u32::<BigEndian>(self.direction.as_u32())?;
        writer.write_u32::<BigEndian>(self.ep)?;

        // Bytes of the 28-byte block consumed by the command-specific fields
        let used = match &self.body {
            HeaderBody::CmdSubmit(cmd) => {
                writer.write_u32::<BigEndian>(cmd.transfer_flags)?;
                writer.write_u32::<BigEndian>(cmd.transfer_buffer_length)?;
                writer.write_i32::<BigEndian>(cmd.start_frame)?;
                writer.write_i32::<BigEndian>(cmd.number_of_packets)?;
                writer.write_i32::<BigEndian>(cmd.interval)?;
                writer.write_all(&cmd.setup)?;
                28
            }
            HeaderBody::RetSubmit(ret) => {
                writer.write_i32::<BigEndian>(ret.status)?;
                writer.write_u32::<BigEndian>(ret.actual_length)?;
                writer.write_i32::<BigEndian>(ret.start_frame)?;
                writer.write_i32::<BigEndian>(ret.number_of_packets)?;
                writer.write_i32::<BigEndian>(ret.error_count)?;
                20
            }
            HeaderBody::CmdUnlink(cmd) => {
                writer.write_u32::<BigEndian>(cmd.unlink_seqnum)?;
                4
            }
            HeaderBody::RetUnlink(ret) => {
                writer.write_i32::<BigEndian>(ret.status)?;
                4
            }
        };

        writer.write_all(&[0u8; HEADER_SIZE - HEADER_BASIC_SIZE][used..])?;
        Ok(())
    }

    /// Decode a header from the first [`HEADER_SIZE`] bytes of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::BufferTooSmall {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }
        Self::read_from(&mut Cursor::new(&bytes[..HEADER_SIZE]))
    }

    /// Encode the header into a fixed array
    pub fn to_bytes(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut buf = [0u8; HEADER_SIZE];
        self.write_to(&mut Cursor::new(&mut buf[..]))?;
        Ok(buf)
    }
}

/// `usbip_iso_packet_descriptor`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoPacketDescriptor {
    /// Offset of this packet within the transfer buffer
    pub offset: u32,
    /// Expected length of this packet
    pub length: u32,
    /// Bytes actually transferred
    pub actual_length: u32,
    /// Per-packet status (negative errno)
    pub status: i32,
}

impl IsoPacketDescriptor {
    pub const SIZE: usize = ISO_PACKET_DESCRIPTOR_SIZE;

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            offset: reader.read_u32::<BigEndian>()?,
            length: reader.read_u32::<BigEndian>()?,
            actual_length: reader.read_u32::<BigEndian>()?,
            status: reader.read_i32::<BigEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.offset)?;
        writer.write_u32::<BigEndian>(self.length)?;
        writer.write_u32::<BigEndian>(self.actual_length)?;
        writer.write_i32::<BigEndian>(self.status)?;
        Ok(())
    }
}

fn check_packet_count(number_of_packets: i32) -> Result<()> {
    if number_of_packets == NON_ISO_PACKETS {
        return Ok(());
    }
    if number_of_packets < 0 || number_of_packets as u32 > MAX_ISO_PACKETS {
        return Err(ProtocolError::TooManyPackets {
            count: number_of_packets as i64,
            max: MAX_ISO_PACKETS,
        });
    }
    Ok(())
}

fn check_length(field: &'static str, value: u32) -> Result<()> {
    if value > i32::MAX as u32 {
        return Err(ProtocolError::InconsistentLength {
            field,
            value: value as u64,
            limit: i32::MAX as u64,
        });
    }
    Ok(())
}
