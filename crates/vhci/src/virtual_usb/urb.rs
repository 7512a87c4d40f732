//! USB Request Blocks as submitted by the USB stack
//!
//! A [`Urb`] owns its transfer buffer. For OUT transfers the buffer holds
//! the data to send; for IN transfers its length is the number of bytes
//! requested and the completion fills it in place.

use common::{Error, Result};
use protocol::{
    CmdSubmit, Direction, HeaderBody, IsoPacketDescriptor, MAX_ISO_PACKETS, NON_ISO_PACKETS,
    RequestShape, UrbStatus, UsbipHeader, encode_parts, transfer_flags,
};

/// Transfer type with its type-specific parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control { setup: [u8; 8] },
    Bulk,
    Interrupt { interval: i32 },
    Isochronous { start_frame: i32, interval: i32 },
}

/// One packet of an isochronous transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacket {
    /// Offset of the packet within the transfer buffer
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: UrbStatus,
}

impl IsoPacket {
    pub fn new(offset: u32, length: u32) -> Self {
        Self {
            offset,
            length,
            actual_length: 0,
            status: UrbStatus::Success,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Urb {
    /// Endpoint address, bit 7 set for IN
    pub endpoint: u8,
    pub direction: Direction,
    pub kind: TransferKind,
    pub transfer_flags: u32,
    pub buffer: Vec<u8>,
    pub iso_packets: Vec<IsoPacket>,
}

impl Urb {
    fn new(endpoint: u8, direction: Direction, kind: TransferKind, buffer: Vec<u8>) -> Self {
        let transfer_flags = match direction {
            Direction::In => transfer_flags::URB_DIR_IN,
            Direction::Out => 0,
        };
        Self {
            endpoint,
            direction,
            kind,
            transfer_flags,
            buffer,
            iso_packets: Vec::new(),
        }
    }

    /// Control transfer on the default pipe; direction comes from bmRequestType
    pub fn control(setup: [u8; 8], buffer: Vec<u8>) -> Self {
        let direction = Direction::from_address(setup[0]);
        let endpoint = match direction {
            Direction::In => 0x80,
            Direction::Out => 0x00,
        };
        Self::new(endpoint, direction, TransferKind::Control { setup }, buffer)
    }

    /// Control IN reading up to `wLength` bytes
    pub fn control_in(setup: [u8; 8]) -> Self {
        let length = u16::from_le_bytes([setup[6], setup[7]]) as usize;
        Self::control(setup, vec![0; length])
    }

    pub fn bulk_in(endpoint: u8, length: usize) -> Self {
        Self::new(endpoint | 0x80, Direction::In, TransferKind::Bulk, vec![0; length])
    }

    pub fn bulk_out(endpoint: u8, data: Vec<u8>) -> Self {
        Self::new(endpoint & 0x0F, Direction::Out, TransferKind::Bulk, data)
    }

    pub fn interrupt_in(endpoint: u8, length: usize, interval: i32) -> Self {
        Self::new(
            endpoint | 0x80,
            Direction::In,
            TransferKind::Interrupt { interval },
            vec![0; length],
        )
    }

    pub fn interrupt_out(endpoint: u8, data: Vec<u8>, interval: i32) -> Self {
        Self::new(
            endpoint & 0x0F,
            Direction::Out,
            TransferKind::Interrupt { interval },
            data,
        )
    }

    /// Isochronous IN with packets laid out back to back
    pub fn iso_in(endpoint: u8, packet_lengths: &[u32], interval: i32) -> Self {
        let (packets, total) = layout_packets(packet_lengths);
        let mut urb = Self::new(
            endpoint | 0x80,
            Direction::In,
            TransferKind::Isochronous {
                start_frame: 0,
                interval,
            },
            vec![0; total],
        );
        urb.transfer_flags |= transfer_flags::URB_ISO_ASAP;
        urb.iso_packets = packets;
        urb
    }

    /// Isochronous OUT, one packet per element of `packets`
    pub fn iso_out(endpoint: u8, packets: &[Vec<u8>], interval: i32) -> Self {
        let lengths: Vec<u32> = packets.iter().map(|p| p.len() as u32).collect();
        let (iso_packets, _) = layout_packets(&lengths);
        let mut urb = Self::new(
            endpoint & 0x0F,
            Direction::Out,
            TransferKind::Isochronous {
                start_frame: 0,
                interval,
            },
            packets.concat(),
        );
        urb.transfer_flags |= transfer_flags::URB_ISO_ASAP;
        urb.iso_packets = iso_packets;
        urb
    }

    /// Endpoint number without the direction bit
    pub fn endpoint_number(&self) -> u8 {
        self.endpoint & 0x0F
    }

    pub fn is_isochronous(&self) -> bool {
        matches!(self.kind, TransferKind::Isochronous { .. })
    }

    /// What the reply to this URB will look like
    pub fn shape(&self) -> RequestShape {
        RequestShape {
            direction: self.direction,
            isochronous: self.is_isochronous(),
            buffer_length: self.buffer.len() as u32,
            number_of_packets: self.iso_packets.len() as u32,
        }
    }

    /// Check the URB can be expressed on the wire
    pub fn validate(&self) -> Result<()> {
        if self.buffer.len() > i32::MAX as usize {
            return Err(Error::InvalidParameter(format!(
                "transfer buffer of {} bytes is too large",
                self.buffer.len()
            )));
        }

        if !self.is_isochronous() {
            if !self.iso_packets.is_empty() {
                return Err(Error::InvalidParameter(
                    "iso packets on a non-isochronous URB".to_string(),
                ));
            }
            return Ok(());
        }

        if self.iso_packets.is_empty() || self.iso_packets.len() > MAX_ISO_PACKETS as usize {
            return Err(Error::InvalidParameter(format!(
                "isochronous URB with {} packets",
                self.iso_packets.len()
            )));
        }
        for packet in &self.iso_packets {
            let end = packet.offset as usize + packet.length as usize;
            if end > self.buffer.len() {
                return Err(Error::InvalidParameter(format!(
                    "iso packet at {} ends past the {} byte buffer",
                    packet.offset,
                    self.buffer.len()
                )));
            }
        }
        Ok(())
    }

    /// Encode as CMD_SUBMIT with a zero seqnum
    pub fn encode_submit(&self, devid: u32) -> Result<Vec<u8>> {
        let (start_frame, interval, setup) = match self.kind {
            TransferKind::Control { setup } => (0, 0, setup),
            TransferKind::Bulk => (0, 0, [0; 8]),
            TransferKind::Interrupt { interval } => (0, interval, [0; 8]),
            TransferKind::Isochronous {
                start_frame,
                interval,
            } => (start_frame, interval, [0; 8]),
        };
        let number_of_packets = if self.is_isochronous() {
            self.iso_packets.len() as i32
        } else {
            NON_ISO_PACKETS
        };

        let header = UsbipHeader::new(
            devid,
            self.direction,
            self.endpoint_number() as u32,
            HeaderBody::CmdSubmit(CmdSubmit {
                transfer_flags: self.transfer_flags,
                transfer_buffer_length: self.buffer.len() as u32,
                start_frame,
                number_of_packets,
                interval,
                setup,
            }),
        );

        let data: &[u8] = match self.direction {
            Direction::Out => &self.buffer,
            Direction::In => &[],
        };
        let descriptors: Vec<IsoPacketDescriptor> = self
            .iso_packets
            .iter()
            .map(|p| IsoPacketDescriptor {
                offset: p.offset,
                length: p.length,
                actual_length: 0,
                status: 0,
            })
            .collect();

        Ok(encode_parts(&header, data, &descriptors)?)
    }
}

fn layout_packets(lengths: &[u32]) -> (Vec<IsoPacket>, usize) {
    let mut offset = 0u32;
    let packets = lengths
        .iter()
        .map(|&length| {
            let packet = IsoPacket::new(offset, length);
            offset = offset.saturating_add(length);
            packet
        })
        .collect();
    (packets, offset as usize)
}

/// Terminal result of a submitted URB
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrbCompletion {
    /// The URB, with IN data and iso packet results filled in
    pub urb: Urb,
    pub status: UrbStatus,
    pub actual_length: u32,
    pub start_frame: i32,
    pub error_count: i32,
}

impl UrbCompletion {
    pub(crate) fn cancelled(urb: Urb) -> Self {
        Self::failed(urb, UrbStatus::Cancelled)
    }

    pub(crate) fn failed(urb: Urb, status: UrbStatus) -> Self {
        Self {
            urb,
            status,
            actual_length: 0,
            start_frame: 0,
            error_count: 0,
        }
    }

    /// Bytes received by a non-isochronous IN transfer
    pub fn data(&self) -> &[u8] {
        let end = (self.actual_length as usize).min(self.urb.buffer.len());
        &self.urb.buffer[..end]
    }

    /// Success status, or the failure as an error
    pub fn into_result(self) -> Result<Self> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(Error::Urb(self.status))
        }
    }
}
