//! URB message framing
//!
//! A header alone does not always say how many payload bytes follow it:
//! peers zero the direction of RET_SUBMIT, so the payload of a reply is
//! framed with the [`RequestShape`] recorded when the request was sent.
//!
//! # Message Format
//!
//! ```text
//! [Header: 48 bytes][Data: data_len bytes][Iso descriptors: 16 * n bytes]
//! ```

use crate::error::{ProtocolError, Result};
use crate::messages::{
    HEADER_SIZE, HeaderBody, ISO_PACKET_DESCRIPTOR_SIZE, IsoPacketDescriptor, RetSubmit,
    UsbipHeader,
};
use crate::types::Direction;
use std::io::Cursor;

/// What the submitter of a request knows about the reply it expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestShape {
    pub direction: Direction,
    pub isochronous: bool,
    /// Transfer buffer length of the original URB
    pub buffer_length: u32,
    /// Iso packet count of the original URB (0 for other transfer types)
    pub number_of_packets: u32,
}

impl RequestShape {
    /// Check a RET_SUBMIT block against the request it answers
    pub fn validate_reply(&self, ret: &RetSubmit) -> Result<()> {
        if self.direction == Direction::In && ret.actual_length > self.buffer_length {
            return Err(ProtocolError::InconsistentLength {
                field: "actual_length",
                value: ret.actual_length as u64,
                limit: self.buffer_length as u64,
            });
        }

        let packets = ret.number_of_packets.max(0) as u32;
        let expected = if self.isochronous {
            self.number_of_packets
        } else {
            0
        };
        if packets != expected {
            return Err(ProtocolError::InconsistentLength {
                field: "number_of_packets",
                value: packets as u64,
                limit: expected as u64,
            });
        }
        Ok(())
    }
}

/// Sizes of the payload that follows a header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PayloadLayout {
    pub data_len: usize,
    pub iso_packets: usize,
}

impl PayloadLayout {
    /// Total payload bytes
    pub fn len(&self) -> usize {
        self.data_len + self.iso_packets * ISO_PACKET_DESCRIPTOR_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total message bytes including the header
    pub fn message_len(&self) -> usize {
        HEADER_SIZE + self.len()
    }
}

/// Compute the payload layout following `header`
///
/// `shape` is required to frame a RET_SUBMIT that carries a payload.
/// Without it only an empty reply can be framed.
pub fn payload_layout(header: &UsbipHeader, shape: Option<&RequestShape>) -> Result<PayloadLayout> {
    match &header.body {
        HeaderBody::CmdSubmit(cmd) => Ok(PayloadLayout {
            data_len: if header.direction == Direction::Out {
                cmd.transfer_buffer_length as usize
            } else {
                0
            },
            iso_packets: cmd.number_of_packets.max(0) as usize,
        }),
        HeaderBody::RetSubmit(ret) => match shape {
            Some(shape) => Ok(PayloadLayout {
                data_len: if shape.direction == Direction::In {
                    ret.actual_length as usize
                } else {
                    0
                },
                iso_packets: if shape.isochronous {
                    ret.number_of_packets.max(0) as usize
                } else {
                    0
                },
            }),
            None if ret.actual_length == 0 && ret.number_of_packets <= 0 => {
                Ok(PayloadLayout::default())
            }
            None => Err(ProtocolError::InconsistentLength {
                field: "unmatched reply payload",
                value: ret.actual_length as u64,
                limit: 0,
            }),
        },
        HeaderBody::CmdUnlink(_) | HeaderBody::RetUnlink(_) => Ok(PayloadLayout::default()),
    }
}

/// A complete URB message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbipMessage {
    pub header: UsbipHeader,
    pub data: Vec<u8>,
    pub iso_packets: Vec<IsoPacketDescriptor>,
}

/// Encode a header with its payload
///
/// The payload sizes must agree with the header; a CMD_SUBMIT is checked
/// against its own fields, a RET_SUBMIT against `actual_length` and
/// `number_of_packets`.
pub fn encode_parts(
    header: &UsbipHeader,
    data: &[u8],
    iso_packets: &[IsoPacketDescriptor],
) -> Result<Vec<u8>> {
    let (expected_data, expected_iso) = match &header.body {
        HeaderBody::CmdSubmit(_) => {
            let layout = payload_layout(header, None)?;
            (layout.data_len, layout.iso_packets)
        }
        HeaderBody::RetSubmit(ret) => (
            if data.is_empty() { 0 } else { ret.actual_length as usize },
            if iso_packets.is_empty() {
                0
            } else {
                ret.number_of_packets.max(0) as usize
            },
        ),
        HeaderBody::CmdUnlink(_) | HeaderBody::RetUnlink(_) => (0, 0),
    };

    if data.len() != expected_data {
        return Err(ProtocolError::InconsistentLength {
            field: "payload",
            value: data.len() as u64,
            limit: expected_data as u64,
        });
    }
    if iso_packets.len() != expected_iso {
        return Err(ProtocolError::InconsistentLength {
            field: "iso descriptors",
            value: iso_packets.len() as u64,
            limit: expected_iso as u64,
        });
    }

    let mut buf =
        Vec::with_capacity(HEADER_SIZE + data.len() + iso_packets.len() * ISO_PACKET_DESCRIPTOR_SIZE);
    header.write_to(&mut buf)?;
    buf.extend_from_slice(data);
    for desc in iso_packets {
        desc.write_to(&mut buf)?;
    }
    Ok(buf)
}

/// Encode a complete message
pub fn encode_message(message: &UsbipMessage) -> Result<Vec<u8>> {
    encode_parts(&message.header, &message.data, &message.iso_packets)
}

/// Decode a complete message occupying exactly `bytes`
pub fn decode_message(bytes: &[u8], shape: Option<&RequestShape>) -> Result<UsbipMessage> {
    let header = UsbipHeader::from_bytes(bytes)?;
    let layout = payload_layout(&header, shape)?;
    let total = layout.message_len();

    if bytes.len() < total {
        return Err(ProtocolError::BufferTooSmall {
            needed: total,
            available: bytes.len(),
        });
    }
    if bytes.len() > total {
        return Err(ProtocolError::InconsistentLength {
            field: "message length",
            value: bytes.len() as u64,
            limit: total as u64,
        });
    }

    let data_end = HEADER_SIZE + layout.data_len;
    let data = bytes[HEADER_SIZE..data_end].to_vec();
    let iso_packets = decode_iso_descriptors(&bytes[data_end..], layout.iso_packets)?;

    Ok(UsbipMessage {
        header,
        data,
        iso_packets,
    })
}

/// Decode `count` iso packet descriptors from the front of `bytes`
pub fn decode_iso_descriptors(bytes: &[u8], count: usize) -> Result<Vec<IsoPacketDescriptor>> {
    let needed = count * ISO_PACKET_DESCRIPTOR_SIZE;
    if bytes.len() < needed {
        return Err(ProtocolError::BufferTooSmall {
            needed,
            available: bytes.len(),
        });
    }

    let mut cursor = Cursor::new(&bytes[..needed]);
    (0..count)
        .map(|_| IsoPacketDescriptor::read_from(&mut cursor))
        .collect()
}

/// Overwrite the seqnum of an encoded message in place
///
/// Sequence numbers are assigned when a message is handed to the
/// transport, after the rest of it has been encoded.
pub fn set_seqnum(message: &mut [u8], seqnum: u32) {
    message[4..8].copy_from_slice(&seqnum.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{CmdSubmit, CmdUnlink, RetUnlink};

    fn iso_shape() -> RequestShape {
        RequestShape {
            direction: Direction::In,
            isochronous: true,
            buffer_length: 384,
            number_of_packets: 2,
        }
    }

    #[test]
    fn test_bulk_out_roundtrip() {
        let message = UsbipMessage {
            header: UsbipHeader {
                seqnum: 5,
                devid: 0x10002,
                direction: Direction::Out,
                ep: 2,
                body: HeaderBody::CmdSubmit(CmdSubmit {
                    transfer_buffer_length: 4,
                    number_of_packets: -1,
                    ..CmdSubmit::default()
                }),
            },
            data: vec![1, 2, 3, 4],
            iso_packets: Vec::new(),
        };

        let bytes = encode_message(&message).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 4);
        let decoded = decode_message(&bytes, None).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(encode_message(&decoded).unwrap(), bytes);
    }

    #[test]
    fn test_iso_in_reply_roundtrip() {
        let message = UsbipMessage {
            header: UsbipHeader::new(
                0,
                Direction::Out,
                0,
                HeaderBody::RetSubmit(RetSubmit {
                    status: 0,
                    actual_length: 300,
                    start_frame: 10,
                    number_of_packets: 2,
                    error_count: 0,
                }),
            ),
            data: vec![0xAB; 300],
            iso_packets: vec![
                IsoPacketDescriptor {
                    offset: 0,
                    length: 192,
                    actual_length: 192,
                    status: 0,
                },
                IsoPacketDescriptor {
                    offset: 192,
                    length: 192,
                    actual_length: 108,
                    status: 0,
                },
            ],
        };

        let bytes = encode_message(&message).unwrap();
        let decoded = decode_message(&bytes, Some(&iso_shape())).unwrap();
        assert_eq!(decoded, message);
        assert!(iso_shape().validate_reply(&RetSubmit {
            actual_length: 300,
            number_of_packets: 2,
            ..RetSubmit::default()
        })
        .is_ok());
    }

    #[test]
    fn test_reply_without_shape() {
        let empty = UsbipHeader::new(0, Direction::Out, 0, HeaderBody::RetSubmit(RetSubmit::error(-32)));
        assert!(payload_layout(&empty, None).unwrap().is_empty());

        let with_data = UsbipHeader::new(
            0,
            Direction::Out,
            0,
            HeaderBody::RetSubmit(RetSubmit::success(8)),
        );
        assert!(payload_layout(&with_data, None).is_err());
    }

    #[test]
    fn test_validate_reply_rejects_overlong_data() {
        let shape = RequestShape {
            direction: Direction::In,
            isochronous: false,
            buffer_length: 8,
            number_of_packets: 0,
        };
        assert!(shape.validate_reply(&RetSubmit::success(8)).is_ok());
        assert!(matches!(
            shape.validate_reply(&RetSubmit::success(9)),
            Err(ProtocolError::InconsistentLength {
                field: "actual_length",
                ..
            })
        ));
    }

    #[test]
    fn test_truncated_message() {
        let message = UsbipMessage {
            header: UsbipHeader::new(
                1,
                Direction::Out,
                1,
                HeaderBody::CmdSubmit(CmdSubmit {
                    transfer_buffer_length: 16,
                    ..CmdSubmit::default()
                }),
            ),
            data: vec![0; 16],
            iso_packets: Vec::new(),
        };
        let bytes = encode_message(&message).unwrap();
        assert!(matches!(
            decode_message(&bytes[..bytes.len() - 1], None),
            Err(ProtocolError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_payload_mismatch_rejected() {
        let header = UsbipHeader::new(
            1,
            Direction::Out,
            1,
            HeaderBody::CmdSubmit(CmdSubmit {
                transfer_buffer_length: 16,
                ..CmdSubmit::default()
            }),
        );
        assert!(encode_parts(&header, &[0; 15], &[]).is_err());
    }

    #[test]
    fn test_unlink_messages_have_no_payload() {
        for body in [
            HeaderBody::CmdUnlink(CmdUnlink { unlink_seqnum: 3 }),
            HeaderBody::RetUnlink(RetUnlink { status: -104 }),
        ] {
            let header = UsbipHeader::new(1, Direction::Out, 0, body);
            assert_eq!(payload_layout(&header, None).unwrap().message_len(), HEADER_SIZE);
        }
    }

    #[test]
    fn test_set_seqnum() {
        let header = UsbipHeader::new(
            1,
            Direction::Out,
            0,
            HeaderBody::CmdUnlink(CmdUnlink { unlink_seqnum: 3 }),
        );
        let mut bytes = encode_parts(&header, &[], &[]).unwrap();
        set_seqnum(&mut bytes, 0x01020304);
        assert_eq!(UsbipHeader::from_bytes(&bytes).unwrap().seqnum, 0x01020304);
    }
}
