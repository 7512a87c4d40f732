//! Protocol library for rust-usbip-vhci
//!
//! This crate defines the USB/IP wire format spoken between the virtual
//! host controller and a remote exporting host. It covers the 48-byte URB
//! headers, payload framing, iso packet descriptors and the attach-time
//! operation messages. All multi-byte fields are big-endian.
//!
//! # Example
//!
//! ```
//! use protocol::{CmdSubmit, Direction, HeaderBody, UsbipHeader};
//! use protocol::{decode_message, encode_parts, set_seqnum};
//!
//! let header = UsbipHeader::new(
//!     0x0001_0002,
//!     Direction::Out,
//!     2,
//!     HeaderBody::CmdSubmit(CmdSubmit {
//!         transfer_buffer_length: 4,
//!         number_of_packets: -1,
//!         ..Default::default()
//!     }),
//! );
//!
//! let mut bytes = encode_parts(&header, &[1, 2, 3, 4], &[]).unwrap();
//! set_seqnum(&mut bytes, 7);
//!
//! let decoded = decode_message(&bytes, None).unwrap();
//! assert_eq!(decoded.header.seqnum, 7);
//! assert_eq!(decoded.data, vec![1, 2, 3, 4]);
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod op;
pub mod types;
pub mod version;

pub use codec::{
    PayloadLayout, RequestShape, UsbipMessage, decode_iso_descriptors, decode_message,
    encode_message, encode_parts, payload_layout, set_seqnum,
};
pub use error::{ProtocolError, Result};
pub use messages::{
    CmdSubmit, CmdUnlink, HEADER_SIZE, HeaderBody, ISO_PACKET_DESCRIPTOR_SIZE,
    IsoPacketDescriptor, MAX_ISO_PACKETS, NON_ISO_PACKETS, RetSubmit, RetUnlink,
    USBIP_CMD_SUBMIT, USBIP_CMD_UNLINK, USBIP_RET_SUBMIT, USBIP_RET_UNLINK, UsbipHeader,
};
pub use op::{ExportedDevice, ImportReply, OpCommon, UsbDevice, UsbInterface};
pub use types::{Direction, ImportStatus, UrbStatus, UsbSpeed, errno, transfer_flags};
pub use version::{USBIP_VERSION, validate_version};
