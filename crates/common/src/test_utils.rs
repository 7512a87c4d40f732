//! Test utilities for rust-usbip-vhci
//!
//! Provides a scripted USB/IP peer and fixtures for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_usb_device;
//!
//! let device = create_mock_usb_device("1-1", 2);
//! assert_eq!(device.devid(), 0x0001_0002);
//! ```

use crate::{Error, Result};
use protocol::op::{
    BUSID_SIZE, ImportReply, OP_REQ_DEVLIST, OP_REQ_IMPORT, encode_devlist_reply,
    encode_import_reply,
};
use protocol::{
    ExportedDevice, HEADER_SIZE, HeaderBody, ImportStatus, IsoPacketDescriptor, OpCommon,
    RetSubmit, RetUnlink, UsbDevice, UsbInterface, UsbSpeed, UsbipHeader, UsbipMessage,
    USBIP_VERSION, decode_message, encode_parts, errno, payload_layout,
};
use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock exported device record
pub fn create_mock_usb_device(busid: &str, devnum: u32) -> UsbDevice {
    UsbDevice {
        path: format!("/sys/devices/platform/mock/usb1/{busid}"),
        busid: busid.to_string(),
        busnum: 1,
        devnum,
        speed: UsbSpeed::High,
        id_vendor: 0x1234,
        id_product: 0x5678,
        bcd_device: 0x0100,
        device_class: 0,
        device_subclass: 0,
        device_protocol: 0,
        configuration_value: 1,
        num_configurations: 1,
        num_interfaces: 1,
    }
}

/// Create a mock exported device with one vendor-specific interface
pub fn create_mock_exported_device(busid: &str, devnum: u32) -> ExportedDevice {
    ExportedDevice {
        device: create_mock_usb_device(busid, devnum),
        interfaces: vec![UsbInterface {
            class: 0xFF,
            subclass: 0,
            protocol: 0,
        }],
    }
}

/// Create a mock USB descriptor response (GET_DESCRIPTOR Device)
///
/// Returns a standard 18-byte device descriptor
pub fn create_mock_device_descriptor() -> Vec<u8> {
    vec![
        0x12, // bLength
        0x01, // bDescriptorType (Device)
        0x00, 0x02, // bcdUSB (2.00)
        0x00, // bDeviceClass
        0x00, // bDeviceSubClass
        0x00, // bDeviceProtocol
        0x40, // bMaxPacketSize0 (64 bytes)
        0x34, 0x12, // idVendor (0x1234)
        0x78, 0x56, // idProduct (0x5678)
        0x00, 0x01, // bcdDevice (1.00)
        0x01, // iManufacturer
        0x02, // iProduct
        0x03, // iSerialNumber
        0x01, // bNumConfigurations
    ]
}

/// Create a mock USB configuration descriptor
///
/// One interface with two alternate settings: alt 0 has a bulk IN and a
/// bulk OUT endpoint, alt 1 adds an isochronous IN endpoint.
pub fn create_mock_config_descriptor() -> Vec<u8> {
    vec![
        // Configuration descriptor
        0x09, // bLength
        0x02, // bDescriptorType (Configuration)
        0x30, 0x00, // wTotalLength (48 bytes)
        0x01, // bNumInterfaces
        0x01, // bConfigurationValue
        0x00, // iConfiguration
        0x80, // bmAttributes (Bus-powered)
        0x32, // bMaxPower (100mA)
        // Interface 0, alt 0
        0x09, 0x04, 0x00, 0x00, 0x02, 0xFF, 0x00, 0x00, 0x00,
        // EP1 IN bulk, 512 bytes
        0x07, 0x05, 0x81, 0x02, 0x00, 0x02, 0x00,
        // EP2 OUT bulk, 512 bytes
        0x07, 0x05, 0x02, 0x02, 0x00, 0x02, 0x00,
        // Interface 0, alt 1
        0x09, 0x04, 0x00, 0x01, 0x01, 0xFF, 0x00, 0x00, 0x00,
        // EP3 IN isochronous, 192 bytes, every frame
        0x07, 0x05, 0x83, 0x01, 0xC0, 0x00, 0x01,
    ]
}

/// Create mock bulk transfer data of specified size
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

/// Create a mock control transfer setup packet
pub fn create_mock_setup_packet(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) -> [u8; 8] {
    let value = value.to_le_bytes();
    let index = index.to_le_bytes();
    let length = length.to_le_bytes();
    [
        request_type,
        request,
        value[0],
        value[1],
        index[0],
        index[1],
        length[0],
        length[1],
    ]
}

/// Timeout wrapper for async tests
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> std::result::Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// What the mock peer observed during one session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockSession {
    /// Bus id requested by OP_REQ_IMPORT, if any
    pub imported: Option<String>,
    /// Seqnums of every CMD_SUBMIT, in arrival order
    pub submits: Vec<u32>,
    /// `(seqnum, unlink_seqnum)` of every CMD_UNLINK, in arrival order
    pub unlinks: Vec<(u32, u32)>,
    /// OUT payloads received, in arrival order
    pub out_data: Vec<Vec<u8>>,
}

/// Scripted USB/IP exporting host
///
/// Answers one operation request (import or device list). After a
/// successful import it serves URBs until the connection closes:
///
/// - control IN GET_DESCRIPTOR returns the mock device/config descriptor
/// - other IN transfers return [`create_mock_bulk_data`] of the requested size
/// - OUT transfers complete with their full length
/// - isochronous IN transfers fill every packet completely
/// - submits to a held endpoint are never answered; unlinking one
///   replies RET_UNLINK with `-ECONNRESET`
#[derive(Debug, Clone)]
pub struct MockUsbipServer {
    devices: Vec<ExportedDevice>,
    refusal: Option<ImportStatus>,
    version: u16,
    held_endpoints: HashSet<u32>,
    late_reply_on_unlink: bool,
    disconnect_after: Option<usize>,
}

impl MockUsbipServer {
    pub fn new(devices: Vec<ExportedDevice>) -> Self {
        Self {
            devices,
            refusal: None,
            version: USBIP_VERSION,
            held_endpoints: HashSet::new(),
            late_reply_on_unlink: false,
            disconnect_after: None,
        }
    }

    /// Single mock device with bus id `1-1`
    pub fn single() -> Self {
        Self::new(vec![create_mock_exported_device("1-1", 2)])
    }

    /// Refuse every import with `status`
    pub fn refuse_import(mut self, status: ImportStatus) -> Self {
        self.refusal = Some(status);
        self
    }

    /// Reply with a different protocol version
    pub fn with_version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    /// Never answer submits to endpoint `ep` until they are unlinked
    pub fn hold_endpoint(mut self, ep: u32) -> Self {
        self.held_endpoints.insert(ep);
        self
    }

    /// Send the held RET_SUBMIT before the RET_UNLINK when unlinked
    pub fn reply_late_on_unlink(mut self) -> Self {
        self.late_reply_on_unlink = true;
        self
    }

    /// Close the connection after `count` submits
    pub fn disconnect_after(mut self, count: usize) -> Self {
        self.disconnect_after = Some(count);
        self
    }

    /// Serve one session over an in-memory stream
    pub fn spawn_duplex(self) -> (DuplexStream, JoinHandle<Result<MockSession>>) {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let handle = tokio::spawn(async move { self.serve(server).await });
        (client, handle)
    }

    /// Serve one session on a loopback TCP port
    pub async fn spawn_tcp(self) -> Result<(SocketAddr, JoinHandle<Result<MockSession>>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await?;
            debug!("Mock server accepted {}", peer);
            self.serve(stream).await
        });
        Ok((addr, handle))
    }

    /// Serve one session on `stream`
    pub async fn serve<S>(self, mut stream: S) -> Result<MockSession>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut session = MockSession::default();

        let mut raw = [0u8; OpCommon::SIZE];
        stream.read_exact(&mut raw).await?;
        let request = OpCommon::read_from(&mut &raw[..])?;

        match request.code {
            OP_REQ_DEVLIST => {
                let mut reply = encode_devlist_reply(&self.devices)?;
                reply[0..2].copy_from_slice(&self.version.to_be_bytes());
                stream.write_all(&reply).await?;
                return Ok(session);
            }
            OP_REQ_IMPORT => {}
            other => {
                return Err(Error::InvalidParameter(format!(
                    "unexpected op code {other:#06x}"
                )));
            }
        }

        let mut busid = [0u8; BUSID_SIZE];
        stream.read_exact(&mut busid).await?;
        let end = busid.iter().position(|&b| b == 0).unwrap_or(BUSID_SIZE);
        let busid = String::from_utf8_lossy(&busid[..end]).into_owned();
        session.imported = Some(busid.clone());

        let device = self
            .devices
            .iter()
            .find(|d| d.device.busid == busid)
            .map(|d| d.device.clone());
        let reply = match (self.refusal, device) {
            (Some(status), _) => ImportReply::Refused(status),
            (None, None) => ImportReply::Refused(ImportStatus::NoDevice),
            (None, Some(device)) => ImportReply::Imported(device),
        };
        let mut raw = encode_import_reply(&reply)?;
        raw[0..2].copy_from_slice(&self.version.to_be_bytes());
        stream.write_all(&raw).await?;

        if matches!(reply, ImportReply::Refused(_)) || self.version != USBIP_VERSION {
            return Ok(session);
        }

        self.serve_urbs(&mut stream, &mut session).await?;
        Ok(session)
    }

    async fn serve_urbs<S>(&self, stream: &mut S, session: &mut MockSession) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut held: Vec<UsbipMessage> = Vec::new();

        loop {
            let mut raw = vec![0u8; HEADER_SIZE];
            match stream.read_exact(&mut raw).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            let header = UsbipHeader::from_bytes(&raw)?;
            let layout = payload_layout(&header, None)?;
            raw.resize(layout.message_len(), 0);
            stream.read_exact(&mut raw[HEADER_SIZE..]).await?;
            let message = decode_message(&raw, None)?;
            trace!("Mock server got seqnum {} cmd {}", header.seqnum, header.command());

            match header.body {
                HeaderBody::CmdSubmit(_) => {
                    session.submits.push(header.seqnum);
                    if !message.data.is_empty() {
                        session.out_data.push(message.data.clone());
                    }

                    if self.held_endpoints.contains(&header.ep) {
                        held.push(message);
                    } else {
                        let reply = Self::complete(&message)?;
                        stream.write_all(&reply).await?;
                    }

                    if self.disconnect_after == Some(session.submits.len()) {
                        stream.shutdown().await?;
                        return Ok(());
                    }
                }
                HeaderBody::CmdUnlink(cmd) => {
                    session.unlinks.push((header.seqnum, cmd.unlink_seqnum));
                    let found = held
                        .iter()
                        .position(|m| m.header.seqnum == cmd.unlink_seqnum);
                    let status = match found {
                        Some(index) => {
                            let target = held.remove(index);
                            if self.late_reply_on_unlink {
                                stream.write_all(&Self::complete(&target)?).await?;
                            }
                            -errno::ECONNRESET
                        }
                        None => 0,
                    };
                    let reply = Self::reply_header(
                        header.seqnum,
                        header.devid,
                        HeaderBody::RetUnlink(RetUnlink { status }),
                    );
                    stream.write_all(&encode_parts(&reply, &[], &[])?).await?;
                }
                HeaderBody::RetSubmit(_) | HeaderBody::RetUnlink(_) => {
                    return Err(Error::InvalidParameter(
                        "reply received from importing host".to_string(),
                    ));
                }
            }
        }
    }

    /// Successful RET_SUBMIT for a CMD_SUBMIT
    fn complete(message: &UsbipMessage) -> Result<Vec<u8>> {
        let header = &message.header;
        let HeaderBody::CmdSubmit(cmd) = header.body else {
            return Err(Error::InvalidParameter("not a submit".to_string()));
        };
        let is_in = header.direction == protocol::Direction::In;
        let length = cmd.transfer_buffer_length as usize;

        if cmd.number_of_packets > 0 {
            let iso_packets: Vec<IsoPacketDescriptor> = header_iso(message);
            let total: u32 = iso_packets.iter().map(|p| p.length).sum();
            let ret = RetSubmit {
                status: 0,
                actual_length: total,
                start_frame: cmd.start_frame,
                number_of_packets: cmd.number_of_packets,
                error_count: 0,
            };
            let data = if is_in {
                create_mock_bulk_data(total as usize)
            } else {
                Vec::new()
            };
            let reply = Self::reply_header(header.seqnum, header.devid, HeaderBody::RetSubmit(ret));
            return Ok(encode_parts(&reply, &data, &iso_packets)?);
        }

        let data = if !is_in {
            Vec::new()
        } else if header.ep == 0 {
            let mut descriptor = match cmd.setup {
                [0x80, 0x06, _, 0x01, ..] => create_mock_device_descriptor(),
                [0x80, 0x06, _, 0x02, ..] => create_mock_config_descriptor(),
                _ => Vec::new(),
            };
            descriptor.truncate(length);
            descriptor
        } else {
            create_mock_bulk_data(length)
        };

        let actual_length = if is_in { data.len() } else { length };
        let reply = Self::reply_header(
            header.seqnum,
            header.devid,
            HeaderBody::RetSubmit(RetSubmit::success(actual_length as u32)),
        );
        Ok(encode_parts(&reply, &data, &[])?)
    }

    /// Peers zero direction and ep in replies
    fn reply_header(seqnum: u32, devid: u32, body: HeaderBody) -> UsbipHeader {
        let mut header = UsbipHeader::new(devid, protocol::Direction::Out, 0, body);
        header.seqnum = seqnum;
        header
    }
}

/// Iso descriptors of a submit, completed in full
fn header_iso(message: &UsbipMessage) -> Vec<IsoPacketDescriptor> {
    message
        .iso_packets
        .iter()
        .map(|p| IsoPacketDescriptor {
            offset: p.offset,
            length: p.length,
            actual_length: p.length,
            status: 0,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::op::{devlist_async, import_async};

    #[test]
    fn test_create_mock_usb_device() {
        let device = create_mock_usb_device("3-2", 7);

        assert_eq!(device.busid, "3-2");
        assert_eq!(device.devid(), (1 << 16) | 7);
        assert_eq!(device.speed, UsbSpeed::High);
    }

    #[test]
    fn test_create_mock_device_descriptor() {
        let desc = create_mock_device_descriptor();

        assert_eq!(desc.len(), 18);
        assert_eq!(desc[0], 0x12); // bLength
        assert_eq!(desc[1], 0x01); // bDescriptorType
    }

    #[test]
    fn test_create_mock_config_descriptor() {
        let desc = create_mock_config_descriptor();

        assert_eq!(desc.len(), 48);
        assert_eq!(u16::from_le_bytes([desc[2], desc[3]]) as usize, desc.len());
    }

    #[test]
    fn test_create_mock_setup_packet() {
        let setup = create_mock_setup_packet(0x80, 0x06, 0x0100, 0x0000, 0x0012);

        assert_eq!(setup[0], 0x80); // bmRequestType (Device-to-host, Standard, Device)
        assert_eq!(setup[1], 0x06); // bRequest (GET_DESCRIPTOR)
        assert_eq!(setup[3], 0x01); // wValue high (Descriptor type: Device)
        assert_eq!(setup[6], 0x12); // wLength low (18 bytes)
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mock_server_devlist() {
        let (mut client, handle) = MockUsbipServer::single().spawn_duplex();
        let devices = devlist_async(&mut client).await.unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device.busid, "1-1");
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_mock_server_refuses_unknown_busid() {
        let (mut client, handle) = MockUsbipServer::single().spawn_duplex();
        let reply = import_async(&mut client, "9-9").await.unwrap();

        assert_eq!(reply, ImportReply::Refused(ImportStatus::NoDevice));
        let session = handle.await.unwrap().unwrap();
        assert_eq!(session.imported.as_deref(), Some("9-9"));
    }
}
