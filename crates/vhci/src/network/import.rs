//! Attach-time handshake with an exporting host

use common::{Error, Result};
use protocol::op::{devlist_async, import_async};
use protocol::{ExportedDevice, ImportReply, UsbDevice};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Open a TCP connection to an exporting host
pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    debug!("Connecting to {}:{}", host, port);
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| Error::Transport(format!("connection to {}:{} timed out", host, port)))?
        .map_err(|e| Error::Transport(format!("cannot connect to {}:{}: {}", host, port, e)))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Import `busid`; the stream then carries URB traffic for it
pub async fn import_device<S>(stream: &mut S, busid: &str) -> Result<UsbDevice>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match import_async(stream, busid).await? {
        ImportReply::Imported(device) => {
            info!(
                "Imported {} ({:04x}:{:04x}, {:?} speed)",
                device.busid, device.id_vendor, device.id_product, device.speed
            );
            Ok(device)
        }
        ImportReply::Refused(status) => Err(Error::Import(status)),
    }
}

/// Ask the host which devices it exports
pub async fn list_devices<S>(stream: &mut S) -> Result<Vec<ExportedDevice>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Ok(devlist_async(stream).await?)
}
