//! Transport pumps for one attached device
//!
//! The transmit task drains the pipeline into the socket; the receive task
//! feeds socket reads back into it. Either task ending abnormally reports
//! a surprise removal to the device, which closes the connection.

use bytes::BytesMut;
use common::{Error, RemovalReason};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::virtual_usb::{UrbPipeline, VirtualDevice};

#[derive(Debug)]
pub struct Connection {
    tx_task: JoinHandle<()>,
    rx_task: JoinHandle<()>,
}

impl Connection {
    /// Split `stream` and start both pumps
    pub fn spawn<S>(
        stream: S,
        device: Weak<VirtualDevice>,
        pipeline: Arc<UrbPipeline>,
        buffer_size: usize,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);

        let tx_task = tokio::spawn(transmit(
            writer,
            pipeline.clone(),
            device.clone(),
            buffer_size,
        ));
        let rx_task = tokio::spawn(receive(reader, pipeline, device, buffer_size));

        Self { tx_task, rx_task }
    }

    pub fn is_finished(&self) -> bool {
        self.tx_task.is_finished() && self.rx_task.is_finished()
    }

    /// Stop both pumps; the stream closes once both halves are dropped
    pub fn close(self) {
        self.tx_task.abort();
        self.rx_task.abort();
    }
}

fn report(device: &Weak<VirtualDevice>, reason: RemovalReason) {
    if let Some(device) = device.upgrade() {
        device.surprise_removed(reason);
    }
}

async fn transmit<W>(
    mut writer: W,
    pipeline: Arc<UrbPipeline>,
    device: Weak<VirtualDevice>,
    buffer_size: usize,
) where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = match pipeline.read_next(&mut buf).await {
            Ok(n) => n,
            Err(Error::NotPresent) => break,
            Err(e) => {
                error!("Transmit pump stopped: {}", e);
                break;
            }
        };

        trace!("Sending {} bytes to device {:#010x}", n, pipeline.devid());
        if let Err(e) = writer.write_all(&buf[..n]).await {
            warn!("Send to device {:#010x} failed: {}", pipeline.devid(), e);
            report(&device, RemovalReason::TransportError(e.to_string()));
            return;
        }
    }

    debug!("Transmit pump for device {:#010x} finished", pipeline.devid());
    let _ = writer.shutdown().await;
}

async fn receive<R>(
    mut reader: R,
    pipeline: Arc<UrbPipeline>,
    device: Weak<VirtualDevice>,
    buffer_size: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(buffer_size);
    let reason = loop {
        buf.reserve(buffer_size);
        match reader.read_buf(&mut buf).await {
            Ok(0) => break RemovalReason::TransportClosed,
            Ok(n) => {
                trace!("Received {} bytes from device {:#010x}", n, pipeline.devid());
                match pipeline.on_receive(buf.split().freeze()) {
                    Ok(()) => {}
                    Err(Error::NotPresent) => return,
                    Err(e) => {
                        error!(
                            "Cannot frame stream from device {:#010x}: {}",
                            pipeline.devid(),
                            e
                        );
                        break RemovalReason::StreamCorrupted(e.to_string());
                    }
                }
            }
            Err(e) => break RemovalReason::TransportError(e.to_string()),
        }
    };

    debug!(
        "Receive pump for device {:#010x} finished: {:?}",
        pipeline.devid(),
        reason
    );
    report(&device, reason);
}
