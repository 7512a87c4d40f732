//! Controller event channel
//!
//! The host controller reports port changes to whoever drives it (the CLI,
//! a daemon). Removal can be triggered from a receive pump, so sending
//! never blocks: a full channel drops the event with a warning.

use async_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::warn;

/// Capacity of the event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why a device left its port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalReason {
    /// Explicit detach
    Detached,
    /// Peer closed the connection
    TransportClosed,
    /// Send or receive failed
    TransportError(String),
    /// The receive stream could not be framed
    StreamCorrupted(String),
    /// Controller shutdown
    Shutdown,
}

/// Port change notifications from the host controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VhciEvent {
    DeviceAttached {
        port: u8,
        busid: String,
        devid: u32,
    },
    DeviceRemoved {
        port: u8,
        reason: RemovalReason,
    },
}

/// Sending half, held by the controller
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<VhciEvent>,
}

impl EventSender {
    /// Publish an event without waiting
    pub fn publish(&self, event: VhciEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => warn!("Event channel full, dropping {:?}", event),
            // Nobody listening
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Receiving half, held by the controller's owner
#[derive(Debug, Clone)]
pub struct EventReceiver {
    rx: Receiver<VhciEvent>,
}

impl EventReceiver {
    /// Wait for the next event
    pub async fn recv(&self) -> crate::Result<VhciEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Take an event if one is queued
    pub fn try_recv(&self) -> Option<VhciEvent> {
        self.rx.try_recv().ok()
    }
}

/// Create the controller event channel
pub fn create_event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = bounded(EVENT_CHANNEL_CAPACITY);
    (EventSender { tx }, EventReceiver { rx })
}
