//! Per-device request registry
//!
//! Every in-flight relay is a [`Request`] stored in one arena keyed by
//! [`RequestId`]. Membership is tracked by index containers:
//!
//! - `pending`: FIFO of requests not yet handed to the transport
//! - the partial-send slot: the single request being transmitted
//! - `sent`: requests awaiting their reply, keyed by seqnum
//!
//! Removing a request from the arena is the one claim on it: whoever
//! removes it completes it. The table is always used under the owning
//! pipeline's lock and never does I/O.

use protocol::{RequestShape, set_seqnum};
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

use super::urb::{Urb, UrbCompletion};

/// Handle of a request within one device's registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    /// Handed to the transport, not fully consumed yet
    Partial,
    Sent,
}

/// Delivers the single terminal completion of a URB
///
/// Dropping an uncompleted completer completes the URB as cancelled, so a
/// request destroyed on any path still answers its submitter exactly once.
#[derive(Debug)]
pub(crate) struct Completer {
    urb: Option<Urb>,
    tx: Option<oneshot::Sender<UrbCompletion>>,
}

impl Completer {
    pub(crate) fn new(urb: Urb) -> (Self, oneshot::Receiver<UrbCompletion>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                urb: Some(urb),
                tx: Some(tx),
            },
            rx,
        )
    }

    /// Complete with the result of `finish`, which may fill the URB in place
    pub(crate) fn complete(mut self, finish: impl FnOnce(Urb) -> UrbCompletion) {
        if let (Some(urb), Some(tx)) = (self.urb.take(), self.tx.take()) {
            // The submitter may have stopped waiting
            let _ = tx.send(finish(urb));
        }
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if let (Some(urb), Some(tx)) = (self.urb.take(), self.tx.take()) {
            let _ = tx.send(UrbCompletion::cancelled(urb));
        }
    }
}

#[derive(Debug)]
pub(crate) enum RequestKind {
    Urb(Completer),
    /// Synthetic CMD_UNLINK aborting `target`
    Unlink { target: u32 },
}

#[derive(Debug)]
pub struct Request {
    id: RequestId,
    seqnum: u32,
    state: RequestState,
    shape: Option<RequestShape>,
    /// Encoded message; moved into the partial-send slot when taken
    wire: Vec<u8>,
    kind: RequestKind,
}

impl Request {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn seqnum(&self) -> u32 {
        self.seqnum
    }

    pub fn shape(&self) -> Option<RequestShape> {
        self.shape
    }

    pub fn is_unlink(&self) -> bool {
        matches!(self.kind, RequestKind::Unlink { .. })
    }

    /// Seqnum the peer knows this request by, if any of it was transmitted
    pub fn transmitted_seqnum(&self) -> Option<u32> {
        match self.state {
            RequestState::Pending => None,
            RequestState::Partial | RequestState::Sent => Some(self.seqnum),
        }
    }

    pub(crate) fn into_kind(self) -> RequestKind {
        self.kind
    }
}

/// The message currently being handed to the transport
#[derive(Debug)]
struct PartialSend {
    /// Cleared when the request is cancelled mid-transmission
    target: Option<RequestId>,
    data: Vec<u8>,
    offset: usize,
}

#[derive(Debug, Default)]
pub struct RequestTable {
    next_id: u64,
    next_seqnum: u32,
    requests: HashMap<RequestId, Request>,
    pending: VecDeque<RequestId>,
    sent: HashMap<u32, RequestId>,
    partial: Option<PartialSend>,
    /// Reply shapes of transmitted requests that were cancelled
    unlinked: HashMap<u32, RequestShape>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a new request behind every other pending one
    pub(crate) fn insert_pending(
        &mut self,
        shape: Option<RequestShape>,
        wire: Vec<u8>,
        kind: RequestKind,
    ) -> RequestId {
        self.next_id += 1;
        let id = RequestId(self.next_id);
        self.requests.insert(
            id,
            Request {
                id,
                seqnum: 0,
                state: RequestState::Pending,
                shape,
                wire,
                kind,
            },
        );
        self.pending.push_back(id);
        id
    }

    /// Pop the oldest pending request and make it the partial-send target
    ///
    /// Assigns the next seqnum and patches it into the encoded message.
    /// Returns `None` while another request is mid-transmission.
    pub fn take_next_pending(&mut self) -> Option<RequestId> {
        if self.partial.is_some() {
            return None;
        }

        let id = self.pending.pop_front()?;
        let seqnum = self.allocate_seqnum();
        let request = self.requests.get_mut(&id)?;
        request.seqnum = seqnum;
        request.state = RequestState::Partial;

        let mut data = std::mem::take(&mut request.wire);
        set_seqnum(&mut data, seqnum);
        self.partial = Some(PartialSend {
            target: Some(id),
            data,
            offset: 0,
        });
        Some(id)
    }

    /// Take the untransmitted bytes of the current (or next) message
    ///
    /// The caller copies outside the lock and returns the bytes with
    /// [`checkin_send`](Self::checkin_send).
    pub fn checkout_send(&mut self) -> Option<(Vec<u8>, usize)> {
        if self.partial.is_none() {
            self.take_next_pending()?;
        }
        let partial = self.partial.as_mut()?;
        Some((std::mem::take(&mut partial.data), partial.offset))
    }

    /// Return checked-out bytes; `offset` is how far transmission got
    ///
    /// A fully transmitted request moves to `sent`.
    pub fn checkin_send(&mut self, data: Vec<u8>, offset: usize) {
        // Drained by teardown while the bytes were checked out
        let Some(partial) = self.partial.as_mut() else {
            return;
        };

        if offset < data.len() {
            partial.data = data;
            partial.offset = offset;
            return;
        }

        if let Some(id) = partial.target {
            if let Some(request) = self.requests.get_mut(&id) {
                request.state = RequestState::Sent;
                self.sent.insert(request.seqnum, id);
            }
        }
        self.partial = None;
    }

    /// Remove the request awaiting the reply `seqnum`
    pub fn find_and_remove_sent(&mut self, seqnum: u32) -> Option<Request> {
        let id = self.sent.remove(&seqnum)?;
        self.requests.remove(&id)
    }

    /// Remove a request wherever it is
    ///
    /// A request removed mid-transmission leaves its remaining bytes in
    /// the partial-send slot so the stream stays framed.
    pub fn remove(&mut self, id: RequestId) -> Option<Request> {
        let request = self.requests.remove(&id)?;
        match request.state {
            RequestState::Pending => {
                if let Some(index) = self.pending.iter().position(|&p| p == id) {
                    self.pending.remove(index);
                }
            }
            RequestState::Partial => {
                if let Some(partial) = self.partial.as_mut() {
                    if partial.target == Some(id) {
                        partial.target = None;
                    }
                }
            }
            RequestState::Sent => {
                self.sent.remove(&request.seqnum);
            }
        }
        Some(request)
    }

    /// Shape of the reply expected for `seqnum`
    pub fn shape_for_reply(&self, seqnum: u32) -> Option<RequestShape> {
        self.sent
            .get(&seqnum)
            .and_then(|id| self.requests.get(id))
            .and_then(|request| request.shape)
            .or_else(|| self.unlinked.get(&seqnum).copied())
    }

    /// Remember how to frame a late reply to a cancelled request
    pub fn record_unlinked(&mut self, seqnum: u32, shape: RequestShape) {
        self.unlinked.insert(seqnum, shape);
    }

    pub fn take_unlinked(&mut self, seqnum: u32) -> Option<RequestShape> {
        self.unlinked.remove(&seqnum)
    }

    /// Empty the table, returning every request
    pub fn drain(&mut self) -> Vec<Request> {
        self.pending.clear();
        self.sent.clear();
        self.partial = None;
        self.unlinked.clear();

        let mut requests: Vec<Request> = self.requests.drain().map(|(_, r)| r).collect();
        requests.sort_by_key(|r| r.id);
        requests
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn sent_len(&self) -> usize {
        self.sent.len()
    }

    pub fn has_partial(&self) -> bool {
        self.partial.is_some()
    }

    pub fn unlinked_len(&self) -> usize {
        self.unlinked.len()
    }

    pub fn state_of(&self, id: RequestId) -> Option<RequestState> {
        self.requests.get(&id).map(|r| r.state)
    }

    fn allocate_seqnum(&mut self) -> u32 {
        // 0 marks "never transmitted" in CMD_UNLINK
        self.next_seqnum = self.next_seqnum.wrapping_add(1).max(1);
        self.next_seqnum
    }
}
