//! URB relay pipeline for one attached device
//!
//! Submitters queue encoded CMD_SUBMITs in the [`RequestTable`]; a single
//! reader drains them into the transport with [`UrbPipeline::read_next`].
//! Received bytes go through [`UrbPipeline::on_receive`], which frames
//! replies and completes the matching URBs.
//!
//! Lock order: `rx` before `state`. Neither is held across I/O or while
//! waiting.

use bytes::Bytes;
use common::{Error, Result};
use protocol::{
    CmdUnlink, Direction, HEADER_SIZE, HeaderBody, ISO_PACKET_DESCRIPTOR_SIZE, PayloadLayout,
    ProtocolError, RetSubmit, RetUnlink, UrbStatus, UsbipHeader, decode_iso_descriptors,
    encode_parts, payload_layout,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{Notify, oneshot};
use tracing::{debug, trace, warn};

use super::request::{Completer, RequestId, RequestKind, RequestTable};
use super::rx_buffer::ReceiveBuffer;
use super::urb::{Urb, UrbCompletion};

#[derive(Debug, Default)]
struct PipelineState {
    table: RequestTable,
    removed: bool,
    // Set while the reader copies checked-out bytes
    reading: bool,
}

#[derive(Debug)]
pub struct UrbPipeline {
    devid: u32,
    max_outstanding: usize,
    state: Mutex<PipelineState>,
    rx: Mutex<ReceiveBuffer>,
    tx_ready: Notify,
}

impl UrbPipeline {
    pub fn new(devid: u32, max_outstanding: usize) -> Arc<Self> {
        Arc::new(Self {
            devid,
            max_outstanding,
            state: Mutex::new(PipelineState::default()),
            rx: Mutex::new(ReceiveBuffer::new()),
            tx_ready: Notify::new(),
        })
    }

    pub fn devid(&self) -> u32 {
        self.devid
    }

    fn state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rx(&self) -> MutexGuard<'_, ReceiveBuffer> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a URB for relay
    ///
    /// The returned handle resolves exactly once, with the peer's reply or
    /// as cancelled.
    pub fn submit(self: &Arc<Self>, urb: Urb) -> Result<UrbHandle> {
        urb.validate()?;
        let shape = urb.shape();
        let wire = urb.encode_submit(self.devid)?;
        let endpoint = urb.endpoint;
        let (completer, completion) = Completer::new(urb);

        let id = {
            let mut state = self.state();
            if state.removed {
                return Err(Error::NotPresent);
            }
            if state.table.len() >= self.max_outstanding {
                return Err(Error::InsufficientResources(format!(
                    "{} requests outstanding",
                    state.table.len()
                )));
            }
            state
                .table
                .insert_pending(Some(shape), wire, RequestKind::Urb(completer))
        };

        trace!(
            "Queued URB {} for endpoint {:#04x} on device {:#010x}",
            id, endpoint, self.devid
        );
        self.tx_ready.notify_one();

        Ok(UrbHandle {
            id,
            completion,
            token: CancelToken {
                pipeline: Arc::downgrade(self),
                id,
            },
        })
    }

    /// Copy the next outgoing bytes into `buf` without waiting
    ///
    /// Returns `Ok(None)` when nothing is queued. At most one message is
    /// copied per call; a message larger than `buf` continues on the next
    /// call. A second reader racing the first gets
    /// [`Error::InvalidParameter`].
    pub fn try_read_next(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        if buf.is_empty() {
            return Err(Error::InvalidParameter("empty read buffer".into()));
        }

        let (data, offset) = {
            let mut state = self.state();
            if state.removed {
                return Err(Error::NotPresent);
            }
            if state.reading {
                return Err(Error::InvalidParameter(
                    "pipeline already has an active reader".into(),
                ));
            }
            match state.table.checkout_send() {
                Some(checked_out) => {
                    state.reading = true;
                    checked_out
                }
                None => return Ok(None),
            }
        };

        let n = buf.len().min(data.len().saturating_sub(offset));
        buf[..n].copy_from_slice(&data[offset..offset + n]);

        let mut state = self.state();
        state.reading = false;
        state.table.checkin_send(data, offset + n);
        Ok(Some(n))
    }

    /// Wait for outgoing bytes and copy them into `buf`
    ///
    /// Only one reader may drive a pipeline. Fails with
    /// [`Error::NotPresent`] once the device is removed.
    pub async fn read_next(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if let Some(n) = self.try_read_next(buf)? {
                return Ok(n);
            }
            self.tx_ready.notified().await;
        }
    }

    /// Feed received bytes and complete every reply they finish
    ///
    /// An error means the stream can no longer be framed and the device
    /// must be torn down.
    pub fn on_receive(&self, chunk: Bytes) -> Result<()> {
        let mut rx = self.rx();
        if self.state().removed {
            rx.clear();
            return Err(Error::NotPresent);
        }
        rx.append(chunk);
        while self.process_next(&mut rx)? {}
        Ok(())
    }

    /// Frame and dispatch one message; false if it is not complete yet
    fn process_next(&self, rx: &mut ReceiveBuffer) -> Result<bool> {
        if rx.size() < HEADER_SIZE {
            return Ok(false);
        }

        let mut raw = [0u8; HEADER_SIZE];
        rx.copy_to(&mut raw, 0)?;
        let header = UsbipHeader::from_bytes(&raw)?;

        let shape = match header.body {
            HeaderBody::RetSubmit(_) => self.state().table.shape_for_reply(header.seqnum),
            HeaderBody::RetUnlink(_) => None,
            HeaderBody::CmdSubmit(_) | HeaderBody::CmdUnlink(_) => {
                return Err(ProtocolError::UnknownCommand(header.command()).into());
            }
        };
        // Framing trusts the peer's lengths only once they fit the request
        if let (HeaderBody::RetSubmit(ret), Some(shape)) = (&header.body, shape.as_ref()) {
            if let Err(e) = shape.validate_reply(ret) {
                warn!("Reply for seqnum {} does not fit its request: {}", header.seqnum, e);
                return Err(e.into());
            }
        }
        let layout = payload_layout(&header, shape.as_ref())?;
        let total = layout.message_len();
        if rx.size() < total {
            return Ok(false);
        }

        match header.body {
            HeaderBody::RetSubmit(ret) => self.complete_submit(rx, header.seqnum, &ret, &layout),
            HeaderBody::RetUnlink(ret) => self.complete_unlink(header.seqnum, &ret),
            HeaderBody::CmdSubmit(_) | HeaderBody::CmdUnlink(_) => {}
        }

        rx.release(total)?;
        Ok(true)
    }

    fn complete_submit(
        &self,
        rx: &ReceiveBuffer,
        seqnum: u32,
        ret: &RetSubmit,
        layout: &PayloadLayout,
    ) {
        let request = {
            let mut state = self.state();
            match state.table.find_and_remove_sent(seqnum) {
                Some(request) => request,
                None => {
                    if state.table.take_unlinked(seqnum).is_some() {
                        debug!("Discarding late reply for unlinked seqnum {}", seqnum);
                    } else {
                        debug!("Discarding reply for unknown seqnum {}", seqnum);
                    }
                    return;
                }
            }
        };

        let completer = match request.into_kind() {
            RequestKind::Urb(completer) => completer,
            RequestKind::Unlink { target } => {
                warn!(
                    "RET_SUBMIT answers unlink of seqnum {} (seqnum {})",
                    target, seqnum
                );
                return;
            }
        };

        completer.complete(|mut urb| match fill_urb(&mut urb, rx, layout) {
            Ok(()) => UrbCompletion {
                urb,
                status: UrbStatus::from_errno(ret.status),
                actual_length: ret.actual_length,
                start_frame: ret.start_frame,
                error_count: ret.error_count,
            },
            Err(e) => {
                warn!("Cannot unpack reply for seqnum {}: {}", seqnum, e);
                UrbCompletion::failed(urb, UrbStatus::Protocol)
            }
        });
        trace!("Completed seqnum {} with status {}", seqnum, ret.status);
    }

    fn complete_unlink(&self, seqnum: u32, ret: &RetUnlink) {
        let kind = {
            let mut state = self.state();
            let Some(request) = state.table.find_and_remove_sent(seqnum) else {
                debug!("Discarding RET_UNLINK for unknown seqnum {}", seqnum);
                return;
            };
            let kind = request.into_kind();
            if let RequestKind::Unlink { target } = kind {
                // No RET_SUBMIT follows the RET_UNLINK of its target
                state.table.take_unlinked(target);
                debug!(
                    "Unlink of seqnum {} acknowledged with status {}",
                    target, ret.status
                );
                return;
            }
            kind
        };
        warn!("RET_UNLINK answers URB seqnum {}", seqnum);
        drop(kind);
    }

    /// Abort a request; false if it already completed
    ///
    /// A request the peer has seen is unlinked by seqnum; one still queued
    /// is dropped before transmission and an unlink of seqnum 0 is sent in
    /// its place. The URB completes as cancelled either way.
    pub fn cancel(&self, id: RequestId) -> bool {
        let (request, removed) = {
            let mut state = self.state();
            let Some(request) = state.table.remove(id) else {
                return false;
            };
            if let (Some(seqnum), Some(shape)) = (request.transmitted_seqnum(), request.shape()) {
                state.table.record_unlinked(seqnum, shape);
            }
            (request, state.removed)
        };

        let target = request.transmitted_seqnum().unwrap_or(0);
        debug!("Cancelling URB {} (seqnum {})", id, target);
        if !removed {
            if let Err(e) = self.queue_unlink(target) {
                warn!("Failed to queue unlink of seqnum {}: {}", target, e);
            }
        }

        drop(request);
        true
    }

    fn queue_unlink(&self, target: u32) -> Result<()> {
        let header = UsbipHeader::new(
            self.devid,
            Direction::Out,
            0,
            HeaderBody::CmdUnlink(CmdUnlink {
                unlink_seqnum: target,
            }),
        );
        let wire = encode_parts(&header, &[], &[])?;

        {
            let mut state = self.state();
            if state.removed {
                return Ok(());
            }
            state
                .table
                .insert_pending(None, wire, RequestKind::Unlink { target });
        }
        self.tx_ready.notify_one();
        Ok(())
    }

    /// Mark the device removed and cancel everything outstanding
    ///
    /// Returns the number of URBs cancelled. Later calls do nothing.
    pub fn shutdown(&self) -> usize {
        let requests = {
            let mut state = self.state();
            if state.removed {
                return 0;
            }
            state.removed = true;
            state.table.drain()
        };
        self.tx_ready.notify_one();

        let cancelled = requests.iter().filter(|r| !r.is_unlink()).count();
        drop(requests);
        self.rx().clear();

        debug!(
            "Pipeline for device {:#010x} shut down, {} URBs cancelled",
            self.devid, cancelled
        );
        cancelled
    }

    pub fn is_removed(&self) -> bool {
        self.state().removed
    }

    /// Requests not yet completed, unlinks included
    pub fn outstanding(&self) -> usize {
        self.state().table.len()
    }

    pub fn pending_len(&self) -> usize {
        self.state().table.pending_len()
    }

    pub fn sent_len(&self) -> usize {
        self.state().table.sent_len()
    }
}

/// Copy a reply's payload into the URB it answers
fn fill_urb(urb: &mut Urb, rx: &ReceiveBuffer, layout: &PayloadLayout) -> Result<()> {
    if layout.iso_packets == 0 {
        if layout.data_len > 0 {
            rx.copy_to(&mut urb.buffer[..layout.data_len], HEADER_SIZE)?;
        }
        return Ok(());
    }

    let mut raw = vec![0u8; layout.iso_packets * ISO_PACKET_DESCRIPTOR_SIZE];
    rx.copy_to(&mut raw, HEADER_SIZE + layout.data_len)?;
    let descriptors = decode_iso_descriptors(&raw, layout.iso_packets)?;

    // IN data arrives packed: each packet's actual bytes, back to back
    if urb.direction == Direction::In {
        let mut consumed = 0usize;
        for (packet, desc) in urb.iso_packets.iter().zip(&descriptors) {
            let len = desc.actual_length as usize;
            if len > packet.length as usize || consumed + len > layout.data_len {
                return Err(ProtocolError::InconsistentLength {
                    field: "iso actual_length",
                    value: desc.actual_length as u64,
                    limit: packet.length as u64,
                }
                .into());
            }
            let start = packet.offset as usize;
            rx.copy_to(&mut urb.buffer[start..start + len], HEADER_SIZE + consumed)?;
            consumed += len;
        }
        if consumed != layout.data_len {
            return Err(ProtocolError::InconsistentLength {
                field: "iso payload",
                value: layout.data_len as u64,
                limit: consumed as u64,
            }
            .into());
        }
    }

    for (packet, desc) in urb.iso_packets.iter_mut().zip(&descriptors) {
        packet.actual_length = desc.actual_length;
        packet.status = UrbStatus::from_errno(desc.status);
    }
    Ok(())
}

/// Aborts one request; usable from any task
#[derive(Debug, Clone)]
pub struct CancelToken {
    pipeline: Weak<UrbPipeline>,
    id: RequestId,
}

impl CancelToken {
    /// Cancel the request; false if it already completed
    pub fn cancel(&self) -> bool {
        self.pipeline
            .upgrade()
            .is_some_and(|pipeline| pipeline.cancel(self.id))
    }
}

/// A submitted URB awaiting completion
#[derive(Debug)]
pub struct UrbHandle {
    id: RequestId,
    completion: oneshot::Receiver<UrbCompletion>,
    token: CancelToken,
}

impl UrbHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn cancel(&self) -> bool {
        self.token.cancel()
    }

    /// Wait for the URB to complete
    pub async fn completion(self) -> Result<UrbCompletion> {
        self.completion
            .await
            .map_err(|_| Error::Channel("completion sender dropped".into()))
    }

    /// The completion, if it has been delivered
    pub fn try_completion(&mut self) -> Option<UrbCompletion> {
        self.completion.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{IsoPacketDescriptor, UsbipMessage, decode_message};

    const DEVID: u32 = 0x0001_0002;

    fn drain_one(pipeline: &UrbPipeline) -> Option<UsbipMessage> {
        let mut buf = vec![0u8; 65536];
        let n = pipeline.try_read_next(&mut buf).unwrap()?;
        Some(decode_message(&buf[..n], None).unwrap())
    }

    fn reply(seqnum: u32, ret: RetSubmit, data: &[u8], iso: &[IsoPacketDescriptor]) -> Bytes {
        let header = UsbipHeader {
            seqnum,
            ..UsbipHeader::new(DEVID, Direction::Out, 0, HeaderBody::RetSubmit(ret))
        };
        Bytes::from(encode_parts(&header, data, iso).unwrap())
    }

    fn unlink_reply(seqnum: u32, status: i32) -> Bytes {
        let header = UsbipHeader {
            seqnum,
            ..UsbipHeader::new(
                DEVID,
                Direction::Out,
                0,
                HeaderBody::RetUnlink(RetUnlink { status }),
            )
        };
        Bytes::from(encode_parts(&header, &[], &[]).unwrap())
    }

    #[test]
    fn test_bulk_in_round_trip() {
        let pipeline = UrbPipeline::new(DEVID, 16);
        let mut handle = pipeline.submit(Urb::bulk_in(1, 8)).unwrap();

        let cmd = drain_one(&pipeline).unwrap();
        assert_eq!(cmd.header.seqnum, 1);
        assert_eq!(cmd.header.devid, DEVID);
        assert_eq!(pipeline.sent_len(), 1);

        pipeline
            .on_receive(reply(1, RetSubmit::success(4), &[1, 2, 3, 4], &[]))
            .unwrap();

        let completion = handle.try_completion().unwrap();
        assert!(completion.status.is_success());
        assert_eq!(completion.data(), &[1, 2, 3, 4]);
        assert_eq!(pipeline.outstanding(), 0);
    }

    #[test]
    fn test_reply_split_across_chunks() {
        let pipeline = UrbPipeline::new(DEVID, 16);
        let mut handle = pipeline.submit(Urb::bulk_in(1, 8)).unwrap();
        drain_one(&pipeline).unwrap();

        let bytes = reply(1, RetSubmit::success(8), &[9; 8], &[]);
        for chunk in bytes.chunks(5) {
            assert!(handle.try_completion().is_none());
            pipeline.on_receive(Bytes::copy_from_slice(chunk)).unwrap();
        }
        assert_eq!(handle.try_completion().unwrap().data(), &[9; 8]);
    }

    #[test]
    fn test_iso_in_unpacks_to_packet_offsets() {
        let pipeline = UrbPipeline::new(DEVID, 16);
        let mut handle = pipeline.submit(Urb::iso_in(0x83, &[4, 4, 4], 1)).unwrap();
        drain_one(&pipeline).unwrap();

        let descriptors = [
            IsoPacketDescriptor { offset: 0, length: 4, actual_length: 2, status: 0 },
            IsoPacketDescriptor { offset: 4, length: 4, actual_length: 0, status: -18 },
            IsoPacketDescriptor { offset: 8, length: 4, actual_length: 3, status: 0 },
        ];
        let ret = RetSubmit {
            number_of_packets: 3,
            error_count: 1,
            ..RetSubmit::success(5)
        };
        pipeline
            .on_receive(reply(1, ret, &[1, 2, 7, 8, 9], &descriptors))
            .unwrap();

        let completion = handle.try_completion().unwrap();
        assert_eq!(completion.error_count, 1);
        assert_eq!(&completion.urb.buffer[..4], &[1, 2, 0, 0]);
        assert_eq!(&completion.urb.buffer[8..11], &[7, 8, 9]);
        assert_eq!(completion.urb.iso_packets[1].status, UrbStatus::IsoPartial);
        assert_eq!(completion.urb.iso_packets[2].actual_length, 3);
    }

    #[test]
    fn test_oversized_reply_is_rejected_at_header() {
        let pipeline = UrbPipeline::new(DEVID, 16);
        let mut handle = pipeline.submit(Urb::bulk_in(1, 8)).unwrap();
        drain_one(&pipeline).unwrap();

        // Only the header: the claimed 64 MiB payload must never be awaited
        let header = UsbipHeader {
            seqnum: 1,
            ..UsbipHeader::new(
                DEVID,
                Direction::Out,
                0,
                HeaderBody::RetSubmit(RetSubmit::success(64 << 20)),
            )
        };
        let raw = header.to_bytes().unwrap();
        let err = pipeline.on_receive(Bytes::copy_from_slice(&raw)).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::InconsistentLength {
                field: "actual_length",
                ..
            })
        ));
        assert!(handle.try_completion().is_none());

        assert_eq!(pipeline.shutdown(), 1);
        assert_eq!(handle.try_completion().unwrap().status, UrbStatus::Cancelled);
    }

    #[test]
    fn test_iso_reply_with_wrong_packet_count_is_rejected() {
        let pipeline = UrbPipeline::new(DEVID, 16);
        pipeline.submit(Urb::iso_in(0x83, &[4, 4], 1)).unwrap();
        drain_one(&pipeline).unwrap();

        let ret = RetSubmit {
            number_of_packets: 5,
            ..RetSubmit::success(0)
        };
        let header = UsbipHeader {
            seqnum: 1,
            ..UsbipHeader::new(DEVID, Direction::Out, 0, HeaderBody::RetSubmit(ret))
        };
        let raw = header.to_bytes().unwrap();
        assert!(pipeline.on_receive(Bytes::copy_from_slice(&raw)).is_err());
    }

    #[test]
    fn test_command_from_peer_is_corruption() {
        let pipeline = UrbPipeline::new(DEVID, 16);
        let urb = Urb::bulk_out(2, vec![0; 4]);
        let bytes = urb.encode_submit(DEVID).unwrap();
        assert!(pipeline.on_receive(Bytes::from(bytes)).is_err());
    }

    #[test]
    fn test_unknown_reply_with_payload_is_corruption() {
        let pipeline = UrbPipeline::new(DEVID, 16);
        let bytes = reply(42, RetSubmit::success(3), &[1, 2, 3], &[]);
        assert!(pipeline.on_receive(bytes).is_err());
    }

    #[test]
    fn test_cancel_pending_sends_unlink_zero() {
        let pipeline = UrbPipeline::new(DEVID, 16);
        let mut handle = pipeline.submit(Urb::bulk_in(1, 8)).unwrap();

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert_eq!(handle.try_completion().unwrap().status, UrbStatus::Cancelled);

        let unlink = drain_one(&pipeline).unwrap();
        match unlink.header.body {
            HeaderBody::CmdUnlink(cmd) => assert_eq!(cmd.unlink_seqnum, 0),
            other => panic!("expected CMD_UNLINK, got {:?}", other),
        }
        assert!(drain_one(&pipeline).is_none());
    }

    #[test]
    fn test_late_reply_after_cancel_is_framed() {
        let pipeline = UrbPipeline::new(DEVID, 16);
        let mut first = pipeline.submit(Urb::bulk_in(1, 8)).unwrap();
        let mut second = pipeline.submit(Urb::bulk_in(1, 8)).unwrap();
        drain_one(&pipeline).unwrap();
        drain_one(&pipeline).unwrap();

        assert!(first.cancel());
        let unlink = drain_one(&pipeline).unwrap();
        assert_eq!(unlink.header.seqnum, 3);

        // Late RET_SUBMIT for seqnum 1 with data, followed by the reply for 2
        let mut stream = reply(1, RetSubmit::success(8), &[0xAA; 8], &[]).to_vec();
        stream.extend_from_slice(&reply(2, RetSubmit::success(2), &[5, 6], &[]));
        stream.extend_from_slice(&unlink_reply(3, 0));
        pipeline.on_receive(Bytes::from(stream)).unwrap();

        assert_eq!(first.try_completion().unwrap().status, UrbStatus::Cancelled);
        assert_eq!(second.try_completion().unwrap().data(), &[5, 6]);
        assert_eq!(pipeline.outstanding(), 0);
        assert_eq!(pipeline.state().table.unlinked_len(), 0);
    }

    #[test]
    fn test_outstanding_limit() {
        let pipeline = UrbPipeline::new(DEVID, 2);
        let _a = pipeline.submit(Urb::bulk_in(1, 8)).unwrap();
        let _b = pipeline.submit(Urb::bulk_in(1, 8)).unwrap();
        assert!(matches!(
            pipeline.submit(Urb::bulk_in(1, 8)),
            Err(Error::InsufficientResources(_))
        ));
    }

    #[test]
    fn test_shutdown_cancels_everything() {
        let pipeline = UrbPipeline::new(DEVID, 16);
        let mut sent = pipeline.submit(Urb::bulk_in(1, 8)).unwrap();
        drain_one(&pipeline).unwrap();
        let mut queued = pipeline.submit(Urb::bulk_in(1, 8)).unwrap();

        assert_eq!(pipeline.shutdown(), 2);
        assert_eq!(pipeline.shutdown(), 0);

        assert_eq!(sent.try_completion().unwrap().status, UrbStatus::Cancelled);
        assert_eq!(queued.try_completion().unwrap().status, UrbStatus::Cancelled);
        assert!(matches!(
            pipeline.submit(Urb::bulk_in(1, 8)),
            Err(Error::NotPresent)
        ));
        let mut buf = [0u8; 64];
        assert!(matches!(pipeline.try_read_next(&mut buf), Err(Error::NotPresent)));
        assert!(!sent.cancel());
    }

    #[test]
    fn test_small_reads_split_message() {
        let pipeline = UrbPipeline::new(DEVID, 16);
        let _handle = pipeline.submit(Urb::bulk_out(2, vec![7; 10])).unwrap();

        let mut wire = Vec::new();
        let mut buf = [0u8; 7];
        while let Some(n) = pipeline.try_read_next(&mut buf).unwrap() {
            wire.extend_from_slice(&buf[..n]);
        }
        assert_eq!(wire.len(), HEADER_SIZE + 10);
        let message = decode_message(&wire, None).unwrap();
        assert_eq!(message.data, vec![7; 10]);
        assert_eq!(pipeline.sent_len(), 1);
    }

    #[test]
    fn test_second_reader_is_rejected() {
        let pipeline = UrbPipeline::new(DEVID, 16);
        let _handle = pipeline.submit(Urb::bulk_out(2, vec![7; 10])).unwrap();

        let mut buf = [0u8; 7];
        assert_eq!(pipeline.try_read_next(&mut buf).unwrap(), Some(7));

        // As if the first reader were between checkout and checkin
        pipeline.state().reading = true;
        assert!(matches!(
            pipeline.try_read_next(&mut buf),
            Err(Error::InvalidParameter(_))
        ));
        pipeline.state().reading = false;

        let mut wire = buf.to_vec();
        while let Some(n) = pipeline.try_read_next(&mut buf).unwrap() {
            wire.extend_from_slice(&buf[..n]);
        }
        assert_eq!(wire.len(), HEADER_SIZE + 10);
    }

    #[test]
    fn test_concurrent_readers_never_panic() {
        const URBS: usize = 2000;
        const PAYLOAD: usize = 64;

        let pipeline = UrbPipeline::new(DEVID, URBS);
        let _handles: Vec<_> = (0..URBS)
            .map(|_| pipeline.submit(Urb::bulk_out(2, vec![1; PAYLOAD])).unwrap())
            .collect();
        let expected = URBS * (HEADER_SIZE + PAYLOAD);
        let total = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let pipeline = pipeline.clone();
                let total = total.clone();
                std::thread::spawn(move || {
                    use std::sync::atomic::Ordering;
                    let mut buf = [0u8; 7];
                    while total.load(Ordering::SeqCst) < expected {
                        match pipeline.try_read_next(&mut buf) {
                            Ok(Some(n)) => {
                                total.fetch_add(n, Ordering::SeqCst);
                            }
                            Ok(None) | Err(Error::InvalidParameter(_)) => {
                                std::thread::yield_now()
                            }
                            Err(e) => panic!("unexpected read error: {}", e),
                        }
                    }
                })
            })
            .collect();

        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(total.load(std::sync::atomic::Ordering::SeqCst), expected);
        assert_eq!(pipeline.sent_len(), URBS);
    }

    #[tokio::test]
    async fn test_read_next_wakes_on_submit() {
        let pipeline = UrbPipeline::new(DEVID, 16);
        let reader = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1024];
                pipeline.read_next(&mut buf).await
            })
        };

        tokio::task::yield_now().await;
        let _handle = pipeline.submit(Urb::bulk_in(1, 8)).unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), HEADER_SIZE);
    }

    #[tokio::test]
    async fn test_read_next_fails_after_shutdown() {
        let pipeline = UrbPipeline::new(DEVID, 16);
        let reader = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1024];
                pipeline.read_next(&mut buf).await
            })
        };

        tokio::task::yield_now().await;
        pipeline.shutdown();
        assert!(matches!(reader.await.unwrap(), Err(Error::NotPresent)));
    }

    #[tokio::test]
    async fn test_completion_future() {
        let pipeline = UrbPipeline::new(DEVID, 16);
        let handle = pipeline.submit(Urb::bulk_out(2, vec![1, 2])).unwrap();
        drain_one(&pipeline).unwrap();
        pipeline
            .on_receive(reply(1, RetSubmit::success(2), &[], &[]))
            .unwrap();

        let completion = handle.completion().await.unwrap();
        assert_eq!(completion.actual_length, 2);
    }
}
