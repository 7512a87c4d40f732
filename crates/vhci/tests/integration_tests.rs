//! Virtual host controller integration tests
//!
//! Attaches devices exported by the scripted USB/IP peer from
//! `common::test_utils` and drives transfers, cancellation and teardown
//! through the public API.
//!
//! Run with: `cargo test -p vhci --test integration_tests`

use bytes::Bytes;
use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockUsbipServer, create_mock_bulk_data, create_mock_config_descriptor,
    create_mock_device_descriptor, with_timeout,
};
use common::{Error, EventReceiver, RemovalReason, VhciEvent};
use protocol::{
    Direction, HeaderBody, ImportStatus, RetSubmit, RetUnlink, UrbStatus, UsbSpeed, UsbipHeader,
    decode_message, encode_parts,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use vhci::network;
use vhci::virtual_usb::UrbPipeline;
use vhci::{ControllerOptions, Urb, VirtualDevice, VirtualHostController};

const DEVID: u32 = 0x0001_0002;

// ============================================================================
// Helpers
// ============================================================================

async fn next_event(events: &EventReceiver) -> VhciEvent {
    with_timeout(DEFAULT_TEST_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    with_timeout(DEFAULT_TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

async fn attach(
    server: MockUsbipServer,
) -> (
    Arc<VirtualHostController>,
    EventReceiver,
    Arc<VirtualDevice>,
    tokio::task::JoinHandle<common::Result<common::test_utils::MockSession>>,
) {
    let (controller, events) = VirtualHostController::new(ControllerOptions::default()).unwrap();
    let (stream, session) = server.spawn_duplex();
    let device = controller.attach(stream, "1-1").await.unwrap();
    assert!(matches!(
        next_event(&events).await,
        VhciEvent::DeviceAttached { port: 1, .. }
    ));
    (controller, events, device, session)
}

fn ret_submit(seqnum: u32, data: &[u8]) -> Bytes {
    let mut header = UsbipHeader::new(
        DEVID,
        Direction::Out,
        0,
        HeaderBody::RetSubmit(RetSubmit::success(data.len() as u32)),
    );
    header.seqnum = seqnum;
    Bytes::from(encode_parts(&header, data, &[]).unwrap())
}

fn ret_unlink(seqnum: u32) -> Bytes {
    let mut header = UsbipHeader::new(
        DEVID,
        Direction::Out,
        0,
        HeaderBody::RetUnlink(RetUnlink { status: 0 }),
    );
    header.seqnum = seqnum;
    Bytes::from(encode_parts(&header, &[], &[]).unwrap())
}

// ============================================================================
// Attach
// ============================================================================

#[tokio::test]
async fn test_attach_reads_device_descriptor() {
    let (controller, _events, device, _session) = attach(MockUsbipServer::single()).await;

    assert_eq!(device.devid(), DEVID);
    assert_eq!(device.info().speed, UsbSpeed::High);
    assert_eq!(
        device.get_device_descriptor().await.unwrap(),
        create_mock_device_descriptor()
    );
    assert_eq!(controller.hub().find(1).unwrap().busid(), "1-1");
}

#[tokio::test]
async fn test_attach_over_tcp() {
    let (addr, _session) = MockUsbipServer::single().spawn_tcp().await.unwrap();
    let (controller, _events) = VirtualHostController::new(ControllerOptions::default()).unwrap();

    let stream = network::connect("127.0.0.1", addr.port(), DEFAULT_TEST_TIMEOUT)
        .await
        .unwrap();
    let device = controller.attach(stream, "1-1").await.unwrap();
    let completion = device.transfer(Urb::bulk_in(0x81, 32)).await.unwrap();
    assert_eq!(completion.data(), create_mock_bulk_data(32).as_slice());
}

#[tokio::test]
async fn test_refused_import_leaves_ports_free() {
    let (controller, _events) = VirtualHostController::new(ControllerOptions::default()).unwrap();
    let (stream, _session) = MockUsbipServer::single()
        .refuse_import(ImportStatus::DeviceBusy)
        .spawn_duplex();

    assert!(matches!(
        controller.attach(stream, "1-1").await,
        Err(Error::Import(ImportStatus::DeviceBusy))
    ));
    assert!(controller.hub().ports().is_empty());
}

#[tokio::test]
async fn test_version_mismatch_on_attach() {
    let (controller, _events) = VirtualHostController::new(ControllerOptions::default()).unwrap();
    let (stream, _session) = MockUsbipServer::single().with_version(0x0100).spawn_duplex();

    let err = controller.attach(stream, "1-1").await.unwrap_err();
    assert!(matches!(err, Error::IncompatibleVersion { .. }));
    assert!(!err.is_transport());
}

#[tokio::test]
async fn test_connect_refused_is_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = network::connect("127.0.0.1", port, DEFAULT_TEST_TIMEOUT)
        .await
        .unwrap_err();
    assert!(err.is_transport());
}

// ============================================================================
// Transfers
// ============================================================================

#[tokio::test]
async fn test_bulk_transfers() {
    let (controller, _events, device, session) = attach(MockUsbipServer::single()).await;

    let out = device
        .transfer(Urb::bulk_out(0x02, vec![1, 2, 3, 4, 5]))
        .await
        .unwrap();
    assert_eq!(out.actual_length, 5);

    let input = device.transfer(Urb::bulk_in(0x81, 600)).await.unwrap();
    assert_eq!(input.data(), create_mock_bulk_data(600).as_slice());

    controller.detach(1).unwrap();
    let session = session.await.unwrap().unwrap();
    assert_eq!(session.submits, vec![1, 2]);
    assert_eq!(session.out_data, vec![vec![1, 2, 3, 4, 5]]);
}

#[tokio::test]
async fn test_concurrent_submissions_all_complete() {
    let (_controller, _events, device, _session) = attach(MockUsbipServer::single()).await;

    let handles: Vec<_> = (1..=16)
        .map(|len| device.submit(Urb::bulk_in(0x81, len * 10)).unwrap())
        .collect();
    for (index, handle) in handles.into_iter().enumerate() {
        let completion = handle.completion().await.unwrap();
        assert!(completion.status.is_success());
        assert_eq!(completion.data().len(), (index + 1) * 10);
    }
    assert_eq!(device.pipeline().outstanding(), 0);
}

#[tokio::test]
async fn test_isochronous_in() {
    let (_controller, _events, device, _session) = attach(MockUsbipServer::single()).await;

    let completion = device
        .transfer(Urb::iso_in(0x83, &[192, 192, 192], 1))
        .await
        .unwrap();
    assert_eq!(completion.actual_length, 576);
    assert_eq!(completion.urb.buffer, create_mock_bulk_data(576));
    for packet in &completion.urb.iso_packets {
        assert_eq!(packet.actual_length, 192);
        assert_eq!(packet.status, UrbStatus::Success);
    }
}

#[tokio::test]
async fn test_select_configuration_and_interface() {
    let (_controller, _events, device, _session) = attach(MockUsbipServer::single()).await;

    let config = device.get_configuration_descriptor(0).await.unwrap();
    assert_eq!(config, create_mock_config_descriptor());

    device.select_configuration(Some(config)).await.unwrap();
    device.select_interface(0, 1).await.unwrap();
    assert!(device.select_interface(2, 0).await.is_err());

    let info = device.connection_info();
    assert!(info.connected);
    assert_eq!(info.speed, UsbSpeed::High);
    assert_eq!(info.configuration_value, Some(1));
    assert_eq!(info.interface, Some((0, 1)));
    assert_eq!(info.endpoints.len(), 1);
    assert_eq!(info.endpoints[0].address, 0x83);

    device.select_configuration(None).await.unwrap();
    let info = device.connection_info();
    assert_eq!(info.configuration_value, None);
    assert!(info.endpoints.is_empty());
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_sent_request() {
    let (controller, _events, device, session) =
        attach(MockUsbipServer::single().hold_endpoint(1)).await;

    let handle = device.submit(Urb::bulk_in(0x81, 16)).unwrap();
    let token = handle.cancel_token();
    wait_until(|| device.pipeline().sent_len() == 1).await;

    assert!(token.cancel());
    assert!(!token.cancel());
    let completion = handle.completion().await.unwrap();
    assert_eq!(completion.status, UrbStatus::Cancelled);
    assert!(matches!(completion.into_result(), Err(Error::Urb(UrbStatus::Cancelled))));

    // The unlink is acknowledged and the stream keeps working
    wait_until(|| device.pipeline().outstanding() == 0).await;
    device.transfer(Urb::bulk_out(0x02, vec![9])).await.unwrap();

    controller.detach(1).unwrap();
    let session = session.await.unwrap().unwrap();
    assert_eq!(session.unlinks, vec![(2, 1)]);
}

#[tokio::test]
async fn test_late_reply_after_cancel_is_discarded() {
    let server = MockUsbipServer::single()
        .hold_endpoint(1)
        .reply_late_on_unlink();
    let (_controller, _events, device, _session) = attach(server).await;

    let handle = device.submit(Urb::bulk_in(0x81, 64)).unwrap();
    wait_until(|| device.pipeline().sent_len() == 1).await;
    assert!(handle.cancel());
    assert_eq!(
        handle.completion().await.unwrap().status,
        UrbStatus::Cancelled
    );

    // The late RET_SUBMIT carries 64 bytes that must be skipped in framing
    let next = device.transfer(Urb::bulk_out(0x02, vec![1, 2])).await.unwrap();
    assert_eq!(next.actual_length, 2);
    wait_until(|| device.pipeline().outstanding() == 0).await;
    assert!(!device.is_removed());
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_peer_disconnect_tears_down_device() {
    let server = MockUsbipServer::single().hold_endpoint(1).disconnect_after(1);
    let (controller, events, device, _session) = attach(server).await;

    let handle = device.submit(Urb::bulk_in(0x81, 8)).unwrap();
    let completion = with_timeout(DEFAULT_TEST_TIMEOUT, handle.completion())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completion.status, UrbStatus::Cancelled);

    assert_eq!(
        next_event(&events).await,
        VhciEvent::DeviceRemoved {
            port: 1,
            reason: RemovalReason::TransportClosed
        }
    );
    assert!(device.is_removed());
    assert!(!device.connection_info().connected);
    assert!(matches!(
        device.submit(Urb::bulk_in(0x81, 8)),
        Err(Error::NotPresent)
    ));
    assert!(controller.hub().find(1).is_none());
}

#[tokio::test]
async fn test_detach_cancels_outstanding() {
    let (controller, events, device, _session) =
        attach(MockUsbipServer::single().hold_endpoint(1)).await;

    let handles: Vec<_> = (0..4)
        .map(|_| device.submit(Urb::bulk_in(0x81, 8)).unwrap())
        .collect();
    controller.detach(1).unwrap();

    for handle in handles {
        assert_eq!(
            handle.completion().await.unwrap().status,
            UrbStatus::Cancelled
        );
    }
    assert_eq!(
        next_event(&events).await,
        VhciEvent::DeviceRemoved {
            port: 1,
            reason: RemovalReason::Detached
        }
    );
    assert_eq!(device.pipeline().outstanding(), 0);
    assert!(matches!(controller.detach(1), Err(Error::NotPresent)));
}

// ============================================================================
// Pipeline properties
// ============================================================================

#[test]
fn test_pending_requests_leave_in_submission_order() {
    let pipeline = UrbPipeline::new(DEVID, 16);
    let _a = pipeline.submit(Urb::bulk_in(0x81, 8)).unwrap();
    let _b = pipeline.submit(Urb::bulk_out(0x02, vec![7; 3])).unwrap();
    assert_eq!(pipeline.pending_len(), 2);

    let mut buf = vec![0u8; 1024];
    let n = pipeline.try_read_next(&mut buf).unwrap().unwrap();
    let first = decode_message(&buf[..n], None).unwrap();
    let n = pipeline.try_read_next(&mut buf).unwrap().unwrap();
    let second = decode_message(&buf[..n], None).unwrap();

    assert_eq!((first.header.seqnum, first.header.direction), (1, Direction::In));
    assert_eq!((second.header.seqnum, second.header.direction), (2, Direction::Out));
    assert_eq!(second.data, vec![7; 3]);
}

#[derive(Debug, Clone)]
enum Op {
    Submit(u8),
    Transmit,
    Reply(usize),
    AckUnlink(usize),
    Cancel(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u8..32).prop_map(Op::Submit),
        Just(Op::Transmit),
        any::<usize>().prop_map(Op::Reply),
        any::<usize>().prop_map(Op::AckUnlink),
        any::<usize>().prop_map(Op::Cancel),
    ]
}

proptest! {
    #[test]
    fn prop_every_urb_completes_exactly_once(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let pipeline = UrbPipeline::new(DEVID, 1024);
        let mut handles = Vec::new();
        // Submits the peer has seen and not answered: (seqnum, length)
        let mut in_flight: Vec<(u32, u32)> = Vec::new();
        // Unlinks the peer has seen: (seqnum, target)
        let mut unlinks: Vec<(u32, u32)> = Vec::new();
        let mut buf = vec![0u8; 4096];

        for op in ops {
            match op {
                Op::Submit(len) => {
                    handles.push(pipeline.submit(Urb::bulk_in(0x81, len as usize)).unwrap());
                }
                Op::Transmit => {
                    if let Some(n) = pipeline.try_read_next(&mut buf).unwrap() {
                        let message = decode_message(&buf[..n], None).unwrap();
                        match message.header.body {
                            HeaderBody::CmdSubmit(cmd) => {
                                in_flight.push((message.header.seqnum, cmd.transfer_buffer_length));
                            }
                            HeaderBody::CmdUnlink(cmd) => {
                                unlinks.push((message.header.seqnum, cmd.unlink_seqnum));
                            }
                            other => panic!("unexpected outgoing {:?}", other),
                        }
                    }
                }
                Op::Reply(i) => {
                    if !in_flight.is_empty() {
                        let (seqnum, len) = in_flight.remove(i % in_flight.len());
                        let data = vec![0xA5; len.min(4) as usize];
                        pipeline.on_receive(ret_submit(seqnum, &data)).unwrap();
                    }
                }
                Op::AckUnlink(i) => {
                    if !unlinks.is_empty() {
                        let (seqnum, target) = unlinks.remove(i % unlinks.len());
                        // The peer never answers a submit after unlinking it
                        in_flight.retain(|&(s, _)| s != target);
                        pipeline.on_receive(ret_unlink(seqnum)).unwrap();
                    }
                }
                Op::Cancel(i) => {
                    if !handles.is_empty() {
                        let index = i % handles.len();
                        handles[index].cancel();
                    }
                }
            }
        }

        let earlier: Vec<_> = handles.iter_mut().map(|h| h.try_completion()).collect();
        let open = earlier.iter().filter(|c| c.is_none()).count();
        prop_assert_eq!(pipeline.shutdown(), open);
        prop_assert_eq!(pipeline.outstanding(), 0);

        for (handle, earlier) in handles.iter_mut().zip(earlier) {
            let later = handle.try_completion();
            match earlier {
                Some(completion) => {
                    prop_assert!(later.is_none());
                    prop_assert!(matches!(
                        completion.status,
                        UrbStatus::Success | UrbStatus::Cancelled
                    ));
                }
                None => prop_assert_eq!(later.map(|c| c.status), Some(UrbStatus::Cancelled)),
            }
        }
    }
}
