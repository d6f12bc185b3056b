//! USB Bridge Integration Tests
//!
//! Tests for the async channel bridge between Tokio runtime and USB thread.
//!
//! # Test Scenarios
//! - Command/response flow for device listings and rescans
//! - Lifecycle event delivery
//! - Worker shutdown and disconnection
//!
//! Run with: `cargo test -p common --test usb_bridge_tests`

use common::{DeviceSummary, UsbCommand, UsbEvent, create_usb_bridge};
use driver::test_utils::{DEFAULT_TEST_TIMEOUT, mock_identity};
use driver::{Minor, TransportId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tokio::time::timeout;

fn summary(address: u8, channel: Option<&str>) -> DeviceSummary {
    DeviceSummary {
        transport: TransportId::new(1, address),
        identity: mock_identity(),
        matched: channel.is_some(),
        channel: channel.map(str::to_string),
    }
}

// ============================================================================
// UsbCommand Message Flow Tests
// ============================================================================

#[tokio::test]
async fn test_list_devices_command_flow() {
    let (bridge, worker) = create_usb_bridge();

    let handle = thread::spawn(move || {
        let cmd = worker.recv_command().expect("Failed to receive command");
        if let UsbCommand::ListDevices { response } = cmd {
            response
                .send(vec![summary(2, Some("zebu-001-002")), summary(3, None)])
                .expect("Failed to send response");
            true
        } else {
            false
        }
    });

    let devices = timeout(DEFAULT_TEST_TIMEOUT, bridge.list_devices())
        .await
        .expect("Timed out")
        .expect("Failed to list devices");
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].channel.as_deref(), Some("zebu-001-002"));
    assert!(!devices[1].matched);

    assert!(handle.join().unwrap());
}

#[tokio::test]
async fn test_rescan_command_flow() {
    let (bridge, worker) = create_usb_bridge();

    let handle = thread::spawn(move || {
        if let Ok(UsbCommand::Rescan { response }) = worker.recv_command() {
            response.send(2).expect("Failed to send");
        }
    });

    let created = timeout(DEFAULT_TEST_TIMEOUT, bridge.rescan())
        .await
        .expect("Timed out")
        .expect("Rescan failed");
    assert_eq!(created, 2);

    handle.join().expect("Worker thread panicked");
}

#[tokio::test]
async fn test_list_devices_fails_when_worker_drops_response() {
    let (bridge, worker) = create_usb_bridge();

    let handle = thread::spawn(move || {
        // Dropping the command drops its response sender
        let _ = worker.recv_command();
    });

    assert!(bridge.list_devices().await.is_err());
    handle.join().expect("Worker thread panicked");
}

#[tokio::test]
async fn test_shutdown_command_flow() {
    let (bridge, worker) = create_usb_bridge();
    let shutdown_received = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown_received.clone();

    let handle = thread::spawn(move || {
        loop {
            match worker.recv_command() {
                Ok(UsbCommand::Shutdown) => {
                    shutdown_flag.store(true, Ordering::Release);
                    break;
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    });

    bridge
        .send_command(UsbCommand::Shutdown)
        .await
        .expect("Failed to send shutdown");

    handle.join().expect("Worker thread panicked");
    assert!(shutdown_received.load(Ordering::Acquire));
}

#[tokio::test]
async fn test_try_recv_command_drains_queue() {
    let (bridge, worker) = create_usb_bridge();
    bridge
        .send_command(UsbCommand::Shutdown)
        .await
        .expect("Failed to send");
    assert!(matches!(worker.try_recv_command(), Some(UsbCommand::Shutdown)));
    assert!(worker.try_recv_command().is_none());
}

// ============================================================================
// UsbEvent Message Flow Tests
// ============================================================================

#[tokio::test]
async fn test_channel_lifecycle_events_in_order() {
    let (bridge, worker) = create_usb_bridge();

    let handle = thread::spawn(move || {
        worker
            .event_tx
            .send_blocking(UsbEvent::ChannelCreated {
                name: "zebu-001-002".to_string(),
                minor: Minor(0),
                transport: TransportId::new(1, 2),
                identity: mock_identity(),
            })
            .expect("Failed to send event");
        worker
            .event_tx
            .send_blocking(UsbEvent::ChannelRemoved {
                name: "zebu-001-002".to_string(),
                transport: TransportId::new(1, 2),
            })
            .expect("Failed to send event");
    });

    let first = timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
        .await
        .expect("Timed out")
        .expect("Failed to receive event");
    match first {
        UsbEvent::ChannelCreated { name, minor, .. } => {
            assert_eq!(name, "zebu-001-002");
            assert_eq!(minor, Minor(0));
        }
        other => panic!("Wrong event type: {:?}", other),
    }

    let second = bridge.recv_event().await.expect("Failed to receive event");
    assert!(matches!(second, UsbEvent::ChannelRemoved { .. }));

    handle.join().expect("Worker thread panicked");
}

#[tokio::test]
async fn test_attach_failed_event_carries_reason() {
    let (bridge, worker) = create_usb_bridge();

    assert!(
        worker
            .event_tx
            .try_send(UsbEvent::AttachFailed {
                transport: TransportId::new(2, 9),
                reason: "resource exhausted: minor numbers".to_string(),
            })
            .is_ok()
    );

    let event = bridge.recv_event().await.expect("Failed to receive event");
    assert_eq!(
        event,
        UsbEvent::AttachFailed {
            transport: TransportId::new(2, 9),
            reason: "resource exhausted: minor numbers".to_string(),
        }
    );
}

// ============================================================================
// Disconnection Tests
// ============================================================================

#[tokio::test]
async fn test_recv_event_errors_after_worker_dropped() {
    let (bridge, worker) = create_usb_bridge();
    drop(worker);
    assert!(bridge.recv_event().await.is_err());
}

#[tokio::test]
async fn test_send_command_errors_after_worker_dropped() {
    let (bridge, worker) = create_usb_bridge();
    drop(worker);
    assert!(bridge.send_command(UsbCommand::Shutdown).await.is_err());
}
