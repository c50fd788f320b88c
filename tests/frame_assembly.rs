//! Frame-mode scanning across two mock scan heads.

mod mock_head;

use std::net::Ipv4Addr;
use std::time::Duration;

use mock_head::{xy_datagram, MockScanHead};
use triscan::config::{ProductType, API_VERSION};
use triscan::{DataFormat, ScanError, ScanMode, ScanOptions, ScanSystem};

async fn two_head_system() -> (ScanSystem, MockScanHead, MockScanHead) {
    let mock_a = MockScanHead::start(700_010, API_VERSION, 0b1).await;
    let mock_b = MockScanHead::start(700_011, API_VERSION, 0b1).await;

    let mut system = ScanSystem::new();
    for (mock, id) in [(&mock_a, 0u32), (&mock_b, 1u32)] {
        system
            .create_scan_head_at(mock.serial, id, ProductType::Vx100, Ipv4Addr::LOCALHOST)
            .unwrap();
        system.set_device_addresses(mock.serial, mock.control_addr, mock.data_addr);
    }
    system.connect(Duration::from_secs(2)).await.unwrap();

    system.add_phase().unwrap();
    system.add_phase_element_camera(0, 0, None).unwrap();
    system.add_phase_element_camera(1, 0, None).unwrap();

    let period_us = system.get_min_scan_period_us().unwrap();
    system
        .start_scanning(ScanOptions {
            period_us,
            data_format: DataFormat::XyBrightnessFull,
            mode: ScanMode::Frame,
            idle_period_us: None,
        })
        .await
        .unwrap();
    (system, mock_a, mock_b)
}

#[tokio::test]
async fn frames_are_sequence_ordered_despite_arrival_order() {
    let (mut system, mock_a, mock_b) = two_head_system().await;

    // Head 0 delivers in order; head 1 swaps sequences 2 and 3.
    for seq in [1u32, 2, 3, 4] {
        mock_a.send_datagram(xy_datagram(0, 0, 0, seq as u64 * 1_000_000, seq, 8));
    }
    for seq in [1u32, 3, 2, 4] {
        mock_b.send_datagram(xy_datagram(1, 0, 0, seq as u64 * 1_000_000, seq, 8));
    }

    for expected in 1u32..=4 {
        let frame = system
            .take_frame(Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(frame.sequence, expected);
        assert!(frame.complete, "frame {expected} incomplete");
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.get(0).unwrap().scan_head_id, 0);
        assert_eq!(frame.get(1).unwrap().scan_head_id, 1);
    }

    system.stop_scanning().await.unwrap();
    system.disconnect().await;
}

#[tokio::test]
async fn take_frame_in_profile_mode_is_rejected() {
    let mock = MockScanHead::start(700_012, API_VERSION, 0b1).await;
    let mut system = ScanSystem::new();
    system
        .create_scan_head_at(mock.serial, 0, ProductType::Vx100, Ipv4Addr::LOCALHOST)
        .unwrap();
    system.set_device_addresses(mock.serial, mock.control_addr, mock.data_addr);
    system.connect(Duration::from_secs(2)).await.unwrap();
    system.add_phase().unwrap();
    system.add_phase_element_camera(0, 0, None).unwrap();
    let period_us = system.get_min_scan_period_us().unwrap();
    system
        .start_scanning(ScanOptions {
            period_us,
            data_format: DataFormat::XyFull,
            mode: ScanMode::Profile,
            idle_period_us: None,
        })
        .await
        .unwrap();

    assert!(matches!(
        system.take_frame(Some(Duration::from_millis(50))).await,
        Err(ScanError::WrongScanMode("frame"))
    ));
    assert!(matches!(
        system.try_take_frame(),
        Err(ScanError::WrongScanMode("frame"))
    ));
    system.disconnect().await;
}

#[tokio::test]
async fn dead_head_turns_take_frame_into_disconnected() {
    let (system, mock_a, mut mock_b) = two_head_system().await;

    mock_a.send_datagram(xy_datagram(0, 0, 0, 1_000_000, 1, 8));
    // Head 1 dies before delivering anything; its socket close is noticed
    // by the data receive loop.
    mock_b.kill();

    let result = system.take_frame(Some(Duration::from_secs(6))).await;
    assert!(
        matches!(result, Err(ScanError::Disconnected(1))),
        "expected Disconnected(1), got {result:?}"
    );
}
