//! Phase-table compilation through the system API.

use std::net::Ipv4Addr;

use triscan::config::{
    ProductType, ScanHeadConfiguration, FRAME_OVERHEAD_TIME_NS, MIN_SCAN_PERIOD_PER_ELEMENT_US,
};
use triscan::{ScanError, ScanSystem};

fn config_with_laser_on(max_us: u32) -> ScanHeadConfiguration {
    ScanHeadConfiguration {
        min_laser_on_time_us: 15,
        default_laser_on_time_us: max_us.min(500),
        max_laser_on_time_us: max_us,
        ..Default::default()
    }
}

#[test]
fn two_heads_one_phase_each_matches_hand_computation() {
    let mut system = ScanSystem::new();
    system
        .create_scan_head_at(700_100, 0, ProductType::Vx100, Ipv4Addr::LOCALHOST)
        .unwrap();
    system
        .create_scan_head_at(700_101, 1, ProductType::Vx100, Ipv4Addr::LOCALHOST)
        .unwrap();
    system
        .scan_head_mut(0)
        .unwrap()
        .set_configuration(config_with_laser_on(500))
        .unwrap();
    system
        .scan_head_mut(1)
        .unwrap()
        .set_configuration(config_with_laser_on(300))
        .unwrap();

    system.add_phase().unwrap();
    system.add_phase_element_camera(0, 0, None).unwrap();
    system.add_phase().unwrap();
    system.add_phase_element_camera(1, 0, None).unwrap();

    let durations = system.calculate_phase_durations().unwrap();
    // Camera pre-exposure lands on the first phase only.
    assert_eq!(durations, vec![509_500, 300_000]);
    assert_eq!(system.get_min_scan_period_us().unwrap(), 810);
}

#[test]
fn total_duration_never_beats_throughput_floor() {
    let mut system = ScanSystem::new();
    system
        .create_scan_head_at(700_102, 0, ProductType::Vx200, Ipv4Addr::LOCALHOST)
        .unwrap();
    system
        .scan_head_mut(0)
        .unwrap()
        .set_configuration(config_with_laser_on(15))
        .unwrap();

    for camera in [0u32, 1] {
        for _ in 0..3 {
            system.add_phase().unwrap();
            system.add_phase_element_camera(0, camera, None).unwrap();
        }
    }

    let durations = system.calculate_phase_durations().unwrap();
    let total: u64 = durations.iter().sum();
    // Six elements on one head.
    assert!(total >= MIN_SCAN_PERIOD_PER_ELEMENT_US * 1000 * 6);
}

#[test]
fn consecutive_same_camera_phases_keep_readout_gap() {
    let mut system = ScanSystem::new();
    system
        .create_scan_head_at(700_103, 0, ProductType::Vx100, Ipv4Addr::LOCALHOST)
        .unwrap();
    system
        .scan_head_mut(0)
        .unwrap()
        .set_configuration(config_with_laser_on(50))
        .unwrap();

    for _ in 0..3 {
        system.add_phase().unwrap();
        system.add_phase_element_camera(0, 0, None).unwrap();
    }

    let durations = system.calculate_phase_durations().unwrap();
    let laser_on_ns = 50_000u64;
    // Every later phase hosts a repeat exposure of the same camera; the gap
    // from the previous exposure's end must cover the sensor readout.
    for duration in &durations[1..] {
        assert!(duration - laser_on_ns >= FRAME_OVERHEAD_TIME_NS);
    }
}

#[test]
fn element_addition_validates_against_registry() {
    let mut system = ScanSystem::new();
    system
        .create_scan_head_at(700_104, 0, ProductType::Vx200, Ipv4Addr::LOCALHOST)
        .unwrap();

    // No phase yet.
    assert!(matches!(
        system.add_phase_element_camera(0, 0, None),
        Err(ScanError::EmptyPhaseTable)
    ));
    system.add_phase().unwrap();
    // Unknown head id.
    assert!(matches!(
        system.add_phase_element_camera(9, 0, None),
        Err(ScanError::UnknownScanHead(9))
    ));
    // Camera-driven head rejects laser-keyed addition.
    assert!(matches!(
        system.add_phase_element_laser(0, 0, None),
        Err(ScanError::WrongPhaseElementKind(0, "camera"))
    ));
    // Duplicate camera within one phase.
    system.add_phase_element_camera(0, 0, None).unwrap();
    assert!(matches!(
        system.add_phase_element_camera(0, 0, None),
        Err(ScanError::DuplicatePhaseElement { .. })
    ));
}
