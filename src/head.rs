//! Scan head public API: configuration, windows, masks, and liveness.
//!
//! A [`ScanHead`] is created through the scan system after discovery finds
//! its serial. Settings changed through this API flip dirty flags; the flags
//! are drained (sent to the device) by `connect` and before every scan
//! start. Settings cannot change while scanning.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{
    ProductType, ScanHeadConfiguration, Version, MAX_ENCODERS, SENSOR_HEIGHT, SENSOR_WIDTH,
};
use crate::error::{ScanError, ScanResult};
use crate::frame::Orientation;
use crate::phase::ScheduleHead;
use crate::profile::CameraLaserPair;
use crate::session::{Session, SessionState};
use crate::wire::control::{ControlMessage, ScanHeadStatus, WireConfiguration, WireWindowConstraint};

// =============================================================================
// Scan window
// =============================================================================

/// A convex, clockwise polygon bounding valid measurements in mill
/// coordinates. Points outside the window are discarded by the device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanWindow {
    points: Vec<(f64, f64)>,
}

impl ScanWindow {
    /// Validate and build a window from polygon vertices.
    ///
    /// Accepts only polygons with at least three vertices, wound clockwise
    /// (positive shoelace sum), and convex (every consecutive edge cross
    /// product sharing one sign).
    pub fn new(points: Vec<(f64, f64)>) -> ScanResult<Self> {
        if points.len() < 3 {
            return Err(ScanError::InvalidPolygon(format!(
                "{} points, need at least 3",
                points.len()
            )));
        }

        let n = points.len();
        let mut shoelace = 0.0;
        for i in 0..n {
            let (x0, y0) = points[i];
            let (x1, y1) = points[(i + 1) % n];
            shoelace += x0 * y1 - x1 * y0;
        }
        if shoelace <= 0.0 {
            return Err(ScanError::InvalidPolygon(
                "vertices must be in clockwise order".to_string(),
            ));
        }

        let mut sign = 0.0f64;
        for i in 0..n {
            let (x0, y0) = points[i];
            let (x1, y1) = points[(i + 1) % n];
            let (x2, y2) = points[(i + 2) % n];
            let cross = (x1 - x0) * (y2 - y1) - (y1 - y0) * (x2 - x1);
            if cross == 0.0 {
                return Err(ScanError::InvalidPolygon(
                    "degenerate (collinear) vertices".to_string(),
                ));
            }
            if sign == 0.0 {
                sign = cross.signum();
            } else if cross.signum() != sign {
                return Err(ScanError::InvalidPolygon("polygon is not convex".to_string()));
            }
        }

        Ok(Self { points })
    }

    /// Axis-aligned rectangular window.
    pub fn rectangular(top: f64, bottom: f64, left: f64, right: f64) -> ScanResult<Self> {
        if top <= bottom || right <= left {
            return Err(ScanError::InvalidPolygon(
                "rectangle edges are inverted or empty".to_string(),
            ));
        }
        Self::new(vec![
            (left, top),
            (left, bottom),
            (right, bottom),
            (right, top),
        ])
    }

    /// Polygon vertices in validated order.
    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    /// Oriented edge constraints, mill coordinates scaled by 1000 for the
    /// wire.
    pub(crate) fn wire_constraints(&self) -> Vec<WireWindowConstraint> {
        let n = self.points.len();
        (0..n)
            .map(|i| {
                let (x0, y0) = self.points[i];
                let (x1, y1) = self.points[(i + 1) % n];
                WireWindowConstraint {
                    x0: (x0 * 1000.0) as i32,
                    y0: (y0 * 1000.0) as i32,
                    x1: (x1 * 1000.0) as i32,
                    y1: (y1 * 1000.0) as i32,
                }
            })
            .collect()
    }
}

// =============================================================================
// Exclusion mask and brightness correction
// =============================================================================

/// Per-pixel exclusion bitmap; a set bit removes the pixel from laser
/// detection.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionMask {
    bits: Vec<u8>,
}

impl Default for ExclusionMask {
    fn default() -> Self {
        Self::new()
    }
}

impl ExclusionMask {
    /// All pixels included.
    pub fn new() -> Self {
        Self {
            bits: vec![0; SENSOR_WIDTH * SENSOR_HEIGHT / 8],
        }
    }

    fn index(x: usize, y: usize) -> ScanResult<(usize, u8)> {
        if x >= SENSOR_WIDTH {
            return Err(ScanError::OutOfRange("mask column", x.to_string()));
        }
        if y >= SENSOR_HEIGHT {
            return Err(ScanError::OutOfRange("mask row", y.to_string()));
        }
        let bit = y * SENSOR_WIDTH + x;
        Ok((bit / 8, 1 << (bit % 8)))
    }

    /// Exclude one pixel.
    pub fn set_pixel(&mut self, x: usize, y: usize) -> ScanResult<()> {
        let (byte, mask) = Self::index(x, y)?;
        self.bits[byte] |= mask;
        Ok(())
    }

    /// Re-include one pixel.
    pub fn clear_pixel(&mut self, x: usize, y: usize) -> ScanResult<()> {
        let (byte, mask) = Self::index(x, y)?;
        self.bits[byte] &= !mask;
        Ok(())
    }

    /// True if the pixel is excluded.
    pub fn is_set(&self, x: usize, y: usize) -> ScanResult<bool> {
        let (byte, mask) = Self::index(x, y)?;
        Ok(self.bits[byte] & mask != 0)
    }

    /// Packed row-major bitmap for the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

impl std::fmt::Debug for ExclusionMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let excluded: u32 = self.bits.iter().map(|b| b.count_ones()).sum();
        f.debug_struct("ExclusionMask")
            .field("excluded_pixels", &excluded)
            .finish()
    }
}

/// Per-column brightness calibration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BrightnessCorrection {
    /// Offset added to every pixel.
    pub image_offset: i32,
    /// Multiplier per sensor column.
    pub scale_factors: Vec<f32>,
}

impl Default for BrightnessCorrection {
    fn default() -> Self {
        Self {
            image_offset: 0,
            scale_factors: vec![1.0; SENSOR_WIDTH],
        }
    }
}

// =============================================================================
// Encoders and dirty flags
// =============================================================================

/// Encoder slots a profile can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoder {
    /// Primary encoder; also selects the ScanSync used for start times.
    Main,
    /// First auxiliary encoder.
    Auxiliary1,
    /// Second auxiliary encoder.
    Auxiliary2,
}

impl Encoder {
    /// Slot index of this encoder.
    pub fn index(self) -> usize {
        match self {
            Encoder::Main => 0,
            Encoder::Auxiliary1 => 1,
            Encoder::Auxiliary2 => 2,
        }
    }
}

/// Settings that changed since they were last sent to the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirtyFlags(u8);

impl DirtyFlags {
    /// Scan window changed.
    pub const WINDOW: DirtyFlags = DirtyFlags(1 << 0);
    /// Exclusion mask changed.
    pub const EXCLUSION_MASK: DirtyFlags = DirtyFlags(1 << 1);
    /// Brightness correction changed.
    pub const BRIGHTNESS_CORRECTION: DirtyFlags = DirtyFlags(1 << 2);
    /// Exposure configuration changed.
    pub const CONFIGURATION: DirtyFlags = DirtyFlags(1 << 3);
    /// ScanSync mapping changed.
    pub const SCANSYNC_MAPPING: DirtyFlags = DirtyFlags(1 << 4);

    /// True when nothing is pending.
    pub fn is_clean(self) -> bool {
        self.0 == 0
    }

    /// True when `flag` is pending.
    pub fn contains(self, flag: DirtyFlags) -> bool {
        self.0 & flag.0 != 0
    }

    fn insert(&mut self, flag: DirtyFlags) {
        self.0 |= flag.0;
    }

    fn clear(&mut self) {
        self.0 = 0;
    }
}

// =============================================================================
// Scan head
// =============================================================================

/// One scan head owned by a scan system.
#[derive(Debug)]
pub struct ScanHead {
    id: u32,
    serial: u32,
    product: ProductType,
    ip: Ipv4Addr,
    orientation: Orientation,
    configuration: ScanHeadConfiguration,
    window: Option<ScanWindow>,
    masks: HashMap<u32, ExclusionMask>,
    corrections: HashMap<u32, BrightnessCorrection>,
    scansync_serials: [u32; MAX_ENCODERS],
    dirty: DirtyFlags,
    pub(crate) session: Option<Arc<Session>>,
}

impl ScanHead {
    pub(crate) fn new(id: u32, serial: u32, product: ProductType, ip: Ipv4Addr) -> Self {
        Self {
            id,
            serial,
            product,
            ip,
            orientation: Orientation::default(),
            configuration: ScanHeadConfiguration::default(),
            window: None,
            masks: HashMap::new(),
            corrections: HashMap::new(),
            scansync_serials: [0; MAX_ENCODERS],
            dirty: DirtyFlags::default(),
            session: None,
        }
    }

    /// Id the head is registered under.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Device serial number.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Product model.
    pub fn product(&self) -> ProductType {
        self.product
    }

    /// Device address discovery reported.
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    /// Mounting orientation.
    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    /// Current exposure configuration.
    pub fn configuration(&self) -> &ScanHeadConfiguration {
        &self.configuration
    }

    /// Settings pending transmission.
    pub fn dirty_flags(&self) -> DirtyFlags {
        self.dirty
    }

    /// True while the session is usable.
    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_connected())
    }

    /// Most recent device status, if one was fetched.
    pub fn cached_status(&self) -> Option<ScanHeadStatus> {
        self.session.as_ref().and_then(|s| s.cached_status())
    }

    /// Datagrams dropped by the assembler this scan session.
    pub fn bad_packets(&self) -> u64 {
        self.session.as_ref().map_or(0, |s| s.bad_packets())
    }

    /// Profiles delivered incomplete this scan session.
    pub fn incomplete_profiles(&self) -> u64 {
        self.session.as_ref().map_or(0, |s| s.incomplete_profiles())
    }

    /// Scheduling view used by the phase compiler. Prefers the device's own
    /// minimum scan period when status has been fetched.
    pub(crate) fn schedule_view(&self) -> ScheduleHead {
        let min_scan_period_us = self
            .cached_status()
            .map(|s| s.min_scan_period_us)
            .unwrap_or(self.product.spec().min_scan_period_us);
        ScheduleHead {
            scan_head_id: self.id,
            product: self.product,
            configuration: self.configuration.clone(),
            min_scan_period_us,
        }
    }

    fn reject_while_scanning(&self) -> ScanResult<()> {
        if self
            .session
            .as_ref()
            .is_some_and(|s| s.state() == SessionState::Scanning)
        {
            return Err(ScanError::AlreadyScanning);
        }
        Ok(())
    }

    /// Replace the exposure configuration. Validated against the product's
    /// limits; not permitted while scanning.
    pub fn set_configuration(&mut self, configuration: ScanHeadConfiguration) -> ScanResult<()> {
        self.reject_while_scanning()?;
        configuration.validate(self.product.spec())?;
        self.configuration = configuration;
        self.dirty.insert(DirtyFlags::CONFIGURATION);
        Ok(())
    }

    /// Set the mounting orientation. Takes effect at the next scan start.
    pub fn set_orientation(&mut self, orientation: Orientation) -> ScanResult<()> {
        self.reject_while_scanning()?;
        self.orientation = orientation;
        Ok(())
    }

    /// Replace the scan window for every camera/laser pair.
    pub fn set_window(&mut self, window: ScanWindow) -> ScanResult<()> {
        self.reject_while_scanning()?;
        self.window = Some(window);
        self.dirty.insert(DirtyFlags::WINDOW);
        Ok(())
    }

    /// Current scan window, if one was set.
    pub fn window(&self) -> Option<&ScanWindow> {
        self.window.as_ref()
    }

    /// Replace one camera's exclusion mask.
    pub fn set_exclusion_mask(&mut self, camera: u32, mask: ExclusionMask) -> ScanResult<()> {
        self.reject_while_scanning()?;
        if camera >= self.product.spec().num_cameras {
            return Err(ScanError::InvalidCamera(camera));
        }
        self.masks.insert(camera, mask);
        self.dirty.insert(DirtyFlags::EXCLUSION_MASK);
        Ok(())
    }

    /// Replace one camera's brightness correction.
    pub fn set_brightness_correction(
        &mut self,
        camera: u32,
        correction: BrightnessCorrection,
    ) -> ScanResult<()> {
        self.reject_while_scanning()?;
        if camera >= self.product.spec().num_cameras {
            return Err(ScanError::InvalidCamera(camera));
        }
        if correction.scale_factors.len() != SENSOR_WIDTH {
            return Err(ScanError::OutOfRange(
                "scale factors",
                format!("{} != {SENSOR_WIDTH}", correction.scale_factors.len()),
            ));
        }
        self.corrections.insert(camera, correction);
        self.dirty.insert(DirtyFlags::BRIGHTNESS_CORRECTION);
        Ok(())
    }

    /// Map an encoder slot to a ScanSync serial.
    ///
    /// Requires firmware 16.3.0; gate before the session exists is applied
    /// at connect time instead.
    pub fn set_scansync_mapping(&mut self, encoder: Encoder, serial: u32) -> ScanResult<()> {
        self.reject_while_scanning()?;
        self.require_version(16, 3, 0)?;
        self.scansync_serials[encoder.index()] = serial;
        self.dirty.insert(DirtyFlags::SCANSYNC_MAPPING);
        Ok(())
    }

    /// ScanSync serial mapped to `encoder`, 0 when unmapped.
    pub fn scansync_mapping(&self, encoder: Encoder) -> u32 {
        self.scansync_serials[encoder.index()]
    }

    /// Fail unless connected firmware is at least `major.minor.patch` and
    /// API-major compatible. Feature-gated APIs call this before acting.
    pub fn require_version(&self, major: u32, minor: u32, patch: u32) -> ScanResult<()> {
        let Some(status) = self.cached_status() else {
            // Not connected yet; the gate re-runs when configuration is
            // sent.
            return Ok(());
        };
        let firmware = status.firmware;
        let ok = firmware.is_compatible_with_api()
            && firmware >= Version::new(major, minor, patch);
        if ok {
            Ok(())
        } else {
            Err(ScanError::VersionIncompatible {
                serial: self.serial,
                major: firmware.major,
                minor: firmware.minor,
                patch: firmware.patch,
            })
        }
    }

    /// Camera/laser pairs this product exposes, in port order.
    pub fn all_pairs(&self) -> Vec<CameraLaserPair> {
        let spec = self.product.spec();
        match spec.primary {
            crate::config::DrivePrimary::Camera => (0..spec.num_cameras)
                .map(|camera| {
                    CameraLaserPair::new(camera, camera * spec.num_lasers / spec.num_cameras)
                })
                .collect(),
            crate::config::DrivePrimary::Laser => (0..spec.num_lasers)
                .map(|laser| {
                    CameraLaserPair::new(laser * spec.num_cameras / spec.num_lasers, laser)
                })
                .collect(),
        }
    }

    /// Send every dirty setting to the device, refresh status, and clear
    /// the flags. No-op when clean.
    pub(crate) async fn send_pending_configuration(&mut self) -> ScanResult<()> {
        let Some(session) = self.session.clone() else {
            return Err(ScanError::NotConnected(self.id));
        };
        if self.dirty.is_clean() {
            return Ok(());
        }

        if self.dirty.contains(DirtyFlags::WINDOW) {
            if let Some(window) = &self.window {
                for pair in self.all_pairs() {
                    session
                        .send(&ControlMessage::Window {
                            camera: pair.camera as u8,
                            laser: pair.laser as u8,
                            constraints: window.wire_constraints(),
                        })
                        .await?;
                }
            }
        }
        if self.dirty.contains(DirtyFlags::EXCLUSION_MASK) {
            for (&camera, mask) in &self.masks {
                for pair in self.all_pairs().iter().filter(|p| p.camera == camera) {
                    session
                        .send(&ControlMessage::ExclusionMask {
                            camera: camera as u8,
                            laser: pair.laser as u8,
                            bitmap: mask.as_bytes().to_vec(),
                        })
                        .await?;
                }
            }
        }
        if self.dirty.contains(DirtyFlags::BRIGHTNESS_CORRECTION) {
            for (&camera, correction) in &self.corrections {
                for pair in self.all_pairs().iter().filter(|p| p.camera == camera) {
                    session
                        .send(&ControlMessage::BrightnessCorrection {
                            camera: camera as u8,
                            laser: pair.laser as u8,
                            image_offset: correction.image_offset,
                            scale_factors: correction.scale_factors.clone(),
                        })
                        .await?;
                }
            }
        }
        if self.dirty.contains(DirtyFlags::SCANSYNC_MAPPING) {
            // The pre-connect gate could not see firmware; re-check now.
            self.require_version(16, 3, 0)?;
            session
                .send(&ControlMessage::ScanSyncMapping {
                    serials: self.scansync_serials,
                })
                .await?;
        }
        if self.dirty.contains(DirtyFlags::CONFIGURATION) {
            let c = &self.configuration;
            session
                .send(&ControlMessage::Configuration(WireConfiguration {
                    laser_on_us: [
                        c.min_laser_on_time_us,
                        c.default_laser_on_time_us,
                        c.max_laser_on_time_us,
                    ],
                    exposure_us: [
                        c.min_exposure_time_us,
                        c.default_exposure_time_us,
                        c.max_exposure_time_us,
                    ],
                    laser_detection_threshold: c.laser_detection_threshold,
                    saturation_threshold: c.saturation_threshold,
                    saturation_percentage: c.saturation_percentage,
                    minimum_encoder_travel: c.minimum_encoder_travel.unwrap_or(0),
                }))
                .await?;
        }

        session.request_status().await?;
        self.dirty.clear();
        Ok(())
    }
}
