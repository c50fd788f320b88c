//! Process-wide constants, product limits, and per-head configuration.
//!
//! Everything the runtime needs to know about port numbers, protocol timing,
//! and device capabilities lives here as compile-time constants or plain data
//! records. There are no module statics mutated at load; anything tunable is
//! carried explicitly by the objects that consume it.

use serde::{Deserialize, Serialize};

use crate::error::{ScanError, ScanResult};

// =============================================================================
// Network constants
// =============================================================================

/// TCP port the scan head listens on for control messages.
pub const CONTROL_PORT: u16 = 12346;

/// UDP port discovery probes are broadcast to.
pub const DISCOVERY_PORT: u16 = 12347;

/// TCP port the scan head streams profile data from.
pub const DATA_PORT: u16 = 12348;

/// TCP port used by the legacy firmware update service.
pub const UPDATE_PORT_LEGACY: u16 = 21231;

/// TCP port used by the current firmware update service.
pub const UPDATE_PORT: u16 = 21232;

/// UDP port ScanSync encoder beacons arrive on.
pub const SCANSYNC_PORT: u16 = 11234;

/// UDP source port ScanSync units emit beacons from.
pub const SCANSYNC_ORIGIN_PORT: u16 = 62510;

/// Kernel receive buffer requested for each data socket.
pub const DATA_RECV_BUFFER_BYTES: usize = 256 * 1024 * 1024;

/// Window discovery waits for replies after each probe.
pub const DISCOVERY_REPLY_WINDOW_MS: u64 = 200;

// =============================================================================
// Protocol timing
// =============================================================================

/// Interval between heartbeat requests on firmware that supports them.
pub const HEARTBEAT_INTERVAL_MS: u64 = 250;

/// Socket send/recv deadline for heartbeat exchanges. A miss marks the
/// session lost.
pub const HEARTBEAT_TIMEOUT_MS: u64 = 2200;

/// Interval between keep-alive messages while scanning on older firmware.
/// The server stops scanning after 3 s without one.
pub const KEEPALIVE_INTERVAL_MS: u64 = 1000;

/// Extra time added ahead of the first phase so the camera can begin its
/// exposure before the laser fires.
pub const CAMERA_START_EARLY_OFFSET_NS: u64 = 9500;

/// Sensor row readout time.
pub const ROW_TIME_NS: u64 = 3210;

/// Rows of readout overhead per frame.
pub const OVERHEAD_ROWS: u64 = 42;

/// Safety margin rows added on top of the readout overhead.
pub const SAFETY_MARGIN_ROWS: u64 = 3;

/// Minimum gap between consecutive exposures of one camera:
/// `ROW_TIME_NS * (4 + OVERHEAD_ROWS + SAFETY_MARGIN_ROWS)`.
pub const FRAME_OVERHEAD_TIME_NS: u64 = ROW_TIME_NS * (4 + OVERHEAD_ROWS + SAFETY_MARGIN_ROWS);

/// Throughput floor: no element may be scheduled more often than this.
pub const MIN_SCAN_PERIOD_PER_ELEMENT_US: u64 = 250;

/// Offset added to the newest ScanSync timestamp when selecting a
/// coordinated start time, keeping the start safely in the future across
/// firmware clock rollover.
pub const SCANSYNC_START_OFFSET_NS: u64 = 22_000_000;

// =============================================================================
// Sensor geometry and queue sizing
// =============================================================================

/// Maximum samples per profile (one per sensor column).
pub const MAX_COLUMNS: usize = 1456;

/// Sensor width in pixels.
pub const SENSOR_WIDTH: usize = 1456;

/// Sensor height in pixels.
pub const SENSOR_HEIGHT: usize = 1088;

/// Encoders a scan head can report per profile.
pub const MAX_ENCODERS: usize = 3;

/// Default capacity of the profile queue and of each frame slot FIFO.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Slot depth at which the frame assembler force-takes a frame to avoid
/// falling behind a stalled peer.
pub const FRAME_TAKE_THRESHOLD: usize = 50;

// =============================================================================
// Versioning
// =============================================================================

/// Semantic version triple used for both the client API and device firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    /// Major version; compatibility requires equality.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch version.
    pub patch: u32,
}

impl Version {
    /// Shorthand constructor.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// A device is API-compatible iff its major version equals the client's.
    pub fn is_compatible_with_api(&self) -> bool {
        self.major == API_VERSION.major
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Version of the client API implemented by this crate.
pub const API_VERSION: Version = Version::new(16, 3, 0);

/// Oldest firmware that answers heartbeat requests. Older firmware falls
/// back to keep-alive messages while scanning.
pub const HEARTBEAT_MIN_VERSION: Version = Version::new(16, 3, 0);

// =============================================================================
// Product catalog
// =============================================================================

/// Scan head models understood by this client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductType {
    /// Unrecognized product id in a discovery reply.
    Unknown,
    /// Single camera, single laser, camera-driven scheduling.
    Vx100,
    /// Two cameras sharing one laser, camera-driven scheduling.
    Vx200,
    /// Two cameras, six lasers, laser-driven scheduling.
    Vx600,
}

impl ProductType {
    /// Decode the wire product id from a discovery reply.
    pub fn from_wire(id: u16) -> Self {
        match id {
            1 => ProductType::Vx100,
            2 => ProductType::Vx200,
            3 => ProductType::Vx600,
            _ => ProductType::Unknown,
        }
    }

    /// Wire product id for this model.
    pub fn to_wire(self) -> u16 {
        match self {
            ProductType::Unknown => 0,
            ProductType::Vx100 => 1,
            ProductType::Vx200 => 2,
            ProductType::Vx600 => 3,
        }
    }

    /// Capability limits for this model.
    pub fn spec(self) -> &'static ScanHeadSpec {
        match self {
            ProductType::Vx100 | ProductType::Unknown => &VX100_SPEC,
            ProductType::Vx200 => &VX200_SPEC,
            ProductType::Vx600 => &VX600_SPEC,
        }
    }
}

/// Which port kind drives the phase table for a product.
///
/// Camera-driven heads enumerate exposures by camera port; laser-driven heads
/// enumerate by laser port. Phase elements must be added with the matching
/// variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrivePrimary {
    /// Exposures are keyed by camera port.
    Camera,
    /// Exposures are keyed by laser port.
    Laser,
}

/// Fixed capability limits of a scan head model.
#[derive(Clone, Debug)]
pub struct ScanHeadSpec {
    /// Number of camera ports.
    pub num_cameras: u32,
    /// Number of laser ports.
    pub num_lasers: u32,
    /// Port kind the phase table is keyed by.
    pub primary: DrivePrimary,
    /// Times one head may appear across the whole phase table.
    pub max_configuration_groups: u32,
    /// Shortest supported scan period.
    pub min_scan_period_us: u32,
    /// Longest supported scan period.
    pub max_scan_period_us: u32,
    /// Laser-on time limits.
    pub min_laser_on_time_us: u32,
    /// Longest permitted laser-on time.
    pub max_laser_on_time_us: u32,
    /// Shortest permitted camera exposure.
    pub min_exposure_time_us: u32,
    /// Longest permitted camera exposure.
    pub max_exposure_time_us: u32,
}

/// Limits for the Vx100.
pub static VX100_SPEC: ScanHeadSpec = ScanHeadSpec {
    num_cameras: 1,
    num_lasers: 1,
    primary: DrivePrimary::Camera,
    max_configuration_groups: 4,
    min_scan_period_us: 200,
    max_scan_period_us: 5_000_000,
    min_laser_on_time_us: 15,
    max_laser_on_time_us: 650_000,
    min_exposure_time_us: 15,
    max_exposure_time_us: 2_000_000,
};

/// Limits for the Vx200.
pub static VX200_SPEC: ScanHeadSpec = ScanHeadSpec {
    num_cameras: 2,
    num_lasers: 1,
    primary: DrivePrimary::Camera,
    max_configuration_groups: 8,
    min_scan_period_us: 200,
    max_scan_period_us: 5_000_000,
    min_laser_on_time_us: 15,
    max_laser_on_time_us: 650_000,
    min_exposure_time_us: 15,
    max_exposure_time_us: 2_000_000,
};

/// Limits for the Vx600.
pub static VX600_SPEC: ScanHeadSpec = ScanHeadSpec {
    num_cameras: 2,
    num_lasers: 6,
    primary: DrivePrimary::Laser,
    max_configuration_groups: 12,
    min_scan_period_us: 200,
    max_scan_period_us: 5_000_000,
    min_laser_on_time_us: 15,
    max_laser_on_time_us: 650_000,
    min_exposure_time_us: 15,
    max_exposure_time_us: 2_000_000,
};

// =============================================================================
// Per-head configuration
// =============================================================================

/// Exposure and detection settings for one scan head.
///
/// Values are validated against the owning product's [`ScanHeadSpec`] when
/// applied via `ScanHead::set_configuration`. The same record doubles as the
/// phase-element override type; `None` optionals inherit the head defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanHeadConfiguration {
    /// Lower bound the auto-exposure may choose for laser-on time.
    pub min_laser_on_time_us: u32,
    /// Starting laser-on time.
    pub default_laser_on_time_us: u32,
    /// Upper bound the auto-exposure may choose for laser-on time.
    pub max_laser_on_time_us: u32,
    /// Lower bound the auto-exposure may choose for camera exposure.
    pub min_exposure_time_us: u32,
    /// Starting camera exposure.
    pub default_exposure_time_us: u32,
    /// Upper bound the auto-exposure may choose for camera exposure.
    pub max_exposure_time_us: u32,
    /// Minimum brightness for a pixel to count as laser signal.
    pub laser_detection_threshold: u32,
    /// Brightness at which a pixel counts as saturated.
    pub saturation_threshold: u32,
    /// Percentage of saturated pixels tolerated in an exposure.
    pub saturation_percentage: u32,
    /// Scan period used while idling between scan windows, if any.
    pub idle_scan_period_us: Option<u32>,
    /// Encoder ticks that must elapse before a new profile is triggered.
    pub minimum_encoder_travel: Option<u32>,
    /// Strobe duration for elements that flash instead of lasing. A phase
    /// element whose effective configuration sets this is scheduled by
    /// strobe duration and bypasses the min-scan-period check.
    pub strobe_duration_us: Option<u32>,
}

impl Default for ScanHeadConfiguration {
    fn default() -> Self {
        Self {
            min_laser_on_time_us: 100,
            default_laser_on_time_us: 500,
            max_laser_on_time_us: 1000,
            min_exposure_time_us: 10_000,
            default_exposure_time_us: 500_000,
            max_exposure_time_us: 1_000_000,
            laser_detection_threshold: 120,
            saturation_threshold: 800,
            saturation_percentage: 30,
            idle_scan_period_us: None,
            minimum_encoder_travel: None,
            strobe_duration_us: None,
        }
    }
}

impl ScanHeadConfiguration {
    /// Validate this configuration against a product's limits.
    pub fn validate(&self, spec: &ScanHeadSpec) -> ScanResult<()> {
        let laser = [
            self.min_laser_on_time_us,
            self.default_laser_on_time_us,
            self.max_laser_on_time_us,
        ];
        for v in laser {
            if v < spec.min_laser_on_time_us || v > spec.max_laser_on_time_us {
                return Err(ScanError::OutOfRange(
                    "laser on time",
                    format!(
                        "{v} us not in [{}, {}]",
                        spec.min_laser_on_time_us, spec.max_laser_on_time_us
                    ),
                ));
            }
        }
        if !(self.min_laser_on_time_us <= self.default_laser_on_time_us
            && self.default_laser_on_time_us <= self.max_laser_on_time_us)
        {
            return Err(ScanError::OutOfRange(
                "laser on time",
                "min <= default <= max ordering violated".to_string(),
            ));
        }

        let exposure = [
            self.min_exposure_time_us,
            self.default_exposure_time_us,
            self.max_exposure_time_us,
        ];
        for v in exposure {
            if v < spec.min_exposure_time_us || v > spec.max_exposure_time_us {
                return Err(ScanError::OutOfRange(
                    "exposure time",
                    format!(
                        "{v} us not in [{}, {}]",
                        spec.min_exposure_time_us, spec.max_exposure_time_us
                    ),
                ));
            }
        }
        if !(self.min_exposure_time_us <= self.default_exposure_time_us
            && self.default_exposure_time_us <= self.max_exposure_time_us)
        {
            return Err(ScanError::OutOfRange(
                "exposure time",
                "min <= default <= max ordering violated".to_string(),
            ));
        }

        if self.saturation_percentage > 100 {
            return Err(ScanError::OutOfRange(
                "saturation percentage",
                format!("{} > 100", self.saturation_percentage),
            ));
        }
        Ok(())
    }
}
