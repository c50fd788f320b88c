//! Profile data model: the laser-line cross-section delivered to consumers.
//!
//! A profile is immutable once the assembler completes it. Sample arrays are
//! sized by the negotiated [`DataFormat`]; columns the sensor did not report
//! carry the public invalid sentinels (NaN for X/Y, 0 for brightness). The
//! wire-side sentinels (`i16::MIN` for X/Y, `i16::MAX` for subpixel) never
//! escape this module.

use serde::{Deserialize, Serialize};

use crate::wire::header::{ContentType, DataTypeSet};

/// Wire sentinel for an invalid X or Y sample.
pub const INVALID_XY_WIRE: i16 = i16::MIN;

/// Wire sentinel for an invalid subpixel sample.
pub const INVALID_SUBPIXEL_WIRE: i16 = i16::MAX;

/// Fixed-point denominator of wire subpixel rows.
pub const SUBPIXEL_SCALE: f32 = 32.0;

/// An unordered camera/laser port pair describing one physical exposure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CameraLaserPair {
    /// Camera port of the exposure.
    pub camera: u32,
    /// Laser port of the exposure.
    pub laser: u32,
}

impl CameraLaserPair {
    /// Shorthand constructor.
    pub const fn new(camera: u32, laser: u32) -> Self {
        Self { camera, laser }
    }
}

/// Pack a profile source into the composite key
/// `scan_head_id << 3 | camera << 2 | laser`.
pub fn source_key(scan_head_id: u32, camera: u32, laser: u32) -> u32 {
    scan_head_id << 3 | camera << 2 | laser
}

/// Sample content negotiated for a scan.
///
/// `Half`/`Quarter` sample every second/fourth column. Subpixel formats
/// deliver raw sensor row coordinates instead of mill-space X/Y.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFormat {
    /// X/Y and brightness at every column.
    XyBrightnessFull,
    /// X/Y and brightness at every second column.
    XyBrightnessHalf,
    /// X/Y and brightness at every fourth column.
    XyBrightnessQuarter,
    /// X/Y at every column.
    XyFull,
    /// X/Y at every second column.
    XyHalf,
    /// X/Y at every fourth column.
    XyQuarter,
    /// Subpixel rows at every column.
    Subpixel,
    /// Subpixel rows and brightness at every column.
    SubpixelBrightnessFull,
}

impl DataFormat {
    /// Column stride implied by the format.
    pub fn stride(self) -> usize {
        match self {
            DataFormat::XyBrightnessFull
            | DataFormat::XyFull
            | DataFormat::Subpixel
            | DataFormat::SubpixelBrightnessFull => 1,
            DataFormat::XyBrightnessHalf | DataFormat::XyHalf => 2,
            DataFormat::XyBrightnessQuarter | DataFormat::XyQuarter => 4,
        }
    }

    /// Content types a scan in this format carries.
    pub fn content_types(self) -> DataTypeSet {
        let mut set = DataTypeSet::empty();
        match self {
            DataFormat::XyBrightnessFull
            | DataFormat::XyBrightnessHalf
            | DataFormat::XyBrightnessQuarter => {
                set.insert(ContentType::Xy);
                set.insert(ContentType::Brightness);
            }
            DataFormat::XyFull | DataFormat::XyHalf | DataFormat::XyQuarter => {
                set.insert(ContentType::Xy);
            }
            DataFormat::Subpixel => {
                set.insert(ContentType::Subpixel);
            }
            DataFormat::SubpixelBrightnessFull => {
                set.insert(ContentType::Subpixel);
                set.insert(ContentType::Brightness);
            }
        }
        set
    }

    /// Wire id of this format.
    pub fn to_wire(self) -> u16 {
        match self {
            DataFormat::XyBrightnessFull => 0,
            DataFormat::XyBrightnessHalf => 1,
            DataFormat::XyBrightnessQuarter => 2,
            DataFormat::XyFull => 3,
            DataFormat::XyHalf => 4,
            DataFormat::XyQuarter => 5,
            DataFormat::Subpixel => 6,
            DataFormat::SubpixelBrightnessFull => 7,
        }
    }

    /// Decode a wire format id.
    pub fn from_wire(id: u16) -> Option<Self> {
        Some(match id {
            0 => DataFormat::XyBrightnessFull,
            1 => DataFormat::XyBrightnessHalf,
            2 => DataFormat::XyBrightnessQuarter,
            3 => DataFormat::XyFull,
            4 => DataFormat::XyHalf,
            5 => DataFormat::XyQuarter,
            6 => DataFormat::Subpixel,
            7 => DataFormat::SubpixelBrightnessFull,
            _ => return None,
        })
    }
}

/// One sample of a completed profile.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProfilePoint {
    /// Mill-space X, NaN when the column reported nothing.
    pub x: f32,
    /// Mill-space Y, NaN when the column reported nothing.
    pub y: f32,
    /// Brightness, 0 when absent from the format.
    pub brightness: u8,
}

impl ProfilePoint {
    /// The public invalid sample.
    pub const INVALID: ProfilePoint = ProfilePoint {
        x: f32::NAN,
        y: f32::NAN,
        brightness: 0,
    };

    /// True when the column carried a real measurement.
    pub fn is_valid(&self) -> bool {
        !self.x.is_nan()
    }
}

/// One laser-line cross-section from one exposure.
#[derive(Clone, Debug)]
pub struct Profile {
    /// Id of the emitting scan head.
    pub scan_head_id: u32,
    /// Camera port of the exposure.
    pub camera_port: u32,
    /// Laser port of the exposure.
    pub laser_port: u32,
    /// Server-clock timestamp of the exposure.
    pub timestamp_ns: u64,
    /// Server-assigned sequence number, monotonic per scan session.
    pub sequence: u32,
    /// Encoder tick counts sampled with the exposure.
    pub encoder_values: Vec<i64>,
    /// Laser-on time used.
    pub laser_on_time_us: u32,
    /// Camera exposure used.
    pub exposure_time_us: u32,
    /// First reported pixel column, inclusive.
    pub start_column: u16,
    /// Last reported pixel column, inclusive.
    pub end_column: u16,
    /// Format the scan was negotiated with.
    pub data_format: DataFormat,
    /// X/Y/brightness samples; length is the pre-stride column span.
    pub points: Vec<ProfilePoint>,
    /// Subpixel row coordinates when the format delivers them, NaN when
    /// invalid. Empty for X/Y formats.
    pub subpixel_rows: Vec<f32>,
    /// True when every fragment of the profile arrived.
    pub complete: bool,
}

impl Profile {
    /// Composite source key of this profile.
    pub fn source(&self) -> u32 {
        source_key(self.scan_head_id, self.camera_port, self.laser_port)
    }

    /// The camera/laser pair that produced this profile.
    pub fn pair(&self) -> CameraLaserPair {
        CameraLaserPair::new(self.camera_port, self.laser_port)
    }

    /// Count of columns that carried a real measurement.
    pub fn valid_points(&self) -> usize {
        self.points.iter().filter(|p| p.is_valid()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_key_packing() {
        assert_eq!(source_key(0, 0, 0), 0);
        assert_eq!(source_key(1, 0, 1), 0b1001);
        assert_eq!(source_key(5, 1, 0), 5 << 3 | 1 << 2);
    }

    #[test]
    fn test_stride_by_format() {
        assert_eq!(DataFormat::XyBrightnessFull.stride(), 1);
        assert_eq!(DataFormat::XyHalf.stride(), 2);
        assert_eq!(DataFormat::XyBrightnessQuarter.stride(), 4);
    }

    #[test]
    fn test_format_wire_roundtrip() {
        for id in 0..8 {
            let format = DataFormat::from_wire(id).unwrap();
            assert_eq!(format.to_wire(), id);
        }
        assert!(DataFormat::from_wire(99).is_none());
    }

    #[test]
    fn test_invalid_point_is_nan() {
        assert!(!ProfilePoint::INVALID.is_valid());
        assert!(ProfilePoint::INVALID.x.is_nan());
        assert_eq!(ProfilePoint::INVALID.brightness, 0);
    }
}
