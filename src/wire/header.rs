//! Data packet header parsing and fragment layout.
//!
//! Every profile datagram starts with a fixed 40-byte header followed by a
//! variable tail, all big-endian:
//!
//! ```text
//! offset  size  field
//!  0      2     magic = 0xFACD
//!  2      2     exposure_time_us
//!  4      1     scan_head_id
//!  5      1     camera_port
//!  6      1     laser_port
//!  7      1     flags
//!  8      8     timestamp_ns
//! 16      2     laser_on_time_us
//! 18      2     data_type (bitset)
//! 20      2     data_length
//! 22      1     number_encoders
//! 23      1     <reserved>
//! 24      4     datagram_position
//! 28      4     number_datagrams
//! 32      2     start_column
//! 34      2     end_column
//! 36      4     sequence_number
//! 40      2*P   step[0..P], P = popcount(data_type)
//! ...     8*E   encoder_values[0..E], E = number_encoders
//! ...     ...   content payloads in canonical data-type order
//! ```
//!
//! A profile wider than one datagram is split across `number_datagrams`
//! fragments. Sample `k` of a fragment lands at column index
//! `(datagram_position + k * number_datagrams) * step`, which interleaves the
//! fragments evenly; the division remainder goes to the lowest-positioned
//! datagrams so the split is deterministic.

use crate::error::{ScanError, ScanResult};
use crate::wire::codec::ByteReader;

/// First u16 of every profile datagram.
pub const PACKET_MAGIC: u16 = 0xFACD;

/// Fixed-width portion of the header, through `sequence_number`.
pub const FIXED_HEADER_SIZE: usize = 40;

/// One content type carried in a datagram.
///
/// The discriminant is the bit used in the header's `data_type` field;
/// canonical iteration order is low bit first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContentType {
    /// Interleaved X/Y sample pairs, two i16 each.
    Xy = 1 << 0,
    /// One brightness byte per sample.
    Brightness = 1 << 1,
    /// Subpixel row positions, one i16 per sample, fixed-point 1/32 pixel.
    Subpixel = 1 << 2,
}

impl ContentType {
    /// All content types in canonical (low bit first) order.
    pub const ALL: [ContentType; 3] = [
        ContentType::Xy,
        ContentType::Brightness,
        ContentType::Subpixel,
    ];

    /// Wire size of one sample of this type.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            ContentType::Xy => 4,
            ContentType::Brightness => 1,
            ContentType::Subpixel => 2,
        }
    }
}

/// Bitset of [`ContentType`]s present in a datagram.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataTypeSet(pub u16);

impl DataTypeSet {
    /// Empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// True if `ty` is present.
    pub fn contains(self, ty: ContentType) -> bool {
        self.0 & ty as u16 != 0
    }

    /// Set `ty`.
    pub fn insert(&mut self, ty: ContentType) {
        self.0 |= ty as u16;
    }

    /// Number of content types present.
    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Content types present, low bit first.
    pub fn iter(self) -> impl Iterator<Item = ContentType> {
        ContentType::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

/// Where one content type's samples live inside a datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentLayout {
    /// Content type this layout describes.
    pub content: ContentType,
    /// Column stride between consecutive samples.
    pub step: usize,
    /// Samples carried by this datagram.
    pub num_vals: usize,
    /// Bytes of payload for this content type.
    pub payload_size: usize,
    /// Byte offset of the payload from the start of the datagram.
    pub offset: usize,
}

/// Parsed datagram header plus per-content fragment layouts.
#[derive(Clone, Debug)]
pub struct PacketHeader {
    /// Camera exposure used for this profile.
    pub exposure_time_us: u16,
    /// Id of the emitting scan head.
    pub scan_head_id: u8,
    /// Camera port of the exposure.
    pub camera_port: u8,
    /// Laser port of the exposure.
    pub laser_port: u8,
    /// Raw header flags.
    pub flags: u8,
    /// Server-clock timestamp of the exposure.
    pub timestamp_ns: u64,
    /// Laser-on time used for this profile.
    pub laser_on_time_us: u16,
    /// Content types present.
    pub data_type: DataTypeSet,
    /// Payload byte count as declared by the server.
    pub data_length: u16,
    /// Encoder values appended to the header.
    pub encoder_values: Vec<i64>,
    /// Index of this fragment within the profile.
    pub datagram_position: u32,
    /// Total fragments in the profile.
    pub number_datagrams: u32,
    /// First pixel column of the scan window, inclusive.
    pub start_column: u16,
    /// Last pixel column of the scan window, inclusive.
    pub end_column: u16,
    /// Server-assigned profile sequence number.
    pub sequence_number: u32,
    /// Per-content layouts in canonical order.
    pub layouts: Vec<FragmentLayout>,
}

impl PacketHeader {
    /// Columns spanned by the profile before striding.
    pub fn num_columns(&self) -> usize {
        self.end_column as usize - self.start_column as usize + 1
    }

    /// Source key for fragment grouping:
    /// `scan_head_id << 3 | camera_port << 2 | laser_port`.
    pub fn source(&self) -> u32 {
        (self.scan_head_id as u32) << 3
            | (self.camera_port as u32) << 2
            | self.laser_port as u32
    }

    /// Parse a datagram header.
    ///
    /// Returns the header and the offset just past the last content payload,
    /// which is the datagram's expected total length. Fails with `BadMagic`
    /// if the first u16 is wrong and `Truncated` if any field runs past the
    /// end of the buffer.
    pub fn parse(buf: &[u8]) -> ScanResult<(Self, usize)> {
        let mut r = ByteReader::new(buf);

        let magic = r.read_u16()?;
        if magic != PACKET_MAGIC {
            return Err(ScanError::BadMagic(magic));
        }

        let exposure_time_us = r.read_u16()?;
        let scan_head_id = r.read_u8()?;
        let camera_port = r.read_u8()?;
        let laser_port = r.read_u8()?;
        let flags = r.read_u8()?;
        let timestamp_ns = r.read_u64()?;
        let laser_on_time_us = r.read_u16()?;
        let data_type = DataTypeSet(r.read_u16()?);
        let data_length = r.read_u16()?;
        let number_encoders = r.read_u8()?;
        r.skip(1)?; // reserved
        let datagram_position = r.read_u32()?;
        let number_datagrams = r.read_u32()?;
        let start_column = r.read_u16()?;
        let end_column = r.read_u16()?;
        let sequence_number = r.read_u32()?;

        if number_datagrams == 0 || datagram_position >= number_datagrams {
            return Err(ScanError::OutOfRange(
                "datagram position",
                format!("{datagram_position} of {number_datagrams}"),
            ));
        }
        if end_column < start_column {
            return Err(ScanError::OutOfRange(
                "column range",
                format!("start {start_column} > end {end_column}"),
            ));
        }

        let mut steps = Vec::with_capacity(data_type.count());
        for _ in 0..data_type.count() {
            steps.push(r.read_u16()? as usize);
        }

        let mut encoder_values = Vec::with_capacity(number_encoders as usize);
        for _ in 0..number_encoders {
            encoder_values.push(r.read_i64()?);
        }

        let num_columns = end_column as usize - start_column as usize + 1;
        let mut offset = r.offset();
        let mut layouts = Vec::with_capacity(data_type.count());
        for (content, step) in data_type.iter().zip(steps) {
            if step == 0 {
                return Err(ScanError::OutOfRange("step", "0".to_string()));
            }
            let layout = fragment_layout(
                content,
                num_columns,
                step,
                datagram_position as usize,
                number_datagrams as usize,
                offset,
            );
            offset += layout.payload_size;
            layouts.push(layout);
        }

        let header = Self {
            exposure_time_us,
            scan_head_id,
            camera_port,
            laser_port,
            flags,
            timestamp_ns,
            laser_on_time_us,
            data_type,
            data_length,
            encoder_values,
            datagram_position,
            number_datagrams,
            start_column,
            end_column,
            sequence_number,
            layouts,
        };
        Ok((header, offset))
    }
}

/// Compute one content type's fragment layout.
///
/// The strided column count `num_columns / step` is split across
/// `number_datagrams` fragments; the first `(num_columns / step) %
/// number_datagrams` fragments each carry one extra sample.
fn fragment_layout(
    content: ContentType,
    num_columns: usize,
    step: usize,
    datagram_position: usize,
    number_datagrams: usize,
    offset: usize,
) -> FragmentLayout {
    let total = num_columns / step;
    let base = total / number_datagrams;
    let remainder = total % number_datagrams;
    let num_vals = base + usize::from(datagram_position < remainder);
    FragmentLayout {
        content,
        step,
        num_vals,
        payload_size: num_vals * content.bytes_per_sample(),
        offset,
    }
}
