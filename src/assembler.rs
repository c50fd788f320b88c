//! Fragment-to-profile reassembly.
//!
//! One [`PacketAssembler`] exists per scan-head session. Datagrams carrying
//! the same `(source, timestamp_ns)` belong to one profile; the assembler
//! scatter-copies each fragment's samples into the destination arrays and
//! signals completion once all `number_datagrams` fragments arrive.
//!
//! Malformed packets are counted and dropped without surfacing an error:
//! a single corrupt datagram on a busy data stream must not abort the scan.
//! A change of source or timestamp while a profile is still open queues the
//! partial profile (flagged incomplete) and starts a new one.

use tracing::debug;

use crate::error::ScanError;
use crate::profile::{
    DataFormat, Profile, ProfilePoint, INVALID_SUBPIXEL_WIRE, INVALID_XY_WIRE, SUBPIXEL_SCALE,
};
use crate::wire::header::{ContentType, PacketHeader};

/// Per-session fragment reassembler.
#[derive(Debug)]
pub struct PacketAssembler {
    data_format: DataFormat,
    current: Option<InProgress>,
    bad_packets: u64,
    incomplete_profiles: u64,
}

/// Profile under construction, raw wire values.
#[derive(Debug)]
struct InProgress {
    source: u32,
    timestamp_ns: u64,
    scan_head_id: u32,
    camera_port: u32,
    laser_port: u32,
    sequence: u32,
    laser_on_time_us: u32,
    exposure_time_us: u32,
    start_column: u16,
    end_column: u16,
    encoder_values: Vec<i64>,
    xs: Vec<i16>,
    ys: Vec<i16>,
    brightness: Vec<u8>,
    subpixel: Vec<i16>,
    received: Vec<bool>,
    received_count: u32,
    number_datagrams: u32,
}

impl InProgress {
    fn new(header: &PacketHeader) -> Self {
        let columns = header.num_columns();
        Self {
            source: header.source(),
            timestamp_ns: header.timestamp_ns,
            scan_head_id: header.scan_head_id as u32,
            camera_port: header.camera_port as u32,
            laser_port: header.laser_port as u32,
            sequence: header.sequence_number,
            laser_on_time_us: header.laser_on_time_us as u32,
            exposure_time_us: header.exposure_time_us as u32,
            start_column: header.start_column,
            end_column: header.end_column,
            encoder_values: header.encoder_values.clone(),
            xs: vec![INVALID_XY_WIRE; columns],
            ys: vec![INVALID_XY_WIRE; columns],
            brightness: vec![0; columns],
            subpixel: vec![INVALID_SUBPIXEL_WIRE; columns],
            received: vec![false; header.number_datagrams as usize],
            received_count: 0,
            number_datagrams: header.number_datagrams,
        }
    }

    fn matches(&self, header: &PacketHeader) -> bool {
        self.source == header.source() && self.timestamp_ns == header.timestamp_ns
    }

    fn scatter(&mut self, header: &PacketHeader, datagram: &[u8]) {
        let position = header.datagram_position as usize;
        let n = header.number_datagrams as usize;
        for layout in &header.layouts {
            let payload = &datagram[layout.offset..layout.offset + layout.payload_size];
            for k in 0..layout.num_vals {
                let idx = (position + k * n) * layout.step;
                match layout.content {
                    ContentType::Xy => {
                        let at = k * 4;
                        self.xs[idx] =
                            i16::from_be_bytes([payload[at], payload[at + 1]]);
                        self.ys[idx] =
                            i16::from_be_bytes([payload[at + 2], payload[at + 3]]);
                    }
                    ContentType::Brightness => {
                        self.brightness[idx] = payload[k];
                    }
                    ContentType::Subpixel => {
                        let at = k * 2;
                        self.subpixel[idx] =
                            i16::from_be_bytes([payload[at], payload[at + 1]]);
                    }
                }
            }
        }
        if !self.received[position] {
            self.received[position] = true;
            self.received_count += 1;
        }
    }

    fn is_complete(&self) -> bool {
        self.received_count == self.number_datagrams
    }

    /// Convert wire values to the public profile, mapping sentinels.
    fn finalize(self, data_format: DataFormat, complete: bool) -> Profile {
        let carries_subpixel = matches!(
            data_format,
            DataFormat::Subpixel | DataFormat::SubpixelBrightnessFull
        );
        let points = self
            .xs
            .iter()
            .zip(&self.ys)
            .zip(&self.brightness)
            .map(|((&x, &y), &b)| {
                if x == INVALID_XY_WIRE || y == INVALID_XY_WIRE {
                    ProfilePoint {
                        brightness: b,
                        ..ProfilePoint::INVALID
                    }
                } else {
                    ProfilePoint {
                        x: x as f32,
                        y: y as f32,
                        brightness: b,
                    }
                }
            })
            .collect();
        let subpixel_rows = if carries_subpixel {
            self.subpixel
                .iter()
                .map(|&s| {
                    if s == INVALID_SUBPIXEL_WIRE {
                        f32::NAN
                    } else {
                        s as f32 / SUBPIXEL_SCALE
                    }
                })
                .collect()
        } else {
            Vec::new()
        };
        Profile {
            scan_head_id: self.scan_head_id,
            camera_port: self.camera_port,
            laser_port: self.laser_port,
            timestamp_ns: self.timestamp_ns,
            sequence: self.sequence,
            encoder_values: self.encoder_values,
            laser_on_time_us: self.laser_on_time_us,
            exposure_time_us: self.exposure_time_us,
            start_column: self.start_column,
            end_column: self.end_column,
            data_format,
            points,
            subpixel_rows,
            complete,
        }
    }
}

impl PacketAssembler {
    /// Fresh assembler for a scan negotiated with `data_format`.
    pub fn new(data_format: DataFormat) -> Self {
        Self {
            data_format,
            current: None,
            bad_packets: 0,
            incomplete_profiles: 0,
        }
    }

    /// Datagrams dropped for failing to parse.
    pub fn bad_packets(&self) -> u64 {
        self.bad_packets
    }

    /// Profiles queued before all of their fragments arrived.
    pub fn incomplete_profiles(&self) -> u64 {
        self.incomplete_profiles
    }

    /// Feed one datagram; completed (or displaced-incomplete) profiles are
    /// appended to `out`.
    ///
    /// Malformed datagrams increment `bad_packets` and are otherwise
    /// ignored. A partial profile still open when the session tears down is
    /// discarded with the assembler.
    pub fn accept(&mut self, datagram: &[u8], out: &mut Vec<Profile>) {
        let (header, expected_len) = match PacketHeader::parse(datagram) {
            Ok(parsed) => parsed,
            Err(ScanError::BadMagic(magic)) => {
                self.bad_packets += 1;
                debug!("dropping datagram with bad magic 0x{magic:04X}");
                return;
            }
            Err(err) => {
                self.bad_packets += 1;
                debug!(%err, "dropping malformed datagram");
                return;
            }
        };
        if datagram.len() < expected_len {
            self.bad_packets += 1;
            debug!(
                expected = expected_len,
                actual = datagram.len(),
                "dropping short datagram"
            );
            return;
        }

        let continues_current = self
            .current
            .as_ref()
            .is_some_and(|current| current.matches(&header));
        if !continues_current {
            // A new exposure began before the open one finished; queue what
            // we have and move on.
            if let Some(stale) = self.current.take() {
                self.incomplete_profiles += 1;
                out.push(stale.finalize(self.data_format, false));
            }
            self.current = Some(InProgress::new(&header));
        }

        let current = match self.current.as_mut() {
            Some(current) => current,
            None => return,
        };
        current.scatter(&header, datagram);
        if current.is_complete() {
            if let Some(done) = self.current.take() {
                out.push(done.finalize(self.data_format, true));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::codec::ByteWriter;
    use crate::wire::header::{DataTypeSet, PACKET_MAGIC};

    struct DatagramSpec {
        timestamp_ns: u64,
        position: u32,
        total: u32,
        start_column: u16,
        end_column: u16,
        step: u16,
        with_brightness: bool,
    }

    /// Build a datagram whose X samples equal their column index and whose
    /// brightness equals the low byte of the column index.
    fn build_datagram(spec: &DatagramSpec) -> Vec<u8> {
        let mut set = DataTypeSet::empty();
        set.insert(ContentType::Xy);
        if spec.with_brightness {
            set.insert(ContentType::Brightness);
        }

        let mut w = ByteWriter::new();
        w.write_u16(PACKET_MAGIC);
        w.write_u16(300); // exposure_time_us
        w.write_u8(2); // scan_head_id
        w.write_u8(0); // camera_port
        w.write_u8(0); // laser_port
        w.write_u8(0); // flags
        w.write_u64(spec.timestamp_ns);
        w.write_u16(120); // laser_on_time_us
        w.write_u16(set.0);
        w.write_u16(0); // data_length
        w.write_u8(2); // number_encoders
        w.write_u8(0); // reserved
        w.write_u32(spec.position);
        w.write_u32(spec.total);
        w.write_u16(spec.start_column);
        w.write_u16(spec.end_column);
        w.write_u32(9); // sequence_number
        w.write_u16(spec.step);
        if spec.with_brightness {
            w.write_u16(spec.step);
        }
        w.write_i64(1000);
        w.write_i64(-2);

        let columns = (spec.end_column - spec.start_column + 1) as usize;
        let total_vals = columns / spec.step as usize;
        let base = total_vals / spec.total as usize;
        let remainder = total_vals % spec.total as usize;
        let num_vals = base + usize::from((spec.position as usize) < remainder);

        for k in 0..num_vals {
            let col = (spec.position as usize + k * spec.total as usize) * spec.step as usize;
            w.write_i16(col as i16);
            w.write_i16(-(col as i16));
        }
        if spec.with_brightness {
            for k in 0..num_vals {
                let col = (spec.position as usize + k * spec.total as usize) * spec.step as usize;
                w.write_u8(col as u8);
            }
        }
        w.into_vec()
    }

    #[test]
    fn test_single_datagram_full_profile() {
        let mut assembler = PacketAssembler::new(DataFormat::XyBrightnessFull);
        let mut out = Vec::new();
        let datagram = build_datagram(&DatagramSpec {
            timestamp_ns: 42,
            position: 0,
            total: 1,
            start_column: 0,
            end_column: 1455,
            step: 1,
            with_brightness: true,
        });
        assembler.accept(&datagram, &mut out);

        assert_eq!(out.len(), 1);
        let profile = &out[0];
        assert!(profile.complete);
        assert_eq!(profile.points.len(), 1456);
        assert_eq!(profile.valid_points(), 1456);
        assert_eq!(profile.points[100].x, 100.0);
        assert_eq!(profile.points[100].y, -100.0);
        assert_eq!(profile.points[100].brightness, 100);
        assert_eq!(profile.encoder_values, vec![1000, -2]);
        assert_eq!(profile.sequence, 9);
    }

    #[test]
    fn test_four_fragments_any_interleaving() {
        let order = [2u32, 0, 3, 1];
        let mut assembler = PacketAssembler::new(DataFormat::XyBrightnessHalf);
        let mut out = Vec::new();
        for position in order {
            assembler.accept(
                &build_datagram(&DatagramSpec {
                    timestamp_ns: 7,
                    position,
                    total: 4,
                    start_column: 0,
                    end_column: 1455,
                    step: 2,
                    with_brightness: true,
                }),
                &mut out,
            );
        }
        assert_eq!(out.len(), 1);
        let profile = &out[0];
        assert!(profile.complete);
        // 728 strided samples across 4 fragments, even columns populated.
        assert_eq!(profile.valid_points(), 728);
        assert_eq!(profile.points[4].x, 4.0);
        assert!(!profile.points[5].is_valid());
        assert!(profile.points[5].x.is_nan());
    }

    #[test]
    fn test_timestamp_change_queues_incomplete() {
        let mut assembler = PacketAssembler::new(DataFormat::XyFull);
        let mut out = Vec::new();
        assembler.accept(
            &build_datagram(&DatagramSpec {
                timestamp_ns: 1,
                position: 0,
                total: 2,
                start_column: 0,
                end_column: 99,
                step: 1,
                with_brightness: false,
            }),
            &mut out,
        );
        assert!(out.is_empty());

        // Next exposure starts before fragment 1 of the first arrives.
        assembler.accept(
            &build_datagram(&DatagramSpec {
                timestamp_ns: 2,
                position: 0,
                total: 2,
                start_column: 0,
                end_column: 99,
                step: 1,
                with_brightness: false,
            }),
            &mut out,
        );
        assert_eq!(out.len(), 1);
        assert!(!out[0].complete);
        assert_eq!(assembler.incomplete_profiles(), 1);
        // Only the first fragment's interleaved half is populated.
        assert_eq!(out[0].valid_points(), 50);
    }

    #[test]
    fn test_bad_magic_counted_and_dropped() {
        let mut assembler = PacketAssembler::new(DataFormat::XyFull);
        let mut out = Vec::new();
        assembler.accept(&[0x12, 0x34, 0, 0, 0, 0], &mut out);
        assert!(out.is_empty());
        assert_eq!(assembler.bad_packets(), 1);
    }

    #[test]
    fn test_short_datagram_counted_and_dropped() {
        let mut assembler = PacketAssembler::new(DataFormat::XyFull);
        let mut out = Vec::new();
        let mut datagram = build_datagram(&DatagramSpec {
            timestamp_ns: 5,
            position: 0,
            total: 1,
            start_column: 0,
            end_column: 99,
            step: 1,
            with_brightness: false,
        });
        datagram.truncate(datagram.len() - 10);
        assembler.accept(&datagram, &mut out);
        assert!(out.is_empty());
        assert_eq!(assembler.bad_packets(), 1);
    }

    #[test]
    fn test_subpixel_scaling() {
        let mut w = ByteWriter::new();
        let mut set = DataTypeSet::empty();
        set.insert(ContentType::Subpixel);
        w.write_u16(PACKET_MAGIC);
        w.write_u16(100);
        w.write_u8(1);
        w.write_u8(0);
        w.write_u8(0);
        w.write_u8(0);
        w.write_u64(77);
        w.write_u16(50);
        w.write_u16(set.0);
        w.write_u16(0);
        w.write_u8(0);
        w.write_u8(0);
        w.write_u32(0);
        w.write_u32(1);
        w.write_u16(0);
        w.write_u16(3);
        w.write_u32(1);
        w.write_u16(1); // step
        w.write_i16(64); // row 2.0
        w.write_i16(96); // row 3.0
        w.write_i16(INVALID_SUBPIXEL_WIRE);
        w.write_i16(0); // row 0.0

        let mut assembler = PacketAssembler::new(DataFormat::Subpixel);
        let mut out = Vec::new();
        assembler.accept(w.as_slice(), &mut out);
        assert_eq!(out.len(), 1);
        let rows = &out[0].subpixel_rows;
        assert_eq!(rows[0], 2.0);
        assert_eq!(rows[1], 3.0);
        assert!(rows[2].is_nan());
        assert_eq!(rows[3], 0.0);
    }
}
