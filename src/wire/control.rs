//! Control-channel messages and TCP framing.
//!
//! Control traffic is a tagged binary union: a one-byte message kind followed
//! by big-endian fields. Frames on the wire are `u32` little-endian length
//! prefix plus payload, in both directions. A read that ends before the
//! prefix is satisfied fails with `PeerClosed`; writes always emit
//! `[prefix || payload]` as one buffer so concurrent senders behind the
//! session's send lock cannot interleave.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::{Version, MAX_ENCODERS};
use crate::error::{ScanError, ScanResult};
use crate::profile::DataFormat;
use crate::wire::codec::{ByteReader, ByteWriter};

/// Upper bound on a control frame; anything larger is a protocol violation.
/// Sized for the exclusion mask message (the largest we send) with room to
/// spare.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// How the client intends to use a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionType {
    /// Standard data-producing connection.
    Normal,
    /// Diagnostic connection that suppresses data delivery.
    Monitor,
}

impl ConnectionType {
    fn to_wire(self) -> u8 {
        match self {
            ConnectionType::Normal => 0,
            ConnectionType::Monitor => 1,
        }
    }

    fn from_wire(v: u8) -> ScanResult<Self> {
        match v {
            0 => Ok(ConnectionType::Normal),
            1 => Ok(ConnectionType::Monitor),
            other => Err(ScanError::UnexpectedMessage(other)),
        }
    }
}

/// Device status snapshot returned by [`ControlMessage::RequestStatus`].
#[derive(Clone, Debug, PartialEq)]
pub struct ScanHeadStatus {
    /// Firmware version running on the head.
    pub firmware: Version,
    /// Bitmask of camera ports the head detected at boot.
    pub detected_cameras: u8,
    /// Shortest scan period the head will accept, given its configuration.
    pub min_scan_period_us: u32,
    /// Profiles sent since the scan session started.
    pub profiles_sent: u64,
    /// Hottest internal temperature in degrees C.
    pub max_temperature_c: i16,
}

impl ScanHeadStatus {
    /// True if camera port `port` was detected.
    pub fn has_camera(&self, port: u32) -> bool {
        port < 8 && self.detected_cameras & (1 << port) != 0
    }
}

/// One oriented window edge, mill coordinates scaled by 1000.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WireWindowConstraint {
    /// Edge start X, thousandths.
    pub x0: i32,
    /// Edge start Y, thousandths.
    pub y0: i32,
    /// Edge end X, thousandths.
    pub x1: i32,
    /// Edge end Y, thousandths.
    pub y1: i32,
}

/// Exposure limits forwarded to the head when configuration is dirty.
#[derive(Clone, Debug, PartialEq)]
pub struct WireConfiguration {
    /// Laser-on bounds and default, microseconds.
    pub laser_on_us: [u32; 3],
    /// Exposure bounds and default, microseconds.
    pub exposure_us: [u32; 3],
    /// Minimum brightness counting as laser signal.
    pub laser_detection_threshold: u32,
    /// Brightness counting as saturation.
    pub saturation_threshold: u32,
    /// Percentage of saturated pixels tolerated.
    pub saturation_percentage: u32,
    /// Encoder travel gate, 0 when unused.
    pub minimum_encoder_travel: u32,
}

/// Every message exchanged on the control channel.
///
/// Client-to-server kinds occupy 0x01..0x0F; replies start at 0x40. The
/// session encodes requests and decodes replies; the in-process mock server
/// used by the tests does the reverse with the same implementation.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlMessage {
    /// Claim the head for this client.
    Connect {
        /// Intended connection use.
        connection_type: ConnectionType,
        /// Id the client assigned to the head.
        scan_head_id: u32,
        /// Device serial being claimed.
        serial: u32,
    },
    /// Ask for a [`ScanHeadStatus`] snapshot.
    RequestStatus,
    /// Replace the scan window of one camera/laser pair.
    Window {
        /// Camera port of the pair.
        camera: u8,
        /// Laser port of the pair.
        laser: u8,
        /// Polygon edges, clockwise.
        constraints: Vec<WireWindowConstraint>,
    },
    /// Replace the exclusion mask of one camera/laser pair.
    ExclusionMask {
        /// Camera port of the pair.
        camera: u8,
        /// Laser port of the pair.
        laser: u8,
        /// Row-major packed bitmap, 1 = excluded.
        bitmap: Vec<u8>,
    },
    /// Replace the brightness correction of one camera/laser pair.
    BrightnessCorrection {
        /// Camera port of the pair.
        camera: u8,
        /// Laser port of the pair.
        laser: u8,
        /// Offset added to every pixel.
        image_offset: i32,
        /// Per-column scale factors.
        scale_factors: Vec<f32>,
    },
    /// Map encoder slots to ScanSync serials, 0 = unmapped.
    ScanSyncMapping {
        /// Serial per encoder slot.
        serials: [u32; MAX_ENCODERS],
    },
    /// Exposure limits for the upcoming scan.
    Configuration(WireConfiguration),
    /// Scan parameters for the upcoming scan.
    ScanConfiguration {
        /// Scan period.
        period_us: u32,
        /// Negotiated sample format.
        data_format: DataFormat,
        /// Idle-mode period, 0 when disabled.
        idle_period_us: u32,
    },
    /// Begin scanning at a coordinated time.
    ScanStart {
        /// Server-clock start time, 0 for immediately.
        start_time_ns: u64,
    },
    /// Stop the running scan.
    ScanStop,
    /// Release the head.
    Disconnect,
    /// Scan-mode liveness signal for firmware without heartbeat support.
    KeepAlive,
    /// Liveness request.
    HeartBeat,
    /// Reply to [`ControlMessage::RequestStatus`].
    StatusReply(ScanHeadStatus),
    /// Reply to [`ControlMessage::HeartBeat`].
    HeartBeatReply {
        /// True while the head is scanning.
        scanning: bool,
    },
}

const KIND_CONNECT: u8 = 0x01;
const KIND_REQUEST_STATUS: u8 = 0x02;
const KIND_WINDOW: u8 = 0x03;
const KIND_EXCLUSION_MASK: u8 = 0x04;
const KIND_BRIGHTNESS_CORRECTION: u8 = 0x05;
const KIND_SCANSYNC_MAPPING: u8 = 0x06;
const KIND_CONFIGURATION: u8 = 0x07;
const KIND_SCAN_CONFIGURATION: u8 = 0x08;
const KIND_SCAN_START: u8 = 0x09;
const KIND_SCAN_STOP: u8 = 0x0A;
const KIND_DISCONNECT: u8 = 0x0B;
const KIND_KEEP_ALIVE: u8 = 0x0C;
const KIND_HEART_BEAT: u8 = 0x0D;
const KIND_STATUS_REPLY: u8 = 0x40;
const KIND_HEART_BEAT_REPLY: u8 = 0x41;

impl ControlMessage {
    /// Wire kind byte of this message.
    pub fn kind(&self) -> u8 {
        match self {
            ControlMessage::Connect { .. } => KIND_CONNECT,
            ControlMessage::RequestStatus => KIND_REQUEST_STATUS,
            ControlMessage::Window { .. } => KIND_WINDOW,
            ControlMessage::ExclusionMask { .. } => KIND_EXCLUSION_MASK,
            ControlMessage::BrightnessCorrection { .. } => KIND_BRIGHTNESS_CORRECTION,
            ControlMessage::ScanSyncMapping { .. } => KIND_SCANSYNC_MAPPING,
            ControlMessage::Configuration(_) => KIND_CONFIGURATION,
            ControlMessage::ScanConfiguration { .. } => KIND_SCAN_CONFIGURATION,
            ControlMessage::ScanStart { .. } => KIND_SCAN_START,
            ControlMessage::ScanStop => KIND_SCAN_STOP,
            ControlMessage::Disconnect => KIND_DISCONNECT,
            ControlMessage::KeepAlive => KIND_KEEP_ALIVE,
            ControlMessage::HeartBeat => KIND_HEART_BEAT,
            ControlMessage::StatusReply(_) => KIND_STATUS_REPLY,
            ControlMessage::HeartBeatReply { .. } => KIND_HEART_BEAT_REPLY,
        }
    }

    /// Encode to a frame payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(16);
        w.write_u8(self.kind());
        match self {
            ControlMessage::Connect {
                connection_type,
                scan_head_id,
                serial,
            } => {
                w.write_u8(connection_type.to_wire());
                w.write_u32(*scan_head_id);
                w.write_u32(*serial);
            }
            ControlMessage::RequestStatus
            | ControlMessage::ScanStop
            | ControlMessage::Disconnect
            | ControlMessage::KeepAlive
            | ControlMessage::HeartBeat => {}
            ControlMessage::Window {
                camera,
                laser,
                constraints,
            } => {
                w.write_u8(*camera);
                w.write_u8(*laser);
                w.write_u16(constraints.len() as u16);
                for c in constraints {
                    w.write_i32(c.x0);
                    w.write_i32(c.y0);
                    w.write_i32(c.x1);
                    w.write_i32(c.y1);
                }
            }
            ControlMessage::ExclusionMask {
                camera,
                laser,
                bitmap,
            } => {
                w.write_u8(*camera);
                w.write_u8(*laser);
                w.write_u32(bitmap.len() as u32);
                w.write_bytes(bitmap);
            }
            ControlMessage::BrightnessCorrection {
                camera,
                laser,
                image_offset,
                scale_factors,
            } => {
                w.write_u8(*camera);
                w.write_u8(*laser);
                w.write_i32(*image_offset);
                w.write_u32(scale_factors.len() as u32);
                for f in scale_factors {
                    w.write_u32(f.to_bits());
                }
            }
            ControlMessage::ScanSyncMapping { serials } => {
                for s in serials {
                    w.write_u32(*s);
                }
            }
            ControlMessage::Configuration(cfg) => {
                for v in cfg.laser_on_us {
                    w.write_u32(v);
                }
                for v in cfg.exposure_us {
                    w.write_u32(v);
                }
                w.write_u32(cfg.laser_detection_threshold);
                w.write_u32(cfg.saturation_threshold);
                w.write_u32(cfg.saturation_percentage);
                w.write_u32(cfg.minimum_encoder_travel);
            }
            ControlMessage::ScanConfiguration {
                period_us,
                data_format,
                idle_period_us,
            } => {
                w.write_u32(*period_us);
                w.write_u16(data_format.to_wire());
                w.write_u32(*idle_period_us);
            }
            ControlMessage::ScanStart { start_time_ns } => {
                w.write_u64(*start_time_ns);
            }
            ControlMessage::StatusReply(status) => {
                w.write_u32(status.firmware.major);
                w.write_u32(status.firmware.minor);
                w.write_u32(status.firmware.patch);
                w.write_u8(status.detected_cameras);
                w.write_u32(status.min_scan_period_us);
                w.write_u64(status.profiles_sent);
                w.write_i16(status.max_temperature_c);
            }
            ControlMessage::HeartBeatReply { scanning } => {
                w.write_u8(u8::from(*scanning));
            }
        }
        w.into_vec()
    }

    /// Decode a frame payload.
    pub fn decode(payload: &[u8]) -> ScanResult<Self> {
        let mut r = ByteReader::new(payload);
        let kind = r.read_u8()?;
        let msg = match kind {
            KIND_CONNECT => ControlMessage::Connect {
                connection_type: ConnectionType::from_wire(r.read_u8()?)?,
                scan_head_id: r.read_u32()?,
                serial: r.read_u32()?,
            },
            KIND_REQUEST_STATUS => ControlMessage::RequestStatus,
            KIND_WINDOW => {
                let camera = r.read_u8()?;
                let laser = r.read_u8()?;
                let count = r.read_u16()? as usize;
                let mut constraints = Vec::with_capacity(count);
                for _ in 0..count {
                    constraints.push(WireWindowConstraint {
                        x0: r.read_i32()?,
                        y0: r.read_i32()?,
                        x1: r.read_i32()?,
                        y1: r.read_i32()?,
                    });
                }
                ControlMessage::Window {
                    camera,
                    laser,
                    constraints,
                }
            }
            KIND_EXCLUSION_MASK => {
                let camera = r.read_u8()?;
                let laser = r.read_u8()?;
                let len = r.read_u32()? as usize;
                let mut bitmap = vec![0u8; len];
                for b in bitmap.iter_mut() {
                    *b = r.read_u8()?;
                }
                ControlMessage::ExclusionMask {
                    camera,
                    laser,
                    bitmap,
                }
            }
            KIND_BRIGHTNESS_CORRECTION => {
                let camera = r.read_u8()?;
                let laser = r.read_u8()?;
                let image_offset = r.read_i32()?;
                let count = r.read_u32()? as usize;
                let mut scale_factors = Vec::with_capacity(count);
                for _ in 0..count {
                    scale_factors.push(f32::from_bits(r.read_u32()?));
                }
                ControlMessage::BrightnessCorrection {
                    camera,
                    laser,
                    image_offset,
                    scale_factors,
                }
            }
            KIND_SCANSYNC_MAPPING => {
                let mut serials = [0u32; MAX_ENCODERS];
                for s in serials.iter_mut() {
                    *s = r.read_u32()?;
                }
                ControlMessage::ScanSyncMapping { serials }
            }
            KIND_CONFIGURATION => {
                let mut laser_on_us = [0u32; 3];
                for v in laser_on_us.iter_mut() {
                    *v = r.read_u32()?;
                }
                let mut exposure_us = [0u32; 3];
                for v in exposure_us.iter_mut() {
                    *v = r.read_u32()?;
                }
                ControlMessage::Configuration(WireConfiguration {
                    laser_on_us,
                    exposure_us,
                    laser_detection_threshold: r.read_u32()?,
                    saturation_threshold: r.read_u32()?,
                    saturation_percentage: r.read_u32()?,
                    minimum_encoder_travel: r.read_u32()?,
                })
            }
            KIND_SCAN_CONFIGURATION => {
                let period_us = r.read_u32()?;
                let raw_format = r.read_u16()?;
                let data_format = DataFormat::from_wire(raw_format).ok_or_else(|| {
                    ScanError::OutOfRange("data format", raw_format.to_string())
                })?;
                ControlMessage::ScanConfiguration {
                    period_us,
                    data_format,
                    idle_period_us: r.read_u32()?,
                }
            }
            KIND_SCAN_START => ControlMessage::ScanStart {
                start_time_ns: r.read_u64()?,
            },
            KIND_SCAN_STOP => ControlMessage::ScanStop,
            KIND_DISCONNECT => ControlMessage::Disconnect,
            KIND_KEEP_ALIVE => ControlMessage::KeepAlive,
            KIND_HEART_BEAT => ControlMessage::HeartBeat,
            KIND_STATUS_REPLY => {
                let firmware = Version::new(r.read_u32()?, r.read_u32()?, r.read_u32()?);
                ControlMessage::StatusReply(ScanHeadStatus {
                    firmware,
                    detected_cameras: r.read_u8()?,
                    min_scan_period_us: r.read_u32()?,
                    profiles_sent: r.read_u64()?,
                    max_temperature_c: r.read_i16()?,
                })
            }
            KIND_HEART_BEAT_REPLY => ControlMessage::HeartBeatReply {
                scanning: r.read_u8()? != 0,
            },
            other => return Err(ScanError::UnexpectedMessage(other)),
        };
        Ok(msg)
    }
}

/// Write one length-prefixed frame.
///
/// The prefix and payload are emitted as a single buffer so a frame can
/// never interleave with another sender on the same socket.
pub async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> ScanResult<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    stream.write_all(&buf).await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// A stream that ends before the prefix or payload is satisfied fails with
/// `PeerClosed`.
pub async fn read_frame<S>(stream: &mut S) -> ScanResult<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    read_exact_or_closed(stream, &mut prefix).await?;
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(ScanError::OutOfRange("frame length", len.to_string()));
    }
    let mut payload = vec![0u8; len];
    read_exact_or_closed(stream, &mut payload).await?;
    Ok(payload)
}

async fn read_exact_or_closed<S>(stream: &mut S, buf: &mut [u8]) -> ScanResult<()>
where
    S: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ScanError::PeerClosed),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let messages = vec![
            ControlMessage::Connect {
                connection_type: ConnectionType::Normal,
                scan_head_id: 3,
                serial: 700_144,
            },
            ControlMessage::RequestStatus,
            ControlMessage::Window {
                camera: 0,
                laser: 1,
                constraints: vec![WireWindowConstraint {
                    x0: -20_000,
                    y0: 30_000,
                    x1: 20_000,
                    y1: 30_000,
                }],
            },
            ControlMessage::ScanSyncMapping {
                serials: [900_100, 0, 0],
            },
            ControlMessage::ScanConfiguration {
                period_us: 5000,
                data_format: DataFormat::XyBrightnessFull,
                idle_period_us: 0,
            },
            ControlMessage::ScanStart {
                start_time_ns: 1_000_000_123,
            },
            ControlMessage::ScanStop,
            ControlMessage::HeartBeat,
            ControlMessage::StatusReply(ScanHeadStatus {
                firmware: Version::new(16, 3, 2),
                detected_cameras: 0b11,
                min_scan_period_us: 320,
                profiles_sent: 12_345,
                max_temperature_c: 41,
            }),
            ControlMessage::HeartBeatReply { scanning: true },
        ];
        for msg in messages {
            let encoded = msg.encode();
            let decoded = ControlMessage::decode(&encoded).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        assert!(matches!(
            ControlMessage::decode(&[0xEE]),
            Err(ScanError::UnexpectedMessage(0xEE))
        ));
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let payload = ControlMessage::HeartBeat.encode();
        write_frame(&mut a, &payload).await.unwrap();
        let got = read_frame(&mut b).await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn test_read_frame_peer_closed_mid_payload() {
        let (mut a, mut b) = tokio::io::duplex(256);
        // Announce 100 bytes but deliver only 3, then close.
        tokio::io::AsyncWriteExt::write_all(&mut a, &100u32.to_le_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut a, &[1, 2, 3])
            .await
            .unwrap();
        drop(a);
        assert!(matches!(
            read_frame(&mut b).await,
            Err(ScanError::PeerClosed)
        ));
    }
}
