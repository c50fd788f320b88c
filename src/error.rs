//! Error types for the scan head client runtime.
//!
//! This module defines the primary error type, `ScanError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle errors from the wire codec up through the
//! `ScanSystem` API surface.
//!
//! ## Error Taxonomy
//!
//! `ScanError` consolidates five broad kinds of failure:
//!
//! - **Protocol** (`BadMagic`, `Truncated`, `UnexpectedMessage`): malformed
//!   bytes. On the data path these are counted and swallowed; on the control
//!   path they surface to the caller.
//! - **State** (`NotConnected`, `AlreadyScanning`, `NotScanning`, ...):
//!   operations issued while the session is in the wrong lifecycle state.
//!   Raised synchronously at API boundaries.
//! - **Argument** (`OutOfRange`, `InvalidCamera`, `InvalidPolygon`, ...):
//!   caller-supplied values that fail validation. Also synchronous.
//! - **Transport** (`PeerClosed`, `Timeout`, `Disconnected`, `Io`): socket
//!   failures. These surface through the `Disconnected` session state;
//!   `take_profile`/`take_frame` translate persistent disconnection into a
//!   `Disconnected` error rather than waiting forever.
//! - **Compatibility** (`VersionIncompatible`): firmware whose major version
//!   does not match the client's, checked at connect and at feature-gated
//!   APIs.
//!
//! With `#[from]` conversions, `ScanError` propagates cleanly through the
//! crate with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Unified error type for every fallible operation in the crate.
#[derive(Error, Debug)]
pub enum ScanError {
    /// The first u16 of a data packet was not the expected magic.
    #[error("bad packet magic 0x{0:04X}")]
    BadMagic(u16),

    /// A decode ran past the end of the buffer.
    #[error("truncated buffer: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        /// Bytes the decoder needed at `offset`.
        needed: usize,
        /// Offset the decoder had reached.
        offset: usize,
        /// Bytes remaining in the buffer.
        available: usize,
    },

    /// A control reply carried a message type the caller did not expect.
    #[error("unexpected control message type 0x{0:02X}")]
    UnexpectedMessage(u8),

    /// The operation requires a connected session.
    #[error("scan head {0} is not connected")]
    NotConnected(u32),

    /// The operation is illegal while a scan is running.
    #[error("system is already scanning")]
    AlreadyScanning,

    /// The operation requires an active scan.
    #[error("system is not scanning")]
    NotScanning,

    /// Configuration changes have not been sent to the head yet.
    #[error("scan head {0} has configuration changes that were not sent")]
    ConfigurationPending(u32),

    /// The same exposure already exists in the phase being built.
    #[error(
        "phase element for scan head {scan_head_id} camera {camera} laser {laser} already present"
    )]
    DuplicatePhaseElement {
        /// Owning scan head.
        scan_head_id: u32,
        /// Camera port of the offending element.
        camera: u32,
        /// Laser port of the offending element.
        laser: u32,
    },

    /// Scanning cannot start from an empty schedule.
    #[error("phase table is empty or contains an empty phase")]
    EmptyPhaseTable,

    /// Phase elements must be keyed by the head's primary port kind.
    #[error("scan head {0} phase elements must be added by {1} port")]
    WrongPhaseElementKind(u32, &'static str),

    /// The operation belongs to the other scan mode.
    #[error("operation requires {0} scan mode")]
    WrongScanMode(&'static str),

    /// A camera the product should have did not come up.
    #[error("scan head {0} did not detect camera {1}")]
    CameraNotDetected(u32, u32),

    /// A numeric argument fell outside its permitted range.
    #[error("{0} out of range: {1}")]
    OutOfRange(&'static str, String),

    /// Camera port does not exist on this product.
    #[error("invalid camera port {0}")]
    InvalidCamera(u32),

    /// Laser port does not exist on this product.
    #[error("invalid laser port {0}")]
    InvalidLaser(u32),

    /// Encoder index beyond the supported count.
    #[error("invalid encoder id {0}")]
    InvalidEncoder(u32),

    /// The scan window polygon failed validation.
    #[error("invalid scan window: {0}")]
    InvalidPolygon(String),

    /// The remote end closed a stream mid-message.
    #[error("peer closed the connection")]
    PeerClosed,

    /// A bounded wait elapsed.
    #[error("operation timed out")]
    Timeout,

    /// The session was lost (heartbeat failure or transport error).
    #[error("scan head {0} disconnected")]
    Disconnected(u32),

    /// Underlying socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Device firmware major version differs from the client's.
    #[error("scan head {serial} firmware {major}.{minor}.{patch} is not compatible with this client")]
    VersionIncompatible {
        /// Device serial number.
        serial: u32,
        /// Firmware major version.
        major: u32,
        /// Firmware minor version.
        minor: u32,
        /// Firmware patch version.
        patch: u32,
    },

    /// `create_scan_head` was given a serial discovery never reported.
    #[error("serial {0} was not found by discovery")]
    SerialNotDiscovered(u32),

    /// The serial is already owned by this system.
    #[error("serial {0} is already managed by this scan system")]
    DuplicateSerial(u32),

    /// The id is already owned by this system.
    #[error("scan head id {0} is already in use")]
    DuplicateId(u32),

    /// No scan head with this id exists.
    #[error("unknown scan head id {0}")]
    UnknownScanHead(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScanError::BadMagic(0xBEEF);
        assert_eq!(err.to_string(), "bad packet magic 0xBEEF");
    }

    #[test]
    fn test_truncated_display() {
        let err = ScanError::Truncated {
            needed: 8,
            offset: 36,
            available: 4,
        };
        assert!(err.to_string().contains("needed 8 bytes at offset 36"));
    }
}
