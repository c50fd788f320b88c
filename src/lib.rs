//! Client runtime for networked laser-triangulation scan heads.
//!
//! This crate discovers scan heads on the local network, manages their
//! control and data connections, compiles exposure schedules, and delivers
//! real-time profile data to the embedding application.
//!
//! # Typical flow
//!
//! ```no_run
//! use std::time::Duration;
//! use triscan::{DataFormat, ScanMode, ScanOptions, ScanSystem};
//!
//! # async fn run() -> triscan::ScanResult<()> {
//! let mut system = ScanSystem::new();
//! system.discover().await?;
//! system.create_scan_head(700_144, 0).await?;
//! system.connect(Duration::from_secs(5)).await?;
//!
//! system.add_phase()?;
//! system.add_phase_element_camera(0, 0, None)?;
//!
//! let period_us = system.get_min_scan_period_us()?;
//! system
//!     .start_scanning(ScanOptions {
//!         period_us,
//!         data_format: DataFormat::XyBrightnessFull,
//!         mode: ScanMode::Profile,
//!         idle_period_us: None,
//!     })
//!     .await?;
//!
//! let profile = system.take_profile(Some(Duration::from_secs(1))).await?;
//! println!("{} valid points", profile.valid_points());
//! system.stop_scanning().await?;
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod config;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod head;
pub mod phase;
pub mod profile;
pub mod queue;
pub mod scansync;
pub mod session;
pub mod system;
pub mod wire;

pub use config::{ProductType, ScanHeadConfiguration, Version};
pub use discovery::{DeviceState, DiscoveredDevice};
pub use error::{ScanError, ScanResult};
pub use frame::{Frame, Orientation};
pub use head::{
    BrightnessCorrection, Encoder, ExclusionMask, ScanHead, ScanWindow,
};
pub use profile::{CameraLaserPair, DataFormat, Profile, ProfilePoint};
pub use system::{ScanMode, ScanOptions, ScanSystem};
