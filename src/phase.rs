//! Phase table construction and scan period compilation.
//!
//! A *phase* is a set of exposures that finish simultaneously; the *phase
//! table* is the ordered list of phases executed once per scan period. Users
//! build the table one phase at a time, then the compiler computes how long
//! each phase must last so that no camera is re-exposed before its readout
//! completes and no head is scheduled faster than it can scan.
//!
//! The compiler runs three passes:
//!
//! 1. every phase lasts as long as its longest exposure (the first phase
//!    additionally absorbs the camera pre-exposure offset),
//! 2. per-(head, camera) accumulators stretch phases until both the head's
//!    minimum scan period and the sensor readout gap are honored; the pass
//!    runs twice so constraints wrap around the table boundary,
//! 3. a throughput floor pads the table to the per-element minimum period.

use std::collections::HashMap;

use crate::config::{
    DrivePrimary, ProductType, ScanHeadConfiguration, CAMERA_START_EARLY_OFFSET_NS,
    FRAME_OVERHEAD_TIME_NS, MIN_SCAN_PERIOD_PER_ELEMENT_US,
};
use crate::error::{ScanError, ScanResult};
use crate::profile::CameraLaserPair;

/// Scheduling view of one scan head, resolved by the system at call time.
#[derive(Clone, Debug)]
pub struct ScheduleHead {
    /// Id the head is registered under.
    pub scan_head_id: u32,
    /// Product model, which fixes port counts and drive kind.
    pub product: ProductType,
    /// Head-level configuration (overridable per element).
    pub configuration: ScanHeadConfiguration,
    /// Minimum scan period the head will accept. Comes from cached device
    /// status when connected, product limits otherwise.
    pub min_scan_period_us: u32,
}

/// One exposure inside a phase.
#[derive(Clone, Debug)]
pub struct PhaseElement {
    /// Owning scan head.
    pub scan_head_id: u32,
    /// Camera and laser ports of the exposure.
    pub pair: CameraLaserPair,
    /// Element-specific configuration; `None` inherits the head's.
    pub config_override: Option<ScanHeadConfiguration>,
}

impl PhaseElement {
    /// Exposure duration in nanoseconds and whether it is a strobe.
    ///
    /// Strobe exposures are scheduled by their strobe duration and are
    /// exempt from the minimum-scan-period adjustment.
    fn exposure_ns(&self, head: &ScheduleHead) -> (u64, bool) {
        let config = self.config_override.as_ref().unwrap_or(&head.configuration);
        match config.strobe_duration_us {
            Some(strobe_us) => (strobe_us as u64 * 1000, true),
            None => (config.max_laser_on_time_us as u64 * 1000, false),
        }
    }
}

/// One set of simultaneous exposures.
#[derive(Clone, Debug, Default)]
pub struct Phase {
    elements: Vec<PhaseElement>,
}

impl Phase {
    /// Elements of this phase.
    pub fn elements(&self) -> &[PhaseElement] {
        &self.elements
    }

    /// True when no element was added.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// Ordered sequence of phases executed once per scan period.
#[derive(Clone, Debug, Default)]
pub struct PhaseTable {
    phases: Vec<Phase>,
}

impl PhaseTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// All phases in execution order.
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Number of phases.
    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    /// True before any phase is created.
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// True if any phase has no elements.
    pub fn has_empty_phase(&self) -> bool {
        self.phases.iter().any(Phase::is_empty)
    }

    /// Drop every phase.
    pub fn clear(&mut self) {
        self.phases.clear();
    }

    /// Append a new, empty phase; subsequent element additions land here.
    pub fn add_phase(&mut self) {
        self.phases.push(Phase::default());
    }

    /// Times `scan_head_id` appears across the whole table.
    pub fn occurrences(&self, scan_head_id: u32) -> usize {
        self.phases
            .iter()
            .flat_map(|p| p.elements.iter())
            .filter(|e| e.scan_head_id == scan_head_id)
            .count()
    }

    /// Every distinct (head, camera, laser) exposure, in table order.
    pub fn distinct_pairs(&self) -> Vec<(u32, CameraLaserPair)> {
        let mut seen = Vec::new();
        for phase in &self.phases {
            for element in &phase.elements {
                let key = (element.scan_head_id, element.pair);
                if !seen.contains(&key) {
                    seen.push(key);
                }
            }
        }
        seen
    }

    /// The first (head, camera, laser) exposure appearing more than once,
    /// if any.
    pub fn first_duplicate_pair(&self) -> Option<(u32, CameraLaserPair)> {
        let mut seen = Vec::new();
        for phase in &self.phases {
            for element in &phase.elements {
                let key = (element.scan_head_id, element.pair);
                if seen.contains(&key) {
                    return Some(key);
                }
                seen.push(key);
            }
        }
        None
    }

    /// Add a camera-keyed element to the current phase.
    ///
    /// Only valid for camera-driven products; the paired laser is derived
    /// from the port topology.
    pub fn add_element_camera(
        &mut self,
        head: &ScheduleHead,
        camera: u32,
        config_override: Option<ScanHeadConfiguration>,
    ) -> ScanResult<()> {
        let spec = head.product.spec();
        if spec.primary != DrivePrimary::Camera {
            return Err(ScanError::WrongPhaseElementKind(head.scan_head_id, "laser"));
        }
        if camera >= spec.num_cameras {
            return Err(ScanError::InvalidCamera(camera));
        }
        let laser = camera * spec.num_lasers / spec.num_cameras;
        self.add_element(head, CameraLaserPair::new(camera, laser), config_override)
    }

    /// Add a laser-keyed element to the current phase.
    ///
    /// Only valid for laser-driven products; the exposing camera is derived
    /// from the port topology.
    pub fn add_element_laser(
        &mut self,
        head: &ScheduleHead,
        laser: u32,
        config_override: Option<ScanHeadConfiguration>,
    ) -> ScanResult<()> {
        let spec = head.product.spec();
        if spec.primary != DrivePrimary::Laser {
            return Err(ScanError::WrongPhaseElementKind(head.scan_head_id, "camera"));
        }
        if laser >= spec.num_lasers {
            return Err(ScanError::InvalidLaser(laser));
        }
        let camera = laser * spec.num_cameras / spec.num_lasers;
        self.add_element(head, CameraLaserPair::new(camera, laser), config_override)
    }

    fn add_element(
        &mut self,
        head: &ScheduleHead,
        pair: CameraLaserPair,
        config_override: Option<ScanHeadConfiguration>,
    ) -> ScanResult<()> {
        let spec = head.product.spec();
        if let Some(config) = &config_override {
            config.validate(spec)?;
        }
        let Some(phase) = self.phases.last_mut() else {
            return Err(ScanError::EmptyPhaseTable);
        };
        if phase
            .elements
            .iter()
            .any(|e| e.scan_head_id == head.scan_head_id && e.pair.camera == pair.camera)
        {
            return Err(ScanError::DuplicatePhaseElement {
                scan_head_id: head.scan_head_id,
                camera: pair.camera,
                laser: pair.laser,
            });
        }
        if self.occurrences(head.scan_head_id) as u32 >= spec.max_configuration_groups {
            return Err(ScanError::OutOfRange(
                "configuration groups",
                format!(
                    "scan head {} exceeds {} table entries",
                    head.scan_head_id, spec.max_configuration_groups
                ),
            ));
        }
        if let Some(phase) = self.phases.last_mut() {
            phase.elements.push(PhaseElement {
                scan_head_id: head.scan_head_id,
                pair,
                config_override,
            });
        }
        Ok(())
    }

    /// Compute the duration of every phase in nanoseconds.
    ///
    /// `heads` maps scan head id to its scheduling view; every element's
    /// head must be present.
    pub fn calculate_phase_durations(
        &self,
        heads: &HashMap<u32, ScheduleHead>,
    ) -> ScanResult<Vec<u64>> {
        let mut durations = Vec::with_capacity(self.phases.len());

        // Pass 1: each phase lasts as long as its longest exposure.
        for (index, phase) in self.phases.iter().enumerate() {
            let mut duration = 0u64;
            for element in &phase.elements {
                let head = heads
                    .get(&element.scan_head_id)
                    .ok_or(ScanError::UnknownScanHead(element.scan_head_id))?;
                let (exposure, _) = element.exposure_ns(head);
                duration = duration.max(exposure);
            }
            if index == 0 {
                duration += CAMERA_START_EARLY_OFFSET_NS;
            }
            durations.push(duration);
        }

        // Pass 2: stretch phases until repeated (head, camera) exposures
        // leave room for the head's minimum period and the sensor readout.
        // Two iterations so constraints wrap around the table boundary.
        let mut accum: HashMap<(u32, u32), i64> = HashMap::new();
        for _ in 0..2 {
            for (index, phase) in self.phases.iter().enumerate() {
                for value in accum.values_mut() {
                    *value += durations[index] as i64;
                }
                for element in &phase.elements {
                    let head = heads
                        .get(&element.scan_head_id)
                        .ok_or(ScanError::UnknownScanHead(element.scan_head_id))?;
                    let key = (element.scan_head_id, element.pair.camera);
                    let Some(&elapsed) = accum.get(&key) else {
                        continue;
                    };
                    let (exposure, is_strobe) = element.exposure_ns(head);
                    let min_period_adj = if is_strobe {
                        i64::MIN
                    } else {
                        head.min_scan_period_us as i64 * 1000 - elapsed
                    };
                    let overhead_adj =
                        FRAME_OVERHEAD_TIME_NS as i64 - (elapsed - exposure as i64);
                    let adj = min_period_adj.max(overhead_adj);
                    if adj > 0 {
                        durations[index] += adj as u64;
                        for value in accum.values_mut() {
                            *value += adj;
                        }
                    }
                }
                for element in &phase.elements {
                    accum.insert((element.scan_head_id, element.pair.camera), 0);
                }
            }
        }

        // Pass 3: pad up to the per-element throughput floor.
        let mut per_head: HashMap<u32, u64> = HashMap::new();
        for phase in &self.phases {
            for element in &phase.elements {
                *per_head.entry(element.scan_head_id).or_default() += 1;
            }
        }
        let max_elements = per_head.values().copied().max().unwrap_or(0);
        let min_total_ns = MIN_SCAN_PERIOD_PER_ELEMENT_US * 1000 * max_elements;
        let total: u64 = durations.iter().sum();
        if total < min_total_ns && !durations.is_empty() {
            let deficit = min_total_ns - total;
            let per_phase = deficit.div_ceil(durations.len() as u64);
            for duration in &mut durations {
                *duration += per_phase;
            }
        }

        Ok(durations)
    }

    /// Shortest scan period the compiled table permits, in microseconds.
    pub fn min_scan_period_us(&self, heads: &HashMap<u32, ScheduleHead>) -> ScanResult<u32> {
        let total: u64 = self.calculate_phase_durations(heads)?.iter().sum();
        Ok(total.div_ceil(1000) as u32)
    }
}
