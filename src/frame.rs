//! Frame assembly: sequence-aligned profile sets across scan heads.
//!
//! In frame scanning mode every active (head, camera, laser) exposure owns a
//! small FIFO, a *slot*. Completed profiles are routed to their slot; a frame
//! is the tuple of the oldest profile from every slot sharing one sequence
//! number. Frames are delivered in strictly increasing sequence order; a
//! sequence some slot never produced yields a frame marked incomplete rather
//! than a hole.
//!
//! If any slot falls [`FRAME_TAKE_THRESHOLD`] profiles behind, a frame is
//! force-taken so one stalled exposure cannot pin the others' memory.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use crate::config::FRAME_TAKE_THRESHOLD;
use crate::error::{ScanError, ScanResult};
use crate::profile::{source_key, CameraLaserPair, Profile};

/// Mounting orientation of a scan head relative to material flow.
///
/// Downstream-cabled heads observe their camera/laser pairs mirrored, so the
/// frame assembler reverses their slot order to keep frame layout canonical.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Orientation {
    /// Cable points against material flow.
    #[default]
    CableIsUpstream,
    /// Cable points with material flow.
    CableIsDownstream,
}

/// Slot layout contribution of one scan head.
#[derive(Clone, Debug)]
pub struct HeadSlots {
    /// Owning scan head.
    pub scan_head_id: u32,
    /// Mounting orientation, which may reverse the pair order.
    pub orientation: Orientation,
    /// Active camera/laser pairs in phase-table order.
    pub pairs: Vec<CameraLaserPair>,
}

/// One sequence-aligned set of profiles, one entry per slot.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Sequence number shared by the member profiles.
    pub sequence: u32,
    /// Per-slot profiles; `None` where the slot had nothing for this
    /// sequence.
    pub profiles: Vec<Option<Profile>>,
    /// True when every slot contributed.
    pub complete: bool,
}

impl Frame {
    /// Number of slots in the frame.
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// True for a zero-slot frame (never produced by the manager).
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Profile at slot `index`, if that slot contributed.
    pub fn get(&self, index: usize) -> Option<&Profile> {
        self.profiles.get(index).and_then(|p| p.as_ref())
    }
}

#[derive(Debug)]
struct Slot {
    scan_head_id: u32,
    fifo: VecDeque<Profile>,
}

/// Per-slot reorder queues feeding frame assembly.
#[derive(Debug)]
pub struct FrameQueueManager {
    slots: Vec<Slot>,
    slot_by_source: HashMap<u32, usize>,
    current_sequence: Option<u32>,
    capacity: usize,
    overflowed: bool,
}

impl FrameQueueManager {
    /// Build the slot layout from per-head pair lists.
    ///
    /// Slot order follows `heads` order; a `CableIsDownstream` head's pairs
    /// are reversed so frames read in canonical cross-machine order.
    pub fn new(heads: &[HeadSlots], capacity: usize) -> Self {
        let mut slots = Vec::new();
        let mut slot_by_source = HashMap::new();
        for head in heads {
            let mut pairs = head.pairs.clone();
            if head.orientation == Orientation::CableIsDownstream {
                pairs.reverse();
            }
            for pair in pairs {
                let source = source_key(head.scan_head_id, pair.camera, pair.laser);
                slot_by_source.insert(source, slots.len());
                slots.push(Slot {
                    scan_head_id: head.scan_head_id,
                    fifo: VecDeque::new(),
                });
            }
        }
        Self {
            slots,
            slot_by_source,
            current_sequence: None,
            capacity,
            overflowed: false,
        }
    }

    /// Number of slots.
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// True once any slot dropped a profile to overflow; latches until
    /// [`FrameQueueManager::reset_overflow`].
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Clear the overflow latch.
    pub fn reset_overflow(&mut self) {
        self.overflowed = false;
    }

    /// Drop all buffered profiles and restart sequence tracking.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.fifo.clear();
        }
        self.current_sequence = None;
    }

    /// Route one completed profile to its slot.
    ///
    /// Unknown sources (an exposure not in the phase table) are dropped. A
    /// full slot sheds its oldest profile and latches the overflow flag.
    pub fn push(&mut self, profile: Profile) {
        let Some(&index) = self.slot_by_source.get(&profile.source()) else {
            debug!(
                source = profile.source(),
                "dropping profile from unconfigured source"
            );
            return;
        };
        let slot = &mut self.slots[index];
        if slot.fifo.len() == self.capacity {
            slot.fifo.pop_front();
            if !self.overflowed {
                warn!(
                    scan_head_id = slot.scan_head_id,
                    "frame slot overflowed; dropping oldest profile"
                );
                self.overflowed = true;
            }
        }
        slot.fifo.push_back(profile);
    }

    /// Assemble the next frame if one is ready.
    ///
    /// A frame is ready when every slot holds a profile and the minimum
    /// front sequence has reached the current sequence, or when any slot's
    /// depth reaches [`FRAME_TAKE_THRESHOLD`] (forced take). The frame is
    /// always assembled at the current sequence, which advances by exactly
    /// one per take: a sequence no slot delivered still yields its frame,
    /// marked incomplete, rather than a hole. `connected` reports session
    /// liveness per scan head: an empty slot whose owner is gone fails the
    /// whole take with `Disconnected` instead of waiting for data that
    /// cannot arrive.
    pub fn try_take_frame<F>(&mut self, connected: F) -> ScanResult<Option<Frame>>
    where
        F: Fn(u32) -> bool,
    {
        if self.slots.is_empty() {
            return Ok(None);
        }

        // Shed entries older than the current sequence; they missed their
        // frame during a forced take.
        if let Some(current) = self.current_sequence {
            for slot in &mut self.slots {
                while slot
                    .fifo
                    .front()
                    .is_some_and(|p| p.sequence < current)
                {
                    slot.fifo.pop_front();
                }
            }
        }

        let mut min_front: Option<u32> = None;
        let mut max_depth = 0;
        let mut all_populated = true;
        for slot in &self.slots {
            max_depth = max_depth.max(slot.fifo.len());
            match slot.fifo.front() {
                Some(front) => {
                    min_front = Some(match min_front {
                        Some(m) => m.min(front.sequence),
                        None => front.sequence,
                    });
                }
                None => {
                    all_populated = false;
                    if !connected(slot.scan_head_id) {
                        return Err(ScanError::Disconnected(slot.scan_head_id));
                    }
                }
            }
        }

        let ready =
            (all_populated && min_front.is_some()) || max_depth >= FRAME_TAKE_THRESHOLD;
        if !ready {
            return Ok(None);
        }

        // The cursor is authoritative: the first take seeds it from the
        // oldest buffered sequence, and every take after that assembles at
        // the cursor even if no slot has it.
        let sequence = match self.current_sequence {
            Some(current) => current,
            None => match min_front {
                Some(m) => m,
                None => return Ok(None),
            },
        };

        let mut profiles = Vec::with_capacity(self.slots.len());
        let mut complete = true;
        for slot in &mut self.slots {
            match slot.fifo.front() {
                Some(front) if front.sequence == sequence => {
                    profiles.push(slot.fifo.pop_front());
                }
                _ => {
                    complete = false;
                    profiles.push(None);
                }
            }
        }
        self.current_sequence = Some(sequence + 1);
        Ok(Some(Frame {
            sequence,
            profiles,
            complete,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{DataFormat, ProfilePoint};

    fn profile(head: u32, camera: u32, laser: u32, sequence: u32) -> Profile {
        Profile {
            scan_head_id: head,
            camera_port: camera,
            laser_port: laser,
            timestamp_ns: sequence as u64 * 500_000,
            sequence,
            encoder_values: vec![],
            laser_on_time_us: 100,
            exposure_time_us: 300,
            start_column: 0,
            end_column: 3,
            data_format: DataFormat::XyFull,
            points: vec![ProfilePoint::INVALID; 4],
            subpixel_rows: vec![],
            complete: true,
        }
    }

    fn two_head_manager() -> FrameQueueManager {
        FrameQueueManager::new(
            &[
                HeadSlots {
                    scan_head_id: 0,
                    orientation: Orientation::CableIsUpstream,
                    pairs: vec![CameraLaserPair::new(0, 0)],
                },
                HeadSlots {
                    scan_head_id: 1,
                    orientation: Orientation::CableIsUpstream,
                    pairs: vec![CameraLaserPair::new(0, 0)],
                },
            ],
            16,
        )
    }

    const ALWAYS_CONNECTED: fn(u32) -> bool = |_| true;

    #[test]
    fn test_frames_delivered_in_sequence_order_despite_reorder() {
        let mut manager = two_head_manager();
        for seq in [1, 2, 3, 4] {
            manager.push(profile(0, 0, 0, seq));
        }
        for seq in [1, 3, 2, 4] {
            manager.push(profile(1, 0, 0, seq));
        }

        let mut delivered = Vec::new();
        while let Some(frame) = manager.try_take_frame(ALWAYS_CONNECTED).unwrap() {
            assert!(frame.complete);
            delivered.push(frame.sequence);
        }
        assert_eq!(delivered, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_not_ready_until_both_slots_filled() {
        let mut manager = two_head_manager();
        manager.push(profile(0, 0, 0, 1));
        assert!(manager.try_take_frame(ALWAYS_CONNECTED).unwrap().is_none());
        manager.push(profile(1, 0, 0, 1));
        let frame = manager.try_take_frame(ALWAYS_CONNECTED).unwrap().unwrap();
        assert_eq!(frame.sequence, 1);
        assert!(frame.complete);
    }

    #[test]
    fn test_forced_take_produces_incomplete_frame() {
        let mut manager = two_head_manager();
        for seq in 0..FRAME_TAKE_THRESHOLD as u32 {
            manager.push(profile(0, 0, 0, seq + 1));
        }
        // Head 1 has produced nothing, but its session is alive.
        let frame = manager.try_take_frame(ALWAYS_CONNECTED).unwrap().unwrap();
        assert!(!frame.complete);
        assert_eq!(frame.sequence, 1);
        assert!(frame.get(0).is_some());
        assert!(frame.get(1).is_none());
    }

    #[test]
    fn test_empty_slot_with_dead_session_fails_disconnected() {
        let mut manager = two_head_manager();
        manager.push(profile(0, 0, 0, 1));
        let result = manager.try_take_frame(|head| head != 1);
        assert!(matches!(result, Err(ScanError::Disconnected(1))));
    }

    #[test]
    fn test_downstream_orientation_reverses_slot_order() {
        let mut manager = FrameQueueManager::new(
            &[HeadSlots {
                scan_head_id: 0,
                orientation: Orientation::CableIsDownstream,
                pairs: vec![CameraLaserPair::new(0, 0), CameraLaserPair::new(1, 0)],
            }],
            16,
        );
        manager.push(profile(0, 0, 0, 1));
        manager.push(profile(0, 1, 0, 1));
        let frame = manager.try_take_frame(ALWAYS_CONNECTED).unwrap().unwrap();
        // Camera 1 lands in slot 0 because the head is cabled downstream.
        assert_eq!(frame.get(0).unwrap().camera_port, 1);
        assert_eq!(frame.get(1).unwrap().camera_port, 0);
    }

    #[test]
    fn test_slot_overflow_drops_oldest_and_latches() {
        let mut manager = FrameQueueManager::new(
            &[HeadSlots {
                scan_head_id: 0,
                orientation: Orientation::CableIsUpstream,
                pairs: vec![CameraLaserPair::new(0, 0)],
            }],
            2,
        );
        manager.push(profile(0, 0, 0, 1));
        manager.push(profile(0, 0, 0, 2));
        assert!(!manager.overflowed());
        manager.push(profile(0, 0, 0, 3));
        assert!(manager.overflowed());
        let frame = manager.try_take_frame(ALWAYS_CONNECTED).unwrap().unwrap();
        assert_eq!(frame.sequence, 2);
    }

    #[test]
    fn test_sequence_strictly_increasing_across_forced_takes() {
        let mut manager = two_head_manager();
        for seq in 1..=(FRAME_TAKE_THRESHOLD as u32) {
            manager.push(profile(0, 0, 0, seq));
        }
        let first = manager.try_take_frame(ALWAYS_CONNECTED).unwrap().unwrap();
        assert_eq!(first.sequence, 1);

        // The straggler catches up, including the already-taken sequence 1.
        for seq in [1, 2] {
            manager.push(profile(1, 0, 0, seq));
        }
        let second = manager.try_take_frame(ALWAYS_CONNECTED).unwrap().unwrap();
        assert_eq!(second.sequence, 2);
        assert!(second.complete);
    }

    #[test]
    fn test_sequence_absent_everywhere_yields_incomplete_frame() {
        let mut manager = two_head_manager();
        for head in [0, 1] {
            manager.push(profile(head, 0, 0, 1));
        }
        let first = manager.try_take_frame(ALWAYS_CONNECTED).unwrap().unwrap();
        assert_eq!(first.sequence, 1);
        assert!(first.complete);

        // Sequence 2 is lost on every slot; 3 arrives everywhere. The
        // cursor still visits 2 and delivers it as an all-missing frame.
        for head in [0, 1] {
            manager.push(profile(head, 0, 0, 3));
        }
        let second = manager.try_take_frame(ALWAYS_CONNECTED).unwrap().unwrap();
        assert_eq!(second.sequence, 2);
        assert!(!second.complete);
        assert!(second.get(0).is_none());
        assert!(second.get(1).is_none());

        let third = manager.try_take_frame(ALWAYS_CONNECTED).unwrap().unwrap();
        assert_eq!(third.sequence, 3);
        assert!(third.complete);
    }
}
