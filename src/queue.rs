//! Bounded profile queue with overflow-drop semantics.
//!
//! The receive task pushes with [`ProfileQueue::try_push`], which never
//! blocks: when the queue is full the oldest profile is dropped and a latched
//! overflow flag is set, so a slow consumer loses history rather than
//! stalling the data path. Consumers take with a non-blocking `try_take` or a
//! cancellation-aware `take` with optional timeout.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::warn;

use crate::error::{ScanError, ScanResult};
use crate::profile::Profile;

/// Bounded MPSC queue of completed profiles.
#[derive(Debug)]
pub struct ProfileQueue {
    inner: Mutex<VecDeque<Profile>>,
    capacity: usize,
    overflowed: AtomicBool,
    available: Notify,
}

impl ProfileQueue {
    /// Queue holding at most `capacity` profiles.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            overflowed: AtomicBool::new(false),
            available: Notify::new(),
        }
    }

    /// Push without blocking; on a full queue the oldest profile is dropped
    /// and the overflow flag latches.
    pub fn try_push(&self, profile: Profile) {
        {
            let mut queue = match self.inner.lock() {
                Ok(queue) => queue,
                Err(poisoned) => poisoned.into_inner(),
            };
            if queue.len() == self.capacity {
                queue.pop_front();
                if !self.overflowed.swap(true, Ordering::Relaxed) {
                    warn!(capacity = self.capacity, "profile queue overflowed; dropping oldest");
                }
            }
            queue.push_back(profile);
        }
        self.available.notify_one();
    }

    /// Pop the oldest profile if one is buffered.
    pub fn try_take(&self) -> Option<Profile> {
        let mut queue = match self.inner.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.pop_front()
    }

    /// Wait for a profile.
    ///
    /// `timeout` of `None` waits forever. The wait also ends when `shutdown`
    /// flips true, yielding `Timeout` so callers can re-check session state.
    pub async fn take(
        &self,
        timeout: Option<Duration>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ScanResult<Profile> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            if let Some(profile) = self.try_take() {
                return Ok(profile);
            }
            if *shutdown.borrow() {
                return Err(ScanError::Timeout);
            }
            let notified = self.available.notified();
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep_until(deadline) => {
                            return match self.try_take() {
                                Some(profile) => Ok(profile),
                                None => Err(ScanError::Timeout),
                            };
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = notified => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    /// Buffered profile count.
    pub fn len(&self) -> usize {
        let queue = match self.inner.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything buffered.
    pub fn clear(&self) {
        let mut queue = match self.inner.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.clear();
    }

    /// True once an overflow dropped a profile; latches until
    /// [`ProfileQueue::reset_overflow`].
    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Relaxed)
    }

    /// Clear the overflow latch (done on every scan start).
    pub fn reset_overflow(&self) {
        self.overflowed.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{DataFormat, ProfilePoint};

    fn profile(sequence: u32) -> Profile {
        Profile {
            scan_head_id: 0,
            camera_port: 0,
            laser_port: 0,
            timestamp_ns: sequence as u64 * 1000,
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

    #[test]
    fn test_overflow_drops_oldest_and_latches() {
        let queue = ProfileQueue::new(3);
        for sequence in 0..3 {
            queue.try_push(profile(sequence));
        }
        assert!(!queue.overflowed());

        queue.try_push(profile(3));
        assert!(queue.overflowed());
        assert_eq!(queue.len(), 3);
        // Sequence 0 was sacrificed.
        assert_eq!(queue.try_take().unwrap().sequence, 1);

        queue.reset_overflow();
        assert!(!queue.overflowed());
    }

    #[tokio::test]
    async fn test_take_returns_pushed_profile() {
        let queue = std::sync::Arc::new(ProfileQueue::new(8));
        let (_tx, mut rx) = watch::channel(false);
        let pusher = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            pusher.try_push(profile(5));
        });
        let got = queue
            .take(Some(Duration::from_secs(1)), &mut rx)
            .await
            .unwrap();
        assert_eq!(got.sequence, 5);
    }

    #[tokio::test]
    async fn test_take_times_out() {
        let queue = ProfileQueue::new(8);
        let (_tx, mut rx) = watch::channel(false);
        let result = queue.take(Some(Duration::from_millis(20)), &mut rx).await;
        assert!(matches!(result, Err(ScanError::Timeout)));
    }

    #[tokio::test]
    async fn test_take_observes_shutdown() {
        let queue = std::sync::Arc::new(ProfileQueue::new(8));
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(true);
        });
        let result = queue.take(None, &mut rx).await;
        assert!(matches!(result, Err(ScanError::Timeout)));
    }
}
