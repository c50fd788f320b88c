//! Scan system orchestration.
//!
//! The [`ScanSystem`] owns every scan head, the phase table, the profile and
//! frame queues, and the liveness tasks. The public API is grouped by
//! function: discovery and head management, phase table construction,
//! scanning control, and data retrieval.
//!
//! Scan heads are claimed exclusively: a serial may belong to at most one
//! system, and creating a head requires discovery to have seen it (or an
//! explicit address for routed networks where broadcast cannot reach).

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{
    ProductType, ScanHeadConfiguration, CONTROL_PORT, DATA_PORT, DEFAULT_QUEUE_CAPACITY,
    HEARTBEAT_INTERVAL_MS, HEARTBEAT_MIN_VERSION, SCANSYNC_START_OFFSET_NS,
};
use crate::discovery::{discover, DiscoveredDevice};
use crate::error::{ScanError, ScanResult};
use crate::frame::{Frame, FrameQueueManager, HeadSlots};
use crate::head::ScanHead;
use crate::phase::{PhaseTable, ScheduleHead};
use crate::profile::{CameraLaserPair, DataFormat, Profile};
use crate::queue::ProfileQueue;
use crate::scansync::ScanSyncReceiver;
use crate::session::{ConnectOptions, ProfileSink, Session};
use crate::wire::control::ConnectionType;

/// How profiles are delivered to the consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanMode {
    /// Individual profiles via `take_profile`, per-head ordering only.
    Profile,
    /// Sequence-aligned frames via `take_frame`.
    Frame,
}

/// Parameters for one scan session.
#[derive(Clone, Copy, Debug)]
pub struct ScanOptions {
    /// Scan period in microseconds.
    pub period_us: u32,
    /// Sample format to negotiate.
    pub data_format: DataFormat,
    /// Delivery mode.
    pub mode: ScanMode,
    /// Idle-mode period, if idle scanning is wanted.
    pub idle_period_us: Option<u32>,
}

/// Owner and orchestrator of a fleet of scan heads.
pub struct ScanSystem {
    heads: BTreeMap<u32, ScanHead>,
    discovered: HashMap<u32, DiscoveredDevice>,
    address_overrides: HashMap<u32, (SocketAddr, SocketAddr)>,
    phase_table: PhaseTable,
    profile_queue: Arc<ProfileQueue>,
    frame_manager: Option<Arc<StdMutex<FrameQueueManager>>>,
    frame_notify: Arc<Notify>,
    scansync: Option<ScanSyncReceiver>,
    mode: Option<ScanMode>,
    scanning: bool,
    shutdown_tx: watch::Sender<bool>,
    liveness_tasks: Vec<JoinHandle<()>>,
}

impl Default for ScanSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanSystem {
    /// Empty system with default queue capacity.
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            heads: BTreeMap::new(),
            discovered: HashMap::new(),
            address_overrides: HashMap::new(),
            phase_table: PhaseTable::new(),
            profile_queue: Arc::new(ProfileQueue::new(DEFAULT_QUEUE_CAPACITY)),
            frame_manager: None,
            frame_notify: Arc::new(Notify::new()),
            scansync: None,
            mode: None,
            scanning: false,
            shutdown_tx,
            liveness_tasks: Vec::new(),
        }
    }

    // =========================================================================
    // Discovery & head management
    // =========================================================================

    /// Probe the network and refresh the discovery cache.
    pub async fn discover(&mut self) -> ScanResult<Vec<DiscoveredDevice>> {
        let found = discover().await?;
        let devices: Vec<DiscoveredDevice> = found.values().cloned().collect();
        self.discovered.extend(found);
        Ok(devices)
    }

    /// Create a scan head for a discovered serial.
    ///
    /// Fails if the id or serial is already registered; an unknown serial
    /// triggers one fresh probe before giving up.
    pub async fn create_scan_head(&mut self, serial: u32, id: u32) -> ScanResult<&mut ScanHead> {
        if self.heads.contains_key(&id) {
            return Err(ScanError::DuplicateId(id));
        }
        if self.heads.values().any(|h| h.serial() == serial) {
            return Err(ScanError::DuplicateSerial(serial));
        }
        if !self.discovered.contains_key(&serial) {
            self.discover().await?;
        }
        let device = self
            .discovered
            .get(&serial)
            .ok_or(ScanError::SerialNotDiscovered(serial))?;
        if !device.is_compatible() {
            return Err(ScanError::VersionIncompatible {
                serial,
                major: device.firmware.major,
                minor: device.firmware.minor,
                patch: device.firmware.patch,
            });
        }
        let head = ScanHead::new(id, serial, device.product_type, device.ip_server);
        self.heads.insert(id, head);
        Ok(self.heads.get_mut(&id).ok_or(ScanError::UnknownScanHead(id))?)
    }

    /// Create a scan head at an explicit address, for devices on routed
    /// networks that broadcast discovery cannot reach.
    pub fn create_scan_head_at(
        &mut self,
        serial: u32,
        id: u32,
        product: ProductType,
        ip: Ipv4Addr,
    ) -> ScanResult<&mut ScanHead> {
        if self.heads.contains_key(&id) {
            return Err(ScanError::DuplicateId(id));
        }
        if self.heads.values().any(|h| h.serial() == serial) {
            return Err(ScanError::DuplicateSerial(serial));
        }
        let head = ScanHead::new(id, serial, product, ip);
        self.heads.insert(id, head);
        Ok(self.heads.get_mut(&id).ok_or(ScanError::UnknownScanHead(id))?)
    }

    /// Override the control/data addresses used to reach one serial, for
    /// port-forwarded setups and in-process test fixtures.
    pub fn set_device_addresses(&mut self, serial: u32, control: SocketAddr, data: SocketAddr) {
        self.address_overrides.insert(serial, (control, data));
    }

    /// The head registered under `id`.
    pub fn scan_head(&self, id: u32) -> ScanResult<&ScanHead> {
        self.heads.get(&id).ok_or(ScanError::UnknownScanHead(id))
    }

    /// Mutable access to the head registered under `id`.
    pub fn scan_head_mut(&mut self, id: u32) -> ScanResult<&mut ScanHead> {
        self.heads.get_mut(&id).ok_or(ScanError::UnknownScanHead(id))
    }

    /// Ids of every registered head, ascending.
    pub fn scan_head_ids(&self) -> Vec<u32> {
        self.heads.keys().copied().collect()
    }

    /// Remove a head, disconnecting it first if needed.
    pub async fn remove_scan_head(&mut self, id: u32) -> ScanResult<()> {
        if self.scanning {
            return Err(ScanError::AlreadyScanning);
        }
        let head = self.heads.remove(&id).ok_or(ScanError::UnknownScanHead(id))?;
        if let Some(session) = head.session {
            session.disconnect().await;
        }
        Ok(())
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect every registered head in parallel.
    ///
    /// After the sockets come up, each head's detected cameras are checked
    /// against its product and pending configuration is sent. If every head
    /// supports heartbeats the liveness loop starts; otherwise keep-alives
    /// are used while scanning. Any failure disconnects everything.
    pub async fn connect(&mut self, timeout: Duration) -> ScanResult<()> {
        if self.scanning {
            return Err(ScanError::AlreadyScanning);
        }

        let connects: Vec<_> = self
            .heads
            .values()
            .map(|head| {
                let (control_addr, data_addr) = self
                    .address_overrides
                    .get(&head.serial())
                    .copied()
                    .unwrap_or((
                        SocketAddr::from((head.ip(), CONTROL_PORT)),
                        SocketAddr::from((head.ip(), DATA_PORT)),
                    ));
                let opts = ConnectOptions {
                    ip: head.ip(),
                    scan_head_id: head.id(),
                    serial: head.serial(),
                    connection_type: ConnectionType::Normal,
                    timeout,
                };
                async move {
                    let session = Session::connect_to(opts, control_addr, data_addr).await?;
                    Ok::<_, ScanError>((opts.scan_head_id, session))
                }
            })
            .collect();

        let mut failure = None;
        for result in join_all(connects).await {
            match result {
                Ok((id, session)) => {
                    if let Some(head) = self.heads.get_mut(&id) {
                        head.session = Some(session);
                    }
                }
                Err(err) => failure = Some(err),
            }
        }
        if let Some(err) = failure {
            self.disconnect().await;
            return Err(err);
        }

        // Verify firmware compatibility and camera inventory.
        let verify_failure = self.heads.values().find_map(|head| {
            let status = match head.cached_status() {
                Some(status) => status,
                None => return Some(ScanError::NotConnected(head.id())),
            };
            if !status.firmware.is_compatible_with_api() {
                return Some(ScanError::VersionIncompatible {
                    serial: head.serial(),
                    major: status.firmware.major,
                    minor: status.firmware.minor,
                    patch: status.firmware.patch,
                });
            }
            (0..head.product().spec().num_cameras)
                .find(|&camera| !status.has_camera(camera))
                .map(|camera| ScanError::CameraNotDetected(head.id(), camera))
        });
        if let Some(err) = verify_failure {
            self.disconnect().await;
            return Err(err);
        }

        // Push whatever configuration accumulated before connect.
        let ids: Vec<u32> = self.heads.keys().copied().collect();
        for id in ids {
            if let Some(head) = self.heads.get_mut(&id) {
                if let Err(err) = head.send_pending_configuration().await {
                    self.disconnect().await;
                    return Err(err);
                }
            }
        }

        let all_heartbeat = self.heads.values().all(|head| {
            head.cached_status()
                .is_some_and(|s| s.firmware >= HEARTBEAT_MIN_VERSION)
        });
        if all_heartbeat {
            self.spawn_heartbeat_loops();
        } else {
            info!("heartbeat unsupported by at least one head; using keep-alive");
        }

        if self.scansync.is_none() {
            match ScanSyncReceiver::start().await {
                Ok(receiver) => self.scansync = Some(receiver),
                // Not fatal: without sync data, scans start immediately.
                Err(err) => warn!(%err, "scansync listener unavailable"),
            }
        }
        Ok(())
    }

    fn spawn_heartbeat_loops(&mut self) {
        for head in self.heads.values() {
            let Some(session) = head.session.clone() else {
                continue;
            };
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let task = tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = ticker.tick() => {
                            if !session.is_connected() {
                                break;
                            }
                            if let Err(err) = session.heartbeat().await {
                                warn!(
                                    scan_head_id = session.scan_head_id(),
                                    %err,
                                    "heartbeat failed"
                                );
                                session.mark_lost();
                                break;
                            }
                        }
                    }
                }
            });
            self.liveness_tasks.push(task);
        }
    }

    /// True when every head has a usable session.
    pub fn is_connected(&self) -> bool {
        !self.heads.is_empty() && self.heads.values().all(ScanHead::is_connected)
    }

    /// Disconnect every head and stop liveness tasks.
    pub async fn disconnect(&mut self) {
        if self.scanning {
            let _ = self.stop_scanning().await;
        }
        let _ = self.shutdown_tx.send(true);
        for task in self.liveness_tasks.drain(..) {
            let _ = task.await;
        }
        // Re-arm the shutdown channel for a future connect.
        let (shutdown_tx, _) = watch::channel(false);
        self.shutdown_tx = shutdown_tx;

        let sessions: Vec<Arc<Session>> = self
            .heads
            .values_mut()
            .filter_map(|head| head.session.take())
            .collect();
        join_all(sessions.iter().map(|s| s.disconnect())).await;
    }

    // =========================================================================
    // Phase table
    // =========================================================================

    /// Start a new phase; elements added next land in it.
    pub fn add_phase(&mut self) -> ScanResult<()> {
        if self.scanning {
            return Err(ScanError::AlreadyScanning);
        }
        self.phase_table.add_phase();
        Ok(())
    }

    /// Add a camera-keyed exposure of head `id` to the current phase.
    pub fn add_phase_element_camera(
        &mut self,
        id: u32,
        camera: u32,
        config_override: Option<ScanHeadConfiguration>,
    ) -> ScanResult<()> {
        if self.scanning {
            return Err(ScanError::AlreadyScanning);
        }
        let view = self.scan_head(id)?.schedule_view();
        self.phase_table
            .add_element_camera(&view, camera, config_override)
    }

    /// Add a laser-keyed exposure of head `id` to the current phase.
    pub fn add_phase_element_laser(
        &mut self,
        id: u32,
        laser: u32,
        config_override: Option<ScanHeadConfiguration>,
    ) -> ScanResult<()> {
        if self.scanning {
            return Err(ScanError::AlreadyScanning);
        }
        let view = self.scan_head(id)?.schedule_view();
        self.phase_table
            .add_element_laser(&view, laser, config_override)
    }

    /// Drop every phase.
    pub fn clear_phase_table(&mut self) -> ScanResult<()> {
        if self.scanning {
            return Err(ScanError::AlreadyScanning);
        }
        self.phase_table.clear();
        Ok(())
    }

    /// The table under construction.
    pub fn phase_table(&self) -> &PhaseTable {
        &self.phase_table
    }

    fn schedule_views(&self) -> HashMap<u32, ScheduleHead> {
        self.heads
            .iter()
            .map(|(&id, head)| (id, head.schedule_view()))
            .collect()
    }

    /// Compiled per-phase durations in nanoseconds.
    pub fn calculate_phase_durations(&self) -> ScanResult<Vec<u64>> {
        self.phase_table
            .calculate_phase_durations(&self.schedule_views())
    }

    /// Shortest scan period the phase table permits, in microseconds.
    pub fn get_min_scan_period_us(&self) -> ScanResult<u32> {
        self.phase_table.min_scan_period_us(&self.schedule_views())
    }

    // =========================================================================
    // Scanning
    // =========================================================================

    /// Start scanning on every head at a coordinated time.
    pub async fn start_scanning(&mut self, options: ScanOptions) -> ScanResult<()> {
        if self.scanning {
            return Err(ScanError::AlreadyScanning);
        }
        if !self.is_connected() {
            let first_dead = self
                .heads
                .values()
                .find(|h| !h.is_connected())
                .map_or(0, ScanHead::id);
            return Err(ScanError::NotConnected(first_dead));
        }
        if self.phase_table.is_empty() || self.phase_table.has_empty_phase() {
            return Err(ScanError::EmptyPhaseTable);
        }
        if options.mode == ScanMode::Frame {
            // Frame layout needs one slot per exposure; duplicates would
            // alias.
            if let Some((scan_head_id, pair)) = self.phase_table.first_duplicate_pair() {
                return Err(ScanError::DuplicatePhaseElement {
                    scan_head_id,
                    camera: pair.camera,
                    laser: pair.laser,
                });
            }
        }

        let min_period = self.get_min_scan_period_us()?;
        if options.period_us < min_period {
            return Err(ScanError::OutOfRange(
                "scan period",
                format!("{} us < minimum {} us", options.period_us, min_period),
            ));
        }
        for head in self.heads.values() {
            let spec = head.product().spec();
            if options.period_us < spec.min_scan_period_us
                || options.period_us > spec.max_scan_period_us
            {
                return Err(ScanError::OutOfRange(
                    "scan period",
                    format!(
                        "{} us outside [{}, {}]",
                        options.period_us, spec.min_scan_period_us, spec.max_scan_period_us
                    ),
                ));
            }
            if let Some(status) = head.cached_status() {
                if options.period_us < status.min_scan_period_us {
                    return Err(ScanError::OutOfRange(
                        "scan period",
                        format!(
                            "{} us < device minimum {} us",
                            options.period_us, status.min_scan_period_us
                        ),
                    ));
                }
            }
        }

        // Flush any configuration the user changed since connect.
        for head in self.heads.values_mut() {
            head.send_pending_configuration().await?;
        }

        // Fresh delivery state for the new session.
        self.profile_queue.clear();
        self.profile_queue.reset_overflow();
        self.frame_manager = None;
        let sink = match options.mode {
            ScanMode::Profile => ProfileSink::Queue(self.profile_queue.clone()),
            ScanMode::Frame => {
                let mut groups: Vec<HeadSlots> = Vec::new();
                for (&id, head) in &self.heads {
                    let pairs: Vec<CameraLaserPair> = self
                        .phase_table
                        .distinct_pairs()
                        .into_iter()
                        .filter(|(h, _)| *h == id)
                        .map(|(_, pair)| pair)
                        .collect();
                    if !pairs.is_empty() {
                        groups.push(HeadSlots {
                            scan_head_id: id,
                            orientation: head.orientation(),
                            pairs,
                        });
                    }
                }
                let manager =
                    Arc::new(StdMutex::new(FrameQueueManager::new(&groups, DEFAULT_QUEUE_CAPACITY)));
                self.frame_manager = Some(manager.clone());
                ProfileSink::Frames {
                    manager,
                    notify: self.frame_notify.clone(),
                }
            }
        };

        let start_time_ns = self.select_start_time();
        debug!(start_time_ns, period_us = options.period_us, "starting scan");

        let starts: Vec<_> = self
            .heads
            .values()
            .filter_map(|head| head.session.clone())
            .map(|session| {
                let sink = sink.clone();
                async move {
                    session
                        .start_scanning(
                            options.period_us,
                            options.data_format,
                            options.idle_period_us,
                            start_time_ns,
                            sink,
                        )
                        .await
                }
            })
            .collect();
        for result in join_all(starts).await {
            if let Err(err) = result {
                // Unwind the heads that did start.
                let _ = self.broadcast_stop().await;
                return Err(err);
            }
        }

        // Older firmware needs keep-alives while scanning.
        for head in self.heads.values() {
            let supports_heartbeat = head
                .cached_status()
                .is_some_and(|s| s.firmware >= HEARTBEAT_MIN_VERSION);
            if !supports_heartbeat {
                if let Some(session) = &head.session {
                    session.spawn_keepalive();
                }
            }
        }

        self.mode = Some(options.mode);
        self.scanning = true;
        info!(
            period_us = options.period_us,
            mode = ?options.mode,
            heads = self.heads.len(),
            "scanning started"
        );
        Ok(())
    }

    /// Coordinated start time from the main ScanSync unit, pushed far
    /// enough into the future to clear the firmware clock rollover; zero
    /// (start immediately) when no sync data exists.
    fn select_start_time(&self) -> u64 {
        let Some(scansync) = &self.scansync else {
            return 0;
        };
        // Prefer the unit mapped to the main encoder on any head.
        let mapped = self
            .heads
            .values()
            .map(|h| h.scansync_mapping(crate::head::Encoder::Main))
            .find(|&serial| serial != 0)
            .and_then(|serial| scansync.latest(serial));
        let data = mapped.or_else(|| scansync.main());
        match data {
            Some(data) => data.last_timestamp_total_ns() + SCANSYNC_START_OFFSET_NS,
            None => 0,
        }
    }

    async fn broadcast_stop(&self) -> ScanResult<()> {
        let stops: Vec<_> = self
            .heads
            .values()
            .filter_map(|head| head.session.clone())
            .map(|session| async move { session.stop_scanning().await })
            .collect();
        let mut first_err = None;
        for result in join_all(stops).await {
            if let Err(err) = result {
                if first_err.is_none() && !matches!(err, ScanError::NotScanning) {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop scanning on every head. Buffered profiles stay available.
    pub async fn stop_scanning(&mut self) -> ScanResult<()> {
        if !self.scanning {
            return Err(ScanError::NotScanning);
        }
        let result = self.broadcast_stop().await;
        self.scanning = false;
        self.mode = None;
        info!("scanning stopped");
        result
    }

    /// True while a scan session is active.
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    // =========================================================================
    // Data retrieval
    // =========================================================================

    /// Pop one profile if buffered (profile mode).
    pub fn try_take_profile(&self) -> ScanResult<Option<Profile>> {
        if self.mode == Some(ScanMode::Frame) {
            return Err(ScanError::WrongScanMode("profile"));
        }
        Ok(self.profile_queue.try_take())
    }

    /// Wait for one profile (profile mode).
    ///
    /// `timeout` of `None` waits forever. While scanning, loss of every
    /// session turns the wait into a `Disconnected` error.
    pub async fn take_profile(&self, timeout: Option<Duration>) -> ScanResult<Profile> {
        if self.mode == Some(ScanMode::Frame) {
            return Err(ScanError::WrongScanMode("profile"));
        }
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            // Poll in slices so session loss surfaces promptly even with an
            // unbounded wait.
            let slice = Duration::from_millis(100);
            let wait = match deadline {
                Some(deadline) => {
                    slice.min(deadline.saturating_duration_since(tokio::time::Instant::now()))
                }
                None => slice,
            };
            match self.profile_queue.take(Some(wait), &mut shutdown_rx).await {
                Ok(profile) => return Ok(profile),
                Err(ScanError::Timeout) => {
                    if self.scanning && !self.heads.is_empty() {
                        if let Some(dead) =
                            self.heads.values().find(|h| !h.is_connected())
                        {
                            return Err(ScanError::Disconnected(dead.id()));
                        }
                    }
                    if let Some(deadline) = deadline {
                        if tokio::time::Instant::now() >= deadline {
                            return Err(ScanError::Timeout);
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Pop one frame if ready (frame mode).
    pub fn try_take_frame(&self) -> ScanResult<Option<Frame>> {
        let Some(manager) = &self.frame_manager else {
            return Err(ScanError::WrongScanMode("frame"));
        };
        let mut manager = match manager.lock() {
            Ok(manager) => manager,
            Err(poisoned) => poisoned.into_inner(),
        };
        manager.try_take_frame(|id| {
            self.heads
                .get(&id)
                .is_some_and(ScanHead::is_connected)
        })
    }

    /// Wait for one frame (frame mode).
    ///
    /// Frames arrive in strictly increasing sequence order; an exposure some
    /// head never delivered yields a frame marked incomplete. Loss of a
    /// session that still owes a slot fails with `Disconnected`.
    pub async fn take_frame(&self, timeout: Option<Duration>) -> ScanResult<Frame> {
        if self.frame_manager.is_none() {
            return Err(ScanError::WrongScanMode("frame"));
        }
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            if let Some(frame) = self.try_take_frame()? {
                return Ok(frame);
            }
            let notified = self.frame_notify.notified();
            let slice = tokio::time::sleep(Duration::from_millis(100));
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = slice => {}
                        _ = tokio::time::sleep_until(deadline) => {
                            return match self.try_take_frame()? {
                                Some(frame) => Ok(frame),
                                None => Err(ScanError::Timeout),
                            };
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = notified => {}
                        _ = slice => {}
                    }
                }
            }
        }
    }

    /// True once any queue dropped a profile to overflow since the last
    /// scan start.
    pub fn profile_buffer_overflowed(&self) -> bool {
        if self.profile_queue.overflowed() {
            return true;
        }
        self.frame_manager.as_ref().is_some_and(|manager| {
            let manager = match manager.lock() {
                Ok(manager) => manager,
                Err(poisoned) => poisoned.into_inner(),
            };
            manager.overflowed()
        })
    }

    /// Profiles currently buffered in profile mode.
    pub fn profiles_buffered(&self) -> usize {
        self.profile_queue.len()
    }
}

impl Drop for ScanSystem {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in &self.liveness_tasks {
            task.abort();
        }
    }
}
