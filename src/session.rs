//! Per-head TCP session: control channel, data channel, liveness.
//!
//! A session owns two TCP streams to one scan head: the control stream
//! (request/response, strictly ordered behind a send lock) and the data
//! stream (a long-lived receive task). Both connects must land inside one
//! overall timeout or the attempt fails.
//!
//! Lifecycle: `Disconnected -> Connecting -> Idle -> Scanning -> Idle`, with
//! any transport or liveness failure collapsing to `Disconnected`. Liveness
//! uses heartbeat request/reply every 250 ms on firmware that supports it;
//! older firmware instead receives keep-alive messages every second while
//! scanning and stops on its own when they cease.
//!
//! All tasks observe the session's shutdown channel, so teardown is a
//! signal, a socket close, and a join.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::assembler::PacketAssembler;
use crate::config::{
    CONTROL_PORT, DATA_PORT, DATA_RECV_BUFFER_BYTES, HEARTBEAT_TIMEOUT_MS, KEEPALIVE_INTERVAL_MS,
};
use crate::error::{ScanError, ScanResult};
use crate::frame::FrameQueueManager;
use crate::profile::{DataFormat, Profile};
use crate::queue::ProfileQueue;
use crate::wire::control::{read_frame, write_frame, ConnectionType, ControlMessage, ScanHeadStatus};

/// Session lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No sockets open.
    Disconnected,
    /// Sockets connecting.
    Connecting,
    /// Connected, not scanning.
    Idle,
    /// Connected and scanning.
    Scanning,
}

/// Destination for completed profiles.
#[derive(Clone)]
pub enum ProfileSink {
    /// Profile mode: the system-wide bounded queue.
    Queue(Arc<ProfileQueue>),
    /// Frame mode: per-slot reorder queues plus a wakeup for blocked takers.
    Frames {
        /// Shared frame assembler.
        manager: Arc<StdMutex<FrameQueueManager>>,
        /// Woken after every push so `take_frame` can re-poll.
        notify: Arc<Notify>,
    },
}

impl ProfileSink {
    fn deliver(&self, profile: Profile) {
        match self {
            ProfileSink::Queue(queue) => queue.try_push(profile),
            ProfileSink::Frames { manager, notify } => {
                {
                    let mut manager = match manager.lock() {
                        Ok(manager) => manager,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    manager.push(profile);
                }
                notify.notify_waiters();
            }
        }
    }
}

struct DataPath {
    assembler: PacketAssembler,
    sink: ProfileSink,
}

/// Connection parameters for one session.
#[derive(Clone, Copy, Debug)]
pub struct ConnectOptions {
    /// Device address from discovery.
    pub ip: Ipv4Addr,
    /// Id the client assigned to the head.
    pub scan_head_id: u32,
    /// Device serial being claimed.
    pub serial: u32,
    /// Intended connection use.
    pub connection_type: ConnectionType,
    /// Overall deadline covering both socket connects.
    pub timeout: Duration,
}

/// An open control+data connection to one scan head.
pub struct Session {
    scan_head_id: u32,
    serial: u32,
    state: StdMutex<SessionState>,
    control: Mutex<ControlChannel>,
    data_path: Arc<StdMutex<Option<DataPath>>>,
    bad_packets: Arc<AtomicU64>,
    incomplete_profiles: Arc<AtomicU64>,
    cached_status: StdMutex<Option<ScanHeadStatus>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

struct ControlChannel {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl Session {
    /// Open both sockets, claim the head, and start the data receive task.
    ///
    /// Both connects share `opts.timeout`; if either misses it the attempt
    /// fails and no session exists.
    pub async fn connect(opts: ConnectOptions) -> ScanResult<Arc<Self>> {
        let control_addr = SocketAddr::from((opts.ip, CONTROL_PORT));
        let data_addr = SocketAddr::from((opts.ip, DATA_PORT));
        Self::connect_to(opts, control_addr, data_addr).await
    }

    /// [`Session::connect`] with explicit addresses; tests point this at an
    /// in-process mock on loopback.
    pub async fn connect_to(
        opts: ConnectOptions,
        control_addr: SocketAddr,
        data_addr: SocketAddr,
    ) -> ScanResult<Arc<Self>> {
        debug!(
            scan_head_id = opts.scan_head_id,
            serial = opts.serial,
            %control_addr,
            "connecting"
        );
        let sockets = tokio::time::timeout(opts.timeout, async {
            let control = TcpStream::connect(control_addr).await?;
            control.set_nodelay(true)?;
            let data_socket = TcpSocket::new_v4()?;
            // Profiles arrive faster than most consumers drain them; a large
            // kernel buffer rides out scheduling hiccups.
            if let Err(err) = data_socket.set_recv_buffer_size(DATA_RECV_BUFFER_BYTES as u32) {
                warn!(%err, "could not set data receive buffer size");
            }
            let data = data_socket.connect(data_addr).await?;
            Ok::<_, ScanError>((control, data))
        })
        .await
        .map_err(|_| ScanError::Timeout)??;
        let (control, data) = sockets;
        let (control_reader, control_writer) = control.into_split();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = Arc::new(Self {
            scan_head_id: opts.scan_head_id,
            serial: opts.serial,
            state: StdMutex::new(SessionState::Connecting),
            control: Mutex::new(ControlChannel {
                reader: control_reader,
                writer: control_writer,
            }),
            data_path: Arc::new(StdMutex::new(None)),
            bad_packets: Arc::new(AtomicU64::new(0)),
            incomplete_profiles: Arc::new(AtomicU64::new(0)),
            cached_status: StdMutex::new(None),
            shutdown_tx,
            tasks: StdMutex::new(Vec::new()),
        });

        session
            .send(&ControlMessage::Connect {
                connection_type: opts.connection_type,
                scan_head_id: opts.scan_head_id,
                serial: opts.serial,
            })
            .await?;

        let data_task = tokio::spawn(Self::data_receive_loop(
            session.clone(),
            data,
            shutdown_rx,
        ));
        session.push_task(data_task);

        session.set_state(SessionState::Idle);
        // Prime the status cache so callers can gate on firmware version.
        let status = match session.request_status().await {
            Ok(status) => status,
            Err(err) => {
                // Unwind so the data task does not outlive a failed connect.
                session.mark_lost();
                return Err(err);
            }
        };
        info!(
            scan_head_id = opts.scan_head_id,
            serial = opts.serial,
            firmware = %status.firmware,
            "scan head connected"
        );
        Ok(session)
    }

    fn push_task(&self, task: JoinHandle<()>) {
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.push(task);
    }

    /// Id the head is registered under.
    pub fn scan_head_id(&self) -> u32 {
        self.scan_head_id
    }

    /// Device serial.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        *state
    }

    fn set_state(&self, new: SessionState) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        *state = new;
    }

    /// True while the session is usable.
    pub fn is_connected(&self) -> bool {
        matches!(self.state(), SessionState::Idle | SessionState::Scanning)
    }

    /// Datagrams dropped for failing to parse since the last scan start.
    pub fn bad_packets(&self) -> u64 {
        self.bad_packets.load(Ordering::Relaxed)
    }

    /// Profiles queued before all fragments arrived since the last scan
    /// start.
    pub fn incomplete_profiles(&self) -> u64 {
        self.incomplete_profiles.load(Ordering::Relaxed)
    }

    /// Most recent device status, if any request succeeded.
    pub fn cached_status(&self) -> Option<ScanHeadStatus> {
        let status = match self.cached_status.lock() {
            Ok(status) => status,
            Err(poisoned) => poisoned.into_inner(),
        };
        status.clone()
    }

    /// Send a control message without waiting for a reply.
    pub async fn send(&self, msg: &ControlMessage) -> ScanResult<()> {
        let mut channel = self.control.lock().await;
        write_frame(&mut channel.writer, &msg.encode()).await
    }

    /// Send a request and read its reply, holding the send lock across both
    /// so concurrent requests are strictly ordered.
    pub async fn request(&self, msg: &ControlMessage) -> ScanResult<ControlMessage> {
        let mut channel = self.control.lock().await;
        write_frame(&mut channel.writer, &msg.encode()).await?;
        let reply = read_frame(&mut channel.reader).await?;
        ControlMessage::decode(&reply)
    }

    /// Fetch device status and refresh the cache.
    pub async fn request_status(&self) -> ScanResult<ScanHeadStatus> {
        match self.request(&ControlMessage::RequestStatus).await? {
            ControlMessage::StatusReply(status) => {
                let mut cached = match self.cached_status.lock() {
                    Ok(cached) => cached,
                    Err(poisoned) => poisoned.into_inner(),
                };
                *cached = Some(status.clone());
                Ok(status)
            }
            other => Err(ScanError::UnexpectedMessage(other.kind())),
        }
    }

    /// One heartbeat exchange under the liveness deadline.
    ///
    /// An expired deadline or transport failure marks the session lost.
    pub async fn heartbeat(&self) -> ScanResult<()> {
        let exchange = self.request(&ControlMessage::HeartBeat);
        let reply = tokio::time::timeout(Duration::from_millis(HEARTBEAT_TIMEOUT_MS), exchange)
            .await
            .map_err(|_| ScanError::Timeout)?;
        match reply {
            Ok(ControlMessage::HeartBeatReply { .. }) => Ok(()),
            Ok(other) => Err(ScanError::UnexpectedMessage(other.kind())),
            Err(err) => Err(err),
        }
    }

    /// Mark the session lost: cancel tasks and drop to `Disconnected`.
    ///
    /// Idempotent; called from the heartbeat loop and the data task.
    pub fn mark_lost(&self) {
        if self.state() == SessionState::Disconnected {
            return;
        }
        warn!(
            scan_head_id = self.scan_head_id,
            serial = self.serial,
            "session lost"
        );
        self.set_state(SessionState::Disconnected);
        let _ = self.shutdown_tx.send(true);
    }

    /// Begin scanning with a fresh assembler feeding `sink`.
    ///
    /// The caller (the system) has already validated the period and sent
    /// pending configuration.
    pub async fn start_scanning(
        &self,
        period_us: u32,
        data_format: DataFormat,
        idle_period_us: Option<u32>,
        start_time_ns: u64,
        sink: ProfileSink,
    ) -> ScanResult<()> {
        if self.state() != SessionState::Idle {
            return match self.state() {
                SessionState::Scanning => Err(ScanError::AlreadyScanning),
                _ => Err(ScanError::NotConnected(self.scan_head_id)),
            };
        }
        self.bad_packets.store(0, Ordering::Relaxed);
        self.incomplete_profiles.store(0, Ordering::Relaxed);
        {
            let mut data_path = match self.data_path.lock() {
                Ok(data_path) => data_path,
                Err(poisoned) => poisoned.into_inner(),
            };
            *data_path = Some(DataPath {
                assembler: PacketAssembler::new(data_format),
                sink,
            });
        }
        self.send(&ControlMessage::ScanConfiguration {
            period_us,
            data_format,
            idle_period_us: idle_period_us.unwrap_or(0),
        })
        .await?;
        self.send(&ControlMessage::ScanStart { start_time_ns }).await?;
        self.set_state(SessionState::Scanning);
        Ok(())
    }

    /// Stop scanning. Send errors are ignored; the head also stops on its
    /// own once keep-alives cease.
    pub async fn stop_scanning(&self) -> ScanResult<()> {
        if self.state() != SessionState::Scanning {
            return Err(ScanError::NotScanning);
        }
        if let Err(err) = self.send(&ControlMessage::ScanStop).await {
            debug!(%err, "scan stop send failed");
        }
        {
            let mut data_path = match self.data_path.lock() {
                Ok(data_path) => data_path,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Drop the assembler; a partial profile mid-teardown is
            // discarded with it.
            *data_path = None;
        }
        self.set_state(SessionState::Idle);
        Ok(())
    }

    /// Spawn the keep-alive timer for firmware without heartbeat support.
    /// Runs until shutdown or the scan ends.
    pub fn spawn_keepalive(self: &Arc<Self>) {
        let session = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(KEEPALIVE_INTERVAL_MS));
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if session.state() != SessionState::Scanning {
                            break;
                        }
                        if let Err(err) = session.send(&ControlMessage::KeepAlive).await {
                            debug!(%err, "keep-alive send failed");
                            session.mark_lost();
                            break;
                        }
                    }
                }
            }
        });
        self.push_task(task);
    }

    /// Release the head and tear the session down.
    pub async fn disconnect(&self) {
        if self.state() == SessionState::Disconnected {
            return;
        }
        // Best effort; the peer may already be gone.
        if let Err(err) = self.send(&ControlMessage::Disconnect).await {
            debug!(%err, "disconnect send failed");
        }
        self.set_state(SessionState::Disconnected);
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = match self.tasks.lock() {
                Ok(tasks) => tasks,
                Err(poisoned) => poisoned.into_inner(),
            };
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        let mut channel = self.control.lock().await;
        let _ = channel.writer.shutdown().await;
    }

    /// Long-lived data receive loop.
    ///
    /// Per-record protocol errors are counted by the assembler and survive;
    /// transport errors end the session.
    async fn data_receive_loop(
        session: Arc<Self>,
        data: TcpStream,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let (mut reader, _writer) = data.into_split();
        let mut completed: Vec<Profile> = Vec::new();
        loop {
            let record = tokio::select! {
                _ = shutdown_rx.changed() => break,
                record = read_frame(&mut reader) => record,
            };
            let datagram = match record {
                Ok(datagram) => datagram,
                Err(err) => {
                    if session.state() != SessionState::Disconnected {
                        warn!(
                            scan_head_id = session.scan_head_id,
                            %err,
                            "data stream failed"
                        );
                        session.mark_lost();
                    }
                    break;
                }
            };

            let sink = {
                let mut data_path = match session.data_path.lock() {
                    Ok(data_path) => data_path,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let Some(path) = data_path.as_mut() else {
                    // Data outside a scan session; nothing to assemble into.
                    continue;
                };
                path.assembler.accept(&datagram, &mut completed);
                session
                    .bad_packets
                    .store(path.assembler.bad_packets(), Ordering::Relaxed);
                session
                    .incomplete_profiles
                    .store(path.assembler.incomplete_profiles(), Ordering::Relaxed);
                path.sink.clone()
            };
            for profile in completed.drain(..) {
                sink.deliver(profile);
            }
        }
        debug!(scan_head_id = session.scan_head_id, "data receive loop exited");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("scan_head_id", &self.scan_head_id)
            .field("serial", &self.serial)
            .field("state", &self.state())
            .finish()
    }
}
