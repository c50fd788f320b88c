//! In-process scan head for integration tests: real TCP control and data
//! listeners on loopback, scripted liveness behaviour, and a datagram
//! builder for injecting profile data.

// Each test binary uses a different subset of this module.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use triscan::config::Version;
use triscan::wire::codec::ByteWriter;
use triscan::wire::control::{read_frame, write_frame, ControlMessage, ScanHeadStatus};
use triscan::wire::header::{ContentType, DataTypeSet, PACKET_MAGIC};

pub struct MockScanHead {
    pub serial: u32,
    pub control_addr: SocketAddr,
    pub data_addr: SocketAddr,
    pub heartbeat_enabled: Arc<AtomicBool>,
    data_tx: mpsc::UnboundedSender<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockScanHead {
    pub async fn start(serial: u32, firmware: Version, detected_cameras: u8) -> Self {
        let control_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let data_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control_addr = control_listener.local_addr().unwrap();
        let data_addr = data_listener.local_addr().unwrap();

        let heartbeat_enabled = Arc::new(AtomicBool::new(true));
        let (data_tx, data_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let hb = heartbeat_enabled.clone();
        let control_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = control_listener.accept().await else {
                    break;
                };
                let hb = hb.clone();
                tokio::spawn(serve_control(stream, firmware, detected_cameras, hb));
            }
        });

        let data_task = tokio::spawn(async move {
            let Ok((mut stream, _)) = data_listener.accept().await else {
                return;
            };
            let mut data_rx = data_rx;
            while let Some(datagram) = data_rx.recv().await {
                if write_frame(&mut stream, &datagram).await.is_err() {
                    break;
                }
            }
            // Channel closed: drop the stream so the client sees PeerClosed.
        });

        Self {
            serial,
            control_addr,
            data_addr,
            heartbeat_enabled,
            data_tx,
            tasks: vec![control_task, data_task],
        }
    }

    /// Queue one datagram for the connected data socket.
    pub fn send_datagram(&self, datagram: Vec<u8>) {
        let _ = self.data_tx.send(datagram);
    }

    /// Stop answering heartbeats, as a hung device would.
    pub fn stop_heartbeats(&self) {
        self.heartbeat_enabled.store(false, Ordering::Relaxed);
    }

    /// Tear everything down, closing both sockets.
    pub fn kill(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for MockScanHead {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn serve_control(
    mut stream: TcpStream,
    firmware: Version,
    detected_cameras: u8,
    heartbeat_enabled: Arc<AtomicBool>,
) {
    loop {
        let Ok(payload) = read_frame(&mut stream).await else {
            break;
        };
        let Ok(message) = ControlMessage::decode(&payload) else {
            break;
        };
        let reply = match message {
            ControlMessage::RequestStatus => Some(ControlMessage::StatusReply(ScanHeadStatus {
                firmware,
                detected_cameras,
                min_scan_period_us: 200,
                profiles_sent: 0,
                max_temperature_c: 35,
            })),
            ControlMessage::HeartBeat => {
                if heartbeat_enabled.load(Ordering::Relaxed) {
                    Some(ControlMessage::HeartBeatReply { scanning: false })
                } else {
                    // Swallow the request; the client's deadline expires.
                    None
                }
            }
            _ => None,
        };
        if let Some(reply) = reply {
            if write_frame(&mut stream, &reply.encode()).await.is_err() {
                break;
            }
        }
    }
}

/// Single-datagram XY+brightness profile whose X samples equal their column
/// index.
pub fn xy_datagram(
    scan_head_id: u8,
    camera: u8,
    laser: u8,
    timestamp_ns: u64,
    sequence: u32,
    columns: u16,
) -> Vec<u8> {
    xy_fragment(
        scan_head_id,
        camera,
        laser,
        timestamp_ns,
        sequence,
        columns,
        1,
        0,
        1,
    )
}

/// One fragment of an XY+brightness profile split over `total` datagrams at
/// column stride `step`. X samples equal their column index.
#[allow(clippy::too_many_arguments)]
pub fn xy_fragment(
    scan_head_id: u8,
    camera: u8,
    laser: u8,
    timestamp_ns: u64,
    sequence: u32,
    columns: u16,
    step: u16,
    position: u32,
    total: u32,
) -> Vec<u8> {
    let mut set = DataTypeSet::empty();
    set.insert(ContentType::Xy);
    set.insert(ContentType::Brightness);

    let mut w = ByteWriter::new();
    w.write_u16(PACKET_MAGIC);
    w.write_u16(300); // exposure_time_us
    w.write_u8(scan_head_id);
    w.write_u8(camera);
    w.write_u8(laser);
    w.write_u8(0); // flags
    w.write_u64(timestamp_ns);
    w.write_u16(120); // laser_on_time_us
    w.write_u16(set.0);
    w.write_u16(0); // data_length
    w.write_u8(1); // number_encoders
    w.write_u8(0); // reserved
    w.write_u32(position);
    w.write_u32(total);
    w.write_u16(0); // start_column
    w.write_u16(columns - 1); // end_column
    w.write_u32(sequence);
    w.write_u16(step); // XY step
    w.write_u16(step); // brightness step
    w.write_i64(4096); // encoder 0

    let strided = columns as usize / step as usize;
    let base = strided / total as usize;
    let remainder = strided % total as usize;
    let num_vals = base + usize::from((position as usize) < remainder);
    let col = |k: usize| (position as usize + k * total as usize) * step as usize;
    for k in 0..num_vals {
        w.write_i16(col(k) as i16);
        w.write_i16(-(col(k) as i16));
    }
    for k in 0..num_vals {
        w.write_u8(col(k) as u8);
    }
    w.into_vec()
}
