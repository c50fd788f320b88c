//! ScanSync encoder beacon receiver.
//!
//! ScanSync units broadcast a 32-byte big-endian beacon several hundred
//! times a second:
//!
//! ```text
//! offset  size  field
//!  0      4     i32 serial
//!  4      4     i32 sequence
//!  8      4     i32 encoder_timestamp_s
//! 12      4     i32 encoder_timestamp_ns
//! 16      4     i32 last_timestamp_s
//! 20      4     i32 last_timestamp_ns
//! 24      8     i64 encoder_value
//! ```
//!
//! One listener task per process maintains the latest beacon per serial.
//! Datagrams of any other length are dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::ScanResult;
use crate::wire::codec::ByteReader;

/// Wire size of one beacon.
pub const BEACON_SIZE: usize = 32;

/// Latest state reported by one ScanSync unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanSyncData {
    /// Unit serial number.
    pub serial: u32,
    /// Beacon sequence counter.
    pub sequence: i32,
    /// Timestamp of the most recent encoder edge, seconds part.
    pub encoder_timestamp_s: i32,
    /// Timestamp of the most recent encoder edge, nanoseconds part.
    pub encoder_timestamp_ns: i32,
    /// Timestamp of the beacon itself, seconds part.
    pub last_timestamp_s: i32,
    /// Timestamp of the beacon itself, nanoseconds part.
    pub last_timestamp_ns: i32,
    /// Signed encoder tick count.
    pub encoder_value: i64,
}

impl ScanSyncData {
    /// Beacon timestamp as total nanoseconds of server clock.
    pub fn last_timestamp_total_ns(&self) -> u64 {
        self.last_timestamp_s as u64 * 1_000_000_000 + self.last_timestamp_ns as u64
    }

    fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() != BEACON_SIZE {
            return None;
        }
        let mut r = ByteReader::new(buf);
        // Reads cannot fail after the length check.
        Some(Self {
            serial: r.read_i32().ok()? as u32,
            sequence: r.read_i32().ok()?,
            encoder_timestamp_s: r.read_i32().ok()?,
            encoder_timestamp_ns: r.read_i32().ok()?,
            last_timestamp_s: r.read_i32().ok()?,
            last_timestamp_ns: r.read_i32().ok()?,
            encoder_value: r.read_i64().ok()?,
        })
    }
}

/// Background UDP listener tracking the latest beacon per serial.
#[derive(Debug)]
pub struct ScanSyncReceiver {
    latest: Arc<Mutex<HashMap<u32, ScanSyncData>>>,
    local: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ScanSyncReceiver {
    /// Bind the standard ScanSync ingress port and start listening.
    pub async fn start() -> ScanResult<Self> {
        Self::start_on(SocketAddr::from(([0, 0, 0, 0], crate::config::SCANSYNC_PORT))).await
    }

    /// Bind an explicit address; tests use an ephemeral loopback port.
    pub async fn start_on(addr: SocketAddr) -> ScanResult<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local = socket.local_addr()?;
        info!(%local, "scansync listener started");

        let latest = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let map = latest.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    recv = socket.recv_from(&mut buf) => {
                        let Ok((len, _)) = recv else { break };
                        match ScanSyncData::parse(&buf[..len]) {
                            Some(data) => {
                                let mut map = match map.lock() {
                                    Ok(map) => map,
                                    Err(poisoned) => poisoned.into_inner(),
                                };
                                map.insert(data.serial, data);
                            }
                            None => debug!(len, "dropping beacon with invalid length"),
                        }
                    }
                }
            }
        });
        Ok(Self {
            latest,
            local,
            shutdown_tx,
            task,
        })
    }

    /// Address the listener is bound to (ephemeral in tests).
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Serials of every unit heard from, ascending.
    pub fn serials(&self) -> Vec<u32> {
        let map = match self.latest.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut serials: Vec<u32> = map.keys().copied().collect();
        serials.sort_unstable();
        serials
    }

    /// Latest beacon from `serial`, if any has arrived.
    pub fn latest(&self, serial: u32) -> Option<ScanSyncData> {
        let map = match self.latest.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(&serial).copied()
    }

    /// The main unit: lowest serial seen, by convention.
    pub fn main(&self) -> Option<ScanSyncData> {
        let map = match self.latest.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.values().min_by_key(|d| d.serial).copied()
    }

    /// Stop the listener task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::codec::ByteWriter;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn encode_beacon(serial: u32, encoder_value: i64, last_s: i32, last_ns: i32) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(BEACON_SIZE);
        w.write_i32(serial as i32);
        w.write_i32(17);
        w.write_i32(last_s);
        w.write_i32(last_ns - 500);
        w.write_i32(last_s);
        w.write_i32(last_ns);
        w.write_i64(encoder_value);
        w.into_vec()
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        assert!(ScanSyncData::parse(&[0u8; 31]).is_none());
        assert!(ScanSyncData::parse(&[0u8; 33]).is_none());
        assert!(ScanSyncData::parse(&[0u8; 32]).is_some());
    }

    #[test]
    fn test_total_ns() {
        let data = ScanSyncData::parse(&encode_beacon(9, 0, 3, 250)).unwrap();
        assert_eq!(data.last_timestamp_total_ns(), 3_000_000_250);
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_receiver_tracks_latest_per_serial() {
        let receiver = ScanSyncReceiver::start_on(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .await
            .unwrap();
        let target = receiver.local_addr();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        sender
            .send_to(&encode_beacon(900_200, 10, 1, 0), target)
            .await
            .unwrap();
        sender
            .send_to(&encode_beacon(900_100, 55, 1, 100), target)
            .await
            .unwrap();
        sender
            .send_to(&encode_beacon(900_100, 56, 1, 200), target)
            .await
            .unwrap();

        wait_for(|| receiver.serials().len() == 2 && receiver.latest(900_100).is_some_and(|d| d.encoder_value == 56)).await;
        assert_eq!(receiver.serials(), vec![900_100, 900_200]);
        // Lowest serial is the main unit.
        assert_eq!(receiver.main().unwrap().serial, 900_100);
        // Latest beacon wins.
        assert_eq!(receiver.latest(900_100).unwrap().encoder_value, 56);
        receiver.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_length_beacon_dropped() {
        let receiver = ScanSyncReceiver::start_on(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .await
            .unwrap();
        let target = receiver.local_addr();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(&[0u8; 17], target).await.unwrap();
        sender
            .send_to(&encode_beacon(7, 1, 0, 0), target)
            .await
            .unwrap();
        wait_for(|| !receiver.serials().is_empty()).await;
        assert_eq!(receiver.serials(), vec![7]);
        receiver.shutdown().await;
    }
}
