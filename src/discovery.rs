//! Scan head discovery over UDP broadcast.
//!
//! A probe carrying the client API version is broadcast from every
//! non-loopback IPv4 interface; a single socket on `0.0.0.0` would miss
//! devices on multi-homed hosts. Replies arriving within the 200 ms window
//! are merged by serial number. Devices answer from their control address,
//! so the reply's source tells us where to connect.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::{ProductType, Version, API_VERSION, DISCOVERY_PORT, DISCOVERY_REPLY_WINDOW_MS};
use crate::error::{ScanError, ScanResult};
use crate::wire::codec::{ByteReader, ByteWriter};

/// First u32 of a discovery probe.
pub const PROBE_MAGIC: u32 = 0xD15C_0001;

/// First u32 of a discovery reply.
pub const REPLY_MAGIC: u32 = 0xD15C_0002;

/// Activity state a device reports in its discovery reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// Powered and unclaimed.
    Idle,
    /// Claimed by some client.
    Connected,
    /// Actively scanning.
    Scanning,
    /// Unrecognized state id.
    Unknown,
}

impl DeviceState {
    fn from_wire(v: u8) -> Self {
        match v {
            0 => DeviceState::Idle,
            1 => DeviceState::Connected,
            2 => DeviceState::Scanning,
            _ => DeviceState::Unknown,
        }
    }
}

/// One scan head seen on the network.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Device serial number.
    pub serial: u32,
    /// Product model.
    pub product_type: ProductType,
    /// Firmware version.
    pub firmware: Version,
    /// Address the device serves control and data connections on.
    pub ip_server: Ipv4Addr,
    /// Local interface address the reply arrived on.
    pub ip_client: Ipv4Addr,
    /// Negotiated link speed in Mbit/s.
    pub link_speed_mbps: u16,
    /// Device activity state.
    pub state: DeviceState,
}

impl DiscoveredDevice {
    /// A device is usable iff its firmware major version matches the
    /// client's.
    pub fn is_compatible(&self) -> bool {
        self.firmware.is_compatible_with_api()
    }
}

/// Encode the broadcast probe.
fn encode_probe() -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(16);
    w.write_u32(PROBE_MAGIC);
    w.write_u32(API_VERSION.major);
    w.write_u32(API_VERSION.minor);
    w.write_u32(API_VERSION.patch);
    w.into_vec()
}

/// Parse one discovery reply.
fn parse_reply(buf: &[u8], source: SocketAddr, local: Ipv4Addr) -> ScanResult<DiscoveredDevice> {
    let mut r = ByteReader::new(buf);
    let magic = r.read_u32()?;
    if magic != REPLY_MAGIC {
        return Err(ScanError::BadMagic((magic & 0xFFFF) as u16));
    }
    let serial = r.read_u32()?;
    let product_type = ProductType::from_wire(r.read_u16()?);
    let firmware = Version::new(r.read_u32()?, r.read_u32()?, r.read_u32()?);
    let ip_server = Ipv4Addr::from(r.read_u32()?);
    let link_speed_mbps = r.read_u16()?;
    let state = DeviceState::from_wire(r.read_u8()?);

    // Prefer the address the reply actually came from; the advertised one
    // can be stale right after DHCP renewal.
    let ip_server = match source.ip() {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => ip_server,
    };
    Ok(DiscoveredDevice {
        serial,
        product_type,
        firmware,
        ip_server,
        ip_client: local,
        link_speed_mbps,
        state,
    })
}

/// Build a reply payload. Used by the in-process mock head in tests and by
/// nothing else; devices implement this format in firmware.
pub fn encode_reply(device: &DiscoveredDevice) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(32);
    w.write_u32(REPLY_MAGIC);
    w.write_u32(device.serial);
    w.write_u16(device.product_type.to_wire());
    w.write_u32(device.firmware.major);
    w.write_u32(device.firmware.minor);
    w.write_u32(device.firmware.patch);
    w.write_u32(u32::from(device.ip_server));
    w.write_u16(device.link_speed_mbps);
    w.write_u8(match device.state {
        DeviceState::Idle => 0,
        DeviceState::Connected => 1,
        DeviceState::Scanning => 2,
        DeviceState::Unknown => 0xFF,
    });
    w.into_vec()
}

/// Broadcast address from an interface address and mask, computed on the
/// raw 32-bit values so non-octet-aligned masks work.
fn broadcast_address(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

/// Probe every non-loopback IPv4 interface and merge the replies by serial.
///
/// Interface failures are logged and skipped; discovery succeeds with
/// whatever the healthy interfaces saw.
pub async fn discover() -> ScanResult<HashMap<u32, DiscoveredDevice>> {
    let interfaces = if_addrs::get_if_addrs()?;
    let mut probes = Vec::new();
    for iface in interfaces {
        if iface.is_loopback() {
            continue;
        }
        if let if_addrs::IfAddr::V4(v4) = iface.addr {
            let broadcast = v4
                .broadcast
                .unwrap_or_else(|| broadcast_address(v4.ip, v4.netmask));
            probes.push(probe_interface(v4.ip, broadcast));
        }
    }

    let mut devices = HashMap::new();
    for result in join_all(probes).await {
        match result {
            Ok(found) => {
                for device in found {
                    devices.insert(device.serial, device);
                }
            }
            Err(err) => warn!(%err, "discovery probe failed on one interface"),
        }
    }
    Ok(devices)
}

/// Probe one interface and collect replies for the reply window.
///
/// `target` is broken out so tests can point the probe at a loopback mock
/// instead of a real broadcast domain.
pub async fn probe_target(
    local: Ipv4Addr,
    target: SocketAddr,
    broadcast: bool,
) -> ScanResult<Vec<DiscoveredDevice>> {
    let socket = UdpSocket::bind(SocketAddr::from((local, 0))).await?;
    if broadcast {
        socket.set_broadcast(true)?;
    }
    socket.send_to(&encode_probe(), target).await?;

    let mut found = Vec::new();
    let mut buf = [0u8; 128];
    let deadline =
        tokio::time::Instant::now() + Duration::from_millis(DISCOVERY_REPLY_WINDOW_MS);
    loop {
        let recv = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
        match recv {
            Ok(Ok((len, source))) => match parse_reply(&buf[..len], source, local) {
                Ok(device) => {
                    debug!(
                        serial = device.serial,
                        ip = %device.ip_server,
                        firmware = %device.firmware,
                        "discovered scan head"
                    );
                    found.push(device);
                }
                Err(err) => debug!(%err, "ignoring malformed discovery reply"),
            },
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => break, // window elapsed
        }
    }
    Ok(found)
}

async fn probe_interface(
    local: Ipv4Addr,
    broadcast: Ipv4Addr,
) -> ScanResult<Vec<DiscoveredDevice>> {
    probe_target(local, SocketAddr::from((broadcast, DISCOVERY_PORT)), true).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(serial: u32) -> DiscoveredDevice {
        DiscoveredDevice {
            serial,
            product_type: ProductType::Vx200,
            firmware: Version::new(API_VERSION.major, 1, 7),
            ip_server: Ipv4Addr::new(192, 168, 0, 15),
            ip_client: Ipv4Addr::LOCALHOST,
            link_speed_mbps: 1000,
            state: DeviceState::Idle,
        }
    }

    #[test]
    fn test_reply_roundtrip() {
        let original = device(700_321);
        let encoded = encode_reply(&original);
        let parsed = parse_reply(
            &encoded,
            SocketAddr::from((Ipv4Addr::new(192, 168, 0, 15), 12347)),
            Ipv4Addr::LOCALHOST,
        )
        .unwrap();
        assert_eq!(parsed.serial, 700_321);
        assert_eq!(parsed.product_type, ProductType::Vx200);
        assert_eq!(parsed.ip_server, Ipv4Addr::new(192, 168, 0, 15));
        assert_eq!(parsed.link_speed_mbps, 1000);
        assert_eq!(parsed.state, DeviceState::Idle);
        assert!(parsed.is_compatible());
    }

    #[test]
    fn test_reply_source_overrides_advertised_ip() {
        let encoded = encode_reply(&device(1));
        let parsed = parse_reply(
            &encoded,
            SocketAddr::from((Ipv4Addr::new(10, 0, 0, 9), 12347)),
            Ipv4Addr::LOCALHOST,
        )
        .unwrap();
        assert_eq!(parsed.ip_server, Ipv4Addr::new(10, 0, 0, 9));
    }

    #[test]
    fn test_incompatible_major_version() {
        let mut incompatible = device(2);
        incompatible.firmware = Version::new(API_VERSION.major + 1, 0, 0);
        let encoded = encode_reply(&incompatible);
        let parsed = parse_reply(
            &encoded,
            SocketAddr::from((Ipv4Addr::LOCALHOST, 12347)),
            Ipv4Addr::LOCALHOST,
        )
        .unwrap();
        assert!(!parsed.is_compatible());
    }

    #[test]
    fn test_broadcast_address_non_octet_mask() {
        // /25 network: host bits span the last 7 bits.
        let broadcast = broadcast_address(
            Ipv4Addr::new(192, 168, 1, 130),
            Ipv4Addr::new(255, 255, 255, 128),
        );
        assert_eq!(broadcast, Ipv4Addr::new(192, 168, 1, 255));
    }

    #[tokio::test]
    async fn test_probe_against_loopback_responder() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = responder.recv_from(&mut buf).await.unwrap();
            let mut r = ByteReader::new(&buf[..len]);
            assert_eq!(r.read_u32().unwrap(), PROBE_MAGIC);
            responder
                .send_to(&encode_reply(&device(42)), from)
                .await
                .unwrap();
        });

        let found = probe_target(Ipv4Addr::LOCALHOST, responder_addr, false)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].serial, 42);
    }
}
