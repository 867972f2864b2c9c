//! LAN device search via UDP multicast.
//!
//! [`LanSearch`] sends a probe datagram to the search group and collects the
//! replies devices send back within the timeout. Each reply is decoded into a
//! raw `UID:IP:PORT` record; the session layer parses those records.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

/// First byte of a search probe.
pub const PROBE_MAGIC: u8 = 0xFC;
/// First byte of a device reply.
pub const REPLY_MAGIC: u8 = 0xFD;
/// Multicast group devices listen on for search probes.
pub const SEARCH_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const SEARCH_PORT: u16 = 10000;
/// Minimum length of a reply carrying UID, IP and port.
pub const REPLY_LEN: usize = 42;

/// Configuration for a LAN search.
#[derive(Debug, Clone)]
pub struct LanSearchConfig {
    /// Where probes are sent. Defaults to the multicast search group.
    pub target: SocketAddr,
    /// Number of probe rounds spread across the timeout.
    pub retries: u32,
    /// Stop early once this many distinct devices answered.
    pub max_devices: usize,
}

impl Default for LanSearchConfig {
    fn default() -> Self {
        Self {
            target: SocketAddr::new(IpAddr::V4(SEARCH_GROUP), SEARCH_PORT),
            retries: 2,
            max_devices: 16,
        }
    }
}

/// One-shot multicast search for devices on the local network.
#[derive(Debug, Clone, Default)]
pub struct LanSearch {
    config: LanSearchConfig,
}

impl LanSearch {
    pub fn new(config: LanSearchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LanSearchConfig {
        &self.config
    }

    /// Run the search for `timeout` and return raw `UID:IP:PORT` records.
    ///
    /// Socket failures are logged and produce an empty list; discovery is
    /// advisory and the caller can simply retry.
    pub async fn search(&self, timeout: Duration) -> Vec<String> {
        match self.run(timeout).await {
            Ok(records) => records,
            Err(e) => {
                warn!("LAN search failed: {e}");
                Vec::new()
            }
        }
    }

    async fn run(&self, timeout: Duration) -> std::io::Result<Vec<String>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_multicast_ttl_v4(1)?;

        let rounds = self.config.retries.max(1);
        let window = timeout / rounds;
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        let mut buf = vec![0u8; 1024];

        for round in 0..rounds {
            let probe = encode_probe(unix_now(), rand::random::<u32>());
            socket.send_to(&probe, self.config.target).await?;
            trace!("LAN probe round {round} sent to {}", self.config.target);

            let deadline = tokio::time::Instant::now() + window;
            loop {
                let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
                let (len, from) = match received {
                    Err(_) => break,
                    Ok(Ok(pair)) => pair,
                    Ok(Err(e)) => {
                        debug!("LAN search recv error: {e}");
                        break;
                    }
                };
                let Some(record) = decode_reply(&buf[..len]) else {
                    trace!("Ignoring {len}-byte datagram from {from}");
                    continue;
                };
                if seen.insert(record.clone()) {
                    debug!("LAN search reply from {from}: {record}");
                    records.push(record);
                }
            }

            if records.len() >= self.config.max_devices {
                break;
            }
        }

        Ok(records)
    }
}

/// Build a 16-byte search probe.
pub fn encode_probe(timestamp: u32, nonce: u32) -> [u8; 16] {
    let mut packet = [0u8; 16];
    packet[0] = PROBE_MAGIC;
    packet[2..4].copy_from_slice(&12u16.to_be_bytes());
    packet[4..8].copy_from_slice(&timestamp.to_be_bytes());
    packet[8..12].copy_from_slice(&nonce.to_be_bytes());
    packet
}

/// Decode a device reply into a `UID:IP:PORT` record.
pub fn decode_reply(data: &[u8]) -> Option<String> {
    if data.len() < REPLY_LEN || data[0] != REPLY_MAGIC {
        return None;
    }
    let uid = ascii_field(&data[4..24]);
    let ip = ascii_field(&data[24..40]);
    let port = u16::from_be_bytes([data[40], data[41]]);
    if uid.is_empty() || ip.is_empty() {
        return None;
    }
    Some(format!("{uid}:{ip}:{port}"))
}

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) fn encode_reply(uid: &str, ip: &str, port: u16) -> Vec<u8> {
    let mut packet = vec![0u8; REPLY_LEN];
    packet[0] = REPLY_MAGIC;
    packet[4..4 + uid.len()].copy_from_slice(uid.as_bytes());
    packet[24..24 + ip.len()].copy_from_slice(ip.as_bytes());
    packet[40..42].copy_from_slice(&port.to_be_bytes());
    packet
}
