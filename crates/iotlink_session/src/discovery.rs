//! Local network discovery.
//!
//! [`DiscoveryCoordinator`] wraps the engine's raw LAN scan: it allows one
//! scan at a time, decodes `UID:HOST:PORT` records into [`DiscoveredDevice`]s
//! and keeps the last successful result list around.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use iotlink_engine::{ConnectivityEngine, DeviceUid};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::lifecycle::EngineLifecycle;

/// Extra time given to the engine beyond the requested scan window.
const SCAN_SLACK: Duration = Duration::from_millis(500);

/// Where a discovered device answered from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub host: String,
    pub port: u16,
}

impl DeviceAddress {
    /// The address as a socket address, when the host is a literal IP.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A device found by a LAN scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub uid: DeviceUid,
    pub address: DeviceAddress,
    /// The record as the engine reported it.
    pub raw_record: String,
}

/// Decode one `UID:HOST:PORT` record. Returns `None` for anything malformed.
///
/// The host may be an IPv6 literal, optionally bracketed, so the port is
/// split off from the right.
pub fn parse_record(raw: &str) -> Option<DiscoveredDevice> {
    let record = raw.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    let (uid, rest) = record.split_once(':')?;
    let (host, port) = rest.rsplit_once(':')?;

    let uid = DeviceUid::parse(uid.trim()).ok()?;
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    let port = port.trim().parse::<u16>().ok()?;

    Some(DiscoveredDevice {
        uid,
        address: DeviceAddress {
            host: host.to_string(),
            port,
        },
        raw_record: raw.to_string(),
    })
}

/// Decode a batch of records, skipping malformed ones and keeping the first
/// record for each UID.
pub fn parse_records(records: &[String]) -> Vec<DiscoveredDevice> {
    let mut devices: Vec<DiscoveredDevice> = Vec::with_capacity(records.len());
    for raw in records {
        let Some(device) = parse_record(raw) else {
            debug!("Dropping malformed discovery record: {raw:?}");
            continue;
        };
        if devices.iter().any(|d| d.uid == device.uid) {
            debug!("Dropping duplicate discovery record for {}", device.uid);
            continue;
        }
        devices.push(device);
    }
    devices
}

/// Releases the scan flag when dropped, including on panic.
struct ScanGuard<'a>(&'a AtomicBool);

impl<'a> ScanGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs LAN scans, one at a time.
pub struct DiscoveryCoordinator {
    engine: Arc<dyn ConnectivityEngine>,
    lifecycle: Arc<EngineLifecycle>,
    in_progress: AtomicBool,
    last_results: RwLock<Vec<DiscoveredDevice>>,
    default_timeout: Duration,
}

impl DiscoveryCoordinator {
    pub fn new(
        engine: Arc<dyn ConnectivityEngine>,
        lifecycle: Arc<EngineLifecycle>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            lifecycle,
            in_progress: AtomicBool::new(false),
            last_results: RwLock::new(Vec::new()),
            default_timeout,
        }
    }

    /// Whether a scan is currently running.
    pub fn is_scanning(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Scan the local network for up to `timeout`.
    ///
    /// Fails fast with [`LinkError::ScanAlreadyInProgress`] if another scan
    /// is running. Finding nothing is an empty list, not an error.
    pub async fn scan(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>, LinkError> {
        if !self.lifecycle.is_ready() {
            return Err(LinkError::NotInitialized);
        }
        let Some(_guard) = ScanGuard::acquire(&self.in_progress) else {
            warn!(op = "scan", outcome = "rejected", "Discovery scan already in progress");
            return Err(LinkError::ScanAlreadyInProgress);
        };

        debug!("Starting LAN scan ({}ms)", timeout.as_millis());
        let scan = self.engine.discover_lan(timeout);
        let records = match tokio::time::timeout(timeout + SCAN_SLACK, scan).await {
            Ok(records) => records,
            Err(_) => {
                warn!("Engine discovery overran its {}ms window", timeout.as_millis());
                Vec::new()
            }
        };

        let devices = parse_records(&records);
        info!(
            op = "scan",
            outcome = "ok",
            found = devices.len(),
            dropped = records.len() - devices.len(),
            "LAN scan finished"
        );
        *self.last_results.write() = devices.clone();
        Ok(devices)
    }

    /// Scan with the configured default timeout.
    pub async fn scan_default(&self) -> Result<Vec<DiscoveredDevice>, LinkError> {
        self.scan(self.default_timeout).await
    }

    /// Devices found by the most recent successful scan.
    pub fn last_results(&self) -> Vec<DiscoveredDevice> {
        self.last_results.read().clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
