/// Relay identity, reports and liveness status
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Stable 64-bit relay id (FNV-1a over the relay name)
pub fn relay_id(name: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    name.bytes().fold(OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(PRIME)
    })
}

/// One relay's measurement of one destination relay over the last second
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelaySample {
    pub dest_relay_id: u64,
    /// Minimum RTT (ms)
    pub rtt: f32,
    /// One standard deviation of RTT (ms)
    pub jitter: f32,
    /// Packet loss (%)
    pub packet_loss: f32,
}

/// Periodic report sent by a relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayUpdate {
    pub relay_id: u64,
    pub relay_name: String,
    pub relay_address: SocketAddr,
    /// Unix seconds; 0 means "stamp on arrival"
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub sessions: u32,
    #[serde(default)]
    pub shutting_down: bool,
    #[serde(default)]
    pub samples: Vec<RelaySample>,
}

/// Relay directory entry (static metadata from the fleet database)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayInfo {
    pub id: u64,
    pub name: String,
    pub address: SocketAddr,
    #[serde(default)]
    pub datacenter_id: u64,
    #[serde(default)]
    pub latitude: f32,
    #[serde(default)]
    pub longitude: f32,
    /// Sessions may terminate at this relay
    #[serde(default = "default_dest")]
    pub dest: bool,
}

fn default_dest() -> bool {
    true
}

impl RelayInfo {
    pub fn new(name: &str, address: SocketAddr, datacenter_id: u64) -> Self {
        Self {
            id: relay_id(name),
            name: name.to_string(),
            address,
            datacenter_id,
            latitude: 0.0,
            longitude: 0.0,
            dest: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayStatus {
    Offline,
    Online,
    ShuttingDown,
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelayStatus::Offline => "offline",
            RelayStatus::Online => "online",
            RelayStatus::ShuttingDown => "shutting down",
        };
        write!(f, "{}", s)
    }
}

/// Relay as seen by the aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayReport {
    pub id: u64,
    pub name: String,
    pub address: Option<SocketAddr>,
    pub status: RelayStatus,
    pub sessions: u32,
    pub version: String,
    /// Unix seconds of the last report, if any
    pub last_update: Option<u64>,
}

impl RelayReport {
    /// Placeholder for a directory relay that never reported
    pub fn unseen(info: &RelayInfo) -> Self {
        Self {
            id: info.id,
            name: info.name.clone(),
            address: Some(info.address),
            status: RelayStatus::Offline,
            sessions: 0,
            version: String::new(),
            last_update: None,
        }
    }

    pub fn csv_row(&self) -> String {
        format!(
            "{},{},{:016x},{},{},{}",
            self.name,
            self.address.map(|a| a.to_string()).unwrap_or_default(),
            self.id,
            self.status,
            self.sessions,
            self.version
        )
    }
}

pub const RELAYS_CSV_HEADER: &str = "name,address,id,status,sessions,version";

/// Render reports as CSV (header included)
pub fn relays_csv(reports: &[RelayReport]) -> String {
    let mut csv = String::from(RELAYS_CSV_HEADER);
    csv.push('\n');
    for report in reports {
        csv.push_str(&report.csv_row());
        csv.push('\n');
    }
    csv
}
