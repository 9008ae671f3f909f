//! Halfscan: half-open (SYN) TCP port scanner working at the data-link layer.
//!
//! Resolves the next hop with ARP, injects hand-built Ethernet/IPv4/TCP
//! frames through a raw packet handle, and classifies captured replies into
//! per-port verdicts. Usable as a library or via the CLI.

pub mod cli;
pub mod engine;
pub mod route;
pub mod scanner;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use uuid::Uuid;

// Re-export key types for library users.
pub use engine::{ScanConfig, Session};
pub use route::{IpVersion, RouteInfo};
pub use scanner::error::ScanError;

// ─────────────────────────────────────────────────────────────────────────────
// Port state
// ─────────────────────────────────────────────────────────────────────────────

/// Verdict for a single probed port.
///
/// `Open`, `Closed` and `Unknown` come from a classified reply; `Filtered` is
/// synthesized by the orchestrator when no reply arrived inside the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    /// SYN+ACK received.
    Open,
    /// RST received.
    Closed,
    /// No reply before the scan window closed.
    Filtered,
    /// A flow-matching TCP segment that was neither RST nor SYN+ACK.
    Unknown,
}

impl PortState {
    /// String identifier used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Filtered => "filtered",
            Self::Unknown => "unknown",
        }
    }

    /// Returns true if the verdict was produced from an actual reply.
    pub fn had_response(&self) -> bool {
        !matches!(self, Self::Filtered)
    }
}

impl std::fmt::Display for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-port result
// ─────────────────────────────────────────────────────────────────────────────

/// Result for a single probed port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortResult {
    /// Port number that was probed.
    pub port: u16,
    /// Port verdict.
    pub state: PortState,
    /// Probe round-trip time. `None` when no reply arrived or the send
    /// timestamp was missing.
    pub duration: Option<Duration>,
}

impl PortResult {
    /// Verdict for a port that never answered.
    pub fn filtered(port: u16) -> Self {
        Self {
            port,
            state: PortState::Filtered,
            duration: None,
        }
    }

    /// Round-trip time, zero when not measured.
    pub fn rtt(&self) -> Duration {
        self.duration.unwrap_or(Duration::ZERO)
    }
}

impl std::fmt::Display for PortResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "port {} {} ({:?})",
            self.port,
            self.state,
            self.rtt()
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Port specification (parsed from CLI)
// ─────────────────────────────────────────────────────────────────────────────

/// Port specification: a single port, a range, or a comma-separated list.
///
/// Parsed from strings like "80", "0-1023", "22,80,443".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PortSpec {
    /// Explicit list of ports.
    Explicit(Vec<u16>),
    /// Contiguous port range (inclusive).
    Range { start: u16, end: u16 },
}

impl PortSpec {
    /// The well-known ports, 0 through 1023.
    pub const WELL_KNOWN: PortSpec = PortSpec::Range { start: 0, end: 1023 };

    /// Parse a port spec string ("80", "0-1023", "22,80,443").
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty port specification".to_string());
        }
        if s.contains('-') && !s.contains(',') {
            let (start, end) = s
                .split_once('-')
                .ok_or_else(|| format!("invalid port range: '{s}'"))?;
            let start = start
                .trim()
                .parse::<u16>()
                .map_err(|_| format!("invalid port range start: '{}'", start.trim()))?;
            let end = end
                .trim()
                .parse::<u16>()
                .map_err(|_| format!("invalid port range end: '{}'", end.trim()))?;
            if end < start {
                return Err(format!("invalid range: {start} > {end}"));
            }
            return Ok(Self::Range { start, end });
        }
        let ports: Result<Vec<u16>, _> = s
            .split(',')
            .map(|p| {
                p.trim()
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port: '{}'", p.trim()))
            })
            .collect();
        Ok(Self::Explicit(ports?))
    }

    /// Expand to a sorted, deduplicated list of port numbers.
    pub fn expand(&self) -> Vec<u16> {
        match self {
            Self::Explicit(ports) => {
                let mut v = ports.clone();
                v.sort_unstable();
                v.dedup();
                v
            }
            Self::Range { start, end } => (*start..=*end).collect(),
        }
    }
}

impl std::fmt::Display for PortSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Explicit(ports) => {
                let s: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
                write!(f, "{}", s.join(","))
            }
            Self::Range { start, end } => write!(f, "{start}-{end}"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scan report
// ─────────────────────────────────────────────────────────────────────────────

/// Result of one scan operation against a single target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    /// Unique identifier for this scan.
    pub request_id: Uuid,
    /// Scanned destination address.
    pub target_ip: IpAddr,
    /// Outgoing interface used for the session.
    pub interface: String,
    /// Per-port results, sorted by port.
    pub ports: Vec<PortResult>,
    /// Total scan duration in milliseconds (session setup included).
    pub duration_ms: u64,
    /// Timestamp when the scan completed.
    pub scanned_at: DateTime<Utc>,
}

impl ScanResult {
    /// Number of ports in the given state.
    pub fn count(&self, state: PortState) -> usize {
        self.ports.iter().filter(|p| p.state == state).count()
    }
}
