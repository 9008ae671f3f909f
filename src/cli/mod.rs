//! CLI entrypoint for halfscan.
//!
//! Parses arguments, resolves the target and its route, opens a scan session
//! and runs either a single-port probe or a concurrent port scan.

pub mod output;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use crate::{PortResult, PortSpec, RouteInfo, ScanConfig, ScanError, ScanResult, Session};

pub use output::{format_json, format_pretty};

// ─────────────────────────────────────────────────────────────────────────────
// CLI definition
// ─────────────────────────────────────────────────────────────────────────────

/// Halfscan: half-open TCP port scanner working at the data-link layer.
#[derive(Parser, Debug)]
#[command(name = "halfscan", version, about)]
#[command(
    long_about = "Halfscan resolves the next hop with ARP, injects raw SYN frames on the \
    outgoing interface and classifies replies as open, closed, filtered or unknown. \
    Requires CAP_NET_RAW (sudo) on Linux."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Target IP address or hostname (for the default scan)
    pub target: Option<String>,

    #[command(flatten)]
    pub options: ScanOptions,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Port scan (default)
    Scan(ScanArgs),
}

/// Arguments for the `scan` subcommand.
#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Target IP address or hostname
    pub target: String,

    #[command(flatten)]
    pub options: ScanOptions,
}

/// Options shared by the default command and `scan`.
#[derive(Args, Debug, Clone)]
pub struct ScanOptions {
    /// Probe a single port and wait for its reply
    #[arg(long, conflicts_with = "ports")]
    pub port: Option<u16>,

    /// Port specification: "80", "20-25", "22,80,443" (default: 0-1023)
    #[arg(long)]
    pub ports: Option<String>,

    /// Single-port reply timeout in milliseconds
    #[arg(long, default_value = "1000")]
    pub timeout: u64,

    /// Overall budget of a multi-port scan in milliseconds
    #[arg(long, default_value = "3000")]
    pub budget: u64,

    /// TCP source port of every probe
    #[arg(long, default_value = "54321")]
    pub source_port: u16,

    /// Outgoing interface (auto-detect from the routing table if omitted)
    #[arg(long, env = "HALFSCAN_INTERFACE")]
    pub interface: Option<String>,

    /// Output format
    #[arg(long, default_value = "pretty", value_enum)]
    pub output: OutputFmt,

    /// Only report ports that replied
    #[arg(long)]
    pub no_filtered: bool,
}

impl ScanOptions {
    /// Session configuration for these options.
    pub fn config(&self) -> ScanConfig {
        ScanConfig {
            single_port_timeout: Duration::from_millis(self.timeout),
            range_budget: Duration::from_millis(self.budget),
            source_port: self.source_port,
            report_unanswered: !self.no_filtered,
            ..ScanConfig::default()
        }
    }

    /// Ports to scan when no single `--port` was given.
    pub fn port_spec(&self) -> Result<PortSpec, String> {
        match &self.ports {
            Some(spec) => PortSpec::parse(spec),
            None => Ok(PortSpec::WELL_KNOWN),
        }
    }
}

/// Output format argument.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFmt {
    Pretty,
    Json,
}

// ─────────────────────────────────────────────────────────────────────────────
// DNS resolution
// ─────────────────────────────────────────────────────────────────────────────

/// Resolve a hostname or IP literal to an address, preferring IPv4.
pub fn resolve_target(target: &str) -> Result<IpAddr, String> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(ip);
    }
    use std::net::ToSocketAddrs;
    let addrs: Vec<IpAddr> = format!("{target}:0")
        .to_socket_addrs()
        .map_err(|e| format!("DNS resolution failed for '{target}': {e}"))?
        .map(|a| a.ip())
        .collect();
    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| format!("no address found for '{target}'"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Scan
// ─────────────────────────────────────────────────────────────────────────────

/// Run a scan and return the report.
///
/// Requires Linux with CAP_NET_RAW. Setup failures (routing, handle, ARP)
/// are returned as errors; once scanning starts the report always carries
/// every verdict collected.
pub async fn run_scan(target: &str, options: &ScanOptions) -> Result<ScanResult, String> {
    let start = Instant::now();
    let target_ip = resolve_target(target)?;
    let config = options.config();

    let route = RouteInfo::resolve(target_ip, options.interface.as_deref())
        .map_err(|e| e.to_string())?;
    let interface = route.interface.name.clone();

    // Handle open and ARP resolution block for up to `arp_timeout`.
    let session = tokio::task::spawn_blocking(move || Session::open(route, config))
        .await
        .map_err(|e| format!("session setup aborted: {e}"))?
        .map_err(|e: ScanError| e.to_string())?;
    let session = Arc::new(session);

    let ports: Vec<PortResult> = match options.port {
        Some(port) => {
            let probe = Arc::clone(&session);
            let result = tokio::task::spawn_blocking(move || probe.scan_single_port(port))
                .await
                .map_err(|e| format!("probe aborted: {e}"))?;
            vec![result]
        }
        None => match options.port_spec()? {
            PortSpec::Range { start, end } => session
                .scan_range(start, end)
                .await
                .map_err(|e| e.to_string())?,
            spec @ PortSpec::Explicit(_) => session.scan_ports(&spec.expand()).await,
        },
    };

    Ok(ScanResult {
        request_id: Uuid::new_v4(),
        target_ip,
        interface,
        ports,
        duration_ms: start.elapsed().as_millis() as u64,
        scanned_at: Utc::now(),
    })
}
