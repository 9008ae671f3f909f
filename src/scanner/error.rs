//! Error taxonomy for scan sessions.
//!
//! `Routing`, `Open` and `ResolutionTimeout` are setup-time failures and abort
//! the session before any probe is sent. `Serialization`, `Write` and `Read`
//! happen during scanning and are contained by the caller.

use std::net::Ipv4Addr;
use std::time::Duration;

/// Error from scanner operations.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("no route to host: {0}")]
    Routing(String),

    #[error("cannot open capture handle (requires CAP_NET_RAW): {0}")]
    Open(String),

    #[error("no ARP reply from {target} within {waited:?}")]
    ResolutionTimeout { target: Ipv4Addr, waited: Duration },

    #[error("frame serialization failed: {0}")]
    Serialization(String),

    #[error("frame write failed: {0}")]
    Write(String),

    #[error("frame read failed: {0}")]
    Read(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid port range: {start} > {end}")]
    InvalidPortRange { start: u16, end: u16 },
}
