//! Data-link SYN scanner.
//!
//! Frame codec, raw packet handle, ARP next-hop resolution, SYN probe
//! sending and response classification. `crate::engine` wires these into
//! scan sessions.

pub mod arp;
pub mod collector;
pub mod error;
pub mod frame;
pub mod handle;
pub mod syn_sender;

pub use arp::{NeighborResolver, ResolverState};
pub use collector::{
    classify_flags, CorrelationMap, ListenerStats, ResponseClassifier, ResponseListener,
    VerdictLog,
};
pub use error::ScanError;
pub use frame::{Flow, MacAddr, TcpFlags};
pub use handle::{open_handle, MockHandle, PacketHandle, RxFrame};
pub use syn_sender::{ProbeTemplate, SequenceKey, SynScanner};
