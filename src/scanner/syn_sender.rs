//! SYN probe construction and injection.
//!
//! A `ProbeTemplate` holds the per-session header values (addresses, source
//! port, TTL). It is never mutated: every probe copies it and fills in the
//! destination port, the sequence number chosen by the caller and a fresh
//! IP identification.
//!
//! Sequence numbers come from a `SequenceKey`: each scan operation draws a
//! random key and derives every probe's ISN from it and the port, so a reply
//! can be checked against `isn + 1` without any per-probe state.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rand::Rng;

use super::error::ScanError;
use super::frame::{
    self, EthernetHeader, Ipv4Header, MacAddr, TcpFlags, TcpHeader, ETHERTYPE_IPV4, IPPROTO_TCP,
};
use super::handle::PacketHandle;

/// Window advertised in every SYN.
const SYN_WINDOW: u16 = 64240;

/// Immutable header template for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTemplate {
    pub eth: EthernetHeader,
    pub ip: Ipv4Header,
    pub tcp: TcpHeader,
}

impl ProbeTemplate {
    pub fn new(
        local_mac: MacAddr,
        next_hop_mac: MacAddr,
        source: Ipv4Addr,
        destination: Ipv4Addr,
        source_port: u16,
        ttl: u8,
    ) -> Self {
        Self {
            eth: EthernetHeader {
                dst: next_hop_mac,
                src: local_mac,
                ether_type: ETHERTYPE_IPV4,
            },
            ip: Ipv4Header {
                src: source,
                dst: destination,
                ttl,
                identification: 0,
                protocol: IPPROTO_TCP,
            },
            tcp: TcpHeader {
                src_port: source_port,
                dst_port: 0,
                seq: 0,
                ack: 0,
                flags: TcpFlags::SYN,
                window: SYN_WINDOW,
            },
        }
    }

    /// Headers for a probe to `port` with the given sequence number and IP id.
    pub fn headers_for(&self, port: u16, seq: u32, ip_id: u16) -> (EthernetHeader, Ipv4Header, TcpHeader) {
        let mut ip = self.ip;
        ip.identification = ip_id;
        let mut tcp = self.tcp;
        tcp.dst_port = port;
        tcp.seq = seq;
        (self.eth, ip, tcp)
    }

    /// Serialized SYN frame for `port` carrying sequence number `isn`.
    pub fn frame_for(&self, port: u16, isn: u32) -> Result<Vec<u8>, ScanError> {
        let (eth, ip, tcp) = self.headers_for(port, isn, rand::thread_rng().gen());
        frame::serialize_tcp_frame(&eth, &ip, &tcp)
    }
}

/// Per-operation secret from which probe sequence numbers are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceKey {
    secret: u32,
}

impl SequenceKey {
    pub fn new(secret: u32) -> Self {
        Self { secret }
    }

    pub fn random() -> Self {
        Self::new(rand::thread_rng().gen())
    }

    /// Initial sequence number of the SYN sent to `port`.
    pub fn isn(&self, port: u16) -> u32 {
        let mut x = self.secret ^ u32::from(port).wrapping_mul(0x9e37_79b9);
        x ^= x >> 16;
        x = x.wrapping_mul(0x85eb_ca6b);
        x ^ (x >> 13)
    }

    /// Whether `ack` acknowledges the SYN sent to `port`.
    pub fn acknowledges(&self, port: u16, ack: u32) -> bool {
        ack == self.isn(port).wrapping_add(1)
    }
}

/// Sends SYN probes through a shared packet handle.
///
/// Holds the handle, the resolved next-hop address (inside the template) and
/// nothing else; timestamping belongs to the caller.
pub struct SynScanner {
    handle: Arc<dyn PacketHandle>,
    template: ProbeTemplate,
    probe_counter: AtomicU32,
}

impl SynScanner {
    pub fn new(handle: Arc<dyn PacketHandle>, template: ProbeTemplate) -> Self {
        Self {
            handle,
            template,
            probe_counter: AtomicU32::new(0),
        }
    }

    pub fn handle(&self) -> &Arc<dyn PacketHandle> {
        &self.handle
    }

    /// Number of probes successfully written.
    pub fn probes_sent(&self) -> u32 {
        self.probe_counter.load(Ordering::Relaxed)
    }

    /// Send one SYN to `port` now, with sequence number `isn`.
    ///
    /// # Errors
    /// `ScanError::Serialization` if the frame cannot be built,
    /// `ScanError::Write` if the handle rejects it.
    pub fn send_syn(&self, port: u16, isn: u32) -> Result<(), ScanError> {
        let bytes = self.template.frame_for(port, isn)?;
        self.handle.write_frame(&bytes)?;
        self.probe_counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(port, isn, "SYN sent");
        Ok(())
    }
}
