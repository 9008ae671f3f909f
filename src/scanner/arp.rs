//! Next-hop hardware address resolution over ARP.
//!
//! Runs synchronously at session setup: one broadcast request, then reads
//! until a reply from the address being resolved arrives or the window
//! closes. Without a resolved address no probe can be delivered, so a timeout
//! is fatal for the session.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use super::error::ScanError;
use super::frame::{
    self, format_mac, ArpOperation, ArpPacket, EthernetHeader, MacAddr, BROADCAST_MAC,
    ETHERTYPE_ARP,
};
use super::handle::PacketHandle;

/// Default resolution window.
pub const ARP_TIMEOUT: Duration = Duration::from_secs(3);

/// Resolver progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    Idle,
    RequestSent { at: Instant },
    Resolved(MacAddr),
    TimedOut,
}

/// ARP resolver for one local interface.
pub struct NeighborResolver<'a> {
    handle: &'a dyn PacketHandle,
    local_mac: MacAddr,
    local_ip: Ipv4Addr,
    timeout: Duration,
    state: ResolverState,
}

impl<'a> NeighborResolver<'a> {
    pub fn new(
        handle: &'a dyn PacketHandle,
        local_mac: MacAddr,
        local_ip: Ipv4Addr,
        timeout: Duration,
    ) -> Self {
        Self {
            handle,
            local_mac,
            local_ip,
            timeout,
            state: ResolverState::Idle,
        }
    }

    pub fn state(&self) -> ResolverState {
        self.state
    }

    /// Resolve the hardware address of `target`.
    ///
    /// Only ARP packets whose sender protocol address equals `target` are
    /// accepted, so unrelated ARP traffic on a shared segment is ignored.
    /// Read errors are logged and the wait continues until the window closes.
    ///
    /// # Errors
    /// `ScanError::Serialization`/`Write` if the request cannot be sent;
    /// `ScanError::ResolutionTimeout` if no matching reply arrives in time.
    pub fn resolve(&mut self, target: Ipv4Addr) -> Result<MacAddr, ScanError> {
        let request = self.request_frame(target)?;
        let start = Instant::now();
        self.handle.write_frame(&request)?;
        self.state = ResolverState::RequestSent { at: start };
        tracing::debug!(target = %target, interface = self.handle.interface(), "ARP request sent");

        loop {
            if start.elapsed() >= self.timeout {
                self.state = ResolverState::TimedOut;
                tracing::warn!(target = %target, waited = ?self.timeout, "ARP resolution timed out");
                return Err(ScanError::ResolutionTimeout {
                    target,
                    waited: self.timeout,
                });
            }

            let rx = match self.handle.read_frame() {
                Ok(Some(rx)) => rx,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "capture read failed during ARP resolution");
                    continue;
                }
            };

            if let Some(mac) = match_reply(&rx.data, target) {
                self.state = ResolverState::Resolved(mac);
                tracing::info!(
                    target = %target,
                    mac = %format_mac(&mac),
                    elapsed = ?start.elapsed(),
                    "next hop resolved"
                );
                return Ok(mac);
            }
        }
    }

    fn request_frame(&self, target: Ipv4Addr) -> Result<Vec<u8>, ScanError> {
        let eth = EthernetHeader {
            dst: BROADCAST_MAC,
            src: self.local_mac,
            ether_type: ETHERTYPE_ARP,
        };
        let arp = ArpPacket {
            operation: ArpOperation::Request,
            sender_hw: self.local_mac,
            sender_ip: self.local_ip,
            target_hw: [0; 6],
            target_ip: target,
        };
        frame::serialize_arp_frame(&eth, &arp)
    }
}

/// Hardware address announced by `target` in `data`, if `data` is an ARP
/// packet sent by `target`.
pub fn match_reply(data: &[u8], target: Ipv4Addr) -> Option<MacAddr> {
    let arp = frame::decode_arp(data)?;
    if arp.sender_ip != target || arp.sender_hw == [0; 6] {
        return None;
    }
    Some(arp.sender_hw)
}

/// Build the reply `responder_mac`/`responder_ip` would send to an ARP
/// request frame, or `None` if `request` does not ask for `responder_ip`.
pub fn answer_request(request: &[u8], responder_mac: MacAddr, responder_ip: Ipv4Addr) -> Option<Vec<u8>> {
    let asked = frame::decode_arp(request)?;
    if asked.operation != ArpOperation::Request || asked.target_ip != responder_ip {
        return None;
    }
    let eth = EthernetHeader {
        dst: asked.sender_hw,
        src: responder_mac,
        ether_type: ETHERTYPE_ARP,
    };
    let reply = ArpPacket {
        operation: ArpOperation::Reply,
        sender_hw: responder_mac,
        sender_ip: responder_ip,
        target_hw: asked.sender_hw,
        target_ip: asked.sender_ip,
    };
    frame::serialize_arp_frame(&eth, &reply).ok()
}
