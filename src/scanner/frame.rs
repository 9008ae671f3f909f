//! Ethernet / ARP / IPv4 / TCP frame construction and decoding.
//!
//! Headers are plain `Copy` values. Serialization fixes every length field and
//! computes the IPv4 header checksum and the TCP checksum (over the IPv4
//! pseudo-header of the datagram carrying the segment). Frames shorter than
//! the Ethernet minimum are zero-padded.

use std::net::Ipv4Addr;

use super::error::ScanError;

/// 48-bit hardware address.
pub type MacAddr = [u8; 6];

/// Ethernet broadcast address.
pub const BROADCAST_MAC: MacAddr = [0xff; 6];

/// EtherType for IPv4 payloads.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// EtherType for ARP payloads.
pub const ETHERTYPE_ARP: u16 = 0x0806;
/// IP protocol number for TCP.
pub const IPPROTO_TCP: u8 = 6;

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const ARP_PACKET_LEN: usize = 28;
/// Minimum Ethernet frame size without FCS.
pub const MIN_FRAME_LEN: usize = 60;

/// Format a hardware address as `aa:bb:cc:dd:ee:ff`.
pub fn format_mac(mac: &MacAddr) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

// =============================================================================
// Header types
// =============================================================================

/// TCP control bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);

    pub const fn empty() -> Self {
        TcpFlags(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        TcpFlags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True when every bit of `other` is set in `self`.
    pub const fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ether_type: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub ttl: u8,
    pub identification: u16,
    pub protocol: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOperation {
    Request,
    Reply,
}

impl ArpOperation {
    fn code(self) -> u16 {
        match self {
            Self::Request => 1,
            Self::Reply => 2,
        }
    }

    fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::Request),
            2 => Some(Self::Reply),
            _ => None,
        }
    }
}

/// ARP for IPv4 over Ethernet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: ArpOperation,
    pub sender_hw: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_hw: MacAddr,
    pub target_ip: Ipv4Addr,
}

/// Source/destination address pair of an IPv4 datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flow {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Flow {
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        Self { src, dst }
    }
}

impl std::fmt::Display for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.src, self.dst)
    }
}

// =============================================================================
// Serialization
// =============================================================================

fn check_mac(mac: &MacAddr, what: &str) -> Result<(), ScanError> {
    if *mac == [0u8; 6] {
        return Err(ScanError::Serialization(format!(
            "{what} hardware address is unset"
        )));
    }
    Ok(())
}

fn write_ethernet(buf: &mut Vec<u8>, eth: &EthernetHeader) {
    buf.extend_from_slice(&eth.dst);
    buf.extend_from_slice(&eth.src);
    buf.extend_from_slice(&eth.ether_type.to_be_bytes());
}

fn pad_to_minimum(buf: &mut Vec<u8>) {
    if buf.len() < MIN_FRAME_LEN {
        buf.resize(MIN_FRAME_LEN, 0);
    }
}

/// Serialize an Ethernet frame carrying an IPv4 datagram carrying a TCP
/// segment with no options and no payload.
///
/// The TCP checksum is computed over the pseudo-header of `ip`, so the segment
/// is always bound to the datagram it travels in.
pub fn serialize_tcp_frame(
    eth: &EthernetHeader,
    ip: &Ipv4Header,
    tcp: &TcpHeader,
) -> Result<Vec<u8>, ScanError> {
    check_mac(&eth.src, "source")?;
    check_mac(&eth.dst, "destination")?;
    if eth.ether_type != ETHERTYPE_IPV4 {
        return Err(ScanError::Serialization(format!(
            "ethernet type {:#06x} cannot carry an IPv4 datagram",
            eth.ether_type
        )));
    }
    if ip.protocol != IPPROTO_TCP {
        return Err(ScanError::Serialization(format!(
            "IPv4 protocol {} cannot carry a TCP segment",
            ip.protocol
        )));
    }
    if ip.src.is_unspecified() || ip.dst.is_unspecified() {
        return Err(ScanError::Serialization(
            "IPv4 source and destination must be set".to_string(),
        ));
    }
    if ip.ttl == 0 {
        return Err(ScanError::Serialization("IPv4 TTL must be non-zero".to_string()));
    }

    let ip_total_len = (IPV4_HEADER_LEN + TCP_HEADER_LEN) as u16;
    let mut buf = Vec::with_capacity(MIN_FRAME_LEN);
    write_ethernet(&mut buf, eth);

    // --- IPv4 header ---
    let ip_start = buf.len();
    buf.push(0x45); // version 4, IHL 5
    buf.push(0); // DSCP/ECN
    buf.extend_from_slice(&ip_total_len.to_be_bytes());
    buf.extend_from_slice(&ip.identification.to_be_bytes());
    buf.extend_from_slice(&[0x40, 0x00]); // DF, no fragment offset
    buf.push(ip.ttl);
    buf.push(ip.protocol);
    buf.extend_from_slice(&[0, 0]); // checksum, filled below
    buf.extend_from_slice(&ip.src.octets());
    buf.extend_from_slice(&ip.dst.octets());
    let ip_checksum = compute_ip_checksum(&buf[ip_start..ip_start + IPV4_HEADER_LEN]);
    buf[ip_start + 10..ip_start + 12].copy_from_slice(&ip_checksum.to_be_bytes());

    // --- TCP header ---
    let tcp_start = buf.len();
    buf.extend_from_slice(&tcp.src_port.to_be_bytes());
    buf.extend_from_slice(&tcp.dst_port.to_be_bytes());
    buf.extend_from_slice(&tcp.seq.to_be_bytes());
    buf.extend_from_slice(&tcp.ack.to_be_bytes());
    buf.push(((TCP_HEADER_LEN / 4) as u8) << 4);
    buf.push(tcp.flags.bits());
    buf.extend_from_slice(&tcp.window.to_be_bytes());
    buf.extend_from_slice(&[0, 0]); // checksum, filled below
    buf.extend_from_slice(&[0, 0]); // urgent pointer
    let tcp_checksum = compute_tcp_checksum(&buf[tcp_start..], &ip.src, &ip.dst);
    buf[tcp_start + 16..tcp_start + 18].copy_from_slice(&tcp_checksum.to_be_bytes());

    pad_to_minimum(&mut buf);
    Ok(buf)
}

/// Serialize an Ethernet frame carrying an ARP packet.
pub fn serialize_arp_frame(eth: &EthernetHeader, arp: &ArpPacket) -> Result<Vec<u8>, ScanError> {
    check_mac(&eth.src, "source")?;
    check_mac(&eth.dst, "destination")?;
    check_mac(&arp.sender_hw, "ARP sender")?;
    if eth.ether_type != ETHERTYPE_ARP {
        return Err(ScanError::Serialization(format!(
            "ethernet type {:#06x} cannot carry an ARP packet",
            eth.ether_type
        )));
    }
    if arp.target_ip.is_unspecified() {
        return Err(ScanError::Serialization(
            "ARP target protocol address must be set".to_string(),
        ));
    }

    let mut buf = Vec::with_capacity(MIN_FRAME_LEN);
    write_ethernet(&mut buf, eth);
    buf.extend_from_slice(&1u16.to_be_bytes()); // hardware type: Ethernet
    buf.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
    buf.push(6); // hardware address size
    buf.push(4); // protocol address size
    buf.extend_from_slice(&arp.operation.code().to_be_bytes());
    buf.extend_from_slice(&arp.sender_hw);
    buf.extend_from_slice(&arp.sender_ip.octets());
    buf.extend_from_slice(&arp.target_hw);
    buf.extend_from_slice(&arp.target_ip.octets());

    pad_to_minimum(&mut buf);
    Ok(buf)
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode the Ethernet header, returning it with the frame payload.
pub fn decode_ethernet(frame: &[u8]) -> Option<(EthernetHeader, &[u8])> {
    if frame.len() < ETHERNET_HEADER_LEN {
        return None;
    }
    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&frame[0..6]);
    src.copy_from_slice(&frame[6..12]);
    let ether_type = u16::from_be_bytes([frame[12], frame[13]]);
    Some((
        EthernetHeader {
            dst,
            src,
            ether_type,
        },
        &frame[ETHERNET_HEADER_LEN..],
    ))
}

/// Decode an ARP packet (IPv4 over Ethernet only) from a full frame.
pub fn decode_arp(frame: &[u8]) -> Option<ArpPacket> {
    let (eth, payload) = decode_ethernet(frame)?;
    if eth.ether_type != ETHERTYPE_ARP || payload.len() < ARP_PACKET_LEN {
        return None;
    }
    let htype = u16::from_be_bytes([payload[0], payload[1]]);
    let ptype = u16::from_be_bytes([payload[2], payload[3]]);
    if htype != 1 || ptype != ETHERTYPE_IPV4 || payload[4] != 6 || payload[5] != 4 {
        return None;
    }
    let operation = ArpOperation::from_code(u16::from_be_bytes([payload[6], payload[7]]))?;
    let mut sender_hw = [0u8; 6];
    let mut target_hw = [0u8; 6];
    sender_hw.copy_from_slice(&payload[8..14]);
    target_hw.copy_from_slice(&payload[18..24]);
    Some(ArpPacket {
        operation,
        sender_hw,
        sender_ip: Ipv4Addr::new(payload[14], payload[15], payload[16], payload[17]),
        target_hw,
        target_ip: Ipv4Addr::new(payload[24], payload[25], payload[26], payload[27]),
    })
}

/// Decode the IPv4 header of a full frame, returning it with the datagram
/// payload (trimmed to the datagram's total length, so Ethernet padding is
/// not included).
pub fn decode_ipv4(frame: &[u8]) -> Option<(Ipv4Header, &[u8])> {
    let (eth, payload) = decode_ethernet(frame)?;
    if eth.ether_type != ETHERTYPE_IPV4 || payload.len() < IPV4_HEADER_LEN {
        return None;
    }
    if payload[0] >> 4 != 4 {
        return None;
    }
    let ihl = ((payload[0] & 0x0f) as usize) * 4;
    let total_len = u16::from_be_bytes([payload[2], payload[3]]) as usize;
    if ihl < IPV4_HEADER_LEN || total_len < ihl || payload.len() < ihl {
        return None;
    }
    let end = total_len.min(payload.len());
    let header = Ipv4Header {
        src: Ipv4Addr::new(payload[12], payload[13], payload[14], payload[15]),
        dst: Ipv4Addr::new(payload[16], payload[17], payload[18], payload[19]),
        ttl: payload[8],
        identification: u16::from_be_bytes([payload[4], payload[5]]),
        protocol: payload[9],
    };
    let fragment_offset = u16::from_be_bytes([payload[6], payload[7]]) & 0x1fff;
    if fragment_offset != 0 {
        // Later fragments carry no transport header.
        return Some((header, &[]));
    }
    Some((header, &payload[ihl..end]))
}

/// Decode a TCP header from an IPv4 payload.
pub fn decode_tcp(segment: &[u8]) -> Option<TcpHeader> {
    if segment.len() < TCP_HEADER_LEN {
        return None;
    }
    let data_offset = ((segment[12] >> 4) as usize) * 4;
    if data_offset < TCP_HEADER_LEN {
        return None;
    }
    Some(TcpHeader {
        src_port: u16::from_be_bytes([segment[0], segment[1]]),
        dst_port: u16::from_be_bytes([segment[2], segment[3]]),
        seq: u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
        ack: u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]),
        flags: TcpFlags::from_bits(segment[13]),
        window: u16::from_be_bytes([segment[14], segment[15]]),
    })
}

/// Decode the IP flow and TCP segment of a full frame in one pass.
pub fn decode_tcp_frame(frame: &[u8]) -> Option<(Flow, Option<TcpHeader>)> {
    let (ip, payload) = decode_ipv4(frame)?;
    let flow = Flow::new(ip.src, ip.dst);
    let tcp = if ip.protocol == IPPROTO_TCP {
        decode_tcp(payload)
    } else {
        None
    };
    Some((flow, tcp))
}

// =============================================================================
// Checksum utilities
// =============================================================================

/// Fold a running 32-bit sum of big-endian 16-bit words.
fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    // Odd trailing byte, padded with zero
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

/// One's complement of the folded one's complement sum.
fn finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Compute an Internet checksum (one's complement sum of 16-bit words).
pub fn ones_complement_sum(data: &[u8]) -> u16 {
    finish(sum_words(0, data))
}

/// Compute the IPv4 header checksum, treating the checksum field as zero.
pub fn compute_ip_checksum(header: &[u8]) -> u16 {
    if header.len() < 12 {
        return ones_complement_sum(header);
    }
    let sum = sum_words(0, &header[..10]);
    finish(sum_words(sum, &header[12..]))
}

/// Compute the TCP checksum including the IPv4 pseudo-header, treating the
/// checksum field (bytes 16–17 of the segment) as zero.
pub fn compute_tcp_checksum(tcp_segment: &[u8], src_ip: &Ipv4Addr, dst_ip: &Ipv4Addr) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src_ip.octets());
    pseudo[4..8].copy_from_slice(&dst_ip.octets());
    pseudo[9] = IPPROTO_TCP;
    pseudo[10..12].copy_from_slice(&(tcp_segment.len() as u16).to_be_bytes());

    let mut sum = sum_words(0, &pseudo);
    if tcp_segment.len() >= 18 {
        sum = sum_words(sum, &tcp_segment[..16]);
        sum = sum_words(sum, &tcp_segment[18..]);
    } else {
        sum = sum_words(sum, tcp_segment);
    }
    finish(sum)
}
