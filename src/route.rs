//! Outgoing route lookup for a destination address.
//!
//! Reads the kernel routing tables (`/proc/net/route`, `/proc/net/ipv6_route`)
//! to pick the outgoing interface and gateway, asks the kernel for the
//! preferred source address, and reads the interface hardware address from
//! sysfs. Linux only.
//!
//! A forced interface restricts the table lookup to that interface's rows,
//! and the source address must be one the interface actually carries.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, UdpSocket};

use serde::{Deserialize, Serialize};

use crate::scanner::error::ScanError;
use crate::scanner::frame::MacAddr;

const RTF_UP: u32 = 0x0001;
const RTF_GATEWAY: u32 = 0x0002;
const RTF_REJECT: u32 = 0x0200;

/// IP version of the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpVersion {
    V4,
    V6,
}

/// Outgoing interface identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub index: u32,
    pub mac: MacAddr,
}

/// Resolved route to a destination. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub interface: InterfaceInfo,
    /// Next-hop router, `None` when the destination is on-link.
    pub gateway: Option<IpAddr>,
    /// Preferred source address for packets to `destination`.
    pub source: IpAddr,
    pub destination: IpAddr,
    pub ip_version: IpVersion,
}

/// IPv4 addresses of a route, as used by the scan path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Route {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
}

impl Ipv4Route {
    /// Address whose hardware address frames must be sent to: the gateway
    /// when the destination is off-link, the destination itself otherwise.
    pub fn next_hop(&self) -> Ipv4Addr {
        self.gateway.unwrap_or(self.destination)
    }
}

impl RouteInfo {
    /// Resolve the route to `destination`.
    ///
    /// `interface_override` forces the outgoing interface: only routes through
    /// it are considered, and the source address is taken from it.
    ///
    /// # Errors
    /// Returns `ScanError::Routing` if no route exists (through the forced
    /// interface, when given), the forced interface has no address of the
    /// destination's family, or the interface cannot be inspected.
    pub fn resolve(
        destination: IpAddr,
        interface_override: Option<&str>,
    ) -> Result<Self, ScanError> {
        let (ip_version, table_route) = match destination {
            IpAddr::V4(dst) => {
                let table = read_table("/proc/net/route")?;
                let route = parse_proc_route(&table, dst, interface_override)
                    .map(|(iface, gw)| (iface, gw.map(IpAddr::V4)));
                (IpVersion::V4, route)
            }
            IpAddr::V6(dst) => {
                let table = read_table("/proc/net/ipv6_route")?;
                let route = parse_ipv6_route(&table, dst, interface_override)
                    .map(|(iface, gw)| (iface, gw.map(IpAddr::V6)));
                (IpVersion::V6, route)
            }
        };

        let Some((name, gateway)) = table_route else {
            return Err(ScanError::Routing(match interface_override {
                Some(forced) => format!("no route to {destination} through interface {forced}"),
                None => format!("no route to {destination} in the kernel routing table"),
            }));
        };

        let source = match interface_override {
            None => detect_source_ip(destination)?,
            Some(_) => {
                let detected = detect_source_ip(destination).ok();
                pick_source(detected, &interface_addresses(&name)?, destination).ok_or_else(|| {
                    ScanError::Routing(format!(
                        "interface {name} has no address to reach {destination} from"
                    ))
                })?
            }
        };
        let interface = InterfaceInfo {
            index: interface_index(&name)?,
            mac: read_interface_mac(&name)?,
            name,
        };

        tracing::debug!(
            interface = %interface.name,
            gateway = ?gateway,
            source = %source,
            destination = %destination,
            "route resolved"
        );

        Ok(Self {
            interface,
            gateway,
            source,
            destination,
            ip_version,
        })
    }

    /// The IPv4 view of this route.
    ///
    /// # Errors
    /// Returns `ScanError::Unsupported` for IPv6 routes: the scan path does
    /// not implement IPv6 neighbor discovery.
    pub fn ipv4(&self) -> Result<Ipv4Route, ScanError> {
        let unsupported = || {
            ScanError::Unsupported(format!(
                "{} is IPv6; only IPv4 targets can be scanned",
                self.destination
            ))
        };
        let (IpAddr::V4(source), IpAddr::V4(destination)) = (self.source, self.destination)
        else {
            return Err(unsupported());
        };
        let gateway = match self.gateway {
            Some(IpAddr::V4(gw)) => Some(gw),
            Some(IpAddr::V6(_)) => return Err(unsupported()),
            None => None,
        };
        Ok(Ipv4Route {
            source,
            destination,
            gateway,
        })
    }
}

fn read_table(path: &str) -> Result<String, ScanError> {
    std::fs::read_to_string(path).map_err(|e| ScanError::Routing(format!("read {path}: {e}")))
}

/// Detect the source IP address that would be used to reach the target.
///
/// Uses the UDP connect trick: binds a UDP socket and connects to the target
/// (no packet is actually sent). The OS routing table determines the source IP.
pub fn detect_source_ip(target: IpAddr) -> Result<IpAddr, ScanError> {
    let bind_addr = match target {
        IpAddr::V4(_) => "0.0.0.0:0",
        IpAddr::V6(_) => "[::]:0",
    };
    let sock = UdpSocket::bind(bind_addr)
        .map_err(|e| ScanError::Routing(format!("source IP detection: {e}")))?;
    sock.connect((target, 80))
        .map_err(|e| ScanError::Routing(format!("source IP detection: {e}")))?;
    let local = sock
        .local_addr()
        .map_err(|e| ScanError::Routing(format!("source IP detection: {e}")))?;
    Ok(local.ip())
}

/// Source address to use on a forced interface carrying `addrs`.
///
/// The kernel's choice is kept when it belongs to the interface; otherwise
/// the interface's first address of the destination's family is used.
pub(crate) fn pick_source(
    detected: Option<IpAddr>,
    addrs: &[IpAddr],
    destination: IpAddr,
) -> Option<IpAddr> {
    if let Some(ip) = detected.filter(|ip| addrs.contains(ip)) {
        return Some(ip);
    }
    addrs
        .iter()
        .find(|ip| ip.is_ipv4() == destination.is_ipv4())
        .copied()
}

/// Addresses assigned to interface `ifname`.
fn interface_addresses(ifname: &str) -> Result<Vec<IpAddr>, ScanError> {
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(ScanError::Routing(format!(
            "list addresses of {ifname}: {}",
            std::io::Error::last_os_error()
        )));
    }

    let mut addrs = Vec::new();
    let mut cursor = head;
    while !cursor.is_null() {
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;
        if entry.ifa_addr.is_null() || entry.ifa_name.is_null() {
            continue;
        }
        let name = unsafe { std::ffi::CStr::from_ptr(entry.ifa_name) };
        if name.to_bytes() != ifname.as_bytes() {
            continue;
        }
        match unsafe { (*entry.ifa_addr).sa_family } as libc::c_int {
            libc::AF_INET => {
                let sin = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
                addrs.push(IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))));
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in6) };
                addrs.push(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)));
            }
            _ => {}
        }
    }
    unsafe { libc::freeifaddrs(head) };
    Ok(addrs)
}

/// Longest-prefix match of `dst` against `/proc/net/route` content.
///
/// Returns the interface name and, for gatewayed routes, the gateway. Fields
/// are 32-bit hex values in host (little-endian) byte order. Ties on prefix
/// length go to the lower metric. With `only_iface`, rows of other
/// interfaces are ignored.
pub(crate) fn parse_proc_route(
    content: &str,
    dst: Ipv4Addr,
    only_iface: Option<&str>,
) -> Option<(String, Option<Ipv4Addr>)> {
    let dst_bits = u32::from(dst);
    let mut best: Option<(u32, u32, String, Option<Ipv4Addr>)> = None;

    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 || only_iface.is_some_and(|iface| iface != fields[0]) {
            continue;
        }
        let parse = |s: &str| u32::from_str_radix(s, 16).ok();
        let (Some(dest), Some(gw), Some(flags), Some(metric), Some(mask)) = (
            parse(fields[1]),
            parse(fields[2]),
            parse(fields[3]),
            fields[6].parse::<u32>().ok(),
            parse(fields[7]),
        ) else {
            continue;
        };
        if flags & RTF_UP == 0 || flags & RTF_REJECT != 0 {
            continue;
        }
        let dest = u32::from(le_hex_to_ipv4(dest));
        let mask = u32::from(le_hex_to_ipv4(mask));
        if dst_bits & mask != dest & mask {
            continue;
        }
        let prefix = mask.count_ones();
        let better = match &best {
            None => true,
            Some((p, m, _, _)) => prefix > *p || (prefix == *p && metric < *m),
        };
        if better {
            let gateway = (flags & RTF_GATEWAY != 0 && gw != 0).then(|| le_hex_to_ipv4(gw));
            best = Some((prefix, metric, fields[0].to_string(), gateway));
        }
    }

    best.map(|(_, _, iface, gw)| (iface, gw))
}

fn le_hex_to_ipv4(v: u32) -> Ipv4Addr {
    let b = v.to_le_bytes();
    Ipv4Addr::new(b[0], b[1], b[2], b[3])
}

/// Longest-prefix match of `dst` against `/proc/net/ipv6_route` content.
///
/// Columns: destination, prefix length, source, source prefix length, next
/// hop, metric, refcount, use, flags, interface. Addresses are 32 hex digits
/// in network byte order. `only_iface` works as in `parse_proc_route`.
pub(crate) fn parse_ipv6_route(
    content: &str,
    dst: Ipv6Addr,
    only_iface: Option<&str>,
) -> Option<(String, Option<Ipv6Addr>)> {
    let dst_bits = u128::from(dst);
    let mut best: Option<(u32, u32, String, Option<Ipv6Addr>)> = None;

    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || only_iface.is_some_and(|iface| iface != fields[9]) {
            continue;
        }
        let (Ok(dest), Ok(prefix), Ok(next_hop), Ok(metric), Ok(flags)) = (
            u128::from_str_radix(fields[0], 16),
            u32::from_str_radix(fields[1], 16),
            u128::from_str_radix(fields[4], 16),
            u32::from_str_radix(fields[5], 16),
            u32::from_str_radix(fields[8], 16),
        ) else {
            continue;
        };
        if flags & RTF_UP == 0 || flags & RTF_REJECT != 0 || prefix > 128 {
            continue;
        }
        let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
        if dst_bits & mask != dest & mask {
            continue;
        }
        let better = match &best {
            None => true,
            Some((p, m, _, _)) => prefix > *p || (prefix == *p && metric < *m),
        };
        if better {
            let gateway = (flags & RTF_GATEWAY != 0 && next_hop != 0).then(|| Ipv6Addr::from(next_hop));
            best = Some((prefix, metric, fields[9].to_string(), gateway));
        }
    }

    best.map(|(_, _, iface, gw)| (iface, gw))
}

/// Parse a colon-separated MAC address string (e.g. "fe:00:00:00:01:01").
pub(crate) fn parse_mac_str(s: &str) -> Result<MacAddr, ScanError> {
    let s = s.trim();
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(ScanError::Routing(format!("invalid MAC address: '{s}'")));
    }
    let mut mac = [0u8; 6];
    for (i, p) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(p, 16)
            .map_err(|_| ScanError::Routing(format!("invalid MAC octet '{p}' in '{s}'")))?;
    }
    Ok(mac)
}

/// Read the MAC address of `ifname` from `/sys/class/net/{ifname}/address`.
fn read_interface_mac(ifname: &str) -> Result<MacAddr, ScanError> {
    let path = format!("/sys/class/net/{ifname}/address");
    let content = std::fs::read_to_string(&path)
        .map_err(|e| ScanError::Routing(format!("read interface MAC from {path}: {e}")))?;
    parse_mac_str(&content)
}

/// Kernel index of interface `ifname`.
pub fn interface_index(ifname: &str) -> Result<u32, ScanError> {
    let c_name = std::ffi::CString::new(ifname)
        .map_err(|_| ScanError::Routing(format!("invalid interface name '{ifname}'")))?;
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(ScanError::Routing(format!(
            "unknown interface '{ifname}': {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_ROUTE: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
eth0\t0001A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
docker0\t000011AC\t00000000\t0001\t0\t0\t0\t0000FFFF\t0\t0\t0
wg0\t0000000A\t00000000\t0001\t0\t0\t50\t000000FF\t0\t0\t0
";

    #[test]
    fn test_proc_route_default_gateway() {
        let (iface, gw) = parse_proc_route(PROC_ROUTE, Ipv4Addr::new(1, 1, 1, 1), None).unwrap();
        assert_eq!(iface, "eth0");
        assert_eq!(gw, Some(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn test_proc_route_on_link_has_no_gateway() {
        let (iface, gw) = parse_proc_route(PROC_ROUTE, Ipv4Addr::new(192, 168, 1, 50), None).unwrap();
        assert_eq!(iface, "eth0");
        assert_eq!(gw, None);
    }

    #[test]
    fn test_proc_route_longest_prefix_wins() {
        let (iface, gw) = parse_proc_route(PROC_ROUTE, Ipv4Addr::new(172, 17, 0, 2), None).unwrap();
        assert_eq!(iface, "docker0");
        assert_eq!(gw, None);
        let (iface, _) = parse_proc_route(PROC_ROUTE, Ipv4Addr::new(10, 9, 8, 7), None).unwrap();
        assert_eq!(iface, "wg0");
    }

    #[test]
    fn test_proc_route_forced_interface_uses_its_own_rows() {
        // wg0 carries 10.0.0.0/8 only; a public address has no route there.
        assert!(parse_proc_route(PROC_ROUTE, Ipv4Addr::new(1, 1, 1, 1), Some("wg0")).is_none());

        // 192.168.1.50 is on-link for eth0 but docker0 has no matching row.
        assert!(parse_proc_route(PROC_ROUTE, Ipv4Addr::new(192, 168, 1, 50), Some("docker0")).is_none());

        // Forcing eth0 for a wg0 destination falls back to eth0's default
        // route, gateway included.
        let (iface, gw) = parse_proc_route(PROC_ROUTE, Ipv4Addr::new(10, 9, 8, 7), Some("eth0")).unwrap();
        assert_eq!(iface, "eth0");
        assert_eq!(gw, Some(Ipv4Addr::new(192, 168, 1, 1)));

        let (iface, gw) = parse_proc_route(PROC_ROUTE, Ipv4Addr::new(10, 9, 8, 7), Some("wg0")).unwrap();
        assert_eq!(iface, "wg0");
        assert_eq!(gw, None);
    }

    #[test]
    fn test_proc_route_no_match() {
        let only_local = "Iface\tDestination\tGateway\tFlags\tRefCnt\tUse\tMetric\tMask\n\
                          eth0\t0001A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\n";
        assert!(parse_proc_route(only_local, Ipv4Addr::new(8, 8, 8, 8), None).is_none());
    }

    #[test]
    fn test_proc_route_skips_down_routes() {
        let down = "Iface\tDestination\tGateway\tFlags\tRefCnt\tUse\tMetric\tMask\n\
                    eth1\t00000000\t0101A8C0\t0002\t0\t0\t0\t00000000\n";
        assert!(parse_proc_route(down, Ipv4Addr::new(8, 8, 8, 8), None).is_none());
    }

    const IPV6_ROUTE: &str = "\
fe800000000000000000000000000000 40 00000000000000000000000000000000 00 00000000000000000000000000000000 00000100 00000001 00000000 00000001 eth0
00000000000000000000000000000000 00 00000000000000000000000000000000 00 fe800000000000000000000000000001 00000400 00000001 00000000 00000003 eth0
00000000000000000000000000000001 80 00000000000000000000000000000000 00 00000000000000000000000000000000 00000000 00000002 00000000 80200001 lo
";

    #[test]
    fn test_ipv6_route_default_gateway() {
        let dst: Ipv6Addr = "2606:4700::1111".parse().unwrap();
        let (iface, gw) = parse_ipv6_route(IPV6_ROUTE, dst, None).unwrap();
        assert_eq!(iface, "eth0");
        assert_eq!(gw, Some("fe80::1".parse().unwrap()));
    }

    #[test]
    fn test_ipv6_route_link_local_on_link() {
        let dst: Ipv6Addr = "fe80::42".parse().unwrap();
        let (iface, gw) = parse_ipv6_route(IPV6_ROUTE, dst, None).unwrap();
        assert_eq!(iface, "eth0");
        assert_eq!(gw, None);
    }

    #[test]
    fn test_ipv6_route_forced_interface_uses_its_own_rows() {
        let dst: Ipv6Addr = "2606:4700::1111".parse().unwrap();
        assert!(parse_ipv6_route(IPV6_ROUTE, dst, Some("lo")).is_none());
        let (iface, gw) = parse_ipv6_route(IPV6_ROUTE, dst, Some("eth0")).unwrap();
        assert_eq!(iface, "eth0");
        assert_eq!(gw, Some("fe80::1".parse().unwrap()));
        // ::1/128 lives on lo; through eth0 only the default route matches.
        let (iface, gw) = parse_ipv6_route(IPV6_ROUTE, Ipv6Addr::LOCALHOST, Some("eth0")).unwrap();
        assert_eq!(iface, "eth0");
        assert_eq!(gw, Some("fe80::1".parse().unwrap()));
    }

    #[test]
    fn test_pick_source_keeps_kernel_choice_on_interface() {
        let eth0: Vec<IpAddr> = vec![
            "fe80::5".parse().unwrap(),
            "192.168.1.100".parse().unwrap(),
            "192.168.1.101".parse().unwrap(),
        ];
        let dst: IpAddr = "8.8.8.8".parse().unwrap();
        let detected: IpAddr = "192.168.1.101".parse().unwrap();
        assert_eq!(pick_source(Some(detected), &eth0, dst), Some(detected));
    }

    #[test]
    fn test_pick_source_replaces_address_of_other_interface() {
        let wg0: Vec<IpAddr> = vec!["10.8.0.2".parse().unwrap()];
        let dst: IpAddr = "8.8.8.8".parse().unwrap();
        // The kernel would have left through eth0.
        let detected: IpAddr = "192.168.1.100".parse().unwrap();
        assert_eq!(pick_source(Some(detected), &wg0, dst), Some(wg0[0]));
        assert_eq!(pick_source(None, &wg0, dst), Some(wg0[0]));
    }

    #[test]
    fn test_pick_source_rejects_interface_without_matching_family() {
        let v6_only: Vec<IpAddr> = vec!["fe80::5".parse().unwrap()];
        let dst: IpAddr = "8.8.8.8".parse().unwrap();
        assert_eq!(pick_source(None, &v6_only, dst), None);
        assert_eq!(pick_source(None, &[], dst), None);
        let dst6: IpAddr = "fe80::9".parse().unwrap();
        assert_eq!(pick_source(None, &v6_only, dst6), Some(v6_only[0]));
    }

    #[test]
    fn test_loopback_has_loopback_address() {
        let addrs = interface_addresses("lo").unwrap();
        if !addrs.is_empty() {
            assert!(addrs.iter().all(|ip| ip.is_loopback()));
        }
        assert!(interface_addresses("does-not-exist0").unwrap().is_empty());
    }

    #[test]
    fn test_ipv6_route_loopback_host_route() {
        let (iface, _) = parse_ipv6_route(IPV6_ROUTE, Ipv6Addr::LOCALHOST, None).unwrap();
        assert_eq!(iface, "lo");
    }

    #[test]
    fn test_parse_mac_str() {
        assert_eq!(
            parse_mac_str("fe:00:00:00:01:01\n").unwrap(),
            [0xfe, 0, 0, 0, 1, 1]
        );
        assert!(parse_mac_str("fe:00:00").is_err());
        assert!(parse_mac_str("zz:00:00:00:00:00").is_err());
    }

    fn route(gateway: Option<IpAddr>, source: IpAddr, destination: IpAddr) -> RouteInfo {
        RouteInfo {
            interface: InterfaceInfo {
                name: "eth0".to_string(),
                index: 2,
                mac: [0x02, 0, 0, 0, 0, 1],
            },
            gateway,
            source,
            destination,
            ip_version: if destination.is_ipv4() {
                IpVersion::V4
            } else {
                IpVersion::V6
            },
        }
    }

    #[test]
    fn test_next_hop_prefers_gateway() {
        let r = route(
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
            IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
        );
        assert_eq!(r.ipv4().unwrap().next_hop(), Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn test_next_hop_on_link_is_destination() {
        let r = route(
            None,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7)),
        );
        assert_eq!(r.ipv4().unwrap().next_hop(), Ipv4Addr::new(192, 168, 1, 7));
    }

    #[test]
    fn test_ipv6_route_is_unsupported_for_scanning() {
        let r = route(
            None,
            IpAddr::V6("fe80::1".parse().unwrap()),
            IpAddr::V6("fe80::2".parse().unwrap()),
        );
        assert!(matches!(r.ipv4(), Err(ScanError::Unsupported(_))));
    }

    #[test]
    fn test_interface_index_unknown() {
        assert!(interface_index("does-not-exist0").is_err());
    }

    #[test]
    #[ignore] // Integration test, requires network access
    fn test_detect_source_ip_returns_ipv4() {
        let ip = detect_source_ip(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))).unwrap();
        assert!(ip.is_ipv4());
        assert!(!ip.is_loopback());
    }
}
