//! Scan orchestration. Owns one session's handle and drives single-port,
//! range and list scans.
//!
//! Session setup is synchronous and fatal on failure: route check, handle
//! open, ARP resolution of the next hop. Once a `Session` exists every scan
//! returns a best-effort result list; per-probe send and read failures are
//! logged and contained.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::route::{Ipv4Route, RouteInfo};
use crate::scanner::arp::{NeighborResolver, ARP_TIMEOUT};
use crate::scanner::collector::{CorrelationMap, ResponseClassifier, ResponseListener, VerdictLog};
use crate::scanner::frame::{format_mac, MacAddr};
use crate::scanner::handle::{open_handle, PacketHandle};
use crate::scanner::syn_sender::{ProbeTemplate, SynScanner};
use crate::{PortResult, ScanError};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Tunables for a scan session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// How long to wait for the next hop's ARP reply.
    pub arp_timeout: Duration,
    /// Reply window of `scan_single_port`.
    pub single_port_timeout: Duration,
    /// Overall wall-clock budget of a range or list scan.
    pub range_budget: Duration,
    /// Capture read timeout; bounds how quickly the listener sees cancellation.
    pub read_timeout: Duration,
    /// How long to wait for the listener to stop after cancelling it.
    pub listener_join_grace: Duration,
    /// TCP source port of every probe.
    pub source_port: u16,
    /// IPv4 TTL of every probe.
    pub ttl: u8,
    /// Give every probed port a verdict in range scans, FILTERED when
    /// nothing came back.
    pub report_unanswered: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            arp_timeout: ARP_TIMEOUT,
            single_port_timeout: Duration::from_secs(1),
            range_budget: Duration::from_secs(3),
            read_timeout: Duration::from_millis(100),
            listener_join_grace: Duration::from_millis(500),
            source_port: 54321,
            ttl: 64,
            report_unanswered: true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// One scan session against one destination.
///
/// Exclusively owns the packet handle; it is released when the session and
/// any listener still draining have dropped their references.
pub struct Session {
    route: RouteInfo,
    ipv4: Ipv4Route,
    next_hop_mac: MacAddr,
    sender: Arc<SynScanner>,
    classifier: ResponseClassifier,
    config: ScanConfig,
}

impl Session {
    /// Open a raw handle on the route's interface and set up a session.
    ///
    /// # Errors
    /// `Unsupported` for IPv6 routes (checked before any handle is opened),
    /// `Open` if the handle cannot be acquired, `ResolutionTimeout` if the
    /// next hop never answers ARP.
    pub fn open(route: RouteInfo, config: ScanConfig) -> Result<Self, ScanError> {
        route.ipv4()?;
        let handle = open_handle(&route.interface.name, config.read_timeout)?;
        Self::with_handle(route, handle, config)
    }

    /// Set up a session over an already-open handle.
    ///
    /// Resolves the next hop synchronously; no TCP probe can be sent before
    /// this succeeds.
    pub fn with_handle(
        route: RouteInfo,
        handle: Arc<dyn PacketHandle>,
        config: ScanConfig,
    ) -> Result<Self, ScanError> {
        let ipv4 = route.ipv4()?;
        let next_hop = ipv4.next_hop();

        let next_hop_mac = NeighborResolver::new(
            handle.as_ref(),
            route.interface.mac,
            ipv4.source,
            config.arp_timeout,
        )
        .resolve(next_hop)?;

        let template = ProbeTemplate::new(
            route.interface.mac,
            next_hop_mac,
            ipv4.source,
            ipv4.destination,
            config.source_port,
            config.ttl,
        );
        let classifier =
            ResponseClassifier::new(ipv4.destination, ipv4.source, config.source_port);

        tracing::info!(
            interface = %route.interface.name,
            target = %ipv4.destination,
            next_hop = %next_hop,
            next_hop_mac = %format_mac(&next_hop_mac),
            "scan session ready"
        );

        Ok(Self {
            route,
            ipv4,
            next_hop_mac,
            sender: Arc::new(SynScanner::new(handle, template)),
            classifier,
            config,
        })
    }

    pub fn interface(&self) -> &str {
        &self.route.interface.name
    }

    pub fn next_hop_mac(&self) -> MacAddr {
        self.next_hop_mac
    }

    /// Probe one port and wait for its reply.
    ///
    /// Blocking and sequential: sends one SYN, then reads until a verdict for
    /// exactly this port arrives or `single_port_timeout` elapses, in which
    /// case the port is FILTERED with no duration. Every call starts from
    /// fresh state.
    pub fn scan_single_port(&self, port: u16) -> PortResult {
        let correlation = CorrelationMap::new();
        let start = Instant::now();
        correlation.record(port, start);
        if let Err(e) = self.sender.send_syn(port, correlation.isn(port)) {
            tracing::warn!(port, error = %e, "probe send failed");
        }

        let deadline = start + self.config.single_port_timeout;
        let handle = self.sender.handle();
        while Instant::now() < deadline {
            let rx = match handle.read_frame() {
                Ok(Some(rx)) => rx,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(port, error = %e, "capture read failed, continuing");
                    continue;
                }
            };
            match self.classifier.classify(&rx, &correlation) {
                Some(result) if result.port == port => {
                    tracing::debug!(port, state = %result.state, rtt = ?result.duration, "single port verdict");
                    return result;
                }
                _ => {}
            }
        }

        tracing::debug!(port, "no reply, filtered");
        PortResult::filtered(port)
    }

    /// Scan `start..=end` concurrently within one `range_budget`.
    ///
    /// # Errors
    /// `InvalidPortRange` when `start > end`.
    pub async fn scan_range(&self, start: u16, end: u16) -> Result<Vec<PortResult>, ScanError> {
        if start > end {
            return Err(ScanError::InvalidPortRange { start, end });
        }
        let ports: Vec<u16> = (start..=end).collect();
        Ok(self.scan_ports(&ports).await)
    }

    /// Scan an arbitrary port list concurrently within one `range_budget`.
    ///
    /// A background listener classifies replies while a second blocking task
    /// fires one SYN per port with no pacing. Firing stops early once the
    /// budget is spent. When the budget elapses the listener is cancelled and
    /// the verdicts collected so far are returned sorted by port. Repeated
    /// ports are probed once.
    pub async fn scan_ports(&self, ports: &[u16]) -> Vec<PortResult> {
        let deadline = tokio::time::Instant::now() + self.config.range_budget;
        let correlation = Arc::new(CorrelationMap::new());
        let verdicts = Arc::new(VerdictLog::new());
        let cancel = CancellationToken::new();

        let listener = ResponseListener::new(
            Arc::clone(self.sender.handle()),
            self.classifier,
            Arc::clone(&correlation),
            Arc::clone(&verdicts),
        );
        let token = cancel.clone();
        let listener_task = tokio::task::spawn_blocking(move || listener.run(&token));

        // Each send is a blocking syscall; keep them off the async workers.
        let firing = {
            let sender = Arc::clone(&self.sender);
            let correlation = Arc::clone(&correlation);
            let ports = ports.to_vec();
            let fire_deadline = deadline.into_std();
            tokio::task::spawn_blocking(move || fire(&sender, &correlation, &ports, fire_deadline))
        };
        match firing.await {
            Ok((sent, failed)) => {
                tracing::debug!(sent, failed, target = %self.ipv4.destination, "fire loop done")
            }
            Err(e) => tracing::error!(error = %e, "fire loop task failed"),
        }

        tokio::time::sleep_until(deadline).await;
        cancel.cancel();

        match tokio::time::timeout(self.config.listener_join_grace, listener_task).await {
            Ok(Ok(stats)) => tracing::debug!(?stats, "listener joined"),
            Ok(Err(e)) => tracing::error!(error = %e, "listener task failed"),
            Err(_) => tracing::warn!(
                grace = ?self.config.listener_join_grace,
                "listener did not stop in time, returning collected verdicts"
            ),
        }

        let mut results = verdicts.snapshot();
        if self.config.report_unanswered {
            results.extend(
                correlation
                    .ports()
                    .into_iter()
                    .filter(|port| !verdicts.contains(*port))
                    .map(PortResult::filtered),
            );
        }
        results.sort_by_key(|r| r.port);
        results
    }
}

/// Send one SYN per port until `deadline`, recording each port before its
/// send. Returns how many probes were written and how many failed.
fn fire(
    sender: &SynScanner,
    correlation: &CorrelationMap,
    ports: &[u16],
    deadline: Instant,
) -> (usize, usize) {
    let mut sent = 0usize;
    let mut failed = 0usize;
    for &port in ports {
        if Instant::now() >= deadline {
            tracing::warn!(
                remaining = ports.len() - correlation.len(),
                "scan budget spent before all ports were probed"
            );
            break;
        }
        if !correlation.record(port, Instant::now()) {
            continue;
        }
        match sender.send_syn(port, correlation.isn(port)) {
            Ok(()) => sent += 1,
            Err(e) => {
                failed += 1;
                tracing::warn!(port, error = %e, "probe send failed, skipping");
            }
        }
    }
    (sent, failed)
}

impl Drop for Session {
    fn drop(&mut self) {
        tracing::debug!(
            interface = %self.route.interface.name,
            probes = self.sender.probes_sent(),
            "scan session closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::route::{InterfaceInfo, IpVersion};
    use crate::scanner::arp;
    use crate::scanner::frame::decode_tcp_frame;
    use crate::scanner::handle::MockHandle;
    use crate::scanner::frame::TcpFlags;
    use crate::scanner::testing::{
        reply_frame, FakeTarget, LOCAL_MAC, SOURCE, SOURCE_PORT, TARGET, TARGET_MAC,
    };
    use crate::PortState;

    fn test_config() -> ScanConfig {
        ScanConfig {
            arp_timeout: Duration::from_millis(200),
            single_port_timeout: Duration::from_millis(200),
            range_budget: Duration::from_millis(300),
            read_timeout: Duration::from_millis(5),
            ..ScanConfig::default()
        }
    }

    fn on_link_route() -> RouteInfo {
        RouteInfo {
            interface: InterfaceInfo {
                name: "mock0".to_string(),
                index: 1,
                mac: LOCAL_MAC,
            },
            gateway: None,
            source: IpAddr::V4(SOURCE),
            destination: IpAddr::V4(TARGET),
            ip_version: IpVersion::V4,
        }
    }

    fn session_with(target: FakeTarget, config: ScanConfig) -> (Session, Arc<MockHandle>) {
        let mock = Arc::new(MockHandle::with_responder(move |frame| target.respond(frame)));
        let session = Session::with_handle(on_link_route(), mock.clone(), config).unwrap();
        (session, mock)
    }

    fn tcp_frames_sent(mock: &MockHandle) -> usize {
        mock.sent_frames()
            .iter()
            .filter(|f| matches!(decode_tcp_frame(f), Some((_, Some(_)))))
            .count()
    }

    #[test]
    fn test_default_config_values() {
        let c = ScanConfig::default();
        assert_eq!(c.arp_timeout, Duration::from_secs(3));
        assert_eq!(c.arp_timeout, ARP_TIMEOUT);
        assert_eq!(c.single_port_timeout, Duration::from_secs(1));
        assert_eq!(c.range_budget, Duration::from_secs(3));
        assert!(c.report_unanswered);
    }

    // ── session setup ──────────────────────────────────────────────────────

    #[test]
    fn test_session_resolves_on_link_target() {
        let (session, mock) = session_with(FakeTarget::new(&[], &[]), test_config());
        assert_eq!(session.next_hop_mac(), TARGET_MAC);
        assert_eq!(session.interface(), "mock0");
        assert_eq!(mock.sent_count(), 1, "only the ARP request goes out at setup");
    }

    #[test]
    fn test_session_resolves_gateway_not_destination() {
        let gw = Ipv4Addr::new(10, 0, 0, 1);
        let gw_mac: MacAddr = [0x02, 0, 0, 0, 0, 0x77];
        let mock = Arc::new(MockHandle::with_responder(move |frame| {
            arp::answer_request(frame, gw_mac, gw).into_iter().collect()
        }));
        let mut route = on_link_route();
        route.gateway = Some(IpAddr::V4(gw));

        let session = Session::with_handle(route, mock.clone(), test_config()).unwrap();
        assert_eq!(session.next_hop_mac(), gw_mac);

        session.sender.send_syn(80, 0).unwrap();
        let probe = mock.sent_frames().pop().unwrap();
        assert_eq!(&probe[0..6], &gw_mac, "probes are framed to the gateway");
        let (flow, _) = decode_tcp_frame(&probe).unwrap();
        assert_eq!(flow.dst, TARGET, "but addressed to the destination");
    }

    #[test]
    fn test_arp_timeout_aborts_before_any_probe() {
        let mut silent = FakeTarget::new(&[80], &[]);
        silent.answer_arp = false;
        let mock = Arc::new(MockHandle::with_responder(move |frame| silent.respond(frame)));

        let start = Instant::now();
        let result = Session::with_handle(on_link_route(), mock.clone(), test_config());
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(ScanError::ResolutionTimeout { .. })));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(400), "timeout overshot: {elapsed:?}");
        assert_eq!(mock.sent_count(), 1, "only the ARP request may be written");
        assert_eq!(tcp_frames_sent(&mock), 0, "no SYN may be sent without a next hop");
    }

    #[test]
    fn test_ipv6_route_is_unsupported() {
        let mock = Arc::new(MockHandle::new());
        let mut route = on_link_route();
        route.source = IpAddr::V6(Ipv6Addr::LOCALHOST);
        route.destination = IpAddr::V6(Ipv6Addr::LOCALHOST);
        route.ip_version = IpVersion::V6;

        let result = Session::with_handle(route.clone(), mock.clone(), test_config());
        assert!(matches!(result, Err(ScanError::Unsupported(_))));
        assert_eq!(mock.sent_count(), 0);

        let opened = Session::open(route, test_config());
        assert!(matches!(opened, Err(ScanError::Unsupported(_))));
    }

    // ── single port ────────────────────────────────────────────────────────

    #[test]
    fn test_single_port_without_reply_is_filtered() {
        let (session, _mock) = session_with(FakeTarget::new(&[], &[]), test_config());
        for port in [0u16, 1, 8080, 65535] {
            let start = Instant::now();
            let result = session.scan_single_port(port);
            assert_eq!(result, PortResult::filtered(port));
            assert_eq!(result.rtt(), Duration::ZERO);
            assert!(start.elapsed() >= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_single_port_open() {
        let (session, _mock) = session_with(FakeTarget::new(&[22], &[]), test_config());
        let result = session.scan_single_port(22);
        assert_eq!(result.port, 22);
        assert_eq!(result.state, PortState::Open);
        assert!(result.duration.is_some());
    }

    #[test]
    fn test_single_port_closed_is_idempotent() {
        let (session, _mock) = session_with(FakeTarget::new(&[], &[80]), test_config());
        let first = session.scan_single_port(80);
        let second = session.scan_single_port(80);
        assert_eq!(first.state, PortState::Closed);
        assert_eq!(second.state, PortState::Closed);
        assert_eq!(second.port, 80);

        // A previous destination port must not leak into the next probe.
        let other = session.scan_single_port(81);
        assert_eq!(other, PortResult::filtered(81));
    }

    #[test]
    fn test_single_port_ignores_retransmission_from_earlier_call() {
        // First SYN to 80 is answered with two SYN+ACKs, every later one
        // with RST. The second SYN+ACK is still queued when the next call
        // starts reading.
        let syns = AtomicUsize::new(0);
        let arp_only = FakeTarget::new(&[], &[]);
        let mock = Arc::new(MockHandle::with_responder(move |frame| {
            let Some((flow, Some(tcp))) = decode_tcp_frame(frame) else {
                return arp_only.respond(frame);
            };
            let ack = tcp.seq.wrapping_add(1);
            let answer = |flags| reply_frame(TARGET, flow.src, tcp.dst_port, tcp.src_port, flags, ack);
            if syns.fetch_add(1, Ordering::SeqCst) == 0 {
                vec![answer(TcpFlags::SYN | TcpFlags::ACK), answer(TcpFlags::SYN | TcpFlags::ACK)]
            } else {
                vec![answer(TcpFlags::RST | TcpFlags::ACK)]
            }
        }));
        let session = Session::with_handle(on_link_route(), mock, test_config()).unwrap();

        assert_eq!(session.scan_single_port(80).state, PortState::Open);
        assert_eq!(session.scan_single_port(80).state, PortState::Closed);
    }

    #[test]
    fn test_single_port_send_failure_is_filtered() {
        let (session, mock) = session_with(FakeTarget::new(&[], &[80]), test_config());
        mock.fail_next_writes(1);
        assert_eq!(session.scan_single_port(80), PortResult::filtered(80));
    }

    #[test]
    fn test_single_port_survives_read_errors() {
        let (session, mock) = session_with(FakeTarget::new(&[443], &[]), test_config());
        mock.fail_next_reads(5);
        assert_eq!(session.scan_single_port(443).state, PortState::Open);
    }

    // ── range / list ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_range_completes_within_budget() {
        let (session, _mock) = session_with(FakeTarget::new(&[22], &[23]), test_config());
        let start = Instant::now();
        let results = session.scan_range(1, 1024).await.unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(300));
        assert!(
            elapsed < Duration::from_millis(300 + 200),
            "range scan overran its budget: {elapsed:?}"
        );
        assert_eq!(results.len(), 1024, "every probed port gets a verdict");
        assert_eq!(results[21].port, 22);
        assert_eq!(results[21].state, PortState::Open);
        assert_eq!(results[22].state, PortState::Closed);
        assert_eq!(results[0].state, PortState::Filtered);
    }

    #[tokio::test]
    async fn test_range_results_sorted_by_port() {
        let (session, _mock) = session_with(FakeTarget::new(&[25, 21], &[23]), test_config());
        let results = session.scan_range(20, 25).await.unwrap();
        let ports: Vec<u16> = results.iter().map(|r| r.port).collect();
        assert_eq!(ports, vec![20, 21, 22, 23, 24, 25]);
    }

    #[tokio::test]
    async fn test_range_without_unanswered_reporting() {
        let config = ScanConfig {
            report_unanswered: false,
            ..test_config()
        };
        let (session, _mock) = session_with(FakeTarget::new(&[22], &[23]), config);
        let results = session.scan_range(20, 30).await.unwrap();
        assert_eq!(results.len(), 2, "only replied ports are reported");
        assert!(results.iter().all(|r| r.state.had_response()));
    }

    #[tokio::test]
    async fn test_range_keeps_first_of_duplicate_replies() {
        let mut target = FakeTarget::new(&[80], &[]);
        target.duplicate_open = true;
        let (session, _mock) = session_with(target, test_config());
        let results = session.scan_range(79, 81).await.unwrap();
        assert_eq!(results.iter().filter(|r| r.port == 80).count(), 1);
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn test_range_drops_reply_queued_before_the_scan() {
        let (session, mock) = session_with(FakeTarget::new(&[], &[80]), test_config());
        mock.queue_rx_frame(reply_frame(
            TARGET,
            SOURCE,
            80,
            SOURCE_PORT,
            TcpFlags::SYN | TcpFlags::ACK,
            0x1234_5678,
        ));
        let results = session.scan_range(79, 81).await.unwrap();
        assert_eq!(results[1].port, 80);
        assert_eq!(results[1].state, PortState::Closed);
    }

    #[tokio::test]
    async fn test_fire_loop_does_not_stall_the_runtime() {
        // Every SYN write blocks for 2 ms; 100 of them fit in the budget.
        let target = FakeTarget::new(&[], &[]);
        let mock = Arc::new(MockHandle::with_responder(move |frame| {
            if decode_tcp_frame(frame).is_some() {
                std::thread::sleep(Duration::from_millis(2));
            }
            target.respond(frame)
        }));
        let session = Session::with_handle(on_link_route(), mock.clone(), test_config()).unwrap();
        let ports: Vec<u16> = (1..=100).collect();

        let started = Instant::now();
        let tick = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            started.elapsed()
        };
        let (results, ticked_after) = tokio::join!(session.scan_ports(&ports), tick);

        assert!(
            ticked_after < Duration::from_millis(150),
            "runtime was blocked while firing: {ticked_after:?}"
        );
        assert_eq!(results.len(), 100);
        assert_eq!(tcp_frames_sent(&mock), 100);
    }

    #[tokio::test]
    async fn test_range_send_failures_do_not_abort() {
        let (session, mock) = session_with(FakeTarget::new(&[], &[1, 2, 3, 4]), test_config());
        mock.fail_next_writes(2);
        let results = session.scan_range(1, 4).await.unwrap();
        let states: Vec<PortState> = results.iter().map(|r| r.state).collect();
        assert_eq!(
            states,
            vec![
                PortState::Filtered,
                PortState::Filtered,
                PortState::Closed,
                PortState::Closed
            ]
        );
    }

    #[tokio::test]
    async fn test_range_rejects_reversed_bounds() {
        let (session, mock) = session_with(FakeTarget::new(&[], &[]), test_config());
        let sent_before = mock.sent_count();
        let err = session.scan_range(100, 10).await.unwrap_err();
        assert!(matches!(err, ScanError::InvalidPortRange { start: 100, end: 10 }));
        assert_eq!(mock.sent_count(), sent_before);
    }

    #[tokio::test]
    async fn test_port_list_probes_each_port_once() {
        let (session, mock) = session_with(FakeTarget::new(&[443], &[]), test_config());
        let results = session.scan_ports(&[443, 22, 443]).await;
        assert_eq!(tcp_frames_sent(&mock), 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], PortResult::filtered(22));
        assert_eq!(results[1].state, PortState::Open);
    }

    #[tokio::test]
    async fn test_range_durations_are_measured() {
        let (session, _mock) = session_with(FakeTarget::new(&[20, 21, 22], &[]), test_config());
        let results = session.scan_range(20, 22).await.unwrap();
        for r in &results {
            assert_eq!(r.state, PortState::Open);
            let rtt = r.duration.expect("replied ports carry a duration");
            assert!(rtt < Duration::from_millis(300));
        }
    }
}
