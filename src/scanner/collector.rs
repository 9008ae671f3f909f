//! Response collection and classification.
//!
//! The listener reads captured frames, keeps only TCP segments travelling
//! from the target back to our probe source port, and turns each one into a
//! `PortResult`. Durations come from the correlation map, which records when
//! each port's SYN was sent, so replies may be classified in any order.
//! Replies carrying ACK must acknowledge the ISN the map's sequence key gave
//! that port; anything else is a leftover from an earlier probe.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::{PortResult, PortState};

use super::frame::{self, Flow, TcpFlags};
use super::handle::{PacketHandle, RxFrame};
use super::syn_sender::SequenceKey;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Correlation map
// =============================================================================

/// Port → SYN send timestamp for one scan operation, plus the sequence key
/// its probes are numbered with.
///
/// Written by the firing context, read by the listener. Entries are inserted
/// once and never changed.
#[derive(Debug)]
pub struct CorrelationMap {
    key: SequenceKey,
    sent: Mutex<HashMap<u16, Instant>>,
}

impl CorrelationMap {
    /// Empty map with a freshly drawn sequence key.
    pub fn new() -> Self {
        Self::with_key(SequenceKey::random())
    }

    pub fn with_key(key: SequenceKey) -> Self {
        Self {
            key,
            sent: Mutex::new(HashMap::new()),
        }
    }

    /// ISN to put in the SYN sent to `port` during this operation.
    pub fn isn(&self, port: u16) -> u32 {
        self.key.isn(port)
    }

    /// Record that `port` was probed at `at`.
    ///
    /// Returns false, leaving the original timestamp in place, if `port` was
    /// already recorded.
    pub fn record(&self, port: u16, at: Instant) -> bool {
        let mut sent = lock(&self.sent);
        if sent.contains_key(&port) {
            return false;
        }
        sent.insert(port, at);
        true
    }

    pub fn sent_at(&self, port: u16) -> Option<Instant> {
        lock(&self.sent).get(&port).copied()
    }

    /// Time from `port`'s send to `received_at`, if `port` was probed.
    pub fn elapsed(&self, port: u16, received_at: Instant) -> Option<Duration> {
        self.sent_at(port)
            .map(|sent| received_at.saturating_duration_since(sent))
    }

    /// Probed ports, ascending.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = lock(&self.sent).keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn len(&self) -> usize {
        lock(&self.sent).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sent).is_empty()
    }
}

impl Default for CorrelationMap {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Map TCP control bits to a verdict. RST wins over SYN+ACK.
pub fn classify_flags(flags: TcpFlags) -> PortState {
    if flags.contains(TcpFlags::RST) {
        PortState::Closed
    } else if flags.contains(TcpFlags::SYN | TcpFlags::ACK) {
        PortState::Open
    } else {
        PortState::Unknown
    }
}

/// A TCP segment that belongs to our probe traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// Source port of the reply, i.e. the port we probed.
    pub port: u16,
    pub flags: TcpFlags,
    pub ack: u32,
    pub received_at: Instant,
}

/// Filters captured frames down to replies for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseClassifier {
    expected: Flow,
    probe_source_port: u16,
}

impl ResponseClassifier {
    /// Classifier for replies from `target` to `source`:`probe_source_port`.
    pub fn new(target: Ipv4Addr, source: Ipv4Addr, probe_source_port: u16) -> Self {
        Self {
            expected: Flow::new(target, source),
            probe_source_port,
        }
    }

    pub fn expected_flow(&self) -> Flow {
        self.expected
    }

    /// Extract the reply carried by `rx`, or `None` if it is unrelated
    /// traffic or carries no decodable TCP segment.
    pub fn reply(&self, rx: &RxFrame) -> Option<Reply> {
        let (flow, tcp) = frame::decode_tcp_frame(&rx.data)?;
        if flow != self.expected {
            return None;
        }
        let tcp = tcp?;
        if tcp.dst_port != self.probe_source_port {
            return None;
        }
        Some(Reply {
            port: tcp.src_port,
            flags: tcp.flags,
            ack: tcp.ack,
            received_at: rx.received_at,
        })
    }

    /// Classify `rx` into a verdict, timing it against `correlation`.
    ///
    /// A reply with ACK set that does not acknowledge this operation's ISN
    /// for its port is dropped. A reply for a port with no recorded send
    /// time is still classified, with the duration left unmeasured.
    pub fn classify(&self, rx: &RxFrame, correlation: &CorrelationMap) -> Option<PortResult> {
        let reply = self.reply(rx)?;
        if reply.flags.contains(TcpFlags::ACK) && !correlation.key.acknowledges(reply.port, reply.ack) {
            tracing::debug!(port = reply.port, ack = reply.ack, "reply does not acknowledge our probe, dropped");
            return None;
        }
        let duration = correlation.elapsed(reply.port, reply.received_at);
        if duration.is_none() {
            tracing::debug!(port = reply.port, "reply for a port with no send timestamp");
        }
        Some(PortResult {
            port: reply.port,
            state: classify_flags(reply.flags),
            duration,
        })
    }
}

// =============================================================================
// Verdict log
// =============================================================================

/// Append-only verdict list shared between the listener and the orchestrator.
///
/// Only the first verdict per port is kept; targets may retransmit SYN+ACK.
#[derive(Debug, Default)]
pub struct VerdictLog {
    inner: Mutex<VerdictLogInner>,
}

#[derive(Debug, Default)]
struct VerdictLogInner {
    results: Vec<PortResult>,
    seen: HashSet<u16>,
}

impl VerdictLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `result` unless its port already has a verdict.
    pub fn push(&self, result: PortResult) -> bool {
        let mut inner = lock(&self.inner);
        if !inner.seen.insert(result.port) {
            return false;
        }
        inner.results.push(result);
        true
    }

    /// Copy of the verdicts so far, in arrival order.
    pub fn snapshot(&self) -> Vec<PortResult> {
        lock(&self.inner).results.clone()
    }

    pub fn contains(&self, port: u16) -> bool {
        lock(&self.inner).seen.contains(&port)
    }
}

// =============================================================================
// Listener
// =============================================================================

/// Counters from one listener run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ListenerStats {
    pub frames_read: u64,
    pub verdicts: u64,
    pub duplicates: u64,
    pub read_errors: u64,
}

/// Background read loop for range scans.
pub struct ResponseListener {
    handle: Arc<dyn PacketHandle>,
    classifier: ResponseClassifier,
    correlation: Arc<CorrelationMap>,
    verdicts: Arc<VerdictLog>,
}

impl ResponseListener {
    pub fn new(
        handle: Arc<dyn PacketHandle>,
        classifier: ResponseClassifier,
        correlation: Arc<CorrelationMap>,
        verdicts: Arc<VerdictLog>,
    ) -> Self {
        Self {
            handle,
            classifier,
            correlation,
            verdicts,
        }
    }

    /// Read and classify frames until `cancel` fires.
    ///
    /// Blocking: each read is bounded by the handle's read timeout, which is
    /// the latency with which cancellation is observed. Read errors are
    /// logged and counted; they never end the loop.
    pub fn run(&self, cancel: &CancellationToken) -> ListenerStats {
        let mut stats = ListenerStats::default();
        tracing::debug!(flow = %self.classifier.expected_flow(), "listener started");

        while !cancel.is_cancelled() {
            let rx = match self.handle.read_frame() {
                Ok(Some(rx)) => rx,
                Ok(None) => continue,
                Err(e) => {
                    stats.read_errors += 1;
                    tracing::warn!(error = %e, "capture read failed, continuing");
                    continue;
                }
            };
            stats.frames_read += 1;

            let Some(result) = self.classifier.classify(&rx, &self.correlation) else {
                continue;
            };
            stats.verdicts += 1;
            tracing::debug!(port = result.port, state = %result.state, rtt = ?result.duration, "reply classified");
            if !self.verdicts.push(result) {
                stats.duplicates += 1;
            }
        }

        tracing::debug!(
            frames = stats.frames_read,
            verdicts = stats.verdicts,
            duplicates = stats.duplicates,
            read_errors = stats.read_errors,
            "listener stopped"
        );
        stats
    }
}
