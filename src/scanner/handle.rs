//! Raw capture/injection handle bound to one network interface.
//!
//! The `PacketHandle` trait abstracts over the real `AF_PACKET` socket and
//! `MockHandle` (in-memory test double). Methods take `&self` so one handle,
//! shared through an `Arc`, can be written by the probe-firing context while
//! the listener reads from it concurrently.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::error::ScanError;

/// A single captured frame.
#[derive(Debug, Clone)]
pub struct RxFrame {
    /// Raw bytes starting at the Ethernet header.
    pub data: Vec<u8>,
    /// When the frame was handed to us.
    pub received_at: Instant,
}

impl RxFrame {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            received_at: Instant::now(),
        }
    }
}

/// Bidirectional raw frame handle.
pub trait PacketHandle: Send + Sync {
    /// Inject a complete Ethernet frame.
    fn write_frame(&self, frame: &[u8]) -> Result<(), ScanError>;

    /// Read one captured frame.
    ///
    /// Blocks for at most the handle's read timeout; returns `Ok(None)` when
    /// it expires with nothing captured, so callers can observe deadlines and
    /// cancellation between reads.
    fn read_frame(&self) -> Result<Option<RxFrame>, ScanError>;

    /// Name of the interface this handle is bound to.
    fn interface(&self) -> &str;

    /// Return `self` as `&dyn Any` to enable safe downcasting in tests.
    fn as_any(&self) -> &dyn Any;
}

/// Open a raw handle on `interface`.
///
/// # Errors
/// Returns `ScanError::Open` when the socket cannot be created or bound
/// (missing `CAP_NET_RAW`, unknown interface) and `ScanError::Unsupported`
/// on platforms without `AF_PACKET`.
pub fn open_handle(
    interface: &str,
    read_timeout: Duration,
) -> Result<Arc<dyn PacketHandle>, ScanError> {
    #[cfg(target_os = "linux")]
    {
        let socket = PacketSocket::open(interface, read_timeout)?;
        Ok(Arc::new(socket))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (interface, read_timeout);
        Err(ScanError::Unsupported(
            "raw frame capture requires Linux AF_PACKET sockets".to_string(),
        ))
    }
}

// =============================================================================
// Mock implementation for unit testing
// =============================================================================

/// Produces reply frames for a frame written to a `MockHandle`.
pub type Responder = Box<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

/// Mock handle that records written frames and returns queued RX frames.
///
/// An optional responder plays the part of the network: every frame written
/// is passed to it and whatever it returns is queued for reading, which lets
/// tests script ARP responders and open/closed/silent ports.
pub struct MockHandle {
    interface: String,
    sent: Mutex<Vec<Vec<u8>>>,
    rx_queue: Mutex<VecDeque<Vec<u8>>>,
    responder: Option<Responder>,
    read_timeout: Duration,
    fail_writes: AtomicUsize,
    fail_reads: AtomicUsize,
    reads: AtomicUsize,
}

impl MockHandle {
    /// Create a mock with no responder and a 5 ms read timeout.
    pub fn new() -> Self {
        Self {
            interface: "mock0".to_string(),
            sent: Mutex::new(Vec::new()),
            rx_queue: Mutex::new(VecDeque::new()),
            responder: None,
            read_timeout: Duration::from_millis(5),
            fail_writes: AtomicUsize::new(0),
            fail_reads: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        }
    }

    /// Create a mock that answers written frames through `responder`.
    pub fn with_responder(
        responder: impl Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new()
        }
    }

    /// Queue a frame to be returned by a later `read_frame`.
    pub fn queue_rx_frame(&self, data: Vec<u8>) {
        lock(&self.rx_queue).push_back(data);
    }

    /// Make the next `n` writes fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` reads fail.
    pub fn fail_next_reads(&self, n: usize) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Number of frames written so far.
    pub fn sent_count(&self) -> usize {
        lock(&self.sent).len()
    }

    /// Copy of every frame written so far, in order.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        lock(&self.sent).clone()
    }

    /// Number of `read_frame` calls so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl Default for MockHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Take a mutex even if a panicking test thread poisoned it.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Decrement `counter` if non-zero, reporting whether it was.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl PacketHandle for MockHandle {
    fn write_frame(&self, frame: &[u8]) -> Result<(), ScanError> {
        if take_one(&self.fail_writes) {
            return Err(ScanError::Write("mock write failure".into()));
        }
        lock(&self.sent).push(frame.to_vec());
        if let Some(responder) = &self.responder {
            let replies = responder(frame);
            lock(&self.rx_queue).extend(replies);
        }
        Ok(())
    }

    fn read_frame(&self) -> Result<Option<RxFrame>, ScanError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.fail_reads) {
            return Err(ScanError::Read("mock read failure".into()));
        }
        let next = lock(&self.rx_queue).pop_front();
        match next {
            Some(data) => Ok(Some(RxFrame::new(data))),
            None => {
                std::thread::sleep(self.read_timeout);
                Ok(None)
            }
        }
    }

    fn interface(&self) -> &str {
        &self.interface
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// Real AF_PACKET implementation (Linux only)
// =============================================================================

/// Maximum captured frame size.
#[cfg(target_os = "linux")]
const SNAPLEN: usize = 65535;

/// `sll_pkttype` of frames we transmitted ourselves.
#[cfg(target_os = "linux")]
const PACKET_OUTGOING: u8 = 4;

/// Raw `AF_PACKET / SOCK_RAW` socket bound to one interface.
///
/// Requires `CAP_NET_RAW`. Receives every protocol (`ETH_P_ALL`) seen on the
/// interface; `SO_RCVTIMEO` bounds each read so the listener loop can observe
/// cancellation. The descriptor is closed exactly once, on drop.
#[cfg(target_os = "linux")]
pub struct PacketSocket {
    fd: i32,
    ifindex: i32,
    interface: String,
    read_buf: Mutex<Vec<u8>>,
}

#[cfg(target_os = "linux")]
impl PacketSocket {
    /// Open and bind a packet socket on `interface`.
    ///
    /// # Errors
    /// Returns `ScanError::Open` if the interface is unknown or `socket()`,
    /// `bind()` or `setsockopt()` fails.
    pub fn open(interface: &str, read_timeout: Duration) -> Result<Self, ScanError> {
        let ifindex = crate::route::interface_index(interface)
            .map_err(|e| ScanError::Open(e.to_string()))? as i32;

        let protocol = (libc::ETH_P_ALL as u16).to_be() as i32;
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, protocol) };
        if fd < 0 {
            return Err(ScanError::Open(format!(
                "AF_PACKET socket on {interface}: {}",
                std::io::Error::last_os_error()
            )));
        }
        // From here on, Drop closes the descriptor on every error path.
        let socket = Self {
            fd,
            ifindex,
            interface: interface.to_string(),
            read_buf: Mutex::new(vec![0u8; SNAPLEN]),
        };

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = protocol as u16;
        addr.sll_ifindex = ifindex;
        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(ScanError::Open(format!(
                "bind to {interface}: {}",
                std::io::Error::last_os_error()
            )));
        }

        let timeout = libc::timeval {
            tv_sec: read_timeout.as_secs() as libc::time_t,
            tv_usec: read_timeout.subsec_micros() as libc::suseconds_t,
        };
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(ScanError::Open(format!(
                "SO_RCVTIMEO on {interface}: {}",
                std::io::Error::last_os_error()
            )));
        }

        tracing::debug!(interface, ifindex, "packet socket opened");
        Ok(socket)
    }
}

#[cfg(target_os = "linux")]
impl Drop for PacketSocket {
    fn drop(&mut self) {
        if self.fd >= 0 {
            tracing::debug!(interface = %self.interface, "closing packet socket");
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}

#[cfg(target_os = "linux")]
impl PacketHandle for PacketSocket {
    fn write_frame(&self, frame: &[u8]) -> Result<(), ScanError> {
        if frame.len() < 14 {
            return Err(ScanError::Write(format!(
                "frame too short for an Ethernet header: {} bytes",
                frame.len()
            )));
        }
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_ifindex = self.ifindex;
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(&frame[..6]);

        let ret = unsafe {
            libc::sendto(
                self.fd,
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(ScanError::Write(format!(
                "sendto on {}: {}",
                self.interface,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn read_frame(&self) -> Result<Option<RxFrame>, ScanError> {
        let mut buf = lock(&self.read_buf);
        let mut from: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        let mut from_len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut from as *mut libc::sockaddr_ll as *mut libc::sockaddr,
                &mut from_len,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            return match err.kind() {
                std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted => Ok(None),
                _ => Err(ScanError::Read(format!("recvfrom on {}: {err}", self.interface))),
            };
        }
        if from.sll_pkttype == PACKET_OUTGOING {
            return Ok(None);
        }
        Ok(Some(RxFrame::new(buf[..n as usize].to_vec())))
    }

    fn interface(&self) -> &str {
        &self.interface
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
