//! Packet loop over the tunnel interface.
//!
//! Every packet read from the interface is classified by its IP header and
//! written back unmodified. Classification only feeds the counters; nothing is
//! redirected into the proxy.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::interface::VirtualInterface;

/// Largest packet the loop reads in one go.
pub const PACKET_BUFFER_SIZE: usize = 32767;

const READ_ERROR_BACKOFF: Duration = Duration::from_millis(10);

const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
    Other(u8),
}

impl From<u8> for Transport {
    fn from(protocol: u8) -> Self {
        match protocol {
            PROTO_TCP => Transport::Tcp,
            PROTO_UDP => Transport::Udp,
            other => Transport::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Ipv4 { header_len: usize, transport: Transport },
    Ipv6,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,
    #[error("truncated IPv4 header ({len} bytes)")]
    Truncated { len: usize },
    #[error("unknown IP version {0}")]
    UnknownVersion(u8),
}

/// Inspect the IP header of a raw packet.
pub fn classify(packet: &[u8]) -> Result<PacketKind, PacketError> {
    let first = *packet.first().ok_or(PacketError::Empty)?;
    match first >> 4 {
        4 => {
            let header_len = usize::from(first & 0x0f) * 4;
            if header_len < 20 || packet.len() < header_len {
                return Err(PacketError::Truncated { len: packet.len() });
            }
            Ok(PacketKind::Ipv4 {
                header_len,
                transport: Transport::from(packet[9]),
            })
        }
        6 => Ok(PacketKind::Ipv6),
        version => Err(PacketError::UnknownVersion(version)),
    }
}

#[derive(Debug, Default)]
pub struct DispatchStats {
    tcp: AtomicU64,
    udp: AtomicU64,
    other: AtomicU64,
    ipv6: AtomicU64,
    dropped: AtomicU64,
    read_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSnapshot {
    pub tcp: u64,
    pub udp: u64,
    pub other: u64,
    pub ipv6: u64,
    pub dropped: u64,
    pub read_errors: u64,
}

impl DispatchSnapshot {
    pub fn forwarded(&self) -> u64 {
        self.tcp + self.udp + self.other + self.ipv6
    }
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, kind: PacketKind) {
        let counter = match kind {
            PacketKind::Ipv4 {
                transport: Transport::Tcp,
                ..
            } => &self.tcp,
            PacketKind::Ipv4 {
                transport: Transport::Udp,
                ..
            } => &self.udp,
            PacketKind::Ipv4 { .. } => &self.other,
            PacketKind::Ipv6 => &self.ipv6,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            tcp: self.tcp.load(Ordering::Relaxed),
            udp: self.udp.load(Ordering::Relaxed),
            other: self.other.load(Ordering::Relaxed),
            ipv6: self.ipv6.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }
}

/// Why the packet loop returned.
#[derive(Debug)]
pub enum DispatchExit {
    /// Shutdown was requested.
    Cancelled,
    /// The interface reported end of stream.
    Closed,
    /// The interface handle is no longer usable.
    Failed(io::Error),
}

impl DispatchExit {
    /// Whether the interface went away on its own.
    pub fn is_interface_loss(&self) -> bool {
        !matches!(self, DispatchExit::Cancelled)
    }
}

/// Errors that mean the device itself is gone rather than one bad packet.
fn is_fatal(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
    ) {
        return true;
    }
    // EIO, EBADF, ENODEV, EBADFD
    #[cfg(unix)]
    if matches!(e.raw_os_error(), Some(5 | 9 | 19 | 77)) {
        return true;
    }
    false
}

/// Run the packet loop until `shutdown` fires or the interface goes away.
pub async fn run(
    iface: &mut VirtualInterface,
    shutdown: &CancellationToken,
    stats: &DispatchStats,
) -> DispatchExit {
    let mut buf = vec![0u8; PACKET_BUFFER_SIZE];
    debug!("Packet loop started on {}", iface.config().name);

    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => return DispatchExit::Cancelled,
            read = iface.read_packet(&mut buf) => read,
        };

        let len = match read {
            Ok(0) => return DispatchExit::Closed,
            Ok(len) => len,
            Err(e) if is_fatal(&e) => return DispatchExit::Failed(e),
            Err(e) => {
                stats.read_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Packet read error on {}: {}", iface.config().name, e);
                tokio::time::sleep(READ_ERROR_BACKOFF).await;
                continue;
            }
        };

        let packet = &buf[..len];
        match classify(packet) {
            Ok(kind) => {
                trace!("Packet {:?} ({} bytes)", kind, len);
                stats.record(kind);
                if let Err(e) = iface.write_packet(packet).await {
                    if is_fatal(&e) {
                        return DispatchExit::Failed(e);
                    }
                    warn!("Packet write error on {}: {}", iface.config().name, e);
                }
            }
            Err(e) => {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Dropping packet: {}", e);
            }
        }

        tokio::task::yield_now().await;
    }
}
