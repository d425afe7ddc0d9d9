//! Lifecycle and traffic notifications for service observers.

use std::net::SocketAddr;

use crate::stats::TrafficSnapshot;

/// Notifications delivered to subscribers of a [`Service`](crate::Service).
///
/// Each event is broadcast once; a subscriber that lags behind the channel
/// capacity misses the oldest events rather than receiving duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    Started { proxy_addr: SocketAddr },
    Stopped,
    /// Cumulative totals after a relay or tunnel session completed.
    Traffic(TrafficSnapshot),
    /// The tunnel interface stopped being readable; a reconnect is scheduled.
    InterfaceLost,
    /// A reconnect attempt brought the tunnel interface back.
    InterfaceRestored,
}
