//! Table of live client connections.
//!
//! Keyed by the client's remote `addr:port`. The table exists so shutdown can
//! reach every open connection; handlers own their sockets and the table only
//! holds a cancellation token per entry.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    ReadingRequest,
    Relaying,
    Closed,
}

#[derive(Debug)]
struct Entry {
    serial: u64,
    phase: ConnectionPhase,
    token: CancellationToken,
    accepted_at: Instant,
}

/// Read-only view of one registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub phase: ConnectionPhase,
    pub age: Duration,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: DashMap<SocketAddr, Entry>,
    next_serial: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `peer` and hand back the guard that removes it again.
    pub fn register(self: &Arc<Self>, peer: SocketAddr) -> Registration {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.entries.insert(
            peer,
            Entry {
                serial,
                phase: ConnectionPhase::ReadingRequest,
                token: token.clone(),
                accepted_at: Instant::now(),
            },
        );

        Registration {
            registry: Arc::clone(self),
            peer,
            serial,
            token,
        }
    }

    /// Force-close every registered connection. Returns how many were signalled.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for entry in self.entries.iter() {
            entry.token.cancel();
            closed += 1;
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn phase(&self, peer: &SocketAddr) -> Option<ConnectionPhase> {
        self.entries.get(peer).map(|e| e.phase)
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.entries
            .iter()
            .map(|e| ConnectionInfo {
                peer: *e.key(),
                phase: e.phase,
                age: e.accepted_at.elapsed(),
            })
            .collect()
    }
}

/// Handler-side handle on a registry entry. Dropping it unregisters the
/// connection.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    peer: SocketAddr,
    serial: u64,
    token: CancellationToken,
}

impl Registration {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Cancelled when the registry force-closes this connection.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn set_phase(&self, phase: ConnectionPhase) {
        if let Some(mut entry) = self.registry.entries.get_mut(&self.peer) {
            if entry.serial == self.serial {
                entry.phase = phase;
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.set_phase(ConnectionPhase::Closed);
        // a reused peer address may already belong to a newer connection
        self.registry
            .entries
            .remove_if(&self.peer, |_, entry| entry.serial == self.serial);
    }
}
