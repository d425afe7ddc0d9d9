//! Process-wide traffic accounting.
//!
//! Counters are plain atomics bumped with `fetch_add`; many connection tasks
//! update them concurrently and nobody takes a lock to do so.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

#[derive(Debug, Default)]
pub struct TrafficStats {
    total: AtomicU64,
    active: AtomicU64,
    failed: AtomicU64,
    sessions: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_closed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Add one finished relay/tunnel session and return the new totals.
    pub fn record_session(&self, bytes: SessionBytes) -> TrafficSnapshot {
        self.sessions.fetch_add(1, Ordering::Relaxed);
        let bytes_in = self.bytes_in.fetch_add(bytes.bytes_in, Ordering::Relaxed) + bytes.bytes_in;
        let bytes_out =
            self.bytes_out.fetch_add(bytes.bytes_out, Ordering::Relaxed) + bytes.bytes_out;
        TrafficSnapshot {
            bytes_in,
            bytes_out,
        }
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    /// Zero the byte counters. Connection counters keep running.
    pub fn reset(&self) {
        self.bytes_in.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
    }

    pub fn print(&self) {
        let traffic = self.snapshot();
        info!(
            "📊 total={} active={} failed={} sessions={} in={} out={}",
            self.total(),
            self.active(),
            self.failed(),
            self.sessions(),
            format_bytes(traffic.bytes_in),
            format_bytes(traffic.bytes_out),
        );
    }
}

/// Bytes moved by a single connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionBytes {
    /// Upstream to client.
    pub bytes_in: u64,
    /// Client to upstream.
    pub bytes_out: u64,
}

/// Cumulative totals as delivered to observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl TrafficSnapshot {
    pub fn total(&self) -> u64 {
        self.bytes_in.saturating_add(self.bytes_out)
    }
}

/// Render a byte count with binary units, e.g. `1.5 KB`.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    match bytes {
        b if b < KB => format!("{} B", b),
        b if b < MB => format!("{:.1} KB", b as f64 / KB as f64),
        b if b < GB => format!("{:.1} MB", b as f64 / MB as f64),
        b => format!("{:.1} GB", b as f64 / GB as f64),
    }
}
