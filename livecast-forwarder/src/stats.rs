//! Forwarder statistics.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot returned by `stats()`.
#[derive(Debug, Clone, Default)]
pub struct ForwarderStats {
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub packets_lost: u64,
    /// Latest fault; latched, never cleared.
    pub last_error: Option<String>,
    pub connected: bool,
    pub reconnect_count: u64,
}

#[derive(Default)]
struct ConnState {
    connected: bool,
    last_error: Option<String>,
}

/// Shared counter block. Counters are atomics; the connected flag and the
/// latched error share one lock so a snapshot never mixes the two.
#[derive(Default)]
pub(crate) struct Counters {
    bytes_sent: AtomicU64,
    packets_sent: AtomicU64,
    packets_lost: AtomicU64,
    reconnect_count: AtomicU64,
    conn: RwLock<ConnState>,
}

impl Counters {
    pub(crate) fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_packets_sent(&self, n: u64) {
        self.packets_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_packets_lost(&self, n: u64) {
        self.packets_lost.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_reconnect(&self) {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reconnect_count(&self) -> u64 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.conn.write().connected = connected;
    }

    pub(crate) fn record_error(&self, err: &dyn std::fmt::Display) {
        let mut conn = self.conn.write();
        conn.last_error = Some(err.to_string());
        conn.connected = false;
    }

    pub(crate) fn snapshot(&self) -> ForwarderStats {
        let conn = self.conn.read();
        ForwarderStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_lost: self.packets_lost.load(Ordering::Relaxed),
            last_error: conn.last_error.clone(),
            connected: conn.connected,
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
        }
    }
}
