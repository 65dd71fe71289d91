//! Server-wide counters. Updated with plain atomic operations per endpoint;
//! reads across counters are not transactional with each other (a `stats`
//! event can observe `packets_received` and `packets_routed` from slightly
//! different instants, which is acceptable for a monitoring surface).

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use serde::Serialize;

#[derive(Serialize, Clone, Debug, Default)]
pub struct ServerStats {
    pub packets_received: u64,
    pub packets_routed: u64,
    pub packets_dropped: u64,
    pub bytes_received: u64,
    pub bytes_transmitted: u64,
    pub endpoints_online: u64,
    pub endpoints_total: u64,
    pub uptime_secs: u64,
}

pub struct ServerStatsCounters {
    packets_received: AtomicU64,
    packets_routed: AtomicU64,
    packets_dropped: AtomicU64,
    bytes_received: AtomicU64,
    bytes_transmitted: AtomicU64,
    start_time: Instant,
}

impl Default for ServerStatsCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerStatsCounters {
    pub fn new() -> Self {
        Self {
            packets_received: AtomicU64::new(0),
            packets_routed: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_transmitted: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_routed(&self, bytes: usize) {
        self.packets_routed.fetch_add(1, Ordering::Relaxed);
        self.bytes_transmitted.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, endpoints_online: u64, endpoints_total: u64) -> ServerStats {
        ServerStats {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_routed: self.packets_routed.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_transmitted: self.bytes_transmitted.load(Ordering::Relaxed),
            endpoints_online,
            endpoints_total,
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}
