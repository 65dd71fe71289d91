//! Datagram-arrival monitor fan-out: individual arrivals are accumulated
//! and flushed to control clients as a single batched `packets` event once
//! per 100 ms. An empty window produces no event.

use std::time::Duration;

use parking_lot::Mutex;

use crate::messages::MonitorEvent;

pub const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
pub struct MonitorBatch {
    pending: Mutex<Vec<MonitorEvent>>,
}

impl MonitorBatch {
    pub fn new() -> Self {
        Self { pending: Mutex::new(Vec::new()) }
    }

    pub fn record(&self, event: MonitorEvent) {
        self.pending.lock().push(event);
    }

    /// Drain whatever has accumulated. Returns `None` if nothing arrived
    /// since the last flush.
    pub fn flush(&self) -> Option<Vec<MonitorEvent>> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut pending))
        }
    }
}
