//! Paced egress queue: smooths bursty virtual-endpoint traffic into an
//! exactly-20 ms cadence toward physical endpoints.
//!
//! One [`PacedFlow`] per `(source, target)` pair. Flow queues live in a
//! [`dashmap::DashMap`] for per-key sharded locking (the same shape the
//! teacher's gateway uses for per-connection state); the round-robin cursor
//! and last-send bookkeeping that must stay globally consistent across
//! flows live under a single `tokio::sync::Mutex` held only for the
//! duration of one `tick`.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use bytes::Bytes;
use dashmap::DashMap;
use fabric_wire::{seq, EndpointId};
use tokio::sync::Mutex;
use tracing::debug;

pub const PACKET_INTERVAL: Duration = Duration::from_millis(20);
pub const MAX_BUFFER_SIZE: usize = 10;
pub const MAX_LATENCY: Duration = Duration::from_millis(100);

const ANTI_BURST_MARGIN: Duration = Duration::from_millis(2);
const DRIFT_THRESHOLD: Duration = Duration::from_millis(10);
const INITIAL_BUFFER_MIN_DEPTH: usize = 2;
const INITIAL_BUFFER_MAX_AGE: Duration = Duration::from_millis(20);
const QUEUE_BUILDUP_THRESHOLD: usize = 5;
const QUEUE_BUILDUP_RATE_LIMIT: Duration = Duration::from_secs(1);
const HEALTHY_INTERVAL: std::ops::RangeInclusive<u64> = 15..=25;
const HISTORY_LEN: usize = 100;

pub type FlowKey = (EndpointId, EndpointId);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViolationKind {
    IntervalDrift,
    QueueBuildup,
    HighLatency,
    PacketInterval,
}

#[derive(Clone, Debug)]
pub struct Violation {
    pub kind: ViolationKind,
    pub flow: Option<FlowKey>,
    pub detail_ms: f64,
}

/// One packet accepted into the egress pipeline but not yet sent.
struct QueuedPacket {
    payload: Bytes,
    sequence: u16,
    enqueue_time: Instant,
}

struct PacedFlow {
    queue: VecDeque<QueuedPacket>,
    packets_sent: u64,
    packets_dropped: u64,
    last_buildup_violation: Option<Instant>,
    last_released_sequence: Option<u16>,
}

impl PacedFlow {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            packets_sent: 0,
            packets_dropped: 0,
            last_buildup_violation: None,
            last_released_sequence: None,
        }
    }
}

struct Cursor {
    index: usize,
    last_global_send: Option<Instant>,
    last_tick: Option<Instant>,
    sent_ever: bool,
    intervals: VecDeque<Duration>,
    violations: VecDeque<Violation>,
}

impl Cursor {
    fn new() -> Self {
        Self {
            index: 0,
            last_global_send: None,
            last_tick: None,
            sent_ever: false,
            intervals: VecDeque::with_capacity(HISTORY_LEN),
            violations: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    fn record_violation(&mut self, kind: ViolationKind, flow: Option<FlowKey>, detail_ms: f64) -> Violation {
        if self.violations.len() >= HISTORY_LEN {
            self.violations.pop_front();
        }
        let violation = Violation { kind, flow, detail_ms };
        self.violations.push_back(violation.clone());
        violation
    }

    fn record_interval(&mut self, delta: Duration) {
        if self.intervals.len() >= HISTORY_LEN {
            self.intervals.pop_front();
        }
        self.intervals.push_back(delta);
    }
}

/// A packet released from the pacer this tick, ready to hand to the
/// datagram socket.
#[derive(Clone, Debug)]
pub struct Egress {
    pub source: EndpointId,
    pub target: EndpointId,
    pub sequence: u16,
    pub payload: Bytes,
}

/// What happened during one [`PacedQueue::tick`] call: at most one packet
/// released, plus any violations newly detected during this tick (empty
/// most ticks).
#[derive(Clone, Debug, Default)]
pub struct TickOutcome {
    pub egress: Option<Egress>,
    pub violations: Vec<Violation>,
    /// Wall-clock gap since the previous release, only set when `egress`
    /// is `Some` and a previous release exists to measure from.
    pub interval_ms: Option<f64>,
}

#[derive(Clone, Debug, Default)]
pub struct PacerStats {
    pub flow_depths: Vec<(FlowKey, usize)>,
    pub total_sent: u64,
    pub total_dropped: u64,
    pub min_interval_ms: Option<f64>,
    pub max_interval_ms: Option<f64>,
    pub avg_interval_ms: Option<f64>,
}

pub struct PacedQueue {
    flows: DashMap<FlowKey, PacedFlow>,
    cursor: Mutex<Cursor>,
}

impl Default for PacedQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PacedQueue {
    pub fn new() -> Self {
        Self { flows: DashMap::new(), cursor: Mutex::new(Cursor::new()) }
    }

    /// Accept a packet into the flow's FIFO, re-sorting by sequence (nearest
    /// to the last-released sequence first) to absorb intra-burst reordering
    /// from the virtual endpoint's source. Drops from the head if the flow
    /// exceeds [`MAX_BUFFER_SIZE`], counting each drop. Returns the number of
    /// packets dropped by this call (0 or 1).
    pub fn enqueue(&self, source: EndpointId, target: EndpointId, sequence: u16, payload: Bytes, now: Instant) -> usize {
        let mut flow = self.flows.entry((source, target)).or_insert_with(PacedFlow::new);
        flow.queue.push_back(QueuedPacket { payload, sequence, enqueue_time: now });

        // Before anything has been released, anchor on the lowest sequence
        // currently buffered rather than the just-arrived packet, so an
        // earlier-sequence packet arriving after a later one still sorts first.
        let anchor = flow
            .last_released_sequence
            .unwrap_or_else(|| flow.queue.iter().map(|p| p.sequence).min().unwrap_or(sequence));
        let mut packets: Vec<QueuedPacket> = flow.queue.drain(..).collect();
        packets.sort_by_key(|p| seq::forward_distance(anchor, p.sequence));
        flow.queue = packets.into();

        let mut dropped = 0;
        while flow.queue.len() > MAX_BUFFER_SIZE {
            flow.queue.pop_front();
            flow.packets_dropped += 1;
            dropped += 1;
            debug!(%source, %target, "pacer buffer overflow, dropped oldest");
        }
        dropped
    }

    /// Fire one pacer tick at time `now`. Releases at most one packet,
    /// chosen by round-robin among non-empty flows, subject to the
    /// anti-burst guard and initial-buffering rule. The returned
    /// [`TickOutcome`] carries any violations newly detected this tick
    /// alongside the released packet, if any.
    pub async fn tick(&self, now: Instant) -> TickOutcome {
        let mut cursor = self.cursor.lock().await;
        let mut violations = Vec::new();

        if let Some(last_tick) = cursor.last_tick {
            let since_last_tick = now.saturating_duration_since(last_tick);
            let drift = if since_last_tick > PACKET_INTERVAL {
                since_last_tick - PACKET_INTERVAL
            } else {
                PACKET_INTERVAL - since_last_tick
            };
            if drift > DRIFT_THRESHOLD && cursor.sent_ever {
                violations.push(cursor.record_violation(ViolationKind::IntervalDrift, None, drift.as_secs_f64() * 1000.0));
            }
        }
        cursor.last_tick = Some(now);

        if let Some(last_send) = cursor.last_global_send {
            let elapsed = now.saturating_duration_since(last_send);
            if elapsed < PACKET_INTERVAL.saturating_sub(ANTI_BURST_MARGIN) {
                return TickOutcome { egress: None, violations, interval_ms: None };
            }
        }

        let mut keys: Vec<FlowKey> = self.flows.iter().map(|e| *e.key()).collect();
        if keys.is_empty() {
            return TickOutcome { egress: None, violations, interval_ms: None };
        }
        keys.sort();

        let len = keys.len();
        let start = cursor.index % len;
        let mut chosen: Option<(usize, FlowKey, QueuedPacket)> = None;

        for offset in 0..len {
            let i = (start + offset) % len;
            let key = keys[i];
            let Some(mut flow) = self.flows.get_mut(&key) else { continue };
            let Some(head) = flow.queue.front() else { continue };

            let depth = flow.queue.len();
            let head_age = now.saturating_duration_since(head.enqueue_time);

            if !cursor.sent_ever && depth < INITIAL_BUFFER_MIN_DEPTH && head_age < INITIAL_BUFFER_MAX_AGE {
                continue;
            }

            if depth > QUEUE_BUILDUP_THRESHOLD {
                let rate_limited = flow
                    .last_buildup_violation
                    .map(|t| now.saturating_duration_since(t) < QUEUE_BUILDUP_RATE_LIMIT)
                    .unwrap_or(false);
                if !rate_limited {
                    flow.last_buildup_violation = Some(now);
                    drop(flow);
                    violations.push(cursor.record_violation(ViolationKind::QueueBuildup, Some(key), depth as f64));
                    flow = self.flows.get_mut(&key).unwrap();
                }
            }

            if head_age > MAX_LATENCY {
                violations.push(cursor.record_violation(ViolationKind::HighLatency, Some(key), head_age.as_secs_f64() * 1000.0));
            }

            let packet = flow.queue.pop_front().expect("checked non-empty above");
            flow.packets_sent += 1;
            flow.last_released_sequence = Some(packet.sequence);
            chosen = Some((i, key, packet));
            break;
        }

        let Some((found_index, key, packet)) = chosen else {
            return TickOutcome { egress: None, violations, interval_ms: None };
        };
        cursor.index = (found_index + 1) % len;

        let mut interval_ms = None;
        if let Some(last_send) = cursor.last_global_send {
            let delta = now.saturating_duration_since(last_send);
            cursor.record_interval(delta);
            interval_ms = Some(delta.as_secs_f64() * 1000.0);
            let delta_ms = delta.as_millis() as u64;
            if !HEALTHY_INTERVAL.contains(&delta_ms) {
                violations.push(cursor.record_violation(ViolationKind::PacketInterval, Some(key), delta.as_secs_f64() * 1000.0));
            }
        }
        cursor.last_global_send = Some(now);
        cursor.sent_ever = true;

        TickOutcome {
            egress: Some(Egress { source: key.0, target: key.1, sequence: packet.sequence, payload: packet.payload }),
            violations,
            interval_ms,
        }
    }

    pub async fn recent_violations(&self) -> Vec<Violation> {
        self.cursor.lock().await.violations.iter().cloned().collect()
    }

    pub async fn stats(&self) -> PacerStats {
        let cursor = self.cursor.lock().await;
        let flow_depths: Vec<(FlowKey, usize)> =
            self.flows.iter().map(|e| (*e.key(), e.queue.len())).collect();
        let total_sent: u64 = self.flows.iter().map(|e| e.packets_sent).sum();
        let total_dropped: u64 = self.flows.iter().map(|e| e.packets_dropped).sum();

        let recent: Vec<f64> = cursor.intervals.iter().rev().take(20).map(|d| d.as_secs_f64() * 1000.0).collect();
        let (min_interval_ms, max_interval_ms, avg_interval_ms) = if recent.is_empty() {
            (None, None, None)
        } else {
            let min = recent.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = recent.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let avg = recent.iter().sum::<f64>() / recent.len() as f64;
            (Some(min), Some(max), Some(avg))
        };

        PacerStats { flow_depths, total_sent, total_dropped, min_interval_ms, max_interval_ms, avg_interval_ms }
    }

    pub fn queue_depth(&self, source: &EndpointId, target: &EndpointId) -> usize {
        self.flows.get(&(*source, *target)).map(|f| f.queue.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> EndpointId {
        EndpointId::new(s).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn releases_at_most_one_packet_per_tick() {
        let pacer = PacedQueue::new();
        let now = Instant::now();
        pacer.enqueue(id("DSH"), id("001"), 0, Bytes::from_static(b"a"), now);
        pacer.enqueue(id("DSH"), id("001"), 1, Bytes::from_static(b"b"), now);

        let first = pacer.tick(now).await;
        assert!(first.egress.is_some());
        assert_eq!(first.egress.unwrap().sequence, 0);

        // Anti-burst guard: calling again immediately yields nothing.
        let second = pacer.tick(now).await;
        assert!(second.egress.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn round_robins_across_flows_fairly() {
        let pacer = PacedQueue::new();
        let t0 = Instant::now();
        for tgt in ["001", "002"] {
            pacer.enqueue(id("DSH"), id(tgt), 0, Bytes::from_static(b"x"), t0);
        }

        let mut targets = Vec::new();
        let mut now = t0;
        for _ in 0..2 {
            if let Some(eg) = pacer.tick(now).await.egress {
                targets.push(eg.target.to_string());
            }
            now += PACKET_INTERVAL;
        }
        targets.sort();
        assert_eq!(targets, vec!["001".to_string(), "002".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_overflow_drops_oldest_and_counts() {
        let pacer = PacedQueue::new();
        let now = Instant::now();
        for seq in 0..(MAX_BUFFER_SIZE as u16 + 3) {
            pacer.enqueue(id("DSH"), id("001"), seq, Bytes::from_static(b"x"), now);
        }
        let stats = pacer.stats().await;
        assert_eq!(stats.total_dropped, 3);
        assert_eq!(pacer.queue_depth(&id("DSH"), &id("001")), MAX_BUFFER_SIZE);
    }

    #[tokio::test(start_paused = true)]
    async fn high_latency_head_triggers_violation() {
        let pacer = PacedQueue::new();
        let t0 = Instant::now();
        pacer.enqueue(id("DSH"), id("001"), 0, Bytes::from_static(b"x"), t0);
        let later = t0 + MAX_LATENCY + Duration::from_millis(1);
        let outcome = pacer.tick(later).await;
        assert!(outcome.violations.iter().any(|v| v.kind == ViolationKind::HighLatency));
        let violations = pacer.recent_violations().await;
        assert!(violations.iter().any(|v| v.kind == ViolationKind::HighLatency));
    }

    #[tokio::test(start_paused = true)]
    async fn initial_buffering_skips_lone_fresh_packet() {
        let pacer = PacedQueue::new();
        let t0 = Instant::now();
        pacer.enqueue(id("DSH"), id("001"), 0, Bytes::from_static(b"x"), t0);
        // Single packet, fresh, pacer has never sent: should be skipped.
        let result = pacer.tick(t0).await;
        assert!(result.egress.is_none());
        assert_eq!(pacer.queue_depth(&id("DSH"), &id("001")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_reports_drop_count() {
        let pacer = PacedQueue::new();
        let now = Instant::now();
        for seq in 0..MAX_BUFFER_SIZE as u16 {
            assert_eq!(pacer.enqueue(id("DSH"), id("001"), seq, Bytes::from_static(b"x"), now), 0);
        }
        assert_eq!(pacer.enqueue(id("DSH"), id("001"), MAX_BUFFER_SIZE as u16, Bytes::from_static(b"x"), now), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_bursts_are_released_in_sequence_order() {
        let pacer = PacedQueue::new();
        let t0 = Instant::now();
        // Arrives out of order within one burst: 2, 0, 1.
        pacer.enqueue(id("DSH"), id("001"), 2, Bytes::from_static(b"c"), t0);
        pacer.enqueue(id("DSH"), id("001"), 0, Bytes::from_static(b"a"), t0);
        pacer.enqueue(id("DSH"), id("001"), 1, Bytes::from_static(b"b"), t0);

        let mut now = t0;
        let mut released = Vec::new();
        for _ in 0..3 {
            if let Some(eg) = pacer.tick(now).await.egress {
                released.push(eg.sequence);
            }
            now += PACKET_INTERVAL;
        }
        assert_eq!(released, vec![0, 1, 2]);
    }
}
