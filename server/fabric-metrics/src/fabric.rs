use metrics::{counter, gauge, histogram};

use crate::labels::LabelPolicy;
use fabric_wire::EndpointId;

/// Metric names under `{ns}_*`.
pub struct FabricMetrics {
    ns: &'static str,
    policy: LabelPolicy,
}

impl FabricMetrics {
    pub fn new(namespace: &'static str, policy: LabelPolicy) -> Self {
        Self { ns: namespace, policy }
    }

    #[inline]
    pub fn packet_received(&self, bytes: usize) {
        counter!(format!("{}_packets_received_total", self.ns)).increment(1);
        counter!(format!("{}_bytes_received_total", self.ns)).increment(bytes as u64);
    }

    #[inline]
    pub fn packet_routed(&self, bytes: usize) {
        counter!(format!("{}_packets_routed_total", self.ns)).increment(1);
        counter!(format!("{}_bytes_transmitted_total", self.ns)).increment(bytes as u64);
    }

    #[inline]
    pub fn packet_dropped(&self, reason: &'static str) {
        counter!(
            format!("{}_packets_dropped_total", self.ns),
            "reason" => LabelPolicy::reason(reason).as_str().to_string()
        )
        .increment(1);
    }

    #[inline]
    pub fn endpoints_online(&self, count: u64) {
        gauge!(format!("{}_endpoints_online", self.ns)).set(count as f64);
    }

    #[inline]
    pub fn endpoints_total(&self, count: u64) {
        gauge!(format!("{}_endpoints_total", self.ns)).set(count as f64);
    }

    #[inline]
    pub fn pacer_queue_depth(&self, source: &EndpointId, target: &EndpointId, depth: usize) {
        gauge!(
            format!("{}_pacer_queue_depth", self.ns),
            "flow" => self.policy.flow_bucket(source, target).as_str().to_string()
        )
        .set(depth as f64);
    }

    #[inline]
    pub fn pacer_sent(&self) {
        counter!(format!("{}_pacer_sent_total", self.ns)).increment(1);
    }

    #[inline]
    pub fn pacer_dropped(&self, count: u64) {
        counter!(format!("{}_pacer_dropped_total", self.ns)).increment(count);
    }

    #[inline]
    pub fn pacer_violation(&self, kind: &'static str) {
        counter!(
            format!("{}_pacer_violations_total", self.ns),
            "kind" => LabelPolicy::kind(kind).as_str().to_string()
        )
        .increment(1);
    }

    #[inline]
    pub fn pacer_interval(&self, ms: f64) {
        histogram!(format!("{}_pacer_interval_ms", self.ns)).record(ms);
    }

    #[inline]
    pub fn control_client_connected(&self) {
        gauge!(format!("{}_control_clients_connected", self.ns)).increment(1.0);
    }

    #[inline]
    pub fn control_client_disconnected(&self) {
        gauge!(format!("{}_control_clients_connected", self.ns)).decrement(1.0);
    }

    #[inline]
    pub fn control_command(&self, kind: &'static str) {
        counter!(
            format!("{}_control_commands_total", self.ns),
            "kind" => LabelPolicy::kind(kind).as_str().to_string()
        )
        .increment(1);
    }
}
