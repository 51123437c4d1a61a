use crate::flow::Path;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-wide counters
#[derive(Debug, Default)]
pub struct EngineStats {
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    packets_discarded: AtomicU64,
    zero_reads: AtomicU64,
    device_read_errors: AtomicU64,
    total_flows: AtomicU64,
    active_flows: AtomicU64,
    proxy_flows: AtomicU64,
    direct_flows: AtomicU64,
    dns_fallback_flows: AtomicU64,
    dial_failures: AtomicU64,
    udp_dropped: AtomicU64,
    dns_queries: AtomicU64,
    dns_responses: AtomicU64,
}

/// Point-in-time copy of `EngineStats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub packets_in: u64,
    pub packets_out: u64,
    pub packets_discarded: u64,
    pub zero_reads: u64,
    pub device_read_errors: u64,
    pub total_flows: u64,
    pub active_flows: u64,
    pub proxy_flows: u64,
    pub direct_flows: u64,
    pub dns_fallback_flows: u64,
    pub dial_failures: u64,
    pub udp_dropped: u64,
    pub dns_queries: u64,
    pub dns_responses: u64,
}

impl EngineStats {
    pub fn packet_in(&self) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_out(&self) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_discarded(&self) {
        self.packets_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn zero_read(&self) {
        self.zero_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read_error(&self) {
        self.device_read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flow_opened(&self) {
        self.total_flows.fetch_add(1, Ordering::Relaxed);
        self.active_flows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flow_closed(&self) {
        let _ = self
            .active_flows
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_path(&self, path: Path) {
        let counter = match path {
            Path::Proxy => &self.proxy_flows,
            Path::Direct => &self.direct_flows,
            Path::DnsFallback => &self.dns_fallback_flows,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn udp_dropped(&self) {
        self.udp_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dns_query(&self) {
        self.dns_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dns_response(&self) {
        self.dns_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            packets_discarded: self.packets_discarded.load(Ordering::Relaxed),
            zero_reads: self.zero_reads.load(Ordering::Relaxed),
            device_read_errors: self.device_read_errors.load(Ordering::Relaxed),
            total_flows: self.total_flows.load(Ordering::Relaxed),
            active_flows: self.active_flows.load(Ordering::Relaxed),
            proxy_flows: self.proxy_flows.load(Ordering::Relaxed),
            direct_flows: self.direct_flows.load(Ordering::Relaxed),
            dns_fallback_flows: self.dns_fallback_flows.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            udp_dropped: self.udp_dropped.load(Ordering::Relaxed),
            dns_queries: self.dns_queries.load(Ordering::Relaxed),
            dns_responses: self.dns_responses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_counters() {
        let stats = EngineStats::default();
        stats.flow_opened();
        stats.flow_opened();
        stats.flow_closed();
        stats.record_path(Path::DnsFallback);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_flows, 2);
        assert_eq!(snapshot.active_flows, 1);
        assert_eq!(snapshot.dns_fallback_flows, 1);
    }

    #[test]
    fn test_active_flows_never_underflows() {
        let stats = EngineStats::default();
        stats.flow_closed();
        assert_eq!(stats.snapshot().active_flows, 0);
    }
}
