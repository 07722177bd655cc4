//! Process-wide counters exposed at `GET /metrics` (spec.md §6).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct GatewayMetrics {
    pub messages_total: AtomicU64,
    pub db_operations_total: AtomicU64,
    db_latency_sum_ms: AtomicU64,
}

impl GatewayMetrics {
    /// Records one completed database operation (ingest flush, command-ack
    /// write, auto-assignment lookup, …) for the `db_operations_total` /
    /// `db_latency_avg_ms` gauges.
    pub fn record_db_op(&self, elapsed: Duration) {
        self.db_operations_total.fetch_add(1, Ordering::Relaxed);
        self.db_latency_sum_ms.fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    /// Prometheus-ish text exposition, in the style spec.md §6 names
    /// (`gateway_agents_total{status}`, …).
    pub fn render(&self, agents_online: usize, tasks: usize) -> String {
        let ops = self.db_operations_total.load(Ordering::Relaxed);
        let avg_latency_ms = if ops > 0 { self.db_latency_sum_ms.load(Ordering::Relaxed) / ops } else { 0 };
        format!(
            "gateway_agents_total{{status=\"online\"}} {}\n\
             gateway_messages_total {}\n\
             gateway_db_operations_total {}\n\
             gateway_db_latency_avg_ms {}\n\
             gateway_memory_alloc_bytes {}\n\
             gateway_tasks {}\n",
            agents_online,
            self.messages_total.load(Ordering::Relaxed),
            ops,
            avg_latency_ms,
            0,
            tasks,
        )
    }
}
