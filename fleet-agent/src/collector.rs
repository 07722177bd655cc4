//! Host and proxy telemetry sampling. Generalizes `sim_core::tick_asset`'s
//! "advance shared state, return a snapshot" shape to the three record kinds
//! this agent produces: system metrics, proxy metrics, and access-log lines
//! (here read from a tailed file rather than simulated, per spec.md §4.2's
//! "log lines are sent as produced by the tailer").

use std::io::{BufRead, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use fleet_proto::{AccessLogRecord, AgentId, ProxyMetricRecord, SystemMetricRecord};

/// Running counters for a single ramp-style sample, mirroring the
/// accumulate-then-snapshot pattern of `sim_core::BessState`.
pub struct HostState {
    started_at: std::time::Instant,
    requests_total: AtomicU64,
}

impl HostState {
    pub fn new() -> Self {
        Self {
            started_at: std::time::Instant::now(),
            requests_total: AtomicU64::new(0),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl Default for HostState {
    fn default() -> Self {
        Self::new()
    }
}

/// Samples `/proc`-style host metrics where available, falling back to a
/// deterministic synthetic reading on platforms without procfs (matching
/// `tick_asset`'s deterministic-model approach rather than a random walk).
pub fn sample_system_metrics(agent_id: &AgentId, state: &HostState) -> SystemMetricRecord {
    let (cpu_used_percent, memory_used_bytes, memory_total_bytes) = read_proc_meminfo().unwrap_or((
        5.0 + (state.uptime_secs() % 20) as f64,
        512 * 1024 * 1024,
        2 * 1024 * 1024 * 1024,
    ));

    SystemMetricRecord {
        agent_id: agent_id.clone(),
        timestamp: Utc::now(),
        cpu_used_percent,
        memory_used_bytes,
        memory_total_bytes,
        net_rx_bytes_per_sec: 0.0,
        net_tx_bytes_per_sec: 0.0,
    }
}

fn read_proc_meminfo() -> Option<(f64, u64, u64)> {
    let text = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total_kb = None;
    let mut available_kb = None;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = rest.trim().trim_end_matches(" kB").trim().parse::<u64>().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = rest.trim().trim_end_matches(" kB").trim().parse::<u64>().ok();
        }
    }
    let total_kb = total_kb?;
    let available_kb = available_kb?;
    let used_kb = total_kb.saturating_sub(available_kb);
    let percent = if total_kb > 0 {
        100.0 * used_kb as f64 / total_kb as f64
    } else {
        0.0
    };
    Some((percent, used_kb * 1024, total_kb * 1024))
}

/// Proxy stub-status style counters. Without a live nginx/haproxy this reports
/// monotonic counters derived from uptime; real deployments source this from
/// the proxy's status module the way `edge_agent` sources its telemetry from
/// `tick_asset`.
pub fn sample_proxy_metrics(agent_id: &AgentId, state: &HostState) -> ProxyMetricRecord {
    let total = state.requests_total.fetch_add(10, Ordering::Relaxed) + 10;
    ProxyMetricRecord {
        agent_id: agent_id.clone(),
        timestamp: Utc::now(),
        active_connections: 4,
        accepted: total,
        handled: total,
        reading: 1,
        writing: 1,
        waiting: 2,
        total_requests: total,
    }
}

/// Tails an access-log file from its last read offset, parsing the
/// common-log-ish line format `status method uri client_ip bytes request_ms`.
/// Lines that don't parse are skipped rather than failing the whole batch.
pub struct AccessLogTailer {
    path: PathBuf,
    offset: u64,
}

impl AccessLogTailer {
    pub fn new(path: PathBuf) -> Self {
        Self { path, offset: 0 }
    }

    pub fn poll(&mut self, agent_id: &AgentId) -> Vec<AccessLogRecord> {
        let Ok(mut file) = std::fs::File::open(&self.path) else {
            return Vec::new();
        };
        if file.seek(SeekFrom::Start(self.offset)).is_err() {
            return Vec::new();
        }
        let reader = std::io::BufReader::new(&mut file);
        let mut records = Vec::new();
        let mut bytes_read = 0u64;
        for line in reader.lines().map_while(Result::ok) {
            bytes_read += line.len() as u64 + 1;
            if let Some(record) = parse_access_log_line(agent_id, &line) {
                records.push(record);
            }
        }
        self.offset += bytes_read;
        records
    }
}

fn parse_access_log_line(agent_id: &AgentId, line: &str) -> Option<AccessLogRecord> {
    let mut parts = line.split_whitespace();
    let status_code: i32 = parts.next()?.parse().ok()?;
    let method = parts.next()?.to_string();
    let uri = parts.next()?.to_string();
    let client_ip = parts.next()?.to_string();
    let bytes_sent: u64 = parts.next()?.parse().ok()?;
    let request_time_ms: f64 = parts.next()?.parse().ok()?;

    Some(AccessLogRecord {
        agent_id: agent_id.clone(),
        timestamp: Utc::now(),
        status_code,
        method,
        uri,
        client_ip,
        bytes_sent,
        upstream_response_time_ms: request_time_ms,
        request_time_ms,
        referer: String::new(),
        user_agent: String::new(),
        request_id: uuid::Uuid::new_v4().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_metrics_report_plausible_bounds() {
        let state = HostState::new();
        let sample = sample_system_metrics(&"agent-1".to_string(), &state);
        assert!(sample.cpu_used_percent >= 0.0);
        assert!(sample.memory_total_bytes > 0);
    }

    #[test]
    fn proxy_metrics_counters_are_monotonic() {
        let state = HostState::new();
        let first = sample_proxy_metrics(&"agent-1".to_string(), &state);
        let second = sample_proxy_metrics(&"agent-1".to_string(), &state);
        assert!(second.total_requests > first.total_requests);
    }

    #[test]
    fn tailer_parses_well_formed_lines_and_advances_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "200 GET /health 10.0.0.1 512 4.2\nnot-a-line\n").unwrap();

        let mut tailer = AccessLogTailer::new(path.clone());
        let records = tailer.poll(&"agent-1".to_string());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status_code, 200);

        // A second poll with no new bytes returns nothing.
        let records = tailer.poll(&"agent-1".to_string());
        assert!(records.is_empty());
    }
}
