//! Single producer into the shared WAB (spec.md §5 "WAB is single-writer
//! multi-reader"): heartbeats and metrics on their own tickers, log lines
//! batched to one flush per 100ms, all serialized and appended so every
//! gateway-sender task can replay them independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_proto::{AgentId, HeartbeatRecord, ProxyInstanceInfo};
use fleet_wab::Wab;
use tracing::warn;

use crate::collector::{self, AccessLogTailer, HostState};
use crate::stream::{KIND_ACCESS_LOG, KIND_HEARTBEAT, KIND_PROXY_METRIC, KIND_SYSTEM_METRIC};

pub struct ProducerConfig {
    pub agent_id: AgentId,
    pub hostname: String,
    pub agent_version: String,
    pub build_commit: String,
    pub build_branch: String,
    pub build_date: String,
    pub containerized: bool,
    pub labels: HashMap<String, String>,
    pub access_log_path: Option<std::path::PathBuf>,
}

pub async fn run(wab: Arc<Wab>, cfg: ProducerConfig) {
    let host_state = HostState::new();
    let mut tailer = cfg.access_log_path.clone().map(AccessLogTailer::new);

    let mut heartbeat_ticker = tokio::time::interval(Duration::from_secs(1));
    let mut metrics_ticker = tokio::time::interval(Duration::from_secs(1));
    let mut log_ticker = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            _ = heartbeat_ticker.tick() => {
                let record = HeartbeatRecord {
                    agent_id: cfg.agent_id.clone(),
                    hostname: cfg.hostname.clone(),
                    uptime_secs: host_state.uptime_secs(),
                    proxy_instances: vec![ProxyInstanceInfo {
                        pid: std::process::id(),
                        config_path: String::new(),
                        version: String::new(),
                        worker_count: 1,
                    }],
                    containerized: cfg.containerized,
                    pod_ip: String::new(),
                    agent_version: cfg.agent_version.clone(),
                    build_commit: cfg.build_commit.clone(),
                    build_branch: cfg.build_branch.clone(),
                    build_date: cfg.build_date.clone(),
                    labels: cfg.labels.clone(),
                };
                append(&wab, KIND_HEARTBEAT, &record);
            }
            _ = metrics_ticker.tick() => {
                let system = collector::sample_system_metrics(&cfg.agent_id, &host_state);
                append(&wab, KIND_SYSTEM_METRIC, &system);
                let proxy = collector::sample_proxy_metrics(&cfg.agent_id, &host_state);
                append(&wab, KIND_PROXY_METRIC, &proxy);
            }
            _ = log_ticker.tick() => {
                if let Some(tailer) = tailer.as_mut() {
                    for record in tailer.poll(&cfg.agent_id) {
                        append(&wab, KIND_ACCESS_LOG, &record);
                    }
                }
            }
        }
    }
}

fn append<T: serde::Serialize>(wab: &Wab, kind: u8, record: &T) {
    match serde_json::to_vec(record) {
        Ok(payload) => {
            if let Err(err) = wab.append(kind, payload, Utc::now()) {
                warn!(kind, "wab append failed: {err}");
            }
        }
        Err(err) => warn!(kind, "failed to serialize record: {err}"),
    }
}
