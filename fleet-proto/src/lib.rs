//! Shared wire schema and domain types for the agent <-> gateway stream.
//!
//! Kept free of HTTP/SQL dependencies so both `fleet-agent` and `fleet-gateway`
//! can depend on it without pulling in server-only crates (axum, sqlx, …).

pub mod proto {
    tonic::include_proto!("fleet");
}

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

pub use proto::fleet_link_client::FleetLinkClient;
pub use proto::fleet_link_server::{FleetLink, FleetLinkServer};

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, ProtoError> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Domain types (spec.md §3). Proto messages are the wire encoding; these are
// what the rest of both binaries operate on.
// ---------------------------------------------------------------------------

pub type AgentId = String;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyInstanceInfo {
    pub pid: u32,
    pub config_path: String,
    pub version: String,
    pub worker_count: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub agent_id: AgentId,
    pub hostname: String,
    pub uptime_secs: u64,
    pub proxy_instances: Vec<ProxyInstanceInfo>,
    pub containerized: bool,
    pub pod_ip: String,
    pub agent_version: String,
    pub build_commit: String,
    pub build_branch: String,
    pub build_date: String,
    pub labels: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessLogRecord {
    pub agent_id: AgentId,
    pub timestamp: DateTime<Utc>,
    /// 0 means "unfinished".
    pub status_code: i32,
    pub method: String,
    pub uri: String,
    pub client_ip: String,
    pub bytes_sent: u64,
    pub upstream_response_time_ms: f64,
    pub request_time_ms: f64,
    pub referer: String,
    pub user_agent: String,
    pub request_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemMetricRecord {
    pub agent_id: AgentId,
    pub timestamp: DateTime<Utc>,
    pub cpu_used_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub net_rx_bytes_per_sec: f64,
    pub net_tx_bytes_per_sec: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyMetricRecord {
    pub agent_id: AgentId,
    pub timestamp: DateTime<Utc>,
    pub active_connections: u64,
    pub accepted: u64,
    pub handled: u64,
    pub reading: u64,
    pub writing: u64,
    pub waiting: u64,
    pub total_requests: u64,
}

/// Closed set of administrative commands (spec.md §3 "Command").
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Command {
    ReloadProxy,
    RestartProxy,
    StopProxy,
    UpdateAgent { target_version: Option<String> },
    PushConfig { config_bytes: Vec<u8>, path: String },
    ApplyAugment { snippet: String, context_scope: String },
    ExecuteAdHoc {
        cmd: String,
        args: Vec<String>,
        pty_cols: u32,
        pty_rows: u32,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CorrelatedCommand {
    pub correlation_id: Uuid,
    pub command: Command,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum AckOutcome {
    Ok,
    Failed,
    Rejected,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandAck {
    pub correlation_id: Uuid,
    pub kind: String,
    pub outcome: AckOutcome,
    pub detail: String,
}

// ---------------------------------------------------------------------------
// Domain <-> proto conversions. Centralized here (the teacher duplicates this
// conversion code independently in der_headend/src/grpc.rs and
// edge_agent/src/main.rs — see DESIGN.md for the rationale to share it).
// ---------------------------------------------------------------------------

impl From<&HeartbeatRecord> for proto::Heartbeat {
    fn from(hb: &HeartbeatRecord) -> Self {
        proto::Heartbeat {
            agent_id: hb.agent_id.clone(),
            hostname: hb.hostname.clone(),
            uptime_secs: hb.uptime_secs,
            proxy_instances: hb
                .proxy_instances
                .iter()
                .map(|p| proto::ProxyInstance {
                    pid: p.pid,
                    config_path: p.config_path.clone(),
                    version: p.version.clone(),
                    worker_count: p.worker_count,
                })
                .collect(),
            containerized: hb.containerized,
            pod_ip: hb.pod_ip.clone(),
            agent_version: hb.agent_version.clone(),
            build_commit: hb.build_commit.clone(),
            build_branch: hb.build_branch.clone(),
            build_date: hb.build_date.clone(),
            labels: hb.labels.clone(),
        }
    }
}

impl TryFrom<proto::Heartbeat> for HeartbeatRecord {
    type Error = ProtoError;
    fn try_from(hb: proto::Heartbeat) -> Result<Self, Self::Error> {
        Ok(HeartbeatRecord {
            agent_id: hb.agent_id,
            hostname: hb.hostname,
            uptime_secs: hb.uptime_secs,
            proxy_instances: hb
                .proxy_instances
                .into_iter()
                .map(|p| ProxyInstanceInfo {
                    pid: p.pid,
                    config_path: p.config_path,
                    version: p.version,
                    worker_count: p.worker_count,
                })
                .collect(),
            containerized: hb.containerized,
            pod_ip: hb.pod_ip,
            agent_version: hb.agent_version,
            build_commit: hb.build_commit,
            build_branch: hb.build_branch,
            build_date: hb.build_date,
            labels: hb.labels,
        })
    }
}

impl From<&AccessLogRecord> for proto::AccessLogRecord {
    fn from(r: &AccessLogRecord) -> Self {
        proto::AccessLogRecord {
            timestamp: r.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            status_code: r.status_code,
            method: r.method.clone(),
            uri: r.uri.clone(),
            client_ip: r.client_ip.clone(),
            bytes_sent: r.bytes_sent,
            upstream_response_time_ms: r.upstream_response_time_ms,
            request_time_ms: r.request_time_ms,
            referer: r.referer.clone(),
            user_agent: r.user_agent.clone(),
            request_id: r.request_id.clone(),
        }
    }
}

impl AccessLogRecord {
    pub fn try_from_proto(agent_id: &str, r: proto::AccessLogRecord) -> Result<Self, ProtoError> {
        Ok(AccessLogRecord {
            agent_id: agent_id.to_string(),
            timestamp: parse_rfc3339(&r.timestamp)?,
            status_code: r.status_code,
            method: r.method,
            uri: r.uri,
            client_ip: r.client_ip,
            bytes_sent: r.bytes_sent,
            upstream_response_time_ms: r.upstream_response_time_ms,
            request_time_ms: r.request_time_ms,
            referer: r.referer,
            user_agent: r.user_agent,
            request_id: r.request_id,
        })
    }
}

impl From<&SystemMetricRecord> for proto::SystemMetricRecord {
    fn from(r: &SystemMetricRecord) -> Self {
        proto::SystemMetricRecord {
            timestamp: r.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            cpu_used_percent: r.cpu_used_percent,
            memory_used_bytes: r.memory_used_bytes,
            memory_total_bytes: r.memory_total_bytes,
            net_rx_bytes_per_sec: r.net_rx_bytes_per_sec,
            net_tx_bytes_per_sec: r.net_tx_bytes_per_sec,
        }
    }
}

impl SystemMetricRecord {
    pub fn try_from_proto(
        agent_id: &str,
        r: proto::SystemMetricRecord,
    ) -> Result<Self, ProtoError> {
        Ok(SystemMetricRecord {
            agent_id: agent_id.to_string(),
            timestamp: parse_rfc3339(&r.timestamp)?,
            cpu_used_percent: r.cpu_used_percent,
            memory_used_bytes: r.memory_used_bytes,
            memory_total_bytes: r.memory_total_bytes,
            net_rx_bytes_per_sec: r.net_rx_bytes_per_sec,
            net_tx_bytes_per_sec: r.net_tx_bytes_per_sec,
        })
    }
}

impl From<&ProxyMetricRecord> for proto::ProxyMetricRecord {
    fn from(r: &ProxyMetricRecord) -> Self {
        proto::ProxyMetricRecord {
            timestamp: r.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            active_connections: r.active_connections,
            accepted: r.accepted,
            handled: r.handled,
            reading: r.reading,
            writing: r.writing,
            waiting: r.waiting,
            total_requests: r.total_requests,
        }
    }
}

impl ProxyMetricRecord {
    pub fn try_from_proto(agent_id: &str, r: proto::ProxyMetricRecord) -> Result<Self, ProtoError> {
        Ok(ProxyMetricRecord {
            agent_id: agent_id.to_string(),
            timestamp: parse_rfc3339(&r.timestamp)?,
            active_connections: r.active_connections,
            accepted: r.accepted,
            handled: r.handled,
            reading: r.reading,
            writing: r.writing,
            waiting: r.waiting,
            total_requests: r.total_requests,
        })
    }
}

impl From<&CorrelatedCommand> for proto::Command {
    fn from(c: &CorrelatedCommand) -> Self {
        use proto::command::Kind;
        let kind = match &c.command {
            Command::ReloadProxy => Kind::ReloadProxy(true),
            Command::RestartProxy => Kind::RestartProxy(true),
            Command::StopProxy => Kind::StopProxy(true),
            Command::UpdateAgent { target_version } => Kind::UpdateAgent(proto::UpdateAgent {
                target_version: target_version.clone(),
            }),
            Command::PushConfig { config_bytes, path } => Kind::PushConfig(proto::PushConfig {
                config_bytes: config_bytes.clone(),
                path: path.clone(),
            }),
            Command::ApplyAugment {
                snippet,
                context_scope,
            } => Kind::ApplyAugment(proto::ApplyAugment {
                snippet: snippet.clone(),
                context_scope: context_scope.clone(),
            }),
            Command::ExecuteAdHoc {
                cmd,
                args,
                pty_cols,
                pty_rows,
            } => Kind::ExecuteAdHoc(proto::ExecuteAdHoc {
                cmd: cmd.clone(),
                args: args.clone(),
                pty_cols: *pty_cols,
                pty_rows: *pty_rows,
            }),
        };
        proto::Command {
            correlation_id: c.correlation_id.to_string(),
            kind: Some(kind),
        }
    }
}

impl TryFrom<proto::Command> for CorrelatedCommand {
    type Error = ProtoError;
    fn try_from(c: proto::Command) -> Result<Self, Self::Error> {
        use proto::command::Kind;
        let correlation_id = Uuid::parse_str(&c.correlation_id)
            .map_err(|_| ProtoError::MissingField("correlation_id"))?;
        let kind = c.kind.ok_or(ProtoError::MissingField("kind"))?;
        let command = match kind {
            Kind::ReloadProxy(_) => Command::ReloadProxy,
            Kind::RestartProxy(_) => Command::RestartProxy,
            Kind::StopProxy(_) => Command::StopProxy,
            Kind::UpdateAgent(u) => Command::UpdateAgent {
                target_version: u.target_version,
            },
            Kind::PushConfig(p) => Command::PushConfig {
                config_bytes: p.config_bytes,
                path: p.path,
            },
            Kind::ApplyAugment(a) => Command::ApplyAugment {
                snippet: a.snippet,
                context_scope: a.context_scope,
            },
            Kind::ExecuteAdHoc(e) => Command::ExecuteAdHoc {
                cmd: e.cmd,
                args: e.args,
                pty_cols: e.pty_cols,
                pty_rows: e.pty_rows,
            },
        };
        Ok(CorrelatedCommand {
            correlation_id,
            command,
        })
    }
}

impl AckOutcome {
    fn to_proto(self) -> i32 {
        match self {
            AckOutcome::Ok => proto::AckOutcome::AckOutcomeOk as i32,
            AckOutcome::Failed => proto::AckOutcome::AckOutcomeFailed as i32,
            AckOutcome::Rejected => proto::AckOutcome::AckOutcomeRejected as i32,
        }
    }

    fn from_proto(v: i32) -> AckOutcome {
        match proto::AckOutcome::try_from(v).unwrap_or(proto::AckOutcome::AckOutcomeUnspecified) {
            proto::AckOutcome::AckOutcomeOk => AckOutcome::Ok,
            proto::AckOutcome::AckOutcomeRejected => AckOutcome::Rejected,
            _ => AckOutcome::Failed,
        }
    }
}

impl From<&CommandAck> for proto::CommandAck {
    fn from(a: &CommandAck) -> Self {
        proto::CommandAck {
            correlation_id: a.correlation_id.to_string(),
            kind: a.kind.clone(),
            outcome: a.outcome.to_proto(),
            detail: a.detail.clone(),
        }
    }
}

impl TryFrom<proto::CommandAck> for CommandAck {
    type Error = ProtoError;
    fn try_from(a: proto::CommandAck) -> Result<Self, Self::Error> {
        Ok(CommandAck {
            correlation_id: Uuid::parse_str(&a.correlation_id)
                .map_err(|_| ProtoError::MissingField("correlation_id"))?,
            kind: a.kind,
            outcome: AckOutcome::from_proto(a.outcome),
            detail: a.detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_roundtrips_through_proto() {
        let c = CorrelatedCommand {
            correlation_id: Uuid::new_v4(),
            command: Command::PushConfig {
                config_bytes: vec![1, 2, 3],
                path: "/etc/nginx/nginx.conf".into(),
            },
        };
        let wire = proto::Command::from(&c);
        let back = CorrelatedCommand::try_from(wire).unwrap();
        assert_eq!(c, back);
    }

    #[test]
    fn ack_outcome_roundtrips() {
        let ack = CommandAck {
            correlation_id: Uuid::new_v4(),
            kind: "reload_proxy".into(),
            outcome: AckOutcome::Rejected,
            detail: "validation failed".into(),
        };
        let wire = proto::CommandAck::from(&ack);
        let back = CommandAck::try_from(wire).unwrap();
        assert_eq!(back.outcome, AckOutcome::Rejected);
        assert_eq!(back.detail, "validation failed");
    }

    #[test]
    fn access_log_record_rejects_bad_timestamp() {
        let proto_rec = proto::AccessLogRecord {
            timestamp: "not-a-timestamp".into(),
            ..Default::default()
        };
        assert!(AccessLogRecord::try_from_proto("a1", proto_rec).is_err());
    }
}
