//! Agent Stream Client (spec.md §4.2). One task per configured gateway:
//! connect, authenticate, replay the WAB backlog from that gateway's cursor,
//! then keep draining newly appended entries. Generalizes `edge_agent`'s
//! `run_grpc_loop` reconnect-with-backoff shape to multiple gateways, a
//! shared WAB, and a command-ack return path.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_auth::sign;
use fleet_proto::proto::{
    agent_envelope, fleet_link_client::FleetLinkClient, gateway_envelope, AccessLogBatch,
    AgentEnvelope, Authenticate, ProxyMetricBatch, SystemMetricBatch,
};
use fleet_proto::{AccessLogRecord, CorrelatedCommand, HeartbeatRecord, ProxyMetricRecord, SystemMetricRecord};
use fleet_wab::Wab;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;
use tracing::{info, warn};

use crate::commands::IncomingCommand;
use crate::cursors::CursorStore;
use crate::outbound::GatewayRegistry;

pub const KIND_HEARTBEAT: u8 = 0;
pub const KIND_ACCESS_LOG: u8 = 1;
pub const KIND_COMMAND_ACK: u8 = crate::commands::WAB_KIND_COMMAND_ACK;
pub const KIND_SYSTEM_METRIC: u8 = 3;
pub const KIND_PROXY_METRIC: u8 = 4;

const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Exponential backoff with +/-20% jitter (spec.md §4.2 "Connection contract").
fn next_backoff(attempt: u32) -> Duration {
    let base = BACKOFF_MIN.saturating_mul(1u32 << attempt.min(6)).min(BACKOFF_MAX);
    let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
    let millis = (base.as_millis() as f64 * (1.0 + jitter_frac)).max(0.0) as u64;
    Duration::from_millis(millis).min(BACKOFF_MAX)
}

pub struct StreamClientDeps {
    pub wab: Arc<Wab>,
    pub cursors: Arc<CursorStore>,
    pub registry: GatewayRegistry,
    pub executor_tx: mpsc::Sender<IncomingCommand>,
    pub agent_id: String,
    pub hostname: String,
    pub psk: String,
    /// The full configured gateway list, used so slowest-cursor retention
    /// never advances past a gateway that is merely disconnected right now.
    pub known_gateways: Vec<String>,
}

/// Drives one gateway's connection for the lifetime of the process: reconnect
/// loop with backoff around a single authenticated session.
pub async fn run_gateway(gateway_addr: String, deps: Arc<StreamClientDeps>) {
    let mut attempt: u32 = 0;
    loop {
        match run_session(&gateway_addr, &deps).await {
            Ok(()) => {
                info!(gateway = %gateway_addr, "stream ended cleanly; reconnecting");
                attempt = 0;
            }
            Err(SessionError::FatalAuth(reason)) => {
                warn!(gateway = %gateway_addr, "fatal auth failure, backing off at max interval: {reason}");
                tokio::time::sleep(BACKOFF_MAX).await;
                continue;
            }
            Err(SessionError::Transient(err)) => {
                warn!(gateway = %gateway_addr, "transient stream error: {err}");
            }
        }
        let backoff = next_backoff(attempt);
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(backoff).await;
    }
}

enum SessionError {
    Transient(anyhow::Error),
    FatalAuth(String),
}

async fn run_session(gateway_addr: &str, deps: &Arc<StreamClientDeps>) -> Result<(), SessionError> {
    let mut client = FleetLinkClient::connect(gateway_addr.to_string())
        .await
        .map_err(|e| SessionError::Transient(e.into()))?;

    let (tx, rx) = mpsc::channel::<AgentEnvelope>(128);
    let outbound = ReceiverStream::new(rx);
    let mut inbound = client
        .stream(outbound)
        .await
        .map_err(|e| SessionError::Transient(e.into()))?
        .into_inner();

    let timestamp = Utc::now();
    let signature = sign(&deps.psk, &deps.agent_id, &deps.hostname, &timestamp);
    tx.send(AgentEnvelope {
        msg: Some(agent_envelope::Msg::Authenticate(Authenticate {
            agent_id: deps.agent_id.clone(),
            hostname: deps.hostname.clone(),
            timestamp: timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            signature,
        })),
    })
    .await
    .map_err(|e| SessionError::Transient(anyhow::anyhow!("failed to enqueue auth: {e}")))?;

    let auth_reply = inbound
        .next()
        .await
        .ok_or_else(|| SessionError::Transient(anyhow::anyhow!("stream closed before auth reply")))?
        .map_err(|e| SessionError::Transient(e.into()))?;
    match auth_reply.msg {
        Some(gateway_envelope::Msg::AuthResult(result)) if result.ok => {
            info!(gateway = %gateway_addr, auto_enrolled = result.auto_enrolled, "authenticated");
        }
        Some(gateway_envelope::Msg::AuthResult(result)) => {
            return Err(SessionError::FatalAuth(result.reason));
        }
        _ => return Err(SessionError::Transient(anyhow::anyhow!("expected AuthResult first"))),
    }

    deps.registry.register(gateway_addr, tx.clone()).await;
    let reader_deps = deps.clone();
    let reader_gateway = gateway_addr.to_string();
    let reader = tokio::spawn(async move {
        run_command_reader(inbound, reader_deps, reader_gateway).await;
    });

    let sender_result = run_sender(gateway_addr, deps, tx).await;
    deps.registry.unregister(gateway_addr).await;
    reader.abort();
    sender_result.map_err(SessionError::Transient)
}

async fn run_command_reader(
    mut inbound: tonic::Streaming<fleet_proto::proto::GatewayEnvelope>,
    deps: Arc<StreamClientDeps>,
    gateway: String,
) {
    while let Some(msg) = inbound.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(err) => {
                info!(gateway = %gateway, "inbound stream ended: {err}");
                break;
            }
        };
        if let Some(gateway_envelope::Msg::Command(cmd)) = msg.msg {
            match CorrelatedCommand::try_from(cmd) {
                Ok(command) => {
                    let incoming = IncomingCommand {
                        source_gateway: gateway.clone(),
                        command,
                    };
                    if deps.executor_tx.send(incoming).await.is_err() {
                        warn!("command executor channel closed");
                        break;
                    }
                }
                Err(err) => warn!("failed to decode command from gateway: {err}"),
            }
        }
    }
}

/// Replays the WAB backlog from this gateway's cursor, then keeps polling for
/// newly appended entries. Channel backpressure (the bounded `tx`) stands in
/// for the spec's explicit in-flight high/low watermark: once `tx` is full,
/// `send` blocks and the reader loop naturally pauses until capacity frees up.
async fn run_sender(gateway_addr: &str, deps: &Arc<StreamClientDeps>, tx: mpsc::Sender<AgentEnvelope>) -> anyhow::Result<()> {
    let mut cursor = deps.cursors.get(gateway_addr);
    loop {
        let entries = deps.wab.range_from(cursor)?;
        if entries.is_empty() {
            tokio::time::sleep(Duration::from_millis(200)).await;
            if tx.is_closed() {
                return Ok(());
            }
            continue;
        }

        for entry in entries {
            let envelope = match decode_envelope(&deps.agent_id, entry.kind, &entry.payload) {
                Some(env) => env,
                None => {
                    warn!(kind = entry.kind, "unrecognised wab entry kind, skipping");
                    cursor = entry.seq;
                    continue;
                }
            };
            if tx.send(envelope).await.is_err() {
                return Err(anyhow::anyhow!("outbound channel closed"));
            }
            cursor = entry.seq;
            deps.cursors.set(gateway_addr, cursor)?;
        }

        recompute_retirement(deps);
    }
}

fn recompute_retirement(deps: &Arc<StreamClientDeps>) {
    // Slowest-cursor retention (spec.md §4.2, §9 Open Question): the shared
    // WAB only retires an entry once every configured gateway has advanced
    // past it, so a lagging gateway (not just a disconnected one) holds the
    // floor back.
    if deps.known_gateways.is_empty() {
        return;
    }
    let floor = deps.cursors.slowest(&deps.known_gateways);
    if let Err(err) = deps.wab.acknowledge_through(floor) {
        warn!("failed to advance wab floor: {err}");
    }
}

fn decode_envelope(agent_id: &str, kind: u8, payload: &[u8]) -> Option<AgentEnvelope> {
    let msg = match kind {
        KIND_HEARTBEAT => {
            let record: HeartbeatRecord = serde_json::from_slice(payload).ok()?;
            agent_envelope::Msg::Heartbeat((&record).into())
        }
        KIND_ACCESS_LOG => {
            let record: AccessLogRecord = serde_json::from_slice(payload).ok()?;
            agent_envelope::Msg::AccessLogBatch(AccessLogBatch {
                agent_id: agent_id.to_string(),
                records: vec![(&record).into()],
            })
        }
        KIND_SYSTEM_METRIC => {
            let record: SystemMetricRecord = serde_json::from_slice(payload).ok()?;
            agent_envelope::Msg::SystemMetricBatch(SystemMetricBatch {
                agent_id: agent_id.to_string(),
                records: vec![(&record).into()],
            })
        }
        KIND_PROXY_METRIC => {
            let record: ProxyMetricRecord = serde_json::from_slice(payload).ok()?;
            agent_envelope::Msg::ProxyMetricBatch(ProxyMetricBatch {
                agent_id: agent_id.to_string(),
                records: vec![(&record).into()],
            })
        }
        KIND_COMMAND_ACK => {
            let ack: fleet_proto::CommandAck = serde_json::from_slice(payload).ok()?;
            agent_envelope::Msg::CommandAck((&ack).into())
        }
        _ => return None,
    };
    Some(AgentEnvelope { msg: Some(msg) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_the_configured_ceiling() {
        for attempt in 0..20 {
            assert!(next_backoff(attempt) <= BACKOFF_MAX + Duration::from_millis(1));
        }
    }

    #[test]
    fn backoff_grows_with_attempt_number_before_capping() {
        let early = next_backoff(0);
        let later = next_backoff(3);
        assert!(later >= early);
    }
}
