//! Gateway Session Manager (spec.md §4.3). Directly generalizes
//! `der_headend/src/grpc.rs`'s `GrpcApi::stream`: a per-connection task demuxes
//! inbound envelope variants into handler functions, keyed by an in-memory,
//! read-mostly session table.

use std::pin::Pin;

use chrono::Utc;
use fleet_auth::AuthClaim;
use fleet_proto::proto::{
    agent_envelope, fleet_link_server::FleetLink, gateway_envelope, AgentEnvelope, AuthResult,
    GatewayEnvelope,
};
use fleet_proto::{AccessLogRecord, CorrelatedCommand, ProxyMetricRecord, SystemMetricRecord};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt as _};
use tonic::{Request, Response as GrpcResponse, Status};
use tracing::{info, warn};

use crate::assign;
use crate::session::{Session, SessionTable};
use crate::AppState;

#[derive(Clone)]
pub struct GrpcApi {
    pub state: AppState,
}

#[tonic::async_trait]
impl FleetLink for GrpcApi {
    type StreamStream = Pin<Box<dyn futures_util::Stream<Item = Result<GatewayEnvelope, Status>> + Send>>;

    async fn stream(
        &self,
        request: Request<tonic::Streaming<AgentEnvelope>>,
    ) -> Result<GrpcResponse<Self::StreamStream>, Status> {
        let peer = request
            .remote_addr()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "<unknown>".into());
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel::<GatewayEnvelope>(64);
        let state = self.state.clone();

        tokio::spawn(async move {
            let mut agent_id: Option<String> = None;

            while let Some(msg) = inbound.next().await {
                let msg = match msg {
                    Ok(m) => m,
                    Err(err) => {
                        info!(agent_id = ?agent_id, peer = %peer, "stream closed/errored: {err}");
                        break;
                    }
                };

                if msg.msg.is_some() {
                    state
                        .metrics
                        .messages_total
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }

                match msg.msg {
                    Some(agent_envelope::Msg::Authenticate(auth)) => {
                        match handle_authenticate(&state, &peer, &tx, auth).await {
                            Ok(id) => agent_id = Some(id),
                            Err(reason) => {
                                let _ = tx
                                    .send(GatewayEnvelope {
                                        msg: Some(gateway_envelope::Msg::AuthResult(AuthResult {
                                            ok: false,
                                            reason: reason.clone(),
                                            auto_enrolled: false,
                                        })),
                                    })
                                    .await;
                                warn!(peer = %peer, "authentication failed: {reason}");
                                break;
                            }
                        }
                    }
                    Some(agent_envelope::Msg::Heartbeat(hb)) => {
                        if let Some(id) = &agent_id {
                            handle_heartbeat(&state, id, hb).await;
                        }
                    }
                    Some(agent_envelope::Msg::AccessLogBatch(batch)) => {
                        if let Some(id) = &agent_id {
                            let records: Vec<AccessLogRecord> = batch
                                .records
                                .into_iter()
                                .filter_map(|r| AccessLogRecord::try_from_proto(id, r).ok())
                                .collect();
                            state.ingest.submit_access_logs(records).await;
                        }
                    }
                    Some(agent_envelope::Msg::SystemMetricBatch(batch)) => {
                        if let Some(id) = &agent_id {
                            let records: Vec<SystemMetricRecord> = batch
                                .records
                                .into_iter()
                                .filter_map(|r| SystemMetricRecord::try_from_proto(id, r).ok())
                                .collect();
                            state.ingest.submit_system_metrics(records).await;
                        }
                    }
                    Some(agent_envelope::Msg::ProxyMetricBatch(batch)) => {
                        if let Some(id) = &agent_id {
                            let records: Vec<ProxyMetricRecord> = batch
                                .records
                                .into_iter()
                                .filter_map(|r| ProxyMetricRecord::try_from_proto(id, r).ok())
                                .collect();
                            state.ingest.submit_proxy_metrics(records).await;
                        }
                    }
                    Some(agent_envelope::Msg::CommandAck(ack)) => {
                        if let (Some(id), Ok(ack)) = (&agent_id, fleet_proto::CommandAck::try_from(ack)) {
                            record_command_ack(&state, id, ack).await;
                        }
                    }
                    None => {}
                }
            }

            if let Some(id) = agent_id {
                state.sessions.remove(&id).await;
                info!(agent_id = %id, peer = %peer, "agent disconnected");
            }
        });

        let outbound = ReceiverStream::new(rx).map(Ok);
        Ok(GrpcResponse::new(Box::pin(outbound)))
    }
}

/// Returns the authenticated agent id, or an error reason suitable for
/// `AuthResult.reason`.
async fn handle_authenticate(
    state: &AppState,
    peer: &str,
    tx: &mpsc::Sender<GatewayEnvelope>,
    auth: fleet_proto::proto::Authenticate,
) -> Result<String, String> {
    let timestamp = fleet_proto::parse_rfc3339(&auth.timestamp).map_err(|_| "bad timestamp".to_string())?;
    let claim = AuthClaim {
        agent_id: auth.agent_id.clone(),
        hostname: auth.hostname.clone(),
        timestamp,
        signature: auth.signature.clone(),
    };

    let outcome = state
        .authenticator
        .verify(Utc::now(), &claim)
        .map_err(|e| e.to_string())?;

    // Enrolment policy is enforced here regardless of which branch the PSK
    // check took (spec.md §4.7: "authenticator only reports PSK validity;
    // enrolment policy is enforced by the session manager"). A PSK that
    // verifies does not by itself admit an agent id the deployment has never
    // seen when auto_enroll is disabled.
    let psk_authenticated = matches!(outcome, fleet_auth::AuthOutcome::Authenticated);
    let already_enrolled = state.is_enrolled(&auth.agent_id).await;
    if !state.auto_enroll && !already_enrolled {
        return Err("NotEnrolled".into());
    }
    let auto_enrolled = !already_enrolled;

    let session = Session {
        agent_id: auth.agent_id.clone(),
        hostname: auth.hostname.clone(),
        agent_version: String::new(),
        build_commit: String::new(),
        build_branch: String::new(),
        build_date: String::new(),
        containerized: false,
        psk_authenticated,
        last_heartbeat: Utc::now(),
        environment_id: None,
        labels: Default::default(),
        established_at: Utc::now(),
        peer: peer.to_string(),
        tx: tx.clone(),
    };
    state.sessions.install(session).await;

    let _ = tx
        .send(GatewayEnvelope {
            msg: Some(gateway_envelope::Msg::AuthResult(AuthResult {
                ok: true,
                reason: String::new(),
                auto_enrolled,
            })),
        })
        .await;

    info!(agent_id = %auth.agent_id, peer = %peer, psk_authenticated, "agent authenticated");
    Ok(auth.agent_id)
}

async fn handle_heartbeat(state: &AppState, agent_id: &str, hb: fleet_proto::proto::Heartbeat) {
    let Ok(record) = fleet_proto::HeartbeatRecord::try_from(hb) else {
        return;
    };
    state
        .sessions
        .touch_heartbeat(agent_id, Utc::now(), record.labels.clone())
        .await;

    if let Some(pool) = state.pool.as_ref() {
        if let Some(env_id) = assign::resolve(pool, agent_id, &record.labels).await {
            state.sessions.set_environment(agent_id, env_id).await;
        }
    }
}

async fn record_command_ack(state: &AppState, agent_id: &str, ack: fleet_proto::CommandAck) {
    if let Some(pool) = state.pool.as_ref() {
        let outcome_str = match ack.outcome {
            fleet_proto::AckOutcome::Ok => "ok",
            fleet_proto::AckOutcome::Failed => "failed",
            fleet_proto::AckOutcome::Rejected => "rejected",
        };
        let result = sqlx::query(
            r#"
            INSERT INTO command_acks (correlation_id, agent_id, kind, outcome, detail, acked_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (correlation_id) DO UPDATE SET
                outcome = EXCLUDED.outcome, detail = EXCLUDED.detail, acked_at = EXCLUDED.acked_at
            "#,
        )
        .bind(ack.correlation_id)
        .bind(agent_id)
        .bind(&ack.kind)
        .bind(outcome_str)
        .bind(&ack.detail)
        .bind(Utc::now())
        .execute(pool)
        .await;
        if let Err(err) = result {
            warn!("failed to record command ack: {err}");
        }
    }
}

/// Enqueues a command on the target agent's outbound queue (spec.md §4.5).
/// Fails with `AgentOffline` if no session exists. The outbound queue never
/// drops commands; a full channel blocks the admin caller (spec.md §4.3
/// "Backpressure").
pub async fn enqueue_command(
    sessions: &SessionTable,
    agent_id: &str,
    command: CorrelatedCommand,
) -> Result<(), crate::error::GatewayError> {
    let tx = sessions
        .get_sender(agent_id)
        .await
        .ok_or_else(|| crate::error::GatewayError::AgentOffline(agent_id.to_string()))?;
    let envelope = GatewayEnvelope {
        msg: Some(gateway_envelope::Msg::Command((&command).into())),
    };
    tx.send(envelope)
        .await
        .map_err(|_| crate::error::GatewayError::AgentOffline(agent_id.to_string()))
}
