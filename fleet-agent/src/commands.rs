//! Command executor (spec.md §4.5): a single-consumer loop so administrative
//! actions never run concurrently on the same host. Every outcome is written
//! to the WAB before being sent back, so an ack survives a crash between
//! execution and transmission.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use fleet_proto::proto::{agent_envelope, AgentEnvelope};
use fleet_proto::{AckOutcome, Command, CommandAck, CorrelatedCommand};
use fleet_wab::Wab;
use tokio::process::Command as ProcessCommand;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::configpush::{self, ConfigPushOptions};
use crate::outbound::GatewayRegistry;
use crate::update::{self, UpdateOptions, UpdateResult};

/// A command plus the gateway it arrived on, so the ack can be routed back to
/// that same stream (spec.md §4.5: acks return "on the same stream").
pub struct IncomingCommand {
    pub source_gateway: String,
    pub command: CorrelatedCommand,
}

pub const WAB_KIND_COMMAND_ACK: u8 = 2;

pub struct ExecutorOptions {
    pub config_push: ConfigPushOptions,
    pub reload_cmd: Option<String>,
    pub restart_cmd: Option<String>,
    pub stop_cmd: Option<String>,
    pub update_manifest_url: Option<String>,
    pub current_exe: PathBuf,
    pub current_version: String,
    pub os_arch: String,
    pub rollout_percent: u8,
    pub agent_id: String,
    /// Bare-host restart mechanism (spec.md §4.5 step 6, "bare-host mode"):
    /// a supervisor CLI invocation, e.g. `systemctl restart fleet-agent`.
    pub supervisor_restart_cmd: Option<String>,
}

pub async fn run_executor(
    mut rx: mpsc::Receiver<IncomingCommand>,
    registry: GatewayRegistry,
    wab: Arc<Wab>,
    opts: ExecutorOptions,
) {
    while let Some(incoming) = rx.recv().await {
        let correlation_id = incoming.command.correlation_id;
        let kind = command_kind(&incoming.command.command);
        info!(%correlation_id, kind, "executing command");

        let (outcome, detail, swapped) = execute_one(incoming.command.command, &opts).await;
        let ack = CommandAck {
            correlation_id,
            kind: kind.to_string(),
            outcome,
            detail,
        };

        if let Ok(payload) = serde_json::to_vec(&ack) {
            if let Err(err) = wab.append(WAB_KIND_COMMAND_ACK, payload, Utc::now()) {
                warn!(%correlation_id, "failed to persist command ack to wab: {err}");
            }
        }

        if let Some(tx) = registry.get(&incoming.source_gateway).await {
            let envelope = AgentEnvelope {
                msg: Some(agent_envelope::Msg::CommandAck((&ack).into())),
            };
            if tx.send(envelope).await.is_err() {
                warn!(%correlation_id, "originating gateway stream closed before ack could be sent");
            }
        }

        if swapped {
            // Give the ack a moment to actually reach the network before we
            // tear the process down (spec.md §4.5 step 7: flush before exit).
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            restart_after_update(&opts).await;
        }
    }
}

/// Spec.md §4.5 step 6: bare-host deployments ask a supervisor to restart;
/// containerized deployments exit non-zero so the orchestrator recreates the
/// process against the now-swapped binary.
async fn restart_after_update(opts: &ExecutorOptions) {
    if update::is_containerized() {
        info!("self-update applied under a container runtime; exiting {} for orchestrator restart", update::RESTART_EXIT_CODE);
        std::process::exit(update::RESTART_EXIT_CODE);
    }

    let Some(cmd) = &opts.supervisor_restart_cmd else {
        warn!("self-update applied but no supervisor_restart_cmd is configured; process will not restart itself");
        return;
    };
    let mut parts = cmd.split_whitespace();
    if let Some(program) = parts.next() {
        if let Err(err) = ProcessCommand::new(program).args(parts).status().await {
            warn!("failed to invoke supervisor restart: {err}");
        }
    }
}

fn command_kind(command: &Command) -> &'static str {
    match command {
        Command::ReloadProxy => "reload_proxy",
        Command::RestartProxy => "restart_proxy",
        Command::StopProxy => "stop_proxy",
        Command::UpdateAgent { .. } => "update_agent",
        Command::PushConfig { .. } => "push_config",
        Command::ApplyAugment { .. } => "apply_augment",
        Command::ExecuteAdHoc { .. } => "execute_ad_hoc",
    }
}

/// Returns `(outcome, detail, binary_was_swapped)`. The third element is only
/// ever `true` for a successful, non-noop `UpdateAgent`.
async fn execute_one(command: Command, opts: &ExecutorOptions) -> (AckOutcome, String, bool) {
    match command {
        Command::ReloadProxy => with_no_swap(run_signal_command(opts.reload_cmd.as_deref(), "reload").await),
        Command::RestartProxy => with_no_swap(run_signal_command(opts.restart_cmd.as_deref(), "restart").await),
        Command::StopProxy => with_no_swap(run_signal_command(opts.stop_cmd.as_deref(), "stop").await),
        Command::PushConfig { config_bytes, path } => {
            with_no_swap(configpush::apply(&config_bytes, &path, &opts.config_push).await)
        }
        Command::UpdateAgent { target_version } => {
            let Some(manifest_url) = opts.update_manifest_url.clone() else {
                return (AckOutcome::Rejected, "no update origin configured".into(), false);
            };
            let update_opts = UpdateOptions {
                manifest_url,
                os_arch: opts.os_arch.clone(),
                current_version: opts.current_version.clone(),
                current_exe: opts.current_exe.clone(),
                rollout_percent: opts.rollout_percent,
                agent_id: opts.agent_id.clone(),
            };
            let result = update::run(target_version, &update_opts).await;
            let swapped = matches!(result, UpdateResult::Applied { .. });
            let (outcome, detail) = result.into_ack();
            (outcome, detail, swapped)
        }
        Command::ApplyAugment { .. } => {
            with_no_swap((AckOutcome::Rejected, "augments are not supported on this host".into()))
        }
        Command::ExecuteAdHoc { cmd, args, .. } => with_no_swap(run_ad_hoc(&cmd, &args).await),
    }
}

fn with_no_swap(result: (AckOutcome, String)) -> (AckOutcome, String, bool) {
    (result.0, result.1, false)
}

async fn run_signal_command(cmd: Option<&str>, verb: &str) -> (AckOutcome, String) {
    let Some(cmd) = cmd else {
        return (AckOutcome::Rejected, format!("no {verb} command configured"));
    };
    let mut parts = cmd.split_whitespace();
    let Some(program) = parts.next() else {
        return (AckOutcome::Rejected, format!("empty {verb} command"));
    };
    match ProcessCommand::new(program).args(parts).status().await {
        Ok(status) if status.success() => (AckOutcome::Ok, String::new()),
        Ok(status) => (AckOutcome::Failed, format!("{verb} exited with {status}")),
        Err(err) => (AckOutcome::Failed, format!("{verb} failed to start: {err}")),
    }
}

async fn run_ad_hoc(cmd: &str, args: &[String]) -> (AckOutcome, String) {
    match ProcessCommand::new(cmd).args(args).output().await {
        Ok(output) if output.status.success() => {
            (AckOutcome::Ok, String::from_utf8_lossy(&output.stdout).trim().to_string())
        }
        Ok(output) => (
            AckOutcome::Failed,
            format!("exit {}: {}", output.status, String::from_utf8_lossy(&output.stderr)),
        ),
        Err(err) => (AckOutcome::Failed, format!("failed to start: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn default_opts() -> ExecutorOptions {
        ExecutorOptions {
            config_push: ConfigPushOptions::default(),
            reload_cmd: None,
            restart_cmd: None,
            stop_cmd: None,
            update_manifest_url: None,
            current_exe: PathBuf::from("/tmp/fleet-agent"),
            current_version: "0.1.0".into(),
            os_arch: "linux-amd64".into(),
            rollout_percent: 100,
            agent_id: "agent-1".into(),
            supervisor_restart_cmd: None,
        }
    }

    #[tokio::test]
    async fn missing_reload_command_is_rejected_not_failed_silently() {
        let (outcome, detail, swapped) = execute_one(Command::ReloadProxy, &default_opts()).await;
        assert_eq!(outcome, AckOutcome::Rejected);
        assert!(detail.contains("reload"));
        assert!(!swapped);
    }

    #[tokio::test]
    async fn update_without_origin_is_rejected() {
        let command = Command::UpdateAgent { target_version: None };
        let (outcome, _, swapped) = execute_one(command, &default_opts()).await;
        assert_eq!(outcome, AckOutcome::Rejected);
        assert!(!swapped);
    }

    #[tokio::test]
    async fn ad_hoc_echo_succeeds() {
        let command = Command::ExecuteAdHoc {
            cmd: "echo".into(),
            args: vec!["hello".into()],
            pty_cols: 80,
            pty_rows: 24,
        };
        let (outcome, detail, swapped) = execute_one(command, &default_opts()).await;
        assert_eq!(outcome, AckOutcome::Ok);
        assert_eq!(detail, "hello");
        assert!(!swapped);
    }

    #[test]
    fn correlation_ids_are_preserved_through_acks() {
        let id = Uuid::new_v4();
        let ack = CommandAck {
            correlation_id: id,
            kind: "reload_proxy".into(),
            outcome: AckOutcome::Ok,
            detail: String::new(),
        };
        assert_eq!(ack.correlation_id, id);
    }
}
