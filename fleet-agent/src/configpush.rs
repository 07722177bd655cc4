//! Config push handler (spec.md §4.5): validate out-of-process, atomic swap
//! with a versioned backup, reload, and roll back if the proxy doesn't come
//! back healthy. Shells out via `tokio::process::Command`, the same pattern
//! `agent_launcher/src/main.rs` uses to drive a subprocess.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use fleet_proto::AckOutcome;
use tokio::process::Command;

pub struct ConfigPushOptions {
    pub validator_cmd: Option<String>,
    pub reload_cmd: Option<String>,
    pub health_url: Option<String>,
    pub reload_watchdog: Duration,
    pub backup_dir: PathBuf,
}

impl Default for ConfigPushOptions {
    fn default() -> Self {
        Self {
            validator_cmd: None,
            reload_cmd: None,
            health_url: None,
            reload_watchdog: Duration::from_secs(10),
            backup_dir: PathBuf::from("/var/lib/fleet-agent/config-backups"),
        }
    }
}

/// Returns `(outcome, detail)` matching spec.md §4.5 step 5's closed set.
pub async fn apply(config_bytes: &[u8], path: &str, opts: &ConfigPushOptions) -> (AckOutcome, String) {
    let target = Path::new(path);

    if let Some(validator) = &opts.validator_cmd {
        match validate(validator, config_bytes).await {
            Ok(true) => {}
            Ok(false) => return (AckOutcome::Rejected, "syntax check failed".into()),
            Err(err) => return (AckOutcome::Rejected, format!("validator invocation error: {err}")),
        }
    }

    let previous = std::fs::read(target).ok();

    if let Err(err) = atomic_swap(target, config_bytes) {
        return (AckOutcome::Failed, format!("io: {err}"));
    }

    if let Some(previous) = &previous {
        if let Err(err) = backup_previous(&opts.backup_dir, target, previous) {
            tracing::warn!("failed to write config backup: {err}");
        }
    }

    if let Some(reload) = &opts.reload_cmd {
        if let Err(err) = run_reload(reload).await {
            return (AckOutcome::Failed, format!("reload: {err}"));
        }

        if !poll_healthy(opts.health_url.as_deref(), opts.reload_watchdog).await {
            if let Some(previous) = previous {
                let _ = atomic_swap(target, &previous);
                let _ = run_reload(reload).await;
            }
            return (AckOutcome::Failed, "reload: proxy failed health poll, rolled back".into());
        }
    }

    (AckOutcome::Ok, String::new())
}

async fn validate(validator_cmd: &str, config_bytes: &[u8]) -> anyhow::Result<bool> {
    let candidate = std::env::temp_dir().join(format!("fleet-agent-candidate-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&candidate, config_bytes).await?;

    let mut parts = validator_cmd.split_whitespace();
    let program = parts.next().ok_or_else(|| anyhow::anyhow!("empty validator command"))?;
    let status = Command::new(program)
        .args(parts)
        .arg(&candidate)
        .status()
        .await?;

    let _ = tokio::fs::remove_file(&candidate).await;
    Ok(status.success())
}

fn atomic_swap(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = target.with_extension("new");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, target)
}

fn backup_previous(backup_dir: &Path, target: &Path, previous: &[u8]) -> std::io::Result<()> {
    std::fs::create_dir_all(backup_dir)?;
    let file_name = target.file_name().unwrap_or_default().to_string_lossy();
    let stamped = backup_dir.join(format!("{file_name}.{}", Utc::now().timestamp()));
    std::fs::write(stamped, previous)
}

async fn run_reload(reload_cmd: &str) -> anyhow::Result<()> {
    let mut parts = reload_cmd.split_whitespace();
    let program = parts.next().ok_or_else(|| anyhow::anyhow!("empty reload command"))?;
    let status = Command::new(program).args(parts).status().await?;
    if status.success() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("reload command exited with {status}"))
    }
}

async fn poll_healthy(health_url: Option<&str>, watchdog: Duration) -> bool {
    let Some(url) = health_url else {
        return true;
    };
    let deadline = tokio::time::Instant::now() + watchdog;
    while tokio::time::Instant::now() < deadline {
        if let Ok(resp) = reqwest::get(url).await {
            if resp.status().is_success() {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn swap_without_validator_or_reload_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("proxy.conf");
        std::fs::write(&target, b"old").unwrap();

        let opts = ConfigPushOptions {
            backup_dir: dir.path().join("backups"),
            ..Default::default()
        };
        let (outcome, _) = apply(b"new-config", target.to_str().unwrap(), &opts).await;
        assert_eq!(outcome, AckOutcome::Ok);
        assert_eq!(std::fs::read(&target).unwrap(), b"new-config");
    }

    #[tokio::test]
    async fn failing_validator_rejects_without_touching_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("proxy.conf");
        std::fs::write(&target, b"old").unwrap();

        let opts = ConfigPushOptions {
            validator_cmd: Some("false".to_string()),
            backup_dir: dir.path().join("backups"),
            ..Default::default()
        };
        let (outcome, _) = apply(b"new-config", target.to_str().unwrap(), &opts).await;
        assert_eq!(outcome, AckOutcome::Rejected);
        assert_eq!(std::fs::read(&target).unwrap(), b"old");
    }
}
