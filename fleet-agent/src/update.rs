//! Self-update (spec.md §4.5 "Remote update"): fetch manifest, verify
//! checksum, atomic binary swap, then restart per deployment mode.

use std::path::{Path, PathBuf};

use fleet_proto::AckOutcome;
use serde::Deserialize;
use sha2::{Digest, Sha256};

#[derive(Debug, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub binaries: std::collections::HashMap<String, BinaryEntry>,
}

#[derive(Debug, Deserialize)]
pub struct BinaryEntry {
    pub url: String,
    pub sha256: String,
}

/// Exit code 100 signals the orchestrator to recreate the process after a
/// successful self-update in container mode (spec.md §6 "Exit codes").
pub const RESTART_EXIT_CODE: i32 = 100;

pub struct UpdateOptions {
    pub manifest_url: String,
    pub os_arch: String,
    pub current_version: String,
    pub current_exe: PathBuf,
    pub rollout_percent: u8,
    pub agent_id: String,
}

pub enum UpdateResult {
    Noop,
    Applied { new_version: String },
    Rejected { reason: String },
    Failed { reason: String },
    SkippedRollout,
}

impl UpdateResult {
    pub fn into_ack(self) -> (AckOutcome, String) {
        match self {
            UpdateResult::Noop => (AckOutcome::Ok, "noop".into()),
            UpdateResult::Applied { new_version } => (AckOutcome::Ok, format!("updated to {new_version}")),
            UpdateResult::Rejected { reason } => (AckOutcome::Rejected, reason),
            UpdateResult::Failed { reason } => (AckOutcome::Failed, reason),
            UpdateResult::SkippedRollout => (AckOutcome::Ok, "skipped: outside rollout bucket".into()),
        }
    }
}

/// A given agent id participates in a staged rollout only if its hashed
/// bucket (0..99) is below `rollout_percent` (spec.md §4.5 "Staged rollouts").
pub fn rollout_bucket(agent_id: &str) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(agent_id.as_bytes());
    let digest = hasher.finalize();
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (n % 100) as u8
}

pub async fn run(target_version: Option<String>, opts: &UpdateOptions) -> UpdateResult {
    if rollout_bucket(&opts.agent_id) >= opts.rollout_percent {
        return UpdateResult::SkippedRollout;
    }

    let manifest: Manifest = match reqwest::get(&opts.manifest_url).await {
        Ok(resp) => match resp.json().await {
            Ok(m) => m,
            Err(err) => return UpdateResult::Failed { reason: format!("manifest parse: {err}") },
        },
        Err(err) => return UpdateResult::Failed { reason: format!("manifest fetch: {err}") },
    };

    if let Some(target) = &target_version {
        if target != &manifest.version {
            return UpdateResult::Rejected { reason: "version_mismatch".into() };
        }
    }
    if manifest.version == opts.current_version {
        return UpdateResult::Noop;
    }

    let Some(entry) = manifest.binaries.get(&opts.os_arch) else {
        return UpdateResult::Rejected { reason: format!("no binary for {}", opts.os_arch) };
    };

    let bytes = match reqwest::get(&entry.url).await {
        Ok(resp) => match resp.bytes().await {
            Ok(b) => b,
            Err(err) => return UpdateResult::Failed { reason: format!("download: {err}") },
        },
        Err(err) => return UpdateResult::Failed { reason: format!("download: {err}") },
    };

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let computed = hex::encode(hasher.finalize());
    if computed != entry.sha256 {
        return UpdateResult::Failed { reason: "checksum".into() };
    }

    match swap_binary(&opts.current_exe, &bytes) {
        Ok(()) => UpdateResult::Applied { new_version: manifest.version },
        Err(err) => UpdateResult::Failed { reason: format!("io: {err}") },
    }
}

fn swap_binary(current_exe: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = current_exe.with_extension("update-tmp");
    std::fs::write(&tmp, bytes)?;
    set_executable(&tmp)?;

    let backup = current_exe.with_extension("backup");
    if current_exe.exists() {
        std::fs::copy(current_exe, &backup)?;
    }
    std::fs::rename(&tmp, current_exe)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// True when running under a container runtime, detected via the cgroup
/// marker or an orchestrator-provided env var (spec.md §4.5 step 6).
pub fn is_containerized() -> bool {
    std::path::Path::new("/.dockerenv").exists()
        || std::env::var("KUBERNETES_SERVICE_HOST").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollout_bucket_is_stable_for_the_same_id() {
        assert_eq!(rollout_bucket("agent-123"), rollout_bucket("agent-123"));
    }

    #[test]
    fn rollout_bucket_is_within_range() {
        for id in ["a", "b", "agent-xyz", ""] {
            assert!(rollout_bucket(id) < 100);
        }
    }

    #[test]
    fn swap_binary_creates_backup_of_existing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("fleet-agent");
        std::fs::write(&exe, b"old-binary").unwrap();

        swap_binary(&exe, b"new-binary").unwrap();

        assert_eq!(std::fs::read(&exe).unwrap(), b"new-binary");
        assert_eq!(std::fs::read(exe.with_extension("backup")).unwrap(), b"old-binary");
    }
}
