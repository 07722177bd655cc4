//! Agent configuration: CLI flags layered over an optional YAML file, matching
//! spec.md §6's CLI > file > env > default precedence (same pattern as
//! `fleet-gateway::config`, which in turn follows the teacher's `assets.yaml`
//! plus env-var style from `edge_agent::AgentConfig::from_env`).

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "fleet-agent", about = "Per-host fleet collector and command executor")]
pub struct Cli {
    #[arg(long, env = "FLEET_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Gateway addresses (repeatable), e.g. --server http://gw1:7443 --server http://gw2:7443
    #[arg(long = "server", env = "FLEET_SERVERS", value_delimiter = ',')]
    pub servers: Vec<String>,

    #[arg(long, env = "FLEET_UPDATE_ORIGIN")]
    pub update_origin: Option<String>,

    #[arg(long, env = "FLEET_UPDATE_INTERVAL_SECS")]
    pub update_interval_secs: Option<u64>,

    #[arg(long, env = "FLEET_HEALTH_PORT")]
    pub health_port: Option<u16>,

    #[arg(long, env = "FLEET_MANAGEMENT_PORT")]
    pub management_port: Option<u16>,

    #[arg(long, env = "FLEET_BUFFER_DIR")]
    pub buffer_dir: Option<PathBuf>,

    #[arg(long, env = "RUST_LOG")]
    pub log_level: Option<String>,

    #[arg(long, env = "FLEET_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[arg(long, env = "FLEET_PSK")]
    pub psk: Option<String>,

    #[arg(long, env = "FLEET_HOSTNAME")]
    pub hostname: Option<String>,

    #[arg(long, env = "FLEET_ROLLOUT_PERCENT")]
    pub rollout_percent: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    servers: Option<Vec<String>>,
    update_origin: Option<String>,
    update_interval_secs: Option<u64>,
    health_port: Option<u16>,
    management_port: Option<u16>,
    buffer_dir: Option<PathBuf>,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
    psk: Option<String>,
    hostname: Option<String>,
    rollout_percent: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub servers: Vec<String>,
    pub update_origin: Option<String>,
    pub update_interval: std::time::Duration,
    pub health_port: u16,
    pub management_port: u16,
    pub buffer_dir: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub psk: String,
    pub hostname: String,
    pub rollout_percent: u8,
}

impl Config {
    pub fn resolve(cli: Cli) -> anyhow::Result<Self> {
        let file: FileConfig = match cli.config_file.as_ref() {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("reading config file {}: {e}", path.display()))?;
                serde_yaml::from_str(&text)
                    .map_err(|e| anyhow::anyhow!("parsing config file {}: {e}", path.display()))?
            }
            None => FileConfig::default(),
        };

        let servers = if !cli.servers.is_empty() {
            cli.servers
        } else {
            file.servers.unwrap_or_default()
        };
        if servers.is_empty() {
            anyhow::bail!("at least one --server gateway address is required");
        }

        let hostname = cli
            .hostname
            .or(file.hostname)
            .or_else(|| hostname_from_os())
            .unwrap_or_else(|| "unknown-host".to_string());

        Ok(Config {
            servers,
            update_origin: cli.update_origin.or(file.update_origin),
            update_interval: std::time::Duration::from_secs(
                cli.update_interval_secs.or(file.update_interval_secs).unwrap_or(3600),
            ),
            health_port: cli.health_port.or(file.health_port).unwrap_or(9100),
            management_port: cli.management_port.or(file.management_port).unwrap_or(9101),
            buffer_dir: cli
                .buffer_dir
                .or(file.buffer_dir)
                .unwrap_or_else(|| PathBuf::from("/var/lib/fleet-agent")),
            log_level: cli.log_level.or(file.log_level).unwrap_or_else(|| "info".into()),
            log_file: cli.log_file.or(file.log_file),
            psk: cli.psk.or(file.psk).unwrap_or_default(),
            hostname,
            rollout_percent: cli.rollout_percent.or(file.rollout_percent).unwrap_or(100),
        })
    }
}

fn hostname_from_os() -> Option<String> {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn bare_cli() -> Cli {
        Cli {
            config_file: None,
            servers: vec![],
            update_origin: None,
            update_interval_secs: None,
            health_port: None,
            management_port: None,
            buffer_dir: None,
            log_level: None,
            log_file: None,
            psk: None,
            hostname: Some("test-host".into()),
            rollout_percent: None,
        }
    }

    #[test]
    fn missing_servers_is_rejected() {
        let cli = bare_cli();
        assert!(Config::resolve(cli).is_err());
    }

    #[test]
    fn defaults_apply_when_only_servers_given() {
        let mut cli = bare_cli();
        cli.servers = vec!["http://gw:7443".into()];
        let cfg = Config::resolve(cli).unwrap();
        assert_eq!(cfg.health_port, 9100);
        assert_eq!(cfg.rollout_percent, 100);
    }

    #[test]
    fn file_config_fills_gaps_left_by_cli() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "servers:\n  - http://gw1:7443\nhealth_port: 9200").unwrap();

        let mut cli = bare_cli();
        cli.config_file = Some(file.path().to_path_buf());
        let cfg = Config::resolve(cli).unwrap();

        assert_eq!(cfg.servers, vec!["http://gw1:7443".to_string()]);
        assert_eq!(cfg.health_port, 9200);
    }

    #[test]
    fn cli_servers_override_file_servers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "servers:\n  - http://from-file:7443").unwrap();

        let mut cli = bare_cli();
        cli.config_file = Some(file.path().to_path_buf());
        cli.servers = vec!["http://from-cli:7443".into()];
        let cfg = Config::resolve(cli).unwrap();

        assert_eq!(cfg.servers, vec!["http://from-cli:7443".to_string()]);
    }
}
