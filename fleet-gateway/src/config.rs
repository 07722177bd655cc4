//! Gateway configuration: CLI flags (via `clap`) layered over an optional
//! YAML file, matching spec.md §6's CLI > file > env > default precedence
//! and the teacher's own use of `serde_yaml` for `assets.yaml`.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "fleet-gateway", about = "Fleet telemetry and control plane gateway")]
pub struct Cli {
    #[arg(long, env = "FLEET_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "FLEET_GRPC_ADDR")]
    pub grpc_addr: Option<String>,

    #[arg(long, env = "FLEET_HTTP_ADDR")]
    pub http_addr: Option<String>,

    #[arg(long, env = "FLEET_PSK")]
    pub psk: Option<String>,

    #[arg(long, env = "FLEET_PSK_PREVIOUS")]
    pub psk_previous: Option<String>,

    #[arg(long, env = "FLEET_AUTO_ENROLL")]
    pub auto_enroll: Option<bool>,

    #[arg(long, env = "RUST_LOG")]
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    database_url: Option<String>,
    grpc_addr: Option<String>,
    http_addr: Option<String>,
    psk: Option<String>,
    psk_previous: Option<String>,
    auto_enroll: Option<bool>,
    log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub grpc_addr: String,
    pub http_addr: String,
    pub psk: Option<String>,
    pub psk_previous: Option<String>,
    pub auto_enroll: bool,
    pub log_level: String,
}

impl Config {
    /// Resolves CLI > file > env (already folded into `cli` via clap's `env`
    /// attribute) > built-in default, in that order.
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

        Ok(Config {
            database_url: cli.database_url.or(file.database_url),
            grpc_addr: cli.grpc_addr.or(file.grpc_addr).unwrap_or_else(|| "0.0.0.0:7443".into()),
            http_addr: cli.http_addr.or(file.http_addr).unwrap_or_else(|| "0.0.0.0:8080".into()),
            psk: cli.psk.or(file.psk),
            psk_previous: cli.psk_previous.or(file.psk_previous),
            auto_enroll: cli.auto_enroll.or(file.auto_enroll).unwrap_or(true),
            log_level: cli.log_level.or(file.log_level).unwrap_or_else(|| "info".into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn bare_cli() -> Cli {
        Cli {
            config_file: None,
            database_url: None,
            grpc_addr: None,
            http_addr: None,
            psk: None,
            psk_previous: None,
            auto_enroll: None,
            log_level: None,
        }
    }

    #[test]
    fn defaults_apply_when_nothing_else_is_set() {
        let cfg = Config::resolve(bare_cli()).unwrap();
        assert_eq!(cfg.grpc_addr, "0.0.0.0:7443");
        assert_eq!(cfg.http_addr, "0.0.0.0:8080");
        assert!(cfg.auto_enroll);
    }

    #[test]
    fn file_config_fills_gaps_left_by_cli() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "grpc_addr: 127.0.0.1:9000\npsk: filesecret").unwrap();

        let mut cli = bare_cli();
        cli.config_file = Some(file.path().to_path_buf());
        let cfg = Config::resolve(cli).unwrap();

        assert_eq!(cfg.grpc_addr, "127.0.0.1:9000");
        assert_eq!(cfg.psk.as_deref(), Some("filesecret"));
    }

    #[test]
    fn cli_flag_overrides_file_value() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "grpc_addr: 127.0.0.1:9000").unwrap();

        let mut cli = bare_cli();
        cli.config_file = Some(file.path().to_path_buf());
        cli.grpc_addr = Some("127.0.0.1:1111".into());
        let cfg = Config::resolve(cli).unwrap();

        assert_eq!(cfg.grpc_addr, "127.0.0.1:1111");
    }
}
