mod collector;
mod commands;
mod config;
mod configpush;
mod cursors;
mod health;
mod identity;
mod outbound;
mod producer;
mod stream;
mod update;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use fleet_wab::{Wab, WabConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::{ExecutorOptions, IncomingCommand};
use crate::config::{Cli, Config};
use crate::configpush::ConfigPushOptions;
use crate::cursors::CursorStore;
use crate::health::HealthState;
use crate::outbound::GatewayRegistry;
use crate::stream::StreamClientDeps;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::resolve(cli)?;
    init_tracing(&cfg);

    let agent_id = identity::load_or_create(&cfg.buffer_dir)?;
    tracing::info!(agent_id, servers = ?cfg.servers, "starting fleet-agent");

    let wab = Arc::new(Wab::open(WabConfig::new(cfg.buffer_dir.join("wab")))?);
    let cursor_store = Arc::new(CursorStore::open(&cfg.buffer_dir)?);
    let registry = GatewayRegistry::new();
    let (executor_tx, executor_rx) = tokio::sync::mpsc::channel::<IncomingCommand>(64);

    let os_arch = format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH);
    let current_exe = std::env::current_exe().unwrap_or_else(|_| "fleet-agent".into());

    let executor_opts = ExecutorOptions {
        config_push: ConfigPushOptions::default(),
        reload_cmd: std::env::var("FLEET_RELOAD_CMD").ok(),
        restart_cmd: std::env::var("FLEET_RESTART_CMD").ok(),
        stop_cmd: std::env::var("FLEET_STOP_CMD").ok(),
        update_manifest_url: cfg.update_origin.clone(),
        current_exe,
        current_version: AGENT_VERSION.to_string(),
        os_arch,
        rollout_percent: cfg.rollout_percent,
        agent_id: agent_id.clone(),
        supervisor_restart_cmd: std::env::var("FLEET_SUPERVISOR_RESTART_CMD").ok(),
    };
    tokio::spawn(commands::run_executor(executor_rx, registry.clone(), wab.clone(), executor_opts));

    let producer_cfg = producer::ProducerConfig {
        agent_id: agent_id.clone(),
        hostname: cfg.hostname.clone(),
        agent_version: AGENT_VERSION.to_string(),
        build_commit: std::env::var("FLEET_BUILD_COMMIT").unwrap_or_default(),
        build_branch: std::env::var("FLEET_BUILD_BRANCH").unwrap_or_default(),
        build_date: std::env::var("FLEET_BUILD_DATE").unwrap_or_default(),
        containerized: update::is_containerized(),
        labels: load_labels(),
        access_log_path: std::env::var("FLEET_ACCESS_LOG_PATH").ok().map(Into::into),
    };
    tokio::spawn(producer::run(wab.clone(), producer_cfg));

    let stream_deps = Arc::new(StreamClientDeps {
        wab: wab.clone(),
        cursors: cursor_store,
        registry: registry.clone(),
        executor_tx,
        agent_id: agent_id.clone(),
        hostname: cfg.hostname.clone(),
        psk: cfg.psk.clone(),
        known_gateways: cfg.servers.clone(),
    });
    for gateway in &cfg.servers {
        tokio::spawn(stream::run_gateway(gateway.clone(), stream_deps.clone()));
    }

    let health_state = HealthState {
        wab: wab.clone(),
        registry: registry.clone(),
        configured_gateways: cfg.servers.clone(),
    };
    let health_addr: std::net::SocketAddr = format!("0.0.0.0:{}", cfg.health_port).parse()?;
    let health_listener = tokio::net::TcpListener::bind(health_addr).await?;
    let health_server = axum::serve(health_listener, health::router(health_state.clone()));
    tracing::info!(%health_addr, "health endpoint listening");

    let management_addr: std::net::SocketAddr = format!("0.0.0.0:{}", cfg.management_port).parse()?;
    let management_listener = tokio::net::TcpListener::bind(management_addr).await?;
    let management_server = axum::serve(management_listener, health::router(health_state));
    tracing::info!(%management_addr, "management endpoint listening");

    tokio::select! {
        result = health_server => result.map_err(anyhow::Error::from)?,
        result = management_server => result.map_err(anyhow::Error::from)?,
    }
    Ok(())
}

/// Labels used by the gateway's auto-assignment resolver (spec.md §4.6):
/// `project` and `environment` at minimum, sourced from the environment so
/// operators can inject them via their process manager without a config file.
fn load_labels() -> std::collections::HashMap<String, String> {
    let mut labels = std::collections::HashMap::new();
    if let Ok(project) = std::env::var("FLEET_LABEL_PROJECT") {
        labels.insert("project".to_string(), project);
    }
    if let Ok(environment) = std::env::var("FLEET_LABEL_ENVIRONMENT") {
        labels.insert("environment".to_string(), environment);
    }
    labels
}

fn init_tracing(cfg: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_new(&cfg.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    if let Some(path) = &cfg.log_file {
        if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::sync::Mutex::new(file)))
                .init();
            return;
        }
        eprintln!("failed to open log file {}; falling back to stdout", path.display());
    }
    registry.with(tracing_subscriber::fmt::layer()).init();
}
