mod assign;
mod config;
mod db;
mod error;
mod grpc;
mod http;
mod ingest;
mod metrics;
mod models;
mod rbac;
mod session;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use fleet_auth::PskAuthenticator;
use fleet_proto::proto::fleet_link_server::FleetLinkServer;
use sqlx::PgPool;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, Config};
use crate::error::GatewayError;
use crate::ingest::{IngestConfig, IngestHandle};
use crate::metrics::GatewayMetrics;
use crate::session::SessionTable;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionTable,
    pub pool: Option<PgPool>,
    pub ingest: Arc<IngestHandle>,
    pub authenticator: Arc<PskAuthenticator>,
    pub metrics: Arc<GatewayMetrics>,
    pub auto_enroll: bool,
    pub update_manifest_version: String,
}

impl AppState {
    fn require_pool(&self) -> Result<&PgPool, GatewayError> {
        self.pool
            .as_ref()
            .ok_or_else(|| GatewayError::StoreUnavailable("no relational store configured".into()))
    }

    /// Enrolment lookup (spec.md §4.7): an agent id is "enrolled" once it has
    /// an assignment row or has connected before. Absent a dedicated agents
    /// table, presence in `assignments` or `command_acks` stands in for
    /// "known to the store"; a fresh deployment with `auto_enroll=false`
    /// rejects every unrecognised agent until an administrator assigns it.
    pub async fn is_enrolled(&self, agent_id: &str) -> bool {
        let Some(pool) = self.pool.as_ref() else {
            return true;
        };
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM assignments WHERE agent_id = $1")
            .bind(agent_id)
            .fetch_one(pool)
            .await
            .map(|n| n > 0)
            .unwrap_or(false)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::resolve(cli)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cfg.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let pool = match cfg.database_url.as_ref() {
        Some(url) => Some(db::connect(url).await?),
        None => {
            tracing::warn!("no DATABASE_URL configured; running without persistence");
            None
        }
    };

    let authenticator = Arc::new(PskAuthenticator::new(cfg.psk.clone(), cfg.psk_previous.clone()));
    let metrics = Arc::new(GatewayMetrics::default());
    let ingest = Arc::new(match pool.clone() {
        Some(pool) => IngestHandle::spawn(pool, IngestConfig::default(), metrics.clone()),
        None => {
            // No store: ingestion has nowhere to flush. This deployment mode
            // exists for local admin-surface smoke testing only.
            anyhow::bail!("DATABASE_URL is required to run the ingestion pipeline");
        }
    });

    let state = AppState {
        sessions: SessionTable::new(),
        pool: pool.clone(),
        ingest,
        authenticator,
        metrics,
        auto_enroll: cfg.auto_enroll,
        update_manifest_version: "0.1.0".to_string(),
    };

    tokio::spawn(session::run_reaper(
        state.sessions.clone(),
        Duration::from_secs(30),
        chrono::Duration::seconds(3), // idle_timeout = 3 x heartbeat_interval (heartbeat default 1s, spec.md §9)
    ));

    if let Some(pool) = pool.clone() {
        tokio::spawn(run_retention_sweeper(pool));
    }

    let grpc_addr: std::net::SocketAddr = cfg.grpc_addr.parse()?;
    let http_addr: std::net::SocketAddr = cfg.http_addr.parse()?;

    let grpc_state = state.clone();
    let grpc_server = tonic::transport::Server::builder()
        .add_service(FleetLinkServer::new(grpc::GrpcApi { state: grpc_state }))
        .serve(grpc_addr);

    let http_router = http::router(state.clone());
    let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
    let http_server = axum::serve(http_listener, http_router);

    info!(%grpc_addr, %http_addr, "fleet-gateway listening");

    tokio::select! {
        result = grpc_server => result.map_err(anyhow::Error::from)?,
        result = http_server => result.map_err(anyhow::Error::from)?,
    }

    Ok(())
}

/// Periodic TTL enforcement (spec.md §4.4 retention defaults).
async fn run_retention_sweeper(pool: PgPool) {
    let mut ticker = tokio::time::interval(Duration::from_secs(3600));
    loop {
        ticker.tick().await;
        let sweeps = [
            ("access_logs", chrono::Duration::days(7)),
            ("system_metrics", chrono::Duration::days(30)),
            ("proxy_metrics", chrono::Duration::days(30)),
        ];
        for (table, horizon) in sweeps {
            match db::apply_retention(&pool, table, horizon).await {
                Ok(n) if n > 0 => info!(table, deleted = n, "retention sweep"),
                Ok(_) => {}
                Err(err) => tracing::warn!("retention sweep failed for {table}: {err}"),
            }
        }
    }
}
