//! Schema setup and persistence, generalizing `der_headend/src/db.rs`: one
//! Postgres pool serves both the columnar telemetry tables (optionally
//! converted to TimescaleDB hypertables) and the relational tenancy tables
//! (spec.md §3 "columnar store"/"relational store").

use anyhow::{Context, Result};
use fleet_proto::{AccessLogRecord, ProxyMetricRecord, SystemMetricRecord};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::warn;

pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("connecting to DATABASE_URL")?;
    init_schema(&pool).await?;
    Ok(pool)
}

pub async fn init_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS access_logs (
            agent_id text NOT NULL,
            ts timestamptz NOT NULL,
            status_code int NOT NULL,
            method text NOT NULL,
            uri text NOT NULL,
            client_ip text NOT NULL,
            bytes_sent bigint NOT NULL,
            upstream_response_time_ms double precision NOT NULL,
            request_time_ms double precision NOT NULL,
            referer text NOT NULL,
            user_agent text NOT NULL,
            request_id text NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating access_logs table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS system_metrics (
            agent_id text NOT NULL,
            ts timestamptz NOT NULL,
            cpu_used_percent double precision NOT NULL,
            memory_used_bytes bigint NOT NULL,
            memory_total_bytes bigint NOT NULL,
            net_rx_bytes_per_sec double precision NOT NULL,
            net_tx_bytes_per_sec double precision NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating system_metrics table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS proxy_metrics (
            agent_id text NOT NULL,
            ts timestamptz NOT NULL,
            active_connections bigint NOT NULL,
            accepted bigint NOT NULL,
            handled bigint NOT NULL,
            reading bigint NOT NULL,
            writing bigint NOT NULL,
            waiting bigint NOT NULL,
            total_requests bigint NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating proxy_metrics table")?;

    try_setup_timescale(pool, "access_logs").await;
    try_setup_timescale(pool, "system_metrics").await;
    try_setup_timescale(pool, "proxy_metrics").await;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS access_logs_agent_ts_idx ON access_logs (agent_id, ts DESC);"#,
    )
    .execute(pool)
    .await
    .context("creating access_logs index")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id uuid PRIMARY KEY,
            slug text NOT NULL UNIQUE,
            name text NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating projects table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS environments (
            id uuid PRIMARY KEY,
            project_id uuid NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            slug text NOT NULL,
            color text NOT NULL,
            sort_index int NOT NULL DEFAULT 0,
            is_production boolean NOT NULL DEFAULT false,
            UNIQUE (project_id, slug)
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating environments table")?;

    // Invariant (spec.md §3): removing an environment detaches its
    // assignments (SET NULL), never cascades the delete onto assignments.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS assignments (
            agent_id text PRIMARY KEY,
            environment_id uuid REFERENCES environments(id) ON DELETE SET NULL,
            display_name text NOT NULL DEFAULT '',
            tags jsonb NOT NULL DEFAULT '{}'::jsonb,
            assigned_by text NOT NULL,
            assigned_at timestamptz NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating assignments table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS teams (
            id uuid PRIMARY KEY,
            name text NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating teams table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id uuid PRIMARY KEY,
            username text NOT NULL UNIQUE,
            superadmin boolean NOT NULL DEFAULT false
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating users table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS team_members (
            team_id uuid NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
            user_id uuid NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            role text NOT NULL,
            PRIMARY KEY (team_id, user_id)
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating team_members table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS team_project_access (
            team_id uuid NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
            project_id uuid NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            permission text NOT NULL,
            PRIMARY KEY (team_id, project_id, permission)
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating team_project_access table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alert_rules (
            id uuid PRIMARY KEY,
            project_id uuid NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            name text NOT NULL,
            expression text NOT NULL,
            severity text NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating alert_rules table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS command_acks (
            correlation_id uuid PRIMARY KEY,
            agent_id text NOT NULL,
            kind text NOT NULL,
            outcome text NOT NULL,
            detail text NOT NULL,
            acked_at timestamptz NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await
    .context("creating command_acks table")?;

    Ok(())
}

async fn try_setup_timescale(pool: &PgPool, table: &str) {
    if let Err(err) = sqlx::query(r#"CREATE EXTENSION IF NOT EXISTS timescaledb;"#)
        .execute(pool)
        .await
    {
        warn!("timescaledb extension unavailable: {err}");
        return;
    }
    if let Err(err) = sqlx::query(&format!(
        "SELECT create_hypertable('{table}', 'ts', if_not_exists => TRUE);"
    ))
    .execute(pool)
    .await
    {
        warn!("failed to convert {table} to hypertable: {err}");
    }
}

/// Applies a TTL horizon by deleting rows older than `retain_for`. Driven by
/// a periodic task rather than a native TTL clause so this works identically
/// whether or not the timescaledb extension is present.
///
/// Retention is keyed on a whole-second cast of `ts` (spec.md §4.4 / §8
/// property 9): comparing `date_trunc('second', ts)` against the horizon
/// guards the same sub-second-precision bug the original implementation hit.
pub async fn apply_retention(pool: &PgPool, table: &str, retain_for: chrono::Duration) -> Result<u64> {
    let horizon = chrono::Utc::now() - retain_for;
    let result = sqlx::query(&format!(
        "DELETE FROM {table} WHERE date_trunc('second', ts) < date_trunc('second', $1::timestamptz)"
    ))
    .bind(horizon)
    .execute(pool)
    .await
    .with_context(|| format!("applying retention to {table}"))?;
    Ok(result.rows_affected())
}

pub async fn insert_access_log_batch(pool: &PgPool, records: &[AccessLogRecord]) -> Result<()> {
    for r in records {
        sqlx::query(
            r#"
            INSERT INTO access_logs (
                agent_id, ts, status_code, method, uri, client_ip, bytes_sent,
                upstream_response_time_ms, request_time_ms, referer, user_agent, request_id
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
            "#,
        )
        .bind(&r.agent_id)
        .bind(r.timestamp)
        .bind(r.status_code)
        .bind(&r.method)
        .bind(&r.uri)
        .bind(&r.client_ip)
        .bind(r.bytes_sent as i64)
        .bind(r.upstream_response_time_ms)
        .bind(r.request_time_ms)
        .bind(&r.referer)
        .bind(&r.user_agent)
        .bind(&r.request_id)
        .execute(pool)
        .await
        .context("inserting access log row")?;
    }
    Ok(())
}

pub async fn insert_system_metric_batch(pool: &PgPool, records: &[SystemMetricRecord]) -> Result<()> {
    for r in records {
        sqlx::query(
            r#"
            INSERT INTO system_metrics (
                agent_id, ts, cpu_used_percent, memory_used_bytes, memory_total_bytes,
                net_rx_bytes_per_sec, net_tx_bytes_per_sec
            ) VALUES ($1,$2,$3,$4,$5,$6,$7)
            "#,
        )
        .bind(&r.agent_id)
        .bind(r.timestamp)
        .bind(r.cpu_used_percent)
        .bind(r.memory_used_bytes as i64)
        .bind(r.memory_total_bytes as i64)
        .bind(r.net_rx_bytes_per_sec)
        .bind(r.net_tx_bytes_per_sec)
        .execute(pool)
        .await
        .context("inserting system metric row")?;
    }
    Ok(())
}

pub async fn insert_proxy_metric_batch(pool: &PgPool, records: &[ProxyMetricRecord]) -> Result<()> {
    for r in records {
        sqlx::query(
            r#"
            INSERT INTO proxy_metrics (
                agent_id, ts, active_connections, accepted, handled, reading, writing, waiting, total_requests
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            "#,
        )
        .bind(&r.agent_id)
        .bind(r.timestamp)
        .bind(r.active_connections as i64)
        .bind(r.accepted as i64)
        .bind(r.handled as i64)
        .bind(r.reading as i64)
        .bind(r.writing as i64)
        .bind(r.waiting as i64)
        .bind(r.total_requests as i64)
        .execute(pool)
        .await
        .context("inserting proxy metric row")?;
    }
    Ok(())
}
