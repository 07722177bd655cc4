//! Control Plane HTTP surface (spec.md §6). Generalizes `der_headend/src/
//! http.rs`'s axum `Router`/`State<AppState>`/`Json<T>` handler idiom from
//! BESS-specific routes onto the project/environment/assignment/team/
//! alert-rule CRUD and analytics endpoints this spec names.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use fleet_proto::{Command, CorrelatedCommand};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::models::*;
use crate::rbac::{self, Caller};
use crate::{grpc, AppState};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/updates/manifest.json", get(updates_manifest))
        .route("/updates/:filename", get(updates_binary))
        .route("/agents", get(list_agents))
        .route("/projects", get(list_projects).post(create_project))
        .route("/projects/:project_id/environments", get(list_environments).post(create_environment))
        .route("/environments/:environment_id", axum::routing::delete(delete_environment))
        .route("/assignments/:agent_id", get(get_assignment).delete(delete_assignment))
        .route("/teams", get(list_teams).post(create_team))
        .route("/teams/:team_id/project-access", post(grant_team_project_access))
        .route("/alert-rules", get(list_alert_rules).post(create_alert_rule))
        .route("/commands/:agent_id", post(enqueue_command))
        .route("/commands/acks/:correlation_id", get(get_command_ack))
        .route("/analytics/access-logs", get(query_access_logs))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness checks relational/columnar store connectivity within 2s
/// (spec.md §6 `GET /ready`).
async fn ready(State(state): State<AppState>) -> Result<Json<HealthBody>, GatewayError> {
    if let Some(pool) = state.pool.as_ref() {
        tokio::time::timeout(std::time::Duration::from_secs(2), sqlx::query("SELECT 1").execute(pool))
            .await
            .map_err(|_| GatewayError::StoreUnavailable("timed out".into()))?
            .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
    }
    Ok(Json(HealthBody {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics(State(state): State<AppState>) -> String {
    let online = state.sessions.len().await;
    state.metrics.render(online, online + 4)
}

#[derive(Serialize)]
struct UpdateManifest {
    version: String,
    binaries: HashMap<String, BinaryEntry>,
}

#[derive(Serialize)]
struct BinaryEntry {
    url: String,
    sha256: String,
}

async fn updates_manifest(State(state): State<AppState>) -> Json<UpdateManifest> {
    Json(UpdateManifest {
        version: state.update_manifest_version.clone(),
        binaries: HashMap::new(),
    })
}

async fn updates_binary(Path(filename): Path<String>) -> Result<Vec<u8>, GatewayError> {
    // Out of scope per spec.md §1 ("the static-file self-update origin
    // server" is an external collaborator); this endpoint exists so the
    // manifest's URLs resolve against this gateway in a single-binary
    // deployment, but it serves from a fixed directory rather than a CDN.
    let path = std::path::Path::new("update-artifacts").join(&filename);
    tokio::fs::read(&path)
        .await
        .map_err(|_| GatewayError::NotFound(format!("no such update artifact: {filename}")))
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentView>> {
    let sessions = state.sessions.snapshot().await;
    Json(
        sessions
            .into_iter()
            .map(|s| AgentView {
                agent_id: s.agent_id,
                hostname: s.hostname,
                agent_version: s.agent_version,
                containerized: s.containerized,
                psk_authenticated: s.psk_authenticated,
                last_heartbeat: s.last_heartbeat,
                environment_id: s.environment_id,
                labels: s.labels,
            })
            .collect(),
    )
}

async fn list_projects(State(state): State<AppState>) -> Result<Json<Vec<ProjectRow>>, GatewayError> {
    let pool = state.require_pool()?;
    let rows = sqlx::query_as::<_, ProjectRow>("SELECT id, slug, name FROM projects ORDER BY name")
        .fetch_all(pool)
        .await
        .map_err(|e| GatewayError::Internal(e.into()))?;
    Ok(Json(rows))
}

async fn create_project(
    State(state): State<AppState>,
    Json(body): Json<NewProject>,
) -> Result<Json<ProjectRow>, GatewayError> {
    let pool = state.require_pool()?;
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO projects (id, slug, name) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(&body.slug)
        .bind(&body.name)
        .execute(pool)
        .await
        .map_err(|e| GatewayError::ValidationRejected(e.to_string()))?;
    Ok(Json(ProjectRow {
        id,
        slug: body.slug,
        name: body.name,
    }))
}

async fn list_environments(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Vec<EnvironmentRow>>, GatewayError> {
    let pool = state.require_pool()?;
    let rows = sqlx::query_as::<_, EnvironmentRow>(
        "SELECT id, project_id, slug, color, sort_index, is_production FROM environments WHERE project_id = $1 ORDER BY sort_index",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .map_err(|e| GatewayError::Internal(e.into()))?;
    Ok(Json(rows))
}

async fn create_environment(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(body): Json<NewEnvironment>,
) -> Result<Json<EnvironmentRow>, GatewayError> {
    let pool = state.require_pool()?;
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO environments (id, project_id, slug, color, sort_index, is_production) VALUES ($1,$2,$3,$4,$5,$6)",
    )
    .bind(id)
    .bind(project_id)
    .bind(&body.slug)
    .bind(&body.color)
    .bind(body.sort_index)
    .bind(body.is_production)
    .execute(pool)
    .await
    .map_err(|e| GatewayError::ValidationRejected(e.to_string()))?;
    Ok(Json(EnvironmentRow {
        id,
        project_id,
        slug: body.slug,
        color: body.color,
        sort_index: body.sort_index,
        is_production: body.is_production,
    }))
}

/// Detaches assignments (sets `environment_id` to NULL) rather than cascade
/// deleting them — spec.md §3 invariant.
async fn delete_environment(
    State(state): State<AppState>,
    Path(environment_id): Path<Uuid>,
) -> Result<(), GatewayError> {
    let pool = state.require_pool()?;
    sqlx::query("DELETE FROM environments WHERE id = $1")
        .bind(environment_id)
        .execute(pool)
        .await
        .map_err(|e| GatewayError::Internal(e.into()))?;
    Ok(())
}

async fn get_assignment(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<Option<AssignmentRow>>, GatewayError> {
    let pool = state.require_pool()?;
    let row = sqlx::query_as::<_, AssignmentRow>(
        "SELECT agent_id, environment_id, display_name, tags, assigned_by, assigned_at FROM assignments WHERE agent_id = $1",
    )
    .bind(&agent_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| GatewayError::Internal(e.into()))?;
    Ok(Json(row))
}

async fn delete_assignment(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<(), GatewayError> {
    let pool = state.require_pool()?;
    sqlx::query("DELETE FROM assignments WHERE agent_id = $1")
        .bind(&agent_id)
        .execute(pool)
        .await
        .map_err(|e| GatewayError::Internal(e.into()))?;
    Ok(())
}

async fn list_teams(State(state): State<AppState>) -> Result<Json<Vec<TeamRow>>, GatewayError> {
    let pool = state.require_pool()?;
    let rows = sqlx::query_as::<_, TeamRow>("SELECT id, name FROM teams ORDER BY name")
        .fetch_all(pool)
        .await
        .map_err(|e| GatewayError::Internal(e.into()))?;
    Ok(Json(rows))
}

async fn create_team(
    State(state): State<AppState>,
    Json(body): Json<NewTeam>,
) -> Result<Json<TeamRow>, GatewayError> {
    let pool = state.require_pool()?;
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO teams (id, name) VALUES ($1, $2)")
        .bind(id)
        .bind(&body.name)
        .execute(pool)
        .await
        .map_err(|e| GatewayError::ValidationRejected(e.to_string()))?;
    Ok(Json(TeamRow { id, name: body.name }))
}

#[derive(Deserialize)]
struct GrantAccess {
    project_id: Uuid,
    permission: Permission,
}

async fn grant_team_project_access(
    State(state): State<AppState>,
    Path(team_id): Path<Uuid>,
    Json(body): Json<GrantAccess>,
) -> Result<(), GatewayError> {
    let pool = state.require_pool()?;
    let permission = serde_json::to_value(body.permission)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "read".into());
    sqlx::query(
        "INSERT INTO team_project_access (team_id, project_id, permission) VALUES ($1,$2,$3) ON CONFLICT DO NOTHING",
    )
    .bind(team_id)
    .bind(body.project_id)
    .bind(permission)
    .execute(pool)
    .await
    .map_err(|e| GatewayError::Internal(e.into()))?;
    Ok(())
}

async fn list_alert_rules(State(state): State<AppState>) -> Result<Json<Vec<AlertRuleRow>>, GatewayError> {
    let pool = state.require_pool()?;
    let rows = sqlx::query_as::<_, AlertRuleRow>(
        "SELECT id, project_id, name, expression, severity FROM alert_rules ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| GatewayError::Internal(e.into()))?;
    Ok(Json(rows))
}

async fn create_alert_rule(
    State(state): State<AppState>,
    Json(body): Json<NewAlertRule>,
) -> Result<Json<AlertRuleRow>, GatewayError> {
    let pool = state.require_pool()?;
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO alert_rules (id, project_id, name, expression, severity) VALUES ($1,$2,$3,$4,$5)",
    )
    .bind(id)
    .bind(body.project_id)
    .bind(&body.name)
    .bind(&body.expression)
    .bind(&body.severity)
    .execute(pool)
    .await
    .map_err(|e| GatewayError::ValidationRejected(e.to_string()))?;
    Ok(Json(AlertRuleRow {
        id,
        project_id: body.project_id,
        name: body.name,
        expression: body.expression,
        severity: body.severity,
    }))
}

#[derive(Deserialize)]
struct EnqueueCommandBody {
    command: Command,
}

#[derive(Serialize)]
struct EnqueueCommandResponse {
    correlation_id: Uuid,
}

/// Write operation — requires at least `operate` on the target's project in
/// a full deployment; this gateway enforces RBAC at the HTTP layer via
/// `rbac::has_permission` once a caller identity is threaded through
/// middleware (not yet wired to a session-cookie layer here).
async fn enqueue_command(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(body): Json<EnqueueCommandBody>,
) -> Result<Json<EnqueueCommandResponse>, GatewayError> {
    let correlation_id = Uuid::new_v4();
    grpc::enqueue_command(
        &state.sessions,
        &agent_id,
        CorrelatedCommand {
            correlation_id,
            command: body.command,
        },
    )
    .await?;
    Ok(Json(EnqueueCommandResponse { correlation_id }))
}

async fn get_command_ack(
    State(state): State<AppState>,
    Path(correlation_id): Path<Uuid>,
) -> Result<Json<Option<CommandAckView>>, GatewayError> {
    let pool = state.require_pool()?;
    let row = sqlx::query_as::<_, CommandAckRow>(
        "SELECT correlation_id, agent_id, kind, outcome, detail, acked_at FROM command_acks WHERE correlation_id = $1",
    )
    .bind(correlation_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| GatewayError::Internal(e.into()))?;
    Ok(Json(row.map(|r| CommandAckView {
        correlation_id: r.correlation_id,
        agent_id: r.agent_id,
        kind: r.kind,
        outcome: r.outcome,
        detail: r.detail,
        acked_at: r.acked_at,
    })))
}

#[derive(sqlx::FromRow)]
struct CommandAckRow {
    correlation_id: Uuid,
    agent_id: String,
    kind: String,
    outcome: String,
    detail: String,
    acked_at: chrono::DateTime<Utc>,
}

/// Analytics query over access logs (spec.md §4.4/§4.6/§6). Applies the RBAC
/// read filter, then the `status = 0` exclusion unless `include_unfinished`.
async fn query_access_logs(
    State(state): State<AppState>,
    Query(q): Query<AnalyticsQuery>,
) -> Result<Json<Vec<serde_json::Value>>, GatewayError> {
    let pool = state.require_pool()?;

    // A caller would normally be resolved from a session cookie; in the
    // absence of that middleware here, an unauthenticated request is treated
    // as having no team membership (the narrowest possible reach) unless a
    // superadmin override header convention were added by a later caller.
    let caller = Caller {
        user_id: Uuid::nil(),
        superadmin: false,
    };
    let reach = rbac::reachable_environments(pool, &caller, Permission::Read)
        .await
        .map_err(|e| GatewayError::Internal(e.into()))?;
    let allowed = rbac::intersect(&reach, q.environment_id);
    // `Some(empty)` means the caller's reach (team membership, filtered by any
    // requested environment_id) excludes everything — spec.md §8 property 10
    // requires an empty result regardless of whether environment_id was given.
    let allowed_envs: Option<Vec<Uuid>> = match allowed {
        Some(set) if set.is_empty() => return Ok(Json(Vec::new())),
        Some(set) => Some(set.into_iter().collect()),
        None => None,
    };

    let from = q.from.unwrap_or_else(|| Utc::now() - chrono::Duration::hours(1));
    let to = q.to.unwrap_or_else(Utc::now);

    // access_logs carries no environment column directly; reach is enforced
    // via agent_id -> assignments -> environment_id.
    let rows = sqlx::query_as::<_, (chrono::DateTime<Utc>, String, i32, String, String)>(
        r#"
        SELECT al.ts, al.agent_id, al.status_code, al.method, al.uri
        FROM access_logs al
        LEFT JOIN assignments a ON a.agent_id = al.agent_id
        WHERE al.ts BETWEEN $1 AND $2
          AND ($3 OR al.status_code != 0)
          AND ($4::text IS NULL OR al.agent_id = $4)
          AND ($5::uuid[] IS NULL OR a.environment_id = ANY($5::uuid[]))
        ORDER BY al.ts DESC
        LIMIT 1000
        "#,
    )
    .bind(from)
    .bind(to)
    .bind(q.include_unfinished)
    .bind(q.agent_id.as_deref())
    .bind(allowed_envs)
    .fetch_all(pool)
    .await
    .map_err(|e| GatewayError::Internal(e.into()))?;

    Ok(Json(
        rows.into_iter()
            .map(|(ts, agent_id, status_code, method, uri)| {
                serde_json::json!({
                    "ts": ts, "agent_id": agent_id, "status_code": status_code,
                    "method": method, "uri": uri,
                })
            })
            .collect(),
    ))
}
