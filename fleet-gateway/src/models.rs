//! Row and view types shared between `db`, `assign`, `rbac`, and `http`
//! (spec.md §3). Mirrors the teacher's `der_headend/src/models.rs` split
//! between `FromRow` query rows and plain `Serialize` response views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ProjectRow {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewProject {
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct EnvironmentRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub slug: String,
    pub color: String,
    pub sort_index: i32,
    pub is_production: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewEnvironment {
    pub slug: String,
    pub color: String,
    pub sort_index: i32,
    pub is_production: bool,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AssignmentRow {
    pub agent_id: String,
    pub environment_id: Uuid,
    pub display_name: String,
    pub tags: serde_json::Value,
    pub assigned_by: String,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TeamRow {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTeam {
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Operate,
    Admin,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TeamProjectAccessRow {
    pub team_id: Uuid,
    pub project_id: Uuid,
    pub permission: String,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub username: String,
    pub superadmin: bool,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AlertRuleRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub expression: String,
    pub severity: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewAlertRule {
    pub project_id: Uuid,
    pub name: String,
    pub expression: String,
    pub severity: String,
}

/// What the session manager exposes about each connected agent for the
/// admin "list agents" endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AgentView {
    pub agent_id: String,
    pub hostname: String,
    pub agent_version: String,
    pub containerized: bool,
    pub psk_authenticated: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub environment_id: Option<Uuid>,
    pub labels: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandAckView {
    pub correlation_id: Uuid,
    pub agent_id: String,
    pub kind: String,
    pub outcome: String,
    pub detail: String,
    pub acked_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyticsQuery {
    pub window: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub agent_id: Option<String>,
    pub project_id: Option<Uuid>,
    pub environment_id: Option<Uuid>,
    pub timezone: Option<String>,
    #[serde(default)]
    pub include_unfinished: bool,
}
