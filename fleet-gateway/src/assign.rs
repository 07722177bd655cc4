//! Auto-assignment resolver (spec.md §4.6). Generalizes the teacher's
//! relational-lookup idiom (`sqlx::query_as` in `der_headend/src/http.rs`)
//! onto the project/environment/assignment taxonomy.

use chrono::Utc;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

/// Resolves `project`/`environment` labels into an assignment, idempotently
/// (spec.md §8 property 6). Returns the resolved environment id when an
/// assignment exists or was just created; `None` when nothing could be
/// resolved (already logged).
pub async fn resolve(pool: &PgPool, agent_id: &str, labels: &std::collections::HashMap<String, String>) -> Option<Uuid> {
    let project_slug = labels.get("project").filter(|s| !s.is_empty())?;
    let environment_slug = labels.get("environment").filter(|s| !s.is_empty())?;

    // Step 3: an existing assignment is never rebound automatically.
    if let Ok(Some(existing)) = existing_assignment(pool, agent_id).await {
        return Some(existing);
    }

    let project_id: Option<Uuid> = sqlx::query_scalar("SELECT id FROM projects WHERE slug = $1")
        .bind(project_slug)
        .fetch_optional(pool)
        .await
        .ok()
        .flatten();
    let Some(project_id) = project_id else {
        info!(agent_id, project = %project_slug, "auto-assignment: unknown project, skipping");
        return None;
    };

    let environment_id: Option<Uuid> = sqlx::query_scalar(
        "SELECT id FROM environments WHERE project_id = $1 AND slug = $2",
    )
    .bind(project_id)
    .bind(environment_slug)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten();
    let Some(environment_id) = environment_id else {
        info!(agent_id, environment = %environment_slug, "auto-assignment: unknown environment, skipping");
        return None;
    };

    let inserted = sqlx::query(
        r#"
        INSERT INTO assignments (agent_id, environment_id, display_name, tags, assigned_by, assigned_at)
        VALUES ($1, $2, $1, '{}'::jsonb, 'system', $3)
        ON CONFLICT (agent_id) DO NOTHING
        "#,
    )
    .bind(agent_id)
    .bind(environment_id)
    .bind(Utc::now())
    .execute(pool)
    .await;

    match inserted {
        Ok(_) => {
            info!(agent_id, %environment_id, "auto-assignment: assigned");
            Some(environment_id)
        }
        Err(err) => {
            tracing::warn!("auto-assignment insert failed: {err}");
            None
        }
    }
}

async fn existing_assignment(pool: &PgPool, agent_id: &str) -> Result<Option<Uuid>, sqlx::Error> {
    sqlx::query_scalar("SELECT environment_id FROM assignments WHERE agent_id = $1")
        .bind(agent_id)
        .fetch_optional(pool)
        .await
}
