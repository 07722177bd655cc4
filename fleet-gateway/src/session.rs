//! Session table: generalizes `der_headend/src/grpc.rs`'s `AgentStream` map
//! into spec.md §3's `Session`. Single read-mostly lock (spec.md §5), one
//! entry per connected agent, single-active-session-per-agent eviction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_proto::proto::GatewayEnvelope;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Session {
    pub agent_id: String,
    pub hostname: String,
    pub agent_version: String,
    pub build_commit: String,
    pub build_branch: String,
    pub build_date: String,
    pub containerized: bool,
    pub psk_authenticated: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub environment_id: Option<Uuid>,
    pub labels: HashMap<String, String>,
    pub established_at: DateTime<Utc>,
    #[allow(dead_code)]
    pub peer: String,
    pub tx: mpsc::Sender<GatewayEnvelope>,
}

/// Shared, read-mostly table of live sessions keyed by agent id.
#[derive(Clone, Default)]
pub struct SessionTable {
    inner: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a session, evicting and closing any existing one for the same
    /// agent id first (spec.md §4.3: single-active-session per agent).
    pub async fn install(&self, session: Session) {
        let mut guard = self.inner.write().await;
        if let Some(old) = guard.remove(&session.agent_id) {
            warn!(agent_id = %session.agent_id, "evicting existing session on reconnect");
            drop(old.tx); // closes the old outbound channel, ending its drain task
        }
        guard.insert(session.agent_id.clone(), session);
    }

    pub async fn remove(&self, agent_id: &str) -> Option<Session> {
        self.inner.write().await.remove(agent_id)
    }

    pub async fn touch_heartbeat(&self, agent_id: &str, at: DateTime<Utc>, labels: HashMap<String, String>) {
        if let Some(session) = self.inner.write().await.get_mut(agent_id) {
            session.last_heartbeat = at;
            session.labels = labels;
        }
    }

    pub async fn set_environment(&self, agent_id: &str, environment_id: Uuid) {
        if let Some(session) = self.inner.write().await.get_mut(agent_id) {
            session.environment_id = Some(environment_id);
        }
    }

    pub async fn get_sender(&self, agent_id: &str) -> Option<mpsc::Sender<GatewayEnvelope>> {
        self.inner.read().await.get(agent_id).map(|s| s.tx.clone())
    }

    pub async fn is_online(&self, agent_id: &str) -> bool {
        self.inner.read().await.contains_key(agent_id)
    }

    pub async fn snapshot(&self) -> Vec<Session> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// Background sweeper (spec.md §4.3, §8 property 4): once per `reap_interval`,
/// remove any session idle longer than `idle_timeout`. A dedicated task
/// avoids per-session timer churn (spec.md §9).
pub async fn run_reaper(table: SessionTable, reap_interval: Duration, idle_timeout: chrono::Duration) {
    let mut ticker = tokio::time::interval(reap_interval);
    loop {
        ticker.tick().await;
        let now = Utc::now();
        let stale: Vec<String> = table
            .snapshot()
            .await
            .into_iter()
            .filter(|s| now - s.last_heartbeat > idle_timeout)
            .map(|s| s.agent_id)
            .collect();
        for agent_id in stale {
            if table.remove(&agent_id).await.is_some() {
                info!(agent_id, "reaped idle session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_session(agent_id: &str, last_heartbeat: DateTime<Utc>) -> Session {
        let (tx, _rx) = mpsc::channel(1);
        Session {
            agent_id: agent_id.to_string(),
            hostname: "host".into(),
            agent_version: "1.0.0".into(),
            build_commit: String::new(),
            build_branch: String::new(),
            build_date: String::new(),
            containerized: false,
            psk_authenticated: true,
            last_heartbeat,
            environment_id: None,
            labels: HashMap::new(),
            established_at: Utc::now(),
            peer: "127.0.0.1:1234".into(),
            tx,
        }
    }

    #[tokio::test]
    async fn reconnect_evicts_the_older_session() {
        let table = SessionTable::new();
        table.install(dummy_session("a1", Utc::now())).await;
        table.install(dummy_session("a1", Utc::now())).await;
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn session_idle_past_timeout_is_reaped() {
        // Property 4 (spec.md §8): idle-past-timeout is removed, fresh is kept.
        let table = SessionTable::new();
        let idle_timeout = chrono::Duration::seconds(3);
        table.install(dummy_session("stale", Utc::now() - chrono::Duration::seconds(10))).await;
        table.install(dummy_session("fresh", Utc::now())).await;

        let now = Utc::now();
        let stale: Vec<String> = table
            .snapshot()
            .await
            .into_iter()
            .filter(|s| now - s.last_heartbeat > idle_timeout)
            .map(|s| s.agent_id)
            .collect();
        for agent_id in &stale {
            table.remove(agent_id).await;
        }

        assert_eq!(stale, vec!["stale".to_string()]);
        assert!(table.is_online("fresh").await);
        assert!(!table.is_online("stale").await);
    }
}
