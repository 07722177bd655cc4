//! Registry of live per-gateway outbound senders, so the single command
//! executor can route an acknowledgement back to whichever gateway enqueued
//! the command (spec.md §4.5: "sent back on the same stream"). Mirrors
//! `fleet-gateway::session::SessionTable`'s read-mostly map, just keyed by
//! gateway address instead of agent id.

use std::collections::HashMap;
use std::sync::Arc;

use fleet_proto::proto::AgentEnvelope;
use tokio::sync::{mpsc, RwLock};

#[derive(Clone, Default)]
pub struct GatewayRegistry {
    inner: Arc<RwLock<HashMap<String, mpsc::Sender<AgentEnvelope>>>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, gateway: &str, tx: mpsc::Sender<AgentEnvelope>) {
        self.inner.write().await.insert(gateway.to_string(), tx);
    }

    pub async fn unregister(&self, gateway: &str) {
        self.inner.write().await.remove(gateway);
    }

    pub async fn get(&self, gateway: &str) -> Option<mpsc::Sender<AgentEnvelope>> {
        self.inner.read().await.get(gateway).cloned()
    }

    pub async fn connected_count(&self) -> usize {
        self.inner.read().await.len()
    }
}
