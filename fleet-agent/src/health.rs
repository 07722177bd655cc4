//! Health and management HTTP surfaces (spec.md §6 CLI surface: "health port,
//! management port"). Health reports per-gateway auth state so operators can
//! see a `FatalAuth` endpoint without tailing logs; management exposes a
//! lightweight snapshot of WAB and connection state.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::outbound::GatewayRegistry;
use fleet_wab::Wab;

#[derive(Clone)]
pub struct HealthState {
    pub wab: Arc<Wab>,
    pub registry: GatewayRegistry,
    pub configured_gateways: Vec<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    wab_floor: u64,
    wab_tip: u64,
    wab_drops_total: u64,
    connected_gateways: usize,
    configured_gateways: usize,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/management/status", get(status))
        .with_state(state)
}

async fn health(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        wab_floor: state.wab.floor(),
        wab_tip: state.wab.tip(),
        wab_drops_total: state.wab.drops_total(),
        connected_gateways: state.registry.connected_count().await,
        configured_gateways: state.configured_gateways.len(),
    })
}

async fn status(State(state): State<HealthState>) -> Json<HealthResponse> {
    health(State(state)).await
}
