use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::error::ApiError;
use crate::domain::{Command, CommandOrigin, CommandReceipt, GridState, NetworkTopology};
use crate::gateway::Gateway;
use crate::points::PointMapEntry;
use crate::scan::ScanStats;

pub fn router(state: Arc<Gateway>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(get_status))
        .route("/state", get(get_state))
        .route("/topology", get(get_topology))
        .route("/topology/reload", post(reload_topology))
        .route("/points", get(list_points))
        .route("/commands", post(submit_command))
        .with_state(state)
}

pub async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
pub struct GatewayStatus {
    pub network: String,
    pub epoch: u64,
    pub step: u64,
    pub committed_at: DateTime<Utc>,
    pub stalled: bool,
    pub converged: bool,
    pub points: usize,
    pub pending_commands: usize,
    pub in_flight_commands: usize,
    pub queue_capacity: usize,
    pub scan: ScanStats,
}

pub async fn get_status(State(gw): State<Arc<Gateway>>) -> Json<GatewayStatus> {
    let snapshot = gw.store().current();
    let router = gw.router();
    Json(GatewayStatus {
        network: snapshot.topology.name.clone(),
        epoch: snapshot.epoch,
        step: snapshot.step,
        committed_at: snapshot.committed_at,
        stalled: gw.store().is_stalled(),
        converged: snapshot.state.solve.converged,
        points: snapshot.map.len(),
        pending_commands: router.pending(),
        in_flight_commands: router.in_flight(),
        queue_capacity: router.capacity(),
        scan: gw.scheduler().stats(),
    })
}

/// Last committed network state
pub async fn get_state(State(gw): State<Arc<Gateway>>) -> Json<GridState> {
    Json(gw.store().current().state.clone())
}

pub async fn get_topology(State(gw): State<Arc<Gateway>>) -> Json<NetworkTopology> {
    Json(gw.store().current().topology.as_ref().clone())
}

#[derive(Debug, Serialize)]
pub struct PointView {
    #[serde(flatten)]
    pub entry: PointMapEntry,
    /// Engineering value from the current snapshot
    pub value: Option<f64>,
}

pub async fn list_points(State(gw): State<Arc<Gateway>>) -> Json<Vec<PointView>> {
    let snapshot = gw.store().current();
    let points = snapshot
        .map
        .entries()
        .iter()
        .enumerate()
        .map(|(index, entry)| PointView {
            entry: entry.clone(),
            value: snapshot.image.value(index).filter(|v| v.is_finite()),
        })
        .collect();
    Json(points)
}

/// Queue a command; it is applied on the next scan
pub async fn submit_command(
    State(gw): State<Arc<Gateway>>,
    Json(command): Json<Command>,
) -> Result<(StatusCode, Json<CommandReceipt>), ApiError> {
    let receipt = gw.router().submit(command, CommandOrigin::Api)?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub network: String,
    pub epoch: u64,
    pub points: usize,
}

/// Re-read the configured topology file and swap it in under a new epoch
pub async fn reload_topology(
    State(gw): State<Arc<Gateway>>,
) -> Result<Json<ReloadResponse>, ApiError> {
    let snapshot = tokio::task::spawn_blocking(move || {
        let path = gw.config().engine.topology_path.clone();
        gw.reload_from_path(path)
    })
    .await
    .map_err(|e| ApiError::InternalError(format!("reload task failed: {e}")))??;

    Ok(Json(ReloadResponse {
        network: snapshot.topology.name.clone(),
        epoch: snapshot.epoch,
        points: snapshot.map.len(),
    }))
}
