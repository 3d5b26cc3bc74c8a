//! HTTP API: the agent protocol, the operator surface, and probes
//!
//! Agents talk to the controller exclusively through outbound polling
//! (heartbeat and command-result posts), so they work behind NAT and
//! firewalls. Operators trigger switches, expire poison flags, and activate
//! models through the `/v1` routes; `/healthz`, `/readyz`, and `/metrics`
//! serve the probes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use controller_lib::{
    ComponentStatus, CommandChannel, ControllerMetrics, CoreError, HealthRegistry, Heartbeat,
    Inventory, ModelGate, Pool, RiskLedger, SwitchLog, SwitchOrchestrator, SwitchRequest,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SwitchOrchestrator>,
    pub channel: Arc<CommandChannel>,
    pub ledger: Arc<RiskLedger>,
    pub gate: Arc<ModelGate>,
    pub inventory: Arc<Inventory>,
    pub log: Arc<SwitchLog>,
    pub health_registry: HealthRegistry,
    pub metrics: ControllerMetrics,
}

/// `CoreError` mapped onto an HTTP response with a machine-readable kind
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation(_) | CoreError::InvalidState(_) | CoreError::NoCandidate(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            CoreError::Provider(_) => StatusCode::BAD_GATEWAY,
            CoreError::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct CommandResultRequest {
    pub command_id: String,
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SwitchAccepted {
    pub record_id: String,
    pub chosen_pool: Pool,
}

#[derive(Debug, Deserialize)]
pub struct BatchSwitchRequest {
    pub requests: Vec<SwitchRequest>,
    /// Most members the group may lose at once
    #[serde(default = "default_capacity_ceiling")]
    pub capacity_ceiling: usize,
}

fn default_capacity_ceiling() -> usize {
    1
}

#[derive(Debug, Serialize)]
pub struct BatchSwitchAccepted {
    pub accepted: usize,
    pub capacity_ceiling: usize,
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Json(heartbeat): Json<Heartbeat>,
) -> impl IntoResponse {
    state.metrics.inc_heartbeats();
    let commands = state.channel.handle_heartbeat(heartbeat);
    Json(commands)
}

async fn command_result(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CommandResultRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let command = state
        .channel
        .ack(&request.command_id, request.success, &request.message)?;
    Ok(Json(command))
}

/// Accept a switch, validate it synchronously, and drive it in the
/// background. Conflicts and missing candidates surface immediately.
async fn create_switch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SwitchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let started = state.orchestrator.start(&request)?;
    let accepted = SwitchAccepted {
        record_id: started.record_id().to_string(),
        chosen_pool: started.candidate().pool.clone(),
    };
    info!(
        record_id = %accepted.record_id,
        source_resource_id = %request.source_resource_id,
        "Switch accepted via API"
    );
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        orchestrator.execute(started).await;
    });
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// Switch a group of members in the background, bounded by the capacity
/// ceiling. Per-member outcomes land in the switch log; the response only
/// confirms the batch was taken on.
async fn create_batch_switch(
    State(state): State<Arc<AppState>>,
    Json(batch): Json<BatchSwitchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if batch.requests.is_empty() {
        return Err(CoreError::Validation("batch contains no requests".to_string()).into());
    }
    let accepted = BatchSwitchAccepted {
        accepted: batch.requests.len(),
        capacity_ceiling: batch.capacity_ceiling.max(1),
    };
    info!(
        accepted = accepted.accepted,
        capacity_ceiling = accepted.capacity_ceiling,
        "Batch switch accepted via API"
    );
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        orchestrator
            .run_batch(batch.requests, batch.capacity_ceiling)
            .await;
    });
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn cancel_switch(
    State(state): State<Arc<AppState>>,
    Path(source_resource_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.cancel(&source_resource_id)?;
    Ok(Json(serde_json::json!({ "cancelled": true })))
}

async fn list_switches(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.log.list())
}

async fn list_resources(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.inventory.list())
}

async fn risk_snapshot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.ledger.snapshot())
}

async fn expire_risk(
    State(state): State<Arc<AppState>>,
    Json(pool): Json<Pool>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.ledger.force_expire(&pool) {
        return Err(CoreError::NotFound(format!("no poison flag for {pool}")).into());
    }
    info!(pool = %pool, "Poison flag force-expired via API");
    Ok(Json(serde_json::json!({ "expired": true })))
}

async fn list_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.gate.list())
}

async fn activate_model(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let model = state.gate.set_active_production(&model_id)?;
    info!(model_id = %model_id, version = %model.version, "Model activated via API");
    Ok(Json(model))
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder.encode(&metric_families, &mut buffer).unwrap();

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/agents/heartbeat", post(heartbeat))
        .route("/v1/agents/command-result", post(command_result))
        .route("/v1/switches", post(create_switch).get(list_switches))
        .route("/v1/switches/batch", post(create_batch_switch))
        .route("/v1/switches/:source_id/cancel", post(cancel_switch))
        .route("/v1/resources", get(list_resources))
        .route("/v1/risk", get(risk_snapshot))
        .route("/v1/risk/expire", post(expire_risk))
        .route("/v1/models", get(list_models))
        .route("/v1/models/:model_id/activate", post(activate_model))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
