//! Integration tests for the controller API endpoints

use axum::{
    body::Body,
    extract::{Path, State},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use controller_lib::{
    health::{components, HealthRegistry},
    CandidateSelector, ChannelConfig, CommandChannel, CommandKind, ComponentStatus, CoreError,
    EnvironmentType, Heartbeat, Inventory, Lifecycle, ManagedResource, ModelGate,
    OrchestratorConfig, Pool, PoolOffer, PriceBook, RiskLedger, SelectorConfig, SwitchLog,
    SwitchOrchestrator, SwitchRequest,
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<SwitchOrchestrator>,
    channel: Arc<CommandChannel>,
    ledger: Arc<RiskLedger>,
    gate: Arc<ModelGate>,
    inventory: Arc<Inventory>,
    log: Arc<SwitchLog>,
    health_registry: HealthRegistry,
}

struct ApiError(CoreError);

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
struct CommandResultRequest {
    command_id: String,
    success: bool,
    #[serde(default)]
    message: String,
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Json(heartbeat): Json<Heartbeat>,
) -> impl IntoResponse {
    Json(state.channel.handle_heartbeat(heartbeat))
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

async fn create_switch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SwitchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let started = state.orchestrator.start(&request)?;
    let accepted = serde_json::json!({
        "record_id": started.record_id(),
        "chosen_pool": started.candidate().pool,
    });
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        orchestrator.execute(started).await;
    });
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

#[derive(Debug, Deserialize)]
struct BatchSwitchRequest {
    requests: Vec<SwitchRequest>,
    #[serde(default = "default_capacity_ceiling")]
    capacity_ceiling: usize,
}

fn default_capacity_ceiling() -> usize {
    1
}

async fn create_batch_switch(
    State(state): State<Arc<AppState>>,
    Json(batch): Json<BatchSwitchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if batch.requests.is_empty() {
        return Err(CoreError::Validation("batch contains no requests".to_string()).into());
    }
    let accepted = serde_json::json!({
        "accepted": batch.requests.len(),
        "capacity_ceiling": batch.capacity_ceiling.max(1),
    });
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        orchestrator
            .run_batch(batch.requests, batch.capacity_ceiling)
            .await;
    });
    Ok((StatusCode::ACCEPTED, Json(accepted)))
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
    Ok(Json(serde_json::json!({ "expired": true })))
}

async fn list_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.gate.list())
}

async fn activate_model(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.gate.set_active_production(&model_id)?))
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;
    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;
    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(readiness))
}

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

fn create_test_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/agents/heartbeat", post(heartbeat))
        .route("/v1/agents/command-result", post(command_result))
        .route("/v1/switches", post(create_switch).get(list_switches))
        .route("/v1/switches/batch", post(create_batch_switch))
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

fn pool() -> Pool {
    Pool::new("us-east-1", "us-east-1a", "m5.large")
}

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let ledger = Arc::new(RiskLedger::new());
    let inventory = Arc::new(Inventory::new());
    let log = Arc::new(SwitchLog::new());
    let book = Arc::new(PriceBook::new());
    let gate = Arc::new(ModelGate::new());
    let executor = Arc::new(controller_lib::MockExecutor::new());

    let stable = PoolOffer {
        pool: Pool::new("us-east-1", "us-east-1b", "m5.large.ondemand"),
        lifecycle: Lifecycle::Stable,
        instance_family: "m5".into(),
        architecture: "x86_64".into(),
        capacity: 10,
    };
    book.record_price(&stable.pool, 0, 0.10);
    book.add_offer(stable);

    let channel = Arc::new(CommandChannel::new(
        ChannelConfig {
            heartbeat_interval: Duration::from_millis(10),
            visibility_timeout: Duration::from_millis(100),
            max_delivery_attempts: 5,
            ack_wait: Duration::from_millis(200),
        },
        ledger.clone(),
        inventory.clone(),
    ));
    let selector = CandidateSelector::new(
        ledger.clone(),
        gate.clone(),
        book.clone(),
        SelectorConfig::default(),
    );
    let orchestrator = Arc::new(SwitchOrchestrator::new(
        selector,
        channel.clone(),
        executor,
        inventory.clone(),
        log.clone(),
        book,
        OrchestratorConfig {
            provision_timeout: Duration::from_millis(100),
            command_timeout: Duration::from_millis(100),
            decommission_grace: Duration::from_millis(10),
            ..OrchestratorConfig::default()
        },
    ));

    let health_registry = HealthRegistry::new();
    health_registry.register(components::RISK_LEDGER).await;
    health_registry.register(components::ORCHESTRATOR).await;

    let state = Arc::new(AppState {
        orchestrator,
        channel,
        ledger,
        gate,
        inventory,
        log,
        health_registry,
    });
    let router = create_test_router(state.clone());

    (router, state)
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_req(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_heartbeat_returns_pending_commands() {
    let (app, state) = setup_test_app().await;
    state.channel.enqueue(
        "agent-1",
        CommandKind::Terminate {
            resource_id: "i-1".into(),
        },
    );

    let response = app
        .oneshot(post_json(
            "/v1/agents/heartbeat",
            serde_json::json!({
                "agent_id": "agent-1",
                "resource_id": "i-1",
                "lifecycle": "interruptible",
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let commands = body_json(response).await;
    assert_eq!(commands.as_array().unwrap().len(), 1);
    assert_eq!(commands[0]["command"], "terminate");
}

#[tokio::test]
async fn test_heartbeat_interruption_poisons_pool() {
    let (app, state) = setup_test_app().await;
    state.inventory.register(ManagedResource::new(
        "i-1",
        pool(),
        Lifecycle::Interruptible,
        "tenant-a",
        EnvironmentType::Production,
    ));

    let response = app
        .oneshot(post_json(
            "/v1/agents/heartbeat",
            serde_json::json!({
                "agent_id": "agent-1",
                "resource_id": "i-1",
                "lifecycle": "interruptible",
                "interruption": {
                    "kind": "termination_notice",
                    "pool": { "region": "us-east-1", "zone": "us-east-1a", "resource_type": "m5.large" },
                    "resource_id": "i-1",
                },
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(state.ledger.is_poisoned(&pool()));
}

#[tokio::test]
async fn test_command_result_ack_is_idempotent() {
    let (app, state) = setup_test_app().await;
    let command = state.channel.enqueue(
        "agent-1",
        CommandKind::Terminate {
            resource_id: "i-1".into(),
        },
    );
    state.channel.poll_commands("agent-1");

    let first = app
        .clone()
        .oneshot(post_json(
            "/v1/agents/command-result",
            serde_json::json!({
                "command_id": command.id,
                "success": true,
                "message": "terminated",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    // Replay with a different body returns the recorded result
    let replay = app
        .oneshot(post_json(
            "/v1/agents/command-result",
            serde_json::json!({
                "command_id": command.id,
                "success": false,
                "message": "something else",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(replay.status(), StatusCode::OK);
    let recorded = body_json(replay).await;
    assert_eq!(recorded["success"], true);
    assert_eq!(recorded["result_message"], "terminated");
}

#[tokio::test]
async fn test_command_result_unknown_returns_404() {
    let (app, _state) = setup_test_app().await;
    let response = app
        .oneshot(post_json(
            "/v1/agents/command-result",
            serde_json::json!({
                "command_id": "ghost",
                "success": true,
                "message": "done",
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn test_create_switch_is_accepted() {
    let (app, state) = setup_test_app().await;
    state.inventory.register(ManagedResource::new(
        "i-src",
        pool(),
        Lifecycle::Interruptible,
        "tenant-a",
        EnvironmentType::Production,
    ));

    let response = app
        .oneshot(post_json(
            "/v1/switches",
            serde_json::json!({
                "source_resource_id": "i-src",
                "variant": { "variant": "single_instance" },
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted = body_json(response).await;
    assert!(accepted["record_id"].is_string());
    assert_eq!(accepted["chosen_pool"]["zone"], "us-east-1b");
}

#[tokio::test]
async fn test_concurrent_switch_returns_409() {
    let (app, state) = setup_test_app().await;
    state.inventory.register(ManagedResource::new(
        "i-src",
        pool(),
        Lifecycle::Interruptible,
        "tenant-a",
        EnvironmentType::Production,
    ));
    // First switch holds the per-resource guard
    let request = SwitchRequest {
        source_resource_id: "i-src".into(),
        constraints: Default::default(),
        variant: controller_lib::SwitchVariant::SingleInstance,
        reason: None,
    };
    let _started = state.orchestrator.start(&request).unwrap();

    let response = app
        .oneshot(post_json(
            "/v1/switches",
            serde_json::json!({
                "source_resource_id": "i-src",
                "variant": { "variant": "single_instance" },
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "conflict");
}

#[tokio::test]
async fn test_batch_switch_is_accepted() {
    let (app, state) = setup_test_app().await;
    for id in ["asg-1", "asg-2"] {
        state.inventory.register(ManagedResource::new(
            id,
            pool(),
            Lifecycle::Interruptible,
            "tenant-a",
            EnvironmentType::Production,
        ));
    }

    let response = app
        .oneshot(post_json(
            "/v1/switches/batch",
            serde_json::json!({
                "requests": [
                    {
                        "source_resource_id": "asg-1",
                        "variant": { "variant": "asg_member", "capacity_ceiling": 1 },
                    },
                    {
                        "source_resource_id": "asg-2",
                        "variant": { "variant": "asg_member", "capacity_ceiling": 1 },
                    },
                ],
                "capacity_ceiling": 1,
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted = body_json(response).await;
    assert_eq!(accepted["accepted"], 2);
    assert_eq!(accepted["capacity_ceiling"], 1);

    // The background batch opens a record per member; with a ceiling of 1
    // the second record only opens once the first switch finishes
    let mut opened = 0;
    for _ in 0..200 {
        opened = state.log.list().len();
        if opened == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(opened, 2);
}

#[tokio::test]
async fn test_empty_batch_switch_returns_422() {
    let (app, _state) = setup_test_app().await;
    let response = app
        .oneshot(post_json(
            "/v1/switches/batch",
            serde_json::json!({ "requests": [] }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "validation");
}

#[tokio::test]
async fn test_switch_unknown_resource_returns_404() {
    let (app, _state) = setup_test_app().await;
    let response = app
        .oneshot(post_json(
            "/v1/switches",
            serde_json::json!({
                "source_resource_id": "i-ghost",
                "variant": { "variant": "single_instance" },
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_risk_expire_clears_poison_flag() {
    let (app, state) = setup_test_app().await;
    state.ledger.mark_poisoned(&pool(), "tenant-a");

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/risk/expire",
            serde_json::json!({
                "region": "us-east-1",
                "zone": "us-east-1a",
                "resource_type": "m5.large",
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(!state.ledger.is_poisoned(&pool()));

    // A second expire finds nothing
    let response = app
        .oneshot(post_json(
            "/v1/risk/expire",
            serde_json::json!({
                "region": "us-east-1",
                "zone": "us-east-1a",
                "resource_type": "m5.large",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_risk_snapshot_lists_poisoned_pools() {
    let (app, state) = setup_test_app().await;
    state.ledger.mark_poisoned(&pool(), "tenant-a");

    let response = app.oneshot(get_req("/v1/risk")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let snapshot = body_json(response).await;
    assert_eq!(snapshot.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_activate_non_graduated_model_returns_422() {
    let (app, state) = setup_test_app().await;
    state.gate.register("risk-model-a", "v1", None);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/models/risk-model-a/activate")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "invalid_state");
}

#[tokio::test]
async fn test_activate_graduated_model_succeeds() {
    let (app, state) = setup_test_app().await;
    state.gate.register("risk-model-a", "v1", None);
    state.gate.graduate("risk-model-a", 0.93).unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/models/risk-model-a/activate")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let model = body_json(response).await;
    assert_eq!(model["is_active_production"], true);
}

#[tokio::test]
async fn test_list_resources_and_switches() {
    let (app, state) = setup_test_app().await;
    state.inventory.register(ManagedResource::new(
        "i-1",
        pool(),
        Lifecycle::Interruptible,
        "tenant-a",
        EnvironmentType::Production,
    ));
    state.log.open("i-1", "tenant-a");

    let resources = app.clone().oneshot(get_req("/v1/resources")).await.unwrap();
    assert_eq!(resources.status(), StatusCode::OK);
    assert_eq!(body_json(resources).await.as_array().unwrap().len(), 1);

    let switches = app.oneshot(get_req("/v1/switches")).await.unwrap();
    assert_eq!(switches.status(), StatusCode::OK);
    let rows = body_json(switches).await;
    assert_eq!(rows[0]["phase_reached"], "initiated");
}

#[tokio::test]
async fn test_healthz_and_readyz() {
    let (app, state) = setup_test_app().await;

    let health = app.clone().oneshot(get_req("/healthz")).await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(body_json(health).await["status"], "healthy");

    // Not ready until marked
    let not_ready = app.clone().oneshot(get_req("/readyz")).await.unwrap();
    assert_eq!(not_ready.status(), StatusCode::SERVICE_UNAVAILABLE);

    state.health_registry.set_ready(true).await;
    let ready = app.oneshot(get_req("/readyz")).await.unwrap();
    assert_eq!(ready.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, _state) = setup_test_app().await;
    // Touch the global registry so the families exist
    let metrics_handle = controller_lib::ControllerMetrics::new();
    metrics_handle.inc_heartbeats();

    let response = app.oneshot(get_req("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("fleet_controller_heartbeats_total"));
    assert!(text.contains("fleet_controller_switch_duration_seconds"));
}
