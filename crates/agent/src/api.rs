//! HTTP API for the tower engine, health checks and Prometheus metrics

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use trace_engine::{
    health::components, ComponentStatus, EngineError, EngineResult,
    HealthRegistry, IssueType, OperatingMode, RemediationFilter, TowerNetwork,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub network: Arc<TowerNetwork>,
    pub health_registry: HealthRegistry,
}

impl AppState {
    pub fn new(network: Arc<TowerNetwork>, health_registry: HealthRegistry) -> Self {
        Self {
            network,
            health_registry,
        }
    }

    /// Report an engine call's outcome on `component` and convert its error
    async fn track<T>(&self, component: &str, result: EngineResult<T>) -> Result<T, ApiError> {
        self.health_registry.observe(component, &result).await;
        result.map_err(ApiError)
    }
}

/// JSON error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

/// Engine error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::UnknownTower(_) | EngineError::RemediationNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            EngineError::InvalidIssueType(_) | EngineError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            EngineError::PolicyViolation(_) | EngineError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            EngineError::PersistenceTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, code = self.0.code(), "Request failed");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            code: self.0.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectRequest {
    pub target_tower_id: String,
    pub connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealRequest {
    pub issue_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproveRequest {
    pub approver: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRequest {
    #[serde(default = "default_rollback_reason")]
    pub reason: String,
}

fn default_rollback_reason() -> String {
    "operator request".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulateRequest {
    pub load_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerModeRequest {
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitsRequest {
    pub units: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssuesQuery {
    pub tower_id: Option<String>,
}

/// Health check: 200 unless a component is unhealthy
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

async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn list_towers(State(state): State<Arc<AppState>>) -> ApiResult<impl Serialize> {
    let result = state.network.get_all_tower_states().await;
    Ok(Json(state.track(components::REPOSITORY, result).await?))
}

async fn get_tower(
    State(state): State<Arc<AppState>>,
    Path(tower_id): Path<String>,
) -> ApiResult<impl Serialize> {
    let result = state.network.get_tower_state(&tower_id).await;
    Ok(Json(state.track(components::REPOSITORY, result).await?))
}

async fn analyze_tower(
    State(state): State<Arc<AppState>>,
    Path(tower_id): Path<String>,
) -> ApiResult<impl Serialize> {
    let result = state.network.analyze_traffic(&tower_id).await;
    Ok(Json(state.track(components::REPOSITORY, result).await?))
}

async fn plan_redistribution(
    State(state): State<Arc<AppState>>,
    Path(tower_id): Path<String>,
) -> ApiResult<impl Serialize> {
    let result = state.network.calculate_redistribution(&tower_id).await;
    Ok(Json(state.track(components::REPOSITORY, result).await?))
}

async fn redirect_traffic(
    State(state): State<Arc<AppState>>,
    Path(tower_id): Path<String>,
    Json(req): Json<RedirectRequest>,
) -> ApiResult<impl Serialize> {
    let result = state
        .network
        .execute_traffic_redirect(&tower_id, &req.target_tower_id, req.connections)
        .await;
    Ok(Json(state.track(components::REPOSITORY, result).await?))
}

async fn detect_issues(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IssuesQuery>,
) -> ApiResult<impl Serialize> {
    let result = state.network.detect_issues(query.tower_id.as_deref()).await;
    Ok(Json(state.track(components::DETECTOR, result).await?))
}

async fn heal_tower(
    State(state): State<Arc<AppState>>,
    Path(tower_id): Path<String>,
    Json(req): Json<HealRequest>,
) -> ApiResult<impl Serialize> {
    let issue_type: IssueType = req.issue_type.parse()?;
    info!(tower_id = %tower_id, issue_type = %issue_type, "Self-healing requested");
    let result = state
        .network
        .execute_self_healing(&tower_id, issue_type)
        .await;
    Ok(Json(state.track(components::LEDGER, result).await?))
}

async fn list_remediations(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<RemediationFilter>,
) -> ApiResult<impl Serialize> {
    Ok(Json(state.network.list_remediations(&filter).await))
}

async fn get_remediation(
    State(state): State<Arc<AppState>>,
    Path(remediation_id): Path<String>,
) -> ApiResult<impl Serialize> {
    let result = state.network.get_healing_status(&remediation_id).await;
    Ok(Json(state.track(components::LEDGER, result).await?))
}

async fn approve_remediation(
    State(state): State<Arc<AppState>>,
    Path(remediation_id): Path<String>,
    Json(req): Json<ApproveRequest>,
) -> ApiResult<impl Serialize> {
    let result = state
        .network
        .approve_remediation(&remediation_id, &req.approver)
        .await;
    Ok(Json(state.track(components::LEDGER, result).await?))
}

async fn rollback_remediation(
    State(state): State<Arc<AppState>>,
    Path(remediation_id): Path<String>,
    Json(req): Json<RollbackRequest>,
) -> ApiResult<impl Serialize> {
    let result = state
        .network
        .rollback_remediation(&remediation_id, &req.reason)
        .await;
    Ok(Json(state.track(components::LEDGER, result).await?))
}

async fn simulate_congestion(
    State(state): State<Arc<AppState>>,
    Path(tower_id): Path<String>,
    Json(req): Json<SimulateRequest>,
) -> ApiResult<impl Serialize> {
    let result = state
        .network
        .simulate_congestion(&tower_id, req.load_percent)
        .await;
    Ok(Json(state.track(components::REPOSITORY, result).await?))
}

async fn reset_network(State(state): State<Arc<AppState>>) -> ApiResult<impl Serialize> {
    let result = state.network.reset_network().await;
    Ok(Json(state.track(components::REPOSITORY, result).await?))
}

async fn network_summary(State(state): State<Arc<AppState>>) -> ApiResult<impl Serialize> {
    let result = state.network.network_health_summary().await;
    Ok(Json(state.track(components::REPOSITORY, result).await?))
}

async fn energy_recommendations(State(state): State<Arc<AppState>>) -> ApiResult<impl Serialize> {
    let result = state.network.energy_recommendations().await;
    Ok(Json(state.track(components::REPOSITORY, result).await?))
}

async fn optimize_energy(
    State(state): State<Arc<AppState>>,
    Path(tower_id): Path<String>,
) -> ApiResult<impl Serialize> {
    let result = state.network.execute_energy_optimization(&tower_id).await;
    Ok(Json(state.track(components::REPOSITORY, result).await?))
}

async fn set_power_mode(
    State(state): State<Arc<AppState>>,
    Path(tower_id): Path<String>,
    Json(req): Json<PowerModeRequest>,
) -> ApiResult<impl Serialize> {
    let mode: OperatingMode = req
        .mode
        .parse()
        .map_err(|e: String| ApiError(EngineError::InvalidRequest(e)))?;
    let result = state.network.set_power_mode(&tower_id, mode).await;
    Ok(Json(state.track(components::REPOSITORY, result).await?))
}

async fn set_active_units(
    State(state): State<Arc<AppState>>,
    Path(tower_id): Path<String>,
    Json(req): Json<UnitsRequest>,
) -> ApiResult<impl Serialize> {
    let result = state.network.set_active_units(&tower_id, req.units).await;
    Ok(Json(state.track(components::REPOSITORY, result).await?))
}

async fn activate_warm_spare(
    State(state): State<Arc<AppState>>,
    Path(tower_id): Path<String>,
) -> ApiResult<impl Serialize> {
    let result = state.network.activate_warm_spare(&tower_id).await;
    Ok(Json(state.track(components::REPOSITORY, result).await?))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/towers", get(list_towers))
        .route("/api/v1/towers/:tower_id", get(get_tower))
        .route("/api/v1/towers/:tower_id/analysis", get(analyze_tower))
        .route(
            "/api/v1/towers/:tower_id/redistribution",
            get(plan_redistribution),
        )
        .route("/api/v1/towers/:tower_id/redirect", post(redirect_traffic))
        .route("/api/v1/towers/:tower_id/heal", post(heal_tower))
        .route("/api/v1/towers/:tower_id/simulate", post(simulate_congestion))
        .route(
            "/api/v1/towers/:tower_id/energy/optimize",
            post(optimize_energy),
        )
        .route("/api/v1/towers/:tower_id/power-mode", post(set_power_mode))
        .route("/api/v1/towers/:tower_id/units", post(set_active_units))
        .route(
            "/api/v1/towers/:tower_id/warm-spare",
            post(activate_warm_spare),
        )
        .route("/api/v1/issues", get(detect_issues))
        .route("/api/v1/remediations", get(list_remediations))
        .route("/api/v1/remediations/:remediation_id", get(get_remediation))
        .route(
            "/api/v1/remediations/:remediation_id/approve",
            post(approve_remediation),
        )
        .route(
            "/api/v1/remediations/:remediation_id/rollback",
            post(rollback_remediation),
        )
        .route("/api/v1/network/reset", post(reset_network))
        .route("/api/v1/network/summary", get(network_summary))
        .route("/api/v1/energy/recommendations", get(energy_recommendations))
        .with_state(state)
}

/// Serve the API until `shutdown` completes
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
