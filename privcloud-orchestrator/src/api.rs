use crate::driver::ProvisioningDriver;
use axum::http::StatusCode;
use axum::{
    extract::State,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use privcloud_common::ProvisioningError;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_TIMEOUT_SECS: u64 = 600;

pub struct AppState {
    pub driver: Arc<ProvisioningDriver>,
}

impl AppState {
    pub fn new(driver: Arc<ProvisioningDriver>) -> Arc<Self> {
        Arc::new(Self { driver })
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct FleetRequest {
    pub timeout_secs: Option<u64>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ProvisionMachineRequest {
    pub location_id: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Deserialize, Debug)]
pub struct TerminateMachineRequest {
    pub address: String,
    pub timeout_secs: Option<u64>,
}

fn deadline(timeout_secs: Option<u64>) -> Instant {
    Instant::now() + Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
}

pub fn status_for(err: &ProvisioningError) -> StatusCode {
    match err {
        ProvisioningError::InvalidDuration | ProvisioningError::Configuration { .. } => {
            StatusCode::BAD_REQUEST
        }
        ProvisioningError::AlreadyProvisioned { .. } => StatusCode::CONFLICT,
        ProvisioningError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ProvisioningError::RemoteCallFailure { .. } | ProvisioningError::UnexpectedResponse { .. } => {
            StatusCode::BAD_GATEWAY
        }
        ProvisioningError::DriverClosed | ProvisioningError::NameSpaceExhausted { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ProvisioningError::UnexpectedTerminalState { .. }
        | ProvisioningError::PartialFleetFailure { .. }
        | ProvisioningError::Bootstrap { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub struct ApiError(pub ProvisioningError);

impl From<ProvisioningError> for ApiError {
    fn from(err: ProvisioningError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let mut body = json!({
            "error": self.0.code(),
            "message": self.0.to_string(),
        });
        if let ProvisioningError::PartialFleetFailure {
            failure_count,
            total_count,
            cleanup_errors,
            ..
        } = &self.0
        {
            body["failure_count"] = json!(failure_count);
            body["total_count"] = json!(total_count);
            body["cleanup_errors"] = json!(cleanup_errors);
        }
        if status.is_server_error() {
            tracing::error!("❌ [api] {}: {}", self.0.code(), self.0);
        }
        (status, Json(body)).into_response()
    }
}

async fn root(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let settings = state.driver.settings();
    Json(json!({
        "service": "privcloud-orchestrator",
        "management_group": settings.management_group,
        "management_machines": settings.management_machines,
        "closed": state.driver.is_closed(),
    }))
}

async fn list_fleet(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let machines = state.driver.list_management_fleet().await?;
    Ok(Json(machines).into_response())
}

async fn provision_fleet(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FleetRequest>,
) -> Result<Response, ApiError> {
    let machines = state
        .driver
        .provision_management_fleet(deadline(req.timeout_secs))
        .await?;
    Ok((StatusCode::CREATED, Json(machines)).into_response())
}

async fn terminate_fleet(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let terminated = state.driver.terminate_management_fleet().await?;
    Ok(Json(json!({ "terminated": terminated })).into_response())
}

async fn provision_machine(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProvisionMachineRequest>,
) -> Result<Response, ApiError> {
    let machine = state
        .driver
        .provision_one(req.location_id.as_deref(), deadline(req.timeout_secs))
        .await?;
    Ok((StatusCode::CREATED, Json(machine)).into_response())
}

async fn terminate_machine(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TerminateMachineRequest>,
) -> Result<Response, ApiError> {
    let terminated = state
        .driver
        .terminate_one(&req.address, deadline(req.timeout_secs))
        .await?;
    Ok(Json(json!({ "address": req.address, "terminated": terminated })).into_response())
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route(
            "/fleet",
            get(list_fleet).post(provision_fleet).delete(terminate_fleet),
        )
        .route("/machines", post(provision_machine))
        .route("/machines/terminate", post(terminate_machine))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_4xx() {
        assert_eq!(status_for(&ProvisioningError::InvalidDuration), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&ProvisioningError::AlreadyProvisioned {
                group: "g".into(),
                descriptions: String::new()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&ProvisioningError::timeout("await_running", "i-1")),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
