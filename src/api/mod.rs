pub mod mpesa;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use tracing::{error, info};

use crate::health::{HealthChecker, HealthState, HealthStatus};

pub use mpesa::{mpesa_routes, MpesaState};

/// Full application router: health probes plus the M-Pesa routes.
pub fn build_router(state: MpesaState, health_checker: HealthChecker) -> Router {
    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/health/live", get(liveness))
        .with_state(health_checker);

    Router::new().merge(health_routes).merge(mpesa_routes(state))
}

async fn health(
    State(checker): State<HealthChecker>,
) -> Result<Json<HealthStatus>, (StatusCode, Json<HealthStatus>)> {
    let health_status = checker.check_health().await;

    if health_status.status == HealthState::Unhealthy {
        error!("Health check failed - service unhealthy");
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(health_status)))
    } else {
        info!("Health check passed");
        Ok(Json(health_status))
    }
}

async fn liveness() -> &'static str {
    "OK"
}
