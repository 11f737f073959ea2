//! Contains the `/health` endpoint filter.

use crate::health::HealthState;
use crate::AppState;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, MethodRouter};
use axum::Router;

/// Defines a type of health check.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HealthCheck {
    /// A Kubernetes startup probe.
    Startup,
    /// A Kubernetes readiness probe.
    Readiness,
    /// A Kubernetes liveliness probe.
    Liveness,
    /// A full health check.
    Full(HealthCheckFormat),
}

/// Defines a specific type of format representation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HealthCheckFormat {
    Compact,
    Complex,
}

pub trait HealthRoutes {
    /// Provides an API for initiating health checks.
    ///
    /// For readiness probes (compact output):
    ///
    /// ```http
    /// GET /readyz HTTP/1.1
    /// ```
    ///
    /// For liveness probes (compact output):
    ///
    /// ```http
    /// GET /livez HTTP/1.1
    /// ```
    ///
    /// For combined health probes (compact output):
    ///
    /// ```http
    /// GET /health HTTP/1.1
    /// ```
    ///
    /// For combined health probes in human-readable output:
    ///
    /// ```http
    /// GET /healthz HTTP/1.1
    /// ```
    fn map_health_endpoints(self) -> Self;
}

impl HealthRoutes for Router<AppState> {
    fn map_health_endpoints(self) -> Self {
        // Ensure HttpCallMetricTracker is updated.
        self.route(
            "/health",
            health_endpoint(HealthCheck::Full(HealthCheckFormat::Compact)),
        )
        .route("/startupz", health_endpoint(HealthCheck::Startup))
        .route("/readyz", health_endpoint(HealthCheck::Readiness))
        .route("/livez", health_endpoint(HealthCheck::Liveness))
        .route(
            "/healthz",
            health_endpoint(HealthCheck::Full(HealthCheckFormat::Complex)),
        )
    }
}

/// Builds a health handler.
///
/// ## Arguments
/// * `checks` - The type of health check to run on that path.
fn health_endpoint(checks: HealthCheck) -> MethodRouter<AppState> {
    get(move |State(state): State<AppState>| handle_health(state, checks))
}

/// Performs a health check.
///
/// ```http
/// GET /health
/// ```
async fn handle_health(state: AppState, checks: HealthCheck) -> Response {
    match checks {
        // The process answering is all a liveness probe wants to know.
        HealthCheck::Startup | HealthCheck::Liveness => HealthState::Healthy.into_response(),
        HealthCheck::Readiness | HealthCheck::Full(HealthCheckFormat::Compact) => {
            HealthState::of_storage(&state.coordinator)
                .await
                .into_response()
        }
        HealthCheck::Full(HealthCheckFormat::Complex) => {
            let storage = HealthState::of_storage(&state.coordinator).await;
            let report = format!("{storage}\nstorage: {storage}\n");
            (storage.status_code(), report).into_response()
        }
    }
}

impl IntoResponse for HealthState {
    fn into_response(self) -> Response {
        (self.status_code(), format!("{}", self)).into_response()
    }
}
