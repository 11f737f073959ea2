use crate::upload::UploadCoordinator;
use axum::http::StatusCode;
use std::fmt::{Display, Formatter};
use tracing::warn;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HealthState {
    Healthy,
    Failed,
}

impl HealthState {
    /// Probes the chunk and artifact storage.
    pub async fn of_storage(coordinator: &UploadCoordinator) -> Self {
        match coordinator.probe().await {
            Ok(()) => HealthState::Healthy,
            Err(e) => {
                warn!("Storage is unavailable: {error}", error = e);
                HealthState::Failed
            }
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            HealthState::Healthy => StatusCode::OK,
            HealthState::Failed => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl Display for HealthState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "Healthy"),
            HealthState::Failed => write!(f, "Failed"),
        }
    }
}
