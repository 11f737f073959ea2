//! Contains the HTTP endpoints.

mod chunks;
mod health;
mod metrics;
mod shutdown;

pub use chunks::ChunkRoutes;
pub use health::HealthRoutes;
pub use metrics::MetricsRoutes;
pub use shutdown::ShutdownRoutes;
