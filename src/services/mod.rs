//! Contains Tower services.

mod metrics;

pub use metrics::HttpCallMetricsLayer;
