//! Telemetry resilience core for the Wayfinder services
//!
//! Four layers, composed at startup:
//!
//! - [`registry`]: the process-wide instrument registry and Prometheus
//!   text exposition
//! - [`collector`]: the fire-and-forget recording facade business code
//!   talks to
//! - [`resilience`]: error taxonomy, bounded history and the circuit
//!   breaker guarding the pipeline
//! - [`middleware`]: axum request instrumentation and payment stage
//!   wrappers
//!
//! The guiding rule is that instrumentation must never break the
//! application: every recording path degrades to a no-op under failure.

pub mod collector;
pub mod error;
pub mod labels;
pub mod middleware;
pub mod registry;
pub mod resilience;
pub mod server;

pub use collector::{
    collector_from_config, BusinessSnapshot, Collector, ErrorContext, NullCollector,
    PrometheusCollector,
};
pub use error::{Result, TelemetryError};
pub use labels::{LabelNames, PaymentProvider, PaymentStage};
pub use middleware::{instrument_payment_stage, route_pattern, track_http, TelemetryState};
pub use registry::{MetricDefinition, MetricKind, MetricsRegistry};
pub use resilience::{
    ErrorHandler, ErrorSeverity, ErrorStats, MonitoringError, MonitoringErrorKind,
    ResilienceConfig,
};
pub use server::{serve, MetricsServerConfig};
