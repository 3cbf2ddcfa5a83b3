//! Error types for the telemetry subsystem

use thiserror::Error;

/// Errors produced by the registry and exposition server.
///
/// None of these ever reach business code: the collector facade and the
/// middleware swallow them through the resilience handler.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("unknown metric: {0}")]
    UnknownMetric(String),

    #[error("invalid label set for {metric}: expected {expected} values, got {got}")]
    InvalidLabels {
        metric: String,
        expected: usize,
        got: usize,
    },

    #[error("metric {metric} is a {registered}, not a {requested}")]
    KindMismatch {
        metric: String,
        registered: &'static str,
        requested: &'static str,
    },

    #[error("metric encoding error: {0}")]
    Encoding(String),

    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("failed to start metrics server: {0}")]
    ServerStart(String),
}

pub type Result<T> = std::result::Result<T, TelemetryError>;
