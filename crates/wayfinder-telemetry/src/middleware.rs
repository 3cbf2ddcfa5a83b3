//! Request and payment instrumentation
//!
//! `track_http` wraps the axum request pipeline: excluded paths pass through
//! untouched, everything else is timed and recorded under a normalized route
//! pattern so path parameters do not explode label cardinality.
//!
//! `instrument_payment_stage` wraps payment operations with try/finally
//! semantics: the outcome is recorded whether the operation succeeds or
//! fails, and the caller's result passes through unchanged.

use crate::collector::Collector;
use crate::labels::{PaymentProvider, PaymentStage};
use crate::resilience::{ErrorHandler, MonitoringErrorKind};
use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;
use wayfinder_config::MonitoringConfig;

/// Shared state threaded through the instrumentation layer
#[derive(Clone)]
pub struct TelemetryState {
    pub collector: Arc<dyn Collector>,
    pub handler: Arc<ErrorHandler>,
    pub config: Arc<MonitoringConfig>,
}

impl TelemetryState {
    pub fn new(
        collector: Arc<dyn Collector>,
        handler: Arc<ErrorHandler>,
        config: Arc<MonitoringConfig>,
    ) -> Self {
        Self {
            collector,
            handler,
            config,
        }
    }
}

/// Axum middleware recording one counter increment and one duration
/// observation per completed request. Install with
/// `axum::middleware::from_fn_with_state`.
pub async fn track_http(
    State(state): State<TelemetryState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.config.enabled || !state.config.metrics.http.enabled {
        return next.run(request).await;
    }

    let path = request.uri().path().to_string();
    if is_excluded(&path, &state.config.metrics.http.exclude_paths) {
        return next.run(request).await;
    }

    let method = request.method().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    let duration = started.elapsed().as_secs_f64();
    let status = response.status().as_u16();
    let route = route_pattern(&path);

    let collector = state.collector.clone();
    state.handler.safe_execute(
        MonitoringErrorKind::MetricsCollectionFailed,
        json!({"route": &route, "method": &method}),
        (),
        || {
            collector.record_http_request(&method, &route, status, duration, None);
            Ok(())
        },
    );

    response
}

fn is_excluded(path: &str, exclude: &[String]) -> bool {
    exclude.iter().any(|prefix| path.starts_with(prefix.as_str()))
}

/// Collapse path parameters into stable placeholders so each logical route
/// yields one label value.
pub fn route_pattern(path: &str) -> String {
    let path = path.split('?').next().unwrap_or(path);
    let segments: Vec<String> = path
        .split('/')
        .map(|segment| normalize_segment(segment).to_string())
        .collect();
    segments.join("/")
}

fn normalize_segment(segment: &str) -> String {
    if segment.is_empty() {
        return String::new();
    }
    if segment.chars().all(|c| c.is_ascii_digit()) {
        return ":id".to_string();
    }
    if Uuid::parse_str(segment).is_ok() {
        return ":uuid".to_string();
    }
    if segment.len() == 24 && segment.chars().all(|c| c.is_ascii_hexdigit()) {
        return ":objectId".to_string();
    }
    if let Some((_, ext)) = segment.rsplit_once('.') {
        if matches!(ext, "json" | "xml" | "csv") {
            return format!(":file.{ext}");
        }
    }
    segment.to_string()
}

/// Wrap one payment operation, recording its duration and outcome. The
/// provider is extracted from the request path, body or query string; if
/// none can be found the operation runs unrecorded.
pub async fn instrument_payment_stage<T, E, Fut>(
    state: &TelemetryState,
    stage: PaymentStage,
    path: &str,
    body: Option<&Value>,
    query: Option<&str>,
    op: impl FnOnce() -> Fut,
) -> Result<T, E>
where
    E: std::fmt::Display,
    Fut: Future<Output = Result<T, E>>,
{
    let enabled = state.config.enabled && state.config.metrics.payment.enabled;
    let provider = extract_provider(path, body, query);

    let provider = match (enabled, provider) {
        (true, Some(provider)) => provider,
        _ => {
            if enabled {
                debug!(path, "no payment provider recognized, stage not recorded");
            }
            return op().await;
        }
    };

    let started = Instant::now();
    let result = op().await;
    let duration = started.elapsed().as_secs_f64();

    let (success, error_type) = match &result {
        Ok(_) => (true, None),
        Err(e) => (false, Some(short_type_name::<E>(e))),
    };

    let collector = state.collector.clone();
    state.handler.safe_execute(
        MonitoringErrorKind::MetricsCollectionFailed,
        json!({"stage": stage.as_str(), "provider": provider.as_str()}),
        (),
        || {
            collector.record_payment_event(
                stage,
                provider,
                duration,
                success,
                error_type.as_deref(),
            );
            Ok(())
        },
    );

    result
}

/// Last path component of the error's type name, e.g. `NetworkError` for
/// `payments::gateway::NetworkError`.
fn short_type_name<E>(_err: &E) -> String {
    let full = std::any::type_name::<E>();
    full.rsplit("::").next().unwrap_or(full).to_string()
}

/// Provider detection order: request path, then body fields, then query
/// string pairs.
pub fn extract_provider(
    path: &str,
    body: Option<&Value>,
    query: Option<&str>,
) -> Option<PaymentProvider> {
    if let Some(provider) = PaymentProvider::from_token(path) {
        return Some(provider);
    }

    if let Some(body) = body {
        for field in ["provider", "payment_method", "paymentMethod"] {
            if let Some(value) = body.get(field).and_then(Value::as_str) {
                if let Some(provider) = PaymentProvider::from_token(value) {
                    return Some(provider);
                }
            }
        }
    }

    if let Some(query) = query {
        for pair in query.split('&') {
            let value = pair.split_once('=').map(|(_, v)| v).unwrap_or(pair);
            if let Some(provider) = PaymentProvider::from_token(value) {
                return Some(provider);
            }
        }
    }

    None
}
