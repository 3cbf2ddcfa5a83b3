//! HTTP exposition and health endpoints
//!
//! Serves the Prometheus text format on `/metrics`, a diagnostic health
//! document on `/health` and a readiness verdict on `/ready`. The server
//! runs on its own port, separate from the application router.

use crate::error::{Result, TelemetryError};
use crate::registry::MetricsRegistry;
use crate::resilience::{ErrorHandler, MonitoringErrorKind};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 9090,
        }
    }
}

#[derive(Clone)]
struct ServerState {
    registry: Arc<MetricsRegistry>,
    handler: Arc<ErrorHandler>,
    started: Instant,
}

/// Build the exposition router. Split out from [`serve`] so tests can drive
/// it without binding a socket.
pub fn router(registry: Arc<MetricsRegistry>, handler: Arc<ErrorHandler>) -> Router {
    let state = ServerState {
        registry,
        handler,
        started: Instant::now(),
    };
    Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state)
}

/// Bind and run the exposition server until the process exits.
pub async fn serve(
    config: MetricsServerConfig,
    registry: Arc<MetricsRegistry>,
    handler: Arc<ErrorHandler>,
) -> Result<()> {
    let address = format!("{}:{}", config.bind_address, config.port);
    let listener =
        tokio::net::TcpListener::bind(&address)
            .await
            .map_err(|source| TelemetryError::Bind {
                address: address.clone(),
                source,
            })?;
    info!(%address, "metrics server listening");

    axum::serve(listener, router(registry, handler))
        .await
        .map_err(|e| TelemetryError::ServerStart(e.to_string()))
}

async fn metrics(State(state): State<ServerState>) -> Response {
    let registry = state.registry.clone();
    let body = state.handler.safe_execute(
        MonitoringErrorKind::MetricsCollectionFailed,
        json!({"endpoint": "/metrics"}),
        String::new(),
        || registry.encode().map_err(anyhow::Error::from),
    );

    ([(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], body).into_response()
}

/// Diagnostic document. Always responds 200 so dashboards can read the
/// degraded state; use `/ready` for gating traffic.
async fn health(State(state): State<ServerState>) -> Response {
    let stats = state.handler.error_stats();
    let healthy = state.handler.is_healthy();

    Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "uptime_seconds": state.started.elapsed().as_secs(),
        "errors": {
            "total": stats.total,
            "error_rate": stats.error_rate,
            "breaker_open": stats.breaker_open,
        },
    }))
    .into_response()
}

async fn ready(State(state): State<ServerState>) -> Response {
    if state.handler.is_healthy() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::ErrorSeverity;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use wayfinder_config::MonitoringConfig;

    fn fixture() -> (Router, Arc<MetricsRegistry>, Arc<ErrorHandler>) {
        let registry = Arc::new(MetricsRegistry::new(MonitoringConfig::default()));
        registry.initialize();
        let handler = ErrorHandler::shared();
        let app = router(registry.clone(), handler.clone());
        (app, registry, handler)
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_exposition_format() {
        let (app, registry, _) = fixture();
        registry.inc_counter(
            crate::registry::names::HTTP_REQUESTS,
            &["GET", "/api/trips", "200", "wayfinder"],
        )
        .unwrap();

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            EXPOSITION_CONTENT_TYPE
        );
        let text = body_text(response).await;
        assert!(text.contains("http_requests_total{"));
        assert!(text.ends_with("# EOF\n") || text.contains("# TYPE"));
    }

    #[tokio::test]
    async fn test_health_always_responds_ok_status() {
        let (app, _, handler) = fixture();
        handler.handle_error(
            crate::resilience::MonitoringErrorKind::MetricsCollectionFailed,
            &anyhow::anyhow!("fatal"),
            json!({}),
            ErrorSeverity::Critical,
        );

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.contains("\"degraded\""));
        assert!(text.contains("\"breaker_open\":true"));
        assert!(text.contains("\"error_rate\":1"));
    }

    #[tokio::test]
    async fn test_ready_gates_on_health_verdict() {
        let (app, _, handler) = fixture();

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        handler.handle_error(
            crate::resilience::MonitoringErrorKind::ConfigurationError,
            &anyhow::anyhow!("invalid buckets"),
            json!({}),
            ErrorSeverity::High,
        );

        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
