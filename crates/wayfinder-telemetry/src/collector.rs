//! Collection facade over the instrument registry
//!
//! Business code records events through the [`Collector`] trait and never
//! touches instruments directly. Every operation is fire-and-forget: registry
//! errors are logged and swallowed so instrumentation can never break the
//! caller.
//!
//! The active/null split is decided once at startup from configuration; when
//! monitoring is disabled the [`NullCollector`] keeps call sites unchanged at
//! zero cost.

use crate::labels::{LabelNames, PaymentProvider, PaymentStage};
use crate::registry::{names, MetricDefinition, MetricsRegistry};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wayfinder_config::MonitoringConfig;

/// Trailing window over which the payment success rate is computed
const SUCCESS_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Point-in-time business gauge readings. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct BusinessSnapshot {
    pub user_registration_rate: Option<f64>,
    pub order_completion_rate: Option<f64>,
    pub payment_success_rate: Option<f64>,
    pub active_users: Option<f64>,
    pub database_connections: Option<f64>,
    pub cache_hit_rate: Option<f64>,
}

/// Request coordinates attached to an error event
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub service: String,
    pub method: String,
    pub route: String,
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self {
            service: "wayfinder".to_string(),
            method: "unknown".to_string(),
            route: "unknown".to_string(),
        }
    }
}

/// Fire-and-forget event recording surface
pub trait Collector: Send + Sync {
    /// Record one completed HTTP request.
    fn record_http_request(
        &self,
        method: &str,
        route: &str,
        status: u16,
        duration_secs: f64,
        service: Option<&str>,
    );

    /// Record one payment operation outcome.
    fn record_payment_event(
        &self,
        stage: PaymentStage,
        provider: PaymentProvider,
        duration_secs: f64,
        success: bool,
        error_type: Option<&str>,
    );

    /// Push a snapshot of business gauges.
    fn update_business_metrics(&self, snapshot: &BusinessSnapshot);

    /// Record one application error occurrence.
    fn record_error(&self, error_type: &str, context: &ErrorContext);
}

/// Choose the collector implementation from configuration. Called once at
/// startup; call sites hold the trait object for the process lifetime.
pub fn collector_from_config(
    config: &MonitoringConfig,
    registry: Arc<MetricsRegistry>,
) -> Arc<dyn Collector> {
    if config.enabled {
        Arc::new(PrometheusCollector::new(registry, &config.service.name))
    } else {
        debug!("monitoring disabled, installing null collector");
        Arc::new(NullCollector)
    }
}

/// Collector backed by the Prometheus instrument registry
pub struct PrometheusCollector {
    registry: Arc<MetricsRegistry>,
    service_name: String,
    /// Trailing payment outcomes feeding the success-rate gauge
    success_window: Mutex<VecDeque<(Instant, bool)>>,
}

impl PrometheusCollector {
    pub fn new(registry: Arc<MetricsRegistry>, service_name: &str) -> Self {
        Self {
            registry,
            service_name: service_name.to_string(),
            success_window: Mutex::new(VecDeque::new()),
        }
    }

    fn log_outcome(metric: &str, result: crate::error::Result<()>) {
        match result {
            Ok(()) => {}
            Err(crate::error::TelemetryError::UnknownMetric(_)) => {
                debug!(metric, "metric not registered, event dropped");
            }
            Err(e) => {
                warn!(metric, error = %e, "failed to record metric");
            }
        }
    }

    /// Rolls the trailing window forward and returns the success rate over
    /// it, or `None` when the window is empty.
    fn window_success_rate(&self, outcome: bool) -> Option<f64> {
        let now = Instant::now();
        let mut window = self.success_window.lock();
        window.push_back((now, outcome));
        while let Some((at, _)) = window.front() {
            if now.duration_since(*at) > SUCCESS_RATE_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.is_empty() {
            return None;
        }
        let successes = window.iter().filter(|(_, ok)| *ok).count();
        Some(successes as f64 / window.len() as f64)
    }

    /// Register the lazily-created errors counter on first use.
    fn ensure_errors_counter(&self) {
        if self.registry.get_metric(names::ERRORS).is_none() {
            self.registry.register_metric(
                MetricDefinition::counter(names::ERRORS, "Total application errors").with_labels(
                    &[
                        LabelNames::SERVICE,
                        LabelNames::METHOD,
                        LabelNames::ROUTE,
                        LabelNames::ERROR_TYPE,
                    ],
                ),
            );
        }
    }
}

impl Collector for PrometheusCollector {
    fn record_http_request(
        &self,
        method: &str,
        route: &str,
        status: u16,
        duration_secs: f64,
        service: Option<&str>,
    ) {
        let service = service.unwrap_or(&self.service_name);
        let status = status.to_string();

        Self::log_outcome(
            names::HTTP_REQUESTS,
            self.registry
                .inc_counter(names::HTTP_REQUESTS, &[method, route, &status, service]),
        );
        Self::log_outcome(
            names::HTTP_REQUEST_DURATION_SECONDS,
            self.registry.observe_histogram(
                names::HTTP_REQUEST_DURATION_SECONDS,
                &[method, route, service],
                duration_secs,
            ),
        );
    }

    fn record_payment_event(
        &self,
        stage: PaymentStage,
        provider: PaymentProvider,
        duration_secs: f64,
        success: bool,
        error_type: Option<&str>,
    ) {
        Self::log_outcome(
            names::PAYMENT_RESPONSE_TIME_SECONDS,
            self.registry.observe_histogram(
                names::PAYMENT_RESPONSE_TIME_SECONDS,
                &[stage.as_str(), provider.as_str()],
                duration_secs,
            ),
        );

        // the error counter only takes known error types; a failure without
        // one still feeds the duration histogram and the success window
        if !success {
            if let Some(error_type) = error_type {
                Self::log_outcome(
                    names::PAYMENT_ERRORS,
                    self.registry.inc_counter(
                        names::PAYMENT_ERRORS,
                        &[stage.as_str(), provider.as_str(), error_type],
                    ),
                );
            }
        }

        if let Some(rate) = self.window_success_rate(success) {
            Self::log_outcome(
                names::PAYMENT_SUCCESS_RATE,
                self.registry.set_gauge(names::PAYMENT_SUCCESS_RATE, &[], rate),
            );
        }
    }

    fn update_business_metrics(&self, snapshot: &BusinessSnapshot) {
        let gauges = [
            (names::USER_REGISTRATION_RATE, snapshot.user_registration_rate),
            (names::ORDER_COMPLETION_RATE, snapshot.order_completion_rate),
            (names::PAYMENT_SUCCESS_RATE, snapshot.payment_success_rate),
            (names::ACTIVE_USERS, snapshot.active_users),
            (names::DATABASE_CONNECTIONS, snapshot.database_connections),
            (names::CACHE_HIT_RATE, snapshot.cache_hit_rate),
        ];
        for (name, value) in gauges {
            if let Some(value) = value {
                Self::log_outcome(name, self.registry.set_gauge(name, &[], value));
            }
        }
    }

    fn record_error(&self, error_type: &str, context: &ErrorContext) {
        self.ensure_errors_counter();
        Self::log_outcome(
            names::ERRORS,
            self.registry.inc_counter(
                names::ERRORS,
                &[&context.service, &context.method, &context.route, error_type],
            ),
        );
    }
}

/// Collector that drops every event. Installed when monitoring is disabled.
pub struct NullCollector;

impl Collector for NullCollector {
    fn record_http_request(&self, _: &str, _: &str, _: u16, _: f64, _: Option<&str>) {}

    fn record_payment_event(
        &self,
        _: PaymentStage,
        _: PaymentProvider,
        _: f64,
        _: bool,
        _: Option<&str>,
    ) {
    }

    fn update_business_metrics(&self, _: &BusinessSnapshot) {}

    fn record_error(&self, _: &str, _: &ErrorContext) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (PrometheusCollector, Arc<MetricsRegistry>) {
        let registry = Arc::new(MetricsRegistry::new(MonitoringConfig::default()));
        registry.initialize();
        let collector = PrometheusCollector::new(registry.clone(), "wayfinder");
        (collector, registry)
    }

    #[test]
    fn test_http_request_updates_counter_and_histogram() {
        let (collector, registry) = collector();

        collector.record_http_request("GET", "/api/trips/:id", 200, 0.25, None);
        collector.record_http_request("GET", "/api/trips/:id", 200, 0.35, None);

        let text = registry.encode().unwrap();
        assert!(text.contains(
            "http_requests_total{method=\"GET\",route=\"/api/trips/:id\",status_code=\"200\",service=\"wayfinder\"} 2"
        ));
        assert!(text.contains("http_request_duration_seconds_count"));
    }

    #[test]
    fn test_payment_failure_increments_error_counter() {
        let (collector, registry) = collector();

        collector.record_payment_event(
            PaymentStage::PaymentProcessing,
            PaymentProvider::Alipay,
            1.2,
            false,
            Some("NetworkError"),
        );

        let text = registry.encode().unwrap();
        assert!(text.contains(
            "wayfinder_payment_errors_total{stage=\"payment_processing\",provider=\"alipay\",error_type=\"NetworkError\"} 1"
        ));
    }

    #[test]
    fn test_payment_failure_without_error_type_skips_counter() {
        let (collector, registry) = collector();

        collector.record_payment_event(
            PaymentStage::PaymentProcessing,
            PaymentProvider::Wechat,
            2.0,
            false,
            None,
        );

        let text = registry.encode().unwrap();
        assert!(!text.contains("wayfinder_payment_errors_total{"));
        // the observation itself is still recorded
        assert!(text.contains("wayfinder_payment_response_time_seconds_count"));
    }

    #[test]
    fn test_payment_success_does_not_touch_error_counter() {
        let (collector, registry) = collector();

        collector.record_payment_event(
            PaymentStage::OrderCreation,
            PaymentProvider::Wechat,
            0.4,
            true,
            None,
        );

        let text = registry.encode().unwrap();
        assert!(!text.contains("wayfinder_payment_errors_total{"));
    }

    #[test]
    fn test_success_rate_reflects_window_outcomes() {
        let (collector, registry) = collector();

        collector.record_payment_event(
            PaymentStage::PaymentProcessing,
            PaymentProvider::Wechat,
            0.5,
            true,
            None,
        );
        collector.record_payment_event(
            PaymentStage::PaymentProcessing,
            PaymentProvider::Wechat,
            0.5,
            false,
            Some("Timeout"),
        );

        let text = registry.encode().unwrap();
        assert!(text.contains("wayfinder_payment_success_rate 0.5"));
    }

    #[test]
    fn test_business_snapshot_sets_only_present_fields() {
        let (collector, registry) = collector();

        collector.update_business_metrics(&BusinessSnapshot {
            active_users: Some(42.0),
            ..Default::default()
        });

        let text = registry.encode().unwrap();
        assert!(text.contains("wayfinder_active_users 42.0"));
    }

    #[test]
    fn test_record_error_lazily_registers_counter() {
        let (collector, registry) = collector();
        assert!(registry.get_metric(names::ERRORS).is_none());

        collector.record_error("ValidationError", &ErrorContext::default());

        let text = registry.encode().unwrap();
        assert!(text.contains(
            "errors_total{service=\"wayfinder\",method=\"unknown\",route=\"unknown\",error_type=\"ValidationError\"} 1"
        ));
    }

    #[test]
    fn test_events_against_disabled_group_are_dropped() {
        let mut config = MonitoringConfig::default();
        config.metrics.payment.enabled = false;
        let registry = Arc::new(MetricsRegistry::new(config));
        registry.initialize();
        let collector = PrometheusCollector::new(registry.clone(), "wayfinder");

        // must not panic or propagate
        collector.record_payment_event(
            PaymentStage::PaymentProcessing,
            PaymentProvider::Alipay,
            1.0,
            false,
            Some("NetworkError"),
        );

        let text = registry.encode().unwrap();
        assert!(!text.contains("wayfinder_payment_"));
    }

    #[test]
    fn test_null_collector_silently_drops_everything() {
        let registry = Arc::new(MetricsRegistry::new(MonitoringConfig::default()));
        registry.initialize();
        let null = NullCollector;

        null.record_http_request("GET", "/", 200, 0.1, None);
        null.record_error("Anything", &ErrorContext::default());

        let text = registry.encode().unwrap();
        assert!(!text.contains("http_requests_total{"));
    }

    #[test]
    fn test_factory_honours_enabled_flag() {
        let registry = Arc::new(MetricsRegistry::new(MonitoringConfig::default()));
        let mut disabled = MonitoringConfig::default();
        disabled.enabled = false;

        // both arms return a usable trait object
        let active = collector_from_config(&MonitoringConfig::default(), registry.clone());
        let null = collector_from_config(&disabled, registry);
        active.record_http_request("GET", "/", 200, 0.1, None);
        null.record_http_request("GET", "/", 200, 0.1, None);
    }
}
