//! Process-wide instrument registry
//!
//! Holds every named counter/gauge/histogram behind a `parking_lot` lock and
//! renders them into the Prometheus text exposition format. Instruments are
//! owned exclusively by the registry; callers mutate them through the typed
//! mutation API, never by holding an instrument directly.
//!
//! Registration is deliberately forgiving: several independent components may
//! lazily request the same well-known instrument name, so a duplicate
//! registration logs a warning and keeps the first definition instead of
//! failing.

use crate::error::{Result, TelemetryError};
use crate::labels::LabelNames;
use parking_lot::RwLock;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::{Family, MetricConstructor};
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use wayfinder_config::MonitoringConfig;

/// Well-known instrument names
pub mod names {
    pub const HTTP_REQUESTS: &str = "http_requests";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
    pub const PAYMENT_SUCCESS_RATE: &str = "wayfinder_payment_success_rate";
    pub const PAYMENT_RESPONSE_TIME_SECONDS: &str = "wayfinder_payment_response_time_seconds";
    pub const PAYMENT_ERRORS: &str = "wayfinder_payment_errors";
    pub const USER_REGISTRATION_RATE: &str = "wayfinder_user_registration_rate";
    pub const ORDER_COMPLETION_RATE: &str = "wayfinder_order_completion_rate";
    pub const ACTIVE_USERS: &str = "wayfinder_active_users";
    pub const DATABASE_CONNECTIONS: &str = "wayfinder_database_connections";
    pub const CACHE_HIT_RATE: &str = "wayfinder_cache_hit_rate";
    pub const ERRORS: &str = "errors";
    pub const PROCESS_START_TIME_SECONDS: &str = "wayfinder_process_start_time_seconds";
    pub const BUILD_INFO: &str = "wayfinder_build_info";
}

/// Fallback histogram buckets for definitions that do not carry their own
const DEFAULT_BUCKETS: [f64; 9] = [0.1, 0.3, 0.5, 0.7, 1.0, 3.0, 5.0, 7.0, 10.0];

/// Ordered label values keying one time series inside a family
type LabelValues = Vec<(String, String)>;

/// Kind of a registered instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

/// Immutable description of an instrument
#[derive(Debug, Clone)]
pub struct MetricDefinition {
    /// Process-wide unique key
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    /// Order defines label-tuple identity
    pub label_names: Vec<String>,
    /// Ascending upper bounds; histograms only
    pub buckets: Option<Vec<f64>>,
}

impl MetricDefinition {
    pub fn counter(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            kind: MetricKind::Counter,
            label_names: Vec::new(),
            buckets: None,
        }
    }

    pub fn gauge(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            kind: MetricKind::Gauge,
            label_names: Vec::new(),
            buckets: None,
        }
    }

    pub fn histogram(
        name: impl Into<String>,
        help: impl Into<String>,
        buckets: Vec<f64>,
    ) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            kind: MetricKind::Histogram,
            label_names: Vec::new(),
            buckets: Some(buckets),
        }
    }

    pub fn with_labels(mut self, labels: &[&str]) -> Self {
        self.label_names = labels.iter().map(|l| l.to_string()).collect();
        self
    }
}

/// Histogram constructor carrying the per-definition bucket bounds
#[derive(Clone)]
struct BucketCtor {
    buckets: Vec<f64>,
}

impl MetricConstructor<Histogram> for BucketCtor {
    fn new_metric(&self) -> Histogram {
        Histogram::new(self.buckets.iter().copied())
    }
}

enum Instrument {
    Counter(Family<LabelValues, Counter>),
    Gauge(Family<LabelValues, Gauge<f64, AtomicU64>>),
    Histogram(Family<LabelValues, Histogram, BucketCtor>),
}

struct Registered {
    definition: MetricDefinition,
    instrument: Instrument,
    /// Distinct label tuples observed so far, for cardinality enforcement
    seen_tuples: HashSet<LabelValues>,
}

struct RegistryInner {
    exposition: Registry,
    metrics: HashMap<String, Registered>,
    initialized: bool,
    defaults_installed: bool,
}

impl RegistryInner {
    fn new() -> Self {
        Self {
            exposition: Registry::default(),
            metrics: HashMap::new(),
            initialized: false,
            defaults_installed: false,
        }
    }
}

/// Process-wide metric instrument registry
pub struct MetricsRegistry {
    inner: RwLock<RegistryInner>,
    config: MonitoringConfig,
}

static GLOBAL_REGISTRY: OnceLock<Arc<MetricsRegistry>> = OnceLock::new();

impl MetricsRegistry {
    /// Create a registry for the given configuration. Tests construct fresh
    /// instances; the application installs one process-wide instance via
    /// [`install_global`].
    pub fn new(config: MonitoringConfig) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::new()),
            config,
        }
    }

    /// Install the process-wide registry, initializing it on first call.
    /// Subsequent calls return the already-installed instance.
    pub fn install_global(config: MonitoringConfig) -> Arc<MetricsRegistry> {
        let registry = GLOBAL_REGISTRY
            .get_or_init(|| Arc::new(MetricsRegistry::new(config)))
            .clone();
        registry.initialize();
        registry
    }

    /// The installed process-wide registry, if any.
    pub fn global() -> Option<Arc<MetricsRegistry>> {
        GLOBAL_REGISTRY.get().cloned()
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    /// Idempotent startup hook: installs process-level default
    /// instrumentation once, then registers the predefined instrument sets
    /// gated by their config group flags.
    pub fn initialize(&self) {
        if self.inner.read().initialized {
            return;
        }

        if self.config.enabled && self.config.metrics.system.enabled {
            self.install_default_instruments();
        }

        self.register_predefined();
        self.inner.write().initialized = true;
    }

    /// Register a new instrument. A duplicate name logs a warning and leaves
    /// the existing instrument untouched; it never fails.
    pub fn register_metric(&self, definition: MetricDefinition) {
        let mut inner = self.inner.write();

        if inner.metrics.contains_key(&definition.name) {
            warn!(metric = %definition.name, "metric already registered, keeping first registration");
            return;
        }

        // The text encoder appends the `_total` suffix to counters itself.
        let exposition_name = match definition.kind {
            MetricKind::Counter => definition.name.trim_end_matches("_total").to_string(),
            _ => definition.name.clone(),
        };

        let instrument = match definition.kind {
            MetricKind::Counter => {
                let family = Family::<LabelValues, Counter>::default();
                inner
                    .exposition
                    .register(exposition_name, &definition.help, family.clone());
                Instrument::Counter(family)
            }
            MetricKind::Gauge => {
                let family = Family::<LabelValues, Gauge<f64, AtomicU64>>::default();
                inner
                    .exposition
                    .register(exposition_name, &definition.help, family.clone());
                Instrument::Gauge(family)
            }
            MetricKind::Histogram => {
                let buckets = definition
                    .buckets
                    .clone()
                    .unwrap_or_else(|| DEFAULT_BUCKETS.to_vec());
                let family = Family::<LabelValues, Histogram, BucketCtor>::new_with_constructor(
                    BucketCtor { buckets },
                );
                inner
                    .exposition
                    .register(exposition_name, &definition.help, family.clone());
                Instrument::Histogram(family)
            }
        };

        debug!(metric = %definition.name, kind = definition.kind.as_str(), "registered metric");
        inner.metrics.insert(
            definition.name.clone(),
            Registered {
                definition,
                instrument,
                seen_tuples: HashSet::new(),
            },
        );
    }

    /// Look up an instrument definition. `None` means "feature disabled",
    /// not an error.
    pub fn get_metric(&self, name: &str) -> Option<MetricDefinition> {
        self.inner.read().metrics.get(name).map(|m| m.definition.clone())
    }

    /// Increment a counter for the given label values (in definition order).
    pub fn inc_counter(&self, name: &str, values: &[&str]) -> Result<()> {
        self.with_series(name, values, MetricKind::Counter, |instrument, labels| {
            if let Instrument::Counter(family) = instrument {
                family.get_or_create(labels).inc();
            }
        })
    }

    /// Set a gauge to the given value for the given label values.
    pub fn set_gauge(&self, name: &str, values: &[&str], value: f64) -> Result<()> {
        self.with_series(name, values, MetricKind::Gauge, |instrument, labels| {
            if let Instrument::Gauge(family) = instrument {
                family.get_or_create(labels).set(value);
            }
        })
    }

    /// Observe a value into a histogram for the given label values.
    pub fn observe_histogram(&self, name: &str, values: &[&str], value: f64) -> Result<()> {
        self.with_series(name, values, MetricKind::Histogram, |instrument, labels| {
            if let Instrument::Histogram(family) = instrument {
                family.get_or_create(labels).observe(value);
            }
        })
    }

    /// Render every instrument into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String> {
        let inner = self.inner.read();
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &inner.exposition)
            .map_err(|e| TelemetryError::Encoding(e.to_string()))?;
        Ok(buffer)
    }

    /// Drop all instruments and reset the initialization flag. Test
    /// isolation and hot-reload only; never called on the request path.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        *inner = RegistryInner::new();
    }

    fn with_series(
        &self,
        name: &str,
        values: &[&str],
        requested: MetricKind,
        mutate: impl FnOnce(&Instrument, &LabelValues),
    ) -> Result<()> {
        let ceiling = self.config.metrics.max_label_values;
        let mut inner = self.inner.write();
        let registered = inner
            .metrics
            .get_mut(name)
            .ok_or_else(|| TelemetryError::UnknownMetric(name.to_string()))?;

        if registered.definition.kind != requested {
            return Err(TelemetryError::KindMismatch {
                metric: name.to_string(),
                registered: registered.definition.kind.as_str(),
                requested: requested.as_str(),
            });
        }

        if values.len() != registered.definition.label_names.len() {
            return Err(TelemetryError::InvalidLabels {
                metric: name.to_string(),
                expected: registered.definition.label_names.len(),
                got: values.len(),
            });
        }

        let labels: LabelValues = registered
            .definition
            .label_names
            .iter()
            .zip(values.iter())
            .map(|(n, v)| (n.clone(), v.to_string()))
            .collect();

        if !registered.seen_tuples.contains(&labels) {
            if registered.seen_tuples.len() >= ceiling {
                warn!(
                    metric = name,
                    ceiling,
                    "label cardinality ceiling reached, dropping new label tuple"
                );
                return Ok(());
            }
            registered.seen_tuples.insert(labels.clone());
        }

        mutate(&registered.instrument, &labels);
        Ok(())
    }

    /// Process-level default instrumentation: a start-time gauge and a
    /// build-info gauge carrying the service identity.
    fn install_default_instruments(&self) {
        {
            let mut inner = self.inner.write();
            if inner.defaults_installed {
                return;
            }
            inner.defaults_installed = true;
        }

        self.register_metric(MetricDefinition::gauge(
            names::PROCESS_START_TIME_SECONDS,
            "Start time of the process since unix epoch in seconds",
        ));
        self.register_metric(
            MetricDefinition::gauge(names::BUILD_INFO, "Service build information")
                .with_labels(&[LabelNames::SERVICE, LabelNames::VERSION, LabelNames::ENVIRONMENT]),
        );

        let start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let _ = self.set_gauge(names::PROCESS_START_TIME_SECONDS, &[], start);
        let _ = self.set_gauge(
            names::BUILD_INFO,
            &[
                &self.config.service.name,
                &self.config.service.version,
                &self.config.service.environment,
            ],
            1.0,
        );
    }

    fn register_predefined(&self) {
        if self.config.metrics.http.enabled {
            self.register_metric(
                MetricDefinition::counter(names::HTTP_REQUESTS, "Total number of HTTP requests")
                    .with_labels(&[
                        LabelNames::METHOD,
                        LabelNames::ROUTE,
                        LabelNames::STATUS_CODE,
                        LabelNames::SERVICE,
                    ]),
            );
            self.register_metric(
                MetricDefinition::histogram(
                    names::HTTP_REQUEST_DURATION_SECONDS,
                    "Duration of HTTP requests in seconds",
                    self.config.metrics.http.buckets.clone(),
                )
                .with_labels(&[LabelNames::METHOD, LabelNames::ROUTE, LabelNames::SERVICE]),
            );
        }

        if self.config.metrics.payment.enabled {
            self.register_metric(MetricDefinition::gauge(
                names::PAYMENT_SUCCESS_RATE,
                "Payment success rate over the trailing window (0-1)",
            ));
            self.register_metric(
                MetricDefinition::histogram(
                    names::PAYMENT_RESPONSE_TIME_SECONDS,
                    "Payment processing response time by stage and provider",
                    self.config.metrics.payment.buckets.clone(),
                )
                .with_labels(&[LabelNames::STAGE, LabelNames::PROVIDER]),
            );
            self.register_metric(
                MetricDefinition::counter(
                    names::PAYMENT_ERRORS,
                    "Total payment errors by stage, provider and error type",
                )
                .with_labels(&[LabelNames::STAGE, LabelNames::PROVIDER, LabelNames::ERROR_TYPE]),
            );
        }

        if self.config.metrics.business.enabled {
            self.register_metric(MetricDefinition::gauge(
                names::USER_REGISTRATION_RATE,
                "User registration conversion rate (0-1)",
            ));
            self.register_metric(MetricDefinition::gauge(
                names::ORDER_COMPLETION_RATE,
                "Order completion rate (0-1)",
            ));
            self.register_metric(MetricDefinition::gauge(
                names::ACTIVE_USERS,
                "Number of currently active users",
            ));
            self.register_metric(MetricDefinition::gauge(
                names::DATABASE_CONNECTIONS,
                "Number of active database connections",
            ));
            self.register_metric(MetricDefinition::gauge(
                names::CACHE_HIT_RATE,
                "Cache hit rate (0-1)",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> MetricsRegistry {
        MetricsRegistry::new(MonitoringConfig::default())
    }

    #[test]
    fn test_duplicate_registration_is_a_noop() {
        let registry = registry();
        registry.register_metric(
            MetricDefinition::counter("requests", "first help").with_labels(&["route"]),
        );
        registry.register_metric(
            MetricDefinition::counter("requests", "second help").with_labels(&["route", "extra"]),
        );

        let definition = registry.get_metric("requests").unwrap();
        assert_eq!(definition.help, "first help");
        assert_eq!(definition.label_names, vec!["route"]);
    }

    #[test]
    fn test_counter_is_monotonic_per_label_tuple() {
        let registry = registry();
        registry.register_metric(
            MetricDefinition::counter("hits", "hits").with_labels(&["route"]),
        );

        registry.inc_counter("hits", &["/a"]).unwrap();
        registry.inc_counter("hits", &["/a"]).unwrap();
        registry.inc_counter("hits", &["/b"]).unwrap();

        let text = registry.encode().unwrap();
        assert!(text.contains("hits_total{route=\"/a\"} 2"));
        assert!(text.contains("hits_total{route=\"/b\"} 1"));
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let registry = registry();
        registry.register_metric(MetricDefinition::histogram(
            "latency",
            "latency",
            vec![0.1, 1.0, 2.0],
        ));

        registry.observe_histogram("latency", &[], 0.5).unwrap();

        let text = registry.encode().unwrap();
        // 0.5 falls into every bucket whose bound is >= the value
        assert!(text.contains("latency_bucket{le=\"0.1\"} 0"));
        assert!(text.contains("latency_bucket{le=\"1.0\"} 1"));
        assert!(text.contains("latency_bucket{le=\"2.0\"} 1"));
        assert!(text.contains("latency_count 1"));
    }

    #[test]
    fn test_gauge_holds_last_set_value() {
        let registry = registry();
        registry.register_metric(MetricDefinition::gauge("level", "level"));

        registry.set_gauge("level", &[], 3.0).unwrap();
        registry.set_gauge("level", &[], 1.5).unwrap();

        let text = registry.encode().unwrap();
        assert!(text.contains("level 1.5"));
    }

    #[test]
    fn test_unknown_metric_is_reported() {
        let registry = registry();
        let err = registry.inc_counter("missing", &[]).unwrap_err();
        assert!(matches!(err, TelemetryError::UnknownMetric(_)));
    }

    #[test]
    fn test_label_count_mismatch_is_rejected() {
        let registry = registry();
        registry.register_metric(
            MetricDefinition::counter("hits", "hits").with_labels(&["route"]),
        );
        let err = registry.inc_counter("hits", &["/a", "extra"]).unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidLabels { .. }));
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let registry = registry();
        registry.register_metric(MetricDefinition::gauge("level", "level"));
        let err = registry.inc_counter("level", &[]).unwrap_err();
        assert!(matches!(err, TelemetryError::KindMismatch { .. }));
    }

    #[test]
    fn test_cardinality_ceiling_drops_new_tuples() {
        let mut config = MonitoringConfig::default();
        config.metrics.max_label_values = 2;
        let registry = MetricsRegistry::new(config);
        registry.register_metric(
            MetricDefinition::counter("hits", "hits").with_labels(&["route"]),
        );

        registry.inc_counter("hits", &["/a"]).unwrap();
        registry.inc_counter("hits", &["/b"]).unwrap();
        // ceiling reached: new tuple is dropped, existing tuples still update
        registry.inc_counter("hits", &["/c"]).unwrap();
        registry.inc_counter("hits", &["/a"]).unwrap();

        let text = registry.encode().unwrap();
        assert!(text.contains("hits_total{route=\"/a\"} 2"));
        assert!(!text.contains("route=\"/c\""));
    }

    #[test]
    fn test_initialize_registers_groups_by_flag() {
        let mut config = MonitoringConfig::default();
        config.metrics.payment.enabled = false;
        let registry = MetricsRegistry::new(config);
        registry.initialize();

        assert!(registry.get_metric(names::HTTP_REQUESTS).is_some());
        assert!(registry.get_metric(names::ACTIVE_USERS).is_some());
        assert!(registry.get_metric(names::PAYMENT_ERRORS).is_none());
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let registry = registry();
        registry.initialize();
        registry.initialize();
        assert!(registry.get_metric(names::HTTP_REQUESTS).is_some());
    }

    #[test]
    fn test_clear_resets_everything() {
        let registry = registry();
        registry.initialize();
        assert!(registry.get_metric(names::HTTP_REQUESTS).is_some());

        registry.clear();
        assert!(registry.get_metric(names::HTTP_REQUESTS).is_none());

        // re-initialization works after a clear
        registry.initialize();
        assert!(registry.get_metric(names::HTTP_REQUESTS).is_some());
    }

    #[test]
    fn test_default_instruments_installed_once() {
        let registry = registry();
        registry.initialize();
        registry.clear();
        registry.initialize();

        let text = registry.encode().unwrap();
        let occurrences = text.matches("wayfinder_process_start_time_seconds").count();
        assert!(occurrences >= 1);
    }
}
