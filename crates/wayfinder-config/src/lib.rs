//! Monitoring configuration for the Wayfinder telemetry core
//!
//! Configuration is assembled once at startup by merging three layers:
//! built-in defaults, an optional YAML file, and environment overrides.
//! The file wins over defaults and the environment wins over the file.
//! After loading the tree is treated as read-only; `reload` re-runs the
//! full merge for hot-reload scenarios.

use figment::{
    providers::{Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Environment variable naming the optional YAML config file.
pub const CONFIG_PATH_ENV: &str = "MONITORING_CONFIG_PATH";

/// Top-level monitoring configuration tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Master switch; when false the null collector is selected at startup
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Service identity attached to metrics and log lines
    #[serde(default)]
    pub service: ServiceConfig,

    /// Per-group metric settings
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Performance knobs (parsed and validated; batching itself is not
    /// part of this core)
    #[serde(default)]
    pub performance: PerformanceConfig,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service: ServiceConfig::default(),
            metrics: MetricsConfig::default(),
            performance: PerformanceConfig::default(),
        }
    }
}

/// Service identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub version: String,
    pub environment: String,
    /// Auto-generated from pid + timestamp + random suffix when unset
    #[serde(default)]
    pub instance_id: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "wayfinder".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
            instance_id: String::new(),
        }
    }
}

/// Per-group metric settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub http: HttpMetricsConfig,

    #[serde(default)]
    pub payment: PaymentMetricsConfig,

    #[serde(default)]
    pub business: BusinessMetricsConfig,

    #[serde(default)]
    pub system: SystemMetricsConfig,

    /// Ceiling on distinct label tuples per instrument; tuples beyond the
    /// ceiling are dropped with a warning
    #[serde(default = "default_max_label_values")]
    pub max_label_values: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            http: HttpMetricsConfig::default(),
            payment: PaymentMetricsConfig::default(),
            business: BusinessMetricsConfig::default(),
            system: SystemMetricsConfig::default(),
            max_label_values: default_max_label_values(),
        }
    }
}

/// HTTP request metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpMetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Request paths starting with one of these prefixes bypass
    /// instrumentation entirely
    #[serde(default = "default_exclude_paths")]
    pub exclude_paths: Vec<String>,

    /// Duration histogram bucket upper bounds, seconds
    #[serde(default = "default_http_buckets")]
    pub buckets: Vec<f64>,
}

impl Default for HttpMetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exclude_paths: default_exclude_paths(),
            buckets: default_http_buckets(),
        }
    }
}

/// Payment pipeline metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Stage duration histogram bucket upper bounds, seconds
    #[serde(default = "default_payment_buckets")]
    pub buckets: Vec<f64>,
}

impl Default for PaymentMetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buckets: default_payment_buckets(),
        }
    }
}

/// Business KPI gauges
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessMetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often the application refreshes KPI snapshots, milliseconds
    #[serde(default = "default_business_interval")]
    pub update_interval_ms: u64,
}

impl Default for BusinessMetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            update_interval_ms: default_business_interval(),
        }
    }
}

/// Process-level default instrumentation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_system_interval")]
    pub collect_interval_ms: u64,
}

impl Default for SystemMetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            collect_interval_ms: default_system_interval(),
        }
    }
}

/// Performance knobs carried by the configuration surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_exclude_paths() -> Vec<String> {
    vec!["/api/metrics".to_string(), "/api/health".to_string()]
}

fn default_http_buckets() -> Vec<f64> {
    vec![0.1, 0.3, 0.5, 0.7, 1.0, 3.0, 5.0, 7.0, 10.0]
}

fn default_payment_buckets() -> Vec<f64> {
    vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
}

fn default_max_label_values() -> usize {
    1000
}

fn default_business_interval() -> u64 {
    60_000
}

fn default_system_interval() -> u64 {
    15_000
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval() -> u64 {
    1000
}

fn default_max_queue_size() -> usize {
    10_000
}

impl MonitoringConfig {
    /// Load configuration from defaults, the optional YAML file named by
    /// `MONITORING_CONFIG_PATH`, and process environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        Self::load_from(path, &|key| std::env::var(key).ok())
    }

    /// Load with an explicit file path and environment lookup. Tests pass a
    /// map-backed lookup instead of mutating the process environment.
    pub fn load_from(
        path: Option<PathBuf>,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(MonitoringConfig::default()));

        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }

        let mut config: MonitoringConfig = figment
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        config.apply_env_overrides(env);

        if config.service.instance_id.is_empty() {
            config.service.instance_id = generate_instance_id();
        }

        Ok(config)
    }

    /// Re-run the full defaults -> file -> environment merge.
    pub fn reload(&mut self) -> Result<()> {
        *self = Self::load()?;
        Ok(())
    }

    /// Validate the merged tree. Called once at startup; a failure here is a
    /// configuration error, not a reason to crash telemetry consumers.
    pub fn validate(&self) -> Result<()> {
        if self.service.name.is_empty() {
            return Err(ConfigError::Validation("service name is required".into()));
        }
        if self.service.version.is_empty() {
            return Err(ConfigError::Validation("service version is required".into()));
        }
        validate_buckets("metrics.http.buckets", &self.metrics.http.buckets)?;
        validate_buckets("metrics.payment.buckets", &self.metrics.payment.buckets)?;
        if self.metrics.max_label_values == 0 {
            return Err(ConfigError::Validation(
                "metrics.max_label_values must be greater than 0".into(),
            ));
        }
        if self.performance.batch_size == 0 {
            return Err(ConfigError::Validation(
                "performance.batch_size must be greater than 0".into(),
            ));
        }
        if self.performance.flush_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "performance.flush_interval_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self, env: &dyn Fn(&str) -> Option<String>) {
        if let Some(v) = env("MONITORING_ENABLED").as_deref().and_then(parse_bool) {
            self.enabled = v;
        }

        if let Some(v) = env("SERVICE_NAME") {
            self.service.name = v;
        }
        if let Some(v) = env("SERVICE_VERSION") {
            self.service.version = v;
        }
        if let Some(v) = env("SERVICE_ENVIRONMENT") {
            self.service.environment = v;
        }
        if let Some(v) = env("INSTANCE_ID") {
            self.service.instance_id = v;
        }

        if let Some(v) = env("HTTP_METRICS_ENABLED").as_deref().and_then(parse_bool) {
            self.metrics.http.enabled = v;
        }
        if let Some(v) = env("HTTP_METRICS_EXCLUDE_PATHS") {
            self.metrics.http.exclude_paths = parse_prefix_list(&v);
        }
        if let Some(v) = env("HTTP_METRICS_BUCKETS") {
            if let Some(buckets) = parse_bucket_list(&v) {
                self.metrics.http.buckets = buckets;
            }
        }
        if let Some(v) = env("METRICS_MAX_LABEL_VALUES") {
            if let Some(n) = parse_integer(&v, "METRICS_MAX_LABEL_VALUES") {
                self.metrics.max_label_values = n as usize;
            }
        }

        if let Some(v) = env("PAYMENT_METRICS_ENABLED").as_deref().and_then(parse_bool) {
            self.metrics.payment.enabled = v;
        }
        if let Some(v) = env("PAYMENT_METRICS_BUCKETS") {
            if let Some(buckets) = parse_bucket_list(&v) {
                self.metrics.payment.buckets = buckets;
            }
        }

        if let Some(v) = env("BUSINESS_METRICS_ENABLED").as_deref().and_then(parse_bool) {
            self.metrics.business.enabled = v;
        }
        if let Some(v) = env("BUSINESS_METRICS_UPDATE_INTERVAL") {
            if let Some(n) = parse_integer(&v, "BUSINESS_METRICS_UPDATE_INTERVAL") {
                self.metrics.business.update_interval_ms = n;
            }
        }

        if let Some(v) = env("SYSTEM_METRICS_ENABLED").as_deref().and_then(parse_bool) {
            self.metrics.system.enabled = v;
        }
        if let Some(v) = env("SYSTEM_METRICS_COLLECT_INTERVAL") {
            if let Some(n) = parse_integer(&v, "SYSTEM_METRICS_COLLECT_INTERVAL") {
                self.metrics.system.collect_interval_ms = n;
            }
        }

        if let Some(v) = env("METRICS_BATCH_SIZE") {
            if let Some(n) = parse_integer(&v, "METRICS_BATCH_SIZE") {
                self.performance.batch_size = n as usize;
            }
        }
        if let Some(v) = env("METRICS_FLUSH_INTERVAL") {
            if let Some(n) = parse_integer(&v, "METRICS_FLUSH_INTERVAL") {
                self.performance.flush_interval_ms = n;
            }
        }
        if let Some(v) = env("METRICS_MAX_QUEUE_SIZE") {
            if let Some(n) = parse_integer(&v, "METRICS_MAX_QUEUE_SIZE") {
                self.performance.max_queue_size = n as usize;
            }
        }
    }
}

fn validate_buckets(field: &str, buckets: &[f64]) -> Result<()> {
    if buckets.is_empty() {
        return Err(ConfigError::Validation(format!("{field} cannot be empty")));
    }
    if buckets.windows(2).any(|w| w[0] >= w[1]) {
        return Err(ConfigError::Validation(format!(
            "{field} must be strictly ascending"
        )));
    }
    Ok(())
}

/// Parse a comma-separated bucket list. Entries that do not parse as finite
/// numbers are dropped with a warning; an empty result keeps the previous
/// value (returns `None`).
pub fn parse_bucket_list(raw: &str) -> Option<Vec<f64>> {
    let mut buckets = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match entry.parse::<f64>() {
            Ok(v) if v.is_finite() => buckets.push(v),
            _ => warn!(entry, raw, "dropping invalid histogram bucket entry"),
        }
    }
    if buckets.is_empty() {
        warn!(raw, "bucket list contained no valid entries, keeping previous value");
        None
    } else {
        Some(buckets)
    }
}

/// Parse a comma-separated list of path prefixes.
pub fn parse_prefix_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        other => {
            warn!(value = other, "ignoring unrecognized boolean value");
            None
        }
    }
}

fn parse_integer(raw: &str, key: &str) -> Option<u64> {
    match raw.trim().parse::<u64>() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(key, value = raw, "ignoring non-numeric value");
            None
        }
    }
}

fn generate_instance_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_millis(),
        &suffix[..8]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = MonitoringConfig::default();
        assert!(config.enabled);
        assert!(config.metrics.http.enabled);
        assert_eq!(config.metrics.max_label_values, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_generates_instance_id() {
        let config = MonitoringConfig::load_from(None, &|_| None).unwrap();
        assert!(!config.service.instance_id.is_empty());
        // pid-timestamp-suffix
        assert_eq!(config.service.instance_id.split('-').count(), 3);
    }

    #[test]
    fn test_env_overrides_win() {
        let env = env_from(&[
            ("MONITORING_ENABLED", "false"),
            ("SERVICE_NAME", "wayfinder-qa"),
            ("HTTP_METRICS_ENABLED", "false"),
            ("BUSINESS_METRICS_UPDATE_INTERVAL", "5000"),
            ("INSTANCE_ID", "pinned-id"),
        ]);
        let config = MonitoringConfig::load_from(None, &env).unwrap();
        assert!(!config.enabled);
        assert!(!config.metrics.http.enabled);
        assert_eq!(config.service.name, "wayfinder-qa");
        assert_eq!(config.metrics.business.update_interval_ms, 5000);
        assert_eq!(config.service.instance_id, "pinned-id");
    }

    #[test]
    fn test_bucket_list_drops_invalid_entries() {
        let buckets = parse_bucket_list("0.1,bad,1.0,2.0").unwrap();
        assert_eq!(buckets, vec![0.1, 1.0, 2.0]);
    }

    #[test]
    fn test_bucket_list_all_invalid_keeps_previous() {
        assert!(parse_bucket_list("bad,worse").is_none());

        let env = env_from(&[("HTTP_METRICS_BUCKETS", "bad,worse")]);
        let config = MonitoringConfig::load_from(None, &env).unwrap();
        assert_eq!(config.metrics.http.buckets, default_http_buckets());
    }

    #[test]
    fn test_bucket_env_override() {
        let env = env_from(&[("PAYMENT_METRICS_BUCKETS", "0.5, 1.5, 3")]);
        let config = MonitoringConfig::load_from(None, &env).unwrap();
        assert_eq!(config.metrics.payment.buckets, vec![0.5, 1.5, 3.0]);
    }

    #[test]
    fn test_exclude_path_list() {
        let env = env_from(&[("HTTP_METRICS_EXCLUDE_PATHS", "/internal, /debug")]);
        let config = MonitoringConfig::load_from(None, &env).unwrap();
        assert_eq!(config.metrics.http.exclude_paths, vec!["/internal", "/debug"]);
    }

    #[test]
    fn test_invalid_numeric_is_ignored() {
        let env = env_from(&[("SYSTEM_METRICS_COLLECT_INTERVAL", "soon")]);
        let config = MonitoringConfig::load_from(None, &env).unwrap();
        assert_eq!(config.metrics.system.collect_interval_ms, 15_000);
    }

    #[test]
    fn test_validation_rejects_unordered_buckets() {
        let mut config = MonitoringConfig::default();
        config.metrics.http.buckets = vec![1.0, 0.5];
        assert!(config.validate().is_err());

        config.metrics.http.buckets = vec![];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_service_name() {
        let mut config = MonitoringConfig::default();
        config.service.name = String::new();
        assert!(config.validate().is_err());
    }
}
