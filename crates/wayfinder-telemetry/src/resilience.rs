//! Error handling and resilience for the monitoring pipeline
//!
//! Classifies monitoring failures into a closed taxonomy, keeps a bounded
//! history for diagnostics, and guards the pipeline with a single shared
//! circuit breaker. `safe_execute` wraps monitoring operations so that a
//! failing pipeline degrades to fallback values instead of surfacing errors
//! to business code.

use anyhow::Result as AnyResult;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Closed taxonomy of monitoring failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitoringErrorKind {
    MetricsCollectionFailed,
    MetricsRegistrationFailed,
    StorageConnectionFailed,
    ConfigurationError,
    PerformanceDegradation,
}

impl MonitoringErrorKind {
    pub const ALL: [MonitoringErrorKind; 5] = [
        MonitoringErrorKind::MetricsCollectionFailed,
        MonitoringErrorKind::MetricsRegistrationFailed,
        MonitoringErrorKind::StorageConnectionFailed,
        MonitoringErrorKind::ConfigurationError,
        MonitoringErrorKind::PerformanceDegradation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MonitoringErrorKind::MetricsCollectionFailed => "metrics_collection_failed",
            MonitoringErrorKind::MetricsRegistrationFailed => "metrics_registration_failed",
            MonitoringErrorKind::StorageConnectionFailed => "storage_connection_failed",
            MonitoringErrorKind::ConfigurationError => "configuration_error",
            MonitoringErrorKind::PerformanceDegradation => "performance_degradation",
        }
    }
}

impl std::fmt::Display for MonitoringErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }
}

/// One recorded monitoring failure
#[derive(Debug, Clone)]
pub struct MonitoringError {
    pub kind: MonitoringErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub context: Value,
    pub timestamp: DateTime<Utc>,
    pub stack: Option<String>,
    recorded_at: Instant,
}

/// Tuning knobs for the handler. Defaults match production behavior; tests
/// shrink the windows to observe transitions quickly.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Bounded FIFO history capacity
    pub max_history: usize,
    /// How long the breaker stays open before a lazy reset
    pub breaker_timeout: Duration,
    /// Sliding window over which per-kind thresholds are evaluated
    pub error_window: Duration,
    /// Errors-per-minute ceiling feeding the health verdict
    pub max_error_rate_per_minute: usize,
    /// Per-kind error counts that trip the breaker inside the window
    pub thresholds: HashMap<MonitoringErrorKind, usize>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        let mut thresholds = HashMap::new();
        thresholds.insert(MonitoringErrorKind::MetricsCollectionFailed, 10);
        thresholds.insert(MonitoringErrorKind::MetricsRegistrationFailed, 5);
        thresholds.insert(MonitoringErrorKind::StorageConnectionFailed, 3);
        thresholds.insert(MonitoringErrorKind::ConfigurationError, 1);
        thresholds.insert(MonitoringErrorKind::PerformanceDegradation, 5);
        Self {
            max_history: 1000,
            breaker_timeout: Duration::from_secs(60),
            error_window: Duration::from_secs(60),
            max_error_rate_per_minute: 10,
            thresholds,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    Closed,
    Open { opened_at: Instant },
}

/// Aggregate error statistics for diagnostics endpoints
#[derive(Debug, Clone)]
pub struct ErrorStats {
    pub total: usize,
    /// Every taxonomy kind is present even when its count is zero
    pub by_kind: HashMap<MonitoringErrorKind, usize>,
    pub by_severity: HashMap<&'static str, usize>,
    pub recent: Vec<MonitoringError>,
    /// Errors recorded inside the trailing window (per minute at the
    /// default window size)
    pub error_rate: usize,
    pub breaker_open: bool,
}

type FallbackHook = Box<dyn Fn(&MonitoringError) -> AnyResult<()> + Send + Sync>;

struct Fallback {
    enabled: bool,
    hook: FallbackHook,
}

struct HandlerState {
    history: VecDeque<MonitoringError>,
    breaker: BreakerState,
}

/// Shared error handler and circuit breaker for the monitoring pipeline
pub struct ErrorHandler {
    state: Mutex<HandlerState>,
    // fallbacks live behind their own lock so hooks run without holding
    // the breaker state
    fallbacks: RwLock<HashMap<MonitoringErrorKind, Fallback>>,
    config: ResilienceConfig,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self::with_config(ResilienceConfig::default())
    }

    pub fn with_config(config: ResilienceConfig) -> Self {
        let handler = Self {
            state: Mutex::new(HandlerState {
                history: VecDeque::new(),
                breaker: BreakerState::Closed,
            }),
            fallbacks: RwLock::new(HashMap::new()),
            config,
        };
        handler.register_default_fallbacks();
        handler
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn register_default_fallbacks(&self) {
        self.register_fallback(MonitoringErrorKind::MetricsCollectionFailed, true, |err| {
            debug!(message = %err.message, "metric collection degraded, event skipped");
            Ok(())
        });
        self.register_fallback(MonitoringErrorKind::StorageConnectionFailed, true, |err| {
            debug!(message = %err.message, "metric storage degraded, sample dropped");
            Ok(())
        });
        self.register_fallback(MonitoringErrorKind::PerformanceDegradation, true, |err| {
            debug!(message = %err.message, "monitoring overhead detected, backing off");
            Ok(())
        });
    }

    /// Register or replace the fallback strategy for an error kind.
    pub fn register_fallback<F>(&self, kind: MonitoringErrorKind, enabled: bool, hook: F)
    where
        F: Fn(&MonitoringError) -> AnyResult<()> + Send + Sync + 'static,
    {
        self.fallbacks.write().insert(
            kind,
            Fallback {
                enabled,
                hook: Box::new(hook),
            },
        );
    }

    /// Record an error, evaluate the circuit breaker and dispatch the
    /// registered fallback. Never fails.
    pub fn handle_error(
        &self,
        kind: MonitoringErrorKind,
        source: &anyhow::Error,
        context: Value,
        severity: ErrorSeverity,
    ) {
        let record = MonitoringError {
            kind,
            severity,
            message: source.to_string(),
            context,
            timestamp: Utc::now(),
            stack: Some(format!("{source:#}")),
            recorded_at: Instant::now(),
        };

        self.log_error(&record);

        {
            let mut state = self.state.lock();
            if state.history.len() >= self.config.max_history {
                state.history.pop_front();
            }
            state.history.push_back(record.clone());
            self.evaluate_breaker(&mut state, &record);
        }

        // hook runs outside the state lock so reentrant handlers cannot
        // deadlock
        let fallbacks = self.fallbacks.read();
        if let Some(fallback) = fallbacks.get(&kind) {
            if fallback.enabled {
                if let Err(e) = (fallback.hook)(&record) {
                    warn!(kind = %kind, error = %e, "fallback strategy failed");
                }
            }
        }
    }

    fn log_error(&self, record: &MonitoringError) {
        match record.severity {
            ErrorSeverity::Critical => {
                error!(kind = %record.kind, message = %record.message, "critical monitoring error")
            }
            ErrorSeverity::High => {
                error!(kind = %record.kind, message = %record.message, "monitoring error")
            }
            ErrorSeverity::Medium => {
                warn!(kind = %record.kind, message = %record.message, "monitoring error")
            }
            ErrorSeverity::Low => {
                info!(kind = %record.kind, message = %record.message, "monitoring error")
            }
        }
    }

    fn evaluate_breaker(&self, state: &mut HandlerState, record: &MonitoringError) {
        if matches!(state.breaker, BreakerState::Open { .. }) {
            return;
        }

        if record.severity == ErrorSeverity::Critical {
            warn!(kind = %record.kind, "circuit breaker opened on critical error");
            state.breaker = BreakerState::Open {
                opened_at: Instant::now(),
            };
            return;
        }

        let threshold = match self.config.thresholds.get(&record.kind) {
            Some(t) => *t,
            None => return,
        };
        let window = self.config.error_window;
        let now = Instant::now();
        let recent = state
            .history
            .iter()
            .filter(|e| e.kind == record.kind && now.duration_since(e.recorded_at) <= window)
            .count();

        if recent >= threshold {
            warn!(
                kind = %record.kind,
                count = recent,
                threshold,
                "circuit breaker opened on error threshold"
            );
            state.breaker = BreakerState::Open { opened_at: now };
        }
    }

    /// Whether the breaker is currently rejecting monitoring work. Performs
    /// the lazy timeout reset as a side effect.
    pub fn is_breaker_open(&self) -> bool {
        let mut state = self.state.lock();
        self.breaker_open(&mut state)
    }

    fn breaker_open(&self, state: &mut HandlerState) -> bool {
        match state.breaker {
            BreakerState::Closed => false,
            BreakerState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.breaker_timeout {
                    info!("circuit breaker reset after timeout");
                    state.breaker = BreakerState::Closed;
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Run a monitoring operation behind the breaker. The returned value is
    /// always usable: when the breaker is open or the operation fails, the
    /// fallback value is returned and the failure is recorded.
    pub fn safe_execute<T>(
        &self,
        kind: MonitoringErrorKind,
        context: Value,
        fallback: T,
        op: impl FnOnce() -> AnyResult<T>,
    ) -> T {
        if self.is_breaker_open() {
            debug!(kind = %kind, "circuit breaker open, skipping operation");
            return fallback;
        }
        match op() {
            Ok(value) => value,
            Err(e) => {
                self.handle_error(kind, &e, context, ErrorSeverity::Medium);
                fallback
            }
        }
    }

    /// Async variant of [`safe_execute`](Self::safe_execute).
    pub async fn safe_execute_async<T, Fut>(
        &self,
        kind: MonitoringErrorKind,
        context: Value,
        fallback: T,
        op: impl FnOnce() -> Fut,
    ) -> T
    where
        Fut: Future<Output = AnyResult<T>>,
    {
        if self.is_breaker_open() {
            debug!(kind = %kind, "circuit breaker open, skipping operation");
            return fallback;
        }
        match op().await {
            Ok(value) => value,
            Err(e) => {
                self.handle_error(kind, &e, context, ErrorSeverity::Medium);
                fallback
            }
        }
    }

    /// Aggregate statistics over the retained history.
    pub fn error_stats(&self) -> ErrorStats {
        let mut state = self.state.lock();
        let breaker_open = self.breaker_open(&mut state);

        let mut by_kind: HashMap<MonitoringErrorKind, usize> =
            MonitoringErrorKind::ALL.iter().map(|k| (*k, 0)).collect();
        let mut by_severity: HashMap<&'static str, usize> =
            [("low", 0), ("medium", 0), ("high", 0), ("critical", 0)]
                .into_iter()
                .collect();

        let now = Instant::now();
        let mut error_rate = 0usize;
        for err in &state.history {
            *by_kind.entry(err.kind).or_insert(0) += 1;
            *by_severity.entry(err.severity.as_str()).or_insert(0) += 1;
            if now.duration_since(err.recorded_at) <= self.config.error_window {
                error_rate += 1;
            }
        }

        let recent = state
            .history
            .iter()
            .rev()
            .take(10)
            .cloned()
            .collect::<Vec<_>>();

        ErrorStats {
            total: state.history.len(),
            by_kind,
            by_severity,
            recent,
            error_rate,
            breaker_open,
        }
    }

    /// Health verdict for readiness probes: breaker closed, error rate under
    /// the ceiling and no critical error anywhere in the retained history.
    pub fn is_healthy(&self) -> bool {
        let mut state = self.state.lock();
        if self.breaker_open(&mut state) {
            return false;
        }

        let now = Instant::now();
        let window = self.config.error_window;
        let mut recent = 0usize;
        for err in &state.history {
            if err.severity == ErrorSeverity::Critical {
                return false;
            }
            if now.duration_since(err.recorded_at) <= window {
                recent += 1;
            }
        }

        recent <= self.config.max_error_rate_per_minute
    }

    /// Drop the retained history. Breaker state is untouched.
    pub fn clear_history(&self) {
        self.state.lock().history.clear();
    }
}
