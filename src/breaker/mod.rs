// =============================================================================
// Circuit Breaker — three-state gate protecting every external trade operation
// =============================================================================
//
// State machine:
//   CLOSED    -> OPEN       failure window full, metric trip, or force/emergency
//   OPEN      -> HALF_OPEN  reset timeout elapsed; the next execute probes
//   HALF_OPEN -> CLOSED     probe succeeded
//   HALF_OPEN -> OPEN       probe failed (fresh opened_at)
//
// One mutex guards {state, failures, metrics, opened_at, config}; the wrapped
// operation always runs outside the lock. Trip evaluation happens under the
// same lock as the metric update it reacts to, so it observes a consistent
// snapshot.
//
// Failure accounting: only api_error / risk_breach / unknown enter the trip
// window. trade_loss and drawdown failures are already represented through
// the metrics and would double-count; they land in the diagnostic history
// only, which is retained 24 h and never consulted for tripping.
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::types::now_ms;

// =============================================================================
// Configuration
// =============================================================================

fn default_failure_threshold() -> u32 {
    5
}

fn default_monitoring_period_ms() -> u64 {
    60_000
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

fn default_max_daily_loss() -> f64 {
    500.0
}

fn default_max_drawdown() -> f64 {
    0.2
}

fn default_max_consecutive_losses() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Recent failures within the monitoring period that trip the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Sliding window over which recent failures are counted.
    #[serde(default = "default_monitoring_period_ms")]
    pub monitoring_period_ms: u64,

    /// Delay after opening before the next execute is allowed to probe.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Daily loss (positive number) at which auto-halt trips.
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,

    /// Drawdown fraction at which auto-halt trips.
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown: f64,

    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,

    /// When false, metric updates are recorded but never trip the breaker.
    #[serde(default = "default_true")]
    pub enable_auto_halt: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            monitoring_period_ms: default_monitoring_period_ms(),
            reset_timeout_ms: default_reset_timeout_ms(),
            max_daily_loss: default_max_daily_loss(),
            max_drawdown: default_max_drawdown(),
            max_consecutive_losses: default_max_consecutive_losses(),
            enable_auto_halt: default_true(),
        }
    }
}

/// Partial config for `update_config`; unset fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BreakerConfigPatch {
    pub failure_threshold: Option<u32>,
    pub monitoring_period_ms: Option<u64>,
    pub reset_timeout_ms: Option<u64>,
    pub max_daily_loss: Option<f64>,
    pub max_drawdown: Option<f64>,
    pub max_consecutive_losses: Option<u32>,
    pub enable_auto_halt: Option<bool>,
}

// =============================================================================
// States, failures, metrics, events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ApiError,
    TradeLoss,
    Drawdown,
    RiskBreach,
    Unknown,
}

impl FailureKind {
    /// Classify an operation error by its message. Anything unrecognized is
    /// `Unknown` and therefore counted.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("drawdown") {
            Self::Drawdown
        } else if lower.contains("trade loss") || lower.contains("losing trade") || lower.contains("stop loss") {
            Self::TradeLoss
        } else if lower.contains("risk") {
            Self::RiskBreach
        } else if lower.contains("api")
            || lower.contains("http")
            || lower.contains("timeout")
            || lower.contains("connection")
            || lower.contains("network")
            || lower.contains("rate limit")
            || lower.contains("unavailable")
        {
            Self::ApiError
        } else {
            Self::Unknown
        }
    }

    /// Whether this kind enters the trip window. Loss/drawdown failures are
    /// already counted through the metrics.
    pub fn counts_toward_trip(&self) -> bool {
        matches!(self, Self::ApiError | Self::RiskBreach | Self::Unknown)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    #[serde(skip)]
    at: Instant,
    pub at_ms: i64,
    pub kind: FailureKind,
    pub op_type: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TradingMetrics {
    pub daily_pnl: f64,
    pub total_pnl: f64,
    pub drawdown: f64,
    pub consecutive_losses: u32,
    pub last_trade_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BreakerEvent {
    OperationSuccess { op_type: String },
    OperationFailure { op_type: String, kind: FailureKind },
    FailureRecorded { kind: FailureKind, message: String },
    CircuitOpened { reason: String },
    CircuitHalfOpen,
    CircuitClosed,
    EmergencyStop { reason: String },
    TradeRecorded { pnl: f64 },
    DailyReset,
    ConfigUpdated,
}

/// Error returned by `execute`. Callers pattern-match: an open circuit is a
/// rejection, not an operation failure, and is never trip-counted.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("circuit breaker open: {reason}")]
    CircuitOpen {
        reason: String,
        retry_in_ms: Option<u64>,
    },
    #[error(transparent)]
    Operation(#[from] anyhow::Error),
}

/// Serializable status snapshot for the API layer.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub state: BreakerState,
    pub opened_at_ms: Option<i64>,
    pub open_reason: Option<String>,
    pub emergency: bool,
    pub recent_failures: usize,
    pub time_until_half_open_ms: Option<u64>,
    pub metrics: TradingMetrics,
    pub config: BreakerConfig,
}

// =============================================================================
// Internals
// =============================================================================

/// Diagnostic history retention.
const HISTORY_MAX_AGE: Duration = Duration::from_secs(24 * 3600);
const HISTORY_MAX_LEN: usize = 500;

/// Fan-out capacity for breaker events.
const EVENT_CAPACITY: usize = 256;

struct Inner {
    state: BreakerState,
    /// Trip window: counted failure kinds only, pruned to the monitoring
    /// period.
    failures: VecDeque<FailureRecord>,
    /// Diagnostic list: every failure, 24 h retention, never trips.
    history: VecDeque<FailureRecord>,
    metrics: TradingMetrics,
    opened_at: Option<Instant>,
    opened_at_ms: Option<i64>,
    open_reason: Option<String>,
    emergency: bool,
    config: BreakerConfig,
    current_date: String,
}

impl Inner {
    fn prune(&mut self) {
        let window = Duration::from_millis(self.config.monitoring_period_ms);
        while self
            .failures
            .front()
            .map(|f| f.at.elapsed() > window)
            .unwrap_or(false)
        {
            self.failures.pop_front();
        }
        while self
            .history
            .front()
            .map(|f| f.at.elapsed() > HISTORY_MAX_AGE)
            .unwrap_or(false)
        {
            self.history.pop_front();
        }
        while self.history.len() > HISTORY_MAX_LEN {
            self.history.pop_front();
        }
    }

    /// Transition to OPEN. A no-op when already open, which also suppresses
    /// duplicate transition events.
    fn trip(&mut self, reason: &str, events: &mut Vec<BreakerEvent>) {
        if self.state == BreakerState::Open {
            return;
        }
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.opened_at_ms = Some(now_ms());
        self.open_reason = Some(reason.to_string());
        events.push(BreakerEvent::CircuitOpened {
            reason: reason.to_string(),
        });
    }

    fn maybe_roll_daily(&mut self, events: &mut Vec<BreakerEvent>) {
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        if self.current_date != today {
            self.current_date = today;
            self.metrics.daily_pnl = 0.0;
            self.metrics.consecutive_losses = 0;
            events.push(BreakerEvent::DailyReset);
        }
    }
}

// =============================================================================
// CircuitBreaker
// =============================================================================

pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    events: broadcast::Sender<BreakerEvent>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                history: VecDeque::new(),
                metrics: TradingMetrics::default(),
                opened_at: None,
                opened_at_ms: None,
                open_reason: None,
                emergency: false,
                config,
                current_date: chrono::Utc::now().format("%Y-%m-%d").to_string(),
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    fn emit_all(&self, events: Vec<BreakerEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }

    // -------------------------------------------------------------------------
    // Execute
    // -------------------------------------------------------------------------

    /// Run `op` through the gate. When OPEN (and not yet due for a probe)
    /// the operation is never invoked.
    pub async fn execute<T, F, Fut>(&self, op_type: &str, op: F) -> Result<T, ExecuteError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        // Gate check under the lock; the op itself runs outside it.
        {
            let mut events = Vec::new();
            let mut inner = self.inner.lock();
            if inner.state == BreakerState::Open {
                let reset = Duration::from_millis(inner.config.reset_timeout_ms);
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);

                if inner.emergency || elapsed < reset {
                    let reason = inner
                        .open_reason
                        .clone()
                        .unwrap_or_else(|| "circuit open".to_string());
                    let retry_in_ms = if inner.emergency {
                        None
                    } else {
                        Some(reset.saturating_sub(elapsed).as_millis() as u64)
                    };
                    return Err(ExecuteError::CircuitOpen { reason, retry_in_ms });
                }

                inner.state = BreakerState::HalfOpen;
                events.push(BreakerEvent::CircuitHalfOpen);
                info!(op_type, "circuit breaker half-open — probing");
            }
            drop(inner);
            self.emit_all(events);
        }

        match op().await {
            Ok(value) => {
                self.on_success(op_type);
                Ok(value)
            }
            Err(error) => {
                self.on_failure(op_type, &error);
                Err(ExecuteError::Operation(error))
            }
        }
    }

    fn on_success(&self, op_type: &str) {
        let mut events = vec![BreakerEvent::OperationSuccess {
            op_type: op_type.to_string(),
        }];
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
            inner.opened_at_ms = None;
            inner.open_reason = None;
            events.push(BreakerEvent::CircuitClosed);
            info!(op_type, "circuit breaker closed after successful probe");
        }
        drop(inner);
        self.emit_all(events);
    }

    fn on_failure(&self, op_type: &str, error: &anyhow::Error) {
        let message = error.to_string();
        let kind = FailureKind::classify(&message);
        let record = FailureRecord {
            at: Instant::now(),
            at_ms: now_ms(),
            kind,
            op_type: op_type.to_string(),
            message: message.clone(),
        };

        let mut events = vec![
            BreakerEvent::OperationFailure {
                op_type: op_type.to_string(),
                kind,
            },
            BreakerEvent::FailureRecorded {
                kind,
                message: message.clone(),
            },
        ];

        let mut inner = self.inner.lock();
        inner.prune();
        inner.history.push_back(record.clone());
        if kind.counts_toward_trip() {
            inner.failures.push_back(record);
        }

        match inner.state {
            BreakerState::HalfOpen => {
                // A failed probe reopens with a fresh timer.
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.opened_at_ms = Some(now_ms());
                inner.open_reason = Some("Half-open probe failed".to_string());
                events.push(BreakerEvent::CircuitOpened {
                    reason: "Half-open probe failed".to_string(),
                });
                warn!(op_type, error = %message, "half-open probe failed — reopening");
            }
            BreakerState::Closed => {
                let recent = inner.failures.len() as u32;
                if recent >= inner.config.failure_threshold {
                    let reason = format!(
                        "Failure threshold exceeded: {recent} failures within monitoring period"
                    );
                    inner.trip(&reason, &mut events);
                    warn!(op_type, recent, "circuit breaker opened on failure threshold");
                }
            }
            BreakerState::Open => {}
        }
        drop(inner);
        self.emit_all(events);
    }

    // -------------------------------------------------------------------------
    // Metric ingress
    // -------------------------------------------------------------------------

    /// Replace the daily PnL figure and evaluate the loss trip.
    pub fn update_daily_pnl(&self, daily_pnl: f64) {
        let mut events = Vec::new();
        let mut inner = self.inner.lock();
        inner.maybe_roll_daily(&mut events);
        inner.metrics.daily_pnl = daily_pnl;
        if inner.config.enable_auto_halt && daily_pnl <= -inner.config.max_daily_loss {
            inner.trip("Daily loss limit exceeded", &mut events);
        }
        drop(inner);
        self.emit_all(events);
    }

    /// Replace the drawdown figure and evaluate the drawdown trip.
    pub fn update_drawdown(&self, drawdown: f64) {
        let mut events = Vec::new();
        let mut inner = self.inner.lock();
        inner.metrics.drawdown = drawdown;
        if inner.config.enable_auto_halt && drawdown >= inner.config.max_drawdown {
            inner.trip("Maximum drawdown exceeded", &mut events);
        }
        drop(inner);
        self.emit_all(events);
    }

    /// Record a completed trade's PnL. A win resets the consecutive-loss
    /// counter; trips are evaluated on the updated snapshot.
    pub fn record_trade(&self, pnl: f64) {
        let mut events = Vec::new();
        let mut inner = self.inner.lock();
        inner.maybe_roll_daily(&mut events);

        inner.metrics.daily_pnl += pnl;
        inner.metrics.total_pnl += pnl;
        inner.metrics.last_trade_at = Some(now_ms());
        if pnl < 0.0 {
            inner.metrics.consecutive_losses += 1;
        } else {
            inner.metrics.consecutive_losses = 0;
        }
        events.push(BreakerEvent::TradeRecorded { pnl });

        if inner.config.enable_auto_halt {
            if inner.metrics.consecutive_losses >= inner.config.max_consecutive_losses {
                inner.trip("Maximum consecutive losses exceeded", &mut events);
            } else if inner.metrics.daily_pnl <= -inner.config.max_daily_loss {
                inner.trip("Daily loss limit exceeded", &mut events);
            }
        }
        drop(inner);
        self.emit_all(events);
    }

    /// Zero the daily counters (scheduled at UTC midnight or on demand).
    pub fn reset_daily_metrics(&self) {
        let mut inner = self.inner.lock();
        inner.metrics.daily_pnl = 0.0;
        inner.metrics.consecutive_losses = 0;
        inner.current_date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        drop(inner);
        self.emit_all(vec![BreakerEvent::DailyReset]);
        info!("circuit breaker daily metrics reset");
    }

    // -------------------------------------------------------------------------
    // Manual control
    // -------------------------------------------------------------------------

    pub fn force_open(&self, reason: &str) {
        let mut events = Vec::new();
        let mut inner = self.inner.lock();
        inner.trip(reason, &mut events);
        drop(inner);
        self.emit_all(events);
        warn!(reason, "circuit breaker force-opened");
    }

    /// Close the breaker and clear the emergency latch and trip window.
    pub fn force_close(&self) {
        let mut events = Vec::new();
        let mut inner = self.inner.lock();
        inner.emergency = false;
        if inner.state != BreakerState::Closed {
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
            inner.opened_at_ms = None;
            inner.open_reason = None;
            inner.failures.clear();
            events.push(BreakerEvent::CircuitClosed);
        }
        drop(inner);
        self.emit_all(events);
        info!("circuit breaker force-closed");
    }

    /// Force OPEN and latch: no half-open probing until `force_close`.
    pub fn emergency_stop(&self, reason: &str) {
        let mut events = vec![BreakerEvent::EmergencyStop {
            reason: reason.to_string(),
        }];
        let mut inner = self.inner.lock();
        inner.emergency = true;
        inner.trip(&format!("Emergency stop: {reason}"), &mut events);
        drop(inner);
        self.emit_all(events);
        warn!(reason, "EMERGENCY STOP — trading halted until force_close");
    }

    /// Merge a partial config. No state reset.
    pub fn update_config(&self, patch: BreakerConfigPatch) {
        let mut inner = self.inner.lock();
        let config = &mut inner.config;
        if let Some(v) = patch.failure_threshold {
            config.failure_threshold = v;
        }
        if let Some(v) = patch.monitoring_period_ms {
            config.monitoring_period_ms = v;
        }
        if let Some(v) = patch.reset_timeout_ms {
            config.reset_timeout_ms = v;
        }
        if let Some(v) = patch.max_daily_loss {
            config.max_daily_loss = v;
        }
        if let Some(v) = patch.max_drawdown {
            config.max_drawdown = v;
        }
        if let Some(v) = patch.max_consecutive_losses {
            config.max_consecutive_losses = v;
        }
        if let Some(v) = patch.enable_auto_halt {
            config.enable_auto_halt = v;
        }
        drop(inner);
        self.emit_all(vec![BreakerEvent::ConfigUpdated]);
        info!("circuit breaker config updated");
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == BreakerState::Closed
    }

    pub fn metrics(&self) -> TradingMetrics {
        self.inner.lock().metrics.clone()
    }

    pub fn config(&self) -> BreakerConfig {
        self.inner.lock().config.clone()
    }

    /// Diagnostic failure history (24 h retention, newest last).
    pub fn recent_failures(&self) -> Vec<FailureRecord> {
        let mut inner = self.inner.lock();
        inner.prune();
        inner.history.iter().cloned().collect()
    }

    pub fn status(&self) -> BreakerStatus {
        let mut inner = self.inner.lock();
        inner.prune();

        let time_until_half_open_ms = match (inner.state, inner.opened_at, inner.emergency) {
            (BreakerState::Open, Some(at), false) => Some(
                Duration::from_millis(inner.config.reset_timeout_ms)
                    .saturating_sub(at.elapsed())
                    .as_millis() as u64,
            ),
            _ => None,
        };

        BreakerStatus {
            state: inner.state,
            opened_at_ms: inner.opened_at_ms,
            open_reason: inner.open_reason.clone(),
            emergency: inner.emergency,
            recent_failures: inner.failures.len(),
            time_until_half_open_ms,
            metrics: inner.metrics.clone(),
            config: inner.config.clone(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn breaker(config: BreakerConfig) -> (CircuitBreaker, broadcast::Receiver<BreakerEvent>) {
        let b = CircuitBreaker::new(config);
        let rx = b.subscribe();
        (b, rx)
    }

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            monitoring_period_ms: 100,
            reset_timeout_ms: 1_000,
            ..BreakerConfig::default()
        }
    }

    fn drain(rx: &mut broadcast::Receiver<BreakerEvent>) -> Vec<BreakerEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    fn count_opened(events: &[BreakerEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, BreakerEvent::CircuitOpened { .. }))
            .count()
    }

    async fn fail(b: &CircuitBreaker, message: &'static str) {
        let _ = b
            .execute("test_op", || async move { anyhow::bail!(message) })
            .await
            .map(|_: ()| ());
    }

    #[tokio::test]
    async fn closed_to_open_on_failure_threshold() {
        let (b, mut rx) = breaker(fast_config());

        for _ in 0..3 {
            fail(&b, "api error: connection refused").await;
        }
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(count_opened(&drain(&mut rx)), 1);

        // While open, the operation must not run.
        let invoked = Arc::new(AtomicU32::new(0));
        let counter = invoked.clone();
        let result: Result<(), _> = b
            .execute("test_op", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ExecuteError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn open_to_half_open_to_closed_on_probe_success() {
        let (b, mut rx) = breaker(fast_config());
        for _ in 0..3 {
            fail(&b, "api error").await;
        }
        assert_eq!(b.state(), BreakerState::Open);
        drain(&mut rx);

        tokio::time::sleep(Duration::from_millis(1_050)).await;

        let invoked = Arc::new(AtomicU32::new(0));
        let counter = invoked.clone();
        let result: Result<&str, _> = b
            .execute("probe", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("ok")
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(b.state(), BreakerState::Closed);

        let events = drain(&mut rx);
        let half_open = events
            .iter()
            .filter(|e| matches!(e, BreakerEvent::CircuitHalfOpen))
            .count();
        let closed = events
            .iter()
            .filter(|e| matches!(e, BreakerEvent::CircuitClosed))
            .count();
        assert_eq!(half_open, 1);
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens_with_fresh_timer() {
        let config = BreakerConfig {
            reset_timeout_ms: 100,
            ..fast_config()
        };
        let (b, mut rx) = breaker(config);
        for _ in 0..3 {
            fail(&b, "api error").await;
        }
        drain(&mut rx);

        tokio::time::sleep(Duration::from_millis(150)).await;
        fail(&b, "api error").await;
        assert_eq!(b.state(), BreakerState::Open);

        let events = drain(&mut rx);
        assert_eq!(count_opened(&events), 1);
        // Fresh opened_at: the probe countdown restarted.
        let status = b.status();
        assert!(status.time_until_half_open_ms.unwrap_or(0) > 0);
    }

    #[tokio::test]
    async fn failures_outside_monitoring_period_do_not_count() {
        let (b, _rx) = breaker(fast_config());
        fail(&b, "api error").await;
        fail(&b, "api error").await;

        // Let the window slide past the first two failures.
        tokio::time::sleep(Duration::from_millis(150)).await;
        fail(&b, "api error").await;

        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.status().recent_failures, 1);
    }

    #[tokio::test]
    async fn trade_loss_failures_are_diagnostic_only() {
        let (b, _rx) = breaker(fast_config());
        for _ in 0..5 {
            fail(&b, "trade loss on BTCUSDT").await;
        }
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.status().recent_failures, 0);
        assert_eq!(b.recent_failures().len(), 5);
    }

    #[tokio::test]
    async fn daily_loss_limit_trips_with_reason() {
        let (b, mut rx) = breaker(BreakerConfig::default());
        b.update_daily_pnl(-500.1);

        assert_eq!(b.state(), BreakerState::Open);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            BreakerEvent::CircuitOpened { reason } if reason == "Daily loss limit exceeded"
        )));
    }

    #[tokio::test]
    async fn auto_halt_disabled_records_without_tripping() {
        let (b, _rx) = breaker(BreakerConfig {
            enable_auto_halt: false,
            ..BreakerConfig::default()
        });
        b.update_daily_pnl(-10_000.0);
        b.update_drawdown(0.9);
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.metrics().daily_pnl, -10_000.0);
    }

    #[tokio::test]
    async fn consecutive_losses_trip_and_win_resets_counter() {
        let config = BreakerConfig {
            max_consecutive_losses: 3,
            ..BreakerConfig::default()
        };
        let (b, mut rx) = breaker(config.clone());

        b.record_trade(-10.0);
        b.record_trade(-10.0);
        b.record_trade(25.0); // win resets the streak
        assert_eq!(b.metrics().consecutive_losses, 0);
        b.record_trade(-10.0);
        b.record_trade(-10.0);
        assert_eq!(b.state(), BreakerState::Closed);

        b.record_trade(-10.0);
        assert_eq!(b.state(), BreakerState::Open);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            BreakerEvent::CircuitOpened { reason } if reason == "Maximum consecutive losses exceeded"
        )));
    }

    #[tokio::test]
    async fn drawdown_trips() {
        let (b, _rx) = breaker(BreakerConfig::default());
        b.update_drawdown(0.25);
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(
            b.status().open_reason.as_deref(),
            Some("Maximum drawdown exceeded")
        );
    }

    #[tokio::test]
    async fn emergency_stop_latches_until_force_close() {
        let (b, mut rx) = breaker(BreakerConfig {
            reset_timeout_ms: 10,
            ..BreakerConfig::default()
        });

        b.emergency_stop("kill");
        assert_eq!(b.state(), BreakerState::Open);
        let events = drain(&mut rx);
        let stops = events
            .iter()
            .filter(|e| matches!(e, BreakerEvent::EmergencyStop { .. }))
            .count();
        assert_eq!(stops, 1);

        // Even after the reset timeout, no probing while latched.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let result: Result<(), _> = b.execute("probe", || async { Ok(()) }).await;
        assert!(matches!(
            result,
            Err(ExecuteError::CircuitOpen { retry_in_ms: None, .. })
        ));

        b.force_close();
        assert_eq!(b.state(), BreakerState::Closed);
        let result: Result<(), _> = b.execute("probe", || async { Ok(()) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn duplicate_open_transitions_are_suppressed() {
        let (b, mut rx) = breaker(BreakerConfig::default());
        b.force_open("manual");
        b.force_open("manual again");
        b.update_daily_pnl(-9_999.0);

        assert_eq!(count_opened(&drain(&mut rx)), 1);
    }

    #[tokio::test]
    async fn update_config_merges_without_state_reset() {
        let (b, _rx) = breaker(BreakerConfig::default());
        b.force_open("manual");

        b.update_config(BreakerConfigPatch {
            failure_threshold: Some(9),
            max_daily_loss: Some(750.0),
            ..BreakerConfigPatch::default()
        });

        let config = b.config();
        assert_eq!(config.failure_threshold, 9);
        assert_eq!(config.max_daily_loss, 750.0);
        // Untouched fields keep defaults; state untouched.
        assert_eq!(config.max_consecutive_losses, 5);
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn reset_daily_metrics_zeroes_daily_counters() {
        let (b, mut rx) = breaker(BreakerConfig {
            enable_auto_halt: false,
            ..BreakerConfig::default()
        });
        b.record_trade(-50.0);
        b.record_trade(-50.0);
        b.reset_daily_metrics();

        let metrics = b.metrics();
        assert_eq!(metrics.daily_pnl, 0.0);
        assert_eq!(metrics.consecutive_losses, 0);
        // Total PnL survives the daily reset.
        assert_eq!(metrics.total_pnl, -100.0);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, BreakerEvent::DailyReset)));
    }

    #[test]
    fn classification_table() {
        assert_eq!(
            FailureKind::classify("HTTP 503 service unavailable"),
            FailureKind::ApiError
        );
        assert_eq!(
            FailureKind::classify("trade loss exceeded on close"),
            FailureKind::TradeLoss
        );
        assert_eq!(
            FailureKind::classify("max drawdown breached"),
            FailureKind::Drawdown
        );
        assert_eq!(
            FailureKind::classify("risk check rejected order"),
            FailureKind::RiskBreach
        );
        assert_eq!(FailureKind::classify("???"), FailureKind::Unknown);
        assert!(FailureKind::Unknown.counts_toward_trip());
        assert!(!FailureKind::TradeLoss.counts_toward_trip());
        assert!(!FailureKind::Drawdown.counts_toward_trip());
    }
}
