// =============================================================================
// Source Adapters — one external feed to a stream of normalized Events
// =============================================================================
//
// Each adapter owns a worker task, its seen-id cache, and its token bucket.
// Polling adapters fire on their interval with at most one poll in flight;
// the streaming adapter holds one long-lived connection. Both publish
// enriched Events to the activity log and answer Stats.
//
// Failure policy: transient errors (network, 5xx, 429) back off and retry
// inside the worker, never escalating. Authentication and other 4xx errors
// demote the adapter to Failed; the orchestrator surfaces that in stats and
// does not restart it.
//
// Fetching goes through the `PollFetcher` / `StreamTransport` seams so tests
// drive the full adapter loop with scripted transports.
// =============================================================================

pub mod cryptopanic;
pub mod dedup;
pub mod lunarcrush;
pub mod pushshift;
pub mod rate_limit;
pub mod rss;
pub mod twitter;

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::Stream;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::activity::ActivityLog;
use crate::extract::{self, SharedRegistry};
use crate::sources::dedup::SeenCache;
use crate::sources::rate_limit::TokenBucket;
use crate::types::{now_ms, Event, Platform};

/// Seen-id cache size per adapter.
const DEDUP_CAPACITY: usize = 10_000;

/// Hard cap on any backoff delay.
const MAX_BACKOFF_MS: u64 = 5 * 60 * 1000;

/// A streaming connection healthy for this long resets the backoff curve.
const STREAM_HEALTHY_AFTER: Duration = Duration::from_secs(60);

/// Streaming reads that stay silent longer than this force a reconnect.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Lookback used to decide whether a symbol is new.
const NEW_SYMBOL_LOOKBACK_MS: i64 = 24 * 60 * 60 * 1000;

// =============================================================================
// Raw items & fetch errors
// =============================================================================

/// A raw item pulled from a source before enrichment.
#[derive(Debug, Clone, Default)]
pub struct RawItem {
    /// Stable per-source id used for dedup and as the Event id.
    pub id: String,
    /// Origin inside the platform (feed title, subreddit, ...).
    pub source: String,
    pub timestamp: i64,
    pub text: String,
    pub author: Option<String>,
    pub engagement: f64,
    /// Symbols the source reports directly (e.g. tagged currencies); merged
    /// with whatever the extractor finds in the text.
    pub symbols_hint: Vec<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transient: {0}")]
    Transient(String),
    #[error("authentication: {0}")]
    Auth(String),
    #[error("parse: {0}")]
    Parse(String),
}

/// Pulls one batch of raw items per invocation.
#[async_trait]
pub trait PollFetcher: Send + Sync {
    fn platform(&self) -> Platform;
    fn name(&self) -> String;
    async fn poll(&self) -> Result<Vec<RawItem>, FetchError>;
}

pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, FetchError>> + Send>>;

/// Opens one long-lived line-delimited connection per call.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    fn platform(&self) -> Platform;
    fn name(&self) -> String;
    async fn connect(&self) -> Result<LineStream, FetchError>;
    /// Turn one line of the stream into a raw item. `None` skips the line
    /// (keep-alives); a Parse error is logged and skipped.
    fn parse_line(&self, line: &str) -> Result<Option<RawItem>, FetchError>;
}

// =============================================================================
// Source configuration
// =============================================================================

fn default_enabled() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    60_000
}

fn default_max_results() -> usize {
    25
}

fn default_rate_limit_per_min() -> u32 {
    60
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Backoff for the given attempt, optionally floored by a server-sent
    /// retry-after, capped at five minutes.
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = attempt.min(self.attempts);
        let computed =
            (self.base_delay_ms as f64) * self.backoff_multiplier.powi(exponent as i32);
        let mut delay_ms = (computed as u64).min(MAX_BACKOFF_MS);
        if let Some(after) = retry_after {
            delay_ms = delay_ms.max(after.as_millis() as u64).min(MAX_BACKOFF_MS);
        }
        Duration::from_millis(delay_ms)
    }
}

/// Scheduling and limits shared by every source kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceTuning {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_results")]
    pub max_results_per_poll: usize,

    #[serde(default = "default_rate_limit_per_min")]
    pub rate_limit_per_min: u32,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for SourceTuning {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            poll_interval_ms: default_poll_interval_ms(),
            max_results_per_poll: default_max_results(),
            rate_limit_per_min: default_rate_limit_per_min(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRule {
    pub value: String,
    #[serde(default)]
    pub tag: String,
}

/// Per-platform source definition. The orchestrator dispatches each variant
/// to the matching adapter constructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceSpec {
    Rss {
        #[serde(default)]
        feeds: Vec<String>,
    },
    /// Reddit via the pushshift search API. Best effort: the public endpoint
    /// comes and goes, so this source never blocks initialization.
    Pushshift {
        #[serde(default)]
        subreddits: Vec<String>,
    },
    Twitter {
        #[serde(default)]
        bearer_token: String,
        #[serde(default)]
        rules: Vec<StreamRule>,
    },
    CryptoPanic {
        #[serde(default)]
        api_key: String,
    },
    LunarCrush {
        #[serde(default)]
        api_key: String,
    },
}

impl SourceSpec {
    pub fn platform(&self) -> Platform {
        match self {
            Self::Rss { .. } => Platform::Rss,
            Self::Pushshift { .. } => Platform::Reddit,
            Self::Twitter { .. } => Platform::Twitter,
            Self::CryptoPanic { .. } => Platform::CryptoPanic,
            Self::LunarCrush { .. } => Platform::LunarCrush,
        }
    }

    /// Fill empty credentials from the conventional environment variables.
    pub fn resolve_env(&mut self) {
        match self {
            Self::Twitter { bearer_token, .. } if bearer_token.is_empty() => {
                if let Ok(token) = std::env::var("TWITTER_BEARER_TOKEN") {
                    *bearer_token = token;
                }
            }
            Self::CryptoPanic { api_key } if api_key.is_empty() => {
                if let Ok(key) = std::env::var("CRYPTOPANIC_API_KEY") {
                    *api_key = key;
                }
            }
            Self::LunarCrush { api_key } if api_key.is_empty() => {
                if let Ok(key) = std::env::var("LUNARCRUSH_API_KEY") {
                    *api_key = key;
                }
            }
            _ => {}
        }
    }

    /// The credential this source cannot run without, if still unresolved.
    /// Reddit/pushshift is best-effort and RSS needs none.
    pub fn missing_credential(&self) -> Option<&'static str> {
        match self {
            Self::Twitter { bearer_token, .. } if bearer_token.is_empty() => {
                Some("TWITTER_BEARER_TOKEN")
            }
            Self::CryptoPanic { api_key } if api_key.is_empty() => Some("CRYPTOPANIC_API_KEY"),
            Self::LunarCrush { api_key } if api_key.is_empty() => Some("LUNARCRUSH_API_KEY"),
            _ => None,
        }
    }
}

/// One configured source: what to pull plus how to schedule it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntry {
    #[serde(flatten)]
    pub spec: SourceSpec,
    #[serde(flatten)]
    pub tuning: SourceTuning,
}

// =============================================================================
// Adapter state & stats
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterState {
    Idle,
    Connecting,
    Running,
    Backoff,
    Failed,
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Running => write!(f, "running"),
            Self::Backoff => write!(f, "backoff"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterStats {
    pub platform: Platform,
    pub name: String,
    pub state: AdapterState,
    pub events_emitted: u64,
    pub dropped_events: u64,
    pub errors_last_1m: usize,
    pub last_event_at: Option<i64>,
}

/// Counters and state shared between an adapter's worker and its handle.
pub struct AdapterShared {
    platform: Platform,
    name: String,
    state: RwLock<AdapterState>,
    events_emitted: AtomicU64,
    dropped_events: AtomicU64,
    error_times: Mutex<VecDeque<Instant>>,
    last_event_at: RwLock<Option<i64>>,
}

impl AdapterShared {
    fn new(platform: Platform, name: String) -> Self {
        Self {
            platform,
            name,
            state: RwLock::new(AdapterState::Idle),
            events_emitted: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            error_times: Mutex::new(VecDeque::new()),
            last_event_at: RwLock::new(None),
        }
    }

    pub fn state(&self) -> AdapterState {
        *self.state.read()
    }

    fn set_state(&self, state: AdapterState) {
        let mut current = self.state.write();
        if *current != state {
            debug!(adapter = %self.name, from = %*current, to = %state, "adapter state change");
            *current = state;
        }
    }

    fn record_error(&self) {
        let mut times = self.error_times.lock();
        let now = Instant::now();
        times.push_back(now);
        while times
            .front()
            .map(|t| now.duration_since(*t) > Duration::from_secs(60))
            .unwrap_or(false)
        {
            times.pop_front();
        }
    }

    fn record_event(&self) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
        *self.last_event_at.write() = Some(now_ms());
    }

    pub fn stats(&self) -> AdapterStats {
        let errors_last_1m = {
            let mut times = self.error_times.lock();
            let now = Instant::now();
            while times
                .front()
                .map(|t| now.duration_since(*t) > Duration::from_secs(60))
                .unwrap_or(false)
            {
                times.pop_front();
            }
            times.len()
        };
        AdapterStats {
            platform: self.platform,
            name: self.name.clone(),
            state: self.state(),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            errors_last_1m,
            last_event_at: *self.last_event_at.read(),
        }
    }
}

// =============================================================================
// Adapter handle
// =============================================================================

/// Handle to a running adapter: stats access plus stop/join control.
pub struct AdapterHandle {
    shared: Arc<AdapterShared>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AdapterHandle {
    pub fn platform(&self) -> Platform {
        self.shared.platform
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> AdapterState {
        self.shared.state()
    }

    pub fn stats(&self) -> AdapterStats {
        self.shared.stats()
    }

    /// Ask the worker to stop. Idempotent.
    pub fn signal_stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the worker to finish, bounded by `timeout`. A worker panic
    /// is caught here and demoted to Failed. Returns false on deadline.
    pub async fn join(&self, timeout: Duration) -> bool {
        let handle = { self.worker.lock().take() };
        let Some(handle) = handle else { return true };
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => true,
            Ok(Err(join_err)) => {
                if join_err.is_panic() {
                    error!(adapter = %self.shared.name, "adapter worker panicked — demoted to failed");
                    self.shared.set_state(AdapterState::Failed);
                }
                true
            }
            Err(_) => {
                warn!(adapter = %self.shared.name, "adapter did not stop within the deadline");
                false
            }
        }
    }

    /// If the worker already exited, reap it: a panic demotes the adapter to
    /// Failed without touching anything else. Used by the supervisor.
    pub async fn reap_if_finished(&self) {
        let finished = self
            .worker
            .lock()
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(false);
        if finished {
            self.join(Duration::from_millis(10)).await;
        }
    }
}

// =============================================================================
// Worker construction
// =============================================================================

/// Dependencies every adapter worker needs.
#[derive(Clone)]
pub struct AdapterDeps {
    pub log: Arc<ActivityLog>,
    pub registry: Arc<SharedRegistry>,
}

/// Spawn a polling adapter around `fetcher`.
pub fn spawn_polling_adapter(
    fetcher: Arc<dyn PollFetcher>,
    tuning: SourceTuning,
    deps: AdapterDeps,
) -> AdapterHandle {
    let shared = Arc::new(AdapterShared::new(fetcher.platform(), fetcher.name()));
    // Visible as Connecting before the worker ever runs, so a caller that
    // spawns and immediately reads stats sees a live adapter.
    shared.set_state(AdapterState::Connecting);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker_shared = shared.clone();
    let worker = tokio::spawn(async move {
        run_poll_loop(fetcher, tuning, deps, worker_shared, shutdown_rx).await;
    });

    AdapterHandle {
        shared,
        shutdown_tx,
        worker: Mutex::new(Some(worker)),
    }
}

/// Spawn a streaming adapter around `transport`.
pub fn spawn_streaming_adapter(
    transport: Arc<dyn StreamTransport>,
    tuning: SourceTuning,
    deps: AdapterDeps,
) -> AdapterHandle {
    let shared = Arc::new(AdapterShared::new(transport.platform(), transport.name()));
    shared.set_state(AdapterState::Connecting);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker_shared = shared.clone();
    let worker = tokio::spawn(async move {
        run_stream_loop(transport, tuning, deps, worker_shared, shutdown_rx).await;
    });

    AdapterHandle {
        shared,
        shutdown_tx,
        worker: Mutex::new(Some(worker)),
    }
}

// =============================================================================
// Polling loop
// =============================================================================

async fn run_poll_loop(
    fetcher: Arc<dyn PollFetcher>,
    tuning: SourceTuning,
    deps: AdapterDeps,
    shared: Arc<AdapterShared>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut seen = SeenCache::new(DEDUP_CAPACITY);
    let mut bucket = TokenBucket::new(tuning.rate_limit_per_min);
    let mut attempt: u32 = 0;
    let poll_interval = Duration::from_millis(tuning.poll_interval_ms);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        if !bucket.try_acquire() {
            debug!(adapter = %shared.name, "rate limit budget exhausted — skipping poll");
            if wait_or_shutdown(poll_interval, &mut shutdown_rx).await {
                break;
            }
            continue;
        }

        // One poll in flight at a time: the loop body awaits the fetch
        // before sleeping again.
        match fetcher.poll().await {
            Ok(items) => {
                shared.set_state(AdapterState::Running);
                attempt = 0;
                publish_items(&shared, &deps, &mut seen, items, tuning.max_results_per_poll)
                    .await;
                if wait_or_shutdown(poll_interval, &mut shutdown_rx).await {
                    break;
                }
            }
            Err(FetchError::RateLimited { retry_after }) => {
                shared.record_error();
                shared.set_state(AdapterState::Backoff);
                let delay = tuning.retry.delay(attempt, retry_after);
                attempt = attempt.saturating_add(1);
                warn!(adapter = %shared.name, delay_ms = delay.as_millis() as u64, "rate limited — backing off");
                if wait_or_shutdown(delay, &mut shutdown_rx).await {
                    break;
                }
            }
            Err(FetchError::Transient(msg)) => {
                shared.record_error();
                shared.set_state(AdapterState::Backoff);
                let delay = tuning.retry.delay(attempt, None);
                attempt = attempt.saturating_add(1);
                warn!(adapter = %shared.name, error = %msg, delay_ms = delay.as_millis() as u64, "transient fetch error — backing off");
                if wait_or_shutdown(delay, &mut shutdown_rx).await {
                    break;
                }
            }
            Err(FetchError::Auth(msg)) => {
                shared.record_error();
                shared.set_state(AdapterState::Failed);
                error!(adapter = %shared.name, error = %msg, "authentication failure — adapter stopped");
                return;
            }
            Err(FetchError::Parse(msg)) => {
                // A malformed payload is logged and skipped; the source keeps
                // running.
                shared.record_error();
                warn!(adapter = %shared.name, error = %msg, "unparseable payload — skipped");
                if wait_or_shutdown(poll_interval, &mut shutdown_rx).await {
                    break;
                }
            }
        }
    }

    if shared.state() != AdapterState::Failed {
        shared.set_state(AdapterState::Idle);
    }
    info!(adapter = %shared.name, "polling adapter stopped");
}

// =============================================================================
// Streaming loop
// =============================================================================

async fn run_stream_loop(
    transport: Arc<dyn StreamTransport>,
    tuning: SourceTuning,
    deps: AdapterDeps,
    shared: Arc<AdapterShared>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    use futures_util::StreamExt;

    let mut seen = SeenCache::new(DEDUP_CAPACITY);
    let mut attempt: u32 = 0;

    'outer: loop {
        if *shutdown_rx.borrow() {
            break;
        }
        shared.set_state(AdapterState::Connecting);

        match transport.connect().await {
            Ok(mut lines) => {
                shared.set_state(AdapterState::Running);
                let connected_at = Instant::now();
                info!(adapter = %shared.name, "stream connected");

                loop {
                    let next = tokio::select! {
                        _ = shutdown_rx.changed() => break 'outer,
                        next = tokio::time::timeout(STREAM_IDLE_TIMEOUT, lines.next()) => next,
                    };

                    if connected_at.elapsed() >= STREAM_HEALTHY_AFTER {
                        attempt = 0;
                    }

                    match next {
                        Ok(Some(Ok(line))) => {
                            if line.trim().is_empty() {
                                continue; // keep-alive
                            }
                            match transport.parse_line(&line) {
                                Ok(Some(item)) => {
                                    publish_items(
                                        &shared,
                                        &deps,
                                        &mut seen,
                                        vec![item],
                                        usize::MAX,
                                    )
                                    .await;
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    shared.record_error();
                                    warn!(adapter = %shared.name, error = %e, "unparseable stream line — skipped");
                                }
                            }
                        }
                        Ok(Some(Err(FetchError::Auth(msg)))) => {
                            shared.record_error();
                            shared.set_state(AdapterState::Failed);
                            error!(adapter = %shared.name, error = %msg, "stream authentication failure — adapter stopped");
                            return;
                        }
                        Ok(Some(Err(e))) => {
                            shared.record_error();
                            warn!(adapter = %shared.name, error = %e, "stream read error — reconnecting");
                            break;
                        }
                        Ok(None) => {
                            warn!(adapter = %shared.name, "stream ended — reconnecting");
                            break;
                        }
                        Err(_) => {
                            shared.record_error();
                            warn!(adapter = %shared.name, idle_secs = STREAM_IDLE_TIMEOUT.as_secs(), "stream idle timeout — reconnecting");
                            break;
                        }
                    }
                }
            }
            Err(FetchError::Auth(msg)) => {
                shared.record_error();
                shared.set_state(AdapterState::Failed);
                error!(adapter = %shared.name, error = %msg, "stream authentication failure — adapter stopped");
                return;
            }
            Err(e) => {
                shared.record_error();
                warn!(adapter = %shared.name, error = %e, "stream connect failed");
            }
        }

        shared.set_state(AdapterState::Backoff);
        let delay = tuning.retry.delay(attempt, None);
        attempt = attempt.saturating_add(1);
        debug!(adapter = %shared.name, delay_ms = delay.as_millis() as u64, "stream reconnect backoff");
        if wait_or_shutdown(delay, &mut shutdown_rx).await {
            break;
        }
    }

    if shared.state() != AdapterState::Failed {
        shared.set_state(AdapterState::Idle);
    }
    info!(adapter = %shared.name, "streaming adapter stopped");
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Sleep for `delay`, returning true when shutdown was signalled instead.
async fn wait_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
    }
}

/// Dedup, enrich, and publish a batch of raw items.
async fn publish_items(
    shared: &Arc<AdapterShared>,
    deps: &AdapterDeps,
    seen: &mut SeenCache,
    items: Vec<RawItem>,
    max_results: usize,
) {
    let registry = deps.registry.load();

    for item in items.into_iter().take(max_results) {
        if !seen.insert(&item.id) {
            continue;
        }

        let mut enrichment = extract::enrich(&registry, &item.text);
        for hint in &item.symbols_hint {
            let hint = hint.to_uppercase();
            if !enrichment.symbols.contains(&hint) {
                enrichment.symbols.push(hint);
            }
        }

        let is_new = enrichment
            .symbols
            .iter()
            .any(|s| !deps.log.seen_symbol_since(s, NEW_SYMBOL_LOOKBACK_MS));

        let event = Event {
            id: item.id,
            platform: shared.platform,
            source: item.source,
            timestamp: if item.timestamp > 0 { item.timestamp } else { now_ms() },
            text: item.text,
            author: item.author,
            engagement: item.engagement,
            symbols: enrichment.symbols,
            sentiment: enrichment.sentiment,
            confidence: enrichment.confidence,
            pump_indicators: enrichment.pump_indicators,
            risk_score: enrichment.risk_score,
            is_new,
        };

        if deps.log.log(event).await {
            shared.record_event();
        } else {
            shared.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// -------------------------------------------------------------------------
// HTTP plumbing shared by the concrete fetchers
// -------------------------------------------------------------------------

/// Deadline applied to every outbound request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .expect("failed to build reqwest client")
}

/// Map an HTTP response status onto the fetch error taxonomy: 429 is rate
/// limiting (with Retry-After honored), other 4xx are authentication or
/// configuration problems, 5xx are transient.
pub(crate) fn check_status(resp: &reqwest::Response) -> Result<(), FetchError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    if status.as_u16() == 429 {
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(FetchError::RateLimited { retry_after });
    }
    if status.is_client_error() {
        return Err(FetchError::Auth(format!("HTTP {status}")));
    }
    Err(FetchError::Transient(format!("HTTP {status}")))
}

pub(crate) fn transport_error(e: reqwest::Error) -> FetchError {
    FetchError::Transient(format!("request failed: {e}"))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityLogConfig;

    fn deps() -> (AdapterDeps, Arc<ActivityLog>) {
        let log = Arc::new(ActivityLog::new(ActivityLogConfig::default(), None));
        (
            AdapterDeps {
                log: log.clone(),
                registry: Arc::new(SharedRegistry::default()),
            },
            log,
        )
    }

    fn fast_tuning() -> SourceTuning {
        SourceTuning {
            poll_interval_ms: 10,
            retry: RetryPolicy {
                attempts: 5,
                base_delay_ms: 20,
                backoff_multiplier: 2.0,
            },
            ..SourceTuning::default()
        }
    }

    fn item(id: &str, text: &str) -> RawItem {
        RawItem {
            id: id.to_string(),
            source: "mock".to_string(),
            timestamp: now_ms(),
            text: text.to_string(),
            author: Some("tester".to_string()),
            engagement: 3.0,
            symbols_hint: Vec::new(),
        }
    }

    /// Scripted fetcher: plays back queued results, then returns empty polls.
    struct MockFetcher {
        script: Mutex<VecDeque<Result<Vec<RawItem>, FetchError>>>,
    }

    impl MockFetcher {
        fn new(script: Vec<Result<Vec<RawItem>, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl PollFetcher for MockFetcher {
        fn platform(&self) -> Platform {
            Platform::Rss
        }

        fn name(&self) -> String {
            "mock-rss".to_string()
        }

        async fn poll(&self) -> Result<Vec<RawItem>, FetchError> {
            self.script.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F, ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(ms);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn polling_adapter_publishes_enriched_events() {
        let (deps, log) = deps();
        let fetcher = MockFetcher::new(vec![Ok(vec![
            item("a", "BTC breakout looks bullish"),
            item("b", "ETH rally continues"),
        ])]);

        let handle = spawn_polling_adapter(fetcher, fast_tuning(), deps);
        assert!(wait_for(|| log.total_events() == 2, 1_000).await);

        let events = log.recent_since(60_000);
        assert_eq!(events[0].event.symbols, vec!["BTC"]);
        assert!(events[0].event.sentiment > 0.0);
        assert_eq!(events[0].event.platform, Platform::Rss);
        assert_eq!(handle.stats().events_emitted, 2);

        handle.signal_stop();
        assert!(handle.join(Duration::from_secs(1)).await);
        assert_eq!(handle.state(), AdapterState::Idle);
    }

    #[tokio::test]
    async fn duplicate_ids_are_dropped_before_enrichment() {
        let (deps, log) = deps();
        let fetcher = MockFetcher::new(vec![
            Ok(vec![item("same", "BTC news")]),
            Ok(vec![item("same", "BTC news"), item("other", "ETH news")]),
        ]);

        let handle = spawn_polling_adapter(fetcher, fast_tuning(), deps);
        assert!(wait_for(|| log.total_events() == 2, 1_000).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(log.total_events(), 2);

        handle.signal_stop();
        handle.join(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn rate_limit_responses_back_off_then_recover_without_loss() {
        let (deps, log) = deps();
        // Three 429s, then a successful poll: nothing is lost in between and
        // the adapter walks running -> backoff -> running.
        let fetcher = MockFetcher::new(vec![
            Ok(vec![item("first", "BTC pre-limit")]),
            Err(FetchError::RateLimited { retry_after: None }),
            Err(FetchError::RateLimited { retry_after: None }),
            Err(FetchError::RateLimited { retry_after: None }),
            Ok(vec![item("second", "BTC post-limit")]),
        ]);

        let handle = spawn_polling_adapter(fetcher, fast_tuning(), deps);

        assert!(wait_for(|| log.total_events() == 1, 1_000).await);
        assert!(wait_for(|| handle.state() == AdapterState::Backoff, 1_000).await);
        assert!(wait_for(|| log.total_events() == 2, 2_000).await);
        assert_eq!(handle.state(), AdapterState::Running);
        assert!(handle.stats().errors_last_1m >= 3);

        handle.signal_stop();
        handle.join(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn auth_failure_demotes_to_failed_without_retry() {
        let (deps, log) = deps();
        let fetcher = MockFetcher::new(vec![
            Err(FetchError::Auth("HTTP 401 Unauthorized".to_string())),
            // Would be served if the adapter (incorrectly) retried.
            Ok(vec![item("never", "BTC")]),
        ]);

        let handle = spawn_polling_adapter(fetcher, fast_tuning(), deps);
        assert!(wait_for(|| handle.state() == AdapterState::Failed, 1_000).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(log.total_events(), 0);

        handle.join(Duration::from_secs(1)).await;
        assert_eq!(handle.state(), AdapterState::Failed);
    }

    #[tokio::test]
    async fn parse_errors_skip_the_item_and_continue() {
        let (deps, log) = deps();
        let fetcher = MockFetcher::new(vec![
            Err(FetchError::Parse("bad json".to_string())),
            Ok(vec![item("ok", "BTC fine")]),
        ]);

        let handle = spawn_polling_adapter(fetcher, fast_tuning(), deps);
        assert!(wait_for(|| log.total_events() == 1, 1_000).await);
        assert_ne!(handle.state(), AdapterState::Failed);

        handle.signal_stop();
        handle.join(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn is_new_flags_first_sighting_only() {
        let (deps, log) = deps();
        let fetcher = MockFetcher::new(vec![
            Ok(vec![item("a", "BTC first mention")]),
            Ok(vec![item("b", "BTC second mention")]),
        ]);

        let handle = spawn_polling_adapter(fetcher, fast_tuning(), deps);
        assert!(wait_for(|| log.total_events() == 2, 1_000).await);

        let events = log.recent_since(60_000);
        assert!(events[0].event.is_new);
        assert!(!events[1].event.is_new);

        handle.signal_stop();
        handle.join(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn symbols_hint_merges_with_extraction() {
        let (deps, log) = deps();
        let mut tagged = item("tagged", "big move incoming for BTC");
        tagged.symbols_hint = vec!["eth".to_string()];
        let fetcher = MockFetcher::new(vec![Ok(vec![tagged])]);

        let handle = spawn_polling_adapter(fetcher, fast_tuning(), deps);
        assert!(wait_for(|| log.total_events() == 1, 1_000).await);

        let events = log.recent_since(60_000);
        assert_eq!(events[0].event.symbols, vec!["BTC", "ETH"]);

        handle.signal_stop();
        handle.join(Duration::from_secs(1)).await;
    }

    // -------------------------------------------------------------------------
    // Streaming
    // -------------------------------------------------------------------------

    /// Scripted transport: each connect pops the next line script.
    struct MockTransport {
        connects: Mutex<VecDeque<Result<Vec<Result<String, FetchError>>, FetchError>>>,
    }

    impl MockTransport {
        fn new(
            connects: Vec<Result<Vec<Result<String, FetchError>>, FetchError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                connects: Mutex::new(connects.into()),
            })
        }
    }

    #[async_trait]
    impl StreamTransport for MockTransport {
        fn platform(&self) -> Platform {
            Platform::Twitter
        }

        fn name(&self) -> String {
            "mock-stream".to_string()
        }

        async fn connect(&self) -> Result<LineStream, FetchError> {
            let script = self
                .connects
                .lock()
                .pop_front()
                .unwrap_or(Ok(Vec::new()))?;
            Ok(Box::pin(futures_util::stream::iter(script)))
        }

        fn parse_line(&self, line: &str) -> Result<Option<RawItem>, FetchError> {
            if line.starts_with('#') {
                return Ok(None);
            }
            Ok(Some(RawItem {
                id: line.to_string(),
                source: "stream".to_string(),
                timestamp: now_ms(),
                text: format!("{line} mentions BTC"),
                author: None,
                engagement: 1.0,
                symbols_hint: Vec::new(),
            }))
        }
    }

    #[tokio::test]
    async fn streaming_adapter_publishes_lines_and_reconnects() {
        let (deps, log) = deps();
        let transport = MockTransport::new(vec![
            Ok(vec![Ok("t1".to_string()), Ok("#keepalive".to_string())]),
            Ok(vec![Ok("t2".to_string())]),
        ]);

        let tuning = SourceTuning {
            retry: RetryPolicy {
                attempts: 3,
                base_delay_ms: 10,
                backoff_multiplier: 2.0,
            },
            ..SourceTuning::default()
        };
        let handle = spawn_streaming_adapter(transport, tuning, deps);

        // Both connects drain; the keep-alive line emits nothing.
        assert!(wait_for(|| log.total_events() == 2, 2_000).await);
        let events = log.recent_since(60_000);
        assert_eq!(events[0].event.id, "t1");
        assert_eq!(events[1].event.id, "t2");

        handle.signal_stop();
        assert!(handle.join(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn streaming_auth_failure_is_terminal() {
        let (deps, _log) = deps();
        let transport = MockTransport::new(vec![Err(FetchError::Auth(
            "HTTP 401".to_string(),
        ))]);

        let tuning = SourceTuning::default();
        let handle = spawn_streaming_adapter(transport, tuning, deps);
        assert!(wait_for(|| handle.state() == AdapterState::Failed, 1_000).await);
        handle.join(Duration::from_secs(1)).await;
    }

    // -------------------------------------------------------------------------
    // Config plumbing
    // -------------------------------------------------------------------------

    #[test]
    fn source_entry_round_trips_with_tag_and_tuning() {
        let json = r#"{
            "type": "cryptopanic",
            "api_key": "k",
            "enabled": true,
            "poll_interval_ms": 30000
        }"#;
        let entry: SourceEntry = serde_json::from_str(json).unwrap();
        assert!(matches!(entry.spec, SourceSpec::CryptoPanic { ref api_key } if api_key == "k"));
        assert_eq!(entry.tuning.poll_interval_ms, 30_000);
        assert_eq!(entry.tuning.max_results_per_poll, 25);

        let back = serde_json::to_value(&entry).unwrap();
        assert_eq!(back["type"], "cryptopanic");
    }

    #[test]
    fn missing_credentials_reported_except_best_effort_pushshift() {
        let twitter = SourceSpec::Twitter {
            bearer_token: String::new(),
            rules: Vec::new(),
        };
        assert_eq!(twitter.missing_credential(), Some("TWITTER_BEARER_TOKEN"));

        let pushshift = SourceSpec::Pushshift { subreddits: vec!["CryptoCurrency".to_string()] };
        assert_eq!(pushshift.missing_credential(), None);

        let rss = SourceSpec::Rss { feeds: vec!["https://example.com/feed".to_string()] };
        assert_eq!(rss.missing_credential(), None);
    }

    #[test]
    fn retry_delay_honors_retry_after_and_cap() {
        let retry = RetryPolicy {
            attempts: 5,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
        };
        assert_eq!(retry.delay(0, None), Duration::from_millis(1_000));
        assert_eq!(retry.delay(2, None), Duration::from_millis(4_000));
        // Server-sent retry-after floors the computed delay.
        assert_eq!(
            retry.delay(0, Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
        // Exponent and cap both bound the curve.
        assert_eq!(retry.delay(30, None), Duration::from_millis(32_000));
        assert_eq!(
            retry.delay(30, Some(Duration::from_secs(3_600))),
            Duration::from_millis(MAX_BACKOFF_MS)
        );
    }
}
