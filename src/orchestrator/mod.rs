// =============================================================================
// Data Orchestrator — lifecycle and supervision of the source adapters
// =============================================================================
//
// Lifecycle: Uninitialized -> Initializing -> Ready -> Running -> Stopping ->
// Stopped. Transitions are explicit; config updates are legal only in Ready
// or Running and perform an atomic pause / reconfigure / resume.
//
// Supervision: a failed adapter is recorded, never restarted automatically.
// A panic inside an adapter worker is caught by the supervisor and demoted
// to Failed without taking the orchestrator down.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::correlator::{Correlator, SymbolActivitySignal};
use crate::sources::{
    cryptopanic::CryptoPanicFetcher, lunarcrush::LunarCrushFetcher, pushshift::PushshiftFetcher,
    rss::RssFetcher, spawn_polling_adapter, spawn_streaming_adapter, twitter::TwitterTransport,
    AdapterDeps, AdapterHandle, AdapterState, AdapterStats, SourceEntry, SourceSpec,
};

fn default_stop_timeout() -> Duration {
    Duration::from_secs(10)
}

/// How often the supervisor sweeps for dead adapter workers.
const SUPERVISOR_SWEEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorState {
    Uninitialized,
    Initializing,
    Ready,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Initialization failures are split so the binary can exit 2 vs 3.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("source authentication: {0}")]
    Auth(String),
    #[error("operation illegal in state {0}")]
    IllegalState(OrchestratorState),
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub state: OrchestratorState,
    pub total_events: u64,
    pub dropped_events: u64,
    pub active_data_sources: usize,
    pub data_source_status: Vec<AdapterStats>,
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct Orchestrator {
    deps: AdapterDeps,
    correlator: Arc<Correlator>,
    state: RwLock<OrchestratorState>,
    sources: RwLock<Vec<SourceEntry>>,
    adapters: Mutex<Vec<Arc<AdapterHandle>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    stop_timeout: Duration,
}

impl Orchestrator {
    pub fn new(deps: AdapterDeps, correlator: Arc<Correlator>, stop_timeout_ms: Option<u64>) -> Self {
        Self {
            deps,
            correlator,
            state: RwLock::new(OrchestratorState::Uninitialized),
            sources: RwLock::new(Vec::new()),
            adapters: Mutex::new(Vec::new()),
            supervisor: Mutex::new(None),
            stop_timeout: stop_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(default_stop_timeout),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.read()
    }

    pub fn is_active(&self) -> bool {
        self.state() == OrchestratorState::Running
    }

    pub fn get_config(&self) -> Vec<SourceEntry> {
        self.sources.read().clone()
    }

    pub fn get_active_signals(&self) -> Vec<SymbolActivitySignal> {
        self.correlator.active_signals()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Validate the source set and store it. Fails fast when a required
    /// credential cannot be resolved (reddit/pushshift is exempt: best
    /// effort by policy).
    pub fn initialize(&self, mut sources: Vec<SourceEntry>) -> Result<(), InitError> {
        {
            let mut state = self.state.write();
            match *state {
                OrchestratorState::Uninitialized | OrchestratorState::Stopped => {
                    *state = OrchestratorState::Initializing;
                }
                other => return Err(InitError::IllegalState(other)),
            }
        }

        if let Err(e) = validate_sources(&mut sources) {
            *self.state.write() = OrchestratorState::Uninitialized;
            return Err(e);
        }

        info!(
            sources = sources.iter().filter(|s| s.tuning.enabled).count(),
            "orchestrator initialized"
        );
        *self.sources.write() = sources;
        *self.state.write() = OrchestratorState::Ready;
        Ok(())
    }

    /// Spawn every enabled adapter and the supervisor. Returns once all
    /// adapters are at least Connecting.
    pub fn start(&self) -> Result<(), InitError> {
        {
            let state = self.state.read();
            if *state != OrchestratorState::Ready {
                return Err(InitError::IllegalState(*state));
            }
        }

        let handles = self.spawn_enabled_adapters();
        let count = handles.len();
        *self.adapters.lock() = handles.clone();
        self.spawn_supervisor(handles);

        *self.state.write() = OrchestratorState::Running;
        info!(adapters = count, "orchestrator running");
        Ok(())
    }

    /// Stop all adapters, drain in-flight publishes (bounded by the stop
    /// timeout), and drop the supervisor. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write();
            match *state {
                OrchestratorState::Running | OrchestratorState::Ready => {
                    *state = OrchestratorState::Stopping;
                }
                OrchestratorState::Stopped | OrchestratorState::Stopping => return,
                _ => {
                    *state = OrchestratorState::Stopped;
                    return;
                }
            }
        }

        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.abort();
        }

        let adapters: Vec<_> = self.adapters.lock().drain(..).collect();
        let deadline = tokio::time::Instant::now() + self.stop_timeout;

        for adapter in &adapters {
            adapter.signal_stop();
        }
        for adapter in &adapters {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::from_millis(1));
            if !adapter.join(remaining).await {
                warn!(adapter = %adapter.name(), "adapter outlived the stop deadline");
            }
        }

        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or(Duration::from_millis(1));
        if !self.deps.log.drain(remaining).await {
            warn!("activity log did not drain before the stop deadline");
        }

        *self.state.write() = OrchestratorState::Stopped;
        info!("orchestrator stopped");
    }

    /// Replace the source set. Legal only in Ready or Running; when Running
    /// the affected adapters are paused, reconfigured, and resumed as one
    /// operation.
    pub async fn update_config(&self, mut sources: Vec<SourceEntry>) -> Result<(), InitError> {
        let was_running = {
            let state = self.state.read();
            match *state {
                OrchestratorState::Running => true,
                OrchestratorState::Ready => false,
                other => return Err(InitError::IllegalState(other)),
            }
        };

        validate_sources(&mut sources)?;

        if !was_running {
            *self.sources.write() = sources;
            info!("orchestrator config updated (ready)");
            return Ok(());
        }

        // Pause: stop current adapters without leaving Running, so callers
        // observe one atomic reconfigure.
        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.abort();
        }
        let old: Vec<_> = self.adapters.lock().drain(..).collect();
        for adapter in &old {
            adapter.signal_stop();
        }
        for adapter in &old {
            adapter.join(self.stop_timeout).await;
        }

        // Reconfigure + resume.
        *self.sources.write() = sources;
        let handles = self.spawn_enabled_adapters();
        *self.adapters.lock() = handles.clone();
        self.spawn_supervisor(handles);
        info!("orchestrator config updated (running, adapters restarted)");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Stats
    // -------------------------------------------------------------------------

    pub fn stats(&self) -> OrchestratorStats {
        let data_source_status: Vec<AdapterStats> =
            self.adapters.lock().iter().map(|a| a.stats()).collect();
        let active_data_sources = data_source_status
            .iter()
            .filter(|s| {
                matches!(
                    s.state,
                    AdapterState::Connecting | AdapterState::Running | AdapterState::Backoff
                )
            })
            .count();

        OrchestratorStats {
            state: self.state(),
            total_events: self.deps.log.total_events(),
            dropped_events: self.deps.log.dropped_events(),
            active_data_sources,
            data_source_status,
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn spawn_enabled_adapters(&self) -> Vec<Arc<AdapterHandle>> {
        self.sources
            .read()
            .iter()
            .filter(|entry| entry.tuning.enabled)
            .map(|entry| Arc::new(build_adapter(entry, self.deps.clone())))
            .collect()
    }

    fn spawn_supervisor(&self, adapters: Vec<Arc<AdapterHandle>>) {
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(SUPERVISOR_SWEEP).await;
                for adapter in &adapters {
                    adapter.reap_if_finished().await;
                    if adapter.state() == AdapterState::Failed {
                        // Recorded in stats; no automatic restart.
                        error!(adapter = %adapter.name(), "adapter in failed state");
                    }
                }
            }
        });
        *self.supervisor.lock() = Some(handle);
    }

    #[cfg(test)]
    pub(crate) fn adopt_adapter_for_tests(&self, handle: Arc<AdapterHandle>) {
        self.adapters.lock().push(handle);
        *self.state.write() = OrchestratorState::Running;
    }
}

/// Resolve env credentials, then reject entries that cannot work: an enabled
/// source missing its credential (exit-3 class) or an enabled source with an
/// empty target list (exit-2 class).
fn validate_sources(sources: &mut [SourceEntry]) -> Result<(), InitError> {
    if !sources.iter().any(|s| s.tuning.enabled) {
        return Err(InitError::InvalidConfig("no sources enabled".to_string()));
    }

    for entry in sources.iter_mut().filter(|s| s.tuning.enabled) {
        entry.spec.resolve_env();

        if let Some(var) = entry.spec.missing_credential() {
            return Err(InitError::Auth(format!(
                "{} requires {var}",
                entry.spec.platform()
            )));
        }

        match &entry.spec {
            SourceSpec::Rss { feeds } if feeds.is_empty() => {
                return Err(InitError::InvalidConfig("rss source has no feeds".to_string()));
            }
            SourceSpec::Pushshift { subreddits } if subreddits.is_empty() => {
                return Err(InitError::InvalidConfig(
                    "pushshift source has no subreddits".to_string(),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Dispatch a source entry to its adapter constructor.
fn build_adapter(entry: &SourceEntry, deps: AdapterDeps) -> AdapterHandle {
    let tuning = entry.tuning.clone();
    match &entry.spec {
        SourceSpec::Rss { feeds } => {
            spawn_polling_adapter(Arc::new(RssFetcher::new(feeds.clone())), tuning, deps)
        }
        SourceSpec::Pushshift { subreddits } => spawn_polling_adapter(
            Arc::new(PushshiftFetcher::new(
                subreddits.clone(),
                tuning.max_results_per_poll,
            )),
            tuning,
            deps,
        ),
        SourceSpec::CryptoPanic { api_key } => spawn_polling_adapter(
            Arc::new(CryptoPanicFetcher::new(api_key.clone())),
            tuning,
            deps,
        ),
        SourceSpec::LunarCrush { api_key } => spawn_polling_adapter(
            Arc::new(LunarCrushFetcher::new(api_key.clone())),
            tuning,
            deps,
        ),
        SourceSpec::Twitter { bearer_token, rules } => spawn_streaming_adapter(
            Arc::new(TwitterTransport::new(bearer_token.clone(), rules.clone())),
            tuning,
            deps,
        ),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityLog, ActivityLogConfig};
    use crate::correlator::{CorrelatorConfig, CorrelatorOutput};
    use crate::extract::SharedRegistry;
    use crate::sources::{
        FetchError, PollFetcher, RawItem, RetryPolicy, SourceTuning,
    };
    use crate::types::{now_ms, Platform};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Instant;

    struct ScriptedFetcher {
        platform: Platform,
        script: Mutex<VecDeque<Result<Vec<RawItem>, FetchError>>>,
    }

    impl ScriptedFetcher {
        fn new(platform: Platform, script: Vec<Result<Vec<RawItem>, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                platform,
                script: Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl PollFetcher for ScriptedFetcher {
        fn platform(&self) -> Platform {
            self.platform
        }

        fn name(&self) -> String {
            format!("scripted-{}", self.platform)
        }

        async fn poll(&self) -> Result<Vec<RawItem>, FetchError> {
            self.script.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn item(id: &str, text: &str) -> RawItem {
        RawItem {
            id: id.to_string(),
            source: "test".to_string(),
            timestamp: now_ms(),
            text: text.to_string(),
            author: None,
            engagement: 2.0,
            symbols_hint: Vec::new(),
        }
    }

    fn fast_tuning() -> SourceTuning {
        SourceTuning {
            poll_interval_ms: 10,
            retry: RetryPolicy {
                attempts: 3,
                base_delay_ms: 10,
                backoff_multiplier: 2.0,
            },
            ..SourceTuning::default()
        }
    }

    struct Harness {
        log: Arc<ActivityLog>,
        correlator: Arc<Correlator>,
        orchestrator: Orchestrator,
    }

    fn harness(mention_threshold: usize) -> Harness {
        let log = Arc::new(ActivityLog::new(ActivityLogConfig::default(), None));
        let correlator = Arc::new(Correlator::new(CorrelatorConfig {
            mention_threshold,
            ..CorrelatorConfig::default()
        }));
        correlator.spawn_consumer(&log);
        let deps = AdapterDeps {
            log: log.clone(),
            registry: Arc::new(SharedRegistry::default()),
        };
        let orchestrator = Orchestrator::new(deps, correlator.clone(), Some(2_000));
        Harness {
            log,
            correlator,
            orchestrator,
        }
    }

    fn rss_entry(enabled: bool) -> SourceEntry {
        SourceEntry {
            spec: SourceSpec::Rss {
                feeds: vec!["https://example.com/feed".to_string()],
            },
            tuning: SourceTuning {
                enabled,
                ..fast_tuning()
            },
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
    async fn lifecycle_transitions_are_explicit() {
        let h = harness(5);
        assert_eq!(h.orchestrator.state(), OrchestratorState::Uninitialized);

        // start before initialize is illegal.
        assert!(matches!(
            h.orchestrator.start(),
            Err(InitError::IllegalState(OrchestratorState::Uninitialized))
        ));

        h.orchestrator.initialize(vec![rss_entry(true)]).unwrap();
        assert_eq!(h.orchestrator.state(), OrchestratorState::Ready);

        // initialize twice is illegal from Ready.
        assert!(matches!(
            h.orchestrator.initialize(vec![rss_entry(true)]),
            Err(InitError::IllegalState(OrchestratorState::Ready))
        ));
    }

    #[tokio::test]
    async fn initialize_rejects_missing_credentials_and_empty_config() {
        let h = harness(5);
        let twitter = SourceEntry {
            spec: SourceSpec::Twitter {
                bearer_token: String::new(),
                rules: Vec::new(),
            },
            tuning: fast_tuning(),
        };
        std::env::remove_var("TWITTER_BEARER_TOKEN");
        assert!(matches!(
            h.orchestrator.initialize(vec![twitter]),
            Err(InitError::Auth(_))
        ));
        // Failure rolls back to Uninitialized so a fixed config can retry.
        assert_eq!(h.orchestrator.state(), OrchestratorState::Uninitialized);

        assert!(matches!(
            h.orchestrator.initialize(vec![rss_entry(false)]),
            Err(InitError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn pushshift_without_credentials_is_accepted() {
        let h = harness(5);
        let pushshift = SourceEntry {
            spec: SourceSpec::Pushshift {
                subreddits: vec!["CryptoCurrency".to_string()],
            },
            tuning: fast_tuning(),
        };
        h.orchestrator.initialize(vec![pushshift]).unwrap();
        assert_eq!(h.orchestrator.state(), OrchestratorState::Ready);
    }

    #[tokio::test]
    async fn single_platform_feed_counts_events_but_raises_no_signal() {
        let h = harness(5);
        h.orchestrator.initialize(vec![rss_entry(true)]).unwrap();

        // RSS enabled, twitter disabled: two positive BTC items.
        let fetcher = ScriptedFetcher::new(
            Platform::Rss,
            vec![Ok(vec![
                item("r1", "BTC rally gains momentum"),
                item("r2", "BTC buy pressure builds"),
            ])],
        );
        let deps = AdapterDeps {
            log: h.log.clone(),
            registry: Arc::new(SharedRegistry::default()),
        };
        let handle = Arc::new(crate::sources::spawn_polling_adapter(
            fetcher,
            fast_tuning(),
            deps,
        ));
        h.orchestrator.adopt_adapter_for_tests(handle);

        assert!(wait_for(|| h.log.total_events() == 2, 1_000).await);

        let stats = h.orchestrator.stats();
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.active_data_sources, 1);

        let events = h.log.recent_since(60_000);
        assert!(events.iter().all(|e| e.event.symbols == vec!["BTC"]));
        assert!(events.iter().all(|e| e.event.sentiment > 0.0));

        // One platform only: the correlator must stay quiet.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.correlator.active_signals().is_empty());

        h.orchestrator.stop().await;
        assert_eq!(h.orchestrator.state(), OrchestratorState::Stopped);
    }

    #[tokio::test]
    async fn two_platforms_above_threshold_raise_exactly_one_signal() {
        let h = harness(4);
        h.orchestrator.initialize(vec![rss_entry(true)]).unwrap();
        let mut outputs = h.correlator.subscribe();

        let deps = AdapterDeps {
            log: h.log.clone(),
            registry: Arc::new(SharedRegistry::default()),
        };
        let rss = Arc::new(crate::sources::spawn_polling_adapter(
            ScriptedFetcher::new(
                Platform::Rss,
                vec![Ok(vec![
                    item("r1", "BTC steady climb"),
                    item("r2", "BTC follow-up piece"),
                    item("r3", "BTC third mention"),
                ])],
            ),
            fast_tuning(),
            deps.clone(),
        ));
        let panic_feed = Arc::new(crate::sources::spawn_polling_adapter(
            ScriptedFetcher::new(
                Platform::CryptoPanic,
                vec![Ok(vec![
                    item("c1", "BTC coverage spreads"),
                    item("c2", "BTC everywhere now"),
                ])],
            ),
            fast_tuning(),
            deps,
        ));
        h.orchestrator.adopt_adapter_for_tests(rss);
        h.orchestrator.adopt_adapter_for_tests(panic_feed);

        assert!(wait_for(|| h.log.total_events() == 5, 2_000).await);
        assert!(wait_for(|| !h.correlator.active_signals().is_empty(), 1_000).await);

        let mut activity_signals = Vec::new();
        while let Ok(output) = outputs.try_recv() {
            if let CorrelatorOutput::Activity(signal) = output {
                activity_signals.push(signal);
            }
        }
        assert_eq!(activity_signals.len(), 1);
        let signal = &activity_signals[0];
        assert_eq!(signal.symbol, "BTC");
        assert!(signal.cross_platform_signal);
        // The signal fires on the threshold-crossing event (fourth mention);
        // the fifth lands inside the cooldown.
        assert_eq!(signal.total_mentions, 4);
        assert!(signal.platforms_seen.contains(&Platform::Rss));
        assert!(signal.platforms_seen.contains(&Platform::CryptoPanic));

        h.orchestrator.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_drains() {
        let h = harness(5);
        h.orchestrator.initialize(vec![rss_entry(true)]).unwrap();

        let deps = AdapterDeps {
            log: h.log.clone(),
            registry: Arc::new(SharedRegistry::default()),
        };
        let handle = Arc::new(crate::sources::spawn_polling_adapter(
            ScriptedFetcher::new(Platform::Rss, vec![Ok(vec![item("r1", "BTC note")])]),
            fast_tuning(),
            deps,
        ));
        h.orchestrator.adopt_adapter_for_tests(handle);
        assert!(wait_for(|| h.log.total_events() == 1, 1_000).await);

        h.orchestrator.stop().await;
        h.orchestrator.stop().await;
        assert_eq!(h.orchestrator.state(), OrchestratorState::Stopped);
        assert_eq!(h.orchestrator.stats().active_data_sources, 0);
    }

    #[tokio::test]
    async fn update_config_restarts_running_adapters_atomically() {
        let h = harness(5);
        h.orchestrator.initialize(vec![rss_entry(true)]).unwrap();
        // No real start: adopt a live adapter to stand in for the running set.
        let deps = AdapterDeps {
            log: h.log.clone(),
            registry: Arc::new(SharedRegistry::default()),
        };
        let handle = Arc::new(crate::sources::spawn_polling_adapter(
            ScriptedFetcher::new(Platform::Rss, vec![]),
            fast_tuning(),
            deps,
        ));
        h.orchestrator.adopt_adapter_for_tests(handle);

        // Swap to a config with pushshift enabled as well.
        let pushshift = SourceEntry {
            spec: SourceSpec::Pushshift {
                subreddits: vec!["CryptoCurrency".to_string()],
            },
            tuning: SourceTuning {
                // Long interval: the adapter stays Connecting without
                // touching the network during the test.
                poll_interval_ms: 3_600_000,
                rate_limit_per_min: 0,
                ..SourceTuning::default()
            },
        };
        h.orchestrator
            .update_config(vec![rss_entry(false), pushshift])
            .await
            .unwrap();

        assert!(h.orchestrator.is_active());
        let stats = h.orchestrator.stats();
        assert_eq!(stats.data_source_status.len(), 1);
        assert_eq!(stats.data_source_status[0].platform, Platform::Reddit);

        h.orchestrator.stop().await;
    }

    #[tokio::test]
    async fn update_config_is_illegal_before_initialize() {
        let h = harness(5);
        assert!(matches!(
            h.orchestrator.update_config(vec![rss_entry(true)]).await,
            Err(InitError::IllegalState(OrchestratorState::Uninitialized))
        ));
    }

    #[tokio::test]
    async fn adapter_panic_is_demoted_to_failed() {
        struct PanickingFetcher;

        #[async_trait]
        impl PollFetcher for PanickingFetcher {
            fn platform(&self) -> Platform {
                Platform::Rss
            }
            fn name(&self) -> String {
                "panicking".to_string()
            }
            async fn poll(&self) -> Result<Vec<RawItem>, FetchError> {
                panic!("worker bug");
            }
        }

        let h = harness(5);
        let deps = AdapterDeps {
            log: h.log.clone(),
            registry: Arc::new(SharedRegistry::default()),
        };
        let handle = Arc::new(crate::sources::spawn_polling_adapter(
            Arc::new(PanickingFetcher),
            fast_tuning(),
            deps,
        ));
        h.orchestrator.adopt_adapter_for_tests(handle.clone());

        // Reap directly (the supervisor does the same once a second).
        let deadline = Instant::now() + Duration::from_millis(2_000);
        while handle.state() != AdapterState::Failed && Instant::now() < deadline {
            handle.reap_if_finished().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.state(), AdapterState::Failed);

        // The orchestrator itself is unaffected.
        assert!(h.orchestrator.is_active());
        let stats = h.orchestrator.stats();
        assert_eq!(stats.active_data_sources, 0);
        assert_eq!(stats.data_source_status[0].state, AdapterState::Failed);

        h.orchestrator.stop().await;
    }
}
