// =============================================================================
// Central Application State — Pulsewire Sentiment Engine
// =============================================================================
//
// Ties the subsystems together behind one Arc<AppState>: the activity log,
// the correlator (with its consumer task), the orchestrator, the circuit
// breaker, and the archiver. Constructed once at startup; tests build fresh
// instances, so nothing here is module-level state.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::activity::ActivityLog;
use crate::archive::{ArchiveWriter, Archiver, MemoryArchiveWriter};
use crate::breaker::CircuitBreaker;
use crate::correlator::{Correlator, SymbolActivitySignal};
use crate::extract::SharedRegistry;
use crate::orchestrator::{Orchestrator, OrchestratorStats};
use crate::runtime_config::EngineConfig;
use crate::sources::AdapterDeps;
use crate::types::Platform;

pub struct AppState {
    pub config: RwLock<EngineConfig>,
    pub registry: Arc<SharedRegistry>,
    pub activity_log: Arc<ActivityLog>,
    pub correlator: Arc<Correlator>,
    pub orchestrator: Arc<Orchestrator>,
    pub breaker: Arc<CircuitBreaker>,
    pub archiver: Arc<Archiver>,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Build all subsystems from `config` and wire the correlator consumer.
    /// Must run inside the tokio runtime (workers are spawned here).
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Self::with_archive_writer(config, Arc::new(MemoryArchiveWriter::new()))
    }

    /// Same as [`AppState::new`] with an explicit archive backend.
    pub fn with_archive_writer(config: EngineConfig, writer: Arc<dyn ArchiveWriter>) -> Arc<Self> {
        let registry = Arc::new(SharedRegistry::default());
        let activity_log = Arc::new(ActivityLog::new(config.activity.clone(), Some(writer.clone())));
        let correlator = Arc::new(Correlator::new(config.correlator.clone()));
        correlator.spawn_consumer(&activity_log);

        let deps = AdapterDeps {
            log: activity_log.clone(),
            registry: registry.clone(),
        };
        let orchestrator = Arc::new(Orchestrator::new(
            deps,
            correlator.clone(),
            Some(config.stop_timeout_ms),
        ));
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let archiver = Arc::new(Archiver::new(
            activity_log.clone(),
            correlator.clone(),
            writer,
            config.archive.clone(),
        ));

        Arc::new(Self {
            config: RwLock::new(config),
            registry,
            activity_log,
            correlator,
            orchestrator,
            breaker,
            archiver,
            start_time: std::time::Instant::now(),
        })
    }

    /// Snapshot for `GET /live/status`.
    pub fn live_status(&self) -> LiveStatus {
        LiveStatus {
            is_active: self.orchestrator.is_active(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            stats: self.orchestrator.stats(),
            active_signals: self.orchestrator.get_active_signals(),
            config: self.config_summary(),
        }
    }

    /// Source configuration with credentials left out.
    pub fn config_summary(&self) -> Vec<SourceSummary> {
        self.orchestrator
            .get_config()
            .iter()
            .map(|entry| SourceSummary {
                platform: entry.spec.platform(),
                enabled: entry.tuning.enabled,
                poll_interval_ms: entry.tuning.poll_interval_ms,
                rate_limit_per_min: entry.tuning.rate_limit_per_min,
            })
            .collect()
    }
}

/// Per-source view safe to serialize into API responses (no credentials).
#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub platform: Platform,
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub rate_limit_per_min: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveStatus {
    pub is_active: bool,
    pub uptime_secs: u64,
    pub stats: OrchestratorStats,
    pub active_signals: Vec<SymbolActivitySignal>,
    pub config: Vec<SourceSummary>,
}
