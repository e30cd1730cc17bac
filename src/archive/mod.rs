// =============================================================================
// Archiver — periodic condensation of the activity log into durable summaries
// =============================================================================
//
// Caller-driven: `run_once` reads the recent activity window, aggregates it
// into one ArchiveEntry, and hands the entry to a pluggable writer. The core
// owns the aggregation semantics only; the storage backend is whatever
// implements `ArchiveWriter`.
//
// Key scheme:
//   archive:<YYYY-MM-DD>:<unix-seconds>   one entry per invocation, TTL 90 d
//   archive:daily:<YYYY-MM-DD>            rolling daily summary,   TTL 180 d
//   archive:index                         most recent keys, capped at 1,000
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::activity::ActivityLog;
use crate::correlator::Correlator;
use crate::types::Platform;

// =============================================================================
// Writer trait + in-memory backend
// =============================================================================

/// Pluggable key-value sink for archive entries. Implementations must be
/// safe to call concurrently; writes are best-effort from the caller's view.
#[async_trait]
pub trait ArchiveWriter: Send + Sync {
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()>;
}

/// In-memory writer used in tests and as the default backend.
#[derive(Default)]
pub struct MemoryArchiveWriter {
    entries: RwLock<HashMap<String, (serde_json::Value, Option<Duration>)>>,
    order: RwLock<Vec<String>>,
}

impl MemoryArchiveWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.read().get(key).map(|(v, _)| v.clone())
    }

    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.entries.read().get(key).and_then(|(_, ttl)| *ttl)
    }

    pub fn keys(&self) -> Vec<String> {
        self.order.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl ArchiveWriter for MemoryArchiveWriter {
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        let mut entries = self.entries.write();
        if !entries.contains_key(key) {
            self.order.write().push(key.to_string());
        }
        entries.insert(key.to_string(), (value, ttl));
        Ok(())
    }
}

// =============================================================================
// Configuration & entry types
// =============================================================================

fn default_archive_window_ms() -> i64 {
    6 * 60 * 60 * 1000
}

fn default_archive_interval_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// How far back each invocation looks into the activity log.
    #[serde(default = "default_archive_window_ms")]
    pub window_ms: i64,

    /// Spacing of the periodic archiver loop.
    #[serde(default = "default_archive_interval_secs")]
    pub interval_secs: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            window_ms: default_archive_window_ms(),
            interval_secs: default_archive_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopSymbol {
    pub symbol: String,
    pub mentions: usize,
    pub avg_sentiment: f64,
    pub total_engagement: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalAlert {
    pub event_id: String,
    pub platform: Platform,
    pub symbols: Vec<String>,
    pub risk_score: f64,
    /// True when the alert came from a cross-platform signal rather than a
    /// single high-risk event.
    pub cross_platform: bool,
}

/// One condensed snapshot of recent activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub id: String,
    pub created_at: i64,
    pub window_start: i64,
    pub window_end: i64,
    pub total_events: usize,
    pub platform_counts: HashMap<String, u64>,
    pub avg_sentiment: f64,
    pub top_symbols: Vec<TopSymbol>,
    pub critical_alerts: Vec<CriticalAlert>,
}

/// Risk score above which a single event becomes a critical alert.
const CRITICAL_RISK: f64 = 0.8;

/// Keys retained in `archive:index`.
const INDEX_CAP: usize = 1000;

const DAY: Duration = Duration::from_secs(24 * 3600);

// =============================================================================
// Archiver
// =============================================================================

pub struct Archiver {
    log: Arc<ActivityLog>,
    correlator: Arc<Correlator>,
    writer: Arc<dyn ArchiveWriter>,
    config: ArchiveConfig,
    index: Mutex<Vec<String>>,
}

impl Archiver {
    pub fn new(
        log: Arc<ActivityLog>,
        correlator: Arc<Correlator>,
        writer: Arc<dyn ArchiveWriter>,
        config: ArchiveConfig,
    ) -> Self {
        Self {
            log,
            correlator,
            writer,
            config,
            index: Mutex::new(Vec::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_secs)
    }

    /// Aggregate the recent window and persist one archive entry plus the
    /// daily rollup and index. Write failures are surfaced to the caller but
    /// never corrupt in-memory state.
    pub async fn run_once(&self) -> anyhow::Result<ArchiveEntry> {
        let now = chrono::Utc::now();
        let events = self.log.recent_since(self.config.window_ms);
        let cross_symbols = self.correlator.active_cross_symbols();

        let entry = build_entry(
            &events,
            &cross_symbols,
            now.timestamp_millis(),
            self.config.window_ms,
        );

        let date = now.format("%Y-%m-%d");
        let key = format!("archive:{date}:{}", now.timestamp());
        let value = serde_json::to_value(&entry)?;

        self.writer.put(&key, value.clone(), Some(90 * DAY)).await?;
        self.writer
            .put(&format!("archive:daily:{date}"), value, Some(180 * DAY))
            .await?;

        let index_snapshot = {
            let mut index = self.index.lock();
            index.push(key.clone());
            if index.len() > INDEX_CAP {
                let excess = index.len() - INDEX_CAP;
                index.drain(..excess);
            }
            index.clone()
        };
        if let Err(e) = self
            .writer
            .put("archive:index", serde_json::json!(index_snapshot), None)
            .await
        {
            warn!(error = %e, "archive index write failed");
        }

        info!(
            key = %key,
            total_events = entry.total_events,
            top_symbols = entry.top_symbols.len(),
            critical_alerts = entry.critical_alerts.len(),
            "archive entry written"
        );
        Ok(entry)
    }
}

fn build_entry(
    events: &[crate::activity::LoggedEvent],
    cross_symbols: &std::collections::HashSet<String>,
    now_ms: i64,
    window_ms: i64,
) -> ArchiveEntry {
    let mut platform_counts: HashMap<String, u64> = HashMap::new();
    let mut per_symbol: HashMap<String, TopSymbol> = HashMap::new();
    let mut sentiment_sum = 0.0;
    let mut critical_alerts = Vec::new();

    for logged in events {
        let event = &logged.event;
        *platform_counts.entry(event.platform.to_string()).or_insert(0) += 1;
        sentiment_sum += event.sentiment;

        for symbol in &event.symbols {
            let agg = per_symbol.entry(symbol.clone()).or_insert_with(|| TopSymbol {
                symbol: symbol.clone(),
                mentions: 0,
                avg_sentiment: 0.0,
                total_engagement: 0.0,
            });
            agg.mentions += 1;
            // Accumulate; averaged after the loop.
            agg.avg_sentiment += event.sentiment;
            agg.total_engagement += event.engagement;
        }

        let cross = event.symbols.iter().any(|s| cross_symbols.contains(s));
        if event.risk_score > CRITICAL_RISK || cross {
            critical_alerts.push(CriticalAlert {
                event_id: event.id.clone(),
                platform: event.platform,
                symbols: event.symbols.clone(),
                risk_score: event.risk_score,
                cross_platform: cross,
            });
        }
    }

    let mut top_symbols: Vec<TopSymbol> = per_symbol
        .into_values()
        .map(|mut agg| {
            agg.avg_sentiment /= agg.mentions.max(1) as f64;
            agg
        })
        .collect();
    top_symbols.sort_by(|a, b| b.mentions.cmp(&a.mentions).then(a.symbol.cmp(&b.symbol)));

    ArchiveEntry {
        id: Uuid::new_v4().to_string(),
        created_at: now_ms,
        window_start: now_ms - window_ms,
        window_end: now_ms,
        total_events: events.len(),
        avg_sentiment: sentiment_sum / events.len().max(1) as f64,
        platform_counts,
        top_symbols,
        critical_alerts,
    }
}
