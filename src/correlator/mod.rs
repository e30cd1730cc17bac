// =============================================================================
// Cross-Platform Correlator — per-symbol sliding windows over the activity log
// =============================================================================
//
// Consumes the activity log subscription on its own task, maintains a rolling
// window per symbol (mentions, sentiment, engagement, risk, platform set) and
// raises signals when cross-platform thresholds are crossed.
//
// Debounce: a symbol emits at most one signal per cooldown unless its risk
// level increases. Within a window the risk level only upgrades. Signals are
// emitted in the order of the triggering event's insertion sequence because
// there is exactly one consumer task.
// =============================================================================

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::{ActivityLog, LoggedEvent};
use crate::types::{now_ms, Platform, RiskLevel};

// =============================================================================
// Configuration
// =============================================================================

fn default_window_ms() -> i64 {
    5 * 60 * 1000
}

fn default_mention_threshold() -> usize {
    5
}

fn default_cooldown_ms() -> i64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatorConfig {
    /// Sliding window width per symbol.
    #[serde(default = "default_window_ms")]
    pub window_ms: i64,

    /// Mentions required (together with >= 2 platforms) to raise a signal.
    #[serde(default = "default_mention_threshold")]
    pub mention_threshold: usize,

    /// Minimum spacing between same-or-lower-risk signals per symbol.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: i64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            mention_threshold: default_mention_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

// =============================================================================
// Signals
// =============================================================================

/// Rolling aggregate for one symbol over the current window.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolActivitySignal {
    pub symbol: String,
    pub window_ms: i64,
    pub total_mentions: usize,
    pub platforms_seen: Vec<Platform>,
    pub avg_sentiment: f64,
    pub avg_risk_score: f64,
    pub first_seen: i64,
    pub last_seen: i64,
    pub total_engagement: f64,
    pub cross_platform_signal: bool,
}

/// Raised when a symbol is active on >= 2 platforms above threshold.
/// At most one is active per symbol; its risk level only upgrades.
#[derive(Debug, Clone, Serialize)]
pub struct CrossPlatformSignal {
    pub symbol: String,
    pub risk_level: RiskLevel,
    pub contributing_platforms: Vec<Platform>,
    pub first_crossed_at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorrelatorOutput {
    Activity(SymbolActivitySignal),
    CrossPlatform(CrossPlatformSignal),
}

// =============================================================================
// Internals
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    ts: i64,
    platform: Platform,
    sentiment: f64,
    engagement: f64,
    risk: f64,
}

#[derive(Default)]
struct SymbolWindow {
    entries: VecDeque<WindowEntry>,
}

impl SymbolWindow {
    fn prune(&mut self, cutoff: i64) {
        while self.entries.front().map(|e| e.ts < cutoff).unwrap_or(false) {
            self.entries.pop_front();
        }
    }
}

struct ActiveSignal {
    signal: SymbolActivitySignal,
    risk_level: RiskLevel,
    first_crossed_at: i64,
    last_emitted_ms: i64,
}

/// Fan-out capacity for correlator outputs (SSE handlers and loggers).
const OUTPUT_CAPACITY: usize = 256;

// =============================================================================
// Correlator
// =============================================================================

pub struct Correlator {
    config: RwLock<CorrelatorConfig>,
    windows: Mutex<HashMap<String, SymbolWindow>>,
    active: RwLock<HashMap<String, ActiveSignal>>,
    out_tx: broadcast::Sender<CorrelatorOutput>,
}

impl Correlator {
    pub fn new(config: CorrelatorConfig) -> Self {
        let (out_tx, _) = broadcast::channel(OUTPUT_CAPACITY);
        Self {
            config: RwLock::new(config),
            windows: Mutex::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            out_tx,
        }
    }

    /// Subscribe to emitted signals.
    pub fn subscribe(&self) -> broadcast::Receiver<CorrelatorOutput> {
        self.out_tx.subscribe()
    }

    pub fn config(&self) -> CorrelatorConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: CorrelatorConfig) {
        info!(
            window_ms = config.window_ms,
            mention_threshold = config.mention_threshold,
            cooldown_ms = config.cooldown_ms,
            "correlator config updated"
        );
        *self.config.write() = config;
    }

    /// Snapshot of the currently active cross-platform aggregates.
    pub fn active_signals(&self) -> Vec<SymbolActivitySignal> {
        self.active.read().values().map(|a| a.signal.clone()).collect()
    }

    /// Symbols with an active cross-platform signal (used by the archiver to
    /// tag cross-platform-origin alerts).
    pub fn active_cross_symbols(&self) -> HashSet<String> {
        self.active.read().keys().cloned().collect()
    }

    /// Spawn the consumer task over an activity log subscription.
    pub fn spawn_consumer(self: &Arc<Self>, log: &ActivityLog) -> JoinHandle<()> {
        let correlator = self.clone();
        let mut rx = log.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(logged) => correlator.on_event(&logged),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "correlator lagged behind the activity log");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("correlator consumer stopped");
        })
    }

    /// Process one logged event. Errors are isolated per symbol: a failure
    /// in one symbol's window never reaches the producer or other symbols.
    pub fn on_event(&self, logged: &LoggedEvent) {
        for symbol in &logged.event.symbols {
            if let Err(e) = self.update_symbol(symbol, logged) {
                warn!(symbol = %symbol, error = %e, "symbol window update failed — skipped");
            }
        }
    }

    fn update_symbol(&self, symbol: &str, logged: &LoggedEvent) -> anyhow::Result<()> {
        let config = self.config.read().clone();
        let event = &logged.event;

        // Update the sliding window for this symbol.
        let aggregate = {
            let mut windows = self.windows.lock();
            let window = windows.entry(symbol.to_string()).or_default();
            window.entries.push_back(WindowEntry {
                ts: event.timestamp,
                platform: event.platform,
                sentiment: event.sentiment,
                engagement: event.engagement,
                risk: event.risk_score,
            });
            window.prune(event.timestamp - config.window_ms);
            aggregate_window(symbol, &config, window)
        };

        let cross = aggregate.platforms_seen.len() >= 2
            && aggregate.total_mentions >= config.mention_threshold;

        let now = now_ms();
        let mut active = self.active.write();

        // A symbol quiet for a full window starts from scratch.
        if let Some(existing) = active.get(symbol) {
            if existing.signal.last_seen < event.timestamp - config.window_ms {
                active.remove(symbol);
            }
        }

        if !cross {
            return Ok(());
        }

        let mut signal = aggregate;
        signal.cross_platform_signal = true;
        let level = risk_level_for(event.risk_score, &signal, config.mention_threshold);

        match active.entry(symbol.to_string()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                let level = level.max(existing.risk_level); // never downgrade
                let upgraded = level > existing.risk_level;
                let in_cooldown = now < existing.last_emitted_ms + config.cooldown_ms;

                existing.signal = signal.clone();
                existing.risk_level = level;

                if in_cooldown && !upgraded {
                    return Ok(());
                }
                existing.last_emitted_ms = now;
                let cross_signal = CrossPlatformSignal {
                    symbol: symbol.to_string(),
                    risk_level: level,
                    contributing_platforms: signal.platforms_seen.clone(),
                    first_crossed_at: existing.first_crossed_at,
                };

                debug!(symbol = %symbol, risk = %level, upgraded, "cross-platform signal re-emitted");
                let _ = self.out_tx.send(CorrelatorOutput::Activity(signal));
                if upgraded {
                    let _ = self.out_tx.send(CorrelatorOutput::CrossPlatform(cross_signal));
                }
            }
            Entry::Vacant(entry) => {
                let cross_signal = CrossPlatformSignal {
                    symbol: symbol.to_string(),
                    risk_level: level,
                    contributing_platforms: signal.platforms_seen.clone(),
                    first_crossed_at: event.timestamp,
                };
                entry.insert(ActiveSignal {
                    signal: signal.clone(),
                    risk_level: level,
                    first_crossed_at: event.timestamp,
                    last_emitted_ms: now,
                });

                info!(
                    symbol = %symbol,
                    platforms = signal.platforms_seen.len(),
                    mentions = signal.total_mentions,
                    risk = %level,
                    "cross-platform signal raised"
                );
                let _ = self.out_tx.send(CorrelatorOutput::Activity(signal));
                let _ = self.out_tx.send(CorrelatorOutput::CrossPlatform(cross_signal));
            }
        }

        Ok(())
    }
}

fn aggregate_window(
    symbol: &str,
    config: &CorrelatorConfig,
    window: &SymbolWindow,
) -> SymbolActivitySignal {
    let n = window.entries.len().max(1) as f64;
    let mut platforms: Vec<Platform> = Vec::new();
    let mut sentiment_sum = 0.0;
    let mut risk_sum = 0.0;
    let mut engagement_sum = 0.0;

    for entry in &window.entries {
        if !platforms.contains(&entry.platform) {
            platforms.push(entry.platform);
        }
        sentiment_sum += entry.sentiment;
        risk_sum += entry.risk;
        engagement_sum += entry.engagement;
    }

    SymbolActivitySignal {
        symbol: symbol.to_string(),
        window_ms: config.window_ms,
        total_mentions: window.entries.len(),
        platforms_seen: platforms,
        avg_sentiment: sentiment_sum / n,
        avg_risk_score: risk_sum / n,
        first_seen: window.entries.front().map(|e| e.ts).unwrap_or(0),
        last_seen: window.entries.back().map(|e| e.ts).unwrap_or(0),
        total_engagement: engagement_sum,
        cross_platform_signal: false,
    }
}

/// Risk ladder for a freshly crossed signal. The critical rule follows the
/// escalation conditions; high/medium grade the remaining cross signals.
fn risk_level_for(
    event_risk: f64,
    signal: &SymbolActivitySignal,
    mention_threshold: usize,
) -> RiskLevel {
    let strong_spread = signal.platforms_seen.len() >= 3
        && signal.avg_sentiment.abs() >= 0.6
        && signal.total_mentions >= 2 * mention_threshold;

    if event_risk >= 0.8 || signal.avg_risk_score >= 0.8 || strong_spread {
        RiskLevel::Critical
    } else if signal.avg_risk_score >= 0.5 || signal.platforms_seen.len() >= 3 {
        RiskLevel::High
    } else {
        RiskLevel::Medium
    }
}
