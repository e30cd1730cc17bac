// =============================================================================
// Activity Log — time-ordered in-memory event store with pub/sub fan-out
// =============================================================================
//
// All adapters publish into one bounded ingress queue. A single delivery
// worker drains it, assigns the insertion sequence, appends to the store,
// mirrors a best-effort durable write when a writer is configured, and fans
// out to subscribers over a broadcast channel. The worker is the only
// ordering authority: `seq` is totally ordered across adapters.
//
// Slow subscribers never block insertion. A receiver that falls more than
// `subscriber_capacity` events behind observes `Lagged(n)` from its channel
// and then resumes, still in order.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::archive::ArchiveWriter;
use crate::types::{now_ms, Event, Platform};

// =============================================================================
// Configuration
// =============================================================================

fn default_max_entries() -> usize {
    50_000
}

fn default_max_age_ms() -> i64 {
    24 * 60 * 60 * 1000
}

fn default_ingress_capacity() -> usize {
    4096
}

fn default_subscriber_capacity() -> usize {
    1024
}

fn default_publish_timeout_ms() -> u64 {
    500
}

/// Retention and queue sizing for the activity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLogConfig {
    /// Hard cap on stored entries; FIFO eviction beyond it.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Entries older than this are evicted regardless of count.
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: i64,

    /// Capacity of the shared ingress queue feeding the delivery worker.
    #[serde(default = "default_ingress_capacity")]
    pub ingress_capacity: usize,

    /// Per-subscriber fan-out buffer before the subscriber lags.
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,

    /// How long a publisher blocks on a full ingress queue before dropping.
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

impl Default for ActivityLogConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_age_ms: default_max_age_ms(),
            ingress_capacity: default_ingress_capacity(),
            subscriber_capacity: default_subscriber_capacity(),
            publish_timeout_ms: default_publish_timeout_ms(),
        }
    }
}

// =============================================================================
// Entries
// =============================================================================

/// An event plus the insertion sequence assigned by the delivery worker.
#[derive(Debug, Clone)]
pub struct LoggedEvent {
    pub seq: u64,
    pub event: Arc<Event>,
}

struct Store {
    entries: VecDeque<LoggedEvent>,
    next_seq: u64,
    max_entries: usize,
    max_age_ms: i64,
}

impl Store {
    /// Assign the next sequence, append, and evict. The sequence must be
    /// strictly monotone; a regression is a bug, not a runtime condition.
    fn append(&mut self, event: Arc<Event>) -> LoggedEvent {
        if let Some(last) = self.entries.back() {
            assert!(
                self.next_seq > last.seq,
                "activity log sequence regressed: {} after {}",
                self.next_seq,
                last.seq
            );
        }

        let logged = LoggedEvent {
            seq: self.next_seq,
            event,
        };
        self.next_seq += 1;
        self.entries.push_back(logged.clone());

        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
        let cutoff = now_ms() - self.max_age_ms;
        while self
            .entries
            .front()
            .map(|e| e.event.timestamp < cutoff)
            .unwrap_or(false)
        {
            self.entries.pop_front();
        }

        logged
    }
}

// =============================================================================
// ActivityLog
// =============================================================================

/// Capacity of the best-effort durable mirror queue.
const DURABLE_QUEUE_CAPACITY: usize = 1024;

pub struct ActivityLog {
    ingress_tx: mpsc::Sender<Arc<Event>>,
    fanout_tx: broadcast::Sender<LoggedEvent>,
    store: Arc<RwLock<Store>>,
    total_events: Arc<AtomicU64>,
    dropped_events: AtomicU64,
    publish_timeout: Duration,
}

impl ActivityLog {
    /// Build the log and spawn its delivery worker (and, when a durable
    /// writer is supplied, the mirror worker).
    pub fn new(config: ActivityLogConfig, durable: Option<Arc<dyn ArchiveWriter>>) -> Self {
        let (ingress_tx, ingress_rx) = mpsc::channel::<Arc<Event>>(config.ingress_capacity);
        let (fanout_tx, _) = broadcast::channel::<LoggedEvent>(config.subscriber_capacity);

        let store = Arc::new(RwLock::new(Store {
            entries: VecDeque::new(),
            next_seq: 0,
            max_entries: config.max_entries,
            max_age_ms: config.max_age_ms,
        }));
        let total_events = Arc::new(AtomicU64::new(0));

        let durable_tx = durable.map(|writer| {
            let (tx, rx) = mpsc::channel::<LoggedEvent>(DURABLE_QUEUE_CAPACITY);
            tokio::spawn(run_durable_mirror(rx, writer));
            tx
        });

        tokio::spawn(run_delivery_worker(
            ingress_rx,
            fanout_tx.clone(),
            store.clone(),
            total_events.clone(),
            durable_tx,
        ));

        Self {
            ingress_tx,
            fanout_tx,
            store,
            total_events,
            dropped_events: AtomicU64::new(0),
            publish_timeout: Duration::from_millis(config.publish_timeout_ms),
        }
    }

    /// Publish an event. Blocks up to the publish timeout when the ingress
    /// queue is full, then drops the event and returns `false`.
    pub async fn log(&self, event: Event) -> bool {
        let event = Arc::new(event);
        match tokio::time::timeout(self.publish_timeout, self.ingress_tx.send(event)).await {
            Ok(Ok(())) => true,
            _ => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                debug!("activity log ingress full or closed — event dropped");
                false
            }
        }
    }

    /// Register a subscriber. The receiver yields every subsequent event in
    /// insertion order, or `RecvError::Lagged(n)` if it fell behind.
    pub fn subscribe(&self) -> broadcast::Receiver<LoggedEvent> {
        self.fanout_tx.subscribe()
    }

    // -------------------------------------------------------------------------
    // Queries (insertion order)
    // -------------------------------------------------------------------------

    /// Entries whose timestamp is within the last `duration_ms`.
    pub fn recent_since(&self, duration_ms: i64) -> Vec<LoggedEvent> {
        let cutoff = now_ms() - duration_ms;
        self.store
            .read()
            .entries
            .iter()
            .filter(|e| e.event.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Entries with `start <= timestamp < end`.
    pub fn range(&self, start: i64, end: i64) -> Vec<LoggedEvent> {
        self.store
            .read()
            .entries
            .iter()
            .filter(|e| e.event.timestamp >= start && e.event.timestamp < end)
            .cloned()
            .collect()
    }

    pub fn by_platform(&self, platform: Platform) -> Vec<LoggedEvent> {
        self.store
            .read()
            .entries
            .iter()
            .filter(|e| e.event.platform == platform)
            .cloned()
            .collect()
    }

    /// Entries at or above the given risk score.
    pub fn by_min_risk(&self, min_risk: f64) -> Vec<LoggedEvent> {
        self.store
            .read()
            .entries
            .iter()
            .filter(|e| e.event.risk_score >= min_risk)
            .cloned()
            .collect()
    }

    /// Whether any stored event within the last `duration_ms` mentions
    /// `symbol`. Backs the `is_new` flag on freshly built events.
    ///
    /// Full scan: entries are ordered by seq, not by timestamp (adapters
    /// stamp events from their own source clocks), so an early exit on the
    /// first stale timestamp would skip in-window entries beneath it.
    pub fn seen_symbol_since(&self, symbol: &str, duration_ms: i64) -> bool {
        let cutoff = now_ms() - duration_ms;
        self.store
            .read()
            .entries
            .iter()
            .filter(|e| e.event.timestamp >= cutoff)
            .any(|e| e.event.symbols.iter().any(|s| s == symbol))
    }

    // -------------------------------------------------------------------------
    // Counters
    // -------------------------------------------------------------------------

    /// Events delivered into the store since startup (not affected by
    /// eviction).
    pub fn total_events(&self) -> u64 {
        self.total_events.load(Ordering::Relaxed)
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.store.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().entries.is_empty()
    }

    /// Wait until every in-flight publish has been drained by the delivery
    /// worker, bounded by `timeout`. Returns `false` on deadline.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.ingress_tx.capacity() == self.ingress_tx.max_capacity() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

// =============================================================================
// Workers
// =============================================================================

async fn run_delivery_worker(
    mut ingress_rx: mpsc::Receiver<Arc<Event>>,
    fanout_tx: broadcast::Sender<LoggedEvent>,
    store: Arc<RwLock<Store>>,
    total_events: Arc<AtomicU64>,
    durable_tx: Option<mpsc::Sender<LoggedEvent>>,
) {
    while let Some(event) = ingress_rx.recv().await {
        let logged = store.write().append(event);
        total_events.fetch_add(1, Ordering::Relaxed);

        if let Some(tx) = &durable_tx {
            // Best effort: a full mirror queue must never block delivery.
            let _ = tx.try_send(logged.clone());
        }

        // A send error only means there are currently no subscribers.
        let _ = fanout_tx.send(logged);
    }
    debug!("activity log delivery worker stopped");
}

async fn run_durable_mirror(
    mut rx: mpsc::Receiver<LoggedEvent>,
    writer: Arc<dyn ArchiveWriter>,
) {
    while let Some(logged) = rx.recv().await {
        let date = chrono::Utc::now().format("%Y-%m-%d");
        let key = format!("archive:{date}:{}", logged.seq);
        let value = match serde_json::to_value(logged.event.as_ref()) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to serialize event for durable mirror");
                continue;
            }
        };
        if let Err(e) = writer
            .put(&key, value, Some(Duration::from_secs(90 * 24 * 3600)))
            .await
        {
            warn!(error = %e, key = %key, "durable mirror write failed");
        }
    }
}
