// =============================================================================
// Engine Configuration — JSON-backed settings with atomic save
// =============================================================================
//
// Every tunable lives here: the source set, activity log retention, the
// correlator thresholds, and the circuit breaker limits. All fields carry
// serde defaults so that older config files keep loading as fields are
// added.
//
// Persistence uses the tmp + rename pattern to prevent corruption on crash.
// Credentials are normally left empty in the file and resolved from the
// environment at initialize time.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::activity::ActivityLogConfig;
use crate::archive::ArchiveConfig;
use crate::breaker::BreakerConfig;
use crate::correlator::CorrelatorConfig;
use crate::sources::{SourceEntry, SourceSpec, SourceTuning, StreamRule};

fn default_stop_timeout_ms() -> u64 {
    10_000
}

fn default_sources() -> Vec<SourceEntry> {
    vec![
        SourceEntry {
            spec: SourceSpec::Rss {
                feeds: vec![
                    "https://www.coindesk.com/arc/outboundfeeds/rss/".to_string(),
                    "https://cointelegraph.com/rss".to_string(),
                ],
            },
            tuning: SourceTuning::default(),
        },
        SourceEntry {
            spec: SourceSpec::CryptoPanic { api_key: String::new() },
            tuning: SourceTuning {
                enabled: false,
                ..SourceTuning::default()
            },
        },
        SourceEntry {
            spec: SourceSpec::LunarCrush { api_key: String::new() },
            tuning: SourceTuning {
                enabled: false,
                poll_interval_ms: 120_000,
                ..SourceTuning::default()
            },
        },
        SourceEntry {
            spec: SourceSpec::Pushshift {
                subreddits: vec![
                    "CryptoCurrency".to_string(),
                    "CryptoMoonShots".to_string(),
                    "SatoshiStreetBets".to_string(),
                ],
            },
            tuning: SourceTuning {
                enabled: false,
                ..SourceTuning::default()
            },
        },
        SourceEntry {
            spec: SourceSpec::Twitter {
                bearer_token: String::new(),
                rules: vec![
                    StreamRule {
                        value: "(crypto OR bitcoin OR altcoin) lang:en -is:retweet".to_string(),
                        tag: "crypto-chatter".to_string(),
                    },
                ],
            },
            tuning: SourceTuning {
                enabled: false,
                // Stream reconnects start at 30 s per the platform's policy.
                retry: crate::sources::RetryPolicy {
                    attempts: 4,
                    base_delay_ms: 30_000,
                    backoff_multiplier: 2.0,
                },
                ..SourceTuning::default()
            },
        },
    ]
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceEntry>,

    #[serde(default)]
    pub activity: ActivityLogConfig,

    #[serde(default)]
    pub correlator: CorrelatorConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Bound on orchestrator shutdown draining.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            activity: ActivityLogConfig::default(),
            correlator: CorrelatorConfig::default(),
            breaker: BreakerConfig::default(),
            archive: ArchiveConfig::default(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A missing file is an error so the caller can fall back to defaults
    /// with a warning; a present-but-invalid file is also an error so the
    /// binary can refuse to start.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            sources = config.sources.len(),
            "engine config loaded"
        );
        Ok(config)
    }

    /// Persist to `path` atomically (write `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialize engine config")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_shape() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.sources.len(), 5);
        // RSS is the only source enabled out of the box.
        let enabled: Vec<_> = cfg.sources.iter().filter(|s| s.tuning.enabled).collect();
        assert_eq!(enabled.len(), 1);
        assert!(matches!(enabled[0].spec, SourceSpec::Rss { .. }));

        assert_eq!(cfg.activity.max_entries, 50_000);
        assert_eq!(cfg.activity.ingress_capacity, 4096);
        assert_eq!(cfg.correlator.window_ms, 300_000);
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.stop_timeout_ms, 10_000);
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.sources.len(), 5);
        assert_eq!(cfg.correlator.mention_threshold, 5);
        assert!(cfg.breaker.enable_auto_halt);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{
            "correlator": { "mention_threshold": 9 },
            "sources": [
                { "type": "rss", "feeds": ["https://example.com/rss"] }
            ]
        }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.correlator.mention_threshold, 9);
        assert_eq!(cfg.correlator.cooldown_ms, 60_000);
        assert_eq!(cfg.sources.len(), 1);
        assert!(cfg.sources[0].tuning.enabled);
        assert_eq!(cfg.sources[0].tuning.poll_interval_ms, 60_000);
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.sources.len(), cfg2.sources.len());
        assert_eq!(cfg.activity.max_entries, cfg2.activity.max_entries);
        assert_eq!(cfg.breaker.failure_threshold, cfg2.breaker.failure_threshold);
    }

    #[test]
    fn save_then_load_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");

        let mut cfg = EngineConfig::default();
        cfg.correlator.mention_threshold = 7;
        cfg.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.correlator.mention_threshold, 7);
        // The tmp file was renamed away.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn load_missing_file_errors() {
        assert!(EngineConfig::load("/nonexistent/engine.json").is_err());
    }

    #[test]
    fn load_invalid_json_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(EngineConfig::load(&path).is_err());
    }
}
