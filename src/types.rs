// =============================================================================
// Shared types used across the Pulsewire sentiment engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Current UNIX timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Platform a normalized event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Rss,
    Reddit,
    Twitter,
    CryptoPanic,
    LunarCrush,
    System,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rss => write!(f, "rss"),
            Self::Reddit => write!(f, "reddit"),
            Self::Twitter => write!(f, "twitter"),
            Self::CryptoPanic => write!(f, "cryptopanic"),
            Self::LunarCrush => write!(f, "lunarcrush"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Severity of a cross-platform signal. Ordered so that comparisons express
/// upgrades: `Critical > High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Normalized unit of observed activity produced by every source adapter.
///
/// Immutable once published: adapters build the full event (including
/// enrichment fields) before handing it to the activity log, and nothing
/// mutates it afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Stable per-source item id (tweet id, reddit id, feed guid, ...).
    pub id: String,
    pub platform: Platform,
    /// Free-form origin inside the platform (subreddit, feed name, ...).
    pub source: String,
    /// Millisecond epoch timestamp of the underlying item.
    pub timestamp: i64,
    pub text: String,
    #[serde(default)]
    pub author: Option<String>,
    /// Source-specific engagement normalized to a single number
    /// (upvotes + comments, vote total, interaction count, ...).
    #[serde(default)]
    pub engagement: f64,
    /// Uppercased ticker symbols extracted from `text`.
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Sentiment in [-1, 1].
    #[serde(default)]
    pub sentiment: f64,
    /// Scorer confidence in [0, 1].
    #[serde(default)]
    pub confidence: f64,
    /// Pump-indicator tags ("urgency_language", "coordinated_posting", ...).
    #[serde(default)]
    pub pump_indicators: Vec<String>,
    /// Aggregate risk in [0, 1] derived from the pump indicators.
    #[serde(default)]
    pub risk_score: f64,
    /// True iff no symbol of this event was seen in the last 24 h.
    #[serde(default)]
    pub is_new: bool,
}
