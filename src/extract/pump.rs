// =============================================================================
// Pump Indicators — regex families for coordinated-promotion markers
// =============================================================================
//
// Three families:
//   urgency_language    — "moon", "1000x", "last chance", "act now"
//   coordinated_posting — "pump at", "load up", "everyone buy"
//   influencer_mention  — shill-style handle dropping
//
// Each family that matches contributes its weight to the risk score, capped
// at 1.0. One tag per family regardless of how many patterns inside it hit.
// =============================================================================

use once_cell::sync::Lazy;
use regex::Regex;

struct Family {
    tag: &'static str,
    weight: f64,
    pattern: &'static Lazy<Regex>,
}

static URGENCY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(to the moon|mooning|going to moon|\d{2,4}x|last chance|don'?t miss( out)?|act now|hurry|easy money|guaranteed (gains|profit)|get in now|before it'?s too late)\b",
    )
    .expect("urgency pattern")
});

static COORDINATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(pump (at|starts|begins|together)|load up|everyone buy|buy together|coordinated|mass buy|all in at|join the pump|pump group|signal group)\b",
    )
    .expect("coordination pattern")
});

static INFLUENCER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(@\w+ (said|called|picked|shilled)|\b(elon|influencer|celebrity) (tweeted|posted|shilled|pumped)|\bas seen on\b|\bshilled by\b)",
    )
    .expect("influencer pattern")
});

static FAMILIES: &[Family] = &[
    Family { tag: "urgency_language", weight: 0.35, pattern: &URGENCY },
    Family { tag: "coordinated_posting", weight: 0.45, pattern: &COORDINATION },
    Family { tag: "influencer_mention", weight: 0.25, pattern: &INFLUENCER },
];

/// Detected pump markers plus the aggregate risk score in [0, 1].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PumpSignals {
    pub indicators: Vec<String>,
    pub risk_score: f64,
}

/// Scan `text` for pump-indicator families. Pure and deterministic.
pub fn detect(text: &str) -> PumpSignals {
    let mut out = PumpSignals::default();

    for family in FAMILIES {
        if family.pattern.is_match(text) {
            out.indicators.push(family.tag.to_string());
            out.risk_score += family.weight;
        }
    }

    out.risk_score = out.risk_score.min(1.0);
    out
}
