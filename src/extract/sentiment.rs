// =============================================================================
// Sentiment Scorer — token-weighted crypto lexicon
// =============================================================================

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9']+").expect("word pattern"));

/// Positive/negative coefficients for the crypto vocabulary. Weights express
/// how strongly a single token moves the score before normalization.
static LEXICON: Lazy<HashMap<&'static str, f64>> = Lazy::new(|| {
    let entries: &[(&str, f64)] = &[
        // Positive
        ("moon", 0.8),
        ("mooning", 0.8),
        ("bullish", 0.7),
        ("ath", 0.7),
        ("breakout", 0.6),
        ("rally", 0.6),
        ("surge", 0.6),
        ("gem", 0.6),
        ("pump", 0.5),
        ("gains", 0.5),
        ("profit", 0.5),
        ("undervalued", 0.5),
        ("buy", 0.4),
        ("hodl", 0.4),
        ("win", 0.4),
        ("accumulate", 0.4),
        ("long", 0.3),
        ("green", 0.3),
        ("up", 0.2),
        // Negative
        ("scam", -0.9),
        ("rug", -0.9),
        ("rugpull", -0.9),
        ("crash", -0.8),
        ("rekt", -0.8),
        ("bearish", -0.7),
        ("dump", -0.7),
        ("dumping", -0.7),
        ("fud", -0.6),
        ("dead", -0.6),
        ("loss", -0.5),
        ("bubble", -0.5),
        ("overvalued", -0.5),
        ("sell", -0.4),
        ("drop", -0.4),
        ("short", -0.3),
        ("red", -0.3),
        ("down", -0.2),
    ];
    entries.iter().copied().collect()
});

/// Token matches needed before the scorer reports full confidence.
const FULL_CONFIDENCE_MATCHES: usize = 5;

/// Result of scoring a piece of text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SentimentScore {
    /// Mean matched coefficient, clamped to [-1, 1].
    pub sentiment: f64,
    /// `min(1, matches / 5)`.
    pub confidence: f64,
    pub matches: usize,
}

/// Score `text` against the lexicon. Pure and deterministic.
pub fn score(text: &str) -> SentimentScore {
    let lower = text.to_lowercase();
    let mut sum = 0.0;
    let mut matches = 0usize;

    for word in WORD.find_iter(&lower) {
        if let Some(weight) = LEXICON.get(word.as_str()) {
            sum += weight;
            matches += 1;
        }
    }

    let sentiment = if matches == 0 {
        0.0
    } else {
        (sum / matches as f64).clamp(-1.0, 1.0)
    };

    SentimentScore {
        sentiment,
        confidence: (matches as f64 / FULL_CONFIDENCE_MATCHES as f64).min(1.0),
        matches,
    }
}
