// =============================================================================
// Text Enrichment — symbols, sentiment, and pump markers from raw text
// =============================================================================
//
// Pure pipeline: adapters feed every raw item through `enrich` before an
// Event is built. The `is_new` flag is not computed here because it depends
// on the activity log's retention horizon; the adapter resolves it.
// =============================================================================

pub mod pump;
pub mod registry;
pub mod sentiment;

pub use registry::{SharedRegistry, SymbolRegistry};

/// Output of the enrichment pipeline for one piece of text.
#[derive(Debug, Clone, Default)]
pub struct Enrichment {
    pub symbols: Vec<String>,
    pub sentiment: f64,
    pub confidence: f64,
    pub pump_indicators: Vec<String>,
    pub risk_score: f64,
}

/// Run symbol extraction, sentiment scoring, and pump detection over `text`
/// against the given registry snapshot. Deterministic for a fixed snapshot.
pub fn enrich(registry: &SymbolRegistry, text: &str) -> Enrichment {
    let symbols = registry.extract(text);
    let score = sentiment::score(text);
    let pump = pump::detect(text);

    Enrichment {
        symbols,
        sentiment: score.sentiment,
        confidence: score.confidence,
        pump_indicators: pump.indicators,
        risk_score: pump.risk_score,
    }
}
