// =============================================================================
// Symbol Registry — two-tier ticker extraction from raw text
// =============================================================================
//
// Tier (a): a known ticker set matched case-insensitively on whole words.
// Tier (b): `$TICKER` cashtags, 2-6 uppercase alphanumerics.
//
// Common-word collisions (ONE, NEAR, DOT, ...) only match from tier (a) when
// the text also carries a crypto context word, or when written as a cashtag.
//
// The registry is read-mostly: it is published through an `ArcSwap` so that
// every adapter reads lock-free and a reload is a single pointer swap.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use regex::Regex;

static CASHTAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$([A-Za-z][A-Za-z0-9]{1,5})\b").expect("cashtag pattern"));

static WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z][A-Za-z0-9]*").expect("word pattern"));

/// Immutable snapshot of the ticker sets used for extraction.
#[derive(Debug, Clone)]
pub struct SymbolRegistry {
    /// Uppercased known tickers.
    tickers: HashSet<String>,
    /// Subset of `tickers` that collide with common English words and need a
    /// cashtag or crypto context word before they count.
    ambiguous: HashSet<String>,
    /// Lowercased words that establish crypto context for ambiguous tickers.
    context_words: HashSet<String>,
}

impl SymbolRegistry {
    pub fn new(
        tickers: impl IntoIterator<Item = impl Into<String>>,
        ambiguous: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            tickers: tickers.into_iter().map(|t| t.into().to_uppercase()).collect(),
            ambiguous: ambiguous.into_iter().map(|t| t.into().to_uppercase()).collect(),
            context_words: default_context_words(),
        }
    }

    /// Registry preloaded with the majors plus the usual meme/alt suspects.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_TICKERS.iter().copied(), AMBIGUOUS_TICKERS.iter().copied())
    }

    pub fn contains(&self, ticker: &str) -> bool {
        self.tickers.contains(&ticker.to_uppercase())
    }

    pub fn len(&self) -> usize {
        self.tickers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickers.is_empty()
    }

    /// Extract the unique uppercased symbols mentioned in `text`, in order of
    /// first appearance. Deterministic for a given registry snapshot.
    pub fn extract(&self, text: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        // Tier (b): cashtags are unambiguous regardless of collisions.
        for cap in CASHTAG.captures_iter(text) {
            let sym = cap[1].to_uppercase();
            if sym.len() >= 2 && sym.len() <= 6 && seen.insert(sym.clone()) {
                out.push(sym);
            }
        }

        // Tier (a): known tickers on whole words, collision-guarded.
        let has_context = self.has_crypto_context(text);
        for word in WORD.find_iter(text) {
            let sym = word.as_str().to_uppercase();
            if !self.tickers.contains(&sym) {
                continue;
            }
            if self.ambiguous.contains(&sym) && !has_context {
                continue;
            }
            if seen.insert(sym.clone()) {
                out.push(sym);
            }
        }

        out
    }

    fn has_crypto_context(&self, text: &str) -> bool {
        WORD.find_iter(text)
            .any(|w| self.context_words.contains(&w.as_str().to_lowercase()))
    }
}

impl Default for SymbolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Lock-free shared handle over the current [`SymbolRegistry`].
///
/// Readers call [`SharedRegistry::load`] on every extraction; a reload swaps
/// the pointer atomically and in-flight readers keep their old snapshot.
pub struct SharedRegistry {
    inner: ArcSwap<SymbolRegistry>,
}

impl SharedRegistry {
    pub fn new(registry: SymbolRegistry) -> Self {
        Self {
            inner: ArcSwap::from_pointee(registry),
        }
    }

    pub fn load(&self) -> Arc<SymbolRegistry> {
        self.inner.load_full()
    }

    pub fn reload(&self, registry: SymbolRegistry) {
        self.inner.store(Arc::new(registry));
    }
}

impl Default for SharedRegistry {
    fn default() -> Self {
        Self::new(SymbolRegistry::with_defaults())
    }
}

const DEFAULT_TICKERS: &[&str] = &[
    "BTC", "ETH", "BNB", "XRP", "SOL", "ADA", "DOGE", "TRX", "TON", "AVAX", "SHIB", "LINK",
    "DOT", "MATIC", "LTC", "BCH", "UNI", "ATOM", "XLM", "NEAR", "INJ", "APT", "ARB", "OP",
    "FIL", "PEPE", "SUI", "SEI", "RNDR", "FET", "TIA", "WIF", "BONK", "FLOKI", "JUP", "PYTH",
    "ALGO", "VET", "HBAR", "ICP", "SAND", "MANA", "AXS", "GALA", "ONE", "GAS", "APE", "CAKE",
];

const AMBIGUOUS_TICKERS: &[&str] = &[
    "ONE", "NEAR", "DOT", "LINK", "OP", "ATOM", "APE", "GAS", "CAKE", "SAND", "MANA",
];

fn default_context_words() -> HashSet<String> {
    [
        "crypto", "coin", "coins", "token", "tokens", "price", "pump", "dump", "chart",
        "altcoin", "altcoins", "bullish", "bearish", "moon", "hodl", "breakout", "buy",
        "sell", "trading", "exchange", "blockchain", "defi", "market",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}
