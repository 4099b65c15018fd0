//! Instrument glob patterns
//!
//! Grant rules scope instruments with patterns like `NSE:NIFTY*`. Matching is
//! case-sensitive, anchored, and never crosses the exchange segment:
//! `NSE:NIFTY*` matches `NSE:NIFTY50` but not `BSE:NIFTY50`. Only a single
//! trailing `*` is supported.
//!
//! Patterns compile once into a matcher held on the rule, so the evaluation
//! path does plain prefix comparisons and never re-parses.

use crate::core::error::{PermissionError, Result};
use serde::de::{Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One compiled instrument pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentPattern {
    raw: String,
    /// `EXCHANGE:PREFIX` for wildcard patterns, the full key otherwise
    prefix: String,
    wildcard: bool,
}

impl InstrumentPattern {
    /// Compile a pattern string
    ///
    /// # Errors
    ///
    /// Returns `InvalidInstrumentPattern` for anything other than
    /// `EXCHANGE:SYMBOL` with at most one trailing `*`.
    ///
    /// # Examples
    ///
    /// ```
    /// use tradegate_rs::InstrumentPattern;
    ///
    /// let pat = InstrumentPattern::compile("NSE:NIFTY*").unwrap();
    /// assert!(pat.matches("NSE:NIFTY50"));
    /// assert!(pat.matches("NSE:NIFTY"));
    /// assert!(!pat.matches("BSE:NIFTY50"));
    ///
    /// assert!(InstrumentPattern::compile("NSE:*BANK").is_err()); // mid-string
    /// assert!(InstrumentPattern::compile("*:NIFTY").is_err()); // exchange wildcard
    /// ```
    pub fn compile(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(PermissionError::InvalidInstrumentPattern(
                "pattern cannot be empty".to_string(),
            ));
        }

        let (body, wildcard) = match raw.strip_suffix('*') {
            Some(body) => (body, true),
            None => (raw, false),
        };

        // After stripping the trailing wildcard no other '*' may remain
        if body.contains('*') {
            return Err(PermissionError::InvalidInstrumentPattern(format!(
                "pattern '{}' may only use a single trailing '*'",
                raw
            )));
        }

        let (exchange, symbol) = match body.split_once(':') {
            Some(parts) => parts,
            None => {
                return Err(PermissionError::InvalidInstrumentPattern(format!(
                    "pattern '{}' must be EXCHANGE:SYMBOL",
                    raw
                )));
            }
        };

        let exchange_ok = !exchange.is_empty()
            && exchange.chars().next().is_some_and(|c| c.is_ascii_uppercase())
            && exchange
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
        if !exchange_ok {
            return Err(PermissionError::InvalidInstrumentPattern(format!(
                "pattern '{}' has an invalid exchange segment",
                raw
            )));
        }

        let symbol_ok = symbol
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || "&._-".contains(c));
        if !symbol_ok || (symbol.is_empty() && !wildcard) || symbol.contains(':') {
            return Err(PermissionError::InvalidInstrumentPattern(format!(
                "pattern '{}' has an invalid symbol segment",
                raw
            )));
        }

        Ok(InstrumentPattern {
            raw: raw.to_string(),
            prefix: body.to_string(),
            wildcard,
        })
    }

    /// Match an instrument key against this pattern.
    ///
    /// Anchored and case-sensitive; a wildcard consumes any suffix of the
    /// symbol segment, including the empty one.
    pub fn matches(&self, key: &str) -> bool {
        if self.wildcard {
            key.starts_with(self.prefix.as_str())
        } else {
            key == self.prefix
        }
    }

    /// The original pattern string
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }
}

impl std::fmt::Display for InstrumentPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// A compiled list of instrument patterns attached to a grant rule
///
/// Serializes as the raw pattern strings. Deserialization is lenient: stored
/// patterns that no longer compile are dropped with a warning so evaluation
/// never fails on bad persisted data (a dropped pattern simply never matches).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InstrumentFilter {
    patterns: Vec<InstrumentPattern>,
}

impl InstrumentFilter {
    /// Compile a list of pattern strings, rejecting the whole list on the
    /// first malformed entry. This is the mutation-time path.
    pub fn compile(raw: &[String]) -> Result<Self> {
        let patterns = raw
            .iter()
            .map(|p| InstrumentPattern::compile(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(InstrumentFilter { patterns })
    }

    /// Compile leniently, skipping malformed entries. This is the load path
    /// for stored rules, which must never fail evaluation.
    pub fn compile_lenient(raw: &[String]) -> Self {
        let patterns = raw
            .iter()
            .filter_map(|p| match InstrumentPattern::compile(p) {
                Ok(pat) => Some(pat),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "skipping unparseable stored instrument pattern");
                    None
                }
            })
            .collect();
        InstrumentFilter { patterns }
    }

    pub fn from_patterns(patterns: Vec<InstrumentPattern>) -> Self {
        InstrumentFilter { patterns }
    }

    /// Whether any pattern matches the key.
    pub fn matches(&self, key: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(key))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// The raw pattern strings, in order.
    pub fn raw_patterns(&self) -> Vec<String> {
        self.patterns.iter().map(|p| p.raw.clone()).collect()
    }
}

impl Serialize for InstrumentFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.patterns.len()))?;
        for p in &self.patterns {
            seq.serialize_element(p.as_str())?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for InstrumentFilter {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        struct FilterVisitor;

        impl<'de> Visitor<'de> for FilterVisitor {
            type Value = InstrumentFilter;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a list of instrument pattern strings")
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<InstrumentFilter, A::Error> {
                let mut raw = Vec::new();
                while let Some(p) = seq.next_element::<String>()? {
                    raw.push(p);
                }
                Ok(InstrumentFilter::compile_lenient(&raw))
            }
        }

        deserializer.deserialize_seq(FilterVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_pattern() {
        let pat = InstrumentPattern::compile("NSE:HDFCBANK").unwrap();
        assert!(pat.matches("NSE:HDFCBANK"));
        assert!(!pat.matches("NSE:HDFC"));
        assert!(!pat.matches("NSE:HDFCBANKLTD"));
        assert!(!pat.matches("BSE:HDFCBANK"));
        assert!(!pat.is_wildcard());
    }

    #[test]
    fn test_wildcard_pattern() {
        let pat = InstrumentPattern::compile("NSE:NIFTY*").unwrap();
        assert!(pat.matches("NSE:NIFTY"));
        assert!(pat.matches("NSE:NIFTY50"));
        assert!(pat.matches("NSE:NIFTYBANK"));
        assert!(!pat.matches("BSE:NIFTY50"));
        assert!(!pat.matches("NSE:BANKNIFTY"));
        assert!(pat.is_wildcard());
    }

    #[test]
    fn test_exchange_wide_wildcard() {
        let pat = InstrumentPattern::compile("MCX:*").unwrap();
        assert!(pat.matches("MCX:GOLDM"));
        assert!(pat.matches("MCX:SILVER"));
        assert!(!pat.matches("NSE:GOLDBEES"));
    }

    #[test]
    fn test_case_sensitive_and_anchored() {
        let pat = InstrumentPattern::compile("NSE:TCS").unwrap();
        assert!(!pat.matches("nse:tcs"));
        assert!(!pat.matches("XNSE:TCS"));
        assert!(!pat.matches(" NSE:TCS"));
    }

    #[test]
    fn test_rejected_patterns() {
        assert!(InstrumentPattern::compile("").is_err());
        assert!(InstrumentPattern::compile("*").is_err());
        assert!(InstrumentPattern::compile("NSE:*BANK").is_err()); // mid-string
        assert!(InstrumentPattern::compile("NSE:NI*TY*").is_err()); // two wildcards
        assert!(InstrumentPattern::compile("*:NIFTY").is_err()); // exchange wildcard
        assert!(InstrumentPattern::compile("NIFTY50").is_err()); // no exchange
        assert!(InstrumentPattern::compile("nse:NIFTY*").is_err()); // lowercase exchange
        assert!(InstrumentPattern::compile("NSE:").is_err()); // empty symbol, no wildcard
        assert!(InstrumentPattern::compile("NSE:A:B").is_err()); // second colon
    }

    #[test]
    fn test_filter_matching() {
        let filter = InstrumentFilter::compile(&[
            "NSE:HDFCBANK".to_string(),
            "NSE:NIFTY*".to_string(),
        ])
        .unwrap();
        assert!(filter.matches("NSE:HDFCBANK"));
        assert!(filter.matches("NSE:NIFTY50"));
        assert!(!filter.matches("NSE:RELIANCE"));
        assert_eq!(filter.len(), 2);
    }

    #[test]
    fn test_filter_strict_rejects_whole_list() {
        let raw = vec!["NSE:TCS".to_string(), "bad pattern".to_string()];
        assert!(InstrumentFilter::compile(&raw).is_err());
    }

    #[test]
    fn test_filter_lenient_skips_bad_entries() {
        let raw = vec![
            "NSE:TCS".to_string(),
            "bad pattern".to_string(),
            "NSE:INFY".to_string(),
        ];
        let filter = InstrumentFilter::compile_lenient(&raw);
        assert_eq!(filter.len(), 2);
        assert!(filter.matches("NSE:TCS"));
        assert!(filter.matches("NSE:INFY"));
        assert!(!filter.matches("bad pattern"));
    }

    #[test]
    fn test_filter_serde_roundtrip() {
        let filter =
            InstrumentFilter::compile(&["NSE:NIFTY*".to_string(), "NSE:TCS".to_string()])
                .unwrap();
        let json = serde_json::to_string(&filter).unwrap();
        assert_eq!(json, r#"["NSE:NIFTY*","NSE:TCS"]"#);

        let back: InstrumentFilter = serde_json::from_str(&json).unwrap();
        assert_eq!(back, filter);
    }

    #[test]
    fn test_filter_deserialize_drops_bad_stored_patterns() {
        let back: InstrumentFilter =
            serde_json::from_str(r#"["NSE:TCS","NSE:**","garbage"]"#).unwrap();
        assert_eq!(back.len(), 1);
        assert!(back.matches("NSE:TCS"));
    }
}
