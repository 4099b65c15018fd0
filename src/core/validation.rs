//! Validation for instrument keys
//!
//! Instrument keys name a tradable instrument as `EXCHANGE:SYMBOL` and are the
//! unit both restrictions and cache keys operate on. Validation happens at
//! mutation time only; stored data is never re-validated on the evaluation path.

use crate::core::error::{PermissionError, Result};
use regex::Regex;

/// A validated instrument key (`EXCHANGE:SYMBOL`)
///
/// # Rules
/// - Exchange: uppercase letters and digits, starting with a letter
/// - Exactly one `:` separator
/// - Symbol: uppercase letters, digits, and `& . _ -`
/// - No wildcards (a `*` makes it a pattern, not a key)
/// - Length: 3-64 characters
///
/// # Examples
///
/// ```
/// use tradegate_rs::InstrumentKey;
///
/// let key = InstrumentKey::new("NSE:RELIANCE").unwrap();
/// assert_eq!(key.as_str(), "NSE:RELIANCE");
/// assert_eq!(key.exchange(), "NSE");
/// assert_eq!(key.symbol(), "RELIANCE");
///
/// assert!(InstrumentKey::new("nse:reliance").is_err()); // lowercase
/// assert!(InstrumentKey::new("NSE:NIFTY*").is_err()); // wildcard
/// assert!(InstrumentKey::new("RELIANCE").is_err()); // missing exchange
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstrumentKey(String);

impl InstrumentKey {
    /// Pattern for valid instrument keys
    const PATTERN: &'static str = r"^[A-Z][A-Z0-9]*:[A-Z0-9][A-Z0-9&._-]*$";

    /// Maximum length
    const MAX_LENGTH: usize = 64;

    /// Create a new validated instrument key
    ///
    /// # Errors
    ///
    /// Returns `InvalidInstrumentKey` if the key doesn't meet validation rules.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(InstrumentKey(key))
    }

    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(PermissionError::InvalidInstrumentKey(
                "key cannot be empty".to_string(),
            ));
        }

        if key.len() > Self::MAX_LENGTH {
            return Err(PermissionError::InvalidInstrumentKey(format!(
                "key too long (max {} characters)",
                Self::MAX_LENGTH
            )));
        }

        if key.contains('*') {
            return Err(PermissionError::InvalidInstrumentKey(format!(
                "key '{}' contains a wildcard; keys name exactly one instrument",
                key
            )));
        }

        let re = Regex::new(Self::PATTERN).unwrap();
        if !re.is_match(key) {
            return Err(PermissionError::InvalidInstrumentKey(format!(
                "key '{}' must be EXCHANGE:SYMBOL in uppercase",
                key
            )));
        }

        Ok(())
    }

    /// Get the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to String
    pub fn into_string(self) -> String {
        self.0
    }

    /// The exchange part (before the colon)
    pub fn exchange(&self) -> &str {
        // Validation guarantees exactly one colon
        self.0.split(':').next().unwrap_or(&self.0)
    }

    /// The symbol part (after the colon)
    pub fn symbol(&self) -> &str {
        self.0.split(':').nth(1).unwrap_or("")
    }
}

impl AsRef<str> for InstrumentKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validate a batch of instrument keys, returning them in order.
///
/// Used by restriction mutations, which take explicit key lists.
pub fn validate_keys(keys: &[String]) -> Result<Vec<InstrumentKey>> {
    keys.iter().map(|k| InstrumentKey::new(k.clone())).collect()
}
