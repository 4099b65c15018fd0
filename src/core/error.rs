use thiserror::Error;

#[derive(Error, Debug)]
pub enum PermissionError {
    #[error("Invalid instrument key: {0} (must be EXCHANGE:SYMBOL, e.g., NSE:RELIANCE)")]
    InvalidInstrumentKey(String),

    #[error("Invalid instrument pattern: {0} (only a single trailing '*' wildcard is allowed)")]
    InvalidInstrumentPattern(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Rule not found: {0}")]
    RuleNotFound(i64),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Store unavailable: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Audit write failed, mutation rolled back: {0}")]
    AuditWrite(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PermissionError>;
