//! Crate-level error type.
//!
//! Recording calls never return these: persistence failures are logged and
//! broadcast instead. Errors only surface from construction, `load()`, and
//! configuration parsing.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LearnError>;

#[derive(Error, Debug)]
pub enum LearnError {
    /// The key/value backend refused a read or write.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value could not be decoded into its store type.
    #[error("corrupt value at `{key}`: {reason}")]
    CorruptValue { key: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_display() {
        let e = LearnError::Storage("disk full".into());
        assert_eq!(e.to_string(), "storage error: disk full");
    }

    #[test]
    fn test_corrupt_value_display_names_key() {
        let e = LearnError::CorruptValue {
            key: "learning.patterns".into(),
            reason: "expected map".into(),
        };
        assert!(e.to_string().contains("learning.patterns"));
    }

    #[test]
    fn test_serde_error_converts() {
        let parsed: std::result::Result<u32, _> = serde_json::from_str("nope");
        let e: LearnError = parsed.unwrap_err().into();
        assert!(matches!(e, LearnError::Serialization(_)));
    }
}
