//! Guard error types.

use thiserror::Error;

/// Errors that can occur while configuring or mutating a guard.
///
/// Evaluation itself never fails: patterns are compiled when a rule is
/// registered, and detector timeouts are reported on the result instead.
#[derive(Debug, Error)]
pub enum GuardError {
    /// A rule with this name is already registered.
    #[error("rule already exists: {0}")]
    DuplicateRule(String),

    /// No rule with this name is registered.
    #[error("rule not found: {0}")]
    RuleNotFound(String),

    /// The rule pattern failed to compile.
    #[error("invalid pattern for rule {name}: {source}")]
    InvalidPattern {
        /// Name of the rule being registered.
        name: String,
        /// Underlying regex error.
        #[source]
        source: regex::Error,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error (reading or writing a config file).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for guard operations.
pub type Result<T> = std::result::Result<T, GuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_rule_message_names_rule() {
        let err = GuardError::DuplicateRule("competitor_mention".to_string());
        assert_eq!(err.to_string(), "rule already exists: competitor_mention");
    }

    #[test]
    fn invalid_pattern_keeps_source() {
        let source = regex::Regex::new("(unclosed").unwrap_err();
        let err = GuardError::InvalidPattern {
            name: "broken".to_string(),
            source,
        };
        assert!(err.to_string().starts_with("invalid pattern for rule broken"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
