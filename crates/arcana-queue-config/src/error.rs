//! Configuration errors.

use crate::validation::ConfigValidationError;
use thiserror::Error;

/// Errors raised while loading or validating queue configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration source could not be read or deserialized.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// The configuration was read but failed validation.
    #[error("Invalid configuration: {}", format_errors(.0))]
    Invalid(Vec<ConfigValidationError>),
}

fn format_errors(errors: &[ConfigValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_display_joins_all_errors() {
        let err = ConfigError::Invalid(vec![
            ConfigValidationError::ZeroValue {
                name: "worker.max_processes".into(),
            },
            ConfigValidationError::ZeroValue {
                name: "retry.max_attempts".into(),
            },
        ]);
        let msg = err.to_string();
        assert!(msg.contains("worker.max_processes"));
        assert!(msg.contains("retry.max_attempts"));
        assert!(msg.contains("; "));
    }
}
