//! Error types for configuration loading and validation.
//!
//! # Design
//! - Constant messages; offending field, reason, and value travel as context.
//! - Every variant is fatal for the run: nothing is scanned with a bad config.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias for configuration results.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Primary error type for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field was absent from every configuration source.
    #[error("missing configuration field")]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },
    /// Field contained an invalid value.
    #[error("invalid configuration field")]
    InvalidField {
        /// Field that failed validation.
        field: &'static str,
        /// Machine-readable reason for the failure.
        reason: &'static str,
        /// Offending value when available.
        value: Option<String>,
    },
    /// Two directory roots resolved to the same path.
    #[error("directory roots must be distinct")]
    DuplicateRoot {
        /// First field sharing the path.
        first: &'static str,
        /// Second field sharing the path.
        second: &'static str,
        /// The shared path.
        path: PathBuf,
    },
    /// One directory root lives inside another.
    #[error("directory roots must not be nested")]
    NestedRoot {
        /// Field holding the outer directory.
        outer: &'static str,
        /// Field holding the nested directory.
        inner: &'static str,
    },
    /// The appliance address could not be turned into an endpoint URL.
    #[error("invalid appliance address")]
    InvalidUrl {
        /// Address as supplied by the operator.
        value: String,
        /// Underlying URL parse failure.
        source: url::ParseError,
    },
    /// The YAML configuration file could not be parsed.
    #[error("invalid configuration file")]
    Yaml {
        /// Path of the configuration file.
        path: PathBuf,
        /// Underlying YAML error.
        source: serde_yaml::Error,
    },
    /// File system operation failed.
    #[error("configuration filesystem operation failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Path involved in the failure.
        path: PathBuf,
        /// Source IO error.
        source: io::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: &'static str, value: impl ToString) -> Self {
        Self::InvalidField {
            field,
            reason,
            value: Some(value.to_string()),
        }
    }

    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Render a one-line operator-facing description including context fields.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::MissingField { field } => format!("{self}: '{field}' is required"),
            Self::InvalidField {
                field,
                reason,
                value,
            } => match value {
                Some(value) => format!("{self}: '{field}' {reason} (got '{value}')"),
                None => format!("{self}: '{field}' {reason}"),
            },
            Self::DuplicateRoot {
                first,
                second,
                path,
            } => format!(
                "{self}: '{first}' and '{second}' both resolve to {}",
                path.display()
            ),
            Self::NestedRoot { outer, inner } => {
                format!("{self}: '{inner}' lies inside '{outer}'")
            }
            Self::InvalidUrl { value, source } => format!("{self}: '{value}' ({source})"),
            Self::Yaml { path, source } => format!("{self}: {} ({source})", path.display()),
            Self::Io {
                operation,
                path,
                source,
            } => format!("{self}: {operation} {} ({source})", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn describe_includes_context_fields() {
        let err = ConfigError::invalid("concurrency", "must be at least 1", 0);
        let text = err.describe();
        assert!(text.contains("concurrency"));
        assert!(text.contains("got '0'"));

        let missing = ConfigError::MissingField {
            field: "appliance_ip",
        };
        assert!(missing.describe().contains("appliance_ip"));
    }

    #[test]
    fn io_helper_preserves_source() {
        let err = ConfigError::io("read", "/tmp/x", io::Error::other("boom"));
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.source().is_some());
    }
}
