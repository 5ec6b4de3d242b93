//! Error types for the appliance client.
//!
//! # Design
//! - Transport failures are a distinct variant from anything the appliance said,
//!   so callers can tell "we could not ask" from "the appliance answered".
//! - Verdicts are never errors; an unrecognised answer is classified, not raised.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias for appliance operations.
pub type ApplianceResult<T> = Result<T, ApplianceError>;

/// Errors raised while talking to the appliance.
#[derive(Debug, Error)]
pub enum ApplianceError {
    /// The request could not be delivered or the response not received,
    /// after every protocol-level retry.
    #[error("appliance transport failure")]
    Transport {
        /// Protocol operation (`lookup`, `poll`, `upload`, `download`).
        operation: &'static str,
        /// Attempts made before giving up.
        attempts: u32,
        /// Final transport error.
        source: reqwest::Error,
    },
    /// The appliance answered with a non-success HTTP status.
    #[error("appliance returned an error status")]
    Status {
        /// Protocol operation.
        operation: &'static str,
        /// HTTP status code.
        status: u16,
        /// Leading part of the response body.
        body: String,
    },
    /// The response body was not in the expected encoding.
    #[error("appliance response could not be decoded")]
    Decode {
        /// Protocol operation.
        operation: &'static str,
        /// Static reason for the failure.
        reason: &'static str,
        /// Underlying decoder error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// An endpoint URL could not be derived from the base URL.
    #[error("appliance endpoint is invalid")]
    Endpoint {
        /// Protocol operation.
        operation: &'static str,
        /// Underlying parse failure.
        source: url::ParseError,
    },
    /// The HTTP client could not be constructed from the settings.
    #[error("appliance client could not be configured")]
    Setup {
        /// Static reason for the failure.
        reason: &'static str,
        /// Underlying builder error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Reading the file to upload failed.
    #[error("appliance upload source unreadable")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// File being uploaded.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
}

impl ApplianceError {
    pub(crate) fn decode(
        operation: &'static str,
        reason: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Decode {
            operation,
            reason,
            source: source.into(),
        }
    }

    pub(crate) fn setup(
        reason: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Setup {
            reason,
            source: source.into(),
        }
    }

    /// Whether the failure happened below the protocol (network, TLS, timeout).
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Render a one-line operator-facing description including context fields.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Transport {
                operation,
                attempts,
                source,
            } => format!("{self}: {operation} after {attempts} attempt(s) ({source})"),
            Self::Status {
                operation,
                status,
                body,
            } => format!("{self}: {operation} HTTP {status} {body}"),
            Self::Decode {
                operation,
                reason,
                source,
            } => format!("{self}: {operation} {reason} ({source})"),
            Self::Endpoint { operation, source } => format!("{self}: {operation} ({source})"),
            Self::Setup { reason, source } => format!("{self}: {reason} ({source})"),
            Self::Io {
                operation,
                path,
                source,
            } => format!("{self}: {operation} {} ({source})", path.display()),
        }
    }
}
