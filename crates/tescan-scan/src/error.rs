//! # Design
//!
//! - One variant per way a file can end without a trustworthy verdict.
//! - Transfer failures are not here: they are recorded on the result and never
//!   change a verdict that was already reached.

use std::io;
use std::path::PathBuf;

use tescan_appliance::ApplianceError;
use tescan_fsops::FsOpsError;
use thiserror::Error;

use crate::state::ScanState;

/// Result type for orchestration steps.
pub type ScanResult<T> = Result<T, ScanError>;

/// Errors that end a file's analysis.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The input tree could not be walked.
    #[error("input tree could not be discovered")]
    Discovery {
        /// Underlying filesystem error.
        source: FsOpsError,
    },
    /// The source could not be read for hashing.
    #[error("file could not be hashed")]
    Hash {
        /// Underlying filesystem error.
        source: FsOpsError,
    },
    /// The appliance could not be asked, or answered with an HTTP error.
    #[error("appliance request failed")]
    Appliance {
        /// Orchestration stage issuing the request.
        stage: &'static str,
        /// Underlying client error.
        source: ApplianceError,
    },
    /// The appliance refused the upload.
    #[error("appliance rejected the upload")]
    UploadRejected {
        /// Label the appliance returned.
        label: String,
    },
    /// No verdict arrived within the poll budget.
    #[error("no verdict within the poll budget")]
    PollTimeout {
        /// Poll attempts made.
        attempts: u32,
    },
    /// A transcript or report artifact could not be written.
    #[error("report artifact could not be written")]
    Report {
        /// Operation identifier.
        operation: &'static str,
        /// Artifact path.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// The state machine was asked to make a move it does not allow.
    #[error("invalid scan state transition")]
    InvalidTransition {
        /// State the task was in.
        from: ScanState,
        /// State that was requested.
        to: ScanState,
    },
}

impl ScanError {
    pub(crate) fn report(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: io::Error,
    ) -> Self {
        Self::Report {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Short machine-friendly kind used in logs and summaries.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Discovery { .. } => "discovery",
            Self::Hash { .. } => "hash",
            Self::Appliance { source, .. } if source.is_transport() => "appliance_transport",
            Self::Appliance { .. } => "appliance",
            Self::UploadRejected { .. } => "upload_rejected",
            Self::PollTimeout { .. } => "poll_timeout",
            Self::Report { .. } => "report",
            Self::InvalidTransition { .. } => "invalid_transition",
        }
    }

    /// Render a one-line operator-facing description including context fields.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Discovery { source } | Self::Hash { source } => {
                format!("{self}: {}", source.describe())
            }
            Self::Appliance { stage, source } => {
                format!("{self} during {stage}: {}", source.describe())
            }
            Self::UploadRejected { label } => format!("{self}: {label}"),
            Self::PollTimeout { attempts } => format!("{self}: {attempts} attempt(s)"),
            Self::Report {
                operation,
                path,
                source,
            } => format!("{self}: {operation} {} ({source})", path.display()),
            Self::InvalidTransition { from, to } => {
                format!("{self}: {} -> {}", from.as_str(), to.as_str())
            }
        }
    }
}
