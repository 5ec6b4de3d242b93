//! # Design
//!
//! - Structured, constant-message errors for hashing, transfer, and tree maintenance.
//! - Operation identifiers (`digest.read`, `transfer.copy`, ...) carry the context.
//! - Retryability is decided here so the transfer loop and its callers agree.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for filesystem operations.
pub type FsOpsResult<T> = Result<T, FsOpsError>;

/// Errors produced by filesystem operations.
#[derive(Debug, Error)]
pub enum FsOpsError {
    /// IO failures while interacting with the filesystem.
    #[error("fsops io failure")]
    Io {
        /// Operation that triggered the IO failure.
        operation: &'static str,
        /// Path involved in the IO failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Walkdir traversal failures.
    #[error("fsops walkdir failure")]
    Walkdir {
        /// Operation that triggered the walkdir failure.
        operation: &'static str,
        /// Path involved in the walkdir failure.
        path: PathBuf,
        /// Underlying walkdir error.
        source: walkdir::Error,
    },
    /// A copied file did not hash to the digest of its source.
    #[error("fsops checksum mismatch")]
    ChecksumMismatch {
        /// Destination whose content was rejected.
        path: PathBuf,
        /// Digest of the source before the copy.
        expected: String,
        /// Digest observed at the destination.
        actual: String,
    },
    /// Every transfer attempt failed.
    #[error("fsops transfer retries exhausted")]
    RetriesExhausted {
        /// Source file, left in place.
        source_path: PathBuf,
        /// Requested destination.
        destination: PathBuf,
        /// Attempts made.
        attempts: u32,
        /// Failure of the final attempt.
        #[source]
        last: Box<FsOpsError>,
    },
    /// The copy was committed but the source could not be deleted, so the
    /// file now exists in both places.
    #[error("fsops source not removed after copy")]
    SourceNotRemoved {
        /// Source file, still present.
        source_path: PathBuf,
        /// Committed destination holding the full copy.
        destination: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Input validation failures.
    #[error("fsops invalid input")]
    InvalidInput {
        /// Field that failed validation.
        field: &'static str,
        /// Static reason for the failure.
        reason: &'static str,
        /// Offending value when available.
        value: Option<String>,
    },
    /// A blocking filesystem task could not be joined.
    #[error("fsops blocking task failed")]
    Join {
        /// Operation that was running on the blocking pool.
        operation: &'static str,
        /// Underlying join error.
        source: tokio::task::JoinError,
    },
}

impl FsOpsError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn walkdir(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: walkdir::Error,
    ) -> Self {
        Self::Walkdir {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Whether a transfer attempt that failed with this error may be retried.
    ///
    /// A vanished source, malformed input, or a committed destination whose
    /// source could not be removed is final; locks, network blips and corrupt
    /// copies get another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io {
                operation, source, ..
            } => match *operation {
                "transfer.source" => source.kind() != io::ErrorKind::NotFound,
                _ => true,
            },
            Self::ChecksumMismatch { .. } | Self::Walkdir { .. } => true,
            Self::RetriesExhausted { .. }
            | Self::SourceNotRemoved { .. }
            | Self::InvalidInput { .. }
            | Self::Join { .. } => false,
        }
    }

    /// Render a one-line operator-facing description including context fields.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Io {
                operation,
                path,
                source,
            } => format!("{self}: {operation} {} ({source})", path.display()),
            Self::Walkdir {
                operation,
                path,
                source,
            } => format!("{self}: {operation} {} ({source})", path.display()),
            Self::ChecksumMismatch {
                path,
                expected,
                actual,
            } => format!(
                "{self}: {} expected {expected} got {actual}",
                path.display()
            ),
            Self::RetriesExhausted {
                source_path,
                destination,
                attempts,
                last,
            } => format!(
                "{self}: {} -> {} after {attempts} attempts; last: {}",
                source_path.display(),
                destination.display(),
                last.describe()
            ),
            Self::SourceNotRemoved {
                source_path,
                destination,
                source,
            } => format!(
                "{self}: {} still present, copy committed at {} ({source})",
                source_path.display(),
                destination.display()
            ),
            Self::InvalidInput {
                field,
                reason,
                value,
            } => match value {
                Some(value) => format!("{self}: {field} {reason} ({value})"),
                None => format!("{self}: {field} {reason}"),
            },
            Self::Join { operation, source } => format!("{self}: {operation} ({source})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use walkdir::WalkDir;

    #[test]
    fn fsops_error_helpers_build_variants() -> Result<(), Box<dyn Error>> {
        let io_err = FsOpsError::io("digest.read", "path", io::Error::other("io"));
        assert!(matches!(io_err, FsOpsError::Io { .. }));
        assert!(io_err.source().is_some());

        let temp = tempfile::tempdir()?;
        let missing = temp.path().join("missing");
        let walkdir_error = WalkDir::new(&missing)
            .into_iter()
            .next()
            .and_then(Result::err)
            .ok_or_else(|| io::Error::other("expected walkdir error"))?;
        let walk_err = FsOpsError::walkdir("discover.walk", &missing, walkdir_error);
        assert!(matches!(walk_err, FsOpsError::Walkdir { .. }));
        assert!(walk_err.source().is_some());
        Ok(())
    }

    #[test]
    fn missing_source_is_not_retryable() {
        let missing = FsOpsError::io(
            "transfer.source",
            "/gone",
            io::Error::from(io::ErrorKind::NotFound),
        );
        assert!(!missing.is_retryable());

        let locked = FsOpsError::io(
            "transfer.copy",
            "/busy",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(locked.is_retryable());

        let mismatch = FsOpsError::ChecksumMismatch {
            path: PathBuf::from("/dst"),
            expected: "a".into(),
            actual: "b".into(),
        };
        assert!(mismatch.is_retryable());
    }

    #[test]
    fn retries_exhausted_describes_last_failure() {
        let err = FsOpsError::RetriesExhausted {
            source_path: PathBuf::from("/in/a.txt"),
            destination: PathBuf::from("/out/a.txt"),
            attempts: 3,
            last: Box::new(FsOpsError::io(
                "transfer.copy",
                "/out/a.txt",
                io::Error::other("disk full"),
            )),
        };
        let text = err.describe();
        assert!(text.contains("after 3 attempts"));
        assert!(text.contains("disk full"));
        assert!(err.source().is_some());
    }

    #[test]
    fn stranded_source_is_final_and_names_both_paths() {
        let err = FsOpsError::SourceNotRemoved {
            source_path: PathBuf::from("/in/a.txt"),
            destination: PathBuf::from("/out/a.txt"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert!(!err.is_retryable());
        let text = err.describe();
        assert!(text.contains("/in/a.txt still present"));
        assert!(text.contains("copy committed at /out/a.txt"));
        assert!(err.source().is_some());
    }
}
