//! Per-file state machine.
//!
//! # Design
//! - `advance` is the only way to change state and rejects moves the
//!   lifecycle does not allow, so a bug surfaces as an error instead of a
//!   silently skipped stage.
//! - Analysis failures go through `ErrorTerminal`; the file is still relocated
//!   to the error root and reported, so every task finishes in `Done`.
//! - Digest and verdict are write-once.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tescan_appliance::Verdict;
use tescan_fsops::{DiscoveredFile, FileKind, Sha1Digest};
use tracing::debug;

use crate::error::{ScanError, ScanResult};

/// Lifecycle stage of a [`FileTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    /// Found under the input root, not yet dispatched.
    Discovered,
    /// Computing the content digest.
    Hashing,
    /// Asking the appliance whether it already knows the digest.
    CacheCheck,
    /// Sending the file.
    Uploading,
    /// Waiting for the verdict.
    Polling,
    /// Verdict known.
    VerdictReceived,
    /// Moving the file to the root chosen by its verdict.
    Relocating,
    /// Writing the transcript and any downloaded report.
    ReportWriting,
    /// Finished.
    Done,
    /// Analysis failed; the file is routed to the error root.
    ErrorTerminal,
}

impl ScanState {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Hashing => "hashing",
            Self::CacheCheck => "cache_check",
            Self::Uploading => "uploading",
            Self::Polling => "polling",
            Self::VerdictReceived => "verdict_received",
            Self::Relocating => "relocating",
            Self::ReportWriting => "report_writing",
            Self::Done => "done",
            Self::ErrorTerminal => "error_terminal",
        }
    }

    /// Whether `self -> next` is a legal move.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Discovered, Self::Hashing)
                | (Self::Hashing, Self::CacheCheck)
                | (Self::CacheCheck, Self::VerdictReceived | Self::Uploading)
                | (Self::Uploading, Self::Polling | Self::VerdictReceived)
                | (Self::Polling, Self::VerdictReceived)
                | (Self::VerdictReceived | Self::ErrorTerminal, Self::Relocating)
                | (Self::Relocating, Self::ReportWriting)
                | (Self::ReportWriting, Self::Done)
        ) || (matches!(next, Self::ErrorTerminal)
            && !matches!(self, Self::Done | Self::ErrorTerminal))
    }
}

/// One discovered file and everything learned about it during a run.
#[derive(Debug, Clone)]
pub struct FileTask {
    source_path: PathBuf,
    relative_path: PathBuf,
    kind: FileKind,
    content_hash: Option<Sha1Digest>,
    state: ScanState,
    verdict: Option<Verdict>,
    retry_count: u32,
    history: Vec<ScanState>,
}

impl FileTask {
    /// Task in the `Discovered` state.
    #[must_use]
    pub fn new(file: DiscoveredFile) -> Self {
        Self {
            source_path: file.source_path,
            relative_path: file.relative_path,
            kind: file.kind,
            content_hash: None,
            state: ScanState::Discovered,
            verdict: None,
            retry_count: 0,
            history: vec![ScanState::Discovered],
        }
    }

    /// Absolute path under the input root.
    #[must_use]
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Path relative to the input root.
    #[must_use]
    pub fn relative_path(&self) -> &Path {
        &self.relative_path
    }

    /// Scheduling lane.
    #[must_use]
    pub const fn kind(&self) -> FileKind {
        self.kind
    }

    /// Content digest, once hashed.
    #[must_use]
    pub const fn content_hash(&self) -> Option<&Sha1Digest> {
        self.content_hash.as_ref()
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ScanState {
        self.state
    }

    /// Verdict; `None` while pending.
    #[must_use]
    pub const fn verdict(&self) -> Option<Verdict> {
        self.verdict
    }

    /// Transfer attempts used by the relocation.
    #[must_use]
    pub const fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Every state visited, in order.
    #[must_use]
    pub fn history(&self) -> &[ScanState] {
        &self.history
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::InvalidTransition`] when the move is not allowed.
    pub fn advance(&mut self, next: ScanState) -> ScanResult<()> {
        if !self.state.can_advance_to(next) {
            return Err(ScanError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(
            path = %self.relative_path.display(),
            from = self.state.as_str(),
            to = next.as_str(),
            "scan state transition"
        );
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Record the content digest. A second call keeps the first value.
    pub fn set_content_hash(&mut self, digest: Sha1Digest) {
        if self.content_hash.is_none() {
            self.content_hash = Some(digest);
        }
    }

    /// Record the verdict. A second call keeps the first value.
    ///
    /// Returns the verdict now held.
    pub fn settle(&mut self, verdict: Verdict) -> Verdict {
        *self.verdict.get_or_insert(verdict)
    }

    pub(crate) const fn set_retry_count(&mut self, attempts: u32) {
        self.retry_count = attempts;
    }
}
