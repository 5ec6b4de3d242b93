//! Transcript and analysis-report artifacts.
//!
//! # Design
//! - Artifacts mirror the input tree under the reports root, named after the
//!   source file plus a suffix.
//! - Writes use `create_new`; an existing artifact is never overwritten and the
//!   new one takes a digest-suffixed name instead.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tescan_appliance::Verdict;
use tescan_fsops::{Sha1Digest, resolve_collision};

use crate::error::{ScanError, ScanResult};

/// Suffix of the exchange transcript written for every file.
pub const TRANSCRIPT_SUFFIX: &str = ".response.json";
/// Suffix of the analysis report downloaded for malicious files.
pub const REPORT_SUFFIX: &str = ".report.tar.gz";

const WRITE_ATTEMPTS: usize = 4;

/// One request/response pair sent to the appliance.
#[derive(Debug, Clone, Serialize)]
pub struct Exchange {
    /// Orchestration stage (`lookup`, `upload`, `poll`).
    pub stage: &'static str,
    /// When the response arrived.
    pub at: DateTime<Utc>,
    /// Request body.
    pub request: Value,
    /// Response body.
    pub response: Value,
}

/// Something that went wrong while handling the file.
#[derive(Debug, Clone, Serialize)]
pub struct Note {
    /// Stage that failed.
    pub stage: &'static str,
    /// When it was observed.
    pub at: DateTime<Utc>,
    /// Operator-facing description.
    pub message: String,
}

/// Audit trail of everything exchanged and decided for one file.
#[derive(Debug, Clone, Serialize)]
pub struct Transcript {
    /// Path relative to the input root.
    pub relative_path: String,
    /// Content digest, when hashing succeeded.
    pub sha1: Option<Sha1Digest>,
    /// Final verdict.
    pub verdict: Option<Verdict>,
    /// Where the file ended up.
    pub destination: Option<String>,
    /// Appliance exchanges in order.
    pub exchanges: Vec<Exchange>,
    /// Failures in order.
    pub notes: Vec<Note>,
}

impl Transcript {
    /// Empty transcript for `relative_path`.
    #[must_use]
    pub fn new(relative_path: &Path) -> Self {
        Self {
            relative_path: relative_path.to_string_lossy().into_owned(),
            sha1: None,
            verdict: None,
            destination: None,
            exchanges: Vec::new(),
            notes: Vec::new(),
        }
    }

    /// Append an exchange stamped now.
    pub fn exchange(&mut self, stage: &'static str, request: Value, response: Value) {
        self.exchanges.push(Exchange {
            stage,
            at: Utc::now(),
            request,
            response,
        });
    }

    /// Append a failure note stamped now.
    pub fn note(&mut self, stage: &'static str, message: impl Into<String>) {
        self.notes.push(Note {
            stage,
            at: Utc::now(),
            message: message.into(),
        });
    }
}

/// Writes artifacts under the reports root.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    root: PathBuf,
}

impl ReportWriter {
    /// Writer rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Reports root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path an artifact for `relative` would be written to, before collision handling.
    #[must_use]
    pub fn artifact_path(&self, relative: &Path, suffix: &str) -> PathBuf {
        let mut name = relative
            .file_name()
            .map_or_else(OsString::new, ToOwned::to_owned);
        name.push(suffix);
        match relative.parent() {
            Some(parent) => self.root.join(parent).join(name),
            None => self.root.join(name),
        }
    }

    /// Write the transcript for `relative` as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::Report`] when the artifact cannot be created.
    pub fn write_transcript(
        &self,
        relative: &Path,
        transcript: &Transcript,
    ) -> ScanResult<PathBuf> {
        let body = serde_json::to_vec_pretty(transcript).map_err(|err| {
            ScanError::report(
                "report.serialize",
                self.artifact_path(relative, TRANSCRIPT_SUFFIX),
                io::Error::other(err),
            )
        })?;
        self.write_once(
            &self.artifact_path(relative, TRANSCRIPT_SUFFIX),
            &body,
            transcript.sha1.as_ref(),
        )
    }

    /// Write a downloaded analysis report for `relative`.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::Report`] when the artifact cannot be created.
    pub fn write_report(
        &self,
        relative: &Path,
        bytes: &[u8],
        digest: Option<&Sha1Digest>,
    ) -> ScanResult<PathBuf> {
        self.write_once(&self.artifact_path(relative, REPORT_SUFFIX), bytes, digest)
    }

    fn write_once(
        &self,
        requested: &Path,
        bytes: &[u8],
        digest: Option<&Sha1Digest>,
    ) -> ScanResult<PathBuf> {
        if let Some(parent) = requested.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| ScanError::report("report.create_dir", parent, source))?;
        }
        let disambiguator = digest.cloned().unwrap_or_else(|| Sha1Digest::of_bytes(bytes));
        let mut target = requested.to_path_buf();
        for _ in 0..WRITE_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&target) {
                Ok(mut file) => {
                    file.write_all(bytes)
                        .and_then(|()| file.sync_all())
                        .map_err(|source| ScanError::report("report.write", &target, source))?;
                    return Ok(target);
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    target = resolve_collision(requested, &disambiguator);
                }
                Err(source) => return Err(ScanError::report("report.open", &target, source)),
            }
        }
        Err(ScanError::report(
            "report.open",
            target,
            io::Error::from(io::ErrorKind::AlreadyExists),
        ))
    }
}
