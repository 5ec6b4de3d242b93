//! Per-file results and the batch summary handed back to callers.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tescan_appliance::Verdict;
use uuid::Uuid;

use crate::state::ScanState;

/// Outcome of one file.
#[derive(Debug, Clone, Serialize)]
pub struct ScanRecord {
    /// Path relative to the input root.
    #[serde(serialize_with = "lossy_path")]
    pub relative_path: PathBuf,
    /// Final verdict.
    pub verdict: Verdict,
    /// Whether the verdict came from the appliance cache.
    pub cache_hit: bool,
    /// Where the file was moved to; `None` when relocation failed.
    #[serde(serialize_with = "lossy_optional_path")]
    pub destination: Option<PathBuf>,
    /// Transcript artifact.
    #[serde(serialize_with = "lossy_optional_path")]
    pub transcript_path: Option<PathBuf>,
    /// Downloaded analysis report, for malicious files.
    #[serde(serialize_with = "lossy_optional_path")]
    pub report_path: Option<PathBuf>,
    /// Relocation failure; the verdict stands regardless.
    pub transfer_error: Option<String>,
    /// Why the analysis ended in `Error`.
    pub error: Option<String>,
    /// Artifact writing or download failures.
    pub report_error: Option<String>,
    /// Last state reached.
    pub final_state: ScanState,
}

impl ScanRecord {
    /// Record for a task whose worker died before producing a result.
    #[must_use]
    pub fn aborted(relative_path: &Path, reason: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.to_path_buf(),
            verdict: Verdict::Error,
            cache_hit: false,
            destination: None,
            transcript_path: None,
            report_path: None,
            transfer_error: None,
            error: Some(reason.into()),
            report_error: None,
            final_state: ScanState::ErrorTerminal,
        }
    }

    /// Whether anything about this file needs an operator's attention.
    #[must_use]
    pub const fn needs_attention(&self) -> bool {
        matches!(self.verdict, Verdict::Malicious | Verdict::Error)
            || self.transfer_error.is_some()
            || self.report_error.is_some()
    }
}

/// Counts and per-file records of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    /// Identifier shared by every log line of the run.
    pub run_id: Uuid,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Files judged benign.
    pub benign: usize,
    /// Files judged malicious.
    pub malicious: usize,
    /// Files without a trustworthy verdict.
    pub error: usize,
    /// Files answered from the appliance cache.
    pub cache_hits: usize,
    /// Files whose relocation failed.
    pub transfer_failures: usize,
    /// Files left untouched because the run was interrupted.
    #[serde(serialize_with = "lossy_paths")]
    pub skipped: Vec<PathBuf>,
    /// Empty input directories removed after the run.
    pub removed_directories: usize,
    /// Every processed file.
    pub records: Vec<ScanRecord>,
}

impl BatchSummary {
    /// Aggregate `records` into counts.
    #[must_use]
    pub fn new(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        mut records: Vec<ScanRecord>,
        skipped: Vec<PathBuf>,
        removed_directories: usize,
    ) -> Self {
        records.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        let count = |verdict: Verdict| records.iter().filter(|r| r.verdict == verdict).count();
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            benign: count(Verdict::Benign),
            malicious: count(Verdict::Malicious),
            error: count(Verdict::Error),
            cache_hits: records.iter().filter(|r| r.cache_hit).count(),
            transfer_failures: records.iter().filter(|r| r.transfer_error.is_some()).count(),
            skipped,
            removed_directories,
            records,
        }
    }

    /// Files processed.
    #[must_use]
    pub fn total(&self) -> usize {
        self.records.len()
    }

    /// Whether any file ended without a trustworthy verdict.
    #[must_use]
    pub const fn has_errors(&self) -> bool {
        self.error > 0
    }

    /// Record for `relative_path`, if it was processed.
    #[must_use]
    pub fn record(&self, relative_path: &Path) -> Option<&ScanRecord> {
        self.records
            .iter()
            .find(|record| record.relative_path == relative_path)
    }
}

fn lossy_path<S: Serializer>(path: &Path, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&path.to_string_lossy())
}

#[allow(clippy::ref_option)]
fn lossy_optional_path<S: Serializer>(
    path: &Option<PathBuf>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match path {
        Some(path) => lossy_path(path, serializer),
        None => serializer.serialize_none(),
    }
}

fn lossy_paths<S: Serializer>(paths: &[PathBuf], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(paths.iter().map(|path| path.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, verdict: Verdict) -> ScanRecord {
        ScanRecord {
            verdict,
            final_state: ScanState::Done,
            error: None,
            ..ScanRecord::aborted(Path::new(path), "")
        }
    }

    #[test]
    fn summary_counts_by_verdict() {
        let mut failed_move = record("c", Verdict::Benign);
        failed_move.transfer_error = Some("disk full".to_string());
        let summary = BatchSummary::new(
            Uuid::new_v4(),
            Utc::now(),
            vec![
                record("b", Verdict::Malicious),
                record("a", Verdict::Benign),
                failed_move,
                record("d", Verdict::Error),
            ],
            vec![PathBuf::from("e")],
            2,
        );
        assert_eq!(summary.total(), 4);
        assert_eq!((summary.benign, summary.malicious, summary.error), (2, 1, 1));
        assert_eq!(summary.transfer_failures, 1);
        assert!(summary.has_errors());
        assert_eq!(summary.records[0].relative_path, PathBuf::from("a"));
        assert!(summary.record(Path::new("c")).is_some_and(ScanRecord::needs_attention));
    }

    #[test]
    fn summary_serializes_paths_as_strings() -> anyhow::Result<()> {
        let summary = BatchSummary::new(
            Uuid::new_v4(),
            Utc::now(),
            vec![record("a/b.txt", Verdict::Benign)],
            Vec::new(),
            0,
        );
        let value = serde_json::to_value(&summary)?;
        assert_eq!(value["records"][0]["relative_path"], "a/b.txt");
        assert_eq!(value["records"][0]["verdict"], "benign");
        assert!(value["records"][0]["destination"].is_null());
        Ok(())
    }
}
