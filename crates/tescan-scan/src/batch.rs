//! Batch coordinator: discovery, the two scheduling lanes, and cleanup.
//!
//! # Design
//! - Ordinary files run on a bounded pool; the semaphore permit is held for the
//!   whole task, so the configured concurrency is a hard ceiling.
//! - Archives run one at a time after the ordinary lane has drained.
//! - Raising the shutdown flag stops dispatch only; running tasks finish,
//!   including their transfers. Undispatched files are reported as skipped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tescan_config::ScannerConfig;
use tescan_fsops::{FileKind, discover, remove_empty_dirs};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::error::{ScanError, ScanResult};
use crate::orchestrator::ScanOrchestrator;
use crate::record::{BatchSummary, ScanRecord};
use crate::state::FileTask;

/// Records produced by one lane and the files it never started.
#[derive(Debug, Default)]
pub struct LaneReport {
    /// Results of dispatched files.
    pub records: Vec<ScanRecord>,
    /// Relative paths left untouched because of a shutdown request.
    pub skipped: Vec<PathBuf>,
}

/// Runs the orchestrator over a whole input tree.
#[derive(Debug)]
pub struct BatchCoordinator {
    orchestrator: Arc<ScanOrchestrator>,
    input_root: PathBuf,
    archive_extensions: Vec<String>,
    concurrency: usize,
    shutdown: Arc<AtomicBool>,
}

impl BatchCoordinator {
    /// Coordinator for `config` driving `orchestrator`.
    #[must_use]
    pub fn new(config: &ScannerConfig, orchestrator: ScanOrchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            input_root: config.roots.input.clone(),
            archive_extensions: config.archive_extensions.clone(),
            concurrency: config.concurrency.max(1),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops dispatch when set; hand it to a signal handler.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Discover every file under the input root, in lexical order.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::Discovery`] when the input tree cannot be read.
    pub fn discover(&self) -> ScanResult<Vec<FileTask>> {
        let files = discover(&self.input_root, &self.archive_extensions)
            .map_err(|source| ScanError::Discovery { source })?;
        Ok(files.into_iter().map(FileTask::new).collect())
    }

    /// Discover, run both lanes, then remove emptied input directories.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::Discovery`] when the input tree cannot be read.
    /// Failures of individual files are reported in the summary instead.
    pub async fn run(&self) -> ScanResult<BatchSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("batch", %run_id);
        self.run_batch(run_id).instrument(span).await
    }

    async fn run_batch(&self, run_id: Uuid) -> ScanResult<BatchSummary> {
        let started_at = Utc::now();
        let tasks = self.discover()?;
        let (archives, ordinary): (Vec<_>, Vec<_>) = tasks
            .into_iter()
            .partition(|task| task.kind() == FileKind::Archive);
        info!(
            input = %self.input_root.display(),
            ordinary = ordinary.len(),
            archives = archives.len(),
            concurrency = self.concurrency,
            "batch started"
        );

        let mut lane = self.run_ordinary(ordinary).await;
        let archive_lane = self.run_archives(archives).await;
        lane.records.extend(archive_lane.records);
        lane.skipped.extend(archive_lane.skipped);

        let removed = match remove_empty_dirs(&self.input_root) {
            Ok(removed) => removed,
            Err(err) => {
                warn!(error = %err.describe(), "empty directory cleanup failed");
                0
            }
        };

        let summary = BatchSummary::new(run_id, started_at, lane.records, lane.skipped, removed);
        info!(
            total = summary.total(),
            benign = summary.benign,
            malicious = summary.malicious,
            error = summary.error,
            skipped = summary.skipped.len(),
            "batch finished"
        );
        Ok(summary)
    }

    /// Process `tasks` with at most `concurrency` in flight; completion order is unspecified.
    pub async fn run_ordinary(&self, tasks: Vec<FileTask>) -> LaneReport {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers = JoinSet::new();
        let mut in_flight = HashMap::new();
        let mut report = LaneReport::default();

        let mut queue = tasks.into_iter();
        while let Some(task) = queue.next() {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                report.skipped.push(task.relative_path().to_path_buf());
                continue;
            };
            if self.stopping() {
                info!("shutdown requested; no further files dispatched");
                report.skipped.push(task.relative_path().to_path_buf());
                report
                    .skipped
                    .extend(queue.by_ref().map(|task| task.relative_path().to_path_buf()));
                break;
            }
            let relative = task.relative_path().to_path_buf();
            let orchestrator = Arc::clone(&self.orchestrator);
            let handle = workers.spawn(
                async move {
                    let record = orchestrator.process(task).await;
                    drop(permit);
                    record
                }
                .in_current_span(),
            );
            in_flight.insert(handle.id(), relative);
        }

        while let Some(joined) = workers.join_next_with_id().await {
            match joined {
                Ok((id, record)) => {
                    in_flight.remove(&id);
                    report.records.push(record);
                }
                Err(err) => {
                    let relative = in_flight.remove(&err.id()).unwrap_or_default();
                    error!(path = %relative.display(), error = %err, "scan worker aborted");
                    report
                        .records
                        .push(ScanRecord::aborted(&relative, format!("worker aborted: {err}")));
                }
            }
        }
        report
    }

    /// Process `tasks` strictly one after another.
    pub async fn run_archives(&self, tasks: Vec<FileTask>) -> LaneReport {
        let mut report = LaneReport::default();
        let mut queue = tasks.into_iter();
        while let Some(task) = queue.next() {
            if self.stopping() {
                report.skipped.push(task.relative_path().to_path_buf());
                report
                    .skipped
                    .extend(queue.by_ref().map(|task| task.relative_path().to_path_buf()));
                break;
            }
            report.records.push(self.orchestrator.process(task).await);
        }
        report
    }

    /// Input root being drained.
    #[must_use]
    pub fn input_root(&self) -> &Path {
        &self.input_root
    }
}
