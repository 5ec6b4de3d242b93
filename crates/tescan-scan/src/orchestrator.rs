//! Drives one file from hash to relocation and report.
//!
//! # Design
//! - Each file runs inside a `scan` span carrying its relative path and, once
//!   known, its digest.
//! - Stages are strictly ordered: hash, verdict, relocate, report. A failed
//!   relocation is recorded but never changes the verdict, and the transcript
//!   is written whatever happened before it.
//! - Polling sleeps between attempts without holding anything shared.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tescan_appliance::{
    ApplianceApi, ApplianceResponse, FilenameRegistry, LookupOutcome, PollOutcome, UploadOutcome,
    Verdict, aggregate_archive, child_verdicts, classify_lookup, classify_poll, classify_upload,
};
use tescan_config::{DirectoryRoots, PollSettings, ScannerConfig};
use tescan_fsops::{FileKind, FsOpsError, Sha1Digest, TransferEngine, content_digest};
use tescan_telemetry::Metrics;
use tracing::{Instrument, debug, error, field, info, info_span, warn};

use crate::error::{ScanError, ScanResult};
use crate::record::ScanRecord;
use crate::report::{ReportWriter, Transcript};
use crate::state::{FileTask, ScanState};

/// Verdict and the report that backs it.
#[derive(Debug)]
struct Analysis {
    verdict: Verdict,
    report_id: Option<String>,
    cache_hit: bool,
}

/// Runs the per-file state machine against an appliance.
#[derive(Clone)]
pub struct ScanOrchestrator {
    appliance: Arc<dyn ApplianceApi>,
    engine: TransferEngine,
    reports: ReportWriter,
    roots: DirectoryRoots,
    poll: PollSettings,
    tokens: Arc<FilenameRegistry>,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("engine", &self.engine)
            .field("roots", &self.roots)
            .field("poll", &self.poll)
            .finish_non_exhaustive()
    }
}

impl ScanOrchestrator {
    /// Orchestrator for `config` talking to `appliance`.
    #[must_use]
    pub fn new(config: &ScannerConfig, appliance: Arc<dyn ApplianceApi>) -> Self {
        Self {
            appliance,
            engine: TransferEngine::new(config.transfer),
            reports: ReportWriter::new(config.roots.reports.clone()),
            roots: config.roots.clone(),
            poll: config.poll,
            tokens: Arc::new(FilenameRegistry::new()),
            metrics: None,
        }
    }

    /// Replace the transfer engine.
    #[must_use]
    pub fn with_transfer_engine(mut self, engine: TransferEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Record file, poll and transfer metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.engine = self.engine.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    /// Filename tokens issued so far.
    #[must_use]
    pub fn tokens(&self) -> &FilenameRegistry {
        &self.tokens
    }

    /// Root a file with `verdict` is moved to.
    #[must_use]
    pub fn destination_root(&self, verdict: Verdict) -> &Path {
        match verdict {
            Verdict::Benign => &self.roots.benign,
            Verdict::Malicious => &self.roots.quarantine,
            Verdict::Error => &self.roots.error,
        }
    }

    /// Process `task` to completion. Never fails: every outcome is a record.
    pub async fn process(&self, task: FileTask) -> ScanRecord {
        let span = info_span!(
            "scan",
            path = %task.relative_path().display(),
            sha1 = field::Empty
        );
        self.process_task(task).instrument(span).await
    }

    async fn process_task(&self, mut task: FileTask) -> ScanRecord {
        let mut transcript = Transcript::new(task.relative_path());

        let (analysis, analysis_error) = match self.analyse(&mut task, &mut transcript).await {
            Ok(analysis) => (analysis, None),
            Err(err) => {
                let message = err.describe();
                error!(kind = err.kind(), error = %message, "analysis failed");
                transcript.note(err.kind(), &message);
                if let Err(transition) = task.advance(ScanState::ErrorTerminal) {
                    warn!(error = %transition.describe(), "unexpected state on failure");
                }
                let analysis = Analysis {
                    verdict: Verdict::Error,
                    report_id: None,
                    cache_hit: false,
                };
                (analysis, Some(message))
            }
        };
        let verdict = task.settle(analysis.verdict);
        transcript.verdict = Some(verdict);
        transcript.sha1 = task.content_hash().cloned();

        let (destination, transfer_error) = self.relocate(&mut task, verdict).await;
        if let Some(message) = &transfer_error {
            transcript.note("relocate", message);
        }
        transcript.destination = destination
            .as_ref()
            .map(|path| path.to_string_lossy().into_owned());

        let (transcript_path, report_path, report_error) = self
            .write_reports(&mut task, verdict, analysis.report_id.as_deref(), transcript)
            .await;

        if let Some(metrics) = &self.metrics {
            metrics.inc_file(verdict.as_str());
        }
        info!(
            verdict = verdict.as_str(),
            destination = ?destination,
            "file processed"
        );

        ScanRecord {
            relative_path: task.relative_path().to_path_buf(),
            verdict,
            cache_hit: analysis.cache_hit,
            destination,
            transcript_path,
            report_path,
            transfer_error,
            error: analysis_error,
            report_error,
            final_state: task.state(),
        }
    }

    async fn analyse(
        &self,
        task: &mut FileTask,
        transcript: &mut Transcript,
    ) -> ScanResult<Analysis> {
        task.advance(ScanState::Hashing)?;
        let digest = hash(task.source_path()).await?;
        tracing::Span::current().record("sha1", field::display(&digest));
        task.set_content_hash(digest.clone());

        task.advance(ScanState::CacheCheck)?;
        let lookup = self
            .appliance
            .lookup(&digest)
            .await
            .map_err(|source| ScanError::Appliance {
                stage: "lookup",
                source,
            })?;
        transcript.exchange("lookup", lookup.request.clone(), lookup.raw.clone());

        if let LookupOutcome::Hit(verdict) = classify_lookup(&lookup) {
            info!(verdict = verdict.as_str(), "verdict found in appliance cache");
            if let Some(metrics) = &self.metrics {
                metrics.inc_cache_hit();
            }
            task.advance(ScanState::VerdictReceived)?;
            return Ok(self.conclude(task, verdict, &lookup, true));
        }

        task.advance(ScanState::Uploading)?;
        let name = task.source_path().file_name().unwrap_or_default();
        let token = self.tokens.token_for(name);
        let upload = self
            .appliance
            .upload(task.source_path(), &token)
            .await
            .map_err(|source| ScanError::Appliance {
                stage: "upload",
                source,
            })?;
        transcript.exchange("upload", upload.request.clone(), upload.raw.clone());

        match classify_upload(&upload) {
            UploadOutcome::Accepted => {
                debug!(token = %token, "upload accepted");
            }
            UploadOutcome::Resolved(verdict) => {
                task.advance(ScanState::VerdictReceived)?;
                return Ok(self.conclude(task, verdict, &upload, false));
            }
            UploadOutcome::Rejected { label } => {
                return Err(ScanError::UploadRejected { label });
            }
        }

        task.advance(ScanState::Polling)?;
        let (verdict, response) = self.poll_until_verdict(&digest, transcript).await?;
        task.advance(ScanState::VerdictReceived)?;
        Ok(self.conclude(task, verdict, &response, false))
    }

    async fn poll_until_verdict(
        &self,
        digest: &Sha1Digest,
        transcript: &mut Transcript,
    ) -> ScanResult<(Verdict, ApplianceResponse)> {
        tokio::time::sleep(self.poll.initial_delay).await;
        let max_attempts = self.poll.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            if let Some(metrics) = &self.metrics {
                metrics.inc_poll_attempt();
            }
            let response =
                self.appliance
                    .poll(digest)
                    .await
                    .map_err(|source| ScanError::Appliance {
                        stage: "poll",
                        source,
                    })?;
            transcript.exchange("poll", response.request.clone(), response.raw.clone());

            match classify_poll(&response) {
                PollOutcome::Final(verdict) => {
                    debug!(attempt, verdict = verdict.as_str(), "analysis finished");
                    return Ok((verdict, response));
                }
                PollOutcome::EarlyMalicious => {
                    info!(attempt, "early behavioural analysis reported malicious");
                    return Ok((Verdict::Malicious, response));
                }
                PollOutcome::Pending => {
                    debug!(attempt, max_attempts, label = response.label(), "analysis pending");
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(self.poll.interval).await;
            }
        }
        Err(ScanError::PollTimeout {
            attempts: max_attempts,
        })
    }

    fn conclude(
        &self,
        task: &FileTask,
        verdict: Verdict,
        response: &ApplianceResponse,
        cache_hit: bool,
    ) -> Analysis {
        let verdict = if task.kind() == FileKind::Archive {
            let children = child_verdicts(response);
            let aggregate = aggregate_archive(verdict, &children);
            if aggregate != verdict {
                info!(
                    children = children.len(),
                    "archive contains a malicious item"
                );
            }
            aggregate
        } else {
            verdict
        };
        Analysis {
            verdict,
            report_id: response.report_id().map(str::to_string),
            cache_hit,
        }
    }

    async fn relocate(
        &self,
        task: &mut FileTask,
        verdict: Verdict,
    ) -> (Option<PathBuf>, Option<String>) {
        if let Err(err) = task.advance(ScanState::Relocating) {
            return (None, Some(err.describe()));
        }
        let destination = self.destination_root(verdict).join(task.relative_path());
        match self
            .engine
            .transfer(
                task.source_path().to_path_buf(),
                destination,
                task.content_hash().cloned(),
            )
            .await
        {
            Ok(outcome) => {
                task.set_retry_count(outcome.attempts);
                debug!(outcome = %outcome, "relocation complete");
                (Some(outcome.destination), None)
            }
            Err(err) => {
                task.set_retry_count(attempts_used(&err));
                if let FsOpsError::SourceNotRemoved { destination, .. } = &err {
                    error!(error = %err.describe(), "relocated copy committed; source not removed");
                    return (Some(destination.clone()), Some(err.describe()));
                }
                error!(error = %err.describe(), "relocation failed; source left in place");
                (None, Some(err.describe()))
            }
        }
    }

    async fn write_reports(
        &self,
        task: &mut FileTask,
        verdict: Verdict,
        report_id: Option<&str>,
        mut transcript: Transcript,
    ) -> (Option<PathBuf>, Option<PathBuf>, Option<String>) {
        if let Err(err) = task.advance(ScanState::ReportWriting) {
            return (None, None, Some(err.describe()));
        }
        let relative = task.relative_path().to_path_buf();
        let digest = task.content_hash().cloned();
        let mut problems = Vec::new();

        let mut report_path = None;
        if verdict == Verdict::Malicious {
            match report_id {
                Some(id) => match self.download_report(&relative, id, digest.as_ref()).await {
                    Ok(path) => {
                        info!(report = %path.display(), "analysis report saved");
                        report_path = Some(path);
                    }
                    Err(err) => {
                        let message = err.describe();
                        warn!(error = %message, "analysis report unavailable");
                        transcript.note("report", &message);
                        problems.push(message);
                    }
                },
                None => debug!("no summary report offered for malicious verdict"),
            }
        }

        let transcript_path = match self.reports.write_transcript(&relative, &transcript) {
            Ok(path) => Some(path),
            Err(err) => {
                let message = err.describe();
                error!(error = %message, "transcript could not be written");
                problems.push(message);
                None
            }
        };

        if let Err(err) = task.advance(ScanState::Done) {
            problems.push(err.describe());
        }
        let report_error = (!problems.is_empty()).then(|| problems.join("; "));
        (transcript_path, report_path, report_error)
    }

    async fn download_report(
        &self,
        relative: &Path,
        report_id: &str,
        digest: Option<&Sha1Digest>,
    ) -> ScanResult<PathBuf> {
        let bytes = self
            .appliance
            .download_report(report_id)
            .await
            .map_err(|source| ScanError::Appliance {
                stage: "download",
                source,
            })?;
        self.reports.write_report(relative, &bytes, digest)
    }
}

async fn hash(path: &Path) -> ScanResult<Sha1Digest> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || content_digest(&owned))
        .await
        .map_err(|source| ScanError::Hash {
            source: FsOpsError::Join {
                operation: "digest",
                source,
            },
        })?
        .map_err(|source| ScanError::Hash { source })
}

fn attempts_used(err: &FsOpsError) -> u32 {
    match err {
        FsOpsError::RetriesExhausted { attempts, .. } => *attempts,
        _ => 1,
    }
}
