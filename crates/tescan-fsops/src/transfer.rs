//! Resilient file relocation.
//!
//! # Design
//! - Rename when both sides share a local volume; otherwise copy, verify, then delete.
//! - Copies land in a hidden staging file beside the destination and are renamed
//!   into place only once complete (and verified when the plan asks for it).
//! - The source is removed only after the destination is confirmed intact.
//! - Failed attempts back off exponentially; the loop runs on the blocking pool so
//!   an interrupted batch lets an in-flight copy finish.

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use serde::Serialize;
use tescan_config::TransferSettings;
use tescan_telemetry::Metrics;
use tracing::{debug, info, warn};

use crate::digest::{Sha1Digest, content_digest};
use crate::error::{FsOpsError, FsOpsResult};
use crate::plan::{ChecksumPolicy, TransferPlan};

/// Filesystem primitives a transfer is built from. Abstracted so tests can
/// inject faults; only `copy` has no default.
pub trait ByteCopier: Send + Sync {
    /// Copy `source` to `destination`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Any IO failure; the caller removes whatever was written.
    fn copy(&self, source: &Path, destination: &Path) -> io::Result<u64>;

    /// Rename `source` to `destination` in one step.
    ///
    /// # Errors
    ///
    /// Any IO failure. `CrossesDevices` makes the engine fall back to copying.
    fn rename(&self, source: &Path, destination: &Path) -> io::Result<()> {
        fs::rename(source, destination)
    }

    /// Remove the source once its copy is committed.
    ///
    /// # Errors
    ///
    /// Any IO failure.
    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

/// Default copier backed by [`std::fs::copy`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FsCopier;

impl ByteCopier for FsCopier {
    fn copy(&self, source: &Path, destination: &Path) -> io::Result<u64> {
        fs::copy(source, destination)
    }
}

/// How a successful transfer was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMethod {
    /// Atomic rename on the same volume.
    Rename,
    /// Byte copy followed by source removal.
    Copy,
    /// Byte copy verified by digest, followed by source removal.
    VerifiedCopy,
}

/// Result of a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferOutcome {
    /// Final destination; differs from the request when a collision was resolved.
    pub destination: PathBuf,
    /// Strategy that succeeded.
    pub method: TransferMethod,
    /// Attempts used, including the successful one.
    pub attempts: u32,
    /// Plan of the successful attempt.
    pub plan: TransferPlan,
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} to {} after {} attempt(s)",
            self.method,
            self.destination.display(),
            self.attempts
        )
    }
}

/// Moves files with retry, backoff, collision handling, and optional verification.
#[derive(Clone)]
pub struct TransferEngine {
    settings: TransferSettings,
    checksum: ChecksumPolicy,
    copier: Arc<dyn ByteCopier>,
    metrics: Option<Metrics>,
}

impl fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferEngine")
            .field("settings", &self.settings)
            .field("checksum", &self.checksum)
            .finish_non_exhaustive()
    }
}

impl TransferEngine {
    /// Build an engine using the filesystem copier and automatic verification.
    #[must_use]
    pub fn new(settings: TransferSettings) -> Self {
        Self {
            settings,
            checksum: ChecksumPolicy::Auto,
            copier: Arc::new(FsCopier),
            metrics: None,
        }
    }

    /// Override when copies are verified.
    #[must_use]
    pub const fn with_checksum_policy(mut self, policy: ChecksumPolicy) -> Self {
        self.checksum = policy;
        self
    }

    /// Replace the byte copier.
    #[must_use]
    pub fn with_copier(mut self, copier: Arc<dyn ByteCopier>) -> Self {
        self.copier = copier;
        self
    }

    /// Record attempts in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Move `source` to `destination` on the blocking pool.
    ///
    /// `digest`, when already known, names collision suffixes without re-reading
    /// the source.
    ///
    /// # Errors
    ///
    /// See [`TransferEngine::transfer_blocking`].
    pub async fn transfer(
        &self,
        source: PathBuf,
        destination: PathBuf,
        digest: Option<Sha1Digest>,
    ) -> FsOpsResult<TransferOutcome> {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || {
            engine.transfer_blocking(&source, &destination, digest.as_ref())
        })
        .await
        .map_err(|source| FsOpsError::Join {
            operation: "transfer",
            source,
        })?
    }

    /// Move `source` to `destination`, creating missing parent directories.
    ///
    /// # Errors
    ///
    /// Returns the non-retryable error directly (for example a vanished source)
    /// or [`FsOpsError::RetriesExhausted`] once the retry budget is spent. In
    /// both cases the source is still in place and no partial destination remains.
    pub fn transfer_blocking(
        &self,
        source: &Path,
        destination: &Path,
        digest: Option<&Sha1Digest>,
    ) -> FsOpsResult<TransferOutcome> {
        let max_attempts = self.settings.max_retries.max(1);
        let mut delay = self.settings.initial_backoff;
        let mut attempt = 1;
        loop {
            match self.attempt(source, destination, digest, attempt) {
                Ok(outcome) => {
                    self.record("ok");
                    info!(
                        source = %source.display(),
                        destination = %outcome.destination.display(),
                        method = ?outcome.method,
                        attempts = outcome.attempts,
                        "file relocated"
                    );
                    return Ok(outcome);
                }
                Err(err) => {
                    self.record("failed");
                    if !err.is_retryable() {
                        warn!(source = %source.display(), error = %err.describe(), "transfer failed permanently");
                        return Err(err);
                    }
                    if attempt >= max_attempts {
                        return Err(FsOpsError::RetriesExhausted {
                            source_path: source.to_path_buf(),
                            destination: destination.to_path_buf(),
                            attempts: attempt,
                            last: Box::new(err),
                        });
                    }
                    warn!(
                        source = %source.display(),
                        attempt,
                        backoff_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err.describe(),
                        "transfer attempt failed; retrying"
                    );
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }

    fn attempt(
        &self,
        source: &Path,
        requested: &Path,
        digest: Option<&Sha1Digest>,
        attempt: u32,
    ) -> FsOpsResult<TransferOutcome> {
        fs::symlink_metadata(source)
            .map_err(|err| FsOpsError::io("transfer.source", source, err))?;
        let parent = requested.parent().ok_or_else(|| FsOpsError::InvalidInput {
            field: "destination",
            reason: "has no parent directory",
            value: Some(requested.display().to_string()),
        })?;
        fs::create_dir_all(parent)
            .map_err(|err| FsOpsError::io("transfer.create_parent", parent, err))?;

        let destination = if requested.exists() {
            let owned;
            let digest = match digest {
                Some(known) => known,
                None => {
                    owned = content_digest(source)?;
                    &owned
                }
            };
            resolve_collision(requested, digest)
        } else {
            requested.to_path_buf()
        };

        let plan = TransferPlan::compute(source, &destination, self.checksum);
        debug!(?plan, destination = %destination.display(), attempt, "transfer planned");

        if plan.prefers_rename() {
            match self.copier.rename(source, &destination) {
                Ok(()) => {
                    return Ok(TransferOutcome {
                        destination,
                        method: TransferMethod::Rename,
                        attempts: attempt,
                        plan,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
                    debug!(source = %source.display(), "rename crossed devices; copying instead");
                }
                Err(err) => return Err(FsOpsError::io("transfer.rename", &destination, err)),
            }
        }

        let method = self.copy_into_place(source, &destination, plan.requires_checksum)?;
        self.copier
            .remove(source)
            .map_err(|err| FsOpsError::SourceNotRemoved {
                source_path: source.to_path_buf(),
                destination: destination.clone(),
                source: err,
            })?;
        Ok(TransferOutcome {
            destination,
            method,
            attempts: attempt,
            plan,
        })
    }

    fn copy_into_place(
        &self,
        source: &Path,
        destination: &Path,
        verify: bool,
    ) -> FsOpsResult<TransferMethod> {
        let staging = staging_path(destination);
        if let Err(err) = self.stage_and_commit(source, &staging, destination, verify) {
            if let Err(cleanup) = fs::remove_file(&staging)
                && cleanup.kind() != io::ErrorKind::NotFound
            {
                warn!(path = %staging.display(), error = %cleanup, "failed to remove partial copy");
            }
            return Err(err);
        }
        Ok(if verify {
            TransferMethod::VerifiedCopy
        } else {
            TransferMethod::Copy
        })
    }

    fn stage_and_commit(
        &self,
        source: &Path,
        staging: &Path,
        destination: &Path,
        verify: bool,
    ) -> FsOpsResult<()> {
        let expected = if verify {
            Some(content_digest(source)?)
        } else {
            None
        };
        self.copier
            .copy(source, staging)
            .map_err(|err| FsOpsError::io("transfer.copy", staging, err))?;
        if let Some(expected) = expected {
            let actual = content_digest(staging)?;
            if actual != expected {
                return Err(FsOpsError::ChecksumMismatch {
                    path: destination.to_path_buf(),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        fs::rename(staging, destination)
            .map_err(|err| FsOpsError::io("transfer.commit", destination, err))
    }

    fn record(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_transfer_attempt(outcome);
        }
    }
}

fn staging_path(destination: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(destination.file_name().unwrap_or_default());
    name.push(".tescan-partial");
    destination.with_file_name(name)
}

/// Pick a free path for `requested`: `<stem>_<digest8>.<ext>`, then
/// `<stem>_<digest8>_<n>.<ext>` until nothing exists there.
#[must_use]
pub fn resolve_collision(requested: &Path, digest: &Sha1Digest) -> PathBuf {
    if !requested.exists() {
        return requested.to_path_buf();
    }
    let stem = requested
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = requested
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let first = requested.with_file_name(format!("{stem}_{}{extension}", digest.short()));
    if !first.exists() {
        return first;
    }
    (1_u32..)
        .map(|counter| {
            requested.with_file_name(format!("{stem}_{}_{counter}{extension}", digest.short()))
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    type TestResult = anyhow::Result<()>;

    const fn instant_settings(max_retries: u32) -> TransferSettings {
        TransferSettings {
            max_retries,
            initial_backoff: Duration::ZERO,
        }
    }

    /// Writes a flipped byte on every copy.
    struct CorruptingCopier;

    impl ByteCopier for CorruptingCopier {
        fn copy(&self, source: &Path, destination: &Path) -> io::Result<u64> {
            let mut bytes = fs::read(source)?;
            if let Some(first) = bytes.first_mut() {
                *first ^= 0xFF;
            } else {
                bytes.push(0);
            }
            fs::write(destination, &bytes)?;
            Ok(bytes.len() as u64)
        }
    }

    /// Fails the first `failures` copies after writing half the file.
    struct FlakyCopier {
        failures: u32,
        calls: AtomicU32,
    }

    impl ByteCopier for FlakyCopier {
        fn copy(&self, source: &Path, destination: &Path) -> io::Result<u64> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                let bytes = fs::read(source)?;
                fs::write(destination, &bytes[..bytes.len() / 2])?;
                return Err(io::Error::new(io::ErrorKind::TimedOut, "network blip"));
            }
            fs::copy(source, destination)
        }
    }

    /// Behaves like a mount the path probe misjudged: renames cross devices.
    #[derive(Default)]
    struct CrossDeviceCopier {
        renames: AtomicU32,
        stuck_source: bool,
    }

    impl ByteCopier for CrossDeviceCopier {
        fn copy(&self, source: &Path, destination: &Path) -> io::Result<u64> {
            fs::copy(source, destination)
        }

        fn rename(&self, _source: &Path, _destination: &Path) -> io::Result<()> {
            self.renames.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::from(io::ErrorKind::CrossesDevices))
        }

        fn remove(&self, path: &Path) -> io::Result<()> {
            if self.stuck_source {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            fs::remove_file(path)
        }
    }

    fn fixture(contents: &[u8]) -> anyhow::Result<(tempfile::TempDir, PathBuf, PathBuf)> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("in/a/b/file.txt");
        fs::create_dir_all(source.parent().unwrap_or(dir.path()))?;
        fs::write(&source, contents)?;
        let destination = dir.path().join("out/a/b/file.txt");
        Ok((dir, source, destination))
    }

    #[test]
    fn local_move_creates_parents_and_removes_source() -> TestResult {
        let (_dir, source, destination) = fixture(b"hello")?;
        let outcome = TransferEngine::new(instant_settings(3))
            .transfer_blocking(&source, &destination, None)?;
        assert_eq!(outcome.destination, destination);
        assert_eq!(outcome.attempts, 1);
        assert!(!source.exists());
        assert_eq!(fs::read(&destination)?, b"hello");
        Ok(())
    }

    #[test]
    fn verified_copy_matches_source_digest() -> TestResult {
        let (_dir, source, destination) = fixture(b"payload")?;
        let before = content_digest(&source)?;
        let outcome = TransferEngine::new(instant_settings(3))
            .with_checksum_policy(ChecksumPolicy::Always)
            .transfer_blocking(&source, &destination, None)?;
        assert_eq!(outcome.method, TransferMethod::VerifiedCopy);
        assert_eq!(content_digest(&destination)?, before);
        assert!(!source.exists());
        Ok(())
    }

    #[test]
    fn corrupted_copy_is_removed_and_source_kept() -> TestResult {
        let (_dir, source, destination) = fixture(b"precious")?;
        let metrics = Metrics::new()?;
        let err = TransferEngine::new(instant_settings(3))
            .with_checksum_policy(ChecksumPolicy::Always)
            .with_copier(Arc::new(CorruptingCopier))
            .with_metrics(metrics.clone())
            .transfer_blocking(&source, &destination, None)
            .unwrap_err();

        match err {
            FsOpsError::RetriesExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, FsOpsError::ChecksumMismatch { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(source.exists(), "source must survive a failed transfer");
        assert!(!destination.exists(), "no corrupt destination may remain");
        assert!(!staging_path(&destination).exists());
        assert_eq!(metrics.snapshot().transfer_failures_total, 3);
        Ok(())
    }

    #[test]
    fn transient_failures_are_retried() -> TestResult {
        let (_dir, source, destination) = fixture(b"eventually")?;
        let copier = Arc::new(FlakyCopier {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let outcome = TransferEngine::new(instant_settings(3))
            .with_checksum_policy(ChecksumPolicy::Always)
            .with_copier(copier.clone())
            .transfer_blocking(&source, &destination, None)?;
        assert_eq!(outcome.attempts, 3);
        assert_eq!(copier.calls.load(Ordering::SeqCst), 3);
        assert_eq!(fs::read(&destination)?, b"eventually");
        Ok(())
    }

    #[test]
    fn cross_device_rename_falls_back_to_copy() -> TestResult {
        let (_dir, source, destination) = fixture(b"misjudged mount")?;
        let copier = Arc::new(CrossDeviceCopier::default());
        let outcome = TransferEngine::new(instant_settings(3))
            .with_checksum_policy(ChecksumPolicy::Never)
            .with_copier(copier.clone())
            .transfer_blocking(&source, &destination, None)?;
        assert!(outcome.plan.prefers_rename());
        assert_eq!(copier.renames.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.method, TransferMethod::Copy);
        assert_eq!(outcome.attempts, 1);
        assert!(!source.exists());
        assert_eq!(fs::read(&destination)?, b"misjudged mount");
        Ok(())
    }

    #[test]
    fn undeletable_source_reports_committed_destination() -> TestResult {
        let (_dir, source, destination) = fixture(b"twice")?;
        let copier = Arc::new(CrossDeviceCopier {
            stuck_source: true,
            ..CrossDeviceCopier::default()
        });
        let err = TransferEngine::new(instant_settings(3))
            .with_checksum_policy(ChecksumPolicy::Never)
            .with_copier(copier.clone())
            .transfer_blocking(&source, &destination, None)
            .unwrap_err();

        assert!(!err.is_retryable());
        assert_eq!(copier.renames.load(Ordering::SeqCst), 1);
        match &err {
            FsOpsError::SourceNotRemoved {
                source_path,
                destination: committed,
                ..
            } => {
                assert_eq!(source_path, &source);
                assert_eq!(committed, &destination);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.describe().contains(&destination.display().to_string()));
        assert!(source.exists());
        assert_eq!(fs::read(&destination)?, b"twice");
        Ok(())
    }

    #[test]
    fn missing_source_fails_without_retry() -> TestResult {
        let dir = tempfile::tempdir()?;
        let err = TransferEngine::new(instant_settings(5))
            .transfer_blocking(
                &dir.path().join("ghost.txt"),
                &dir.path().join("out/ghost.txt"),
                None,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            FsOpsError::Io {
                operation: "transfer.source",
                ..
            }
        ));
        Ok(())
    }

    #[test]
    fn collisions_get_digest_then_counter_suffix() -> TestResult {
        let dir = tempfile::tempdir()?;
        let destination = dir.path().join("report.pdf");
        let digest = Sha1Digest::of_bytes(b"abc");
        assert_eq!(resolve_collision(&destination, &digest), destination);

        fs::write(&destination, b"first")?;
        let second = resolve_collision(&destination, &digest);
        assert_eq!(second, dir.path().join("report_a9993e36.pdf"));

        fs::write(&second, b"second")?;
        assert_eq!(
            resolve_collision(&destination, &digest),
            dir.path().join("report_a9993e36_1.pdf")
        );
        Ok(())
    }

    #[test]
    fn existing_destination_is_never_overwritten() -> TestResult {
        let (_dir, source, destination) = fixture(b"new")?;
        fs::create_dir_all(destination.parent().unwrap_or(Path::new("/")))?;
        fs::write(&destination, b"old")?;
        let outcome = TransferEngine::new(instant_settings(1))
            .transfer_blocking(&source, &destination, None)?;
        assert_ne!(outcome.destination, destination);
        assert_eq!(fs::read(&destination)?, b"old");
        assert_eq!(fs::read(&outcome.destination)?, b"new");
        Ok(())
    }

    #[tokio::test]
    async fn async_transfer_runs_on_blocking_pool() -> TestResult {
        let (_dir, source, destination) = fixture(b"async")?;
        let outcome = TransferEngine::new(instant_settings(1))
            .transfer(source.clone(), destination.clone(), None)
            .await?;
        assert_eq!(outcome.destination, destination);
        assert!(!source.exists());
        Ok(())
    }
}
