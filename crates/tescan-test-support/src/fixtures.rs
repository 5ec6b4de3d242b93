//! Temporary directory roots and configurations tuned for fast tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use tescan_config::{
    ApplianceSettings, DEFAULT_ARCHIVE_EXTENSIONS, DirectoryRoots, LogSettings, PollSettings,
    ScannerConfig, TransferSettings, normalize_extensions,
};

/// The five scanner roots laid out under one temporary directory.
#[derive(Debug)]
pub struct ScanRoots {
    _dir: TempDir,
    /// Resolved roots.
    pub roots: DirectoryRoots,
}

impl ScanRoots {
    /// Create `input`, `reports`, `benign`, `quarantine` and `error` under a fresh temp dir.
    ///
    /// # Errors
    ///
    /// Returns an error when the directories cannot be created.
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let base = dir.path();
        let roots = DirectoryRoots {
            input: base.join("input"),
            reports: base.join("reports"),
            benign: base.join("benign"),
            quarantine: base.join("quarantine"),
            error: base.join("error"),
        };
        for (_, path) in roots.named() {
            fs::create_dir_all(path)?;
        }
        Ok(Self { _dir: dir, roots })
    }

    /// Write `contents` to `relative` under the input root, creating parents.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be written.
    pub fn write_input(&self, relative: impl AsRef<Path>, contents: &[u8]) -> Result<PathBuf> {
        let path = self.roots.input.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
        Ok(path)
    }

    /// Configuration with millisecond timings so scenarios run quickly.
    #[must_use]
    pub fn config(&self) -> ScannerConfig {
        ScannerConfig {
            roots: self.roots.clone(),
            appliance: ApplianceSettings {
                address: "127.0.0.1".to_string(),
                api_key: None,
                accept_invalid_certs: false,
                http_timeout: Duration::from_secs(5),
                request_retries: 1,
            },
            concurrency: 2,
            poll: PollSettings {
                interval: Duration::from_millis(1),
                initial_delay: Duration::ZERO,
                max_attempts: 10,
            },
            transfer: TransferSettings {
                max_retries: 3,
                initial_backoff: Duration::from_millis(1),
            },
            archive_extensions: normalize_extensions(DEFAULT_ARCHIVE_EXTENSIONS.iter().copied()),
            logging: LogSettings {
                level: "debug".to_string(),
                style: None,
            },
        }
    }
}
