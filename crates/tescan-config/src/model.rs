//! Typed scanner configuration consumed read-only by the scan engine.
//!
//! # Design
//! - Pure data carriers; loading lives in `loader.rs`, checks in `validate.rs`.
//! - One immutable value is built per run and threaded to every component.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ConfigError, ConfigResult};

/// TCP port the appliance's file API listens on.
pub const APPLIANCE_PORT: u16 = 18194;
/// Path prefix of the appliance's file API.
pub const APPLIANCE_API_PATH: &str = "/tecloud/api/v1/file/";

/// Extensions routed to the sequential archive lane.
pub const DEFAULT_ARCHIVE_EXTENSIONS: &[&str] = &[
    ".7z", ".arj", ".bz2", ".cab", ".dmg", ".gz", ".img", ".iso", ".msi", ".pkg", ".rar", ".tar",
    ".tbz2", ".tbz", ".tb2", ".tgz", ".xz", ".zip", ".udf", ".qcow2",
];

/// The five directory roots the scanner reads from and writes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryRoots {
    /// Tree that is scanned and drained.
    pub input: PathBuf,
    /// Receives transcripts and downloaded analysis reports.
    pub reports: PathBuf,
    /// Receives files judged benign.
    pub benign: PathBuf,
    /// Receives files judged malicious.
    pub quarantine: PathBuf,
    /// Receives files whose analysis failed or was inconclusive.
    pub error: PathBuf,
}

impl DirectoryRoots {
    /// All roots paired with their configuration field names.
    #[must_use]
    pub fn named(&self) -> [(&'static str, &Path); 5] {
        [
            ("input_directory", self.input.as_path()),
            ("reports_directory", self.reports.as_path()),
            ("benign_directory", self.benign.as_path()),
            ("quarantine_directory", self.quarantine.as_path()),
            ("error_directory", self.error.as_path()),
        ]
    }

    /// Output roots (everything except the input root) with their field names.
    #[must_use]
    pub fn outputs(&self) -> [(&'static str, &Path); 4] {
        [
            ("reports_directory", self.reports.as_path()),
            ("benign_directory", self.benign.as_path()),
            ("quarantine_directory", self.quarantine.as_path()),
            ("error_directory", self.error.as_path()),
        ]
    }
}

/// Connection settings for the analysis appliance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplianceSettings {
    /// Host, `host:port`, or full base URL of the appliance.
    pub address: String,
    /// Optional API key sent in the `Authorization` header.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Skip TLS certificate validation (self-signed appliances).
    pub accept_invalid_certs: bool,
    /// Per-request timeout.
    pub http_timeout: Duration,
    /// Attempts per request before a transport failure is surfaced.
    pub request_retries: u32,
}

impl ApplianceSettings {
    /// Resolve the base URL of the file API.
    ///
    /// A bare host (optionally with a port) expands to
    /// `https://<host>:18194/tecloud/api/v1/file/`; anything containing a
    /// scheme is used as given, with a trailing slash enforced so relative
    /// joins land inside the API path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for an empty address and
    /// [`ConfigError::InvalidUrl`] when the result does not parse.
    pub fn endpoint(&self) -> ConfigResult<Url> {
        let address = self.address.trim();
        if address.is_empty() {
            return Err(ConfigError::MissingField {
                field: "appliance_ip",
            });
        }
        let candidate = if address.contains("://") {
            if address.ends_with('/') {
                address.to_string()
            } else {
                format!("{address}/")
            }
        } else if has_explicit_port(address) {
            format!("https://{address}{APPLIANCE_API_PATH}")
        } else {
            format!("https://{address}:{APPLIANCE_PORT}{APPLIANCE_API_PATH}")
        };
        Url::parse(&candidate).map_err(|source| ConfigError::InvalidUrl {
            value: address.to_string(),
            source,
        })
    }
}

fn has_explicit_port(address: &str) -> bool {
    // Bracketed IPv6 literals carry their port after the closing bracket.
    if let Some(rest) = address.strip_prefix('[') {
        return rest
            .split_once(']')
            .is_some_and(|(_, tail)| tail.starts_with(':'));
    }
    address.matches(':').count() == 1
}

/// Verdict polling cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollSettings {
    /// Wait between two poll requests.
    pub interval: Duration,
    /// Wait between a successful upload and the first poll.
    pub initial_delay: Duration,
    /// Poll attempts before the task is declared timed out.
    pub max_attempts: u32,
}

/// Retry budget for file relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferSettings {
    /// Attempts before a transfer is reported as failed.
    pub max_retries: u32,
    /// Wait after the first failed attempt; doubled after each further one.
    pub initial_backoff: Duration,
}

/// Log output selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStyle {
    /// Human-readable lines.
    Pretty,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogStyle {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::invalid(
                "log_format",
                "must be 'pretty' or 'json'",
                value,
            )),
        }
    }
}

/// Logging preferences carried in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Output style; `None` lets the telemetry crate infer one.
    pub style: Option<LogStyle>,
}

/// Fully resolved, validated-on-demand scanner configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScannerConfig {
    /// Directory roots.
    pub roots: DirectoryRoots,
    /// Appliance connection settings.
    pub appliance: ApplianceSettings,
    /// Simultaneously in-flight ordinary files.
    pub concurrency: usize,
    /// Verdict polling cadence.
    pub poll: PollSettings,
    /// Relocation retry budget.
    pub transfer: TransferSettings,
    /// Lower-cased extensions (with leading dot) treated as archives.
    pub archive_extensions: Vec<String>,
    /// Logging preferences.
    pub logging: LogSettings,
}

/// Normalise a user-supplied extension list to lower-case, dot-prefixed form.
#[must_use]
pub fn normalize_extensions<I, S>(entries: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized: Vec<String> = entries
        .into_iter()
        .map(|entry| entry.as_ref().trim().to_ascii_lowercase())
        .filter(|entry| !entry.is_empty() && entry != ".")
        .map(|entry| {
            if entry.starts_with('.') {
                entry
            } else {
                format!(".{entry}")
            }
        })
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized
}
