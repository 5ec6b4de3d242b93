//! Layered configuration loading.
//!
//! # Design
//! - Sources overlay lowest first: defaults, `TE_*` environment, YAML file, CLI.
//! - The environment arrives as an injected map; the loader never reads process state itself.
//! - Malformed values fail fast with the offending key; nothing is silently ignored.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::defaults;
use crate::error::{ConfigError, ConfigResult};
use crate::model::{
    ApplianceSettings, DEFAULT_ARCHIVE_EXTENSIONS, DirectoryRoots, LogSettings, LogStyle,
    PollSettings, ScannerConfig, TransferSettings, normalize_extensions,
};
use crate::validate::normalize_path;

/// One partially specified configuration layer.
///
/// Field names match the keys accepted in `tescan.yaml`; environment
/// variables use the same names upper-cased with a `TE_` prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    /// Input tree root.
    pub input_directory: Option<PathBuf>,
    /// Transcript and report root.
    pub reports_directory: Option<PathBuf>,
    /// Benign root.
    pub benign_directory: Option<PathBuf>,
    /// Quarantine root.
    pub quarantine_directory: Option<PathBuf>,
    /// Error root.
    pub error_directory: Option<PathBuf>,
    /// Appliance host, `host:port`, or base URL.
    pub appliance_ip: Option<String>,
    /// Optional appliance API key.
    pub api_key: Option<String>,
    /// Disable TLS certificate validation.
    pub accept_invalid_certs: Option<bool>,
    /// Ordinary-lane worker count.
    pub concurrency: Option<u64>,
    /// Seconds between poll requests.
    pub seconds_to_wait: Option<u64>,
    /// Seconds between upload and first poll.
    pub initial_poll_delay: Option<u64>,
    /// Poll attempts per file.
    pub max_retries: Option<u64>,
    /// Relocation attempts per file.
    pub transfer_retries: Option<u64>,
    /// Seconds before the first relocation retry.
    pub transfer_backoff: Option<u64>,
    /// Attempts per appliance request.
    pub request_retries: Option<u64>,
    /// Per-request timeout in seconds.
    pub http_timeout: Option<u64>,
    /// Archive extension list.
    pub archive_extensions: Option<Vec<String>>,
    /// Default log filter.
    pub log_level: Option<String>,
    /// Log output style.
    pub log_format: Option<LogStyle>,
}

impl RawConfig {
    /// Overlay `other` on top of `self`; set fields in `other` win.
    #[must_use]
    pub fn overlay(self, other: Self) -> Self {
        Self {
            input_directory: other.input_directory.or(self.input_directory),
            reports_directory: other.reports_directory.or(self.reports_directory),
            benign_directory: other.benign_directory.or(self.benign_directory),
            quarantine_directory: other.quarantine_directory.or(self.quarantine_directory),
            error_directory: other.error_directory.or(self.error_directory),
            appliance_ip: other.appliance_ip.or(self.appliance_ip),
            api_key: other.api_key.or(self.api_key),
            accept_invalid_certs: other.accept_invalid_certs.or(self.accept_invalid_certs),
            concurrency: other.concurrency.or(self.concurrency),
            seconds_to_wait: other.seconds_to_wait.or(self.seconds_to_wait),
            initial_poll_delay: other.initial_poll_delay.or(self.initial_poll_delay),
            max_retries: other.max_retries.or(self.max_retries),
            transfer_retries: other.transfer_retries.or(self.transfer_retries),
            transfer_backoff: other.transfer_backoff.or(self.transfer_backoff),
            request_retries: other.request_retries.or(self.request_retries),
            http_timeout: other.http_timeout.or(self.http_timeout),
            archive_extensions: other.archive_extensions.or(self.archive_extensions),
            log_level: other.log_level.or(self.log_level),
            log_format: other.log_format.or(self.log_format),
        }
    }

    /// Build a layer from `TE_*` variables in `env`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] when a numeric or boolean
    /// variable does not parse.
    pub fn from_env(env: &HashMap<String, String>) -> ConfigResult<Self> {
        let text = |key: &str| {
            env.get(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let path = |key: &str| text(key).map(PathBuf::from);
        let number = |key: &'static str| -> ConfigResult<Option<u64>> {
            text(key)
                .map(|value| {
                    value
                        .parse::<u64>()
                        .map_err(|_| ConfigError::invalid(key, "must be a non-negative integer", value))
                })
                .transpose()
        };

        Ok(Self {
            input_directory: path("TE_INPUT_DIRECTORY"),
            reports_directory: path("TE_REPORTS_DIRECTORY"),
            benign_directory: path("TE_BENIGN_DIRECTORY"),
            quarantine_directory: path("TE_QUARANTINE_DIRECTORY"),
            error_directory: path("TE_ERROR_DIRECTORY"),
            appliance_ip: text("TE_APPLIANCE_IP"),
            api_key: text("TE_API_KEY"),
            accept_invalid_certs: text("TE_ACCEPT_INVALID_CERTS")
                .map(|value| parse_flag("TE_ACCEPT_INVALID_CERTS", &value))
                .transpose()?,
            concurrency: number("TE_CONCURRENCY")?,
            seconds_to_wait: number("TE_SECONDS_TO_WAIT")?,
            initial_poll_delay: number("TE_INITIAL_POLL_DELAY")?,
            max_retries: number("TE_MAX_RETRIES")?,
            transfer_retries: number("TE_TRANSFER_RETRIES")?,
            transfer_backoff: number("TE_TRANSFER_BACKOFF")?,
            request_retries: number("TE_REQUEST_RETRIES")?,
            http_timeout: number("TE_HTTP_TIMEOUT")?,
            archive_extensions: text("TE_ARCHIVE_EXTENSIONS").map(|value| {
                value
                    .split([',', ' '])
                    .filter(|entry| !entry.is_empty())
                    .map(str::to_string)
                    .collect()
            }),
            log_level: text("TE_LOG_LEVEL"),
            log_format: text("TE_LOG_FORMAT")
                .map(|value| value.parse::<LogStyle>())
                .transpose()?,
        })
    }

    /// Read a YAML layer from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read and
    /// [`ConfigError::Yaml`] when it does not parse.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let contents =
            fs::read_to_string(path).map_err(|source| ConfigError::io("config.read", path, source))?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn parse_flag(key: &'static str, value: &str) -> ConfigResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, "must be a boolean", value)),
    }
}

/// Inputs to [`load`].
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Process environment (only `TE_*` and `HOME` are consulted).
    pub env: HashMap<String, String>,
    /// Explicit configuration file; when `None`, `tescan.yaml` in
    /// `base_dir` is used if present.
    pub file: Option<PathBuf>,
    /// Command-line layer.
    pub cli: RawConfig,
    /// Directory relative paths are resolved against.
    pub base_dir: PathBuf,
}

/// Resolve every layer into a [`ScannerConfig`].
///
/// The result is not yet validated; call [`ScannerConfig::validate`] before use.
///
/// # Errors
///
/// Propagates malformed environment values, unreadable or unparsable files,
/// and numeric values that do not fit their target type.
pub fn load(sources: &ConfigSources) -> ConfigResult<ScannerConfig> {
    let env_layer = RawConfig::from_env(&sources.env)?;
    let file_layer = match &sources.file {
        Some(path) => RawConfig::from_file(path)?,
        None => {
            let candidate = sources.base_dir.join(defaults::CONFIG_FILE_NAME);
            match RawConfig::from_file(&candidate) {
                Ok(layer) => layer,
                Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                    RawConfig::default()
                }
                Err(err) => return Err(err),
            }
        }
    };
    let merged = env_layer
        .overlay(file_layer)
        .overlay(sources.cli.clone());
    debug!(base_dir = %sources.base_dir.display(), "configuration layers merged");
    resolve(merged, &sources.base_dir, sources.env.get("HOME").map(Path::new))
}

fn resolve(raw: RawConfig, base_dir: &Path, home: Option<&Path>) -> ConfigResult<ScannerConfig> {
    let dir = |value: Option<PathBuf>, fallback: &str| {
        normalize_path(
            &value.unwrap_or_else(|| PathBuf::from(fallback)),
            base_dir,
            home,
        )
    };
    let poll_interval = Duration::from_secs(raw.seconds_to_wait.unwrap_or(defaults::POLL_INTERVAL_SECS));

    Ok(ScannerConfig {
        roots: DirectoryRoots {
            input: dir(raw.input_directory, defaults::INPUT_DIRECTORY),
            reports: dir(raw.reports_directory, defaults::REPORTS_DIRECTORY),
            benign: dir(raw.benign_directory, defaults::BENIGN_DIRECTORY),
            quarantine: dir(raw.quarantine_directory, defaults::QUARANTINE_DIRECTORY),
            error: dir(raw.error_directory, defaults::ERROR_DIRECTORY),
        },
        appliance: ApplianceSettings {
            address: raw.appliance_ip.unwrap_or_default(),
            api_key: raw.api_key,
            accept_invalid_certs: raw.accept_invalid_certs.unwrap_or(false),
            http_timeout: Duration::from_secs(
                raw.http_timeout.unwrap_or(defaults::HTTP_TIMEOUT_SECS),
            ),
            request_retries: narrow(
                "request_retries",
                raw.request_retries.unwrap_or(defaults::REQUEST_RETRIES),
            )?,
        },
        concurrency: usize::try_from(raw.concurrency.unwrap_or(defaults::CONCURRENCY))
            .map_err(|_| ConfigError::invalid("concurrency", "is too large", "overflow"))?,
        poll: PollSettings {
            interval: poll_interval,
            initial_delay: raw
                .initial_poll_delay
                .map_or(poll_interval, Duration::from_secs),
            max_attempts: narrow(
                "max_retries",
                raw.max_retries.unwrap_or(defaults::MAX_POLL_ATTEMPTS),
            )?,
        },
        transfer: TransferSettings {
            max_retries: narrow(
                "transfer_retries",
                raw.transfer_retries.unwrap_or(defaults::MAX_TRANSFER_RETRIES),
            )?,
            initial_backoff: Duration::from_secs(
                raw.transfer_backoff.unwrap_or(defaults::TRANSFER_BACKOFF_SECS),
            ),
        },
        archive_extensions: raw.archive_extensions.map_or_else(
            || normalize_extensions(DEFAULT_ARCHIVE_EXTENSIONS),
            normalize_extensions,
        ),
        logging: LogSettings {
            level: raw
                .log_level
                .unwrap_or_else(|| defaults::LOG_LEVEL.to_string()),
            style: raw.log_format,
        },
    })
}

fn narrow(field: &'static str, value: u64) -> ConfigResult<u32> {
    u32::try_from(value).map_err(|_| ConfigError::invalid(field, "is too large", value))
}
