//! Built-in defaults applied beneath every other configuration source.
//!
//! # Design
//! - Directory defaults are relative and resolved against the working directory.
//! - Timing defaults mirror the appliance's own recommended polling cadence.

/// Default input tree.
pub(crate) const INPUT_DIRECTORY: &str = "input_files";
/// Default transcript and report root.
pub(crate) const REPORTS_DIRECTORY: &str = "te_response_data";
/// Default benign root.
pub(crate) const BENIGN_DIRECTORY: &str = "benign_files";
/// Default quarantine root.
pub(crate) const QUARANTINE_DIRECTORY: &str = "quarantine_files";
/// Default error root.
pub(crate) const ERROR_DIRECTORY: &str = "error_files";

pub(crate) const CONCURRENCY: u64 = 4;
pub(crate) const POLL_INTERVAL_SECS: u64 = 15;
pub(crate) const MAX_POLL_ATTEMPTS: u64 = 120;
pub(crate) const MAX_TRANSFER_RETRIES: u64 = 3;
pub(crate) const TRANSFER_BACKOFF_SECS: u64 = 2;
pub(crate) const REQUEST_RETRIES: u64 = 3;
pub(crate) const HTTP_TIMEOUT_SECS: u64 = 60;
pub(crate) const LOG_LEVEL: &str = "info";

/// Name of the configuration file picked up from the working directory.
pub const CONFIG_FILE_NAME: &str = "tescan.yaml";
