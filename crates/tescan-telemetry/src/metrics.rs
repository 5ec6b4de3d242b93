//! Prometheus-backed scan metrics.
//!
//! # Design
//! - One registry per run, cloned cheaply into every worker.
//! - Exported once at the end of the batch as a text-collector file.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{Result, TelemetryError};

/// Prometheus-backed metrics registry shared across scan workers.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    files_total: IntCounterVec,
    appliance_requests_total: IntCounterVec,
    poll_attempts_total: IntCounter,
    transfer_attempts_total: IntCounterVec,
    cache_hits_total: IntCounter,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

/// Point-in-time totals for summary output.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Poll requests issued.
    pub poll_attempts_total: u64,
    /// Lookups answered from the appliance cache.
    pub cache_hits_total: u64,
    /// Transfer attempts that failed and were retried or abandoned.
    pub transfer_failures_total: u64,
}

impl Metrics {
    /// Construct a registry with every scan collector registered.
    ///
    /// # Errors
    ///
    /// Returns an error if a collector cannot be built or registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let files_total = register(
            &registry,
            "tescan_files_total",
            IntCounterVec::new(
                Opts::new("tescan_files_total", "Files processed by final verdict"),
                &["verdict"],
            ),
        )?;
        let appliance_requests_total = register(
            &registry,
            "tescan_appliance_requests_total",
            IntCounterVec::new(
                Opts::new(
                    "tescan_appliance_requests_total",
                    "Appliance requests by operation and outcome",
                ),
                &["operation", "outcome"],
            ),
        )?;
        let poll_attempts_total = register(
            &registry,
            "tescan_poll_attempts_total",
            IntCounter::with_opts(Opts::new(
                "tescan_poll_attempts_total",
                "Verdict poll requests issued",
            )),
        )?;
        let transfer_attempts_total = register(
            &registry,
            "tescan_transfer_attempts_total",
            IntCounterVec::new(
                Opts::new(
                    "tescan_transfer_attempts_total",
                    "File relocation attempts by outcome",
                ),
                &["outcome"],
            ),
        )?;
        let cache_hits_total = register(
            &registry,
            "tescan_cache_hits_total",
            IntCounter::with_opts(Opts::new(
                "tescan_cache_hits_total",
                "Digests already known to the appliance",
            )),
        )?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                files_total,
                appliance_requests_total,
                poll_attempts_total,
                transfer_attempts_total,
                cache_hits_total,
            }),
        })
    }

    /// Count one file reaching its final verdict.
    pub fn inc_file(&self, verdict: &str) {
        self.inner.files_total.with_label_values(&[verdict]).inc();
    }

    /// Count one appliance request.
    pub fn inc_appliance_request(&self, operation: &str, outcome: &str) {
        self.inner
            .appliance_requests_total
            .with_label_values(&[operation, outcome])
            .inc();
    }

    /// Count one poll request.
    pub fn inc_poll_attempt(&self) {
        self.inner.poll_attempts_total.inc();
    }

    /// Count one relocation attempt.
    pub fn inc_transfer_attempt(&self, outcome: &str) {
        self.inner
            .transfer_attempts_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Count one cache hit.
    pub fn inc_cache_hit(&self) {
        self.inner.cache_hits_total.inc();
    }

    /// Files counted under `verdict` so far.
    #[must_use]
    pub fn files_with_verdict(&self, verdict: &str) -> u64 {
        self.inner.files_total.with_label_values(&[verdict]).get()
    }

    /// Take a point-in-time snapshot of the headline counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            poll_attempts_total: self.inner.poll_attempts_total.get(),
            cache_hits_total: self.inner.cache_hits_total.get(),
            transfer_failures_total: self
                .inner
                .transfer_attempts_total
                .with_label_values(&["failed"])
                .get(),
        }
    }

    /// Render the registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or produces invalid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|source| TelemetryError::MetricsEncode { source })?;
        String::from_utf8(buffer).map_err(|source| TelemetryError::MetricsUtf8 { source })
    }

    /// Write the rendered exposition to `path`, replacing it atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering or writing fails.
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        let rendered = self.render()?;
        let staging = path.with_extension("prom.tmp");
        fs::write(&staging, rendered).map_err(|source| TelemetryError::MetricsWrite {
            path: staging.clone(),
            source,
        })?;
        fs::rename(&staging, path).map_err(|source| TelemetryError::MetricsWrite {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn register<C>(
    registry: &Registry,
    name: &'static str,
    collector: prometheus::Result<C>,
) -> Result<C>
where
    C: prometheus::core::Collector + Clone + 'static,
{
    let collector = collector.map_err(|source| TelemetryError::MetricsRegister { name, source })?;
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::MetricsRegister { name, source })?;
    Ok(collector)
}
