//! In-memory appliance driven by per-digest scripts.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tescan_appliance::{
    ApplianceApi, ApplianceError, ApplianceResponse, ApplianceResult, PollOutcome, UploadOutcome,
    classify_poll, classify_upload, wire,
};
use tescan_fsops::{Sha1Digest, content_digest};

/// Canned appliance response bodies.
pub mod responses {
    use serde_json::{Value, json};

    /// `NOT_FOUND`: cache miss.
    #[must_use]
    pub fn not_found() -> Value {
        json!({"response": [{"status": {"code": 1004, "label": "NOT_FOUND"}}]})
    }

    /// `UPLOAD_SUCCESS`: analysis started.
    #[must_use]
    pub fn upload_success() -> Value {
        json!({"response": [{"status": {"code": 1002, "label": "UPLOAD_SUCCESS"}}]})
    }

    /// `PENDING`: keep polling.
    #[must_use]
    pub fn pending() -> Value {
        json!({"response": [{"status": {"code": 1003, "label": "PENDING"}}]})
    }

    /// Any other top-level label, e.g. `NO_QUOTA`.
    #[must_use]
    pub fn labelled(label: &str) -> Value {
        json!({"response": [{"status": {"label": label}}]})
    }

    /// `FOUND` with a `te` verdict and no report.
    #[must_use]
    pub fn found(verdict: &str) -> Value {
        json!({"response": [{
            "status": {"code": 1001, "label": "FOUND"},
            "te": {"status": {"label": "FOUND"}, "combined_verdict": verdict}
        }]})
    }

    /// `FOUND` with a `te` verdict and a summary report id.
    #[must_use]
    pub fn found_with_report(verdict: &str, report_id: &str) -> Value {
        json!({"response": [{
            "status": {"code": 1001, "label": "FOUND"},
            "te": {
                "status": {"label": "FOUND"},
                "combined_verdict": verdict,
                "summary_report": report_id
            }
        }]})
    }

    /// `FOUND` for an archive whose extracted files carry `children` verdicts.
    #[must_use]
    pub fn found_archive(container: &str, children: &[&str], report_id: Option<&str>) -> Value {
        let extracted: Vec<Value> = children
            .iter()
            .map(|verdict| json!({"combined_verdict": verdict}))
            .collect();
        json!({"response": [{
            "status": {"code": 1001, "label": "FOUND"},
            "te": {
                "status": {"label": "FOUND"},
                "combined_verdict": container,
                "summary_report": report_id,
                "extracted_files": extracted
            }
        }]})
    }

    /// `PARTIALLY_FOUND` where the early-behavioural channel reports Malicious
    /// while full emulation is still running.
    #[must_use]
    pub fn early_malicious(report_id: Option<&str>) -> Value {
        json!({"response": [{
            "status": {"code": 1006, "label": "PARTIALLY_FOUND"},
            "te": {
                "status": {"label": "PENDING"},
                "summary_report": report_id,
                "images": [{"id": "win10", "status": "pending"}]
            },
            "te_eb": {"status": {"label": "FOUND"}, "combined_verdict": "Malicious"}
        }]})
    }
}

/// What the appliance answers for one digest.
#[derive(Debug, Clone)]
pub struct Script {
    /// Cache lookup answer.
    pub lookup: Value,
    /// Upload answer.
    pub upload: Value,
    /// Poll answers in order; the last one repeats.
    pub polls: Vec<Value>,
    /// Fail every request for this digest with an HTTP 503.
    pub unavailable: bool,
}

impl Script {
    /// Cache miss, accepted upload, then `polls`.
    #[must_use]
    pub fn analysed(polls: Vec<Value>) -> Self {
        Self {
            lookup: responses::not_found(),
            upload: responses::upload_success(),
            polls,
            unavailable: false,
        }
    }

    /// Cache hit answering `lookup`.
    #[must_use]
    pub fn cached(lookup: Value) -> Self {
        Self {
            lookup,
            ..Self::analysed(Vec::new())
        }
    }

    /// Upload refused with `label`.
    #[must_use]
    pub fn rejected(label: &str) -> Self {
        Self {
            upload: responses::labelled(label),
            ..Self::analysed(Vec::new())
        }
    }

    /// Every request fails.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::analysed(Vec::new())
        }
    }
}

#[derive(Debug, Default)]
struct Calls {
    lookups: HashMap<String, usize>,
    uploads: HashMap<String, usize>,
    polls: HashMap<String, usize>,
    downloads: usize,
    tokens: Vec<String>,
    in_flight: HashSet<String>,
    peak_in_flight: usize,
}

/// [`ApplianceApi`] that answers from scripts and records how it was used.
///
/// An analysis counts as in flight from its upload until a poll (or the
/// upload itself) returns a terminal answer.
#[derive(Debug)]
pub struct ScriptedAppliance {
    scripts: HashMap<String, Script>,
    fallback: Script,
    report: Vec<u8>,
    latency: Duration,
    calls: Mutex<Calls>,
}

impl Default for ScriptedAppliance {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedAppliance {
    /// Unknown digests are analysed as Benign after one pending poll.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            fallback: Script::analysed(vec![responses::pending(), responses::found("Benign")]),
            report: b"report-archive".to_vec(),
            latency: Duration::ZERO,
            calls: Mutex::new(Calls::default()),
        }
    }

    /// Answer requests for `digest` from `script`.
    #[must_use]
    pub fn with_script(mut self, digest: &Sha1Digest, script: Script) -> Self {
        self.scripts.insert(digest.as_str().to_string(), script);
        self
    }

    /// Answer requests for files with these exact bytes from `script`.
    #[must_use]
    pub fn with_content(self, contents: &[u8], script: Script) -> Self {
        self.with_script(&Sha1Digest::of_bytes(contents), script)
    }

    /// Script used for digests without their own.
    #[must_use]
    pub fn with_fallback(mut self, script: Script) -> Self {
        self.fallback = script;
        self
    }

    /// Bytes served for every report download.
    #[must_use]
    pub fn with_report(mut self, report: Vec<u8>) -> Self {
        self.report = report;
        self
    }

    /// Delay every call, so concurrent callers overlap.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Lookups made for `digest`.
    #[must_use]
    pub fn lookup_count(&self, digest: &Sha1Digest) -> usize {
        self.calls().lookups.get(digest.as_str()).copied().unwrap_or(0)
    }

    /// Uploads made for `digest`.
    #[must_use]
    pub fn upload_count(&self, digest: &Sha1Digest) -> usize {
        self.calls().uploads.get(digest.as_str()).copied().unwrap_or(0)
    }

    /// Uploads made in total.
    #[must_use]
    pub fn total_uploads(&self) -> usize {
        self.calls().uploads.values().sum()
    }

    /// Polls made for `digest`.
    #[must_use]
    pub fn poll_count(&self, digest: &Sha1Digest) -> usize {
        self.calls().polls.get(digest.as_str()).copied().unwrap_or(0)
    }

    /// Report downloads made in total.
    #[must_use]
    pub fn download_count(&self) -> usize {
        self.calls().downloads
    }

    /// File name tokens seen on uploads, in order.
    #[must_use]
    pub fn uploaded_tokens(&self) -> Vec<String> {
        self.calls().tokens.clone()
    }

    /// Most analyses ever in flight at once.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.calls().peak_in_flight
    }

    fn calls(&self) -> MutexGuard<'_, Calls> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn script(&self, digest: &str) -> &Script {
        self.scripts.get(digest).unwrap_or(&self.fallback)
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

fn unavailable(operation: &'static str) -> ApplianceError {
    ApplianceError::Status {
        operation,
        status: 503,
        body: "scripted outage".to_string(),
    }
}

fn bump(counter: &mut HashMap<String, usize>, digest: &str) -> usize {
    let entry = counter.entry(digest.to_string()).or_default();
    *entry += 1;
    *entry
}

#[async_trait]
impl ApplianceApi for ScriptedAppliance {
    async fn lookup(&self, digest: &Sha1Digest) -> ApplianceResult<ApplianceResponse> {
        self.pause().await;
        bump(&mut self.calls().lookups, digest.as_str());
        let script = self.script(digest.as_str());
        if script.unavailable {
            return Err(unavailable("lookup"));
        }
        Ok(ApplianceResponse::from_value(
            wire::lookup_request(digest),
            script.lookup.clone(),
        ))
    }

    async fn upload(&self, path: &Path, token: &str) -> ApplianceResult<ApplianceResponse> {
        let digest = content_digest(path).map_err(|err| ApplianceError::Io {
            operation: "upload.open",
            path: path.to_path_buf(),
            source: std::io::Error::other(err),
        })?;
        let key = digest.as_str().to_string();
        {
            let mut calls = self.calls();
            bump(&mut calls.uploads, &key);
            calls.tokens.push(token.to_string());
            calls.in_flight.insert(key.clone());
            calls.peak_in_flight = calls.peak_in_flight.max(calls.in_flight.len());
        }
        self.pause().await;

        let script = self.script(&key);
        if script.unavailable {
            self.calls().in_flight.remove(&key);
            return Err(unavailable("upload"));
        }
        let response =
            ApplianceResponse::from_value(wire::upload_request(token), script.upload.clone());
        if classify_upload(&response) != UploadOutcome::Accepted {
            self.calls().in_flight.remove(&key);
        }
        Ok(response)
    }

    async fn poll(&self, digest: &Sha1Digest) -> ApplianceResult<ApplianceResponse> {
        self.pause().await;
        let key = digest.as_str();
        let attempt = bump(&mut self.calls().polls, key);
        let script = self.script(key);
        if script.unavailable {
            return Err(unavailable("poll"));
        }
        let raw = script
            .polls
            .get(attempt - 1)
            .or_else(|| script.polls.last())
            .cloned()
            .unwrap_or_else(responses::pending);
        let response = ApplianceResponse::from_value(wire::poll_request(digest), raw);
        if classify_poll(&response) != PollOutcome::Pending {
            self.calls().in_flight.remove(key);
        }
        Ok(response)
    }

    async fn download_report(&self, _report_id: &str) -> ApplianceResult<Vec<u8>> {
        self.pause().await;
        self.calls().downloads += 1;
        Ok(self.report.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tescan_appliance::{LookupOutcome, Verdict, classify_lookup};

    #[tokio::test]
    async fn scripts_are_keyed_by_content() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sample.bin");
        std::fs::write(&path, b"sample")?;
        let digest = Sha1Digest::of_bytes(b"sample");
        let appliance = ScriptedAppliance::new().with_content(
            b"sample",
            Script::analysed(vec![responses::pending(), responses::found("Malicious")]),
        );

        assert_eq!(
            classify_lookup(&appliance.lookup(&digest).await?),
            LookupOutcome::Miss
        );
        appliance.upload(&path, "sample.bin").await?;
        assert_eq!(appliance.peak_in_flight(), 1);
        assert_eq!(
            classify_poll(&appliance.poll(&digest).await?),
            PollOutcome::Pending
        );
        assert_eq!(
            classify_poll(&appliance.poll(&digest).await?),
            PollOutcome::Final(Verdict::Malicious)
        );
        assert_eq!(appliance.poll_count(&digest), 2);
        assert_eq!(appliance.uploaded_tokens(), vec!["sample.bin".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_script_fails_requests() {
        let digest = Sha1Digest::of_bytes(b"x");
        let appliance = ScriptedAppliance::new().with_script(&digest, Script::unavailable());
        assert!(appliance.lookup(&digest).await.is_err());
        assert_eq!(appliance.lookup_count(&digest), 1);
    }
}
