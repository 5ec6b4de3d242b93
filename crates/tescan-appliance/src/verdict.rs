//! Verdict classifier: maps appliance responses onto closed outcome sets.
//!
//! # Design
//! - Every classifier is total. Shapes it does not recognise map to
//!   [`Verdict::Error`] rather than being guessed at.
//! - An early-behavioural Malicious signal ends polling; nothing downgrades it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::wire::{ApplianceResponse, FeatureView, StatusLabel};

/// Final classification of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The appliance found nothing harmful.
    Benign,
    /// The appliance flagged the file.
    Malicious,
    /// No trustworthy verdict could be established.
    Error,
}

impl Verdict {
    /// Parse an appliance `combined_verdict`; anything unrecognised is `Error`.
    #[must_use]
    pub fn from_wire(value: Option<&str>) -> Self {
        value
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(Self::Error)
    }

    /// Lowercase label used in logs, metrics and summaries.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Benign => "benign",
            Self::Malicious => "malicious",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a string is not one of the known verdict spellings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVerdict;

impl FromStr for Verdict {
    type Err = UnknownVerdict;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "benign" => Ok(Self::Benign),
            "malicious" => Ok(Self::Malicious),
            "error" => Ok(Self::Error),
            _ => Err(UnknownVerdict),
        }
    }
}

/// Result of a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    /// The appliance already holds a verdict for the digest.
    Hit(Verdict),
    /// Upload is needed.
    Miss,
}

/// Result of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Analysis started; poll for the verdict.
    Accepted,
    /// The appliance answered with a final result straight away.
    Resolved(Verdict),
    /// The appliance refused the file.
    Rejected {
        /// Label the appliance returned.
        label: String,
    },
}

/// Result of one poll attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Analysis finished with this verdict.
    Final(Verdict),
    /// The early-behavioural channel reported Malicious before the full result.
    EarlyMalicious,
    /// Keep polling.
    Pending,
}

impl PollOutcome {
    /// Verdict carried by a terminal outcome.
    #[must_use]
    pub const fn verdict(self) -> Option<Verdict> {
        match self {
            Self::Final(verdict) => Some(verdict),
            Self::EarlyMalicious => Some(Verdict::Malicious),
            Self::Pending => None,
        }
    }
}

/// Classify a digest lookup.
///
/// Only `FOUND` is a hit; a hit whose verdict cannot be parsed is `Hit(Error)`.
#[must_use]
pub fn classify_lookup(response: &ApplianceResponse) -> LookupOutcome {
    match response.status {
        Some(StatusLabel::Found) => LookupOutcome::Hit(te_verdict(response.te.as_ref())),
        _ => LookupOutcome::Miss,
    }
}

/// Classify an upload acknowledgement.
#[must_use]
pub fn classify_upload(response: &ApplianceResponse) -> UploadOutcome {
    match &response.status {
        Some(StatusLabel::UploadSuccess | StatusLabel::Pending | StatusLabel::PartiallyFound) => {
            UploadOutcome::Accepted
        }
        Some(StatusLabel::Found) => UploadOutcome::Resolved(te_verdict(response.te.as_ref())),
        _ => UploadOutcome::Rejected {
            label: response.label().to_string(),
        },
    }
}

/// Classify one poll response.
///
/// A `PARTIALLY_FOUND` answer is final when the `te` feature itself is
/// `FOUND`/`NOT_FOUND`, or is `PARTIALLY_FOUND` with no emulation image still
/// pending. Any other `te` label keeps polling.
#[must_use]
pub fn classify_poll(response: &ApplianceResponse) -> PollOutcome {
    let te_final = match &response.status {
        Some(StatusLabel::Found) => Some(te_verdict(response.te.as_ref())),
        Some(StatusLabel::PartiallyFound) => partial_te_verdict(response.te.as_ref()),
        Some(StatusLabel::Pending) => None,
        _ => Some(Verdict::Error),
    };

    if te_final == Some(Verdict::Malicious) {
        return PollOutcome::Final(Verdict::Malicious);
    }
    if early_malicious(response.te_eb.as_ref()) {
        return PollOutcome::EarlyMalicious;
    }
    te_final.map_or(PollOutcome::Pending, PollOutcome::Final)
}

/// Combine an archive container's verdict with its children's.
///
/// Any Malicious child makes the container Malicious; otherwise the
/// container's own verdict stands.
#[must_use]
pub fn aggregate_archive(container: Verdict, children: &[Verdict]) -> Verdict {
    if children.contains(&Verdict::Malicious) {
        Verdict::Malicious
    } else {
        container
    }
}

/// Verdicts of files the appliance extracted from an archive.
#[must_use]
pub fn child_verdicts(response: &ApplianceResponse) -> Vec<Verdict> {
    response
        .te
        .as_ref()
        .map(|te| {
            te.extracted_verdicts
                .iter()
                .map(|raw| Verdict::from_wire(Some(raw)))
                .collect()
        })
        .unwrap_or_default()
}

fn te_verdict(te: Option<&FeatureView>) -> Verdict {
    Verdict::from_wire(te.and_then(|te| te.combined_verdict.as_deref()))
}

fn partial_te_verdict(te: Option<&FeatureView>) -> Option<Verdict> {
    let te = te?;
    match te.status {
        Some(StatusLabel::Found) => Some(te_verdict(Some(te))),
        Some(StatusLabel::NotFound) => Some(Verdict::Error),
        Some(StatusLabel::PartiallyFound) if !te.has_pending_images => {
            Some(te_verdict(Some(te)))
        }
        _ => None,
    }
}

fn early_malicious(te_eb: Option<&FeatureView>) -> bool {
    te_eb.is_some_and(|eb| {
        eb.status == Some(StatusLabel::Found)
            && Verdict::from_wire(eb.combined_verdict.as_deref()) == Verdict::Malicious
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn response(raw: Value) -> ApplianceResponse {
        ApplianceResponse::from_value(Value::Null, raw)
    }

    fn entry(label: &str, te: Value, te_eb: Value) -> ApplianceResponse {
        response(json!({"response": [{"status": {"label": label}, "te": te, "te_eb": te_eb}]}))
    }

    #[test]
    fn verdict_parsing_is_closed() {
        assert_eq!(Verdict::from_wire(Some("Malicious")), Verdict::Malicious);
        assert_eq!(Verdict::from_wire(Some(" benign ")), Verdict::Benign);
        assert_eq!(Verdict::from_wire(Some("suspicious")), Verdict::Error);
        assert_eq!(Verdict::from_wire(None), Verdict::Error);
    }

    #[test]
    fn lookup_hit_and_miss() {
        let hit = entry("FOUND", json!({"combined_verdict": "Benign"}), Value::Null);
        assert_eq!(classify_lookup(&hit), LookupOutcome::Hit(Verdict::Benign));

        let odd = entry("FOUND", json!({"combined_verdict": "???"}), Value::Null);
        assert_eq!(classify_lookup(&odd), LookupOutcome::Hit(Verdict::Error));

        let miss = entry("NOT_FOUND", Value::Null, Value::Null);
        assert_eq!(classify_lookup(&miss), LookupOutcome::Miss);
        assert_eq!(classify_lookup(&response(json!("garbage"))), LookupOutcome::Miss);
    }

    #[test]
    fn upload_outcomes() {
        let accepted = entry("UPLOAD_SUCCESS", Value::Null, Value::Null);
        assert_eq!(classify_upload(&accepted), UploadOutcome::Accepted);

        let resolved = entry("FOUND", json!({"combined_verdict": "Malicious"}), Value::Null);
        assert_eq!(
            classify_upload(&resolved),
            UploadOutcome::Resolved(Verdict::Malicious)
        );

        let rejected = entry("NO_QUOTA", Value::Null, Value::Null);
        assert_eq!(
            classify_upload(&rejected),
            UploadOutcome::Rejected {
                label: "NO_QUOTA".to_string()
            }
        );
    }

    #[test]
    fn poll_pending_until_found() {
        let pending = entry("PENDING", Value::Null, Value::Null);
        assert_eq!(classify_poll(&pending), PollOutcome::Pending);

        let found = entry("FOUND", json!({"combined_verdict": "benign"}), Value::Null);
        assert_eq!(classify_poll(&found), PollOutcome::Final(Verdict::Benign));
    }

    #[test]
    fn poll_early_malicious_short_circuits() {
        let partial = entry(
            "PARTIALLY_FOUND",
            json!({"status": {"label": "PENDING"}, "images": [{"status": "pending"}]}),
            json!({"status": {"label": "FOUND"}, "combined_verdict": "Malicious"}),
        );
        assert_eq!(classify_poll(&partial), PollOutcome::EarlyMalicious);
        assert_eq!(classify_poll(&partial).verdict(), Some(Verdict::Malicious));
    }

    #[test]
    fn early_malicious_beats_benign_full_result() {
        let mixed = entry(
            "FOUND",
            json!({"combined_verdict": "Benign"}),
            json!({"status": {"label": "FOUND"}, "combined_verdict": "Malicious"}),
        );
        assert_eq!(classify_poll(&mixed), PollOutcome::EarlyMalicious);
    }

    #[test]
    fn partial_without_pending_images_is_final() {
        let done = entry(
            "PARTIALLY_FOUND",
            json!({
                "status": {"label": "PARTIALLY_FOUND"},
                "combined_verdict": "Benign",
                "images": [{"status": "found"}]
            }),
            json!({"status": {"label": "PENDING"}}),
        );
        assert_eq!(classify_poll(&done), PollOutcome::Final(Verdict::Benign));

        let not_found = entry(
            "PARTIALLY_FOUND",
            json!({"status": {"label": "NOT_FOUND"}, "images": [{"status": "pending"}]}),
            Value::Null,
        );
        assert_eq!(classify_poll(&not_found), PollOutcome::Final(Verdict::Error));

        let still_running = entry(
            "PARTIALLY_FOUND",
            json!({"status": {"label": "PENDING"}, "images": [{"status": "pending"}]}),
            json!({"status": {"label": "FOUND"}, "combined_verdict": "Benign"}),
        );
        assert_eq!(classify_poll(&still_running), PollOutcome::Pending);

        let pending_without_images = entry(
            "PARTIALLY_FOUND",
            json!({"status": {"label": "PENDING"}}),
            json!({"status": {"label": "FOUND"}, "combined_verdict": "Benign"}),
        );
        assert_eq!(classify_poll(&pending_without_images), PollOutcome::Pending);

        let unlabelled = entry(
            "PARTIALLY_FOUND",
            json!({"combined_verdict": "Benign"}),
            Value::Null,
        );
        assert_eq!(classify_poll(&unlabelled), PollOutcome::Pending);
    }

    #[test]
    fn unknown_poll_label_fails_closed() {
        let odd = entry("FILE_TYPE_NOT_SUPPORTED", Value::Null, Value::Null);
        assert_eq!(classify_poll(&odd), PollOutcome::Final(Verdict::Error));
        assert_eq!(
            classify_poll(&response(json!({"response": []}))),
            PollOutcome::Final(Verdict::Error)
        );
    }

    #[test]
    fn archive_with_one_malicious_child_is_malicious() {
        let children = [Verdict::Benign, Verdict::Malicious, Verdict::Benign];
        assert_eq!(
            aggregate_archive(Verdict::Benign, &children),
            Verdict::Malicious
        );
        assert_eq!(
            aggregate_archive(Verdict::Benign, &[Verdict::Benign, Verdict::Error]),
            Verdict::Benign
        );
    }

    #[test]
    fn child_verdicts_come_from_extracted_files() {
        let found = entry(
            "FOUND",
            json!({
                "combined_verdict": "Benign",
                "extracted_files": [
                    {"combined_verdict": "benign"},
                    {"combined_verdict": "malicious"},
                    {"name": "no verdict"}
                ]
            }),
            Value::Null,
        );
        assert_eq!(
            child_verdicts(&found),
            vec![Verdict::Benign, Verdict::Malicious]
        );
    }
}
