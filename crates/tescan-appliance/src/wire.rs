//! Request and response shapes of the appliance file API.
//!
//! # Design
//! - Responses keep the raw JSON for audit transcripts next to a lenient typed view.
//! - A response whose typed view cannot be built is still returned; the verdict
//!   classifier treats it as unrecognised and fails closed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tescan_fsops::Sha1Digest;

/// Analysis feature requested from the appliance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Full threat emulation.
    Te,
    /// Early-behavioural emulation that may flag maliciousness before `Te` completes.
    TeEb,
}

#[derive(Debug, Serialize)]
struct RequestEnvelope<'a> {
    request: [RequestEntry<'a>; 1],
}

#[derive(Debug, Serialize)]
struct RequestEntry<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    sha1: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_name: Option<&'a str>,
    features: &'a [Feature],
    te: TeOptions,
}

#[derive(Debug, Serialize)]
struct TeOptions {
    reports: [&'static str; 1],
    version_info: bool,
    return_errors: bool,
}

fn envelope(sha1: Option<&str>, file_name: Option<&str>, features: &[Feature]) -> Value {
    let body = RequestEnvelope {
        request: [RequestEntry {
            sha1,
            file_name,
            features,
            te: TeOptions {
                reports: ["summary"],
                version_info: true,
                return_errors: true,
            },
        }],
    };
    serde_json::to_value(body).unwrap_or(Value::Null)
}

/// Cache lookup body: `te` only, keyed by digest.
#[must_use]
pub fn lookup_request(digest: &Sha1Digest) -> Value {
    envelope(Some(digest.as_str()), None, &[Feature::Te])
}

/// Poll body: `te` and `te_eb`, keyed by digest.
#[must_use]
pub fn poll_request(digest: &Sha1Digest) -> Value {
    envelope(Some(digest.as_str()), None, &[Feature::Te, Feature::TeEb])
}

/// Upload body: `te` and `te_eb`, naming the file only by its wire token.
#[must_use]
pub fn upload_request(token: &str) -> Value {
    envelope(None, Some(token), &[Feature::Te, Feature::TeEb])
}

/// Status label reported by the appliance for a request or a feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StatusLabel {
    /// Results are available.
    Found,
    /// No results exist for the digest.
    NotFound,
    /// Analysis is running.
    Pending,
    /// Some features have results, others are still running.
    PartiallyFound,
    /// The upload was accepted and analysis has started.
    UploadSuccess,
    /// Anything else (`NO_QUOTA`, `FILE_TYPE_NOT_SUPPORTED`, `BAD_REQUEST`, ...).
    Other(String),
}

impl StatusLabel {
    /// Parse an appliance label.
    #[must_use]
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "FOUND" => Self::Found,
            "NOT_FOUND" => Self::NotFound,
            "PENDING" => Self::Pending,
            "PARTIALLY_FOUND" => Self::PartiallyFound,
            "UPLOAD_SUCCESS" => Self::UploadSuccess,
            other => Self::Other(other.to_string()),
        }
    }

    /// Wire spelling of the label.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Found => "FOUND",
            Self::NotFound => "NOT_FOUND",
            Self::Pending => "PENDING",
            Self::PartiallyFound => "PARTIALLY_FOUND",
            Self::UploadSuccess => "UPLOAD_SUCCESS",
            Self::Other(label) => label,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct WireStatus {
    #[serde(default)]
    pub(crate) label: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct WireImage {
    #[serde(default)]
    pub(crate) status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct WireExtracted {
    #[serde(default)]
    pub(crate) combined_verdict: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct WireFeature {
    #[serde(default)]
    pub(crate) status: Option<WireStatus>,
    #[serde(default)]
    pub(crate) combined_verdict: Option<String>,
    #[serde(default)]
    pub(crate) summary_report: Option<String>,
    #[serde(default)]
    pub(crate) images: Vec<WireImage>,
    #[serde(default)]
    pub(crate) extracted_files: Vec<WireExtracted>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireEntry {
    pub(crate) status: WireStatus,
    #[serde(default)]
    pub(crate) te: Option<WireFeature>,
    #[serde(default)]
    pub(crate) te_eb: Option<WireFeature>,
}

#[derive(Debug, Deserialize)]
struct WireEnvelope {
    response: Vec<WireEntry>,
}

/// Per-feature view of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureView {
    /// Feature status label, when present.
    pub status: Option<StatusLabel>,
    /// Raw `combined_verdict` string, when present.
    pub combined_verdict: Option<String>,
    /// Summary report identifier, when present.
    pub summary_report: Option<String>,
    /// Whether any emulation image is still pending.
    pub has_pending_images: bool,
    /// Raw verdict strings of files extracted from an archive.
    pub extracted_verdicts: Vec<String>,
}

impl From<WireFeature> for FeatureView {
    fn from(wire: WireFeature) -> Self {
        Self {
            status: wire
                .status
                .and_then(|status| status.label)
                .map(|label| StatusLabel::parse(&label)),
            combined_verdict: wire.combined_verdict,
            summary_report: wire.summary_report.filter(|id| !id.trim().is_empty()),
            has_pending_images: wire.images.iter().any(|image| {
                image
                    .status
                    .as_deref()
                    .is_some_and(|status| status.eq_ignore_ascii_case("pending"))
            }),
            extracted_verdicts: wire
                .extracted_files
                .into_iter()
                .filter_map(|file| file.combined_verdict)
                .collect(),
        }
    }
}

/// One appliance exchange: the JSON sent, the JSON received, and a typed view.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplianceResponse {
    /// Request body as sent.
    pub request: Value,
    /// Response body as received.
    pub raw: Value,
    /// Top-level status label; `None` when the body has no recognisable shape.
    pub status: Option<StatusLabel>,
    /// `te` feature view.
    pub te: Option<FeatureView>,
    /// `te_eb` feature view.
    pub te_eb: Option<FeatureView>,
}

impl ApplianceResponse {
    /// Build a response from the request that produced it and the raw body.
    #[must_use]
    pub fn from_value(request: Value, raw: Value) -> Self {
        let entry = serde_json::from_value::<WireEnvelope>(raw.clone())
            .ok()
            .and_then(|envelope| envelope.response.into_iter().next());
        match entry {
            Some(entry) => Self {
                request,
                raw,
                status: entry.status.label.map(|label| StatusLabel::parse(&label)),
                te: entry.te.map(FeatureView::from),
                te_eb: entry.te_eb.map(FeatureView::from),
            },
            None => Self {
                request,
                raw,
                status: None,
                te: None,
                te_eb: None,
            },
        }
    }

    /// Summary report identifier of the `te` feature.
    #[must_use]
    pub fn report_id(&self) -> Option<&str> {
        self.te
            .as_ref()
            .and_then(|te| te.summary_report.as_deref())
    }

    /// Top-level label as sent on the wire, or `"UNRECOGNISED"`.
    #[must_use]
    pub fn label(&self) -> &str {
        self.status.as_ref().map_or("UNRECOGNISED", StatusLabel::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_request_asks_for_te_only() {
        let digest = Sha1Digest::of_bytes(b"abc");
        assert_eq!(
            lookup_request(&digest),
            json!({
                "request": [{
                    "sha1": "a9993e364706816aba3e25717850c26c9cd0d89d",
                    "features": ["te"],
                    "te": {"reports": ["summary"], "version_info": true, "return_errors": true}
                }]
            })
        );
    }

    #[test]
    fn upload_request_carries_token_not_digest() {
        let body = upload_request("my+file%FF.txt");
        assert_eq!(body["request"][0]["file_name"], "my+file%FF.txt");
        assert_eq!(body["request"][0]["features"], json!(["te", "te_eb"]));
        assert!(body["request"][0].get("sha1").is_none());
    }

    #[test]
    fn response_view_extracts_features() {
        let raw = json!({
            "response": [{
                "status": {"code": 1006, "label": "PARTIALLY_FOUND"},
                "te": {
                    "status": {"label": "PARTIALLY_FOUND"},
                    "images": [{"id": "win7", "status": "found"}, {"id": "xp", "status": "pending"}]
                },
                "te_eb": {"status": {"label": "FOUND"}, "combined_verdict": "Malicious"}
            }]
        });
        let response = ApplianceResponse::from_value(Value::Null, raw);
        assert_eq!(response.status, Some(StatusLabel::PartiallyFound));
        let te = response.te.as_ref().map(|te| te.has_pending_images);
        assert_eq!(te, Some(true));
        let eb = response.te_eb.as_ref().and_then(|eb| eb.combined_verdict.clone());
        assert_eq!(eb.as_deref(), Some("Malicious"));
    }

    #[test]
    fn unrecognised_body_has_no_status() {
        let response = ApplianceResponse::from_value(Value::Null, json!({"unexpected": true}));
        assert_eq!(response.status, None);
        assert_eq!(response.label(), "UNRECOGNISED");
    }

    #[test]
    fn blank_report_id_is_ignored() {
        let raw = json!({"response": [{"status": {"label": "FOUND"}, "te": {"summary_report": " "}}]});
        assert_eq!(ApplianceResponse::from_value(Value::Null, raw).report_id(), None);
    }
}
