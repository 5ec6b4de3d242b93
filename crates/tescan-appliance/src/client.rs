//! HTTP client for the appliance file API.
//!
//! # Design
//! - [`ApplianceApi`] is the seam the orchestrator depends on; [`HttpAppliance`]
//!   is the production implementation and tests script their own.
//! - Transport failures and gateway errors (502/503/504) are retried with a
//!   doubling backoff before surfacing; any other answer is returned as-is.
//! - Uploads stream the file from disk; the whole file is never buffered.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode, Url};
use serde_json::Value;
use tescan_config::ApplianceSettings;
use tescan_fsops::Sha1Digest;
use tescan_telemetry::Metrics;
use tracing::{debug, warn};

use crate::error::{ApplianceError, ApplianceResult};
use crate::wire::{self, ApplianceResponse};

const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);
const ERROR_BODY_LIMIT: usize = 512;

/// Operations the scanner needs from an analysis appliance.
#[async_trait]
pub trait ApplianceApi: Send + Sync {
    /// Ask whether the appliance already holds results for `digest`.
    async fn lookup(&self, digest: &Sha1Digest) -> ApplianceResult<ApplianceResponse>;

    /// Upload the file at `path`, presenting it to the appliance as `token`.
    async fn upload(&self, path: &Path, token: &str) -> ApplianceResult<ApplianceResponse>;

    /// Query analysis progress for `digest`, including the early-behavioural channel.
    async fn poll(&self, digest: &Sha1Digest) -> ApplianceResult<ApplianceResponse>;

    /// Fetch and decode the summary report archive identified by `report_id`.
    async fn download_report(&self, report_id: &str) -> ApplianceResult<Vec<u8>>;
}

/// [`ApplianceApi`] over HTTPS with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpAppliance {
    client: Client,
    base: Url,
    attempts: u32,
    backoff: Duration,
    metrics: Option<Metrics>,
}

impl HttpAppliance {
    /// Build a client for the endpoint derived from `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`ApplianceError::Setup`] when the address is unusable or the
    /// HTTP client cannot be built.
    pub fn from_settings(settings: &ApplianceSettings) -> ApplianceResult<Self> {
        let base = settings
            .endpoint()
            .map_err(|err| ApplianceError::setup("appliance address is invalid", err))?;
        Self::new(base, settings)
    }

    /// Build a client for an explicit base URL (must end with `/`).
    ///
    /// # Errors
    ///
    /// Returns [`ApplianceError::Setup`] when the API key is not a valid header
    /// value or the HTTP client cannot be built.
    pub fn new(base: Url, settings: &ApplianceSettings) -> ApplianceResult<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = settings.api_key.as_deref() {
            let mut value = HeaderValue::from_str(key)
                .map_err(|err| ApplianceError::setup("api key is not a valid header value", err))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(settings.http_timeout)
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .default_headers(headers)
            .build()
            .map_err(|err| ApplianceError::setup("failed to build HTTP client", err))?;

        if settings.accept_invalid_certs {
            warn!(endpoint = %base, "TLS certificate validation is disabled");
        }

        Ok(Self {
            client,
            base,
            attempts: settings.request_retries.max(1),
            backoff: DEFAULT_RETRY_BACKOFF,
            metrics: None,
        })
    }

    /// Override the initial delay between transport retries.
    #[must_use]
    pub const fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Record request outcomes in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Base URL every operation is resolved against.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, operation: &'static str, path: &str) -> ApplianceResult<Url> {
        self.base
            .join(path)
            .map_err(|source| ApplianceError::Endpoint { operation, source })
    }

    async fn query(&self, operation: &'static str, body: Value) -> ApplianceResult<ApplianceResponse> {
        let url = self.endpoint(operation, "query")?;
        let response = self
            .send(operation, || {
                let request = self.client.post(url.clone()).json(&body);
                async move { Ok::<_, ApplianceError>(request) }
            })
            .await?;
        let raw = read_json(operation, response).await?;
        Ok(ApplianceResponse::from_value(body, raw))
    }

    async fn send<F, Fut>(&self, operation: &'static str, build: F) -> ApplianceResult<Response>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = ApplianceResult<RequestBuilder>> + Send,
    {
        let mut delay = self.backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = build().await?;
            match request.send().await {
                Ok(response) if is_gateway_error(response.status()) && attempt < self.attempts => {
                    warn!(
                        operation,
                        attempt,
                        status = response.status().as_u16(),
                        "appliance busy; retrying"
                    );
                }
                Ok(response) => return self.check_status(operation, response).await,
                Err(source) if attempt < self.attempts => {
                    warn!(operation, attempt, error = %source, "appliance request failed; retrying");
                }
                Err(source) => {
                    self.record(operation, "transport_error");
                    return Err(ApplianceError::Transport {
                        operation,
                        attempts: attempt,
                        source,
                    });
                }
            }
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
    }

    async fn check_status(
        &self,
        operation: &'static str,
        response: Response,
    ) -> ApplianceResult<Response> {
        let status = response.status();
        if status.is_success() {
            self.record(operation, "ok");
            return Ok(response);
        }
        self.record(operation, "http_error");
        let body = response.text().await.unwrap_or_default();
        Err(ApplianceError::Status {
            operation,
            status: status.as_u16(),
            body: truncate(body.trim(), ERROR_BODY_LIMIT),
        })
    }

    fn record(&self, operation: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_appliance_request(operation, outcome);
        }
    }
}

#[async_trait]
impl ApplianceApi for HttpAppliance {
    async fn lookup(&self, digest: &Sha1Digest) -> ApplianceResult<ApplianceResponse> {
        debug!(sha1 = %digest, "querying appliance cache");
        self.query("lookup", wire::lookup_request(digest)).await
    }

    async fn upload(&self, path: &Path, token: &str) -> ApplianceResult<ApplianceResponse> {
        let operation = "upload";
        let url = self.endpoint(operation, "upload")?;
        let request = wire::upload_request(token);
        let request_text = request.to_string();
        debug!(path = %path.display(), token, "uploading file to appliance");

        let response = self
            .send(operation, || {
                let client = self.client.clone();
                let url = url.clone();
                let path = path.to_path_buf();
                let token = token.to_string();
                let request_text = request_text.clone();
                async move { streaming_upload(client, url, &path, token, request_text).await }
            })
            .await?;
        let raw = read_json(operation, response).await?;
        Ok(ApplianceResponse::from_value(request, raw))
    }

    async fn poll(&self, digest: &Sha1Digest) -> ApplianceResult<ApplianceResponse> {
        self.query("poll", wire::poll_request(digest)).await
    }

    async fn download_report(&self, report_id: &str) -> ApplianceResult<Vec<u8>> {
        let operation = "download";
        let mut url = self.endpoint(operation, "download")?;
        url.query_pairs_mut().append_pair("id", report_id);
        debug!(report_id, "downloading analysis report");

        let response = self
            .send(operation, || {
                let request = self.client.get(url.clone());
                async move { Ok::<_, ApplianceError>(request) }
            })
            .await?;
        let text = response
            .text()
            .await
            .map_err(|source| ApplianceError::Transport {
                operation,
                attempts: 1,
                source,
            })?;
        STANDARD
            .decode(text.trim())
            .map_err(|err| ApplianceError::decode(operation, "report body is not base64", err))
    }
}

async fn streaming_upload(
    client: Client,
    url: Url,
    path: &Path,
    token: String,
    request_text: String,
) -> ApplianceResult<RequestBuilder> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|source| ApplianceError::Io {
            operation: "upload.open",
            path: path.to_path_buf(),
            source,
        })?;
    let length = file
        .metadata()
        .await
        .map_err(|source| ApplianceError::Io {
            operation: "upload.metadata",
            path: path.to_path_buf(),
            source,
        })?
        .len();
    let part = Part::stream_with_length(Body::from(file), length)
        .file_name(token)
        .mime_str("application/octet-stream")
        .map_err(|err| ApplianceError::setup("invalid upload content type", err))?;
    let form = Form::new().text("request", request_text).part("file", part);
    Ok(client.post(url).multipart(form))
}

async fn read_json(operation: &'static str, response: Response) -> ApplianceResult<Value> {
    let bytes = response
        .bytes()
        .await
        .map_err(|source| ApplianceError::Transport {
            operation,
            attempts: 1,
            source,
        })?;
    serde_json::from_slice(&bytes)
        .map_err(|err| ApplianceError::decode(operation, "response body is not JSON", err))
}

const fn is_gateway_error(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::{LookupOutcome, PollOutcome, UploadOutcome, Verdict};
    use crate::verdict::{classify_lookup, classify_poll, classify_upload};
    use anyhow::Result;
    use httpmock::MockServer;
    use httpmock::prelude::*;
    use serde_json::json;

    fn settings() -> ApplianceSettings {
        ApplianceSettings {
            address: String::new(),
            api_key: None,
            accept_invalid_certs: false,
            http_timeout: Duration::from_secs(5),
            request_retries: 3,
        }
    }

    fn appliance(server: &MockServer, settings: &ApplianceSettings) -> Result<HttpAppliance> {
        let base = Url::parse(&format!("{}/tecloud/api/v1/file/", server.base_url()))?;
        Ok(HttpAppliance::new(base, settings)?.with_retry_backoff(Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn lookup_posts_digest_and_classifies_hit() -> Result<()> {
        let server = MockServer::start_async().await;
        let digest = Sha1Digest::of_bytes(b"abc");
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/tecloud/api/v1/file/query")
                .json_body(wire::lookup_request(&digest));
            then.status(200).json_body(json!({
                "response": [{
                    "status": {"code": 1001, "label": "FOUND"},
                    "te": {"combined_verdict": "Benign"}
                }]
            }));
        });

        let response = appliance(&server, &settings())?.lookup(&digest).await?;
        mock.assert();
        assert_eq!(classify_lookup(&response), LookupOutcome::Hit(Verdict::Benign));
        assert_eq!(response.request, wire::lookup_request(&digest));
        Ok(())
    }

    #[tokio::test]
    async fn api_key_is_sent_as_authorization() -> Result<()> {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/tecloud/api/v1/file/query")
                .header("authorization", "secret-key");
            then.status(200)
                .json_body(json!({"response": [{"status": {"label": "PENDING"}}]}));
        });
        let mut settings = settings();
        settings.api_key = Some("secret-key".to_string());

        let response = appliance(&server, &settings)?
            .poll(&Sha1Digest::of_bytes(b"x"))
            .await?;
        mock.assert();
        assert_eq!(classify_poll(&response), PollOutcome::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn upload_sends_multipart_with_token() -> Result<()> {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/tecloud/api/v1/file/upload");
            then.status(200)
                .json_body(json!({"response": [{"status": {"label": "UPLOAD_SUCCESS"}}]}));
        });
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("my file.bin");
        std::fs::write(&path, b"payload")?;

        let response = appliance(&server, &settings())?
            .upload(&path, "my+file.bin")
            .await?;
        mock.assert();
        assert_eq!(classify_upload(&response), UploadOutcome::Accepted);
        assert_eq!(response.request["request"][0]["file_name"], "my+file.bin");
        Ok(())
    }

    #[tokio::test]
    async fn upload_of_missing_file_is_io_error() -> Result<()> {
        let server = MockServer::start_async().await;
        let err = appliance(&server, &settings())?
            .upload(Path::new("/no/such/file"), "file")
            .await
            .unwrap_err();
        assert!(matches!(err, ApplianceError::Io { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn download_decodes_base64_report() -> Result<()> {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/tecloud/api/v1/file/download")
                .query_param("id", "report-1");
            then.status(200).body(format!("{}\n", STANDARD.encode(b"tar-bytes")));
        });

        let bytes = appliance(&server, &settings())?
            .download_report("report-1")
            .await?;
        mock.assert();
        assert_eq!(bytes, b"tar-bytes");
        Ok(())
    }

    #[tokio::test]
    async fn download_rejects_non_base64() -> Result<()> {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/tecloud/api/v1/file/download");
            then.status(200).body("<html>not a report</html>");
        });
        let err = appliance(&server, &settings())?
            .download_report("r")
            .await
            .unwrap_err();
        assert!(matches!(err, ApplianceError::Decode { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn gateway_errors_are_retried_then_surface_status() -> Result<()> {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/tecloud/api/v1/file/query");
            then.status(503).body("busy");
        });
        let metrics = Metrics::new()?;
        let err = appliance(&server, &settings())?
            .with_metrics(metrics.clone())
            .poll(&Sha1Digest::of_bytes(b"x"))
            .await
            .unwrap_err();
        mock.assert_calls(3);
        match err {
            ApplianceError::Status { status, body, .. } => {
                assert_eq!(status, 503);
                assert_eq!(body, "busy");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(metrics.render()?.contains("http_error"));
        Ok(())
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() -> Result<()> {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/tecloud/api/v1/file/query");
            then.status(400).body("bad request");
        });
        let err = appliance(&server, &settings())?
            .lookup(&Sha1Digest::of_bytes(b"x"))
            .await
            .unwrap_err();
        mock.assert_calls(1);
        assert!(matches!(err, ApplianceError::Status { status: 400, .. }));
        Ok(())
    }

    #[tokio::test]
    async fn non_json_body_is_decode_error() -> Result<()> {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/tecloud/api/v1/file/query");
            then.status(200).body("not json");
        });
        let err = appliance(&server, &settings())?
            .lookup(&Sha1Digest::of_bytes(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplianceError::Decode { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_appliance_is_transport_error() -> Result<()> {
        let base = Url::parse("http://127.0.0.1:9/tecloud/api/v1/file/")?;
        let err = HttpAppliance::new(base, &settings())?
            .with_retry_backoff(Duration::from_millis(1))
            .lookup(&Sha1Digest::of_bytes(b"x"))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(matches!(err, ApplianceError::Transport { attempts: 3, .. }));
        Ok(())
    }

    #[test]
    fn from_settings_rejects_empty_address() {
        let err = HttpAppliance::from_settings(&settings()).unwrap_err();
        assert!(matches!(err, ApplianceError::Setup { .. }));
    }

    #[tokio::test]
    async fn debug_output_includes_metrics_and_endpoint() -> Result<()> {
        let server = MockServer::start_async().await;
        let metrics =
            tescan_telemetry::Metrics::new().map_err(|err| anyhow::anyhow!("{err}"))?;
        let appliance = appliance(&server, &settings())?.with_metrics(metrics);
        let rendered = format!("{appliance:?}");
        assert!(rendered.contains("HttpAppliance"));
        assert!(rendered.contains("Metrics"));
        assert!(rendered.contains("/tecloud/api/v1/file/"));
        Ok(())
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééé", 3), "é...");
    }
}
