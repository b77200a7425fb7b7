//! Typed REST client for the generative service
//!
//! One method per endpoint the adapters use. Each call takes the key to use
//! explicitly; choosing the key is the rotator's job, not the client's.

use std::time::Duration;

use common::Secret;
use reqwest::StatusCode;
use tracing::debug;

use crate::constants::{API_KEY_HEADER, API_VERSION, DEFAULT_BASE_URL};
use crate::error::{Error, Result};
use crate::wire::{ApiErrorBody, GenerateContentRequest, GenerateContentResponse, Operation, PredictRequest};

#[derive(Clone)]
pub struct GenAiClient {
    http: reqwest::Client,
    base_url: String,
}

impl GenAiClient {
    /// Client for `base_url` with a per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// `POST /v1beta/models/{model}:generateContent`
    pub async fn generate_content(
        &self,
        key: &Secret<String>,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse> {
        let url = format!("{}/{API_VERSION}/models/{model}:generateContent", self.base_url);
        debug!(model, "generateContent");
        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, key.expose().as_str())
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        response
            .json::<GenerateContentResponse>()
            .await
            .map_err(|e| Error::InvalidResponse(format!("undecodable generateContent body: {e}")))
    }

    /// `POST /v1beta/models/{model}:predictLongRunning`
    pub async fn start_video(
        &self,
        key: &Secret<String>,
        model: &str,
        request: &PredictRequest,
    ) -> Result<Operation> {
        let url = format!("{}/{API_VERSION}/models/{model}:predictLongRunning", self.base_url);
        debug!(model, "predictLongRunning");
        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, key.expose().as_str())
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        response
            .json::<Operation>()
            .await
            .map_err(|e| Error::InvalidResponse(format!("undecodable operation body: {e}")))
    }

    /// `GET /v1beta/{operation name}`
    pub async fn poll_operation(&self, key: &Secret<String>, name: &str) -> Result<Operation> {
        let url = format!("{}/{API_VERSION}/{}", self.base_url, name.trim_start_matches('/'));
        let response = self
            .http
            .get(&url)
            .header(API_KEY_HEADER, key.expose().as_str())
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        response
            .json::<Operation>()
            .await
            .map_err(|e| Error::InvalidResponse(format!("undecodable operation body: {e}")))
    }

    /// Fetch a generated file. The key goes in the header, so the returned
    /// bytes can be handed out without exposing it.
    pub async fn download(&self, key: &Secret<String>, uri: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(uri)
            .header(API_KEY_HEADER, key.expose().as_str())
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Http(format!("download interrupted: {e}")))?;
        Ok(bytes.to_vec())
    }
}

impl Default for GenAiClient {
    fn default() -> Self {
        Self::with_client(reqwest::Client::new(), DEFAULT_BASE_URL)
    }
}

/// Phrase transport failures so the classifier can tell transient ones apart.
fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Http(format!("request timed out: {e}"))
    } else if e.is_connect() {
        Error::Http(format!("upstream unavailable: {e}"))
    } else {
        Error::Http(e.to_string())
    }
}

/// Turn a non-2xx response into `Error::Api`, keeping the upstream message
/// and its status word (e.g. `RESOURCE_EXHAUSTED`) in the text.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    Err(Error::Api {
        status: status.as_u16(),
        message: api_error_message(status, &body),
    })
}

fn api_error_message(status: StatusCode, body: &str) -> String {
    let reason = status.canonical_reason().unwrap_or("");
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => match parsed.error.status {
            Some(code) => format!("{reason}: {} ({code})", parsed.error.message),
            None => format!("{reason}: {}", parsed.error.message),
        },
        Err(_) if body.trim().is_empty() => reason.to_string(),
        Err(_) => format!("{reason}: {}", body.trim()),
    }
}
