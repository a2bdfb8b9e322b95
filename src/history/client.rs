//! Telemetry Query Endpoint client
//!
//! ## Endpoints
//!
//! - `GET  {base}/api/devices/telemetry` - readings for all devices
//! - `GET  {base}/api/telemetry/device/{deviceId}` - readings for one device
//! - `POST {base}/api/devices/telemetry` - publish one reading
//! - `POST {base}/api/telemetry/send` - publish one reading as the device the
//!   token belongs to, body `{"payload": "<json string>"}`
//!
//! Every request carries `Authorization: Bearer <token>` when the credential
//! provider has a token; no header is sent otherwise.

use crate::telemetry::{Measurements, Scope};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Network failure, timeout or unbuildable request
    Request(String),
    /// 401 / 403 from the endpoint
    Unauthorized(u16),
    /// Any other non-success status
    Status(u16),
    /// Response body is not a JSON array
    InvalidBody(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FetchError::InvalidBody(err.to_string())
        } else {
            FetchError::Request(err.to_string())
        }
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Request(msg) => write!(f, "Telemetry request failed: {}", msg),
            FetchError::Unauthorized(code) => write!(f, "Telemetry request not authorized ({})", code),
            FetchError::Status(code) => write!(f, "Telemetry endpoint returned status {}", code),
            FetchError::InvalidBody(msg) => write!(f, "Invalid telemetry response: {}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

/// Supplies the bearer token used on query calls
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Fixed token known up front (or none)
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Source of raw historical telemetry records
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Fetch the records for a scope, in the order the endpoint returns them
    async fn fetch_records(&self, scope: &Scope) -> Result<Vec<Value>, FetchError>;
}

/// HTTP client for the telemetry query endpoint
pub struct TelemetryClient {
    base_url: String,
    http: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
}

impl TelemetryClient {
    pub fn new(
        base_url: &str,
        credentials: Arc<dyn CredentialProvider>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.credentials.bearer_token() {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    /// Publish one reading to the backend, which fans it out to subscribers
    pub async fn send_telemetry(&self, measurements: &Measurements) -> Result<(), FetchError> {
        let body = serde_json::json!({
            "temperature": measurements.temperature,
            "humidity": measurements.humidity,
        });

        self.post_json("/api/devices/telemetry", &body).await?;
        log::info!("📤 Sent telemetry: {}", body);
        Ok(())
    }

    /// Publish one reading for the device identified by the bearer token
    ///
    /// The measurements travel as a JSON-encoded string in `payload`, the same
    /// shape the push endpoint later delivers.
    pub async fn send_device_telemetry(&self, measurements: &Measurements) -> Result<(), FetchError> {
        let payload = serde_json::json!({
            "temperature": measurements.temperature,
            "humidity": measurements.humidity,
        });
        let body = serde_json::json!({ "payload": payload.to_string() });

        self.post_json("/api/telemetry/send", &body).await?;
        log::info!("📤 Sent device telemetry: {}", payload);
        Ok(())
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<(), FetchError> {
        let response = self
            .authorize(self.http.post(self.url(path)))
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await?;

        check_status(response.status())
    }
}

#[async_trait]
impl TelemetrySource for TelemetryClient {
    async fn fetch_records(&self, scope: &Scope) -> Result<Vec<Value>, FetchError> {
        let url = self.url(&scope.query_path());
        log::debug!("GET {}", url);

        let response = self.authorize(self.http.get(&url)).send().await?;
        check_status(response.status())?;

        match response.json::<Value>().await? {
            Value::Array(records) => Ok(records),
            other => Err(FetchError::InvalidBody(format!(
                "expected a JSON array, got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn check_status(status: reqwest::StatusCode) -> Result<(), FetchError> {
    if status.is_success() {
        return Ok(());
    }
    match status.as_u16() {
        code @ (401 | 403) => Err(FetchError::Unauthorized(code)),
        code => Err(FetchError::Status(code)),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
