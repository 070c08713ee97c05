//! HTTP client for the polling transport and mutation dispatch.
//!
//! Two call shapes: `fetch_snapshot` (the polling source contract — a
//! GET returning a complete snapshot object) and `execute` (one
//! mutating request, used directly when online and by the offline
//! queue during replay). Both map HTTP outcomes into the crate
//! [`Error`] taxonomy; nothing here decides retry policy.

use reqwest::Method;
use serde_json::Value;
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;

/// Client for the backend's request/response surfaces.
#[derive(Debug, Clone)]
pub struct DashboardClient {
    http: reqwest::Client,
}

impl DashboardClient {
    pub fn new(transport: &TransportConfig) -> Result<Self, Error> {
        Ok(Self {
            http: transport.build_client()?,
        })
    }

    /// Build from an existing `reqwest::Client` (test seam).
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Fetch a complete snapshot from a polling endpoint.
    ///
    /// Every successful response is authoritative — the transport
    /// manager replaces its prior snapshot wholesale.
    pub async fn fetch_snapshot(&self, endpoint: &Url) -> Result<Value, Error> {
        let response = self.http.get(endpoint.clone()).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(status_error(status.as_u16(), response.text().await.ok()));
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| Error::Protocol {
            message: format!("snapshot decode failed: {e}"),
            body,
        })
    }

    /// Execute one mutating request against the backend.
    pub async fn execute(
        &self,
        method: &str,
        endpoint: &Url,
        payload: &Value,
    ) -> Result<Value, Error> {
        let method = Method::from_bytes(method.as_bytes()).map_err(|_| Error::Validation {
            message: format!("invalid HTTP method: {method}"),
        })?;

        let mut request = self.http.request(method, endpoint.clone());
        if !payload.is_null() {
            request = request.json(payload);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(status_error(status.as_u16(), response.text().await.ok()));
        }

        let body = response.text().await?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| Error::Protocol {
            message: format!("response decode failed: {e}"),
            body,
        })
    }
}

/// Map a non-2xx response to the taxonomy. 422 is the backend's
/// semantic-rejection status and becomes `Validation` so it is never
/// retried or queued.
fn status_error(status: u16, body: Option<String>) -> Error {
    let message = body
        .as_deref()
        .and_then(extract_error_message)
        .unwrap_or_else(|| format!("HTTP {status}"));

    if status == 422 {
        Error::Validation { message }
    } else {
        Error::Http { status, message }
    }
}

/// Pull `message` out of a structured error body, if there is one.
fn extract_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("message")
        .or_else(|| value.get("error"))
        .and_then(Value::as_str)
        .map(String::from)
}
