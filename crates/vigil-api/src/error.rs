use thiserror::Error;

/// Top-level error type for the `vigil-api` crate.
///
/// Covers every failure mode at the wire boundary: HTTP polling,
/// mutation dispatch, and the WebSocket event stream. `vigil-core`
/// maps these into user-facing diagnostics; retry eligibility is
/// decided exclusively by [`classify`](crate::availability::classify).
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// No response received (connection refused, DNS failure, reset).
    #[error("Network error: {0}")]
    Network(String),

    /// Request exceeded its deadline.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── HTTP ────────────────────────────────────────────────────────
    /// Response received with a non-2xx status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Request rejected as semantically invalid by the backend.
    /// Never retried, never queued.
    #[error("Validation rejected: {message}")]
    Validation { message: String },

    // ── Data ────────────────────────────────────────────────────────
    /// Response received but malformed or undecodable.
    #[error("Protocol error: {message}")]
    Protocol { message: String, body: String },

    // ── Event stream ────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("Stream connection failed: {0}")]
    StreamConnect(String),

    /// WebSocket closed unexpectedly.
    #[error("Stream closed (code {code}): {reason}")]
    StreamClosed { code: u16, reason: String },
}

impl Error {
    /// HTTP status code carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// `true` if no response was received at all.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::StreamConnect(_) | Self::Tls(_))
    }

    /// `true` if the request exceeded its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout { timeout_ms: 0 }
        } else if let Some(status) = err.status() {
            Self::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            Self::Protocol {
                message: err.to_string(),
                body: String::new(),
            }
        } else {
            Self::Network(err.to_string())
        }
    }
}
