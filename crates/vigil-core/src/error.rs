// ── Core error types ──
//
// User-facing errors from vigil-core. Consumers never see raw HTTP
// status codes or JSON parse failures directly -- the
// `From<vigil_api::Error>` impl translates wire-layer errors into
// domain-appropriate variants.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot reach backend: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Source is disconnected")]
    SourceDisconnected,

    #[error("Connection timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Feature not available on this backend: {feature}")]
    FeatureUnavailable { feature: String },

    // ── Operation errors ─────────────────────────────────────────────
    #[error("Operation rejected by backend: {message}")]
    Rejected { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    // ── Queue errors ─────────────────────────────────────────────────
    #[error("Queued operation not found: {id}")]
    OperationNotFound { id: uuid::Uuid },

    #[error("Queue storage error: {message}")]
    Storage { message: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Conversion from wire-layer errors ────────────────────────────────

impl From<vigil_api::Error> for CoreError {
    fn from(err: vigil_api::Error) -> Self {
        match err {
            vigil_api::Error::Network(reason)
            | vigil_api::Error::Tls(reason)
            | vigil_api::Error::StreamConnect(reason) => CoreError::ConnectionFailed { reason },
            vigil_api::Error::Timeout { timeout_ms } => CoreError::Timeout { timeout_ms },
            vigil_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("invalid URL: {e}"),
            },
            vigil_api::Error::Http { status: 404 | 503, message } => {
                CoreError::FeatureUnavailable { feature: message }
            }
            vigil_api::Error::Http { status, message } => CoreError::Rejected {
                message: format!("HTTP {status}: {message}"),
            },
            vigil_api::Error::Validation { message } => CoreError::ValidationFailed { message },
            vigil_api::Error::Protocol { message, body: _ } => {
                CoreError::Internal(format!("protocol error: {message}"))
            }
            vigil_api::Error::StreamClosed { code, reason } => CoreError::ConnectionFailed {
                reason: format!("stream closed (code {code}): {reason}"),
            },
        }
    }
}
