//! Feature availability classification.
//!
//! The backend deploys API surfaces piecemeal: an endpoint that returns
//! 404 or 503 is not a flaky endpoint, it is a feature this firmware
//! build does not serve. Conflating the two turns a quiet "unavailable"
//! badge into an endless retry storm, so the distinction is made here,
//! once, and every retry decision in the workspace consumes the verdict.

use crate::error::Error;

/// Retry-eligibility verdict for a single failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Worth retrying with backoff (5xx, timeout, network failure).
    Transient,
    /// The feature is not deployed or not currently served here
    /// (404 / 503). Stop asking until a manual reconnect.
    Unavailable,
    /// Will not succeed on retry (other 4xx, validation, protocol).
    /// Surface to the caller immediately.
    Fatal,
}

/// Classify a failure. Pure function; the verdict for a source is made
/// sticky by the transport manager, not here.
pub fn classify(error: &Error) -> Verdict {
    match error {
        Error::Http { status: 404 | 503, .. } => Verdict::Unavailable,
        Error::Http { status: 400..=499, .. } => Verdict::Fatal,
        Error::Http { .. } => Verdict::Transient,
        Error::Validation { .. } | Error::Protocol { .. } | Error::InvalidUrl(_) => Verdict::Fatal,
        Error::Timeout { .. }
        | Error::Network(_)
        | Error::Tls(_)
        | Error::StreamConnect(_)
        | Error::StreamClosed { .. } => Verdict::Transient,
    }
}
