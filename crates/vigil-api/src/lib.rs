//! Wire layer for the vigil dashboard core.
//!
//! This crate owns everything that touches the network and the
//! taxonomy used to reason about its failures:
//!
//! - **[`DashboardClient`]** — HTTP polling and mutation dispatch
//!   (`fetch_snapshot` / `execute`).
//! - **[`websocket`]** — the streaming transport, exposed as a
//!   `Stream` of parsed [`Envelope`]s.
//! - **[`Envelope`] / [`StreamEvent`]** — the versioned event
//!   envelope with a closed tag enumeration and explicit unknown
//!   fallback.
//! - **[`Error`]** — the failure taxonomy (network, timeout,
//!   protocol, HTTP status, validation).
//! - **[`classify`]** — the feature-availability classifier: the
//!   single place a failure becomes a retry decision.
//!
//! Reconnection, backoff, projections, and the offline queue live in
//! `vigil-core`; this crate never retries anything on its own.

pub mod availability;
pub mod client;
pub mod envelope;
pub mod error;
pub mod transport;
pub mod websocket;

pub use availability::{Verdict, classify};
pub use client::DashboardClient;
pub use envelope::{Envelope, EventKind, StreamEvent};
pub use error::Error;
pub use transport::{TlsMode, TransportConfig};
pub use websocket::EnvelopeStream;
