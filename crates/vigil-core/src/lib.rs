//! Realtime synchronization and resilience layer for the dashboard.
//!
//! This crate owns everything between the wire ([`vigil_api`]) and the
//! UI shell:
//!
//! - [`source`]: the transport manager -- one task per logical data
//!   source, failing over between streaming and polling and publishing
//!   phase, snapshot, and projection state through `watch` channels.
//! - [`backoff`]: the reconnection controller (exponential backoff,
//!   bounded retry budget).
//! - [`projection`]: the entity fold over the ordered event stream.
//! - [`queue`]: the durable offline operation queue with ordered replay.
//!
//! Nothing here renders anything; consumers subscribe through
//! [`stream::SnapshotStream`] and draw what they see.

pub mod backoff;
pub mod config;
pub mod error;
pub mod projection;
pub mod queue;
pub mod source;
pub mod stream;

pub use backoff::{ReconnectController, RetryDecision, RetryPolicy};
pub use config::{QueueConfig, SourceConfig};
pub use error::CoreError;
pub use projection::{EntityRecord, Projection, ProjectionSnapshot};
pub use queue::{
    HttpExecutor, JsonFileStore, MemoryStore, OfflineQueue, OpStatus, OperationExecutor,
    QueueStore, QueuedOperation, ReplaySummary, SubmitOutcome,
};
pub use source::{HttpSourceClient, Source, SourceClient, SourcePhase, TransportKind};
pub use stream::SnapshotStream;
