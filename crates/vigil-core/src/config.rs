// ── Runtime source configuration ──
//
// These types describe *how* a logical source connects and retries.
// They never touch disk -- the dashboard shell builds them (usually
// through vigil-config) and hands them in.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::backoff::RetryPolicy;

/// Configuration for one logical data source.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Streaming endpoint (ws:// or wss://).
    pub stream_url: Url,
    /// Polling endpoint returning a complete snapshot.
    pub poll_url: Url,
    /// Prefer the streaming transport when both are viable.
    pub prefer_streaming: bool,
    /// If a streaming attempt does not reach connected within this
    /// window, fall back to polling.
    pub connection_timeout: Duration,
    /// Interval between polls on the polling transport.
    pub polling_interval: Duration,
    /// Backoff policy for reconnection.
    pub retry: RetryPolicy,
}

impl SourceConfig {
    pub fn new(stream_url: Url, poll_url: Url) -> Self {
        Self {
            stream_url,
            poll_url,
            prefer_streaming: true,
            connection_timeout: Duration::from_secs(3),
            polling_interval: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Configuration for the offline operation queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Path of the durable queue file.
    pub path: PathBuf,
    /// How long synced entries are retained for the audit window
    /// before `cleanup` removes them.
    pub retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("vigil-queue.json"),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}
