#![allow(clippy::unwrap_used)]
// Transport-manager state machine tests against scripted transports.
// Time is paused: backoff and timeout waits auto-advance, so scenarios
// spanning minutes of wall time run instantly and deterministically.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use url::Url;

use vigil_api::{Envelope, EnvelopeStream};
use vigil_core::{RetryPolicy, Source, SourceClient, SourceConfig, SourcePhase, TransportKind};

// ── Scripted transport ───────────────────────────────────────────────

enum StreamScript {
    /// Handshake fails with this error.
    Fail(vigil_api::Error),
    /// Handshake never resolves (exercises the connection timeout).
    Hang,
    /// Handshake succeeds; the stream yields these frames and then
    /// stays open.
    Events(Vec<Result<Envelope, vigil_api::Error>>),
}

#[derive(Default)]
struct ScriptedClient {
    streams: Mutex<VecDeque<StreamScript>>,
    polls: Mutex<VecDeque<Result<Value, vigil_api::Error>>>,
    stream_attempts: AtomicUsize,
    poll_attempts: AtomicUsize,
}

impl ScriptedClient {
    fn new(
        streams: Vec<StreamScript>,
        polls: Vec<Result<Value, vigil_api::Error>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(streams.into()),
            polls: Mutex::new(polls.into()),
            ..Self::default()
        })
    }

    fn stream_attempts(&self) -> usize {
        self.stream_attempts.load(Ordering::SeqCst)
    }

    fn poll_attempts(&self) -> usize {
        self.poll_attempts.load(Ordering::SeqCst)
    }
}

impl SourceClient for ScriptedClient {
    fn open_stream(
        &self,
        _url: &Url,
    ) -> BoxFuture<'static, Result<EnvelopeStream, vigil_api::Error>> {
        self.stream_attempts.fetch_add(1, Ordering::SeqCst);
        let script = self.streams.lock().unwrap().pop_front();
        Box::pin(async move {
            match script {
                None | Some(StreamScript::Hang) => {
                    futures_util::future::pending::<Result<EnvelopeStream, vigil_api::Error>>()
                        .await
                }
                Some(StreamScript::Fail(err)) => Err(err),
                Some(StreamScript::Events(frames)) => Ok(futures_util::stream::iter(frames)
                    .chain(futures_util::stream::pending())
                    .boxed()),
            }
        })
    }

    fn poll_snapshot(&self, _url: &Url) -> BoxFuture<'static, Result<Value, vigil_api::Error>> {
        self.poll_attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self.polls.lock().unwrap().pop_front();
        Box::pin(async move {
            match outcome {
                None => {
                    futures_util::future::pending::<Result<Value, vigil_api::Error>>().await
                }
                Some(result) => result,
            }
        })
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn config() -> SourceConfig {
    let mut cfg = SourceConfig::new(
        Url::parse("wss://backend.local/stream").unwrap(),
        Url::parse("https://backend.local/status").unwrap(),
    );
    cfg.retry = RetryPolicy {
        base_delay: Duration::from_millis(1000),
        max_delay: Duration::from_millis(30_000),
        max_retries: 5,
    };
    cfg
}

fn envelope(tag: &str, payload: Value) -> Envelope {
    Envelope {
        version: "1.0".into(),
        tag: tag.into(),
        timestamp: Utc::now(),
        session_id: Some("sess-1".into()),
        payload,
    }
}

fn network_error() -> vigil_api::Error {
    vigil_api::Error::Network("connection refused".into())
}

async fn wait_phase(source: &Source, pred: impl Fn(&SourcePhase) -> bool) -> SourcePhase {
    let mut sub = source.subscribe_phase();
    if pred(sub.current()) {
        return sub.current().clone();
    }
    tokio::time::timeout(Duration::from_secs(300), async {
        loop {
            let phase = sub.changed().await.expect("source task ended");
            if pred(&phase) {
                return phase;
            }
        }
    })
    .await
    .expect("expected phase never reached")
}

async fn wait_snapshot(source: &Source, pred: impl Fn(&Value) -> bool) -> Arc<Value> {
    let mut sub = source.subscribe_snapshot();
    if pred(sub.current()) {
        return sub.current().clone();
    }
    tokio::time::timeout(Duration::from_secs(300), async {
        loop {
            let snap = sub.changed().await.expect("source task ended");
            if pred(&snap) {
                return snap;
            }
        }
    })
    .await
    .expect("expected snapshot never observed")
}

// ── Tests ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn streaming_timeout_falls_back_to_polling() {
    let body = json!({ "health": { "cpu_usage": 12 } });
    let client = ScriptedClient::new(vec![StreamScript::Hang], vec![Ok(body.clone())]);
    let source = Source::spawn(config(), client.clone());

    let phase = wait_phase(&source, |p| matches!(p, SourcePhase::Connected { .. })).await;
    assert_eq!(
        phase,
        SourcePhase::Connected {
            transport: TransportKind::Polling
        }
    );
    assert_eq!(client.stream_attempts(), 1);
    assert_eq!(client.poll_attempts(), 1);

    let snap = wait_snapshot(&source, |s| s.get("health").is_some()).await;
    assert_eq!(*snap, body);
    assert!(*source.online().borrow());

    source.shutdown();
}

#[tokio::test(start_paused = true)]
async fn snapshot_survives_transient_disconnect() {
    let status = envelope("session.status", json!({ "health": { "cpu_usage": 41 } }));
    let client = ScriptedClient::new(
        vec![StreamScript::Events(vec![Ok(status), Err(network_error())])],
        vec![],
    );
    let source = Source::spawn(config(), client);

    wait_phase(&source, |p| matches!(p, SourcePhase::Reconnecting { attempt: 1 })).await;

    // Last-known data is held through the outage, not cleared.
    assert_eq!(source.snapshot()["health"]["cpu_usage"], 41);
    assert_eq!(
        source.last_error().as_deref(),
        Some("Network error: connection refused")
    );

    source.shutdown();
}

#[tokio::test(start_paused = true)]
async fn entity_events_fold_into_projection() {
    let client = ScriptedClient::new(
        vec![StreamScript::Events(vec![
            Ok(envelope("connection.established", json!({}))),
            Ok(envelope(
                "device.discovered",
                json!({ "mac": "aa:bb", "state": "provisioning", "model": "cam-1" }),
            )),
            Ok(envelope("connection.heartbeat", json!({}))),
            Ok(envelope(
                "device.state_changed",
                json!({ "mac": "aa:bb", "previous_state": "provisioning", "state": "online" }),
            )),
            // No business key: dropped, never a placeholder entity.
            Ok(envelope("device.state_changed", json!({ "state": "error" }))),
        ])],
        vec![],
    );
    let source = Source::spawn(config(), client);

    let mut sub = source.subscribe_projection();
    let snap = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let snap = sub.latest();
            if snap.counts.get("online") == Some(&1) {
                return snap;
            }
            sub.changed().await.expect("source task ended");
        }
    })
    .await
    .expect("projection never converged");

    assert_eq!(snap.entities.len(), 1);
    assert_eq!(snap.entities[0].key, "aa:bb");
    assert_eq!(snap.entities[0].state, "online");
    assert_eq!(snap.entities[0].fields["model"], "cam-1");
    assert!(snap.counts.get("provisioning").is_none());

    source.shutdown();
}

#[tokio::test(start_paused = true)]
async fn retry_budget_exhaustion_parks_the_source() {
    let mut cfg = config();
    cfg.retry.max_retries = 2;
    let client = ScriptedClient::new(
        vec![
            StreamScript::Fail(network_error()),
            StreamScript::Fail(network_error()),
            StreamScript::Fail(network_error()),
        ],
        vec![],
    );
    let source = Source::spawn(cfg, client.clone());

    wait_phase(&source, |p| *p == SourcePhase::Failed).await;
    assert_eq!(client.stream_attempts(), 3);

    // No automatic attempts after giving up, no matter how long.
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(client.stream_attempts(), 3);
    assert_eq!(client.poll_attempts(), 0);

    // Manual reconnect restores the budget and tries again.
    source.reconnect();
    wait_phase(&source, |p| *p != SourcePhase::Failed).await;
    tokio::time::timeout(Duration::from_secs(60), async {
        while client.stream_attempts() < 4 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("reconnect did not produce a new attempt");

    source.shutdown();
}

#[tokio::test(start_paused = true)]
async fn unavailability_is_sticky_until_manual_reconnect() {
    let client = ScriptedClient::new(
        vec![
            StreamScript::Fail(vigil_api::Error::Http {
                status: 503,
                message: "stream endpoint not deployed".into(),
            }),
            StreamScript::Events(vec![Ok(envelope("connection.established", json!({})))]),
        ],
        vec![],
    );
    let source = Source::spawn(config(), client.clone());

    wait_phase(&source, |p| *p == SourcePhase::Unavailable).await;

    // Sticky: neither transport is scheduled while unavailable.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(client.stream_attempts(), 1);
    assert_eq!(client.poll_attempts(), 0);
    assert_eq!(source.phase(), SourcePhase::Unavailable);

    source.reconnect();
    let phase = wait_phase(&source, |p| matches!(p, SourcePhase::Connected { .. })).await;
    assert_eq!(
        phase,
        SourcePhase::Connected {
            transport: TransportKind::Streaming
        }
    );

    source.shutdown();
}

#[tokio::test(start_paused = true)]
async fn manual_transport_switch_replaces_snapshot_wholesale() {
    let status = envelope(
        "session.status",
        json!({ "health": { "cpu_usage": 41 }, "uplink": { "latency_ms": 9 } }),
    );
    let poll_body = json!({ "health": { "cpu_usage": 44 } });
    let client = ScriptedClient::new(
        vec![StreamScript::Events(vec![Ok(status)])],
        vec![Ok(poll_body.clone())],
    );
    let source = Source::spawn(config(), client.clone());

    wait_snapshot(&source, |s| s["health"]["cpu_usage"] == 41).await;

    source.use_polling();
    wait_phase(&source, |p| {
        *p == SourcePhase::Connected {
            transport: TransportKind::Polling,
        }
    })
    .await;

    // The poll result is authoritative: merged stream sections are gone.
    let snap = wait_snapshot(&source, |s| s["health"]["cpu_usage"] == 44).await;
    assert_eq!(*snap, poll_body);
    assert_eq!(client.poll_attempts(), 1);

    source.shutdown();
}

#[tokio::test(start_paused = true)]
async fn endpoint_change_cancels_pending_retry() {
    let client = ScriptedClient::new(
        vec![
            StreamScript::Fail(network_error()),
            StreamScript::Events(vec![Ok(envelope("connection.established", json!({})))]),
        ],
        vec![],
    );
    let mut cfg = config();
    // Long enough that only an immediate reconnect can beat it.
    cfg.retry.base_delay = Duration::from_secs(600);
    cfg.retry.max_delay = Duration::from_secs(600);
    let source = Source::spawn(cfg, client);

    wait_phase(&source, |p| matches!(p, SourcePhase::Reconnecting { .. })).await;

    let before = tokio::time::Instant::now();
    source.set_endpoints(
        Url::parse("wss://standby.local/stream").unwrap(),
        Url::parse("https://standby.local/status").unwrap(),
    );
    wait_phase(&source, |p| matches!(p, SourcePhase::Connected { .. })).await;

    // The new attempt fired without waiting out the old backoff timer.
    assert!(before.elapsed() < Duration::from_secs(600));

    source.shutdown();
}

#[tokio::test(start_paused = true)]
async fn disabling_tears_down_and_holds_disconnected() {
    let client = ScriptedClient::new(
        vec![StreamScript::Events(vec![Ok(envelope(
            "connection.established",
            json!({}),
        ))])],
        vec![],
    );
    let source = Source::spawn(config(), client.clone());

    wait_phase(&source, |p| matches!(p, SourcePhase::Connected { .. })).await;

    source.set_enabled(false);
    wait_phase(&source, |p| *p == SourcePhase::Disconnected).await;
    assert!(!*source.online().borrow());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(client.stream_attempts(), 1);
    assert_eq!(client.poll_attempts(), 0);

    source.shutdown();
}
