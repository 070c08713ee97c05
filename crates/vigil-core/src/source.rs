//! Transport manager: one logical data source, two transports.
//!
//! A [`Source`] wraps a background task that keeps exactly one
//! transport active at a time -- the streaming connection when it is
//! healthy, the timed poll otherwise -- and folds whatever arrives
//! into shared state published through `watch` channels:
//!
//! - the connection [`SourcePhase`],
//! - the last-known status snapshot (merged from stream
//!   `session.status` events, replaced wholesale by polls),
//! - the entity [`ProjectionSnapshot`] folded from entity events.
//!
//! A transport switch tears the losing transport down before the
//! winning one can deliver an event, and never clears the shared
//! state: stale-but-present beats briefly-empty on a dashboard.
//!
//! Failures go through the availability classifier exactly once.
//! `Transient` takes the backoff path, `Fatal` parks in `Failed`, and
//! `Unavailable` parks in `Unavailable` -- sticky, with polling
//! disabled too, until a manual `reconnect()`.

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use vigil_api::{Envelope, EnvelopeStream, StreamEvent, Verdict, classify};

use crate::backoff::{ReconnectController, RetryDecision};
use crate::config::SourceConfig;
use crate::projection::{
    EntityRecord, Projection, ProjectionSnapshot, merge_shallow,
};
use crate::stream::SnapshotStream;

const ERROR_CHANNEL_CAPACITY: usize = 64;

// ── Observable state ─────────────────────────────────────────────────

/// Connection phase of a source, observable by consumers.
///
/// The UI derives its five display modes from this plus snapshot
/// emptiness: loading (`Connecting`), connected-with-data /
/// connected-but-empty (`Connected`), transient-error-with-retry
/// (`Reconnecting` / `Failed`), and unavailable-silent (`Unavailable`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourcePhase {
    Disconnected,
    Connecting,
    Connected { transport: TransportKind },
    Reconnecting { attempt: u32 },
    /// Feature not deployed on this backend. Sticky until manual
    /// reconnect; never rendered as an alarming error.
    Unavailable,
    /// Fatal failure or retry budget exhausted.
    Failed,
}

/// Which transport currently backs the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Streaming,
    Polling,
}

// ── Transport seam ───────────────────────────────────────────────────

/// Concrete transports behind the source task.
///
/// Abstracted so the whole reconnection state machine runs against
/// synthetic transports in tests -- no socket, no mock server.
pub trait SourceClient: Send + Sync + 'static {
    /// Open the streaming connection. Resolves once the handshake
    /// completes so the caller can race it against a timeout.
    fn open_stream(
        &self,
        url: &Url,
    ) -> BoxFuture<'static, Result<EnvelopeStream, vigil_api::Error>>;

    /// Fetch one complete snapshot from the polling endpoint.
    fn poll_snapshot(&self, url: &Url) -> BoxFuture<'static, Result<Value, vigil_api::Error>>;
}

/// Production [`SourceClient`] backed by the wire layer.
pub struct HttpSourceClient {
    client: vigil_api::DashboardClient,
}

impl HttpSourceClient {
    pub fn new(client: vigil_api::DashboardClient) -> Self {
        Self { client }
    }
}

impl SourceClient for HttpSourceClient {
    fn open_stream(
        &self,
        url: &Url,
    ) -> BoxFuture<'static, Result<EnvelopeStream, vigil_api::Error>> {
        let url = url.clone();
        Box::pin(async move { vigil_api::websocket::connect(&url).await })
    }

    fn poll_snapshot(&self, url: &Url) -> BoxFuture<'static, Result<Value, vigil_api::Error>> {
        let client = self.client.clone();
        let url = url.clone();
        Box::pin(async move { client.fetch_snapshot(&url).await })
    }
}

// ── Commands ─────────────────────────────────────────────────────────

enum SourceCommand {
    UseStreaming,
    UsePolling,
    Reconnect,
    SetEnabled(bool),
    SetEndpoints { stream_url: Url, poll_url: Url },
    ReplaceAll(Vec<EntityRecord>),
}

// ── Handle ───────────────────────────────────────────────────────────

/// Handle to a running source. Read via snapshot + subscribe; mutate
/// only through commands -- the background task is the single writer.
pub struct Source {
    cmd_tx: mpsc::UnboundedSender<SourceCommand>,
    phase_rx: watch::Receiver<SourcePhase>,
    snapshot_rx: watch::Receiver<Arc<Value>>,
    projection_rx: watch::Receiver<Arc<ProjectionSnapshot>>,
    last_error_rx: watch::Receiver<Option<String>>,
    online_rx: watch::Receiver<bool>,
    error_tx: broadcast::Sender<String>,
    cancel: CancellationToken,
}

impl Source {
    /// Spawn the source task. The first connection attempt happens
    /// asynchronously -- subscribe to the phase to observe it.
    pub fn spawn(config: SourceConfig, client: Arc<dyn SourceClient>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(SourcePhase::Disconnected);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(Value::Null));
        let (projection_tx, projection_rx) =
            watch::channel(Arc::new(ProjectionSnapshot::default()));
        let (last_error_tx, last_error_rx) = watch::channel(None);
        let (online_tx, online_rx) = watch::channel(false);
        let (error_tx, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let task = SourceTask {
            client,
            stream_url: config.stream_url.clone(),
            poll_url: config.poll_url.clone(),
            preferred: if config.prefer_streaming {
                TransportKind::Streaming
            } else {
                TransportKind::Polling
            },
            enabled: true,
            ctrl: ReconnectController::new(config.retry.clone()),
            config,
            projection: Projection::new(),
            phase_tx,
            snapshot_tx,
            projection_tx,
            last_error_tx,
            online_tx,
            error_tx: error_tx.clone(),
            cmd_rx,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        Self {
            cmd_tx,
            phase_rx,
            snapshot_rx,
            projection_rx,
            last_error_rx,
            online_rx,
            error_tx,
            cancel,
        }
    }

    // ── State observation ────────────────────────────────────────

    pub fn phase(&self) -> SourcePhase {
        self.phase_rx.borrow().clone()
    }

    pub fn subscribe_phase(&self) -> SnapshotStream<SourcePhase> {
        SnapshotStream::new(self.phase_rx.clone())
    }

    /// Last-known status snapshot. Preserved across transport
    /// switches and disconnects.
    pub fn snapshot(&self) -> Arc<Value> {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe_snapshot(&self) -> SnapshotStream<Arc<Value>> {
        SnapshotStream::new(self.snapshot_rx.clone())
    }

    pub fn projection(&self) -> Arc<ProjectionSnapshot> {
        self.projection_rx.borrow().clone()
    }

    pub fn subscribe_projection(&self) -> SnapshotStream<Arc<ProjectionSnapshot>> {
        SnapshotStream::new(self.projection_rx.clone())
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error_rx.borrow().clone()
    }

    /// Backend-reported `error` stream events, forwarded verbatim.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.error_tx.subscribe()
    }

    /// `true` while a transport is connected. Feeds the offline
    /// queue's online-dispatch shortcut.
    pub fn online(&self) -> watch::Receiver<bool> {
        self.online_rx.clone()
    }

    // ── Commands ─────────────────────────────────────────────────

    pub fn use_streaming(&self) {
        let _ = self.cmd_tx.send(SourceCommand::UseStreaming);
    }

    pub fn use_polling(&self) {
        let _ = self.cmd_tx.send(SourceCommand::UsePolling);
    }

    /// Manual reconnect: resets the retry budget and re-enters
    /// `Connecting` immediately, regardless of how the prior cycle
    /// ended. The only way out of `Unavailable`.
    pub fn reconnect(&self) {
        let _ = self.cmd_tx.send(SourceCommand::Reconnect);
    }

    pub fn set_enabled(&self, enabled: bool) {
        let _ = self.cmd_tx.send(SourceCommand::SetEnabled(enabled));
    }

    /// Point the source at new endpoints. Cancels any pending retry
    /// timer and connects to the new target immediately.
    pub fn set_endpoints(&self, stream_url: Url, poll_url: Url) {
        let _ = self
            .cmd_tx
            .send(SourceCommand::SetEndpoints { stream_url, poll_url });
    }

    /// Overwrite the projection, for hydrating initial state from a
    /// non-streaming fetch before the stream attaches.
    pub fn replace_all(&self, entities: Vec<EntityRecord>) {
        let _ = self.cmd_tx.send(SourceCommand::ReplaceAll(entities));
    }

    /// Tear down the source task, cancelling pending timers and
    /// closing any open connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// ── Task ─────────────────────────────────────────────────────────────

/// Why the active transport stopped.
enum Exit {
    Cancelled,
    /// Preference, endpoint, or enablement changed -- re-enter the
    /// outer loop with the current settings.
    Restart,
    /// Streaming handshake exceeded the connection timeout.
    FallBack,
    Failure(vigil_api::Error),
}

enum Flow {
    Continue,
    Stop,
}

struct SourceTask {
    client: Arc<dyn SourceClient>,
    config: SourceConfig,
    stream_url: Url,
    poll_url: Url,
    preferred: TransportKind,
    enabled: bool,
    ctrl: ReconnectController,
    projection: Projection,
    phase_tx: watch::Sender<SourcePhase>,
    snapshot_tx: watch::Sender<Arc<Value>>,
    projection_tx: watch::Sender<Arc<ProjectionSnapshot>>,
    last_error_tx: watch::Sender<Option<String>>,
    online_tx: watch::Sender<bool>,
    error_tx: broadcast::Sender<String>,
    cmd_rx: mpsc::UnboundedReceiver<SourceCommand>,
    cancel: CancellationToken,
}

impl SourceTask {
    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if !self.enabled {
                self.set_phase(SourcePhase::Disconnected);
                match self.wait_for_manual().await {
                    Flow::Stop => break,
                    Flow::Continue => continue,
                }
            }

            let exit = match self.preferred {
                TransportKind::Streaming => self.run_streaming().await,
                TransportKind::Polling => self.run_polling().await,
            };

            match exit {
                Exit::Cancelled => break,
                Exit::Restart => {}
                Exit::FallBack => {
                    warn!("streaming handshake timed out, falling back to polling");
                    self.preferred = TransportKind::Polling;
                }
                Exit::Failure(err) => match self.handle_failure(err).await {
                    Flow::Stop => break,
                    Flow::Continue => {}
                },
            }
        }

        self.set_phase(SourcePhase::Disconnected);
        debug!("source task exiting");
    }

    // ── Streaming transport ──────────────────────────────────────

    async fn run_streaming(&mut self) -> Exit {
        self.set_attempt_phase();

        let open = self.client.open_stream(&self.stream_url);
        let mut stream = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Exit::Cancelled,
            cmd = self.cmd_rx.recv() => {
                // The pending handshake is dropped either way; a
                // restart re-attempts with the updated settings.
                return match cmd {
                    None => Exit::Cancelled,
                    Some(cmd) => { self.apply_command(cmd); Exit::Restart }
                };
            }
            result = tokio::time::timeout(self.config.connection_timeout, open) => {
                match result {
                    Err(_) => return Exit::FallBack,
                    Ok(Err(e)) => return Exit::Failure(e),
                    Ok(Ok(stream)) => stream,
                }
            }
        };

        self.on_transport_up(TransportKind::Streaming);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Exit::Cancelled,
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return Exit::Cancelled };
                    if self.apply_command(cmd) {
                        // Dropping `stream` here closes the connection
                        // before the next transport can deliver anything.
                        return Exit::Restart;
                    }
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(envelope)) => self.dispatch(&envelope),
                        Some(Err(e)) => return Exit::Failure(e),
                        None => {
                            // Clean disconnect: reconnect immediately
                            // with a fresh failure budget.
                            info!("stream disconnected cleanly, reconnecting");
                            self.ctrl.reset();
                            return Exit::Restart;
                        }
                    }
                }
            }
        }
    }

    // ── Polling transport ────────────────────────────────────────

    async fn run_polling(&mut self) -> Exit {
        self.set_attempt_phase();

        loop {
            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Exit::Cancelled,
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return Exit::Cancelled };
                    if self.apply_command(cmd) {
                        return Exit::Restart;
                    }
                    continue;
                }
                result = self.client.poll_snapshot(&self.poll_url) => result,
            };

            match result {
                Ok(snapshot) => {
                    self.on_transport_up(TransportKind::Polling);
                    // Every successful poll is authoritative:
                    // wholesale replacement, by design.
                    let _ = self.snapshot_tx.send(Arc::new(snapshot));
                }
                Err(e) => return Exit::Failure(e),
            }

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Exit::Cancelled,
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return Exit::Cancelled };
                    if self.apply_command(cmd) {
                        return Exit::Restart;
                    }
                }
                () = tokio::time::sleep(self.config.polling_interval) => {}
            }
        }
    }

    // ── Failure handling ─────────────────────────────────────────

    /// Classify once; the verdict is the sole retry-eligibility input.
    async fn handle_failure(&mut self, err: vigil_api::Error) -> Flow {
        let verdict = classify(&err);
        let _ = self.last_error_tx.send(Some(err.to_string()));

        match verdict {
            Verdict::Unavailable => {
                info!(error = %err, "source unavailable on this backend, going quiet");
                self.set_phase(SourcePhase::Unavailable);
                self.wait_for_manual().await
            }
            Verdict::Fatal => {
                warn!(error = %err, "fatal source failure, not retrying");
                self.set_phase(SourcePhase::Failed);
                self.wait_for_manual().await
            }
            Verdict::Transient => match self.ctrl.on_failure() {
                RetryDecision::GiveUp => {
                    warn!(
                        error = %err,
                        max_retries = self.ctrl.policy().max_retries,
                        "retry budget exhausted, giving up"
                    );
                    self.set_phase(SourcePhase::Failed);
                    self.wait_for_manual().await
                }
                RetryDecision::RetryAfter(delay) => {
                    let attempt = self.ctrl.failures();
                    info!(
                        error = %err,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "waiting before reconnect"
                    );
                    self.set_phase(SourcePhase::Reconnecting { attempt });

                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => Flow::Stop,
                        cmd = self.cmd_rx.recv() => {
                            // A command cancels the pending retry
                            // timer; the outer loop acts on the new
                            // settings immediately. No stale retry
                            // against an old endpoint can fire after
                            // this point.
                            match cmd {
                                None => Flow::Stop,
                                Some(cmd) => {
                                    self.apply_command(cmd);
                                    Flow::Continue
                                }
                            }
                        }
                        () = tokio::time::sleep(delay) => Flow::Continue,
                    }
                }
            },
        }
    }

    /// Park until a manual action. Used for `Unavailable`, `Failed`,
    /// and disabled sources: no automatic attempt -- streaming or
    /// polling -- leaves this state.
    async fn wait_for_manual(&mut self) -> Flow {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Flow::Stop,
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return Flow::Stop };
                    match cmd {
                        SourceCommand::Reconnect => {
                            self.ctrl.reset();
                            self.enabled = true;
                            return Flow::Continue;
                        }
                        SourceCommand::SetEndpoints { stream_url, poll_url } => {
                            self.stream_url = stream_url;
                            self.poll_url = poll_url;
                            return Flow::Continue;
                        }
                        SourceCommand::SetEnabled(enabled) => {
                            if self.enabled != enabled {
                                self.enabled = enabled;
                                if !enabled {
                                    self.set_phase(SourcePhase::Disconnected);
                                }
                                return Flow::Continue;
                            }
                        }
                        // Preference changes are remembered but do not
                        // resume a parked source.
                        SourceCommand::UseStreaming => {
                            self.preferred = TransportKind::Streaming;
                        }
                        SourceCommand::UsePolling => {
                            self.preferred = TransportKind::Polling;
                        }
                        SourceCommand::ReplaceAll(entities) => {
                            self.projection.replace_all(entities);
                            self.publish_projection();
                        }
                    }
                }
            }
        }
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Apply a command to the task state. Returns `true` when the
    /// active transport must be torn down and restarted.
    fn apply_command(&mut self, cmd: SourceCommand) -> bool {
        match cmd {
            SourceCommand::UseStreaming => {
                if self.preferred == TransportKind::Streaming {
                    return false;
                }
                self.preferred = TransportKind::Streaming;
                true
            }
            SourceCommand::UsePolling => {
                if self.preferred == TransportKind::Polling {
                    return false;
                }
                self.preferred = TransportKind::Polling;
                true
            }
            SourceCommand::Reconnect => {
                self.ctrl.reset();
                self.enabled = true;
                true
            }
            SourceCommand::SetEnabled(enabled) => {
                if self.enabled == enabled {
                    return false;
                }
                self.enabled = enabled;
                true
            }
            SourceCommand::SetEndpoints { stream_url, poll_url } => {
                self.stream_url = stream_url;
                self.poll_url = poll_url;
                true
            }
            SourceCommand::ReplaceAll(entities) => {
                self.projection.replace_all(entities);
                self.publish_projection();
                false
            }
        }
    }

    // ── Event dispatch ───────────────────────────────────────────

    fn dispatch(&mut self, envelope: &Envelope) {
        let Some(event) = envelope.event() else {
            warn!(tag = %envelope.tag, "entity event without business key dropped");
            return;
        };

        match event {
            StreamEvent::Established => {
                info!(session_id = ?envelope.session_id, "stream session established");
            }
            StreamEvent::Heartbeat => {}
            StreamEvent::SessionStatus { payload } => {
                // Partial status update: merge shallowly, one
                // top-level section at a time.
                self.snapshot_tx.send_modify(|snap| {
                    let mut merged = (**snap).clone();
                    merge_shallow(&mut merged, &payload);
                    *snap = Arc::new(merged);
                });
            }
            StreamEvent::Error { message } => {
                warn!(message = %message, "backend error event");
                let _ = self.error_tx.send(message);
            }
            StreamEvent::Unknown { tag } => {
                warn!(tag = %tag, "unknown stream event type ignored");
            }
            entity @ (StreamEvent::Discovered { .. } | StreamEvent::StateChanged { .. }) => {
                if self.projection.apply(&entity) {
                    self.publish_projection();
                }
            }
        }
    }

    // ── State publication ────────────────────────────────────────

    fn set_phase(&self, phase: SourcePhase) {
        let online = matches!(phase, SourcePhase::Connected { .. });
        let _ = self.online_tx.send(online);
        let _ = self.phase_tx.send(phase);
    }

    /// `Connecting` on a fresh cycle, `Reconnecting` mid-backoff.
    fn set_attempt_phase(&self) {
        if self.ctrl.failures() == 0 {
            self.set_phase(SourcePhase::Connecting);
        } else {
            self.set_phase(SourcePhase::Reconnecting {
                attempt: self.ctrl.failures(),
            });
        }
    }

    fn on_transport_up(&mut self, transport: TransportKind) {
        self.ctrl.on_connected();
        let _ = self.last_error_tx.send(None);
        self.set_phase(SourcePhase::Connected { transport });
    }

    fn publish_projection(&self) {
        let _ = self.projection_tx.send(Arc::new(self.projection.snapshot()));
    }
}
