//! WebSocket event stream transport.
//!
//! Opens the backend's streaming endpoint and exposes it as a
//! [`Stream`] of parsed [`Envelope`]s. Reconnection is NOT handled
//! here — the stream ends (cleanly or with an error) and the
//! transport manager in `vigil-core` decides what happens next, so
//! the backoff state machine stays testable without a socket.
//!
//! Per-frame decode failures are logged and skipped: one malformed
//! envelope from a version-skewed backend must not tear down the
//! connection.

use async_stream::stream;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use tokio_tungstenite::tungstenite;
use url::Url;

use crate::envelope::Envelope;
use crate::error::Error;

/// Boxed stream of parsed envelopes. Ends on clean disconnect;
/// yields a final `Err` on connection failure.
pub type EnvelopeStream = BoxStream<'static, Result<Envelope, Error>>;

/// Open the streaming connection and return the envelope stream.
///
/// The returned future resolves once the WebSocket handshake
/// completes, so callers can race it against a connection timeout.
pub async fn connect(url: &Url) -> Result<EnvelopeStream, Error> {
    tracing::info!(url = %url, "connecting to event stream");

    let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| Error::StreamConnect(e.to_string()))?;

    tracing::info!("event stream connected");

    let (_write, mut read) = ws_stream.split();

    let envelopes = stream! {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(tungstenite::Message::Text(text)) => {
                    if let Some(envelope) = parse_envelope(&text) {
                        yield Ok(envelope);
                    }
                }
                Ok(tungstenite::Message::Ping(_)) => {
                    // tungstenite handles pong replies automatically
                    tracing::trace!("event stream ping");
                }
                Ok(tungstenite::Message::Close(frame)) => {
                    if let Some(ref cf) = frame {
                        tracing::info!(
                            code = %cf.code,
                            reason = %cf.reason,
                            "event stream close frame received"
                        );
                    } else {
                        tracing::info!("event stream close frame received (no payload)");
                    }
                    return;
                }
                Ok(_) => {
                    // Binary, Pong, Frame — ignore
                }
                Err(e) => {
                    yield Err(Error::StreamConnect(e.to_string()));
                    return;
                }
            }
        }
        // Stream ended without a close frame
        tracing::info!("event stream ended");
    };

    Ok(envelopes.boxed())
}

/// Parse one text frame into an [`Envelope`].
///
/// Returns `None` on decode failure — logged, never fatal.
fn parse_envelope(text: &str) -> Option<Envelope> {
    match serde_json::from_str::<Envelope>(text) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            tracing::debug!(error = %e, "failed to parse stream envelope, skipping frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventKind;

    #[test]
    fn parse_valid_envelope_frame() {
        let text = r#"{
            "version": "1.0",
            "type": "connection.established",
            "timestamp": "2026-03-01T08:00:00Z",
            "payload": {}
        }"#;

        let envelope = parse_envelope(text).expect("frame should parse");
        assert_eq!(envelope.kind(), EventKind::ConnectionEstablished);
    }

    #[test]
    fn malformed_frame_is_skipped() {
        assert!(parse_envelope("not json at all").is_none());
        assert!(parse_envelope(r#"{"type": "x"}"#).is_none()); // missing fields
    }

    #[test]
    fn unknown_tag_still_parses() {
        let text = r#"{
            "version": "1.1",
            "type": "container.evicted",
            "timestamp": "2026-03-01T08:00:00Z",
            "payload": { "id": "c-17" }
        }"#;

        let envelope = parse_envelope(text).expect("unknown tags are not fatal");
        assert_eq!(envelope.kind(), EventKind::Unknown);
        assert_eq!(envelope.tag, "container.evicted");
    }
}
