//! A [`Connector`] that speaks the realtime framing over a WebSocket.
//!
//! Frames are JSON envelopes: `{t: "d", d: <data>}` carries requests,
//! responses and pushes; `{t: "c", d: {t, d}}` carries control messages
//! (`h` hello, `s` shutdown, `r` reset, `e` error). Large frames are split
//! into segments preceded by a bare segment count.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tracing::Instrument;

use crate::protocol::Request;
use crate::transport::{ConnectParams, Connector, Transport, TransportEvents};
use crate::types::Error;

/// Largest text frame sent in one piece.
const MAX_FRAME_SIZE: usize = 16_384;
/// A bare number at most this long announces a segmented frame.
const MAX_SEGMENT_HEADER_LEN: usize = 6;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(45);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Opens a WebSocket per connection attempt.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    /// Give up on a handshake that takes longer than this.
    pub connect_timeout: Duration,
    /// Send a `"0"` keepalive when idle this long.
    pub keepalive_interval: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, params: ConnectParams, events: TransportEvents) -> Box<dyn Transport> {
        let (tx, rx) = mpsc::unbounded_channel();
        let span = tracing::debug_span!("websocket", id = %params.connection_id);
        tokio::spawn(run_socket(self.clone(), params, events, rx).instrument(span));
        Box::new(WebSocketTransport { tx: Some(tx) })
    }
}

#[derive(Debug)]
enum Outgoing {
    Frame(String),
    Close,
}

struct WebSocketTransport {
    tx: Option<mpsc::UnboundedSender<Outgoing>>,
}

impl Transport for WebSocketTransport {
    fn send_request(&mut self, request: &Request) {
        let envelope = serde_json::json!({ "t": "d", "d": request });
        if let Some(tx) = &self.tx {
            let _ = tx.send(Outgoing::Frame(envelope.to_string()));
        }
    }

    fn close(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Outgoing::Close);
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn open(connector: &WebSocketConnector, params: &ConnectParams) -> Result<WsStream, Error> {
    let mut url = params
        .repo
        .connection_url(params.last_session_id.as_deref())?;
    if let Some(app_check) = &params.app_check_token {
        url.query_pairs_mut().append_pair("ac", app_check);
    }
    let mut request = url.as_str().into_client_request()?;
    if let Some(token) = &params.auth_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| Error::Protocol(format!("invalid auth token header: {e}")))?;
        request.headers_mut().insert(header::AUTHORIZATION, value);
    }
    tracing::debug!(host = %params.repo.host, "Opening WebSocket");
    let (ws, _resp) =
        tokio::time::timeout(connector.connect_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| Error::Protocol("WebSocket connect timed out".to_string()))??;
    Ok(ws)
}

async fn run_socket(
    connector: WebSocketConnector,
    params: ConnectParams,
    events: TransportEvents,
    mut out_rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    let ws = tokio::select! {
        opened = open(&connector, &params) => match opened {
            Ok(ws) => ws,
            Err(e) => {
                tracing::warn!("WebSocket connect failed: {e}");
                events.on_disconnect();
                return;
            }
        },
        // Closed before the socket opened.
        _ = wait_for_close(&mut out_rx) => {
            events.on_disconnect();
            return;
        }
    };
    let (mut ws_write, mut ws_read) = ws.split();
    let mut segments = SegmentAssembler::default();
    let mut last_sent = Instant::now();

    loop {
        let keepalive_at = last_sent + connector.keepalive_interval;
        tokio::select! {
            out = out_rx.recv() => match out {
                Some(Outgoing::Frame(text)) => {
                    let mut failed = false;
                    for piece in split_frame(&text) {
                        let message = tungstenite::Message::Text(piece.into());
                        if let Err(e) = ws_write.send(message).await {
                            tracing::warn!("WebSocket send failed: {e}");
                            failed = true;
                            break;
                        }
                    }
                    if failed {
                        break;
                    }
                    last_sent = Instant::now();
                }
                Some(Outgoing::Close) | None => {
                    tracing::debug!("Closing WebSocket");
                    let _ = ws_write.send(tungstenite::Message::Close(None)).await;
                    break;
                }
            },

            frame = ws_read.next() => match frame {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    let Some(full) = segments.push(text.as_str()) else {
                        continue;
                    };
                    match decode_envelope(&full) {
                        Ok(envelope) => {
                            if on_envelope(envelope, &events) == Flow::Close {
                                let _ = ws_write.send(tungstenite::Message::Close(None)).await;
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Failed to decode frame: {e}"),
                    }
                }
                Some(Ok(tungstenite::Message::Close(_))) | None => {
                    tracing::info!("WebSocket closed by server");
                    break;
                }
                Some(Ok(_)) => {
                    // Binary, ping and pong frames carry nothing for us.
                }
                Some(Err(e)) => {
                    tracing::warn!("WebSocket error: {e}");
                    break;
                }
            },

            _ = tokio::time::sleep_until(keepalive_at) => {
                if ws_write.send(tungstenite::Message::Text("0".into())).await.is_err() {
                    break;
                }
                last_sent = Instant::now();
            }
        }
    }
    events.on_disconnect();
}

async fn wait_for_close(out_rx: &mut mpsc::UnboundedReceiver<Outgoing>) {
    // Frames sent before the socket opens are dropped: the supervisor only
    // sends after ready.
    while let Some(out) = out_rx.recv().await {
        if matches!(out, Outgoing::Close) {
            return;
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

fn on_envelope(envelope: Value, events: &TransportEvents) -> Flow {
    let inner = envelope.get("d").cloned().unwrap_or(Value::Null);
    match envelope.get("t").and_then(Value::as_str) {
        Some("d") => {
            events.on_message(inner);
            Flow::Continue
        }
        Some("c") => on_control(&inner, events),
        _ => {
            tracing::warn!(%envelope, "Unknown frame type");
            Flow::Continue
        }
    }
}

fn on_control(control: &Value, events: &TransportEvents) -> Flow {
    let payload = control.get("d").unwrap_or(&Value::Null);
    match control.get("t").and_then(Value::as_str) {
        Some("h") => {
            let ts = payload.get("ts").and_then(Value::as_i64).unwrap_or_default();
            let session = payload.get("s").and_then(Value::as_str).unwrap_or_default();
            if let Some(host) = payload.get("h").and_then(Value::as_str) {
                tracing::debug!(host, "Server hello");
            }
            events.on_ready(ts, session);
            Flow::Continue
        }
        Some("s") => {
            let reason = payload.as_str().unwrap_or("server shutdown");
            events.on_kill(reason);
            Flow::Close
        }
        Some("r") => {
            tracing::info!(host = %payload, "Server asked for a reset");
            Flow::Close
        }
        Some("e") => {
            tracing::error!("Server error: {payload}");
            Flow::Continue
        }
        _ => {
            tracing::debug!(%control, "Ignoring control message");
            Flow::Continue
        }
    }
}

fn decode_envelope(text: &str) -> Result<Value, Error> {
    Ok(serde_json::from_str(text)?)
}

/// Reassembles segmented frames.
#[derive(Debug, Default)]
struct SegmentAssembler {
    remaining: usize,
    buffer: String,
}

impl SegmentAssembler {
    fn push(&mut self, text: &str) -> Option<String> {
        if self.remaining > 0 {
            self.buffer.push_str(text);
            self.remaining -= 1;
            return (self.remaining == 0).then(|| std::mem::take(&mut self.buffer));
        }
        if text.len() <= MAX_SEGMENT_HEADER_LEN
            && let Ok(count) = text.parse::<usize>()
        {
            // "0" is a keepalive.
            self.remaining = count;
            return None;
        }
        Some(text.to_string())
    }
}

/// Split an outgoing frame into pieces of at most `MAX_FRAME_SIZE` bytes,
/// prefixed by the piece count when there is more than one.
fn split_frame(text: &str) -> Vec<String> {
    if text.len() <= MAX_FRAME_SIZE {
        return vec![text.to_string()];
    }
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + MAX_FRAME_SIZE).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        pieces.push(text.get(start..end).unwrap_or_default().to_string());
        start = end;
    }
    let mut framed = Vec::with_capacity(pieces.len() + 1);
    framed.push(pieces.len().to_string());
    framed.extend(pieces);
    framed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_frames_are_sent_whole() {
        assert_eq!(split_frame("{}"), vec!["{}".to_string()]);
    }

    #[test]
    fn large_frames_are_segmented_and_reassembled() {
        let text = "é".repeat(MAX_FRAME_SIZE);
        let pieces = split_frame(&text);
        assert_eq!(pieces[0], (pieces.len() - 1).to_string());
        assert!(pieces[1..].iter().all(|p| p.len() <= MAX_FRAME_SIZE));

        let mut assembler = SegmentAssembler::default();
        let mut out = None;
        for piece in &pieces {
            out = assembler.push(piece);
        }
        assert_eq!(out.as_deref(), Some(text.as_str()));
    }

    #[test]
    fn keepalive_is_swallowed() {
        let mut assembler = SegmentAssembler::default();
        assert_eq!(assembler.push("0"), None);
        assert_eq!(assembler.push("{\"t\":\"d\"}").as_deref(), Some("{\"t\":\"d\"}"));
    }

    #[test]
    fn malformed_frame_is_a_json_error() {
        assert!(matches!(decode_envelope("{\"t\":"), Err(Error::Json(_))));
        assert_eq!(
            decode_envelope("{\"t\":\"d\"}").unwrap(),
            serde_json::json!({"t": "d"})
        );
    }

    #[tokio::test]
    async fn hello_maps_to_ready() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = TransportEvents::new(4, tx);
        let hello = serde_json::json!({
            "t": "c",
            "d": {"t": "h", "d": {"ts": 1_700_000_000_000_i64, "v": "5", "h": "h1", "s": "sess"}}
        });
        assert_eq!(on_envelope(hello, &events), Flow::Continue);
        let (conn, event) = rx.recv().await.unwrap();
        assert_eq!(conn, 4);
        assert_eq!(
            event,
            crate::transport::TransportEvent::Ready {
                server_timestamp_ms: 1_700_000_000_000,
                session_id: "sess".into()
            }
        );
    }

    #[tokio::test]
    async fn shutdown_maps_to_kill_and_closes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = TransportEvents::new(1, tx);
        let shutdown = serde_json::json!({"t": "c", "d": {"t": "s", "d": "over quota"}});
        assert_eq!(on_envelope(shutdown, &events), Flow::Close);
        let (_, event) = rx.recv().await.unwrap();
        assert_eq!(event, crate::transport::TransportEvent::Kill("over quota".into()));
    }
}
