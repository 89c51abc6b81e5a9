// =============================================================================
// Realtime transport — brokerage WebSocket with LOGIN and REG/REMOVE
// =============================================================================
//
// Protocol: connect, send a LOGIN frame carrying the bare access token, wait
// for `return_code == 0`, then register feeds. The server sends PING frames
// as JSON text that must be echoed back verbatim. Realtime payloads arrive as
// `trnm: "REAL"` frames and are parsed once into typed events; everything is
// forwarded to the engine over an unbounded channel.
//
// The reader task does no CPU-heavy work and never blocks on the engine: the
// channel send is non-blocking, and a closed channel ends the loop.
// =============================================================================

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Local;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::gateway::events::{self, GatewayEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Seconds to wait for the LOGIN acknowledgement.
const LOGIN_TIMEOUT_SECS: u64 = 10;

/// Handle to a connected realtime channel. Cheap to clone via `Arc` fields;
/// the read loop runs as its own task and outlives this handle until the
/// socket closes.
pub struct RealtimeTransport {
    writer: Arc<Mutex<WsSink>>,
}

impl RealtimeTransport {
    /// Connect, authenticate, and start the reader task. Parsed events flow
    /// into `events_tx`; when the socket dies the sender is dropped, which
    /// the engine observes as a closed channel.
    pub async fn connect(
        uri: &str,
        token: &str,
        events_tx: UnboundedSender<GatewayEvent>,
    ) -> Result<Self> {
        info!(uri, "connecting realtime channel");
        let (stream, _response) = connect_async(uri)
            .await
            .context("failed to connect realtime WebSocket")?;
        let (mut write, mut read) = stream.split();

        // LOGIN handshake.
        let login = build_login_message(token);
        write
            .send(Message::Text(login.to_string()))
            .await
            .context("failed to send LOGIN frame")?;

        await_login_ack(&mut read, &mut write)
            .await
            .context("realtime LOGIN failed")?;
        info!("realtime channel authenticated");

        let writer = Arc::new(Mutex::new(write));

        let loop_writer = writer.clone();
        tokio::spawn(async move {
            read_loop(read, loop_writer, events_tx).await;
        });

        Ok(Self { writer })
    }

    /// Register realtime feeds. Each pair is `(feed_type, key)`; account-wide
    /// feeds use an empty key.
    pub async fn register(&self, pairs: &[(&str, &str)]) -> Result<()> {
        let msg = build_register_message(pairs);
        debug!(count = pairs.len(), "sending REG");
        self.send_raw(msg.to_string()).await
    }

    /// Unregister realtime feeds.
    pub async fn unregister(&self, pairs: &[(&str, &str)]) -> Result<()> {
        let msg = build_unregister_message(pairs);
        debug!(count = pairs.len(), "sending REMOVE");
        self.send_raw(msg.to_string()).await
    }

    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send(Message::Close(None)).await {
            debug!(error = %e, "close frame send failed (socket already gone)");
        }
    }

    async fn send_raw(&self, payload: String) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(payload))
            .await
            .context("realtime send failed")
    }
}

// =============================================================================
// Frame builders
// =============================================================================

fn build_login_message(token: &str) -> Value {
    json!({ "trnm": "LOGIN", "token": token })
}

fn build_register_message(pairs: &[(&str, &str)]) -> Value {
    let data: Vec<Value> = pairs
        .iter()
        .map(|(feed, key)| json!({ "item": [key], "type": [feed] }))
        .collect();
    json!({
        "trnm": "REG",
        "grp_no": "1",
        // Keep previously registered feeds alive.
        "refresh": "1",
        "data": data,
    })
}

fn build_unregister_message(pairs: &[(&str, &str)]) -> Value {
    let data: Vec<Value> = pairs
        .iter()
        .map(|(feed, key)| json!({ "item": key, "type": feed }))
        .collect();
    json!({ "trnm": "REMOVE", "grp_no": "1", "data": data })
}

// =============================================================================
// LOGIN handshake
// =============================================================================

async fn await_login_ack(read: &mut WsSource, write: &mut WsSink) -> Result<()> {
    let deadline = tokio::time::Duration::from_secs(LOGIN_TIMEOUT_SECS);
    let fut = async {
        while let Some(msg) = read.next().await {
            let msg = msg.context("read error during LOGIN")?;
            let Message::Text(text) = msg else { continue };
            let frame: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(_) => continue,
            };
            match frame.get("trnm").and_then(Value::as_str) {
                Some("PING") => {
                    // Echo verbatim even during the handshake.
                    write.send(Message::Text(text)).await.ok();
                }
                Some("LOGIN") => {
                    let code = frame
                        .get("return_code")
                        .and_then(Value::as_i64)
                        .unwrap_or(-1);
                    if code == 0 {
                        return Ok(());
                    }
                    let msg = frame
                        .get("return_msg")
                        .and_then(Value::as_str)
                        .unwrap_or("login rejected");
                    bail!("LOGIN rejected ({code}): {msg}");
                }
                _ => continue,
            }
        }
        bail!("stream ended before LOGIN acknowledgement")
    };

    tokio::time::timeout(deadline, fut)
        .await
        .context("timed out waiting for LOGIN acknowledgement")?
}

// =============================================================================
// Reader loop
// =============================================================================

async fn read_loop(
    mut read: WsSource,
    writer: Arc<Mutex<WsSink>>,
    events_tx: UnboundedSender<GatewayEvent>,
) {
    info!("realtime reader started");

    while let Some(msg) = read.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                warn!("realtime channel closed by peer");
                break;
            }
            // tungstenite answers protocol-level pings itself.
            Ok(_) => continue,
            Err(e) => {
                error!(error = %e, "realtime read error");
                break;
            }
        };

        let frame: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "unparseable realtime frame dropped");
                continue;
            }
        };

        match frame.get("trnm").and_then(Value::as_str) {
            Some("PING") => {
                // Application-level keepalive: echo the original payload.
                let mut w = writer.lock().await;
                if let Err(e) = w.send(Message::Text(text)).await {
                    error!(error = %e, "failed to echo PING");
                    break;
                }
            }
            Some("REAL") => {
                let today = Local::now().date_naive();
                match events::parse_real_event(&frame, today) {
                    Ok(Some(event)) => {
                        if events_tx.send(event).is_err() {
                            debug!("event channel closed, stopping reader");
                            break;
                        }
                    }
                    Ok(None) => {}
                    // Data-quality policy: drop the record and continue.
                    Err(e) => warn!(error = %e, "malformed realtime record dropped"),
                }
            }
            Some("REG") | Some("REMOVE") => {
                let code = frame
                    .get("return_code")
                    .and_then(|v| {
                        v.as_i64()
                            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
                    })
                    .unwrap_or(-1);
                let message = frame
                    .get("return_msg")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                if events_tx
                    .send(GatewayEvent::SubscriptionAck { code, message })
                    .is_err()
                {
                    break;
                }
            }
            Some("SYSTEM") | Some("LOGIN") => {
                debug!(frame = %text, "system frame");
            }
            _ => debug!(frame = %text, "unrecognized realtime frame"),
        }
    }

    info!("realtime reader stopped");
}

// =============================================================================
// Tests
// =============================================================================
