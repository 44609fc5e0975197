// =============================================================================
// Kline Stream - one live subscription per selected key
// =============================================================================
//
// A `StreamConnection` owns a spawned task that connects to
// `<feed>/<instrument>@kline_<resolution>`, parses every text frame into a
// `RawIntervalEvent` and forwards it, tagged with the connection id, onto the
// controller's event channel. On disconnect the task reconnects with capped
// exponential backoff. `close()` aborts the task; the controller additionally
// drops any event whose connection id is not the active one.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::IngestError;
use crate::market_data::{Candle, ReconnectPolicy};
use crate::types::SeriesKey;

// ---------------------------------------------------------------------------
// Raw events
// ---------------------------------------------------------------------------

/// One kline update as the exchange sends it. Prices stay text until
/// [`RawIntervalEvent::to_candle`].
#[derive(Debug, Clone, PartialEq)]
pub struct RawIntervalEvent {
    /// `s`, when present (uppercase exchange symbol).
    pub symbol: Option<String>,
    /// `k.i`, when present.
    pub interval: Option<String>,
    /// `k.t`, interval open time in epoch ms.
    pub open_time: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    /// `k.x`, true once the interval has fully elapsed.
    pub is_closed: bool,
}

impl RawIntervalEvent {
    pub fn to_candle(&self) -> Result<Candle, IngestError> {
        Candle::new(
            self.open_time,
            parse_price(&self.open, "k.o")?,
            parse_price(&self.high, "k.h")?,
            parse_price(&self.low, "k.l")?,
            parse_price(&self.close, "k.c")?,
        )
    }
}

fn parse_price(text: &str, name: &str) -> Result<f64, IngestError> {
    text.trim()
        .parse::<f64>()
        .map_err(|_| IngestError::MalformedMessage(format!("failed to parse {name} as f64: {text:?}")))
}

/// Parse a kline message.
///
/// Expected shape (single stream):
/// ```json
/// { "e": "kline", "s": "ETHUSDT", "k": { "t": 1000, "o": "10", "h": "12", "l": "9", "c": "11", "x": true } }
/// ```
/// The combined-stream `{ "stream": ..., "data": { ... } }` envelope is
/// accepted too.
pub fn parse_kline_message(text: &str) -> Result<RawIntervalEvent, IngestError> {
    parse_kline_value(text).map_err(|e| IngestError::MalformedMessage(format!("{e:#}")))
}

fn parse_kline_value(text: &str) -> Result<RawIntervalEvent> {
    let root: serde_json::Value = serde_json::from_str(text).context("failed to parse kline JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let k = data.get("k").filter(|k| k.is_object()).context("missing object k")?;

    Ok(RawIntervalEvent {
        symbol: data["s"].as_str().map(str::to_string),
        interval: k["i"].as_str().map(str::to_string),
        open_time: k["t"].as_i64().context("missing field k.t")?,
        open: price_text(&k["o"], "k.o")?,
        high: price_text(&k["h"], "k.h")?,
        low: price_text(&k["l"], "k.l")?,
        close: price_text(&k["c"], "k.c")?,
        is_closed: k["x"].as_bool().context("missing field k.x")?,
    })
}

/// Binance sends prices as JSON strings; bare numbers are tolerated.
fn price_text(val: &serde_json::Value, name: &str) -> Result<String> {
    match val {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => anyhow::bail!("missing field {name}"),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// ---------------------------------------------------------------------------
// Events delivered to the controller
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StreamEventKind {
    Connected,
    Interval(RawIntervalEvent),
    Malformed(IngestError),
    Disconnected(IngestError),
}

#[derive(Debug)]
pub struct StreamEvent {
    /// Id of the `StreamConnection` that produced this event.
    pub connection_id: u64,
    pub kind: StreamEventKind,
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Text frames from one established connection. The stream ends on a clean
/// close; an `Err` item means the connection broke.
pub type TextStream = BoxStream<'static, Result<String>>;

/// Opens the raw channel to the feed.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<TextStream>>;
}

/// Binance WebSocket transport over `tokio-tungstenite`.
pub struct WsTransport;

impl Transport for WsTransport {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<TextStream>> {
        async move {
            let (ws_stream, _response) = connect_async(url.as_str())
                .await
                .context("failed to connect to kline WebSocket")?;

            // Ping / Pong / Binary frames are dropped here; tungstenite answers
            // pings itself.
            let texts = ws_stream.filter_map(|msg| {
                futures_util::future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(_) => None,
                    Err(e) => Some(Err(anyhow::Error::new(e).context("kline WebSocket read error"))),
                })
            });
            Ok(texts.boxed())
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// StreamConnection
// ---------------------------------------------------------------------------

/// Handle to the task serving one subscription. Closing (or dropping) the
/// handle aborts the task.
pub struct StreamConnection {
    id: u64,
    key: SeriesKey,
    task: Option<JoinHandle<()>>,
}

impl StreamConnection {
    /// Spawn the subscription task for `key`. Every event it produces is
    /// tagged with `id` and sent on `events`.
    pub fn open<T: Transport>(
        id: u64,
        key: SeriesKey,
        feed_base_url: &str,
        transport: Arc<T>,
        policy: ReconnectPolicy,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Self {
        let url = stream_url(feed_base_url, &key);
        info!(connection_id = id, key = %key, url = %url, "opening kline stream");

        let task = tokio::spawn(run_connection(id, url, transport, policy, events));

        Self {
            id,
            key,
            task: Some(task),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn is_open(&self) -> bool {
        self.task.is_some()
    }

    /// Abort the subscription task. Idempotent.
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!(connection_id = self.id, key = %self.key, "kline stream closed");
        }
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// `wss://stream.binance.com:9443/ws` + `ethusdt@kline_1m`.
pub fn stream_url(feed_base_url: &str, key: &SeriesKey) -> String {
    format!("{}/{}", feed_base_url.trim_end_matches('/'), key.stream_name())
}

async fn run_connection<T: Transport>(
    id: u64,
    url: String,
    transport: Arc<T>,
    mut policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<StreamEvent>,
) {
    let send = |kind: StreamEventKind| {
        events
            .send(StreamEvent {
                connection_id: id,
                kind,
            })
            .is_ok()
    };

    loop {
        let reason = match transport.connect(url.clone()).await {
            Ok(mut stream) => {
                info!(connection_id = id, url = %url, "kline WebSocket connected");
                policy.reset();
                if !send(StreamEventKind::Connected) {
                    return;
                }

                loop {
                    match stream.next().await {
                        Some(Ok(text)) => {
                            let kind = match parse_kline_message(&text) {
                                Ok(event) => {
                                    debug!(
                                        connection_id = id,
                                        close = %event.close,
                                        closed = event.is_closed,
                                        "kline update"
                                    );
                                    StreamEventKind::Interval(event)
                                }
                                Err(e) => StreamEventKind::Malformed(e),
                            };
                            if !send(kind) {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            error!(connection_id = id, error = %e, "kline WebSocket read error");
                            break format!("{e:#}");
                        }
                        None => {
                            warn!(connection_id = id, url = %url, "kline WebSocket stream ended");
                            break "stream ended".to_string();
                        }
                    }
                }
            }
            Err(e) => {
                error!(connection_id = id, url = %url, error = %e, "kline WebSocket connect failed");
                format!("{e:#}")
            }
        };

        if !send(StreamEventKind::Disconnected(IngestError::TransportFailure(reason))) {
            return;
        }

        match policy.next_delay() {
            Some(delay) => {
                info!(
                    connection_id = id,
                    attempt = policy.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "reconnecting kline stream"
                );
                tokio::time::sleep(delay).await;
            }
            None => {
                warn!(connection_id = id, "reconnect disabled, kline stream stopped");
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
