//! Structured progress event protocol
//!
//! The pipeline emits newline-delimited events on the response body. Each
//! line is a JSON object tagged with `type`: incremental `progress` events
//! per layer, and a single terminal `success` or `error` event. Consumers
//! parse line-by-line and skip unparseable lines.

use crate::error::Result;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Byte progress for a single layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerProgress {
    pub id: String,
    pub current: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    Progress { layer: LayerProgress, total: u64 },
    Success { message: String },
    Error { message: String },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressEvent::Progress { .. })
    }
}

/// Parse one wire line into an event. Unknown or malformed lines yield
/// `None` so that newer event types pass through old consumers.
pub fn parse_line(line: &str) -> Option<ProgressEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// Escape a serialized event for clients that did not negotiate JSON, so
/// raw payloads render safely on a console. Mirrors the inverse unescaping
/// performed by line-oriented consumers.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Encode an event as one wire line, HTML-escaping unless the client
/// accepts JSON.
pub fn encode_line(event: &ProgressEvent, json: bool) -> Bytes {
    // In-memory serialization of these event types cannot fail.
    let serialized = serde_json::to_string(event).unwrap_or_default();
    let mut line = if json { serialized } else { escape_html(&serialized) };
    line.push('\n');
    Bytes::from(line)
}

/// Write side of the progress channel handed to the pipeline.
///
/// Incremental updates must not block the data path: they are dropped when
/// the channel is full. A closed channel means the consumer went away, which
/// cancels the operation. Terminal events are awaited so they are never lost
/// to backpressure.
#[derive(Clone)]
pub struct ProgressSink {
    tx: mpsc::Sender<ProgressEvent>,
    cancel: CancellationToken,
}

impl ProgressSink {
    pub fn new(tx: mpsc::Sender<ProgressEvent>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// A sink with no consumer, for callers that do not observe progress.
    pub fn discard() -> Self {
        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        Self {
            tx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Send an incremental update without blocking the data path.
    pub fn update(&self, event: ProgressEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Consumer is slow; drop the update. The next one carries a
                // larger `current` so nothing is lost semantically.
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.cancel.cancel();
            }
        }
    }

    /// Deliver a terminal event, waiting out backpressure.
    pub async fn finish(&self, event: ProgressEvent) {
        let _ = self.tx.send(event).await;
    }
}

/// Stream decorator that counts bytes and forwards per-layer progress to a
/// sink. Cancellation is observed between chunks.
pub struct CountingStream<S> {
    inner: S,
    sink: ProgressSink,
    layer_id: String,
    layer_size: u64,
    total: u64,
    current: u64,
}

impl<S> CountingStream<S> {
    pub fn new(inner: S, sink: ProgressSink, layer_id: String, layer_size: u64, total: u64, offset: u64) -> Self {
        Self {
            inner,
            sink,
            layer_id,
            layer_size,
            total,
            current: offset,
        }
    }
}

impl<S> Stream for CountingStream<S>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.sink.cancel.is_cancelled() {
            return Poll::Ready(Some(Err(crate::error::DistributionError::Cancelled)));
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.current += chunk.len() as u64;
                let event = ProgressEvent::Progress {
                    layer: LayerProgress {
                        id: self.layer_id.clone(),
                        current: self.current,
                        size: self.layer_size,
                    },
                    total: self.total,
                };
                self.sink.update(event);
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}
