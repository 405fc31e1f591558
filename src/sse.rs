//! Server-Sent Events framing: record encoding, an incremental parser,
//! and the channel-backed output plumbing used for streaming responses.
//!
//! A record on the wire is `event: <name>\n` followed by one or more
//! `data: <line>\n` lines and a blank-line terminator. Lines starting
//! with `:` are comments; the server emits a bare comment record as its
//! keep-alive, and the parser never surfaces them.

use crate::error::{ErrorCode, TransportError, TransportResult};
use bytes::Bytes;
use hyper::body::Frame;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// The keep-alive record: a comment line plus the record terminator.
pub const KEEP_ALIVE: &str = ":\n\n";

/// Encodes one SSE record. The payload is serialized JSON and contains
/// no literal newlines, so a single `data:` line suffices.
pub fn encode_event(name: &str, data: &str) -> String {
    format!("event: {}\ndata: {}\n\n", name, data)
}

/// A parsed SSE record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name; `message` when the stream never named one.
    pub name: String,
    /// Data payload; multiple `data:` lines are joined with `\n`.
    pub data: String,
}

/// Incremental SSE parser.
///
/// Feed it raw bytes as they arrive; it buffers partial lines across
/// read boundaries and yields complete records in arrival order.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    /// Creates an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes a chunk of bytes and returns every record completed by it.
    pub fn feed(&mut self, bytes: &[u8]) -> TransportResult<Vec<SseEvent>> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = std::str::from_utf8(&line[..line.len() - 1])
                .map_err(|e| TransportError::parse(format!("invalid utf-8 in stream: {}", e)))?;
            if let Some(event) = self.feed_line(line) {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        // Blank line dispatches the pending record. A comment-only record
        // (the keep-alive) leaves nothing pending and dispatches nothing.
        if line.is_empty() {
            if self.event.is_none() && self.data.is_empty() {
                return None;
            }
            return Some(SseEvent {
                name: self.event.take().unwrap_or_else(|| "message".to_string()),
                data: std::mem::take(&mut self.data).join("\n"),
            });
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // id: and retry: are not used by this protocol
            _ => {}
        }
        None
    }
}

/// Write half of an open event stream.
///
/// Clonable; every operation task plus the keep-alive ticker hold one.
/// The channel is bounded, so a slow consumer blocks senders and paces
/// the producers behind them.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::Sender<Bytes>,
}

impl EventSink {
    /// Creates a sink and the HTTP response body that drains it.
    pub fn channel(capacity: usize) -> (Self, SseBody) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, SseBody { receiver })
    }

    /// Writes one encoded record to the stream.
    pub async fn send_event(&self, name: &str, data: &str) -> TransportResult<()> {
        self.send_record(encode_event(name, data)).await
    }

    /// Writes a keep-alive comment to the stream.
    pub async fn send_comment(&self) -> TransportResult<()> {
        self.send_record(Bytes::from_static(KEEP_ALIVE.as_bytes())).await
    }

    /// Writes an already-encoded record to the stream.
    pub async fn send_record(&self, record: impl Into<Bytes>) -> TransportResult<()> {
        self.sender
            .send(record.into())
            .await
            .map_err(|_| TransportError::new(ErrorCode::StreamClosed, "event stream closed"))
    }

    /// Resolves once the consuming side has gone away.
    pub async fn closed(&self) {
        self.sender.closed().await;
    }

    /// Returns true if the consuming side has gone away.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Streaming HTTP response body backed by an [`EventSink`] channel.
///
/// Ends when every sink clone has been dropped; dropping it (client
/// disconnect) makes subsequent sink writes fail, which is how the
/// server observes the disconnect.
#[derive(Debug)]
pub struct SseBody {
    receiver: mpsc::Receiver<Bytes>,
}

impl hyper::body::Body for SseBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.get_mut().receiver.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_event() {
        let record = encode_event("next", r#"{"data":{"hello":"world"}}"#);
        assert_eq!(record, "event: next\ndata: {\"data\":{\"hello\":\"world\"}}\n\n");
    }

    #[test]
    fn test_parse_roundtrip() {
        let mut parser = SseParser::new();
        let events = parser
            .feed(encode_event("next", r#"{"x":1}"#).as_bytes())
            .unwrap();
        assert_eq!(
            events,
            vec![SseEvent {
                name: "next".to_string(),
                data: r#"{"x":1}"#.to_string(),
            }]
        );
    }

    #[test]
    fn test_parse_split_across_reads() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"event: com").unwrap().is_empty());
        assert!(parser.feed(b"plete\nda").unwrap().is_empty());
        let events = parser.feed(b"ta: {}\n\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "complete");
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn test_comments_are_ignored() {
        let mut parser = SseParser::new();
        let events = parser.feed(b":\n\n: ping\n\nevent: next\ndata: {}\n\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "next");
    }

    #[test]
    fn test_multiple_data_lines_joined() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: a\ndata: b\n\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "message");
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: next\r\ndata: {}\r\n\r\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{}");
    }

    #[tokio::test]
    async fn test_sink_close_detection() {
        let (sink, body) = EventSink::channel(4);
        assert!(!sink.is_closed());
        sink.send_comment().await.unwrap();
        drop(body);
        sink.closed().await;
        assert!(sink.send_event("next", "{}").await.is_err());
    }
}
