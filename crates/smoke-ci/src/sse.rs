//! Incremental decoding of `event:`/`data:` framed streams.
//!
//! [`SseDecoder`] holds only the unterminated tail of the byte stream and the
//! pending event type, so the events it yields do not depend on how the
//! transport fragmented the body. [`StreamOutcome`] reduces the events of one
//! analyze call to its single terminal result.

use std::fmt::Display;

use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SmokeError};

const EVENT_PREFIX: &str = "event: ";
const DATA_PREFIX: &str = "data: ";

pub const EVENT_COMPLETE: &str = "complete";
pub const EVENT_ERROR: &str = "error";

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub kind: String,
    pub payload: Value,
}

/// Line-oriented decoder fed with arbitrary byte fragments.
#[derive(Debug, Default)]
pub struct SseDecoder {
    residual: Vec<u8>,
    pending: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>> {
        self.residual.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut consumed = 0;
        while let Some(offset) = self.residual[consumed..].iter().position(|&b| b == b'\n') {
            let end = consumed + offset;
            let line = String::from_utf8_lossy(&self.residual[consumed..end]).into_owned();
            consumed = end + 1;
            if let Some(event) = self.take_line(&line)? {
                events.push(event);
            }
        }
        self.residual.drain(..consumed);

        Ok(events)
    }

    /// Flush an unterminated final line once the transport has ended.
    pub fn finish(&mut self) -> Result<Option<SseEvent>> {
        if self.residual.is_empty() {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.residual).into_owned();
        self.residual.clear();
        self.take_line(&line)
    }

    /// Bytes received but not yet terminated by a newline.
    pub fn residual(&self) -> &[u8] {
        &self.residual
    }

    fn take_line(&mut self, line: &str) -> Result<Option<SseEvent>> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(name) = line.strip_prefix(EVENT_PREFIX) {
            self.pending = Some(name.trim().to_string());
            return Ok(None);
        }

        if let Some(data) = line.strip_prefix(DATA_PREFIX) {
            let Some(kind) = self.pending.take() else {
                return Ok(None);
            };
            let payload = serde_json::from_str(data).map_err(|e| {
                SmokeError::StreamProtocol(format!("malformed `{}` payload: {}", kind, e))
            })?;
            return Ok(Some(SseEvent { kind, payload }));
        }

        if line.is_empty() {
            self.pending = None;
        }
        Ok(None)
    }
}

/// Terminal state of one streamed analyze call.
#[derive(Debug, Default)]
pub struct StreamOutcome {
    completed: Option<Value>,
    seen: usize,
}

impl StreamOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the outcome. An `error` event fails immediately.
    pub fn observe(&mut self, event: SseEvent) -> Result<()> {
        self.seen += 1;
        match event.kind.as_str() {
            EVENT_ERROR => {
                let message = event
                    .payload
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                Err(SmokeError::StreamProtocol(format!(
                    "/analyze stream error: {}",
                    message
                )))
            }
            EVENT_COMPLETE => {
                self.completed = Some(event.payload);
                Ok(())
            }
            other => {
                debug!(event = %other, payload = %event.payload, "analyze progress");
                Ok(())
            }
        }
    }

    /// Number of events observed so far.
    pub fn events_seen(&self) -> usize {
        self.seen
    }

    /// The `complete` payload, or an error if the stream never produced one.
    pub fn finish(self) -> Result<Value> {
        self.completed.ok_or_else(|| {
            SmokeError::StreamProtocol("/analyze did not emit a complete event".to_string())
        })
    }
}

/// Drain a byte stream to its terminal event.
///
/// Consumes the transport until it ends; a `complete` event does not cut the
/// read short, but an `error` event or a transport failure does.
pub async fn decode_stream<S, B, E>(stream: S) -> Result<Value>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = SseDecoder::new();
    let mut outcome = StreamOutcome::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| SmokeError::StreamProtocol(e.to_string()))?;
        for event in decoder.push(chunk.as_ref())? {
            outcome.observe(event)?;
        }
    }
    if let Some(event) = decoder.finish()? {
        outcome.observe(event)?;
    }

    debug!(events = outcome.events_seen(), "analyze stream drained");
    outcome.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::convert::Infallible;

    const STREAM: &str = "event: stage\ndata: {\"stage\":\"create\",\"status\":\"done\"}\n\n\
event: stage\ndata: {\"stage\":\"drawing\",\"status\":\"done\"}\n\n\
event: complete\ndata: {\"stages\":[\"create\",\"drawing\"],\"note\":\"Ø50 flange\"}\n\n";

    fn decode_all<C: AsRef<[u8]>>(chunks: &[C]) -> Result<Vec<SseEvent>> {
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(decoder.push(chunk.as_ref())?);
        }
        events.extend(decoder.finish()?);
        Ok(events)
    }

    fn chunked(parts: Vec<&[u8]>) -> impl Stream<Item = std::result::Result<Vec<u8>, Infallible>> + '_ {
        futures::stream::iter(parts.into_iter().map(|p| Ok(p.to_vec())))
    }

    #[test]
    fn test_single_chunk_yields_all_events() {
        let events = decode_all(&[STREAM.as_bytes()]).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, "stage");
        assert_eq!(events[2].kind, EVENT_COMPLETE);
        assert_eq!(events[2].payload["stages"], json!(["create", "drawing"]));
    }

    #[test]
    fn test_every_split_offset_matches_contiguous_decode() {
        let bytes = STREAM.as_bytes();
        let expected = decode_all(&[bytes]).unwrap();

        for split in 0..=bytes.len() {
            let (a, b) = bytes.split_at(split);
            let events = decode_all(&[a, b]).unwrap();
            assert_eq!(events, expected, "split at byte {}", split);
        }
    }

    #[test]
    fn test_byte_by_byte_delivery_matches_contiguous_decode() {
        let bytes = STREAM.as_bytes();
        let expected = decode_all(&[bytes]).unwrap();
        let singles: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(decode_all(&singles[..]).unwrap(), expected);
    }

    #[test]
    fn test_partial_line_is_retained() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: compl").unwrap().is_empty());
        assert_eq!(decoder.residual(), b"event: compl");
        assert!(decoder.push(b"ete\ndata: {\"a\"").unwrap().is_empty());
        let events = decoder.push(b":1}\n\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, json!({"a": 1}));
        assert!(decoder.residual().is_empty());
    }

    #[test]
    fn test_data_without_event_is_ignored() {
        let events = decode_all(&[b"data: {\"x\":1}\n\n"]).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_blank_line_clears_pending_event() {
        let events = decode_all(&[b"event: complete\n\ndata: {\"x\":1}\n\n"]).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_crlf_lines_are_accepted() {
        let events = decode_all(&[b"event: complete\r\ndata: {\"x\":1}\r\n\r\n"]).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "complete");
    }

    #[test]
    fn test_unterminated_final_line_is_flushed() {
        let events = decode_all(&[b"event: complete\ndata: {\"x\":1}"]).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_malformed_payload_is_protocol_error() {
        let err = decode_all(&[b"event: stage\ndata: {oops\n\n"]).unwrap_err();
        assert!(matches!(err, SmokeError::StreamProtocol(_)));
    }

    #[tokio::test]
    async fn test_decode_stream_returns_complete_payload() {
        let bytes = STREAM.as_bytes();
        let parts: Vec<&[u8]> = vec![&bytes[..7], &bytes[7..61], &bytes[61..]];
        let result = decode_stream(chunked(parts)).await.unwrap();
        assert_eq!(result["note"], "Ø50 flange");
    }

    #[tokio::test]
    async fn test_stream_without_complete_fails() {
        let body: &[u8] = b"event: stage\ndata: {\"stage\":\"create\"}\n\n";
        let err = decode_stream(chunked(vec![body])).await.unwrap_err();
        assert!(err.to_string().contains("did not emit a complete event"));
    }

    #[tokio::test]
    async fn test_error_event_fails_with_message() {
        let body: &[u8] = b"event: error\ndata: {\"error\":\"FreeCAD crashed\"}\n\n";
        let err = decode_stream(chunked(vec![body])).await.unwrap_err();
        assert!(err.to_string().contains("FreeCAD crashed"));
    }

    #[tokio::test]
    async fn test_error_event_without_message_is_generic() {
        let body: &[u8] = b"event: error\ndata: {}\n\n";
        let err = decode_stream(chunked(vec![body])).await.unwrap_err();
        assert!(err.to_string().contains("unknown"));
    }

    #[tokio::test]
    async fn test_transport_error_aborts_decode() {
        let parts = vec![
            Ok(b"event: stage\n".to_vec()),
            Err("connection reset"),
        ];
        let err = decode_stream(futures::stream::iter(parts)).await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
    }
}
