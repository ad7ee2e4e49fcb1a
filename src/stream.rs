//! Server-sent-event decoding and delta reassembly for streamed completions.

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use std::fmt::Display;
use std::pin::Pin;

use crate::error::{Result, SessionError};
use crate::protocol::ChatCompletionChunk;

pub const DONE_SIGNAL: &str = "[DONE]";

/// Boxed stream of non-empty text fragments in arrival order.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug)]
enum Frame {
    Chunk(ChatCompletionChunk),
    Done,
    Skip,
}

/// Interprets one blank-line delimited SSE event.
fn parse_frame(frame: &str) -> Result<Frame> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in frame.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("data:") {
            data.push(value.strip_prefix(' ').unwrap_or(value));
        } else if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim());
        }
        // id:, retry: and unknown fields carry nothing we use
    }

    if data.is_empty() {
        return Ok(Frame::Skip);
    }
    let payload = data.join("\n");
    let payload = payload.trim();

    if event == Some("error") {
        return Err(SessionError::RequestFailed(format!("service error: {}", payload)));
    }
    if payload == DONE_SIGNAL {
        return Ok(Frame::Done);
    }
    if payload.is_empty() {
        return Ok(Frame::Skip);
    }

    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| SessionError::RequestFailed(format!("malformed chunk: {}", e)))?;

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(SessionError::RequestFailed(format!("service error: {}", message)));
    }

    let chunk = serde_json::from_value(value)
        .map_err(|e| SessionError::RequestFailed(format!("malformed chunk: {}", e)))?;
    Ok(Frame::Chunk(chunk))
}

fn take_frame(buf: &mut Vec<u8>) -> Option<String> {
    let idx = buf.windows(2).position(|w| w == b"\n\n")?;
    let frame: Vec<u8> = buf.drain(..idx + 2).collect();
    Some(String::from_utf8_lossy(&frame[..idx]).into_owned())
}

struct DecodeState<S> {
    input: S,
    buf: Vec<u8>,
    finished: bool,
}

/// Decodes an SSE byte stream into completion chunks.
///
/// The stream ends at `[DONE]`, at end of input, or right after the first
/// error. Bytes are buffered until a full event is available, so multi-byte
/// characters split across network reads are reassembled intact.
pub fn decode_sse<S, E>(input: S) -> impl Stream<Item = Result<ChatCompletionChunk>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + Unpin + 'static,
    E: Display + Send,
{
    let state = DecodeState {
        input,
        buf: Vec::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            if let Some(frame) = take_frame(&mut state.buf) {
                match parse_frame(&frame) {
                    Ok(Frame::Chunk(chunk)) => return Some((Ok(chunk), state)),
                    Ok(Frame::Skip) => continue,
                    Ok(Frame::Done) => return None,
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                }
            }

            match state.input.next().await {
                Some(Ok(bytes)) => {
                    state.buf.extend(bytes.iter().filter(|b| **b != b'\r'));
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((
                        Err(SessionError::RequestFailed(format!("stream interrupted: {}", e))),
                        state,
                    ));
                }
                None => {
                    // Trailing event without a final blank line
                    state.finished = true;
                    let rest = String::from_utf8_lossy(&state.buf).into_owned();
                    state.buf.clear();
                    return match parse_frame(&rest) {
                        Ok(Frame::Chunk(chunk)) => Some((Ok(chunk), state)),
                        Ok(_) => None,
                        Err(e) => Some((Err(e), state)),
                    };
                }
            }
        }
    })
}

/// Keeps only chunks that carry text, dropping keep-alive and metadata-only ones.
pub fn text_fragments<S>(chunks: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = Result<ChatCompletionChunk>> + Send,
{
    chunks.filter_map(|chunk| async move {
        match chunk {
            Ok(chunk) => chunk
                .content()
                .filter(|text| !text.is_empty())
                .map(|text| Ok(text.to_string())),
            Err(e) => Some(Err(e)),
        }
    })
}

/// Accumulates fragments in arrival order.
#[derive(Debug, Default)]
pub struct Reassembler {
    text: String,
    fragments: usize,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        self.text.push_str(fragment);
        self.fragments += 1;
    }

    pub fn fragments(&self) -> usize {
        self.fragments
    }

    /// The accumulated text with surrounding whitespace removed.
    pub fn finish(self) -> String {
        self.text.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse_body(payloads: &[&str]) -> String {
        payloads
            .iter()
            .map(|p| format!("data: {}\n\n", p))
            .collect::<String>()
    }

    fn delta(content: Option<&str>) -> String {
        serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "choices": [{ "index": 0, "delta": { "content": content } }]
        })
        .to_string()
    }

    fn byte_stream(
        parts: Vec<Vec<u8>>,
    ) -> impl Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send + Unpin + 'static {
        stream::iter(parts.into_iter().map(|p| Ok(Bytes::from(p))))
    }

    async fn collect_text(parts: Vec<Vec<u8>>) -> Result<String> {
        let fragments = text_fragments(decode_sse(byte_stream(parts)));
        futures::pin_mut!(fragments);
        let mut out = Reassembler::new();
        while let Some(fragment) = fragments.next().await {
            out.push(&fragment?);
        }
        Ok(out.finish())
    }

    #[tokio::test]
    async fn test_empty_and_null_deltas_contribute_nothing() {
        let body = sse_body(&[
            &delta(None),
            &delta(Some("4")),
            &delta(Some("")),
            &delta(Some(".")),
            DONE_SIGNAL,
        ]);
        let text = collect_text(vec![body.into_bytes()]).await.unwrap();
        assert_eq!(text, "4.");
    }

    #[tokio::test]
    async fn test_reassembly_independent_of_network_splits() {
        let body = sse_body(&[
            &delta(Some(" The golden")),
            &delta(Some(" ratio is ")),
            &delta(Some("φ ≈ 1.618 ")),
            DONE_SIGNAL,
        ])
        .into_bytes();

        let whole = collect_text(vec![body.clone()]).await.unwrap();
        let bytewise = collect_text(body.iter().map(|b| vec![*b]).collect()).await.unwrap();
        let halves = {
            let (a, b) = body.split_at(body.len() / 2);
            collect_text(vec![a.to_vec(), b.to_vec()]).await.unwrap()
        };

        assert_eq!(whole, "The golden ratio is φ ≈ 1.618");
        assert_eq!(whole, bytewise);
        assert_eq!(whole, halves);
    }

    #[tokio::test]
    async fn test_stops_at_done_signal() {
        let body = sse_body(&[&delta(Some("a")), DONE_SIGNAL, &delta(Some("b"))]);
        let text = collect_text(vec![body.into_bytes()]).await.unwrap();
        assert_eq!(text, "a");
    }

    #[tokio::test]
    async fn test_crlf_comments_and_trailing_frame() {
        let body = format!(
            ": keep-alive\r\n\r\nevent: message\r\ndata: {}\r\n\r\ndata: {}",
            delta(Some("hi")),
            delta(Some("!"))
        );
        let text = collect_text(vec![body.into_bytes()]).await.unwrap();
        assert_eq!(text, "hi!");
    }

    #[tokio::test]
    async fn test_malformed_chunk_is_request_failure() {
        let body = sse_body(&[&delta(Some("partial")), "{not json"]);
        let err = collect_text(vec![body.into_bytes()]).await.unwrap_err();
        assert!(matches!(err, SessionError::RequestFailed(ref m) if m.contains("malformed")));
    }

    #[tokio::test]
    async fn test_error_payload_and_error_event() {
        let body = sse_body(&[r#"{"error":{"message":"model crashed"}}"#]);
        let err = collect_text(vec![body.into_bytes()]).await.unwrap_err();
        assert!(err.to_string().contains("model crashed"));

        let body = "event: error\ndata: Process stdout closed\n\n".to_string();
        let err = collect_text(vec![body.into_bytes()]).await.unwrap_err();
        assert!(err.to_string().contains("Process stdout closed"));
    }

    #[tokio::test]
    async fn test_transport_error_ends_stream() {
        let parts: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from(sse_body(&[&delta(Some("4"))]))),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from(sse_body(&[&delta(Some("never"))]))),
        ];
        let chunks: Vec<_> = decode_sse(stream::iter(parts)).collect().await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].is_ok());
        assert!(matches!(chunks[1], Err(SessionError::RequestFailed(_))));
    }

    #[test]
    fn test_reassembler_counts_only_text() {
        let mut out = Reassembler::new();
        out.push("");
        out.push("  4");
        out.push("");
        out.push(". \n");
        assert_eq!(out.fragments(), 2);
        assert_eq!(out.finish(), "4.");
    }
}
