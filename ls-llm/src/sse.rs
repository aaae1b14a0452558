//! Incremental decoders for `text/event-stream` bodies.
//!
//! Frames are blank-line-separated blocks of `event:`/`data:` lines; CRLF
//! line endings are normalized to `\n` as chunks arrive. OpenAI-style
//! endpoints only use `data:` lines (with a `[DONE]` sentinel); Anthropic
//! names its events. Both decoders are single-pass over the response byte
//! stream and buffer only the current partial frame.

use crate::error::{LlmError, Result};
use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;

#[derive(Debug)]
pub(crate) enum SseEvent {
    Data(String),
    Other,
}

/// Decode a `data:`-only SSE stream (OpenAI, Mistral, Gemini, gateway).
pub(crate) fn decode_sse_data<S, E>(bytes_stream: S) -> impl Stream<Item = Result<SseEvent>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display,
{
    futures_util::stream::unfold(
        (Box::pin(bytes_stream), String::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some(idx) = buffer.find("\n\n") {
                    let raw = buffer[..idx].to_string();
                    buffer = buffer[idx + 2..].to_string();

                    let mut data_lines = Vec::new();
                    for line in raw.lines() {
                        let line = line.trim_end();
                        if let Some(rest) = line.strip_prefix("data:") {
                            data_lines.push(rest.trim_start().to_string());
                        }
                    }
                    if data_lines.is_empty() {
                        return Some((Ok(SseEvent::Other), (stream, buffer)));
                    }
                    return Some((Ok(SseEvent::Data(data_lines.join("\n"))), (stream, buffer)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        // A `\r\n` pair can straddle a chunk boundary, so the
                        // whole (small) buffer is renormalized each time.
                        if buffer.contains('\r') {
                            buffer = buffer.replace("\r\n", "\n");
                        }
                        continue;
                    }
                    Some(Err(e)) => {
                        return Some((Err(LlmError::Transport(e.to_string())), (stream, buffer)));
                    }
                    None => return None,
                }
            }
        },
    )
}

pub(crate) type NamedEvent = (String, String);

/// Decode an SSE stream with named events (Anthropic). Yields
/// `(event, data)` pairs; unnamed frames default to `"message"`.
pub(crate) fn decode_sse_events<S, E>(
    bytes_stream: S,
) -> impl Stream<Item = Result<NamedEvent>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display,
{
    futures_util::stream::unfold(
        (Box::pin(bytes_stream), String::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some(idx) = buffer.find("\n\n") {
                    let raw = buffer[..idx].to_string();
                    buffer = buffer[idx + 2..].to_string();

                    let mut event = String::new();
                    let mut data_lines = Vec::new();

                    for line in raw.lines() {
                        let line = line.trim_end();
                        if let Some(rest) = line.strip_prefix("event:") {
                            event = rest.trim_start().to_string();
                            continue;
                        }
                        if let Some(rest) = line.strip_prefix("data:") {
                            data_lines.push(rest.trim_start().to_string());
                        }
                    }

                    let data = data_lines.join("\n");
                    if event.is_empty() && data.is_empty() {
                        continue;
                    }
                    if event.is_empty() {
                        event = "message".to_string();
                    }
                    return Some((Ok((event, data)), (stream, buffer)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        // A `\r\n` pair can straddle a chunk boundary, so the
                        // whole (small) buffer is renormalized each time.
                        if buffer.contains('\r') {
                            buffer = buffer.replace("\r\n", "\n");
                        }
                        continue;
                    }
                    Some(Err(e)) => {
                        return Some((Err(LlmError::Transport(e.to_string())), (stream, buffer)));
                    }
                    None => return None,
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn byte_stream(
        parts: Vec<&'static str>,
    ) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> + Send + Unpin + 'static {
        futures_util::stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))))
    }

    #[tokio::test]
    async fn data_frames_are_reassembled_across_chunk_boundaries() {
        let stream = byte_stream(vec!["data: {\"a\"", ":1}\n\ndata: [DO", "NE]\n\n"]);
        let mut decoded = std::pin::pin!(decode_sse_data(stream));

        let first = decoded.next().await.expect("first frame").expect("ok");
        match first {
            SseEvent::Data(data) => assert_eq!(data, "{\"a\":1}"),
            SseEvent::Other => panic!("expected data frame"),
        }
        let second = decoded.next().await.expect("second frame").expect("ok");
        match second {
            SseEvent::Data(data) => assert_eq!(data, "[DONE]"),
            SseEvent::Other => panic!("expected data frame"),
        }
        assert!(decoded.next().await.is_none());
    }

    #[tokio::test]
    async fn frames_without_data_lines_are_other() {
        let stream = byte_stream(vec![": keep-alive\n\ndata: x\n\n"]);
        let mut decoded = std::pin::pin!(decode_sse_data(stream));

        assert!(matches!(
            decoded.next().await.expect("frame").expect("ok"),
            SseEvent::Other
        ));
        assert!(matches!(
            decoded.next().await.expect("frame").expect("ok"),
            SseEvent::Data(d) if d == "x"
        ));
    }

    #[tokio::test]
    async fn crlf_frames_split_even_across_chunk_boundaries() {
        let stream = byte_stream(vec!["data: one\r", "\n\r\ndata: two\r\n\r\n"]);
        let mut decoded = std::pin::pin!(decode_sse_data(stream));

        assert!(matches!(
            decoded.next().await.expect("frame").expect("ok"),
            SseEvent::Data(d) if d == "one"
        ));
        assert!(matches!(
            decoded.next().await.expect("frame").expect("ok"),
            SseEvent::Data(d) if d == "two"
        ));
        assert!(decoded.next().await.is_none());
    }

    #[tokio::test]
    async fn crlf_named_frames_are_decoded() {
        let stream = byte_stream(vec!["event: message_stop\r\ndata: {}\r\n\r\n"]);
        let mut decoded = std::pin::pin!(decode_sse_events(stream));
        let (event, data) = decoded.next().await.expect("frame").expect("ok");
        assert_eq!(event, "message_stop");
        assert_eq!(data, "{}");
    }

    #[tokio::test]
    async fn named_events_carry_event_and_data() {
        let stream = byte_stream(vec![
            "event: content_block_delta\ndata: {\"d\":1}\n\nevent: message_stop\ndata: {}\n\n",
        ]);
        let mut decoded = std::pin::pin!(decode_sse_events(stream));

        let (event, data) = decoded.next().await.expect("frame").expect("ok");
        assert_eq!(event, "content_block_delta");
        assert_eq!(data, "{\"d\":1}");
        let (event, _) = decoded.next().await.expect("frame").expect("ok");
        assert_eq!(event, "message_stop");
        assert!(decoded.next().await.is_none());
    }

    #[tokio::test]
    async fn unnamed_frames_default_to_message() {
        let stream = byte_stream(vec!["data: hello\n\n"]);
        let mut decoded = std::pin::pin!(decode_sse_events(stream));
        let (event, data) = decoded.next().await.expect("frame").expect("ok");
        assert_eq!(event, "message");
        assert_eq!(data, "hello");
    }
}
