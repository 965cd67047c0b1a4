//! Decoder for the chat-completions event stream.
//!
//! The server sends one event per line:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//! data: {"choices":[{"delta":{"content":"lo"}}]}
//! data: [DONE]
//! ```
//!
//! Anything that is not a `data: ` line, or whose payload fails to parse, is
//! dropped without surfacing an error. Transport failures are passed through.

use futures::{Stream, StreamExt};
use serde::Deserialize;
use tracing::trace;

use crate::client::TransportError;

/// Prefix carried by every event line.
pub const EVENT_PREFIX: &str = "data: ";

/// Payload that terminates the stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    /// Incremental text. Empty only for the terminal event.
    pub content: String,
    /// Set on the `[DONE]` marker.
    pub is_terminal: bool,
}

impl StreamEvent {
    pub fn delta(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_terminal: false,
        }
    }

    pub fn terminal() -> Self {
        Self {
            content: String::new(),
            is_terminal: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChunkFrame {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Decode a single protocol line.
///
/// Returns `None` for lines that carry no text: comments, keep-alives,
/// malformed JSON, or frames without a non-empty `choices[0].delta.content`.
pub fn decode_line(line: &str) -> Option<StreamEvent> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let payload = line.strip_prefix(EVENT_PREFIX)?;

    if payload.trim() == DONE_SENTINEL {
        return Some(StreamEvent::terminal());
    }

    let frame: ChunkFrame = match serde_json::from_str(payload) {
        Ok(frame) => frame,
        Err(e) => {
            trace!("Dropping malformed stream frame: {}", e);
            return None;
        }
    };

    let content = frame
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content)?;

    if content.is_empty() {
        None
    } else {
        Some(StreamEvent::delta(content))
    }
}

/// Pulls [`StreamEvent`]s out of a stream of protocol lines.
pub struct StreamDecoder<S> {
    lines: S,
    finished: bool,
}

impl<S> StreamDecoder<S>
where
    S: Stream<Item = Result<String, TransportError>> + Unpin,
{
    pub fn new(lines: S) -> Self {
        Self {
            lines,
            finished: false,
        }
    }

    /// Next event, or `None` once the terminal marker was seen or the
    /// underlying stream ended.
    pub async fn next_event(&mut self) -> Option<Result<StreamEvent, TransportError>> {
        if self.finished {
            return None;
        }

        while let Some(line) = self.lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            };

            if let Some(event) = decode_line(&line) {
                if event.is_terminal {
                    self.finished = true;
                }
                return Some(Ok(event));
            }
        }

        self.finished = true;
        None
    }

    /// Whether the decoder has stopped producing events.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Splits raw response chunks into lines.
///
/// Splitting happens on the `\n` byte before any UTF-8 decoding, so a
/// multi-byte character spanning two chunks is reassembled intact.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completes (without the newline).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Flush whatever is left after the final chunk.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn lines(items: &[&str]) -> Vec<Result<String, TransportError>> {
        items.iter().map(|s| Ok(s.to_string())).collect()
    }

    #[test]
    fn test_decode_delta() {
        let event = decode_line(r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#);
        assert_eq!(event, Some(StreamEvent::delta("Hello")));
    }

    #[test]
    fn test_decode_done() {
        assert_eq!(decode_line("data: [DONE]"), Some(StreamEvent::terminal()));
        assert_eq!(decode_line("data: [DONE]\r"), Some(StreamEvent::terminal()));
    }

    #[test]
    fn test_decode_skips_non_text_lines() {
        // No prefix
        assert_eq!(decode_line(""), None);
        assert_eq!(decode_line(": keep-alive"), None);
        assert_eq!(decode_line("event: message"), None);
        // Malformed JSON
        assert_eq!(decode_line("data: {not json"), None);
        // Empty and missing content
        assert_eq!(
            decode_line(r#"data: {"choices":[{"delta":{"content":""}}]}"#),
            None
        );
        assert_eq!(
            decode_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            None
        );
        assert_eq!(decode_line(r#"data: {"choices":[]}"#), None);
        assert_eq!(
            decode_line(r#"data: {"choices":[{"delta":{"content":null}}]}"#),
            None
        );
    }

    #[tokio::test]
    async fn test_decoder_stops_at_done() {
        let source = stream::iter(lines(&[
            r#"data: {"choices":[{"delta":{"content":"a"}}]}"#,
            "data: garbage",
            "",
            r#"data: {"choices":[{"delta":{"content":"b"}}]}"#,
            "data: [DONE]",
            r#"data: {"choices":[{"delta":{"content":"never"}}]}"#,
        ]));
        let mut decoder = StreamDecoder::new(source);

        assert_eq!(decoder.next_event().await.unwrap().unwrap().content, "a");
        assert_eq!(decoder.next_event().await.unwrap().unwrap().content, "b");
        assert!(decoder.next_event().await.unwrap().unwrap().is_terminal);
        assert!(decoder.next_event().await.is_none());
        assert!(decoder.is_finished());
    }

    #[tokio::test]
    async fn test_decoder_propagates_transport_errors() {
        let source = stream::iter(vec![
            Ok(r#"data: {"choices":[{"delta":{"content":"a"}}]}"#.to_string()),
            Err(TransportError::Connection("reset by peer".to_string())),
        ]);
        let mut decoder = StreamDecoder::new(source);

        assert!(decoder.next_event().await.unwrap().is_ok());
        assert!(matches!(
            decoder.next_event().await,
            Some(Err(TransportError::Connection(_)))
        ));
        assert!(decoder.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_decoder_ends_without_done() {
        let source = stream::iter(lines(&[r#"data: {"choices":[{"delta":{"content":"x"}}]}"#]));
        let mut decoder = StreamDecoder::new(source);

        assert_eq!(decoder.next_event().await.unwrap().unwrap().content, "x");
        assert!(decoder.next_event().await.is_none());
    }

    #[test]
    fn test_line_splitter_reassembles_chunks() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"data: he").is_empty());
        assert_eq!(splitter.push(b"llo\r\ndata: x\n\n"), vec!["data: hello", "data: x", ""]);
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_line_splitter_keeps_multibyte_chars_intact() {
        let text = "data: 한글\n";
        let bytes = text.as_bytes();
        // Split in the middle of the first Hangul syllable (3 bytes in UTF-8).
        let cut = "data: ".len() + 1;

        let mut splitter = LineSplitter::new();
        assert!(splitter.push(&bytes[..cut]).is_empty());
        assert_eq!(splitter.push(&bytes[cut..]), vec!["data: 한글"]);
    }

    #[test]
    fn test_line_splitter_finish_returns_tail() {
        let mut splitter = LineSplitter::new();
        splitter.push(b"data: [DONE]");
        assert_eq!(splitter.finish().as_deref(), Some("data: [DONE]"));
        assert_eq!(splitter.finish(), None);
    }
}
