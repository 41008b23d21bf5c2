//! Stream decoding: from raw protocol events to one assembled turn.
//!
//! Every backend goes through the same three stages:
//!
//! ```text
//! HTTP body bytes
//!     │  sse::sse_events() / ndjson::ndjson_events()      (framing)
//!     ▼
//! Stream<RawEvent>
//!     │  Decoder::decode()                                 (per backend)
//!     ▼
//! StreamEvent { TextDelta | ReasoningDelta | ToolCallDelta | ToolCall | Usage | Completed | Error }
//!     │  TurnAssembler::apply()
//!     ▼
//! Assembled
//! ```
//!
//! Framing re-joins lines split across network chunks. A decoder that cannot
//! make sense of one payload returns `Err`; the assembler counts it as a
//! skipped line and keeps reading. Only transport errors, cancellation and the
//! call deadline end a read early.

pub mod ndjson;
pub mod sse;

use crate::transport::CallGuard;
use crate::types::{ProgressCallback, TokenUsage, ToolCall, new_call_id};
use crate::text::{Scan, scan_balanced};
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use futures::stream::{Stream, StreamExt};
use std::collections::BTreeMap;
use std::pin::Pin;
use tracing::{debug, warn};

/// One framed protocol event: an SSE `event:`/`data:` pair or one NDJSON line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub event: Option<String>,
    pub data: String,
}

impl RawEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn typed(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    /// The literal `[DONE]` sentinel used by OpenAI-style streams.
    pub fn is_done_sentinel(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Lazy, finite, non-restartable sequence of raw events.
pub type RawEventStream = Pin<Box<dyn Stream<Item = Result<RawEvent>> + Send>>;

/// Backend-neutral streaming event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ReasoningDelta(String),
    /// Fragment of a tool call streamed incrementally, keyed by call index.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    /// A tool call delivered whole in one chunk.
    ToolCall(ToolCall),
    Usage(TokenUsage),
    /// Backend-assigned id for the response (continuation token candidate).
    ResponseId(String),
    Completed {
        status: Option<String>,
        finish_reason: Option<String>,
    },
    Error(String),
}

/// Per-backend translation of raw events into [`StreamEvent`]s.
pub trait Decoder: Send {
    /// Decode one raw event. `Err` marks the payload as malformed; it is skipped.
    fn decode(&mut self, raw: &RawEvent) -> Result<Vec<StreamEvent>>;
}

/// Longest line kept in memory while waiting for its newline.
pub(crate) const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Split a byte stream into lines, buffering partial lines across chunks.
///
/// Splitting on `\n` is safe for UTF-8: continuation bytes never equal 0x0A.
/// A trailing `\r` is removed. A final unterminated line is yielded at EOF.
/// A line longer than [`MAX_LINE_BYTES`] ends the stream with an error.
pub(crate) fn lines<S, E>(bytes: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<Error> + Send + 'static,
{
    capped_lines(bytes, MAX_LINE_BYTES)
}

fn capped_lines<S, E>(bytes: S, max_line: usize) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<Error> + Send + 'static,
{
    futures::stream::unfold(
        (Box::pin(bytes), BytesMut::with_capacity(8192), false),
        move |(mut bytes, mut buffer, mut done)| async move {
            loop {
                if let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let mut line = buffer.split_to(pos + 1);
                    line.truncate(pos);
                    if line.last() == Some(&b'\r') {
                        line.truncate(line.len() - 1);
                    }
                    let text = String::from_utf8_lossy(&line).into_owned();
                    return Some((Ok(text), (bytes, buffer, done)));
                }
                if buffer.len() > max_line {
                    let len = buffer.len();
                    buffer.clear();
                    let err = Error::stream(format!(
                        "line exceeds {max_line} bytes without a newline ({len} buffered)"
                    ));
                    return Some((Err(err), (bytes, buffer, true)));
                }
                if done {
                    if buffer.is_empty() {
                        return None;
                    }
                    let rest = buffer.split();
                    let text = String::from_utf8_lossy(&rest)
                        .trim_end_matches('\r')
                        .to_string();
                    return Some((Ok(text), (bytes, buffer, done)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(e.into()), (bytes, buffer, true))),
                    None => done = true,
                }
            }
        },
    )
}

/// Converts cumulative text snapshots into deltas.
///
/// Some backends resend the whole answer so far in every chunk. Diffing
/// against the previous length keeps observers and the accumulator free of
/// duplicates.
#[derive(Debug, Default)]
pub struct CumulativeText {
    seen: usize,
}

impl CumulativeText {
    pub fn new() -> Self {
        Self::default()
    }

    /// The part of `full` not yet reported, if any.
    pub fn delta(&mut self, full: &str) -> Option<String> {
        if full.len() <= self.seen {
            return None;
        }
        let mut start = self.seen;
        while !full.is_char_boundary(start) {
            start -= 1;
        }
        self.seen = full.len();
        let delta = &full[start..];
        (!delta.is_empty()).then(|| delta.to_string())
    }
}

/// Accumulates incremental tool-call deltas into complete calls.
///
/// Deltas are keyed by the backend-provided call index. The name is taken
/// from the first delta that carries one; argument fragments are appended in
/// arrival order and only parsed in [`ToolCallAccumulator::finish`].
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<usize, PartialToolCall>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: usize, id: Option<String>, name: Option<String>, arguments: &str) {
        let entry = self.calls.entry(index).or_default();
        if entry.id.is_none() {
            entry.id = id.filter(|s| !s.is_empty());
        }
        if entry.name.is_none() {
            entry.name = name.filter(|s| !s.is_empty());
        }
        entry.arguments.push_str(arguments);
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Finalize every call. Argument buffers whose braces never balance
    /// report `Truncated` with `partial_text` as the salvaged prefix.
    pub fn finish(self, partial_text: &str) -> Result<Vec<ToolCall>> {
        let mut out = Vec::with_capacity(self.calls.len());
        for (index, partial) in self.calls {
            let Some(name) = partial.name else {
                debug!(index, "Dropping streamed tool call without a name");
                continue;
            };
            let arguments = partial.arguments.trim();
            let arguments = if arguments.is_empty() {
                "{}".to_string()
            } else if serde_json::from_str::<serde_json::Value>(arguments).is_ok() {
                arguments.to_string()
            } else {
                let unterminated = match arguments.find(['{', '[']) {
                    Some(open) => scan_balanced(arguments, open) == Scan::Unterminated,
                    None => true,
                };
                if unterminated {
                    warn!(tool = %name, "Streamed tool call arguments never closed");
                    return Err(Error::Truncated {
                        partial: partial_text.to_string(),
                    });
                }
                return Err(Error::stream(format!(
                    "Failed to parse arguments for tool call '{name}'"
                )));
            };
            let id = partial.id.unwrap_or_else(new_call_id);
            out.push(ToolCall::native(id, name, arguments));
        }
        Ok(out)
    }
}

/// Everything read from one response stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assembled {
    pub text: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
    pub response_id: Option<String>,
    pub status: Option<String>,
    pub finish_reason: Option<String>,
    /// Error reported inside the stream by the backend.
    pub error: Option<String>,
    /// A completion marker was seen.
    pub completed: bool,
    pub skipped_lines: usize,
}

impl Assembled {
    pub fn has_content(&self) -> bool {
        !self.text.trim().is_empty() || !self.tool_calls.is_empty()
    }
}

/// Folds [`StreamEvent`]s into an [`Assembled`] turn.
pub struct TurnAssembler {
    out: Assembled,
    pending: ToolCallAccumulator,
    progress: Option<ProgressCallback>,
}

impl TurnAssembler {
    pub fn new(progress: Option<ProgressCallback>) -> Self {
        Self {
            out: Assembled::default(),
            pending: ToolCallAccumulator::new(),
            progress,
        }
    }

    /// Apply one event. Returns `false` once the stream is finished.
    pub fn apply(&mut self, event: StreamEvent) -> bool {
        match event {
            StreamEvent::TextDelta(delta) => {
                if delta.is_empty() {
                    return true;
                }
                if let Some(progress) = &self.progress {
                    progress(&delta);
                }
                self.out.text.push_str(&delta);
            }
            StreamEvent::ReasoningDelta(delta) => self.out.reasoning.push_str(&delta),
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => self.pending.push(index, id, name, &arguments),
            StreamEvent::ToolCall(call) => self.out.tool_calls.push(call),
            StreamEvent::Usage(usage) => self.out.usage = Some(usage.normalized()),
            StreamEvent::ResponseId(id) => self.out.response_id = Some(id),
            StreamEvent::Completed {
                status,
                finish_reason,
            } => {
                if status.is_some() {
                    self.out.status = status;
                }
                if finish_reason.is_some() {
                    self.out.finish_reason = finish_reason;
                }
                self.out.completed = true;
                return false;
            }
            StreamEvent::Error(message) => {
                self.out.error = Some(message);
                return false;
            }
        }
        true
    }

    pub fn skip(&mut self) {
        self.out.skipped_lines += 1;
    }

    pub fn finish(self) -> Result<Assembled> {
        let mut out = self.out;
        let streamed = self.pending.finish(&out.text)?;
        out.tool_calls.extend(streamed);
        Ok(out)
    }
}

/// Read `raw` to completion through `decoder`, honoring cancellation and the deadline.
pub async fn assemble(
    mut raw: RawEventStream,
    decoder: &mut dyn Decoder,
    guard: &CallGuard,
    progress: Option<ProgressCallback>,
) -> Result<Assembled> {
    let mut assembler = TurnAssembler::new(progress);

    'read: while let Some(item) = guard.run(raw.next()).await? {
        let event = item?;
        match decoder.decode(&event) {
            Ok(events) => {
                for decoded in events {
                    if !assembler.apply(decoded) {
                        break 'read;
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, data = %crate::text::excerpt(&event.data, 200), "Skipping malformed stream line");
                assembler.skip();
            }
        }
    }

    assembler.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_stream(chunks: &[&str]) -> impl Stream<Item = std::result::Result<Bytes, Error>> + Send + 'static {
        let owned: Vec<std::result::Result<Bytes, Error>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from(c.to_string())))
            .collect();
        futures::stream::iter(owned)
    }

    #[tokio::test]
    async fn test_lines_rejoin_across_chunks() {
        let collected: Vec<String> = lines(byte_stream(&["{\"a\":", "1}\n{\"b\"", ":2}\r\n", "tail"]))
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(collected, vec!["{\"a\":1}", "{\"b\":2}", "tail"]);
    }

    #[tokio::test]
    async fn test_lines_split_inside_multibyte_char() {
        let bytes = "молоко\n".as_bytes();
        let (head, tail) = bytes.split_at(3);
        let chunks: Vec<std::result::Result<Bytes, Error>> = vec![
            Ok(Bytes::copy_from_slice(head)),
            Ok(Bytes::copy_from_slice(tail)),
        ];
        let collected: Vec<String> = lines(futures::stream::iter(chunks))
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(collected, vec!["молоко"]);
    }

    #[tokio::test]
    async fn test_lines_overlong_line_ends_stream() {
        let collected: Vec<Result<String>> =
            capped_lines(byte_stream(&["ok\n", "0123456789", "abcdef", "never\n"]), 8)
                .collect()
                .await;
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0].as_ref().unwrap(), "ok");
        assert!(matches!(collected[1], Err(Error::Stream(_))));
    }

    #[test]
    fn test_cumulative_text_yields_only_new_suffix() {
        let mut cumulative = CumulativeText::new();
        assert_eq!(cumulative.delta("Hel"), Some("Hel".to_string()));
        assert_eq!(cumulative.delta("Hello"), Some("lo".to_string()));
        assert_eq!(cumulative.delta("Hello"), None);
        assert_eq!(cumulative.delta("Hello, мир"), Some(", мир".to_string()));
    }

    #[test]
    fn test_accumulator_interleaved_calls() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(0, Some("call_1".into()), Some("search".into()), "");
        acc.push(1, Some("call_2".into()), Some("calculate".into()), "");
        acc.push(0, None, None, "{\"q\"");
        acc.push(1, None, None, "{\"expr\"");
        acc.push(0, None, None, ":\"rust\"}");
        acc.push(1, None, None, ":\"2+2\"}");

        let calls = acc.finish("").unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].arguments, "{\"q\":\"rust\"}");
        assert_eq!(calls[1].id, "call_2");
        assert!(!calls[0].recovered_from_text);
    }

    #[test]
    fn test_accumulator_empty_arguments_become_object() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(0, None, Some("ping".into()), "");
        let calls = acc.finish("").unwrap();
        assert_eq!(calls[0].arguments, "{}");
        assert!(calls[0].id.starts_with("call_"));
    }

    #[test]
    fn test_accumulator_detects_truncated_arguments() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(0, Some("c".into()), Some("lookup".into()), "{\"id\": 7, \"tags\": [\"a\"");
        let err = acc.finish("before the call").unwrap_err();
        match err {
            Error::Truncated { partial } => assert_eq!(partial, "before the call"),
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[test]
    fn test_accumulator_balanced_garbage_is_stream_error() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(0, Some("c".into()), Some("lookup".into()), "{id: 7}");
        assert!(matches!(acc.finish(""), Err(Error::Stream(_))));
    }

    #[test]
    fn test_assembler_reports_progress_and_stops_on_completion() {
        use std::sync::{Arc, Mutex};

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut assembler = TurnAssembler::new(Some(Arc::new(move |d: &str| {
            sink.lock().unwrap().push(d.to_string())
        })));

        assert!(assembler.apply(StreamEvent::TextDelta("4".into())));
        assert!(assembler.apply(StreamEvent::Usage(TokenUsage::new(3, 1))));
        assert!(!assembler.apply(StreamEvent::Completed {
            status: None,
            finish_reason: Some("stop".into())
        }));

        let out = assembler.finish().unwrap();
        assert_eq!(out.text, "4");
        assert!(out.completed);
        assert_eq!(out.usage.unwrap().total_tokens, 4);
        assert_eq!(*seen.lock().unwrap(), vec!["4".to_string()]);
    }

    #[test]
    fn test_assembler_stops_on_error_event() {
        let mut assembler = TurnAssembler::new(None);
        assert!(!assembler.apply(StreamEvent::Error("quota exceeded".into())));
        let out = assembler.finish().unwrap();
        assert_eq!(out.error.as_deref(), Some("quota exceeded"));
        assert!(!out.has_content());
    }
}
