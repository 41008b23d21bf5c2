//! Server-Sent Events framing.
//!
//! Backends do not agree on field order: most send `event:` before `data:`,
//! some send the payload first and the type after it. [`SsePairing`] pairs the
//! two in either order. A payload that never receives a type is flushed as an
//! untyped event at the next blank line, at the next payload, or at end of
//! stream. Consecutive `data:` lines are emitted as separate events, which is
//! what every supported backend means by them.

use super::{RawEvent, RawEventStream, lines};
use crate::{Error, Result};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::collections::VecDeque;

/// Line-level state machine pairing `event:` and `data:` fields.
#[derive(Debug, Default)]
pub struct SsePairing {
    event: Option<String>,
    data: Option<String>,
}

impl SsePairing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without the trailing newline). Returns completed events.
    pub fn push_line(&mut self, line: &str) -> Vec<RawEvent> {
        let mut out = Vec::new();

        if line.trim().is_empty() {
            self.event = None;
            out.extend(self.flush());
            return out;
        }
        if line.starts_with(':') {
            return out;
        }

        if let Some(payload) = field(line, "data") {
            match self.event.take() {
                Some(event) => out.push(RawEvent::typed(event, payload)),
                None => {
                    out.extend(self.flush());
                    self.data = Some(payload.to_string());
                }
            }
        } else if let Some(event) = field(line, "event") {
            match self.data.take() {
                Some(data) => out.push(RawEvent::typed(event, data)),
                None => self.event = Some(event.to_string()),
            }
        }
        // `id:`, `retry:` and unknown fields are ignored.
        out
    }

    /// Emit whatever payload is still pending.
    pub fn flush(&mut self) -> Option<RawEvent> {
        self.data.take().map(RawEvent::data)
    }
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Frame an HTTP body as SSE events.
pub fn sse_events<S, E>(bytes: S) -> RawEventStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<Error> + Send + 'static,
{
    let state = (
        Box::pin(lines(bytes)),
        SsePairing::new(),
        VecDeque::<Result<RawEvent>>::new(),
        false,
    );
    let stream = futures::stream::unfold(
        state,
        |(mut source, mut pairing, mut queue, mut done)| async move {
            loop {
                if let Some(item) = queue.pop_front() {
                    return Some((item, (source, pairing, queue, done)));
                }
                if done {
                    return None;
                }
                match source.next().await {
                    Some(Ok(line)) => queue.extend(pairing.push_line(&line).into_iter().map(Ok)),
                    Some(Err(e)) => {
                        queue.push_back(Err(e));
                        done = true;
                    }
                    None => {
                        queue.extend(pairing.flush().map(Ok));
                        done = true;
                    }
                }
            }
        },
    );
    Box::pin(stream)
}
