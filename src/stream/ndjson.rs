//! Newline-delimited JSON framing: one raw event per non-empty line.

use super::{RawEvent, RawEventStream, lines};
use crate::Error;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};

pub fn ndjson_events<S, E>(bytes: S) -> RawEventStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<Error> + Send + 'static,
{
    Box::pin(lines(bytes).filter_map(|line| async move {
        match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(Ok(RawEvent::data(line.trim()))),
            Err(e) => Some(Err(e)),
        }
    }))
}
