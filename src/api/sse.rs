//! Event stream adapter
//!
//! Wraps the orchestrator's event channel as an SSE response: delivered
//! events get monotonically increasing ids starting at 1, exactly one
//! terminal event closes the stream, and a `done` is synthesized when the
//! producer finishes without one.

use crate::orchestrator::StreamEvent;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::future;
use futures::stream::Stream;
use futures::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub fn stream_events(
    rx: mpsc::Receiver<StreamEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = numbered_events(rx).map(|(id, event)| Ok(to_sse_event(id, &event)));
    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Number events from 1 and end the stream at the first terminal event.
/// Producer-side events after the terminal are dropped; a producer that
/// goes away without a terminal gets a synthesized `done`.
fn numbered_events(rx: mpsc::Receiver<StreamEvent>) -> impl Stream<Item = (u64, StreamEvent)> {
    ReceiverStream::new(rx)
        .chain(futures::stream::once(async { StreamEvent::Done {} }))
        .scan(false, |terminated, event| {
            if *terminated {
                return future::ready(None);
            }
            *terminated = event.is_terminal();
            future::ready(Some(event))
        })
        .enumerate()
        .map(|(i, event)| (i as u64 + 1, event))
}

fn to_sse_event(id: u64, event: &StreamEvent) -> Event {
    let data = serde_json::to_value(event)
        .unwrap_or_else(|_| json!({"type": "error", "error": "event serialization failed"}));
    let event_type = data
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("message")
        .to_string();
    Event::default()
        .id(id.to_string())
        .event(event_type)
        .data(data.to_string())
}
