//! Wire events emitted while a turn runs

use crate::db::PublicUser;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event on a message stream. `Done` and `Error` are terminal; exactly
/// one terminal event is delivered per stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Assistant text fragment
    Content { content: String },
    /// The model requested tool calls; names in dispatch order
    ToolStart { tools: Vec<String> },
    /// A tool invocation finished
    ToolResult {
        name: String,
        result: Value,
        trace: String,
    },
    /// A tool invocation could not be dispatched
    ToolError { name: String, error: String },
    /// The conversation was bound to a verified user
    Authenticated { user: PublicUser },
    /// The turn failed
    Error { error: String },
    /// The turn finished
    Done {},
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done {} | StreamEvent::Error { .. })
    }
}

/// Producer side of a message stream
pub type EventTx = tokio::sync::mpsc::Sender<StreamEvent>;

/// Send an event, ignoring a dropped receiver. A disconnected client stops
/// delivery but never the turn.
pub async fn emit(tx: &EventTx, event: StreamEvent) {
    if tx.send(event).await.is_err() {
        tracing::debug!("Stream receiver dropped; continuing turn");
    }
}
