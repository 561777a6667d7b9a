//! Chat model access
//!
//! A `ChatClient` performs one streaming round-trip against a
//! chat-completions style endpoint and yields decoded deltas.

mod error;
mod openai;
mod types;

pub use error::{LlmError, LlmErrorKind};
pub use openai::OpenAiClient;
pub use types::{
    ChatMessage, ChatRequest, StreamDelta, ToolCallBuilder, ToolCallFragment, ToolDefinition,
};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Decoded deltas for one model round-trip
pub type ChatStream = BoxStream<'static, Result<StreamDelta, LlmError>>;

/// Streaming chat endpoint seam
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChatStream, LlmError>;
}

#[async_trait]
impl<T: ChatClient + ?Sized> ChatClient for Arc<T> {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChatStream, LlmError> {
        (**self).stream_chat(request).await
    }
}
