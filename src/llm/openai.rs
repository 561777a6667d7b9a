//! `OpenAI`-compatible streaming chat client
//!
//! Sends a chat-completions request with `stream: true` and decodes the SSE
//! body into `StreamDelta`s: content fragments plus per-index tool-call
//! fragments.

use super::types::{ChatRequest, StreamDelta, ToolCallFragment, ToolDefinition};
use super::{ChatClient, ChatStream, LlmError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Streaming client for `OpenAI` and compatible gateways
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    endpoint: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(api_key: String, base_url: Option<&str>, model: String) -> Self {
        let base = base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/');
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key,
            endpoint: format!("{base}/chat/completions"),
            model,
        }
    }
}

#[async_trait]
impl ChatClient for OpenAiClient {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChatStream, LlmError> {
        let wire = WireRequest {
            model: &self.model,
            messages: &request.messages,
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(request.tools.iter().map(WireTool::function).collect())
            },
            stream: true,
        };

        tracing::debug!(
            endpoint = %self.endpoint,
            model = %self.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Sending chat request"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&wire)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::network(format!("Request timeout: {e}"))
                } else if e.is_connect() {
                    LlmError::network(format!("Connection failed: {e}"))
                } else {
                    LlmError::unknown(format!("Request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .map_err(|e| LlmError::network(format!("Failed to read response: {e}")))?;
            return Err(match status.as_u16() {
                401 | 403 => LlmError::auth(format!("Authentication failed: {body}")),
                429 => LlmError::rate_limit(format!("Rate limit exceeded: {body}")),
                400 => LlmError::invalid_request(format!("Invalid request: {body}")),
                500..=599 => LlmError::server_error(format!("Server error: {body}")),
                _ => LlmError::unknown(format!("HTTP {status}: {body}")),
            });
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();
        Ok(decode_sse(bytes))
    }
}

/// Decode an SSE byte stream into chat deltas
fn decode_sse(bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>) -> ChatStream {
    let decoder = SseDecoder {
        inner: bytes,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };
    futures::stream::unfold(decoder, |mut decoder| async move {
        decoder.next_delta().await.map(|item| (item, decoder))
    })
    .boxed()
}

struct SseDecoder {
    inner: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    /// Raw bytes not yet terminated by a newline. Split only at newlines so
    /// multi-byte characters straddling network chunks stay intact.
    buffer: Vec<u8>,
    pending: VecDeque<StreamDelta>,
    finished: bool,
}

impl SseDecoder {
    async fn next_delta(&mut self) -> Option<Result<StreamDelta, LlmError>> {
        loop {
            if let Some(delta) = self.pending.pop_front() {
                return Some(Ok(delta));
            }
            if self.finished {
                return None;
            }

            match self.inner.next().await {
                None => {
                    self.finished = true;
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(LlmError::network(format!("Stream interrupted: {e}"))));
                }
                Some(Ok(chunk)) => {
                    self.buffer.extend_from_slice(&chunk);
                    self.drain_lines();
                }
            }
        }
    }

    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop(); // newline
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            let Some(payload) = line.strip_prefix("data:") else {
                continue; // comments and blank keep-alive lines
            };
            let payload = payload.trim();
            if payload == "[DONE]" {
                self.finished = true;
                continue;
            }
            if let Some(delta) = parse_chunk(payload) {
                self.pending.push_back(delta);
            }
        }
    }
}

/// Parse one `data:` frame. Unparseable frames are logged and skipped.
fn parse_chunk(payload: &str) -> Option<StreamDelta> {
    let chunk: ChatChunk = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::warn!(error = %e, "Skipping malformed stream frame");
            return None;
        }
    };

    let choice = chunk.choices.into_iter().next()?;
    let tool_calls = choice
        .delta
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| ToolCallFragment {
            index: call.index,
            id: call.id,
            name: call.function.as_ref().and_then(|f| f.name.clone()),
            arguments: call.function.and_then(|f| f.arguments),
        })
        .collect();

    Some(StreamDelta {
        content: choice.delta.content.filter(|c| !c.is_empty()),
        tool_calls,
    })
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [super::types::ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool<'a>>>,
    stream: bool,
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: &'a ToolDefinition,
}

impl<'a> WireTool<'a> {
    fn function(def: &'a ToolDefinition) -> Self {
        Self {
            kind: "function",
            function: def,
        }
    }
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Deserialize)]
struct ChunkToolCall {
    index: u32,
    id: Option<String>,
    function: Option<ChunkFunction>,
}

#[derive(Deserialize)]
struct ChunkFunction {
    name: Option<String>,
    arguments: Option<String>,
}
