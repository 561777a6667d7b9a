//! Request and streaming-delta types for chat-completions style models

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A transcript entry in the wire format the chat endpoint expects
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    /// Assistant turn that requested tool calls
    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Value) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.into()),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    /// Tool result turn, tied back to its originating call
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Typed tool declaration advertised to the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema for the tool input
    pub parameters: Value,
}

/// One model round-trip: transcript plus the tools the model may call.
/// An empty `tools` list disables tool calling for the round.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

/// Partial tool-call information carried by one stream delta. Fragments for
/// the same `index` belong to the same call; `arguments` chunks concatenate
/// in arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallFragment {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// One decoded stream chunk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamDelta {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallFragment>,
}

impl StreamDelta {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// Accumulates fragments for one tool call across a stream. The id is set by
/// the first fragment that carries one, the name follows the latest fragment,
/// and argument chunks append.
#[derive(Debug, Clone, Default)]
pub struct ToolCallBuilder {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCallBuilder {
    pub fn apply(&mut self, fragment: &ToolCallFragment) {
        if let Some(id) = &fragment.id {
            if self.id.is_empty() {
                self.id.clone_from(id);
            }
        }
        if let Some(name) = &fragment.name {
            self.name.clone_from(name);
        }
        if let Some(chunk) = &fragment.arguments {
            self.arguments.push_str(chunk);
        }
    }
}
