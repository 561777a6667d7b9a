//! Tool registry and dispatcher
//!
//! Tools are typed capabilities the model can call during a turn. The
//! registry resolves calls by name, enforces the authentication gate, and
//! folds capability failures into the invocation result so a broken tool
//! never aborts a turn.

mod knowledge;
mod shopping;

pub use knowledge::{KnowledgeBase, SearchKnowledgeTool, SqliteKnowledgeBase};
pub use shopping::{CreateShoppingRequestTool, GetUserRequestsTool};

use crate::db::User;
use crate::llm::ToolDefinition;
use crate::orchestrator::ToolDispatcher;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

/// A capability the model can invoke
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as exposed to the model
    fn name(&self) -> &str;

    /// Tool description for the model
    fn description(&self) -> String;

    /// JSON schema for the tool input
    fn input_schema(&self) -> Value;

    /// Whether the caller must be an authenticated user
    fn requires_auth(&self) -> bool {
        false
    }

    /// Execute the tool. An `Err` is a capability failure and becomes an
    /// `{"error": …}` result payload.
    async fn run(&self, args: Value, caller: Option<&User>) -> Result<Value, String>;
}

/// A finished invocation: the result payload plus its trace string
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub result: Value,
    pub trace: String,
}

/// Dispatch failures that surface as `tool_error` events
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Tool '{0}' requires an authenticated user")]
    AuthenticationRequired(String),
}

/// Registry of available tools
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    fn find(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolDispatcher for ToolRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description(),
                parameters: t.input_schema(),
            })
            .collect()
    }

    async fn dispatch(
        &self,
        name: &str,
        args: Value,
        caller: Option<&User>,
    ) -> Result<ToolInvocation, DispatchError> {
        let mut trace = invocation_trace(name, &args);

        let Some(tool) = self.find(name) else {
            tracing::warn!(tool = %name, trace = %trace, "Model requested an unregistered tool");
            return Err(DispatchError::UnknownTool(name.to_string()));
        };

        if tool.requires_auth() && caller.is_none() {
            tracing::warn!(tool = %name, trace = %trace, "Unauthenticated call to a gated tool");
            return Err(DispatchError::AuthenticationRequired(name.to_string()));
        }

        match tool.run(args, caller).await {
            Ok(result) => {
                trace.push_str(&format!(
                    "\nResult: {}",
                    serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string())
                ));
                tracing::info!(tool = %name, "Tool executed");
                Ok(ToolInvocation { result, trace })
            }
            Err(message) => {
                trace.push_str(&format!("\nError: {message}"));
                tracing::warn!(tool = %name, error = %message, "Tool failed");
                Ok(ToolInvocation {
                    result: json!({ "error": message }),
                    trace,
                })
            }
        }
    }
}

/// Trace header shared by every dispatch outcome
fn invocation_trace(name: &str, args: &Value) -> String {
    format!(
        "Executing tool: {name}\nArguments: {}",
        serde_json::to_string_pretty(args).unwrap_or_else(|_| args.to_string())
    )
}
