//! Tool invocation boundary between the remote voice model and the
//! application layer.
//!
//! The remote may invoke declared tools mid-conversation; every invocation
//! requires exactly one result back before the remote continues reasoning
//! about that call. Handler failures degrade to a generic acknowledgment
//! rather than failing the whole turn.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result relayed when the application handler errors: the remote model
/// degrades gracefully instead of erroring the turn.
pub const FALLBACK_TOOL_RESULT: &str = "Task triggered.";

/// A callable function declared to the remote session at open time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    /// Tool name the remote uses to invoke it.
    pub name: String,
    /// Natural-language description of what the tool does.
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub parameters: serde_json::Value,
}

/// A structured function-invocation request emitted by the remote model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Invocation id; the result must echo it.
    pub id: String,
    /// Declared tool name.
    pub name: String,
    /// Arguments as free-form JSON.
    pub args: serde_json::Value,
}

/// Application-layer handler for tool invocations.
///
/// Implemented by the research/vault subsystem; a `research_topic` call is
/// forwarded to the application's search trigger and the returned string is
/// relayed as the tool result.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Handle one invocation and produce its result string.
    ///
    /// # Errors
    ///
    /// Any error is absorbed by the engine, which relays
    /// [`FALLBACK_TOOL_RESULT`] instead.
    async fn handle(&self, invocation: &ToolInvocation) -> anyhow::Result<String>;
}

/// Declaration for the research trigger tool the concierge registers.
pub fn research_topic_declaration() -> ToolDeclaration {
    ToolDeclaration {
        name: "research_topic".into(),
        description: "Triggers research for a specific topic.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "topic": { "type": "string" }
            },
            "required": ["topic"]
        }),
    }
}
