// ABOUTME: Request/response types exchanged with LLM providers.
// ABOUTME: Chat turns, tool calls/results, and usage accounting.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single turn of conversation context passed to the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatTurn {
    /// "user", "assistant", or "tool"
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// A tool invocation requested by the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Unique identifier for this invocation
    pub id: String,
    /// Tool name (e.g., "web_search")
    pub name: String,
    /// Full input passed to the tool
    pub input: Value,
}

/// The outcome of executing one tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    /// Matches the id from the originating ToolCall
    pub id: String,
    pub name: String,
    pub output: Value,
    pub success: bool,
}

/// Token usage and cost tracking.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: Option<f64>,
}

/// One generation round sent to a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerateRequest {
    pub model: String,
    pub system: Option<String>,
    /// Conversation context in chronological order, ending with the newest turn.
    pub turns: Vec<ChatTurn>,
}

/// A provider's answer for one round: either final text, or a set of tool
/// calls the caller should execute and feed back.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenerateResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
}

impl GenerateResponse {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}
