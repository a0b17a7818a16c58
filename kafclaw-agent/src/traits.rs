// ABOUTME: Core Provider trait every LLM backend implements, plus ToolExecutor.
// ABOUTME: One generate() call is one round; tool loops are driven by the caller.

use crate::event::{GenerateRequest, GenerateResponse, ToolCall, ToolResult};
use anyhow::Result;
use async_trait::async_trait;

/// A conversational LLM backend.
///
/// Implementations own their transport (HTTP API, local process, mock). A
/// `generate` call performs exactly one round; when the response carries tool
/// calls, the caller executes them and issues a follow-up round with the
/// results appended to `turns`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Backend name for logging and metrics
    fn name(&self) -> &'static str;

    /// Run one generation round.
    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse>;
}

/// Executes tool calls requested by a provider.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: ToolCall) -> ToolResult;
}
