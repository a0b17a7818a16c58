// ABOUTME: Test doubles for the provider contract.
// ABOUTME: MockProvider replays scripted responses; NullToolExecutor refuses every call.

use crate::event::{GenerateRequest, GenerateResponse, ToolCall, ToolResult};
use crate::traits::{Provider, ToolExecutor};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Provider that replays a queue of scripted responses and records every
/// request it receives. When the script runs dry it echoes the newest turn.
#[derive(Default)]
pub struct MockProvider {
    responses: Mutex<VecDeque<GenerateResponse>>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response to be returned by the next `generate` call.
    pub fn push_response(&self, resp: GenerateResponse) {
        self.responses.lock().unwrap().push_back(resp);
    }

    /// All requests seen so far, in call order.
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse> {
        let scripted = self.responses.lock().unwrap().pop_front();
        let resp = scripted.unwrap_or_else(|| {
            let last = req.turns.last().map(|t| t.content.as_str()).unwrap_or("");
            GenerateResponse::text_only(format!("mock: {last}"))
        });
        self.requests.lock().unwrap().push(req);
        Ok(resp)
    }
}

/// Tool executor for deployments without a tool runtime: every call fails
/// with a "not available" result so the provider can finish the turn.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullToolExecutor;

#[async_trait]
impl ToolExecutor for NullToolExecutor {
    async fn execute(&self, call: ToolCall) -> ToolResult {
        ToolResult {
            id: call.id,
            name: call.name,
            output: serde_json::json!({"error": "tool execution is not available"}),
            success: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChatTurn;

    #[tokio::test]
    async fn mock_provider_replays_script_then_echoes() {
        let provider = MockProvider::new();
        provider.push_response(GenerateResponse::text_only("scripted"));

        let req = GenerateRequest {
            model: "m".into(),
            system: None,
            turns: vec![ChatTurn::new("user", "hello")],
        };
        let first = provider.generate(req.clone()).await.unwrap();
        assert_eq!(first.text, "scripted");

        let second = provider.generate(req).await.unwrap();
        assert_eq!(second.text, "mock: hello");
        assert_eq!(provider.request_count(), 2);
    }

    #[tokio::test]
    async fn null_executor_reports_failure() {
        let result = NullToolExecutor
            .execute(ToolCall {
                id: "t1".into(),
                name: "web_search".into(),
                input: serde_json::json!({"q": "x"}),
            })
            .await;
        assert_eq!(result.id, "t1");
        assert!(!result.success);
    }
}
