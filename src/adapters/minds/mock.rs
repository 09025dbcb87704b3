//! Scripted Mind for tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::errors::MindError;
use crate::domain::models::{ContentBlock, StopReason, ThinkRequest, ThinkResponse, TokenUsage};

/// One canned turn.
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub cost: f64,
    /// When set, the call fails with this error message instead.
    pub error: Option<String>,
}

impl ScriptedTurn {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(content)],
            stop_reason: StopReason::EndTurn,
            cost: 0.001,
            error: None,
        }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            content: vec![ContentBlock::ToolUse {
                id: id.into(),
                name: name.into(),
                input,
            }],
            stop_reason: StopReason::ToolUse,
            cost: 0.001,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            content: Vec::new(),
            stop_reason: StopReason::EndTurn,
            cost: 0.0,
            error: Some(message.into()),
        }
    }

    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// Mind that replays a FIFO of scripted turns.
///
/// An exhausted script answers with a fixed fallback turn so tests fail on
/// assertions rather than hangs.
pub struct MockMind {
    script: Mutex<VecDeque<ScriptedTurn>>,
    calls: AtomicU32,
}

impl MockMind {
    pub fn new(turns: Vec<ScriptedTurn>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(turns.into()),
            calls: AtomicU32::new(0),
        })
    }

    pub fn empty() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub async fn push(&self, turn: ScriptedTurn) {
        self.script.lock().await.push_back(turn);
    }

    /// How many times `think` was invoked.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl crate::domain::ports::Mind for MockMind {
    fn name(&self) -> &str {
        "mock"
    }

    async fn think(&self, request: ThinkRequest) -> Result<ThinkResponse, MindError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let turn = self.script.lock().await.pop_front().unwrap_or_else(|| ScriptedTurn {
            content: vec![ContentBlock::text("[mock] script exhausted")],
            stop_reason: StopReason::EndTurn,
            cost: 0.0,
            error: None,
        });

        if let Some(message) = turn.error {
            return Err(MindError::Api { status: 500, message });
        }

        Ok(ThinkResponse {
            content: turn.content,
            stop_reason: turn.stop_reason,
            usage: TokenUsage { input_tokens: 100, output_tokens: 50 },
            model: request.model.unwrap_or_else(|| "mock".to_string()),
            cost: turn.cost,
        })
    }
}
