//! Request/response types for the `Mind` port (LLM provider seam).
//!
//! The shapes mirror a messages-style chat API: a system prompt, a list of
//! role-tagged messages whose content is a sequence of blocks, tool
//! definitions, and a stop reason describing why generation ended.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool the model may call during a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One content block inside a chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// The textual rendering of this block, used when flattening a message
    /// for summaries and logs.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::ToolResult { content, .. } => Some(content),
            Self::ToolUse { .. } => None,
        }
    }
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in the conversation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// Concatenated text of every text-bearing block.
    pub fn flat_text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EndTurn => write!(f, "end_turn"),
            Self::ToolUse => write!(f, "tool_use"),
            Self::MaxTokens => write!(f, "max_tokens"),
        }
    }
}

/// Token counts for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub const fn total(self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Input to `Mind::think`.
#[derive(Debug, Clone)]
pub struct ThinkRequest {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub temperature: Option<f32>,
    pub max_tokens: u32,
    pub model: Option<String>,
}

impl ThinkRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            system: None,
            messages,
            tools: Vec::new(),
            temperature: None,
            max_tokens: 4096,
            model: None,
        }
    }

    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }
}

/// Output of `Mind::think`.
#[derive(Debug, Clone)]
pub struct ThinkResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
    pub model: String,
    /// Monetary cost of this call as computed by the provider adapter's
    /// price table. Unknown models price at zero.
    pub cost: f64,
}

impl ThinkResponse {
    /// Concatenated assistant text, ignoring tool-use blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// All tool-use blocks in this turn, in order.
    pub fn tool_calls(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_block_tagging() {
        let block = ContentBlock::ToolUse {
            id: "tu_1".to_string(),
            name: "echo".to_string(),
            input: serde_json::json!({ "text": "ping" }),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_use");

        let parsed: ContentBlock = serde_json::from_value(json).unwrap();
        assert!(matches!(parsed, ContentBlock::ToolUse { .. }));
    }

    #[test]
    fn test_response_accessors() {
        let response = ThinkResponse {
            content: vec![
                ContentBlock::text("thinking"),
                ContentBlock::ToolUse {
                    id: "tu_1".to_string(),
                    name: "echo".to_string(),
                    input: serde_json::json!({}),
                },
            ],
            stop_reason: StopReason::ToolUse,
            usage: TokenUsage { input_tokens: 10, output_tokens: 5 },
            model: "test".to_string(),
            cost: 0.0,
        };
        assert_eq!(response.text(), "thinking");
        assert_eq!(response.tool_calls().len(), 1);
        assert_eq!(response.usage.total(), 15);
    }
}
