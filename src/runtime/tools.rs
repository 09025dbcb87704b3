//! Tool registry and built-in tools.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::domain::errors::ToolError;
use crate::domain::models::envelope::inbox_subject;
use crate::domain::models::{Envelope, ToolSpec};
use crate::domain::ports::{Bus, Tool};

/// Named set of tools a cell may expose to its Mind.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the side-effect-free built-ins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(CurrentTimeTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Wire definitions for the named tools, skipping unknown names.
    pub fn specs_for(&self, names: &[String]) -> Vec<ToolSpec> {
        names
            .iter()
            .filter_map(|name| self.tools.get(name).map(|tool| tool.spec()))
            .collect()
    }

    pub async fn invoke(&self, name: &str, input: Value) -> Result<String, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        tool.invoke(input).await
    }
}

// ============================================================================
// Built-ins
// ============================================================================

/// Echoes its input back; the canonical loop-exercising tool.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn invoke(&self, input: Value) -> Result<String, ToolError> {
        let text = input
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidInput {
                tool: "echo".to_string(),
                reason: "missing 'text'".to_string(),
            })?;
        Ok(format!("Echo: {text}"))
    }
}

pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Current UTC time in RFC 3339 format"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn invoke(&self, _input: Value) -> Result<String, ToolError> {
        Ok(chrono::Utc::now().to_rfc3339())
    }
}

/// Sends a message to another cell's inbox, enforcing the formation
/// topology: destinations outside the routing entry are refused.
pub struct SendMessageTool {
    from_cell: String,
    namespace: String,
    bus: Arc<dyn Bus>,
    /// Allowed destinations; `None` until (unless) a routing table is
    /// loaded, which means unrestricted.
    allowed: Arc<Mutex<Option<Vec<String>>>>,
}

impl SendMessageTool {
    pub fn new(
        from_cell: String,
        namespace: String,
        bus: Arc<dyn Bus>,
        allowed: Arc<Mutex<Option<Vec<String>>>>,
    ) -> Self {
        Self { from_cell, namespace, bus, allowed }
    }
}

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        "send_message"
    }

    fn description(&self) -> &str {
        "Send a message to another cell in the formation"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "to": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["to", "content"]
        })
    }

    async fn invoke(&self, input: Value) -> Result<String, ToolError> {
        let to = input
            .get("to")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidInput {
                tool: "send_message".to_string(),
                reason: "missing 'to'".to_string(),
            })?;
        let content = input
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidInput {
                tool: "send_message".to_string(),
                reason: "missing 'content'".to_string(),
            })?;

        // Topology enforcement at send time.
        let routed = self
            .allowed
            .lock()
            .map(|allowed| match allowed.as_ref() {
                Some(destinations) => destinations.iter().any(|d| d == to),
                None => true,
            })
            .unwrap_or(false);
        if !routed {
            return Err(ToolError::DestinationNotRouted(to.to_string()));
        }

        let envelope = Envelope::message(&self.from_cell, to, content);
        self.bus
            .publish(&inbox_subject(&self.namespace, to), &envelope)
            .await
            .map_err(|e| ToolError::Failed {
                tool: "send_message".to_string(),
                reason: e.to_string(),
            })?;
        Ok(format!("sent to {to}"))
    }
}
