//! Tool port - capabilities the cell runtime exposes to its Mind.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::errors::ToolError;
use crate::domain::models::ToolSpec;

/// One invocable capability.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the tool input object.
    fn input_schema(&self) -> Value;

    /// Run the tool. The returned string becomes the tool_result content.
    async fn invoke(&self, input: Value) -> Result<String, ToolError>;

    /// The wire definition handed to the Mind.
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}
