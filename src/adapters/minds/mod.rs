//! Mind adapters - LLM provider implementations behind the `Mind` port.

pub mod anthropic;
pub mod mock;
pub mod pricing;
pub mod registry;

pub use anthropic::{AnthropicConfig, AnthropicMind};
pub use mock::{MockMind, ScriptedTurn};
pub use registry::MindRegistry;
