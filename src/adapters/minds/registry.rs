//! Provider selection for Mind adapters.

use std::sync::Arc;

use crate::domain::errors::MindError;
use crate::domain::ports::Mind;

use super::anthropic::{AnthropicConfig, AnthropicMind};
use super::mock::MockMind;

/// Instantiate the Mind named by a cell's `spec.mind.provider`.
pub struct MindRegistry {
    anthropic: AnthropicConfig,
}

impl MindRegistry {
    pub fn new(anthropic: AnthropicConfig) -> Self {
        Self { anthropic }
    }

    pub fn create(&self, provider: &str) -> Result<Arc<dyn Mind>, MindError> {
        match provider {
            "anthropic" => {
                let mind = AnthropicMind::new(self.anthropic.clone())?;
                Ok(Arc::new(mind))
            }
            "mock" => Ok(MockMind::empty()),
            other => Err(MindError::InvalidResponse(format!("unknown mind provider '{other}'"))),
        }
    }

    pub fn available_providers() -> Vec<&'static str> {
        vec!["anthropic", "mock"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provider_rejected() {
        let registry = MindRegistry::new(AnthropicConfig::default());
        assert!(registry.create("gpt-nowhere").is_err());
    }

    #[test]
    fn test_mock_provider_available() {
        let registry = MindRegistry::new(AnthropicConfig::default());
        let mind = registry.create("mock").unwrap();
        assert_eq!(mind.name(), "mock");
    }
}
