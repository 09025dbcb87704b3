//! Mind port - interface for LLM providers.

use async_trait::async_trait;

use crate::domain::errors::MindError;
use crate::domain::models::{ThinkRequest, ThinkResponse};

/// A Mind turns a conversation window into the next assistant turn.
///
/// Concrete variants (provider-specific HTTP clients, scripted mocks) are
/// selected by configuration and instantiated behind this one capability.
#[async_trait]
pub trait Mind: Send + Sync {
    /// Provider name, e.g. `"anthropic"` or `"mock"`.
    fn name(&self) -> &str;

    /// Run one model call.
    async fn think(&self, request: ThinkRequest) -> Result<ThinkResponse, MindError>;
}
