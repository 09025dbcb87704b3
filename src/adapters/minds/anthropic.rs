//! Anthropic Messages API Mind.
//!
//! Features:
//! - Connection pooling and reuse (via `reqwest::Client`)
//! - Request rate limiting (sustained requests/second)
//! - Exponential backoff retry for transient errors (429, 5xx, network)
//! - 300 s default timeout for long turns

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use reqwest::Client as ReqwestClient;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::Duration;

use crate::domain::errors::MindError;
use crate::domain::models::{
    ChatMessage, ContentBlock, Role, StopReason, ThinkRequest, ThinkResponse, TokenUsage, ToolSpec,
};
use crate::domain::ports::Mind;

use super::pricing;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    /// Model used when the request does not name one.
    pub default_model: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub requests_per_second: u32,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            default_model: "claude-sonnet-4-5-20250929".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            timeout_secs: 300,
            requests_per_second: 10,
            max_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a [ContentBlock],
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolSpec]>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    model: String,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: u64,
    output_tokens: u64,
}

// ============================================================================
// Client
// ============================================================================

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct AnthropicMind {
    http_client: ReqwestClient,
    config: AnthropicConfig,
    rate_limiter: DirectRateLimiter,
}

impl std::fmt::Debug for AnthropicMind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicMind")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AnthropicMind {
    pub fn new(config: AnthropicConfig) -> Result<Self, MindError> {
        if config.api_key.is_empty() {
            return Err(MindError::Auth("missing API key".to_string()));
        }

        let http_client = ReqwestClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| MindError::Network(e.to_string()))?;

        let rps = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            http_client,
            rate_limiter: RateLimiter::direct(Quota::per_second(rps)),
            config,
        })
    }

    /// Build from `ANTHROPIC_API_KEY`.
    pub fn from_env() -> Result<Self, MindError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| MindError::Auth("ANTHROPIC_API_KEY not set".to_string()))?;
        Self::new(AnthropicConfig { api_key, ..AnthropicConfig::default() })
    }

    async fn send_once(&self, request: &ThinkRequest, model: &str) -> Result<ThinkResponse, MindError> {
        self.rate_limiter.until_ready().await;

        // The wire format has no system role inside `messages`; summary
        // messages the working memory stores as system collapse to user.
        let messages: Vec<WireMessage<'_>> = request
            .messages
            .iter()
            .map(|m: &ChatMessage| WireMessage {
                role: match m.role {
                    Role::Assistant => "assistant",
                    Role::User | Role::System => "user",
                },
                content: &m.content,
            })
            .collect();

        let body = MessagesRequest {
            model,
            messages,
            max_tokens: request.max_tokens,
            system: request.system.as_deref(),
            temperature: request.temperature,
            tools: if request.tools.is_empty() { None } else { Some(&request.tools) },
        };

        let response = self
            .http_client
            .post(format!("{}/v1/messages", self.config.base_url))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MindError::Timeout(self.config.timeout_secs)
                } else {
                    MindError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(match status.as_u16() {
                401 | 403 => MindError::Auth(message),
                429 => MindError::RateLimited(message),
                code => MindError::Api { status: code, message },
            });
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| MindError::InvalidResponse(e.to_string()))?;

        let stop_reason = match parsed.stop_reason.as_deref() {
            Some("tool_use") => StopReason::ToolUse,
            Some("max_tokens") => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        };

        let usage = TokenUsage {
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        };

        Ok(ThinkResponse {
            cost: pricing::cost_of(&parsed.model, usage),
            content: parsed.content,
            stop_reason,
            usage,
            model: parsed.model,
        })
    }
}

#[async_trait]
impl Mind for AnthropicMind {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn think(&self, request: ThinkRequest) -> Result<ThinkResponse, MindError> {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());

        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            match self.send_once(&request, &model).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    if !err.is_transient() {
                        return Err(err);
                    }
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        error = %err,
                        "retrying mind call after transient error"
                    );
                    last_err = Some(err);

                    if attempt < self.config.max_retries {
                        let backoff_ms = self
                            .config
                            .initial_backoff_ms
                            .saturating_mul(2_u64.saturating_pow(attempt))
                            .min(self.config.max_backoff_ms);
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| MindError::Network("retries exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(base_url: String) -> AnthropicConfig {
        AnthropicConfig {
            api_key: "test-key".to_string(),
            base_url,
            max_retries: 0,
            initial_backoff_ms: 1,
            max_backoff_ms: 10,
            ..AnthropicConfig::default()
        }
    }

    #[tokio::test]
    async fn test_successful_turn() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "test-key")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "content": [{ "type": "text", "text": "hello" }],
                    "stop_reason": "end_turn",
                    "model": "claude-sonnet-4-5-20250929",
                    "usage": { "input_tokens": 12, "output_tokens": 4 }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let mind = AnthropicMind::new(test_config(server.url())).unwrap();
        let response = mind
            .think(ThinkRequest::new(vec![ChatMessage::text(Role::User, "hi")]))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.text(), "hello");
        assert_eq!(response.stop_reason, StopReason::EndTurn);
        assert!(response.cost > 0.0);
    }

    #[tokio::test]
    async fn test_auth_error_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/messages")
            .with_status(401)
            .with_body("bad key")
            .create_async()
            .await;

        let mind = AnthropicMind::new(test_config(server.url())).unwrap();
        let err = mind.think(ThinkRequest::new(Vec::new())).await.unwrap_err();
        assert!(matches!(err, MindError::Auth(_)));
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .with_status(429)
            .with_body("slow down")
            .expect(2)
            .create_async()
            .await;

        let mut config = test_config(server.url());
        config.max_retries = 1;
        let mind = AnthropicMind::new(config).unwrap();

        let err = mind.think(ThinkRequest::new(Vec::new())).await.unwrap_err();
        assert!(matches!(err, MindError::RateLimited(_)));
        // Initial call + one retry.
        mock.assert_async().await;
    }

    #[test]
    fn test_missing_key_rejected() {
        let err = AnthropicMind::new(AnthropicConfig::default()).unwrap_err();
        assert!(matches!(err, MindError::Auth(_)));
    }
}
