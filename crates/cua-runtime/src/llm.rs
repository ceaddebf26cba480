//! [`LlmClient`] – OpenAI-compatible chat interface shared by the executor,
//! planner, and reflector adapters.
//!
//! Targets any `/chat/completions` endpoint that speaks the OpenAI dialect
//! (OpenRouter by default). Supports multimodal content (text + screenshot
//! data URLs), function tools with `tool_choice`, structured output via
//! `response_format`, and provider-specific reasoning parameters.
//!
//! # Cost control
//!
//! The client carries built-in safeguards against runaway API spend:
//!
//! * **Token counter** – every call estimates prompt + reply tokens with a
//!   word-count heuristic and accumulates the total, exposed via
//!   [`LlmClient::total_tokens`].
//! * **Rate limiter** – a [`governor`]-backed token bucket enforcing at most
//!   [`LlmClient::DEFAULT_RPM`] requests per minute; an empty bucket returns
//!   [`LlmError::RateLimitExceeded`] immediately instead of blocking the
//!   loop.
//! * **Budget circuit breaker** – once the cumulative count passes the
//!   configured budget every call returns [`LlmError::BudgetExceeded`] until
//!   [`LlmClient::reset_token_counter`] is called.
//!
//! Plaintext `http://` endpoints are rejected for non-loopback hosts, and
//! HTTPS connections enforce a TLS 1.2 floor.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from LLM requests.
#[derive(Error, Debug)]
pub enum LlmError {
    /// The HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The response shape was unexpected.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
    /// The per-minute request quota is exhausted; back off and retry.
    #[error("LLM rate limit exceeded: too many requests per minute")]
    RateLimitExceeded,
    /// The cumulative token budget is exhausted.
    #[error("LLM token budget exceeded: {used} tokens used, budget is {budget}")]
    BudgetExceeded { used: u64, budget: u64 },
    /// The endpoint uses `http://` for a non-localhost host.
    #[error("Insecure endpoint: '{0}' uses http:// for a non-localhost host; use https://")]
    InsecureEndpoint(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Message types (OpenAI-compatible)
// ─────────────────────────────────────────────────────────────────────────────

/// The role of a participant in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Message content: a bare string or multimodal parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One part of a multimodal message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    /// A user message combining text with a base64 screenshot data URL.
    pub fn user_with_image(text: impl Into<String>, mime: &str, image_b64: &str) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: text.into() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:{mime};base64,{image_b64}"),
                    },
                },
            ]),
        }
    }

    fn text_len_words(&self) -> u64 {
        match &self.content {
            MessageContent::Text(text) => text.split_whitespace().count() as u64,
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => text.split_whitespace().count() as u64,
                    ContentPart::ImageUrl { .. } => 0,
                })
                .sum(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────────────────────────

/// Per-call knobs: tools, forced output shape, reasoning budget.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub tools: Vec<serde_json::Value>,
    pub tool_choice: Option<String>,
    pub response_format: Option<serde_json::Value>,
    pub max_tokens: Option<u32>,
    pub reasoning: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [serde_json::Value]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<&'a serde_json::Value>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

/// The assistant message of the first choice: free text and/or tool calls.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<serde_json::Value>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl ResponseMessage {
    /// Stitch the reply text together, handling both plain strings and
    /// fragment lists.
    pub fn text(&self) -> String {
        match &self.content {
            Some(serde_json::Value::String(text)) => text.clone(),
            Some(serde_json::Value::Array(fragments)) => fragments
                .iter()
                .filter_map(|frag| frag.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    pub function: ToolFunction,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Rate-limiter type alias
// ─────────────────────────────────────────────────────────────────────────────

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

// ─────────────────────────────────────────────────────────────────────────────
// LlmClient
// ─────────────────────────────────────────────────────────────────────────────

/// Async client for an OpenAI-compatible chat-completions endpoint.
/// Construct once per role (executor/planner/reflector) and reuse across
/// loop iterations.
pub struct LlmClient {
    base_url: String,
    api_key: String,
    model: String,
    http: reqwest::Client,
    total_tokens: Arc<AtomicU64>,
    token_budget: u64,
    rate_limiter: Arc<DirectRateLimiter>,
}

impl LlmClient {
    /// Default maximum requests per minute.
    pub const DEFAULT_RPM: u32 = 20;

    /// Default token budget before the circuit breaker trips.
    pub const DEFAULT_TOKEN_BUDGET: u64 = 500_000;

    /// Per-request deadline; bounds every suspension point in the loop.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self::with_limits(
            base_url,
            api_key,
            model,
            Self::DEFAULT_RPM,
            Self::DEFAULT_TOKEN_BUDGET,
        )
    }

    /// Create a client with custom rate limits. An `rpm` of 0 is clamped to 1
    /// because the underlying [`governor`] limiter requires a non-zero quota.
    pub fn with_limits(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        rpm: u32,
        token_budget: u64,
    ) -> Self {
        let rpm = rpm.max(1);
        let quota =
            Quota::per_minute(NonZeroU32::new(rpm).expect("rpm is >= 1 after max(1) clamp above"));
        let http = reqwest::ClientBuilder::new()
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .timeout(Self::REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client with TLS 1.2 minimum");
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            http,
            total_tokens: Arc::new(AtomicU64::new(0)),
            token_budget,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Cumulative estimated tokens consumed since construction or the last
    /// [`reset_token_counter`][Self::reset_token_counter].
    pub fn total_tokens(&self) -> u64 {
        self.total_tokens.load(Ordering::Relaxed)
    }

    /// Reset the token counter, un-tripping the budget circuit breaker.
    pub fn reset_token_counter(&self) {
        self.total_tokens.store(0, Ordering::Relaxed);
    }

    pub fn token_budget(&self) -> u64 {
        self.token_budget
    }

    /// Send one chat request and return the assistant message of the first
    /// choice.
    ///
    /// # Errors
    ///
    /// [`LlmError::RateLimitExceeded`] when the per-minute quota is
    /// exhausted, [`LlmError::BudgetExceeded`] when the token budget is
    /// spent, [`LlmError::InsecureEndpoint`] for plaintext non-loopback
    /// endpoints, [`LlmError::Http`] / [`LlmError::BadResponse`] for
    /// transport and shape failures.
    #[instrument(
        name = "llm.chat",
        skip(self, messages, options),
        fields(
            model = %self.model,
            tokens_used_before = %self.total_tokens.load(Ordering::Relaxed),
            prompt_tokens = tracing::field::Empty,
            reply_tokens = tracing::field::Empty,
            inference_latency_ms = tracing::field::Empty,
        )
    )]
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ResponseMessage, LlmError> {
        if !Self::is_secure_url(&self.base_url) {
            return Err(LlmError::InsecureEndpoint(self.base_url.clone()));
        }

        let used = self.total_tokens.load(Ordering::Relaxed);
        if used >= self.token_budget {
            return Err(LlmError::BudgetExceeded {
                used,
                budget: self.token_budget,
            });
        }

        if self.rate_limiter.check().is_err() {
            return Err(LlmError::RateLimitExceeded);
        }

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
            tools: (!options.tools.is_empty()).then_some(options.tools.as_slice()),
            tool_choice: options.tool_choice.as_deref(),
            response_format: options.response_format.as_ref(),
            max_tokens: options.max_tokens,
            reasoning: options.reasoning.as_ref(),
        };

        let inference_start = Instant::now();
        let response: ChatResponse = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let inference_latency_ms = inference_start.elapsed().as_millis() as u64;

        let message = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| LlmError::BadResponse("empty choices array".into()))?;

        let prompt_tokens: u64 = messages.iter().map(|m| estimate_tokens_words(m.text_len_words())).sum();
        let reply_tokens = estimate_tokens(&message.text());
        let new_total = self
            .total_tokens
            .fetch_add(prompt_tokens + reply_tokens, Ordering::Relaxed)
            + prompt_tokens
            + reply_tokens;

        let span = tracing::Span::current();
        span.record("prompt_tokens", prompt_tokens);
        span.record("reply_tokens", reply_tokens);
        span.record("inference_latency_ms", inference_latency_ms);
        debug!(
            model = %self.model,
            prompt_tokens,
            reply_tokens,
            tokens_used_after = new_total,
            inference_latency_ms,
            "LLM inference complete"
        );
        if new_total >= self.token_budget {
            warn!(
                tokens_used = new_total,
                budget = self.token_budget,
                "token budget reached; further requests will be rejected"
            );
        }

        Ok(message)
    }

    /// Return `true` when `url` is safe to connect to: HTTPS, or plaintext
    /// HTTP to a loopback host only.
    pub(crate) fn is_secure_url(url: &str) -> bool {
        if url.starts_with("https://") {
            return true;
        }
        if let Some(without_scheme) = url.strip_prefix("http://") {
            let host_port = without_scheme.split('/').next().unwrap_or("");
            let host = if host_port.starts_with('[') {
                match host_port.find(']') {
                    Some(close) => &host_port[1..close],
                    // Malformed IPv6 literal is not safe to treat as loopback.
                    None => return false,
                }
            } else if let Some(idx) = host_port.rfind(':') {
                &host_port[..idx]
            } else {
                host_port
            };
            return matches!(host, "localhost" | "127.0.0.1" | "::1");
        }
        false
    }
}

/// Estimate tokens for `text` with the word-count heuristic
/// `ceil(words × 1.3)`, conservative enough for budget enforcement without a
/// tokenizer dependency.
fn estimate_tokens(text: &str) -> u64 {
    estimate_tokens_words(text.split_whitespace().count() as u64)
}

fn estimate_tokens_words(words: u64) -> u64 {
    (words * 13).div_ceil(10)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> LlmClient {
        LlmClient::new("http://localhost:11434", "test-key", "test-model")
    }

    #[test]
    fn chat_message_serializes_role_lowercase() {
        let msg = ChatMessage::system("hello");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"system\""));
    }

    #[test]
    fn user_with_image_builds_data_url() {
        let msg = ChatMessage::user_with_image("look", "image/png", "QUJD");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("data:image/png;base64,QUJD"));
        assert!(json.contains("\"image_url\""));
    }

    #[test]
    fn response_text_handles_string_and_fragments() {
        let plain = ResponseMessage {
            content: Some(serde_json::json!("hello")),
            tool_calls: vec![],
        };
        assert_eq!(plain.text(), "hello");

        let fragments = ResponseMessage {
            content: Some(serde_json::json!([
                {"type": "text", "text": "hel"},
                {"type": "text", "text": "lo"}
            ])),
            tool_calls: vec![],
        };
        assert_eq!(fragments.text(), "hello");

        let empty = ResponseMessage::default();
        assert_eq!(empty.text(), "");
    }

    #[test]
    fn tool_call_deserializes_from_openai_shape() {
        let raw = r#"{
            "content": null,
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {"name": "computer", "arguments": "{\"action\":\"left_click\"}"}
            }]
        }"#;
        let msg: ResponseMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].function.name, "computer");
        assert!(msg.tool_calls[0].function.arguments.contains("left_click"));
    }

    #[test]
    fn token_counter_starts_at_zero() {
        assert_eq!(client().total_tokens(), 0);
    }

    #[test]
    fn reset_token_counter_clears_total() {
        let client = client();
        client.total_tokens.store(9_999, Ordering::Relaxed);
        client.reset_token_counter();
        assert_eq!(client.total_tokens(), 0);
    }

    #[tokio::test]
    async fn budget_circuit_breaker_trips_when_exhausted() {
        let client =
            LlmClient::with_limits("http://localhost:11434", "k", "m", LlmClient::DEFAULT_RPM, 1);
        client.total_tokens.store(1, Ordering::Relaxed);
        let result = client
            .chat(&[ChatMessage::user_text("hi")], &ChatOptions::default())
            .await;
        assert!(matches!(result, Err(LlmError::BudgetExceeded { .. })));
    }

    #[tokio::test]
    async fn rate_limiter_trips_when_quota_exhausted() {
        let client = LlmClient::with_limits(
            "http://localhost:11434",
            "k",
            "m",
            1,
            LlmClient::DEFAULT_TOKEN_BUDGET,
        );
        let _ = client.rate_limiter.check();
        let result = client
            .chat(&[ChatMessage::user_text("hi")], &ChatOptions::default())
            .await;
        assert!(matches!(result, Err(LlmError::RateLimitExceeded)));
    }

    #[tokio::test]
    async fn external_http_endpoint_is_rejected() {
        let client = LlmClient::new("http://model-farm.internal:8080", "k", "m");
        let result = client
            .chat(&[ChatMessage::user_text("hi")], &ChatOptions::default())
            .await;
        assert!(matches!(result, Err(LlmError::InsecureEndpoint(_))));
    }

    #[test]
    fn is_secure_url_accepts_https_and_loopback() {
        assert!(LlmClient::is_secure_url("https://openrouter.ai/api/v1"));
        assert!(LlmClient::is_secure_url("http://localhost:11434"));
        assert!(LlmClient::is_secure_url("http://127.0.0.1:11434/v1"));
        assert!(LlmClient::is_secure_url("http://[::1]:11434"));
    }

    #[test]
    fn is_secure_url_rejects_external_http_and_malformed_ipv6() {
        assert!(!LlmClient::is_secure_url("http://api.example.com"));
        assert!(!LlmClient::is_secure_url("http://[::1:11434"));
        assert!(!LlmClient::is_secure_url("ftp://host"));
    }

    #[test]
    fn estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("hello"), 2);
        assert_eq!(
            estimate_tokens("one two three four five six seven eight nine ten"),
            13
        );
    }

    #[test]
    fn zero_rpm_is_clamped_to_one() {
        let client = LlmClient::with_limits("http://localhost:11434", "k", "m", 0, 1_000);
        assert!(client.rate_limiter.check().is_ok());
    }

    #[test]
    fn chat_request_omits_empty_optionals() {
        let request = ChatRequest {
            model: "m",
            messages: &[],
            stream: false,
            tools: None,
            tool_choice: None,
            response_format: None,
            max_tokens: None,
            reasoning: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("tools"));
        assert!(!json.contains("response_format"));
        assert!(!json.contains("reasoning"));
    }
}
