//! [`LlmDriver`] – OpenAI-compatible chat-completions client.
//!
//! Implements the [`ConversationClient`] port: given an ordered list of
//! [`ChatTurn`]s and a model identifier, return the text of the next turn.
//!
//! # Example
//!
//! ```rust,no_run
//! use armlink_runtime::llm_driver::{ChatTurn, ConversationClient, LlmDriver, Role};
//!
//! # async fn demo() -> Result<(), armlink_runtime::LlmError> {
//! let driver = LlmDriver::new("https://api.openai.com", "sk-...");
//! let turns = vec![
//!     ChatTurn::new(Role::System, "You plan robot paths."),
//!     ChatTurn::new(Role::User, "Draw a square."),
//! ];
//! let reply = driver.complete(&turns, "gpt-3.5-turbo").await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from a conversation round trip.
#[derive(Error, Debug)]
pub enum LlmError {
    /// The HTTP request to the model server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The server answered with a non-success status (bad key, rate limit, …).
    #[error("model server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    /// The response from the model server could not be parsed.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
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

/// One immutable message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Port
// ─────────────────────────────────────────────────────────────────────────────

/// Remote conversation service: produce the next turn of `turns`.
#[async_trait]
pub trait ConversationClient: Send + Sync {
    /// # Errors
    ///
    /// Returns [`LlmError`] on transport, authentication or decoding failure.
    async fn complete(&self, turns: &[ChatTurn], model: &str) -> Result<String, LlmError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal request / response shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatTurn,
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmDriver
// ─────────────────────────────────────────────────────────────────────────────

/// Async client for an OpenAI-compatible `/v1/chat/completions` endpoint.
///
/// Construct once and share; the underlying connection pool is reused.
pub struct LlmDriver {
    base_url: String,
    api_key: Zeroizing<String>,
    client: reqwest::Client,
}

impl LlmDriver {
    /// Create a driver for `base_url` (e.g. `"https://api.openai.com"`).
    /// An empty `api_key` sends no `Authorization` header, which suits local
    /// servers such as Ollama.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: Zeroizing::new(api_key.into()),
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ConversationClient for LlmDriver {
    async fn complete(&self, turns: &[ChatTurn], model: &str) -> Result<String, LlmError> {
        let body = ChatRequest {
            model,
            messages: turns,
            stream: false,
        };

        let mut request = self.client.post(self.endpoint()).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(self.api_key.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| LlmError::BadResponse("empty choices array".into()))
    }
}
