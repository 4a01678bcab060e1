//! [`ConversationManager`] – bounded chat history and the natural-language
//! → trajectory round trip.
//!
//! One [`submit`][ConversationManager::submit] call:
//!
//! 1. appends the instruction as a user turn to the authoritative history,
//! 2. sends a *truncated copy* of the history to the [`ConversationClient`],
//! 3. appends the reply as an assistant turn,
//! 4. extracts the `{ … }` payload from the reply and writes it verbatim to
//!    the [`TrajectorySink`].
//!
//! The history lock is held for the whole round trip, including the sink
//! write, so concurrent prompts are serialized, turn order is never
//! interleaved, and the file always holds the payload of the latest reply.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::llm_driver::{ChatTurn, ConversationClient, LlmError, Role};

/// Priming turn used when the configuration does not supply one.
pub const DEFAULT_PRIMING_PROMPT: &str = "\
You are the path planner of an industrial robot arm. \
The operator describes a motion in plain language and you answer with the \
path as JSON only, without comments. Keep every coordinate inside the work \
envelope: X from -1.35 to -0.69, Y from 1.0 to 1.5, Z from -1.0 to 0.17 \
(metres). Use exactly this shape:\n\
{\n  \"positions\": [\n    {\"X\": -1.05, \"Y\": 1.34, \"Z\": -0.5},\n    {\"X\": -1.20, \"Y\": 1.47, \"Z\": -0.17}\n  ]\n}";

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// The trajectory file could not be written.
#[derive(Error, Debug)]
#[error("failed to write trajectory to {path}: {source}")]
pub struct SinkError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Failure of one conversation round trip.
#[derive(Error, Debug)]
pub enum ConversationError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

// ─────────────────────────────────────────────────────────────────────────────
// History and truncation
// ─────────────────────────────────────────────────────────────────────────────

/// Cost proxy for one turn: its whitespace-delimited token count.
pub fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Request budget: `max_tokens - reserved_margin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    pub max_tokens: usize,
    pub reserved_margin: usize,
}

impl TokenBudget {
    pub fn limit(&self) -> usize {
        self.max_tokens.saturating_sub(self.reserved_margin)
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            reserved_margin: 32,
        }
    }
}

/// Return the turns to send for a request limited to `budget` tokens.
///
/// Turn 0 (the priming turn) is always kept and never evicted.  It is
/// excluded from eviction but not from the budget: its cost is counted and
/// shrinks what is left for the remaining turns, so the request as sent
/// never exceeds `budget` unless the priming turn alone does.  The other
/// turns are evicted oldest-first until the total fits.  When the priming
/// turn alone exceeds the budget only the priming turn is sent.
pub fn truncate_history(turns: &[ChatTurn], budget: usize) -> Vec<ChatTurn> {
    let Some((priming, rest)) = turns.split_first() else {
        return Vec::new();
    };

    let costs: Vec<usize> = rest.iter().map(|t| estimate_tokens(&t.content)).collect();
    let available = budget.saturating_sub(estimate_tokens(&priming.content));
    let mut total: usize = costs.iter().sum();

    let mut start = 0;
    while total > available && start < rest.len() {
        total -= costs[start];
        start += 1;
    }

    let mut out = Vec::with_capacity(1 + rest.len() - start);
    out.push(priming.clone());
    out.extend_from_slice(&rest[start..]);
    out
}

/// Ordered conversation; insertion order is conversation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatHistory {
    turns: Vec<ChatTurn>,
}

impl ChatHistory {
    /// A history holding only the priming system turn.
    pub fn new(priming: impl Into<String>) -> Self {
        Self {
            turns: vec![ChatTurn::new(Role::System, priming)],
        }
    }

    /// Append a few-shot example exchange after the priming turn.
    pub fn with_example(mut self, user: impl Into<String>, assistant: impl Into<String>) -> Self {
        self.turns.push(ChatTurn::new(Role::User, user));
        self.turns.push(ChatTurn::new(Role::Assistant, assistant));
        self
    }

    pub fn push(&mut self, turn: ChatTurn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Copy of the history fitted to `budget`; see [`truncate_history`].
    pub fn truncated(&self, budget: usize) -> Vec<ChatTurn> {
        truncate_history(&self.turns, budget)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payload extraction and sink
// ─────────────────────────────────────────────────────────────────────────────

/// Locate the structured payload: from the first `{` to the last `}`
/// inclusive.  Returns `None` when either brace is missing or they are out
/// of order.  The payload is not validated as JSON.
pub fn extract_payload(reply: &str) -> Option<&str> {
    let open = reply.find('{')?;
    let close = reply.rfind('}')?;
    (close > open).then(|| &reply[open..=close])
}

/// Output file the extracted trajectory is written to, fully overwriting
/// previous content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrajectorySink {
    path: PathBuf,
}

impl TrajectorySink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `payload`, creating the parent directory when missing.
    pub async fn write(&self, payload: &str) -> Result<(), SinkError> {
        let wrap = |source| SinkError {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(wrap)?;
        }
        tokio::fs::write(&self.path, payload).await.map_err(wrap)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ConversationManager
// ─────────────────────────────────────────────────────────────────────────────

/// Result of a round trip that reached the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The payload was written to the sink.
    Written { path: PathBuf, bytes: usize },
    /// The reply carried no `{ … }` block; nothing was written.
    NoPayload { reply: String },
}

/// Owns the single shared [`ChatHistory`] of a gateway instance.
pub struct ConversationManager {
    history: Mutex<ChatHistory>,
    client: Arc<dyn ConversationClient>,
    model: String,
    budget: TokenBudget,
    sink: TrajectorySink,
}

impl ConversationManager {
    pub fn new(
        history: ChatHistory,
        client: Arc<dyn ConversationClient>,
        model: impl Into<String>,
        budget: TokenBudget,
        sink: TrajectorySink,
    ) -> Self {
        Self {
            history: Mutex::new(history),
            client,
            model: model.into(),
            budget,
            sink,
        }
    }

    pub fn sink(&self) -> &TrajectorySink {
        &self.sink
    }

    /// Copy of the authoritative history.
    pub async fn history(&self) -> ChatHistory {
        self.history.lock().await.clone()
    }

    #[cfg(test)]
    pub(crate) async fn history_lock_for_test(&self) -> tokio::sync::MutexGuard<'_, ChatHistory> {
        self.history.lock().await
    }

    /// Run one instruction through the model and persist the extracted
    /// trajectory.
    ///
    /// # Errors
    ///
    /// Returns [`ConversationError::Llm`] when the remote call fails (the user
    /// turn stays in the history) and [`ConversationError::Sink`] when the
    /// payload cannot be written.  A reply without a payload is
    /// [`SubmitOutcome::NoPayload`], not an error.
    #[instrument(skip(self), fields(model = %self.model))]
    pub async fn submit(&self, instruction: &str) -> Result<SubmitOutcome, ConversationError> {
        let mut history = self.history.lock().await;
        history.push(ChatTurn::new(Role::User, instruction));

        let request = history.truncated(self.budget.limit());
        if request.len() < history.len() {
            info!(
                sent = request.len(),
                total = history.len(),
                "chat history truncated to fit the token budget"
            );
        }

        info!("prompt sent to the model, waiting for the reply");
        let reply = match self.client.complete(&request, &self.model).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "conversation round trip failed");
                return Err(e.into());
            }
        };
        history.push(ChatTurn::new(Role::Assistant, reply.clone()));

        match extract_payload(&reply) {
            Some(payload) => {
                self.sink.write(payload).await.map_err(|e| {
                    warn!(error = %e, "trajectory write failed");
                    e
                })?;
                info!(path = %self.sink.path().display(), "trajectory file updated");
                Ok(SubmitOutcome::Written {
                    path: self.sink.path().to_path_buf(),
                    bytes: payload.len(),
                })
            }
            None => {
                warn!(reply = %reply, "reply contains no JSON payload; nothing written");
                Ok(SubmitOutcome::NoPayload { reply })
            }
        }
    }
}
