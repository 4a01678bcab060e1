//! `armlink-runtime` – natural-language → trajectory round trip
//!
//! # Modules
//!
//! - [`llm_driver`] – the [`ConversationClient`] port and [`LlmDriver`],
//!   an OpenAI-compatible chat-completions client.
//! - [`conversation`] – [`ConversationManager`]: the shared, bounded
//!   [`ChatHistory`], token-budget truncation, `{ … }` payload extraction and
//!   the [`TrajectorySink`] file writer.
//! - [`prompt_queue`] – [`PromptQueue`]: single-consumer queue so prompts
//!   from any connection run one at a time without blocking their reader.
//! - [`telemetry`] – [`init_tracing`]: `tracing` subscriber with optional
//!   OTLP span export.

pub mod conversation;
pub mod llm_driver;
pub mod prompt_queue;
pub mod telemetry;

pub use conversation::{
    ChatHistory, ConversationError, ConversationManager, DEFAULT_PRIMING_PROMPT, SinkError,
    SubmitOutcome, TokenBudget, TrajectorySink, estimate_tokens, extract_payload,
    truncate_history,
};
pub use llm_driver::{ChatTurn, ConversationClient, LlmDriver, LlmError, Role};
pub use prompt_queue::{EnqueueError, PromptQueue, PromptTicket};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
