//! # llm-relay
//!
//! One streaming `chat`/`generate` contract over structurally different LLM
//! backends: local Ollama and OpenAI-compatible servers, YandexGPT, Yandex AI
//! Studio agents and GigaChat.
//!
//! ## Overview
//!
//! Each backend speaks its own wire protocol (line-delimited JSON, SSE with
//! or without `event:` lines, cumulative or incremental text), keeps state
//! differently (stateless, or server-side via a response id) and calls tools
//! its own way. The crate absorbs all of that and hands back one
//! [`GenerationResult`] shape:
//!
//! - **Streaming assembly**: raw events are framed, decoded per backend and
//!   folded into one turn, with progress callbacks for text deltas
//! - **Tool-call recovery**: calls written as text are recovered when the
//!   model skipped native tool calling, and cut-off calls are reported as
//!   truncated instead of failing to parse
//! - **Structured output**: a five-strategy cascade pulls JSON out of prose,
//!   fences and reasoning blocks
//! - **Conversation continuity**: continuation ids for stateful backends,
//!   full history for stateless ones, with recovered tool turns rewritten so
//!   every backend can read them
//! - **Retry**: bounded linear backoff that keeps or drops the continuation
//!   depending on how the call failed
//!
//! ## Failure model
//!
//! Calls return `Err` only for [`Error::Cancelled`]. Every other problem
//! (missing credentials, HTTP errors, empty or truncated output) is a failed
//! [`GenerationResult`] carrying a [`FailureKind`] and a readable message.
//!
//! ## Example
//!
//! ```rust,no_run
//! use llm_relay::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let local = ProviderConfig::builder("local", BackendKind::Ollama)
//!         .model("qwen3:8b")
//!         .build()?;
//!     let registry = ProviderRegistry::new()
//!         .with_provider(local)
//!         .route(Operation::Classification, "local");
//!     let client = Client::new(registry);
//!
//!     let lookup = tool("lookup", "Fetch a receipt by id").param("id", "integer").build();
//!     let mut conversation = Conversation::for_operation(Operation::Classification);
//!     let history = vec![ChatMessage::user("What did I buy on receipt 7?")];
//!
//!     let result = client
//!         .chat(&mut conversation, &history, &[lookup], &CallOptions::new())
//!         .await?;
//!     for call in &result.tool_calls {
//!         println!("{} {}", call.name, call.arguments);
//!     }
//!     Ok(())
//! }
//! ```

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// Caller-facing facade wiring registry, retry, sessions and usage together.
mod client;

/// Backend kinds and provider configuration with builder and env overrides.
mod config;

/// `Error`, `Result` and the `FailureKind` taxonomy.
mod error;

/// Operation routing and lazily built, cached adapters.
mod registry;

/// Balanced scanning, fences and reasoning-block stripping shared by the heuristics.
mod text;

/// Tool definitions and per-backend tool envelopes.
mod tools;

/// HTTP auth, status checks and the cancellation/deadline guard.
mod transport;

/// Messages, tool calls, results, usage and per-call options.
mod types;

// ============================================================================
// PUBLIC MODULES
// ============================================================================

pub mod parser;
pub mod prompt;
pub mod providers;
pub mod resolver;
pub mod retry;
pub mod session;
pub mod stream;
pub mod usage;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

// --- Client ---

pub use client::{Client, StructuredResult};
pub use registry::ProviderRegistry;

// --- Configuration ---

pub use config::{BackendKind, OAuthSettings, ProviderConfig, ProviderConfigBuilder};

// --- Error Handling ---

pub use error::{Error, FailureKind, Result};

// --- Tools ---

pub use tools::{ToolBuilder, ToolDefinition, find_tool, tool};

// --- Transport ---

pub use transport::{Auth, CallGuard};

// --- Core Types ---

pub use parser::{ExtractionMethod, JsonKind};
pub use providers::Provider;
pub use session::{Conversation, SessionContext, TurnMode};
pub use text::strip_reasoning;
pub use types::{
    CallOptions, Capabilities, ChatMessage, ConnectionStatus, GenerationResult, Operation,
    ProgressCallback, Role, TokenUsage, ToolCall,
};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// The types most callers need.
///
/// ```rust
/// use llm_relay::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        BackendKind, CallOptions, ChatMessage, Client, Conversation, Error, FailureKind,
        GenerationResult, JsonKind, Operation, ProviderConfig, ProviderRegistry, Result,
        SessionContext, ToolCall, ToolDefinition, tool,
    };
}
