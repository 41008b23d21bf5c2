//! Caller entry point
//!
//! [`Client`] ties the pieces together: the registry picks an adapter for the
//! operation, the retry policy wraps the call and keeps the caller's
//! [`Conversation`] in step, successful calls report token usage to the sink,
//! and [`Client::generate_json`] runs the response parser over the text.
//!
//! ## Request Flow
//!
//! ```text
//! chat(conversation, history, tools)
//!     │
//!     ├─> registry: operation ─> provider key ─> cached adapter
//!     │
//!     ├─> retry loop
//!     │       ├─> adapter.chat(history, tools, session)
//!     │       └─> conversation.apply(result)
//!     │
//!     └─> usage sink (successful calls with token counts)
//! ```
//!
//! Like the adapters, the client only returns `Err` for cancellation. A
//! missing provider comes back as a failed result with
//! [`FailureKind::ConfigurationMissing`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use llm_relay::{
//!     BackendKind, CallOptions, ChatMessage, Client, Conversation, ProviderConfig,
//!     ProviderRegistry,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProviderConfig::builder("local", BackendKind::Ollama)
//!         .model("qwen3:8b")
//!         .build()?;
//!     let client = Client::new(ProviderRegistry::new().with_provider(config));
//!
//!     let mut conversation = Conversation::new();
//!     let history = vec![ChatMessage::user("What is 2+2?")];
//!     let result = client
//!         .chat(&mut conversation, &history, &[], &CallOptions::new())
//!         .await?;
//!
//!     if result.success {
//!         println!("{}", result.response);
//!     } else {
//!         eprintln!("failed: {:?}", result.error);
//!     }
//!     Ok(())
//! }
//! ```

use crate::error::FailureKind;
use crate::parser::{ExtractionMethod, JsonKind, parse_response};
use crate::providers::Provider;
use crate::registry::ProviderRegistry;
use crate::retry::{RetryConfig, run_with_retry};
use crate::session::{Conversation, SessionContext};
use crate::tools::ToolDefinition;
use crate::types::{CallOptions, ChatMessage, ConnectionStatus, GenerationResult, Operation};
use crate::usage::{NoopUsageSink, UsageRecord, UsageSink};
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of [`Client::generate_json`].
///
/// When the text holds no JSON of the requested kind, `generation` is turned
/// into a failure with [`FailureKind::Parse`] while keeping the raw response.
#[derive(Debug, Clone)]
pub struct StructuredResult<T> {
    pub value: Option<T>,
    pub method: Option<ExtractionMethod>,
    pub generation: GenerationResult,
}

impl<T> StructuredResult<T> {
    pub fn is_success(&self) -> bool {
        self.value.is_some()
    }
}

pub struct Client {
    registry: Arc<ProviderRegistry>,
    retry: RetryConfig,
    usage: Arc<dyn UsageSink>,
}

impl Client {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self::from_shared(Arc::new(registry))
    }

    pub fn from_shared(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            retry: RetryConfig::default(),
            usage: Arc::new(NoopUsageSink),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage = sink;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// One chat turn over `history`, retried per the policy.
    ///
    /// The provider is chosen by the conversation's operation tag, or
    /// [`Operation::Chat`] when it has none.
    pub async fn chat(
        &self,
        conversation: &mut Conversation,
        history: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &CallOptions,
    ) -> Result<GenerationResult> {
        let operation = conversation
            .session()
            .operation
            .clone()
            .unwrap_or(Operation::Chat);
        let provider = match self.registry.for_operation(&operation) {
            Ok(provider) => provider,
            Err(e) => return Ok(unavailable(&operation, e)),
        };

        let result = run_with_retry(&self.retry, conversation, &options.cancel, |session| {
            let provider = provider.clone();
            async move { provider.chat(history, tools, Some(&session), options).await }
        })
        .await?;

        self.report_usage(provider.as_ref(), Some(operation), conversation.session(), &result);
        Ok(result)
    }

    /// Single-prompt completion for `operation`, retried per the policy.
    pub async fn generate(
        &self,
        operation: impl Into<Operation>,
        prompt: &str,
        session: Option<&SessionContext>,
        options: &CallOptions,
    ) -> Result<GenerationResult> {
        let operation = operation.into();
        let provider = match self.registry.for_operation(&operation) {
            Ok(provider) => provider,
            Err(e) => return Ok(unavailable(&operation, e)),
        };

        let mut conversation = match session {
            Some(session) => Conversation::from_session(session.clone()),
            None => Conversation::for_operation(operation.clone()),
        };
        let result = run_with_retry(&self.retry, &mut conversation, &options.cancel, |session| {
            let provider = provider.clone();
            async move { provider.generate(prompt, Some(&session), options).await }
        })
        .await?;

        self.report_usage(provider.as_ref(), Some(operation), conversation.session(), &result);
        Ok(result)
    }

    /// Generate and parse the response as JSON of `kind` into `T`.
    pub async fn generate_json<T: DeserializeOwned>(
        &self,
        operation: impl Into<Operation>,
        prompt: &str,
        kind: JsonKind,
        options: &CallOptions,
    ) -> Result<StructuredResult<T>> {
        let mut generation = self.generate(operation, prompt, None, options).await?;
        if !generation.success {
            return Ok(StructuredResult {
                value: None,
                method: None,
                generation,
            });
        }

        match parse_response::<T>(&generation.response, kind) {
            Ok(parsed) => {
                debug!(method = ?parsed.method, "Parsed structured response");
                Ok(StructuredResult {
                    value: Some(parsed.value),
                    method: Some(parsed.method),
                    generation,
                })
            }
            Err(e) => {
                warn!(error = %e, "Response held no usable JSON");
                generation.success = false;
                generation.error = Some(e.to_string());
                generation.failure = Some(FailureKind::Parse);
                Ok(StructuredResult {
                    value: None,
                    method: None,
                    generation,
                })
            }
        }
    }

    /// Check the connection of the provider serving `operation`.
    pub async fn test_connection(&self, operation: impl Into<Operation>) -> Result<ConnectionStatus> {
        let operation = operation.into();
        match self.registry.for_operation(&operation) {
            Ok(provider) => provider.test_connection(&CallOptions::new()).await,
            Err(e) => Ok(ConnectionStatus::failed(e.to_string())),
        }
    }

    /// Start the conversation over; the next turn sends the full history.
    pub fn reset(&self, conversation: &mut Conversation) {
        let operation = conversation
            .session()
            .operation
            .clone()
            .unwrap_or(Operation::Chat);
        match self.registry.for_operation(&operation) {
            Ok(provider) => {
                let next = provider.reset_conversation(conversation.session());
                conversation.restart(next);
            }
            Err(_) => conversation.reset(),
        }
    }

    fn report_usage(
        &self,
        provider: &dyn Provider,
        operation: Option<Operation>,
        session: &SessionContext,
        result: &GenerationResult,
    ) {
        if !result.success {
            return;
        }
        let Some(usage) = result.usage else {
            return;
        };
        self.usage.record(
            UsageRecord::new(provider.key(), provider.model(), usage)
                .with_operation(operation)
                .with_request_id(result.request_id.clone())
                .with_session_id(Some(session.session_id.clone())),
        );
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("registry", &self.registry)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn unavailable(operation: &Operation, error: Error) -> GenerationResult {
    warn!(%operation, error = %error, "No provider for operation");
    GenerationResult::failure(&error)
}
