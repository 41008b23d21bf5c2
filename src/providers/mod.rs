//! Provider adapters
//!
//! Every backend implements [`Provider`]. Adapters own the wire format of
//! their API (request bodies and stream payloads are private structs in each
//! module) and share the rest: [`CallGuard`](crate::transport::CallGuard)
//! for cancellation and deadlines, the stream assembler, the tool-call
//! resolver and [`settle`], which folds every error except cancellation into
//! a failed [`GenerationResult`].

mod auth;
mod gigachat;
mod ollama;
mod openai_compatible;
mod yandex_agent;
mod yandex_gpt;

pub use auth::TokenCache;
pub use gigachat::GigaChatProvider;
pub use ollama::OllamaProvider;
pub use openai_compatible::OpenAiCompatibleProvider;
pub use yandex_agent::YandexAgentProvider;
pub use yandex_gpt::YandexGptProvider;

use crate::config::{BackendKind, ProviderConfig};
use crate::resolver::{Resolution, resolve};
use crate::session::SessionContext;
use crate::stream::Assembled;
use crate::text::strip_reasoning;
use crate::tools::ToolDefinition;
use crate::types::{
    CallOptions, Capabilities, ChatMessage, ConnectionStatus, GenerationResult,
};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Uniform contract over every backend.
///
/// `generate` and `chat` only return `Err` for [`Error::Cancelled`]; any
/// other problem comes back as a failed [`GenerationResult`] with a
/// [`FailureKind`](crate::FailureKind).
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry key of this provider entry.
    fn key(&self) -> &str;

    fn kind(&self) -> BackendKind;

    fn model(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Cheapest connection check the API offers.
    async fn test_connection(&self, options: &CallOptions) -> Result<ConnectionStatus>;

    /// Single-prompt completion.
    async fn generate(
        &self,
        prompt: &str,
        session: Option<&SessionContext>,
        options: &CallOptions,
    ) -> Result<GenerationResult> {
        self.chat(&[ChatMessage::user(prompt)], &[], session, options)
            .await
    }

    /// One chat turn over `messages`, offering `tools`.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        session: Option<&SessionContext>,
        options: &CallOptions,
    ) -> Result<GenerationResult>;

    /// Context for starting over; stateless backends just clear the id.
    fn reset_conversation(&self, session: &SessionContext) -> SessionContext {
        session.cleared()
    }
}

/// Instantiate the adapter for `config.kind`.
pub fn build_provider(config: ProviderConfig, http: reqwest::Client) -> Arc<dyn Provider> {
    match config.kind {
        BackendKind::Ollama => Arc::new(OllamaProvider::new(config, http)),
        BackendKind::OpenAiCompatible => Arc::new(OpenAiCompatibleProvider::new(config, http)),
        BackendKind::YandexGpt => Arc::new(YandexGptProvider::new(config, http)),
        BackendKind::YandexAgent => Arc::new(YandexAgentProvider::new(config, http)),
        BackendKind::GigaChat => Arc::new(GigaChatProvider::new(config, http)),
    }
}

/// Keep cancellation as `Err`, turn every other error into a failed result.
pub fn settle(provider: &str, outcome: Result<GenerationResult>) -> Result<GenerationResult> {
    match outcome {
        Ok(result) => Ok(result),
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(e) => {
            warn!(provider, error = %e, "Provider call failed");
            Ok(GenerationResult::failure(&e))
        }
    }
}

/// Same for connection checks.
pub(crate) fn settle_check(outcome: Result<ConnectionStatus>) -> Result<ConnectionStatus> {
    match outcome {
        Ok(status) => Ok(status),
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(e) => Ok(ConnectionStatus::failed(e.to_string())),
    }
}

/// Turn an assembled stream into a result: in-stream errors, empty output,
/// tool-call resolution and truncation.
///
/// Text recovery only runs when the call offered tools.
pub(crate) fn finish_turn(
    provider: &str,
    assembled: Assembled,
    tools: &[ToolDefinition],
) -> Result<GenerationResult> {
    if let Some(message) = assembled.error {
        return Err(Error::backend(message));
    }
    if assembled.skipped_lines > 0 {
        debug!(provider, skipped = assembled.skipped_lines, "Stream had malformed lines");
    }
    let response = strip_reasoning(&assembled.text).into_owned();
    if response.trim().is_empty() && assembled.tool_calls.is_empty() {
        return Err(Error::EmptyResponse(provider.to_string()));
    }

    let resolution = if tools.is_empty() {
        Resolution::Native(assembled.tool_calls)
    } else {
        resolve(&assembled.text, assembled.tool_calls, tools)
    };
    let tool_calls = match resolution {
        Resolution::Truncated { partial } => return Err(Error::Truncated { partial }),
        other => other.into_calls(),
    };

    let mut result = GenerationResult::success(response)
        .with_tool_calls(tool_calls)
        .with_usage(assembled.usage);
    result.finish_reason = assembled.finish_reason;
    if !assembled.reasoning.is_empty() {
        result.reasoning = Some(assembled.reasoning);
    }
    Ok(result)
}

/// Name of the tool a result answers, looked up in earlier assistant turns.
pub(crate) fn tool_name_for<'a>(history: &'a [ChatMessage], call_id: &str) -> Option<&'a str> {
    history
        .iter()
        .flat_map(|m| m.tool_calls.iter())
        .find(|c| c.id == call_id)
        .map(|c| c.name.as_str())
}

/// Attach the session's extra transport headers.
pub(crate) fn session_headers(
    mut request: reqwest::RequestBuilder,
    session: Option<&SessionContext>,
) -> reqwest::RequestBuilder {
    if let Some(session) = session {
        for (name, value) in &session.extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }
    }
    request
}

/// Parse JSON tool arguments into an object for backends that want one.
pub(crate) fn arguments_object(arguments: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(arguments) {
        Ok(value) if value.is_object() => value,
        _ => serde_json::json!({}),
    }
}

/// Human-readable text of an in-stream error payload.
pub(crate) fn error_message(error: &serde_json::Value) -> String {
    error
        .get("message")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

/// Token counts some APIs encode as strings.
pub(crate) fn lenient_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        String(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
