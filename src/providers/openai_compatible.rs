//! OpenAI-compatible `/chat/completions` servers (LM Studio, llama.cpp, vLLM).
//!
//! Streams are SSE `data:` lines ending with `[DONE]`. Tool calls arrive as
//! indexed fragments and are accumulated until the stream ends.

use super::{Provider, error_message, finish_turn, session_headers, settle, settle_check};
use crate::config::{BackendKind, ProviderConfig};
use crate::session::{SessionContext, normalize_history};
use crate::stream::sse::sse_events;
use crate::stream::{Decoder, RawEvent, StreamEvent, assemble};
use crate::tools::ToolDefinition;
use crate::transport::{self, Auth, CallGuard};
use crate::types::{
    CallOptions, Capabilities, ChatMessage, ConnectionStatus, GenerationResult, TokenUsage,
};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

pub struct OpenAiCompatibleProvider {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: ProviderConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    fn auth(&self) -> Auth {
        match self.config.api_key.as_deref() {
            Some(key) if !key.is_empty() => Auth::Bearer(key.to_string()),
            _ => Auth::None,
        }
    }

    async fn run_chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        session: Option<&SessionContext>,
        options: &CallOptions,
    ) -> Result<GenerationResult> {
        let history = normalize_history(messages);
        let request = OpenAIRequest {
            model: &self.config.model,
            messages: history.iter().map(to_wire).collect(),
            stream: true,
            stream_options: StreamOptions { include_usage: true },
            max_tokens: self.config.max_tokens,
            temperature: Some(self.config.temperature),
            tools: (self.config.native_tools && !tools.is_empty())
                .then(|| tools.iter().map(ToolDefinition::to_openai_format).collect()),
        };
        debug!(
            messages = request.messages.len(),
            tools = tools.len(),
            "Sending OpenAI-compatible request"
        );

        let guard = CallGuard::for_call(options, self.config.timeout());
        let url = format!("{}/chat/completions", self.config.endpoint());
        let http_request = session_headers(self.auth().apply(self.http.post(&url)), session);
        let response = transport::send(&guard, http_request.json(&request)).await?;
        let request_id = transport::request_id(&response);

        let mut decoder = OpenAIDecoder::default();
        let raw = sse_events(response.bytes_stream());
        let assembled = assemble(raw, &mut decoder, &guard, options.progress.clone()).await?;

        let mut result = finish_turn(&self.config.key, assembled, tools)?;
        result.request_id = request_id;
        Ok(result)
    }

    async fn check_connection(&self, options: &CallOptions) -> Result<ConnectionStatus> {
        let guard = CallGuard::for_call(options, self.config.timeout());
        let url = format!("{}/models", self.config.endpoint());
        let response = transport::send(&guard, self.auth().apply(self.http.get(&url))).await?;
        let models: ModelList = guard.run(response.json()).await??;
        Ok(ConnectionStatus::ok(format!(
            "Connected, {} models available",
            models.data.len()
        )))
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn key(&self) -> &str {
        &self.config.key
    }

    fn kind(&self) -> BackendKind {
        BackendKind::OpenAiCompatible
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_tools: true,
            supports_conversation_reset: false,
            supports_reasoning: true,
        }
    }

    #[instrument(skip_all, fields(provider = %self.config.key, model = %self.config.model))]
    async fn test_connection(&self, options: &CallOptions) -> Result<ConnectionStatus> {
        settle_check(self.check_connection(options).await)
    }

    #[instrument(skip_all, fields(provider = %self.config.key, model = %self.config.model))]
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        session: Option<&SessionContext>,
        options: &CallOptions,
    ) -> Result<GenerationResult> {
        settle(
            &self.config.key,
            self.run_chat(messages, tools, session, options).await,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire format
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAIMessage>,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct OpenAIToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: OpenAIFunction,
}

#[derive(Serialize)]
struct OpenAIFunction {
    name: String,
    arguments: String,
}

fn to_wire(message: &ChatMessage) -> OpenAIMessage {
    let tool_calls = (!message.tool_calls.is_empty()).then(|| {
        message
            .tool_calls
            .iter()
            .map(|c| OpenAIToolCall {
                id: c.id.clone(),
                call_type: "function",
                function: OpenAIFunction {
                    name: c.name.clone(),
                    arguments: c.arguments.clone(),
                },
            })
            .collect()
    });
    OpenAIMessage {
        role: message.role.as_str(),
        content: message.content.clone(),
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    }
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<Value>,
}

#[derive(Deserialize)]
struct OpenAIChunk {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    #[serde(default)]
    delta: Option<OpenAIDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAIToolCallDelta>>,
}

#[derive(Deserialize)]
struct OpenAIToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAIFunctionDelta>,
}

#[derive(Deserialize)]
struct OpenAIFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptDetails>,
    #[serde(default)]
    completion_tokens_details: Option<CompletionDetails>,
}

#[derive(Deserialize)]
struct PromptDetails {
    #[serde(default)]
    cached_tokens: u64,
}

#[derive(Deserialize)]
struct CompletionDetails {
    #[serde(default)]
    reasoning_tokens: u64,
}

impl From<OpenAIUsage> for TokenUsage {
    fn from(usage: OpenAIUsage) -> Self {
        TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cached_tokens: usage.prompt_tokens_details.map_or(0, |d| d.cached_tokens),
            reasoning_tokens: usage.completion_tokens_details.map_or(0, |d| d.reasoning_tokens),
            total_tokens: usage.total_tokens,
        }
    }
}

/// Remembers the finish reason until `[DONE]`; the usage chunk comes after it.
#[derive(Default)]
struct OpenAIDecoder {
    finish_reason: Option<String>,
}

impl Decoder for OpenAIDecoder {
    fn decode(&mut self, raw: &RawEvent) -> Result<Vec<StreamEvent>> {
        if raw.is_done_sentinel() {
            return Ok(vec![StreamEvent::Completed {
                status: None,
                finish_reason: self.finish_reason.take(),
            }]);
        }

        let chunk: OpenAIChunk = serde_json::from_str(&raw.data)?;
        if let Some(error) = chunk.error {
            return Ok(vec![StreamEvent::Error(error_message(&error))]);
        }

        let mut events = Vec::new();
        for choice in chunk.choices {
            if let Some(delta) = choice.delta {
                if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
                    events.push(StreamEvent::ReasoningDelta(reasoning));
                }
                if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                    events.push(StreamEvent::TextDelta(content));
                }
                for call in delta.tool_calls.unwrap_or_default() {
                    let (name, arguments) = match call.function {
                        Some(f) => (f.name, f.arguments.unwrap_or_default()),
                        None => (None, String::new()),
                    };
                    events.push(StreamEvent::ToolCallDelta {
                        index: call.index,
                        id: call.id,
                        name,
                        arguments,
                    });
                }
            }
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
            }
        }
        if let Some(usage) = chunk.usage {
            events.push(StreamEvent::Usage(usage.into()));
        }
        Ok(events)
    }
}
