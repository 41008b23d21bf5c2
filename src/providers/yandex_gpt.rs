//! YandexGPT foundation models (`{base}/completion`).
//!
//! The stream is line-delimited JSON where every chunk carries the whole
//! answer so far; deltas are recovered with [`CumulativeText`]. Tool calls
//! arrive once, with the `ALTERNATIVE_STATUS_TOOL_CALLS` status, and carry no
//! ids, so results are matched back by tool name.

use super::{
    Provider, arguments_object, error_message, finish_turn, lenient_u64, session_headers, settle,
    settle_check, tool_name_for,
};
use crate::config::{BackendKind, ProviderConfig};
use crate::session::{SessionContext, normalize_history};
use crate::stream::ndjson::ndjson_events;
use crate::stream::{CumulativeText, Decoder, RawEvent, StreamEvent, assemble};
use crate::tools::ToolDefinition;
use crate::transport::{self, Auth, CallGuard};
use crate::types::{
    CallOptions, Capabilities, ChatMessage, ConnectionStatus, GenerationResult, Role, TokenUsage,
    ToolCall, new_call_id,
};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, instrument};

pub struct YandexGptProvider {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl YandexGptProvider {
    pub fn new(config: ProviderConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    /// IAM token wins over the API key.
    fn auth(&self) -> Result<Auth> {
        if let Some(token) = self.config.iam_token.as_deref().filter(|t| !t.is_empty()) {
            return Ok(Auth::Bearer(token.to_string()));
        }
        let key = self
            .config
            .require(self.config.api_key.as_deref(), "api_key or iam_token")?;
        Ok(Auth::ApiKey(key.to_string()))
    }

    fn model_uri(&self, folder: &str) -> String {
        if self.config.model.starts_with("gpt://") {
            self.config.model.clone()
        } else {
            format!("gpt://{}/{}", folder, self.config.model)
        }
    }

    fn request(
        &self,
        folder: &str,
        messages: Vec<WireMessage>,
        tools: Option<Vec<Value>>,
        stream: bool,
        max_tokens: Option<u32>,
    ) -> CompletionRequest {
        CompletionRequest {
            model_uri: self.model_uri(folder),
            completion_options: CompletionOptions {
                stream,
                temperature: self.config.temperature,
                max_tokens: max_tokens.map(|t| t.to_string()),
                reasoning_options: self.config.reasoning.then(|| ReasoningOptions {
                    mode: "ENABLED_HIDDEN",
                }),
            },
            messages,
            tools,
        }
    }

    async fn post(
        &self,
        guard: &CallGuard,
        folder: &str,
        body: &CompletionRequest,
        session: Option<&SessionContext>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/completion", self.config.endpoint());
        let request = session_headers(self.auth()?.apply(self.http.post(&url)), session)
            .header("x-folder-id", folder)
            .json(body);
        transport::send(guard, request).await
    }

    async fn run_chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        session: Option<&SessionContext>,
        options: &CallOptions,
    ) -> Result<GenerationResult> {
        let folder = self.config.require(self.config.folder_id.as_deref(), "folder_id")?;
        let history = normalize_history(messages);
        let body = self.request(
            folder,
            to_wire(&history),
            (self.config.native_tools && !tools.is_empty())
                .then(|| tools.iter().map(ToolDefinition::to_yandex_format).collect()),
            true,
            self.config.max_tokens,
        );
        debug!(
            messages = body.messages.len(),
            tools = tools.len(),
            "Sending YandexGPT completion request"
        );

        let guard = CallGuard::for_call(options, self.config.timeout());
        let response = self.post(&guard, folder, &body, session).await?;
        let request_id = transport::request_id(&response);

        let mut decoder = YandexDecoder::default();
        let raw = ndjson_events(response.bytes_stream());
        let assembled = assemble(raw, &mut decoder, &guard, options.progress.clone()).await?;

        let mut result = finish_turn(&self.config.key, assembled, tools)?;
        result.request_id = request_id;
        Ok(result)
    }

    async fn check_connection(&self, options: &CallOptions) -> Result<ConnectionStatus> {
        let folder = self.config.require(self.config.folder_id.as_deref(), "folder_id")?;
        let body = self.request(
            folder,
            vec![WireMessage::text(Role::User, "ping")],
            None,
            false,
            Some(1),
        );
        let guard = CallGuard::for_call(options, self.config.timeout());
        self.post(&guard, folder, &body, None).await?;
        Ok(ConnectionStatus::ok(format!("Model {} responded", body.model_uri)))
    }
}

#[async_trait]
impl Provider for YandexGptProvider {
    fn key(&self) -> &str {
        &self.config.key
    }

    fn kind(&self) -> BackendKind {
        BackendKind::YandexGpt
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
#[serde(rename_all = "camelCase")]
struct CompletionRequest {
    model_uri: String,
    completion_options: CompletionOptions,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletionOptions {
    stream: bool,
    temperature: f32,
    /// The API takes an int64 encoded as a string.
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_options: Option<ReasoningOptions>,
}

#[derive(Serialize)]
struct ReasoningOptions {
    mode: &'static str,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_list: Option<WireToolCallList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_result_list: Option<WireToolResultList>,
}

impl WireMessage {
    fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role: role.as_str(),
            text: Some(text.into()),
            ..Self::default()
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireToolCallList {
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireToolCall {
    function_call: WireFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireToolResultList {
    tool_results: Vec<WireToolResult>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireToolResult {
    function_result: WireFunctionResult,
}

#[derive(Serialize)]
struct WireFunctionResult {
    name: String,
    content: String,
}

/// Consecutive tool results are sent as one user message.
fn to_wire(history: &[ChatMessage]) -> Vec<WireMessage> {
    let mut out: Vec<WireMessage> = Vec::with_capacity(history.len());
    for message in history {
        match message.role {
            Role::Tool => {
                let name = message
                    .tool_call_id
                    .as_deref()
                    .and_then(|id| tool_name_for(history, id))
                    .unwrap_or("unknown")
                    .to_string();
                let result = WireToolResult {
                    function_result: WireFunctionResult {
                        name,
                        content: message.text().to_string(),
                    },
                };
                match out.last_mut().and_then(|m| m.tool_result_list.as_mut()) {
                    Some(list) => list.tool_results.push(result),
                    None => out.push(WireMessage {
                        role: "user",
                        tool_result_list: Some(WireToolResultList {
                            tool_results: vec![result],
                        }),
                        ..WireMessage::default()
                    }),
                }
            }
            Role::Assistant if !message.tool_calls.is_empty() => out.push(WireMessage {
                role: "assistant",
                tool_call_list: Some(WireToolCallList {
                    tool_calls: message
                        .tool_calls
                        .iter()
                        .map(|c| WireToolCall {
                            function_call: WireFunctionCall {
                                name: c.name.clone(),
                                arguments: arguments_object(&c.arguments),
                            },
                        })
                        .collect(),
                }),
                ..WireMessage::default()
            }),
            role => out.push(WireMessage::text(role, message.text())),
        }
    }
    out
}

#[derive(Deserialize)]
struct StreamLine {
    #[serde(default)]
    result: Option<CompletionResult>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct CompletionResult {
    #[serde(default)]
    alternatives: Vec<Alternative>,
    #[serde(default)]
    usage: Option<YandexUsage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Alternative {
    #[serde(default)]
    message: Option<AlternativeMessage>,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlternativeMessage {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    tool_call_list: Option<WireToolCallList>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct YandexUsage {
    #[serde(default, deserialize_with = "lenient_u64")]
    input_text_tokens: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    completion_tokens: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    total_tokens: u64,
    #[serde(default)]
    completion_tokens_details: Option<YandexCompletionDetails>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct YandexCompletionDetails {
    #[serde(default, deserialize_with = "lenient_u64")]
    reasoning_tokens: u64,
}

impl From<YandexUsage> for TokenUsage {
    fn from(usage: YandexUsage) -> Self {
        TokenUsage {
            prompt_tokens: usage.input_text_tokens,
            completion_tokens: usage.completion_tokens,
            cached_tokens: 0,
            reasoning_tokens: usage.completion_tokens_details.map_or(0, |d| d.reasoning_tokens),
            total_tokens: usage.total_tokens,
        }
    }
}

fn finish_reason(status: &str) -> Option<&'static str> {
    match status {
        "ALTERNATIVE_STATUS_FINAL" => Some("stop"),
        "ALTERNATIVE_STATUS_TRUNCATED_FINAL" => Some("length"),
        "ALTERNATIVE_STATUS_TOOL_CALLS" => Some("tool_calls"),
        "ALTERNATIVE_STATUS_CONTENT_FILTER" => Some("content_filter"),
        _ => None,
    }
}

#[derive(Default)]
struct YandexDecoder {
    text: CumulativeText,
    /// `(name, arguments)` of calls already emitted; lists repeat across chunks.
    seen_calls: HashSet<(String, String)>,
}

impl Decoder for YandexDecoder {
    fn decode(&mut self, raw: &RawEvent) -> Result<Vec<StreamEvent>> {
        let line: StreamLine = serde_json::from_str(&raw.data)?;
        if let Some(error) = line.error {
            return Ok(vec![StreamEvent::Error(error_message(&error))]);
        }
        let Some(result) = line.result else {
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        if let Some(usage) = result.usage {
            events.push(StreamEvent::Usage(usage.into()));
        }
        let Some(alternative) = result.alternatives.into_iter().next() else {
            return Ok(events);
        };

        if let Some(message) = alternative.message {
            if let Some(delta) = message.text.as_deref().and_then(|t| self.text.delta(t)) {
                events.push(StreamEvent::TextDelta(delta));
            }
            for call in message.tool_call_list.map(|l| l.tool_calls).unwrap_or_default() {
                let arguments = match call.function_call.arguments {
                    Value::Null => "{}".to_string(),
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                let key = (call.function_call.name, arguments);
                if !self.seen_calls.insert(key.clone()) {
                    continue;
                }
                events.push(StreamEvent::ToolCall(ToolCall::native(new_call_id(), key.0, key.1)));
            }
        }

        if let Some(reason) = finish_reason(&alternative.status) {
            events.push(StreamEvent::Completed {
                status: None,
                finish_reason: Some(reason.to_string()),
            });
        }
        Ok(events)
    }
}
