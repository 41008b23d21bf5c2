//! GigaChat chat completions.
//!
//! Authentication is either a static bearer token (`api_key`) or OAuth2
//! client credentials through [`TokenCache`]. A 401 drops the cached token
//! and the request is sent once more with a fresh one.
//!
//! Function calls arrive whole in a single delta with object arguments, and
//! results go back as `role: "function"` messages carrying JSON content.

use super::{
    Provider, TokenCache, arguments_object, error_message, finish_turn, session_headers, settle,
    settle_check, tool_name_for,
};
use crate::config::{BackendKind, ProviderConfig};
use crate::session::{SessionContext, normalize_history};
use crate::stream::sse::sse_events;
use crate::stream::{Decoder, RawEvent, StreamEvent, assemble};
use crate::tools::ToolDefinition;
use crate::transport::{self, Auth, CallGuard};
use crate::types::{
    CallOptions, Capabilities, ChatMessage, ConnectionStatus, GenerationResult, Role, TokenUsage,
    ToolCall, new_call_id,
};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

const SESSION_HEADER: &str = "X-Session-ID";

enum Credentials {
    OAuth(TokenCache),
    Static(String),
    Missing,
}

pub struct GigaChatProvider {
    config: ProviderConfig,
    http: reqwest::Client,
    credentials: Credentials,
}

impl GigaChatProvider {
    pub fn new(config: ProviderConfig, http: reqwest::Client) -> Self {
        let oauth = config
            .oauth
            .clone()
            .filter(|o| o.auth_key.as_deref().is_some_and(|k| !k.trim().is_empty()));
        let credentials = match (oauth, config.api_key.as_deref()) {
            (Some(settings), _) => Credentials::OAuth(TokenCache::new(settings, http.clone())),
            (None, Some(key)) if !key.trim().is_empty() => Credentials::Static(key.to_string()),
            _ => Credentials::Missing,
        };
        Self {
            config,
            http,
            credentials,
        }
    }

    async fn auth(&self, guard: &CallGuard) -> Result<Auth> {
        match &self.credentials {
            Credentials::OAuth(cache) => Ok(Auth::Bearer(cache.token(guard).await?)),
            Credentials::Static(token) => Ok(Auth::Bearer(token.clone())),
            Credentials::Missing => Err(Error::config(format!(
                "oauth.auth_key or api_key is required for provider '{}' (gigachat)",
                self.config.key
            ))),
        }
    }

    /// Send with auth, retrying once with a fresh token after a 401.
    async fn send_authorized(
        &self,
        guard: &CallGuard,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let request = self.auth(guard).await?.apply(build());
        match transport::send(guard, request).await {
            Err(Error::Api { status: 401, .. }) if matches!(self.credentials, Credentials::OAuth(_)) => {
                warn!(provider = %self.config.key, "Access token rejected, refreshing");
                if let Credentials::OAuth(cache) = &self.credentials {
                    cache.invalidate().await;
                }
                let request = self.auth(guard).await?.apply(build());
                transport::send(guard, request).await
            }
            other => other,
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
        let with_functions = self.config.native_tools && !tools.is_empty();
        let request = GigaChatRequest {
            model: &self.config.model,
            messages: history.iter().map(|m| to_wire(m, &history)).collect(),
            stream: true,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            functions: with_functions
                .then(|| tools.iter().map(ToolDefinition::to_gigachat_format).collect()),
            function_call: with_functions.then_some("auto"),
        };
        debug!(
            messages = request.messages.len(),
            tools = tools.len(),
            "Sending GigaChat request"
        );

        let guard = CallGuard::for_call(options, self.config.timeout());
        let url = format!("{}/chat/completions", self.config.endpoint());
        let session_id = session.and_then(|s| {
            (!s.extra_headers.keys().any(|k| k.eq_ignore_ascii_case(SESSION_HEADER)))
                .then(|| s.session_id.clone())
        });
        let response = self
            .send_authorized(&guard, || {
                let mut builder = session_headers(self.http.post(&url), session)
                    .header("X-Request-ID", uuid::Uuid::new_v4().to_string());
                if let Some(id) = &session_id {
                    builder = builder.header(SESSION_HEADER, id.as_str());
                }
                builder.json(&request)
            })
            .await?;
        let request_id = transport::request_id(&response);

        let raw = sse_events(response.bytes_stream());
        let mut decoder = GigaChatDecoder::default();
        let assembled = assemble(raw, &mut decoder, &guard, options.progress.clone()).await?;

        let mut result = finish_turn(&self.config.key, assembled, tools)?;
        result.request_id = request_id;
        Ok(result)
    }

    async fn check_connection(&self, options: &CallOptions) -> Result<ConnectionStatus> {
        let guard = CallGuard::for_call(options, self.config.timeout());
        let url = format!("{}/models", self.config.endpoint());
        let response = self.send_authorized(&guard, || self.http.get(&url)).await?;
        let models: ModelList = guard.run(response.json()).await??;

        let wanted = self.config.model.as_str();
        if models.data.iter().any(|m| m.id == wanted) {
            Ok(ConnectionStatus::ok(format!("Model {wanted} is available")))
        } else {
            Ok(ConnectionStatus::failed(format!(
                "Authorized, but model {wanted} is not offered ({} models listed)",
                models.data.len()
            )))
        }
    }
}

#[async_trait]
impl Provider for GigaChatProvider {
    fn key(&self) -> &str {
        &self.config.key
    }

    fn kind(&self) -> BackendKind {
        BackendKind::GigaChat
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_tools: true,
            supports_conversation_reset: false,
            supports_reasoning: false,
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
struct GigaChatRequest<'a> {
    model: &'a str,
    messages: Vec<GigaChatMessage>,
    stream: bool,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    functions: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<&'static str>,
}

#[derive(Serialize)]
struct GigaChatMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<GigaChatFunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    functions_state_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct GigaChatFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Function results must be JSON; plain text is wrapped in an object.
fn result_content(output: &str, is_error: bool) -> String {
    match serde_json::from_str::<Value>(output) {
        Ok(value) if value.is_object() && !is_error => output.to_string(),
        _ if is_error => json!({ "error": output }).to_string(),
        _ => json!({ "result": output }).to_string(),
    }
}

/// Whether `call_id` is the call replayed for its assistant turn.
fn is_replayed_call(history: &[ChatMessage], call_id: &str) -> bool {
    history
        .iter()
        .filter_map(|m| m.tool_calls.first())
        .any(|c| c.id == call_id)
}

fn to_wire(message: &ChatMessage, history: &[ChatMessage]) -> GigaChatMessage {
    match message.role {
        // Results of dropped extra calls have no function turn to answer, so
        // they go back as plain user text.
        Role::Tool
            if message
                .tool_call_id
                .as_deref()
                .is_some_and(|id| !is_replayed_call(history, id)) =>
        {
            let id = message.tool_call_id.as_deref().unwrap_or_default();
            let name = tool_name_for(history, id).unwrap_or("unknown");
            debug!(call_id = id, tool = name, "narrating result of unreplayed function call");
            let content = if message.is_error {
                format!("The tool `{name}` failed with this error:\n{}", message.text())
            } else {
                format!("The tool `{name}` returned:\n{}", message.text())
            };
            GigaChatMessage {
                role: "user",
                content,
                function_call: None,
                functions_state_id: None,
                name: None,
            }
        }
        Role::Tool => GigaChatMessage {
            role: "function",
            content: result_content(message.text(), message.is_error),
            function_call: None,
            functions_state_id: None,
            name: message
                .tool_call_id
                .as_deref()
                .and_then(|id| tool_name_for(history, id))
                .map(str::to_string),
        },
        // One function call per assistant turn; extra calls are dropped.
        Role::Assistant if !message.tool_calls.is_empty() => {
            let call = &message.tool_calls[0];
            GigaChatMessage {
                role: "assistant",
                content: message.text().to_string(),
                function_call: Some(GigaChatFunctionCall {
                    name: call.name.clone(),
                    arguments: arguments_object(&call.arguments),
                }),
                functions_state_id: Some(call.id.clone()),
                name: None,
            }
        }
        role => GigaChatMessage {
            role: role.as_str(),
            content: message.text().to_string(),
            function_call: None,
            functions_state_id: None,
            name: None,
        },
    }
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Deserialize)]
struct GigaChatChunk {
    #[serde(default)]
    choices: Vec<GigaChatChoice>,
    #[serde(default)]
    usage: Option<GigaChatUsage>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct GigaChatChoice {
    #[serde(default)]
    delta: Option<GigaChatDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GigaChatDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    function_call: Option<GigaChatFunctionCall>,
    #[serde(default)]
    functions_state_id: Option<String>,
}

#[derive(Deserialize)]
struct GigaChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
    #[serde(default)]
    precached_prompt_tokens: u64,
}

impl From<GigaChatUsage> for TokenUsage {
    fn from(usage: GigaChatUsage) -> Self {
        TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cached_tokens: usage.precached_prompt_tokens,
            reasoning_tokens: 0,
            total_tokens: usage.total_tokens,
        }
    }
}

#[derive(Default)]
struct GigaChatDecoder {
    finish_reason: Option<String>,
}

impl Decoder for GigaChatDecoder {
    fn decode(&mut self, raw: &RawEvent) -> Result<Vec<StreamEvent>> {
        if raw.is_done_sentinel() {
            return Ok(vec![StreamEvent::Completed {
                status: None,
                finish_reason: self.finish_reason.take(),
            }]);
        }

        let chunk: GigaChatChunk = serde_json::from_str(&raw.data)?;
        if let Some(error) = chunk.error {
            return Ok(vec![StreamEvent::Error(error_message(&error))]);
        }

        let mut events = Vec::new();
        for choice in chunk.choices {
            if let Some(delta) = choice.delta {
                if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                    events.push(StreamEvent::TextDelta(content));
                }
                if let Some(call) = delta.function_call {
                    let arguments = match call.arguments {
                        Value::Null => "{}".to_string(),
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    let id = delta.functions_state_id.unwrap_or_else(new_call_id);
                    events.push(StreamEvent::ToolCall(ToolCall::native(id, call.name, arguments)));
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
