//! Ollama native API (`/api/chat`, `/api/generate`), line-delimited JSON.

use super::{
    Provider, arguments_object, finish_turn, session_headers, settle, settle_check, tool_name_for,
};
use crate::config::{BackendKind, ProviderConfig};
use crate::session::{SessionContext, normalize_history};
use crate::stream::ndjson::ndjson_events;
use crate::stream::{Decoder, RawEvent, StreamEvent, assemble};
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
use tracing::{debug, instrument};

pub struct OllamaProvider {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: ProviderConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    fn auth(&self) -> Auth {
        match self.config.api_key.as_deref() {
            Some(key) if !key.is_empty() => Auth::Bearer(key.to_string()),
            _ => Auth::None,
        }
    }

    fn options(&self) -> OllamaOptions {
        OllamaOptions {
            temperature: self.config.temperature,
            num_predict: self.config.max_tokens,
        }
    }

    fn think(&self) -> Option<bool> {
        self.config.reasoning.then_some(true)
    }

    async fn stream_request<B: Serialize>(
        &self,
        path: &str,
        body: &B,
        tools: &[ToolDefinition],
        session: Option<&SessionContext>,
        options: &CallOptions,
    ) -> Result<GenerationResult> {
        let guard = CallGuard::for_call(options, self.config.timeout());
        let url = format!("{}{}", self.config.endpoint(), path);
        let request = session_headers(self.auth().apply(self.http.post(&url)), session).json(body);

        let response = transport::send(&guard, request).await?;
        let request_id = transport::request_id(&response);
        let raw = ndjson_events(response.bytes_stream());
        let assembled = assemble(raw, &mut OllamaDecoder, &guard, options.progress.clone()).await?;

        let mut result = finish_turn(&self.config.key, assembled, tools)?;
        result.request_id = request_id;
        Ok(result)
    }

    async fn run_chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        session: Option<&SessionContext>,
        options: &CallOptions,
    ) -> Result<GenerationResult> {
        let history = normalize_history(messages);
        let body = ChatRequest {
            model: &self.config.model,
            messages: history.iter().map(|m| to_wire(m, &history)).collect(),
            tools: (self.config.native_tools && !tools.is_empty())
                .then(|| tools.iter().map(ToolDefinition::to_openai_format).collect()),
            stream: true,
            think: self.think(),
            options: self.options(),
        };
        debug!(
            messages = body.messages.len(),
            tools = tools.len(),
            "Sending Ollama chat request"
        );
        self.stream_request("/api/chat", &body, tools, session, options)
            .await
    }

    async fn check_connection(&self, options: &CallOptions) -> Result<ConnectionStatus> {
        let guard = CallGuard::for_call(options, self.config.timeout());
        let url = format!("{}/api/tags", self.config.endpoint());
        let response = transport::send(&guard, self.auth().apply(self.http.get(&url))).await?;
        let tags: TagsResponse = guard.run(response.json()).await??;

        let wanted = self.config.model.as_str();
        let found = tags
            .models
            .iter()
            .any(|m| m.name == wanted || m.name.strip_suffix(":latest") == Some(wanted));
        if found {
            Ok(ConnectionStatus::ok(format!("Model {wanted} is available")))
        } else {
            Ok(ConnectionStatus::failed(format!(
                "Server reachable, but model {wanted} is not pulled ({} models installed)",
                tags.models.len()
            )))
        }
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn key(&self) -> &str {
        &self.config.key
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Ollama
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
    async fn generate(
        &self,
        prompt: &str,
        session: Option<&SessionContext>,
        options: &CallOptions,
    ) -> Result<GenerationResult> {
        let body = GenerateRequest {
            model: &self.config.model,
            prompt,
            stream: true,
            think: self.think(),
            options: self.options(),
        };
        settle(
            &self.config.key,
            self.stream_request("/api/generate", &body, &[], session, options)
                .await,
        )
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
struct OllamaOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    think: Option<bool>,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    think: Option<bool>,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    function: WireFunction,
}

#[derive(Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

fn to_wire(message: &ChatMessage, history: &[ChatMessage]) -> WireMessage {
    let tool_name = match (message.role, message.tool_call_id.as_deref()) {
        (Role::Tool, Some(id)) => tool_name_for(history, id).map(str::to_string),
        _ => None,
    };
    WireMessage {
        role: message.role.as_str(),
        content: message.text().to_string(),
        tool_calls: message
            .tool_calls
            .iter()
            .map(|c| WireToolCall {
                id: Some(c.id.clone()),
                function: WireFunction {
                    name: c.name.clone(),
                    arguments: arguments_object(&c.arguments),
                },
            })
            .collect(),
        tool_name,
    }
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
}

/// One line of either `/api/chat` or `/api/generate`.
#[derive(Deserialize)]
struct StreamLine {
    #[serde(default)]
    message: Option<LineMessage>,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct LineMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

struct OllamaDecoder;

impl Decoder for OllamaDecoder {
    fn decode(&mut self, raw: &RawEvent) -> Result<Vec<StreamEvent>> {
        let line: StreamLine = serde_json::from_str(&raw.data)?;
        if let Some(error) = line.error {
            return Ok(vec![StreamEvent::Error(error)]);
        }

        let mut events = Vec::new();
        if let Some(message) = line.message {
            if let Some(thinking) = message.thinking.filter(|t| !t.is_empty()) {
                events.push(StreamEvent::ReasoningDelta(thinking));
            }
            if !message.content.is_empty() {
                events.push(StreamEvent::TextDelta(message.content));
            }
            for call in message.tool_calls {
                let arguments = match call.function.arguments {
                    Value::Null => "{}".to_string(),
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                events.push(StreamEvent::ToolCall(ToolCall::native(
                    call.id.unwrap_or_else(new_call_id),
                    call.function.name,
                    arguments,
                )));
            }
        }
        if let Some(thinking) = line.thinking.filter(|t| !t.is_empty()) {
            events.push(StreamEvent::ReasoningDelta(thinking));
        }
        if let Some(text) = line.response.filter(|t| !t.is_empty()) {
            events.push(StreamEvent::TextDelta(text));
        }

        if line.done {
            if line.prompt_eval_count.is_some() || line.eval_count.is_some() {
                events.push(StreamEvent::Usage(TokenUsage::new(
                    line.prompt_eval_count.unwrap_or(0),
                    line.eval_count.unwrap_or(0),
                )));
            }
            events.push(StreamEvent::Completed {
                status: None,
                finish_reason: line.done_reason,
            });
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(line: &str) -> Result<Vec<StreamEvent>> {
        OllamaDecoder.decode(&RawEvent::data(line))
    }

    #[test]
    fn test_decode_text_and_done() {
        let events = decode(r#"{"model":"qwen3","message":{"role":"assistant","content":"4"},"done":false}"#).unwrap();
        assert_eq!(events, vec![StreamEvent::TextDelta("4".into())]);

        let events = decode(
            r#"{"model":"qwen3","message":{"role":"assistant","content":""},"done":true,"done_reason":"stop","prompt_eval_count":12,"eval_count":3}"#,
        )
        .unwrap();
        assert_eq!(
            events,
            vec![
                StreamEvent::Usage(TokenUsage::new(12, 3)),
                StreamEvent::Completed {
                    status: None,
                    finish_reason: Some("stop".into())
                }
            ]
        );
    }

    #[test]
    fn test_decode_tool_call_with_object_arguments() {
        let events = decode(
            r#"{"model":"qwen3","message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"lookup","arguments":{"id":7}}}]},"done":false}"#,
        )
        .unwrap();
        match &events[0] {
            StreamEvent::ToolCall(call) => {
                assert_eq!(call.name, "lookup");
                assert_eq!(call.arguments, "{\"id\":7}");
                assert!(!call.recovered_from_text);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_generate_line_and_thinking() {
        let events = decode(r#"{"model":"m","response":"Hi","thinking":"hmm","done":false}"#).unwrap();
        assert_eq!(
            events,
            vec![
                StreamEvent::ReasoningDelta("hmm".into()),
                StreamEvent::TextDelta("Hi".into())
            ]
        );
    }

    #[test]
    fn test_decode_error_line() {
        let events = decode(r#"{"error":"model 'x' not found"}"#).unwrap();
        assert_eq!(events, vec![StreamEvent::Error("model 'x' not found".into())]);
    }

    #[test]
    fn test_decode_malformed_line() {
        assert!(decode("{not json").is_err());
    }

    #[test]
    fn test_tool_result_carries_tool_name() {
        let history = vec![
            ChatMessage::assistant_tool_calls(None, vec![ToolCall::native("c1", "lookup", "{\"id\":7}")]),
            ChatMessage::tool_result("c1", "found"),
        ];
        let wire = to_wire(&history[1], &history);
        assert_eq!(wire.role, "tool");
        assert_eq!(wire.tool_name.as_deref(), Some("lookup"));

        let assistant = to_wire(&history[0], &history);
        assert_eq!(assistant.tool_calls[0].function.arguments["id"], 7);
    }
}
