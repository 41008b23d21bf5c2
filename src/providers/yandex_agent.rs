//! Yandex AI Studio agents over the Responses API (`{base}/responses`).
//!
//! The agent is a stored prompt addressed by id. Conversation state lives on
//! the server: every completed response id becomes the continuation for the
//! next turn, and only the new input items are sent. A response that ends in
//! any status other than `completed` clears the continuation.

use super::{Provider, error_message, finish_turn, session_headers, settle, settle_check};
use crate::config::{BackendKind, ProviderConfig};
use crate::session::{SessionContext, TurnItem, plan_turn};
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
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, instrument};

const COMPLETED: &str = "completed";

pub struct YandexAgentProvider {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl YandexAgentProvider {
    pub fn new(config: ProviderConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    fn auth(&self) -> Result<Auth> {
        if let Some(token) = self.config.iam_token.as_deref().filter(|t| !t.is_empty()) {
            return Ok(Auth::Bearer(token.to_string()));
        }
        let key = self
            .config
            .require(self.config.api_key.as_deref(), "api_key or iam_token")?;
        Ok(Auth::ApiKey(key.to_string()))
    }

    /// Configured variables overlaid with per-call ones.
    fn variables(&self, options: &CallOptions) -> BTreeMap<String, String> {
        let mut merged = self.config.variables.clone();
        merged.extend(options.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    fn body<'a>(
        &'a self,
        agent_id: &'a str,
        input: Vec<InputItem>,
        previous_response_id: Option<&'a str>,
        tools: &[ToolDefinition],
        options: &CallOptions,
        stream: bool,
    ) -> ResponsesRequest<'a> {
        ResponsesRequest {
            prompt: PromptRef {
                id: agent_id,
                variables: self.variables(options),
            },
            input,
            previous_response_id,
            stream,
            model: Some(self.config.model.as_str()).filter(|m| !m.is_empty()),
            max_output_tokens: self.config.max_tokens,
            tools: (!tools.is_empty())
                .then(|| tools.iter().map(ToolDefinition::to_responses_format).collect()),
        }
    }

    async fn post(
        &self,
        guard: &CallGuard,
        body: &ResponsesRequest<'_>,
        session: Option<&SessionContext>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/responses", self.config.endpoint());
        let mut request = session_headers(self.auth()?.apply(self.http.post(&url)), session);
        if let Some(folder) = self.config.folder_id.as_deref().filter(|f| !f.is_empty()) {
            request = request.header("x-folder-id", folder);
        }
        transport::send(guard, request.json(body)).await
    }

    async fn run_chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        session: Option<&SessionContext>,
        options: &CallOptions,
    ) -> Result<GenerationResult> {
        let agent_id = self.config.require(self.config.agent_id.as_deref(), "agent_id")?;
        let previous = session.and_then(|s| s.continuation_id.as_deref());
        let input: Vec<InputItem> = plan_turn(messages, session)
            .into_iter()
            .map(InputItem::from)
            .collect();
        let body = self.body(agent_id, input, previous, tools, options, true);
        debug!(
            items = body.input.len(),
            tools = tools.len(),
            continuing = previous.is_some(),
            "Sending agent request"
        );

        let guard = CallGuard::for_call(options, self.config.timeout());
        let response = self.post(&guard, &body, session).await?;
        let request_id = transport::request_id(&response);

        let mut decoder = AgentDecoder::default();
        let raw = sse_events(response.bytes_stream());
        let assembled = assemble(raw, &mut decoder, &guard, options.progress.clone()).await?;
        let status = assembled.status.clone().or_else(|| decoder.status.clone());
        let response_id = assembled.response_id.clone();

        match finish_turn(&self.config.key, assembled, tools) {
            Ok(result) => {
                let continuation = response_id.filter(|_| status.as_deref() == Some(COMPLETED));
                let mut result = result.with_continuation(continuation);
                result.terminal_status = status;
                result.request_id = request_id;
                Ok(result)
            }
            // A failed response still reports its status so the conversation resets.
            Err(e) if status.is_some() => {
                let mut failed = settle(&self.config.key, Err(e))?;
                failed.terminal_status = status;
                failed.request_id = request_id;
                Ok(failed)
            }
            Err(e) => Err(e),
        }
    }

    async fn check_connection(&self, options: &CallOptions) -> Result<ConnectionStatus> {
        let agent_id = self.config.require(self.config.agent_id.as_deref(), "agent_id")?;
        let input = vec![InputItem::from(TurnItem::Message {
            role: crate::types::Role::User,
            content: "ping".to_string(),
        })];
        let body = self.body(agent_id, input, None, &[], options, false);
        let guard = CallGuard::for_call(options, self.config.timeout());
        self.post(&guard, &body, None).await?;
        Ok(ConnectionStatus::ok(format!("Agent {agent_id} responded")))
    }
}

#[async_trait]
impl Provider for YandexAgentProvider {
    fn key(&self) -> &str {
        &self.config.key
    }

    fn kind(&self) -> BackendKind {
        BackendKind::YandexAgent
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_tools: true,
            supports_conversation_reset: true,
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
struct ResponsesRequest<'a> {
    prompt: PromptRef<'a>,
    input: Vec<InputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_response_id: Option<&'a str>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
}

#[derive(Serialize)]
struct PromptRef<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    variables: BTreeMap<String, String>,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputItem {
    Message {
        role: &'static str,
        content: String,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

impl From<TurnItem> for InputItem {
    fn from(item: TurnItem) -> Self {
        match item {
            TurnItem::Message { role, content } => InputItem::Message {
                role: role.as_str(),
                content,
            },
            TurnItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => InputItem::FunctionCall {
                call_id,
                name,
                arguments,
            },
            TurnItem::FunctionOutput { call_id, output } => {
                InputItem::FunctionCallOutput { call_id, output }
            }
        }
    }
}

/// Union of the stream payload fields this adapter reads.
#[derive(Deserialize, Default)]
struct AgentEvent {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    output_index: Option<usize>,
    #[serde(default)]
    item: Option<OutputItem>,
    #[serde(default)]
    response: Option<ResponseBody>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct OutputItem {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct ResponseBody {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    usage: Option<ResponsesUsage>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    incomplete_details: Option<IncompleteDetails>,
}

#[derive(Deserialize)]
struct IncompleteDetails {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponsesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
    #[serde(default)]
    input_tokens_details: Option<InputDetails>,
    #[serde(default)]
    output_tokens_details: Option<OutputDetails>,
}

#[derive(Deserialize)]
struct InputDetails {
    #[serde(default)]
    cached_tokens: u64,
}

#[derive(Deserialize)]
struct OutputDetails {
    #[serde(default)]
    reasoning_tokens: u64,
}

impl From<ResponsesUsage> for TokenUsage {
    fn from(usage: ResponsesUsage) -> Self {
        TokenUsage {
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            cached_tokens: usage.input_tokens_details.map_or(0, |d| d.cached_tokens),
            reasoning_tokens: usage.output_tokens_details.map_or(0, |d| d.reasoning_tokens),
            total_tokens: usage.total_tokens,
        }
    }
}

/// Tracks function-call items by output index and the last reported status.
#[derive(Default)]
struct AgentDecoder {
    status: Option<String>,
    calls: HashSet<usize>,
    streamed_arguments: HashSet<usize>,
}

impl AgentDecoder {
    fn terminal(&mut self, response: ResponseBody, fallback: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if let Some(id) = response.id {
            events.push(StreamEvent::ResponseId(id));
        }
        if let Some(usage) = response.usage {
            events.push(StreamEvent::Usage(usage.into()));
        }
        let status = response.status.unwrap_or_else(|| fallback.to_string());
        self.status = Some(status.clone());

        if status == "failed" {
            let message = response
                .error
                .as_ref()
                .map(error_message)
                .unwrap_or_else(|| "response failed".to_string());
            events.push(StreamEvent::Error(message));
            return events;
        }

        let finish_reason = match status.as_str() {
            COMPLETED if !self.calls.is_empty() => "tool_calls".to_string(),
            COMPLETED => "stop".to_string(),
            _ => match response.incomplete_details.and_then(|d| d.reason).as_deref() {
                Some("max_output_tokens") => "length".to_string(),
                Some(reason) => reason.to_string(),
                None => status.clone(),
            },
        };
        events.push(StreamEvent::Completed {
            status: Some(status),
            finish_reason: Some(finish_reason),
        });
        events
    }
}

impl Decoder for AgentDecoder {
    fn decode(&mut self, raw: &RawEvent) -> Result<Vec<StreamEvent>> {
        if raw.is_done_sentinel() {
            return Ok(vec![StreamEvent::Completed {
                status: self.status.clone(),
                finish_reason: None,
            }]);
        }

        let event: AgentEvent = serde_json::from_str(&raw.data)?;
        let kind = raw
            .event
            .clone()
            .or_else(|| event.kind.clone())
            .unwrap_or_default();

        let events = match kind.as_str() {
            "response.created" | "response.in_progress" => {
                let response = event.response;
                if let Some(status) = response.as_ref().and_then(|r| r.status.clone()) {
                    self.status = Some(status);
                }
                response
                    .and_then(|r| r.id)
                    .map(StreamEvent::ResponseId)
                    .into_iter()
                    .collect()
            }
            "response.output_text.delta" | "response.refusal.delta" => {
                event.delta.map(StreamEvent::TextDelta).into_iter().collect()
            }
            "response.reasoning_text.delta" | "response.reasoning_summary_text.delta" => event
                .delta
                .map(StreamEvent::ReasoningDelta)
                .into_iter()
                .collect(),
            "response.output_item.added" => match (event.item, event.output_index) {
                (Some(item), Some(index)) if item.kind == "function_call" => {
                    self.calls.insert(index);
                    let arguments = item.arguments.unwrap_or_default();
                    if !arguments.is_empty() {
                        self.streamed_arguments.insert(index);
                    }
                    vec![StreamEvent::ToolCallDelta {
                        index,
                        id: item.call_id,
                        name: item.name,
                        arguments,
                    }]
                }
                _ => Vec::new(),
            },
            "response.function_call_arguments.delta" => match (event.delta, event.output_index) {
                (Some(delta), Some(index)) => {
                    self.calls.insert(index);
                    self.streamed_arguments.insert(index);
                    vec![StreamEvent::ToolCallDelta {
                        index,
                        id: None,
                        name: None,
                        arguments: delta,
                    }]
                }
                _ => Vec::new(),
            },
            "response.output_item.done" => match (event.item, event.output_index) {
                (Some(item), Some(index))
                    if item.kind == "function_call" && !self.streamed_arguments.contains(&index) =>
                {
                    self.calls.insert(index);
                    self.streamed_arguments.insert(index);
                    vec![StreamEvent::ToolCallDelta {
                        index,
                        id: item.call_id,
                        name: item.name,
                        arguments: item.arguments.unwrap_or_default(),
                    }]
                }
                _ => Vec::new(),
            },
            "response.completed" | "response.incomplete" | "response.failed" => {
                let fallback = kind.trim_start_matches("response.").to_string();
                match event.response {
                    Some(response) => self.terminal(response, &fallback),
                    None => {
                        self.status = Some(fallback.clone());
                        vec![StreamEvent::Completed {
                            status: Some(fallback),
                            finish_reason: None,
                        }]
                    }
                }
            }
            "error" => {
                let message = event
                    .message
                    .or_else(|| event.error.as_ref().map(error_message))
                    .unwrap_or_else(|| "unknown agent error".to_string());
                self.status = Some("failed".to_string());
                vec![StreamEvent::Error(message)]
            }
            _ => Vec::new(),
        };
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    fn decode_all(decoder: &mut AgentDecoder, raws: &[RawEvent]) -> Vec<StreamEvent> {
        raws.iter()
            .flat_map(|r| decoder.decode(r).unwrap())
            .collect()
    }

    #[test]
    fn test_text_turn_completes_with_response_id() {
        let mut decoder = AgentDecoder::default();
        let events = decode_all(
            &mut decoder,
            &[
                RawEvent::typed(
                    "response.created",
                    r#"{"type":"response.created","response":{"id":"resp_1","status":"in_progress"}}"#,
                ),
                RawEvent::typed("response.output_text.delta", r#"{"delta":"Мол"}"#),
                RawEvent::typed("response.output_text.delta", r#"{"delta":"око"}"#),
                RawEvent::typed(
                    "response.completed",
                    r#"{"response":{"id":"resp_1","status":"completed","usage":{"input_tokens":10,"output_tokens":2,"total_tokens":12,"input_tokens_details":{"cached_tokens":4}}}}"#,
                ),
            ],
        );

        let mut usage = TokenUsage::new(10, 2);
        usage.cached_tokens = 4;
        assert_eq!(
            events,
            vec![
                StreamEvent::ResponseId("resp_1".into()),
                StreamEvent::TextDelta("Мол".into()),
                StreamEvent::TextDelta("око".into()),
                StreamEvent::ResponseId("resp_1".into()),
                StreamEvent::Usage(usage),
                StreamEvent::Completed {
                    status: Some("completed".into()),
                    finish_reason: Some("stop".into())
                },
            ]
        );
    }

    #[test]
    fn test_type_from_payload_when_event_line_missing() {
        let mut decoder = AgentDecoder::default();
        let events = decoder
            .decode(&RawEvent::data(r#"{"type":"response.output_text.delta","delta":"hi"}"#))
            .unwrap();
        assert_eq!(events, vec![StreamEvent::TextDelta("hi".into())]);
    }

    #[test]
    fn test_function_call_streamed_by_output_index() {
        let mut decoder = AgentDecoder::default();
        let events = decode_all(
            &mut decoder,
            &[
                RawEvent::typed(
                    "response.output_item.added",
                    r#"{"output_index":1,"item":{"type":"function_call","id":"fc_1","call_id":"call_1","name":"lookup","arguments":""}}"#,
                ),
                RawEvent::typed(
                    "response.function_call_arguments.delta",
                    r#"{"output_index":1,"delta":"{\"id\":"}"#,
                ),
                RawEvent::typed(
                    "response.function_call_arguments.delta",
                    r#"{"output_index":1,"delta":"7}"}"#,
                ),
                RawEvent::typed(
                    "response.output_item.done",
                    r#"{"output_index":1,"item":{"type":"function_call","call_id":"call_1","name":"lookup","arguments":"{\"id\":7}"}}"#,
                ),
            ],
        );
        let arguments: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCallDelta { arguments, .. } => Some(arguments.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(arguments, "{\"id\":7}");
        assert_eq!(events.len(), 3);

        let done = decoder
            .decode(&RawEvent::typed(
                "response.completed",
                r#"{"response":{"id":"resp_2","status":"completed"}}"#,
            ))
            .unwrap();
        assert!(matches!(
            done.last(),
            Some(StreamEvent::Completed { finish_reason: Some(r), .. }) if r == "tool_calls"
        ));
    }

    #[test]
    fn test_item_done_without_deltas_emits_arguments() {
        let mut decoder = AgentDecoder::default();
        let events = decoder
            .decode(&RawEvent::typed(
                "response.output_item.done",
                r#"{"output_index":0,"item":{"type":"function_call","call_id":"call_9","name":"lookup","arguments":"{\"id\":9}"}}"#,
            ))
            .unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::ToolCallDelta {
                index: 0,
                id: Some("call_9".into()),
                name: Some("lookup".into()),
                arguments: "{\"id\":9}".into()
            }]
        );
    }

    #[test]
    fn test_failed_response_reports_error_and_status() {
        let mut decoder = AgentDecoder::default();
        let events = decoder
            .decode(&RawEvent::typed(
                "response.failed",
                r#"{"response":{"id":"resp_3","status":"failed","error":{"code":"server_error","message":"agent crashed"}}}"#,
            ))
            .unwrap();
        assert_eq!(events.last(), Some(&StreamEvent::Error("agent crashed".into())));
        assert_eq!(decoder.status.as_deref(), Some("failed"));
    }

    #[test]
    fn test_incomplete_maps_length() {
        let mut decoder = AgentDecoder::default();
        let events = decoder
            .decode(&RawEvent::typed(
                "response.incomplete",
                r#"{"response":{"id":"resp_4","status":"incomplete","incomplete_details":{"reason":"max_output_tokens"}}}"#,
            ))
            .unwrap();
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Completed {
                status: Some("incomplete".into()),
                finish_reason: Some("length".into())
            })
        );
    }

    #[test]
    fn test_input_items_wire_shape() {
        let items: Vec<InputItem> = vec![
            TurnItem::Message {
                role: Role::User,
                content: "hi".into(),
            },
            TurnItem::FunctionCall {
                call_id: "call_1".into(),
                name: "lookup".into(),
                arguments: "{}".into(),
            },
            TurnItem::FunctionOutput {
                call_id: "call_1".into(),
                output: "found".into(),
            },
        ]
        .into_iter()
        .map(InputItem::from)
        .collect();
        let wire = serde_json::to_value(&items).unwrap();
        assert_eq!(wire[0]["type"], "message");
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[1]["type"], "function_call");
        assert_eq!(wire[2]["type"], "function_call_output");
        assert_eq!(wire[2]["output"], "found");
    }
}
