//! Conversation state and history shaping
//!
//! Continuation state is a value owned by the caller. A [`Conversation`]
//! holds the current [`SessionContext`]; each call passes it to the provider
//! and feeds the [`GenerationResult`] back through [`Conversation::apply`],
//! which decides whether the backend-side continuation survives:
//!
//! | outcome | continuation |
//! |---|---|
//! | success, terminal status `completed` or none | replaced by the result's id |
//! | terminal status other than `completed` | cleared |
//! | failure mentioning a tool-history mismatch | cleared |
//! | any other failure | preserved |
//!
//! The history helpers turn a caller's message list into what each backend
//! family can accept. Calls recovered from text never reach a backend as
//! native tool traffic: their results are narrated back as a user message.

use crate::types::{ChatMessage, GenerationResult, Operation, Role, ToolCall};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Per-conversation call context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: String,
    /// Backend token continuing the previous turn, if any.
    pub continuation_id: Option<String>,
    pub operation: Option<Operation>,
    /// Extra request headers (e.g. a client-chosen session header).
    pub extra_headers: BTreeMap<String, String>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            session_id: new_session_id(),
            continuation_id: None,
            operation: None,
            extra_headers: BTreeMap::new(),
        }
    }

    pub fn for_operation(operation: impl Into<Operation>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..Self::new()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(name.into(), value.into());
        self
    }

    /// Same session with a different continuation id.
    pub fn with_continuation(&self, continuation_id: Option<String>) -> Self {
        Self {
            continuation_id,
            ..self.clone()
        }
    }

    /// Same session, continuation dropped.
    pub fn cleared(&self) -> Self {
        self.with_continuation(None)
    }

    pub fn is_continuing(&self) -> bool {
        self.continuation_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

/// UTC timestamp plus a random hex suffix.
pub fn new_session_id() -> String {
    format!(
        "{}-{:08x}",
        Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
        rand::random::<u32>()
    )
}

/// Whether the next turn sends the full history or only the delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnMode {
    New,
    Continuing,
}

/// Caller-owned conversation state.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    current: SessionContext,
    previous: Option<SessionContext>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_operation(operation: impl Into<Operation>) -> Self {
        Self {
            current: SessionContext::for_operation(operation),
            previous: None,
        }
    }

    pub fn from_session(session: SessionContext) -> Self {
        Self {
            current: session,
            previous: None,
        }
    }

    pub fn session(&self) -> &SessionContext {
        &self.current
    }

    /// Context as it was before the last transition.
    pub fn previous(&self) -> Option<&SessionContext> {
        self.previous.as_ref()
    }

    pub fn mode(&self) -> TurnMode {
        if self.current.is_continuing() {
            TurnMode::Continuing
        } else {
            TurnMode::New
        }
    }

    fn transition(&mut self, next: SessionContext) {
        let prev = std::mem::replace(&mut self.current, next);
        self.previous = Some(prev);
    }

    /// Drop the continuation; the next turn sends the full history.
    pub fn reset(&mut self) {
        let next = self.current.cleared();
        self.transition(next);
    }

    /// Continue from a context produced elsewhere, such as a provider reset.
    pub fn restart(&mut self, session: SessionContext) {
        self.transition(session);
    }

    /// Update the continuation from a call outcome.
    pub fn apply(&mut self, result: &GenerationResult) {
        if let Some(status) = result.terminal_status.as_deref() {
            if status != "completed" {
                warn!(
                    session_id = %self.current.session_id,
                    status,
                    "Response not completed, dropping continuation"
                );
                self.reset();
                return;
            }
        }

        if result.success {
            let next = self.current.with_continuation(result.continuation_id.clone());
            self.transition(next);
            return;
        }

        if result.error.as_deref().is_some_and(is_tool_history_mismatch) {
            warn!(
                session_id = %self.current.session_id,
                "Backend rejected tool history, dropping continuation"
            );
            self.reset();
        } else {
            debug!(
                session_id = %self.current.session_id,
                "Keeping continuation after failure"
            );
        }
    }
}

const MISMATCH_PHRASES: &[&str] = &[
    "tool results mismatch",
    "tool result mismatch",
    "tool_results mismatch",
    "no tool output found",
    "no function call found",
    "number of tool results",
];

/// The backend refused the tool call/result pairing of the stored conversation.
pub fn is_tool_history_mismatch(message: &str) -> bool {
    let lowered = message.to_lowercase();
    MISMATCH_PHRASES.iter().any(|p| lowered.contains(p))
}

struct NarratedResult {
    name: String,
    output: String,
    is_error: bool,
}

/// One user message describing what the text-recovered tools returned.
fn narrate(results: &[NarratedResult], question: Option<&str>) -> String {
    let mut lines: Vec<String> = results
        .iter()
        .map(|r| {
            if r.is_error {
                format!("The tool `{}` failed with this error:\n{}", r.name, r.output)
            } else {
                format!("The tool `{}` returned:\n{}", r.name, r.output)
            }
        })
        .collect();

    let all_failed = results.iter().all(|r| r.is_error);
    let closing = match (question, all_failed) {
        (Some(q), false) => format!("Using this result, answer the original question: {q}"),
        (Some(q), true) => format!(
            "Answer the original question as well as you can without the tool, or explain what went wrong: {q}"
        ),
        (None, false) => "Using this result, continue with the task.".to_string(),
        (None, true) => {
            "Continue without the tool, or explain what went wrong.".to_string()
        }
    };
    lines.push(closing);
    lines.join("\n\n")
}

fn flush_narration(
    pending: &mut Vec<NarratedResult>,
    out: &mut Vec<ChatMessage>,
    question: Option<&str>,
) {
    if !pending.is_empty() {
        out.push(ChatMessage::user(narrate(pending, question)));
        pending.clear();
    }
}

fn normalize_with(history: &[ChatMessage], mut question: Option<String>) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(history.len());
    let mut recovered: HashMap<&str, &str> = HashMap::new();
    let mut pending = Vec::new();

    for msg in history {
        if msg.role == Role::Tool {
            let name = msg
                .tool_call_id
                .as_deref()
                .and_then(|id| recovered.get(id).copied());
            if let Some(name) = name {
                pending.push(NarratedResult {
                    name: name.to_string(),
                    output: msg.text().to_string(),
                    is_error: msg.is_error,
                });
                continue;
            }
        }
        flush_narration(&mut pending, &mut out, question.as_deref());

        match msg.role {
            Role::User => {
                question = Some(msg.text().to_string());
                out.push(msg.clone());
            }
            Role::Assistant if msg.tool_calls.iter().any(|c| c.recovered_from_text) => {
                let mut native: Vec<ToolCall> = Vec::new();
                for call in &msg.tool_calls {
                    if call.recovered_from_text {
                        recovered.insert(call.id.as_str(), call.name.as_str());
                    } else {
                        native.push(call.clone());
                    }
                }
                if !native.is_empty() {
                    out.push(ChatMessage::assistant_tool_calls(msg.content.clone(), native));
                } else if !msg.text().trim().is_empty() {
                    out.push(ChatMessage::assistant(msg.text()));
                }
            }
            _ => out.push(msg.clone()),
        }
    }
    flush_narration(&mut pending, &mut out, question.as_deref());
    out
}

/// History for stateless backends: recovered-call turns become plain text
/// and their results a narrated user message. Native traffic is unchanged.
pub fn normalize_history(history: &[ChatMessage]) -> Vec<ChatMessage> {
    normalize_with(history, None)
}

/// One input item for stateful (responses-style) backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnItem {
    Message { role: Role, content: String },
    FunctionCall { call_id: String, name: String, arguments: String },
    FunctionOutput { call_id: String, output: String },
}

fn push_message_items(msg: &ChatMessage, items: &mut Vec<TurnItem>) {
    match msg.role {
        Role::Tool => {
            if let Some(call_id) = &msg.tool_call_id {
                items.push(TurnItem::FunctionOutput {
                    call_id: call_id.clone(),
                    output: msg.text().to_string(),
                });
            }
        }
        role => {
            if !msg.text().trim().is_empty() {
                items.push(TurnItem::Message {
                    role,
                    content: msg.text().to_string(),
                });
            }
            items.extend(msg.tool_calls.iter().map(|c| TurnItem::FunctionCall {
                call_id: c.id.clone(),
                name: c.name.clone(),
                arguments: c.arguments.clone(),
            }));
        }
    }
}

/// Input items for the next turn of a stateful backend.
///
/// Without a continuation the whole history is sent. With one, only what
/// follows the last assistant turn: each native call of that turn is sent
/// immediately followed by its result, recovered calls are narrated, and new
/// user messages come last.
pub fn plan_turn(history: &[ChatMessage], session: Option<&SessionContext>) -> Vec<TurnItem> {
    let continuing = session.is_some_and(SessionContext::is_continuing);
    let last_assistant = history.iter().rposition(|m| m.role == Role::Assistant);

    let (Some(last_assistant), true) = (last_assistant, continuing) else {
        let mut items = Vec::new();
        for msg in normalize_history(history) {
            push_message_items(&msg, &mut items);
        }
        return items;
    };

    let assistant = &history[last_assistant];
    let delta = &history[last_assistant + 1..];
    let mut items = Vec::new();

    for call in assistant.tool_calls.iter().filter(|c| !c.recovered_from_text) {
        let result = delta
            .iter()
            .find(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some(call.id.as_str()));
        match result {
            Some(result) => {
                items.push(TurnItem::FunctionCall {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                });
                items.push(TurnItem::FunctionOutput {
                    call_id: call.id.clone(),
                    output: result.text().to_string(),
                });
            }
            None => debug!(call_id = %call.id, "No result supplied for tool call"),
        }
    }

    let question = history[..last_assistant]
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.text().to_string());

    // Replay the assistant turn so recovered ids are known, then keep only
    // the narration and the messages that follow it. A turn made only of
    // recovered calls replays to nothing, so the head is not always assistant.
    let native_ids: Vec<&str> = assistant
        .tool_calls
        .iter()
        .filter(|c| !c.recovered_from_text)
        .map(|c| c.id.as_str())
        .collect();
    let replay = normalize_with(&history[last_assistant..], question);
    let replay = match replay.split_first() {
        Some((head, tail)) if head.role == Role::Assistant => tail,
        _ => &replay[..],
    };
    for msg in replay {
        let is_native_result = msg.role == Role::Tool
            && msg
                .tool_call_id
                .as_deref()
                .is_some_and(|id| native_ids.contains(&id));
        if !is_native_result {
            push_message_items(msg, &mut items);
        }
    }
    items
}
