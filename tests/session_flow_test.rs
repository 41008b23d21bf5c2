//! End-to-end flows through `Client`: tool turns, retries, usage and
//! structured output against a mock OpenAI-compatible server.

use llm_relay::prelude::*;
use llm_relay::retry::RetryConfig;
use llm_relay::usage::MemoryUsageSink;
use llm_relay::{ExtractionMethod, Role};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn text_stream(chunks: &[&str]) -> ResponseTemplate {
    let mut body = String::new();
    for chunk in chunks {
        let payload = serde_json::json!({"choices": [{"index": 0, "delta": {"content": chunk}}]});
        body.push_str(&format!("data: {payload}\n\n"));
    }
    body.push_str(
        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}],\
         \"usage\":{\"prompt_tokens\":20,\"completion_tokens\":5,\"total_tokens\":25}}\n\n",
    );
    body.push_str("data: [DONE]\n\n");
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

fn client(server: &MockServer) -> Client {
    let config = ProviderConfig::builder("lmstudio", BackendKind::OpenAiCompatible)
        .model("qwen2.5-7b-instruct")
        .base_url(server.uri())
        .build()
        .unwrap();
    let registry = ProviderRegistry::new()
        .with_provider(config)
        .route(Operation::Classification, "lmstudio");
    Client::new(registry).with_retry(
        RetryConfig::default()
            .with_base_delay(Duration::from_millis(10))
            .with_delay_step(Duration::ZERO),
    )
}

#[tokio::test]
async fn test_recovered_tool_turn_is_narrated_on_the_next_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(text_stream(&[
            "<tool_call>{\"name\": \"lookup\", ",
            "\"arguments\": {\"id\": 7}}</tool_call>",
        ]))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(text_stream(&["Total is ", "3"]))
        .mount(&server)
        .await;

    let client = client(&server);
    let lookup = tool("lookup", "Fetch a receipt by id").param("id", "integer").build();
    let tools = vec![lookup];
    let mut conversation = Conversation::new();
    let mut history = vec![ChatMessage::user("Receipt 7?")];

    let first = client
        .chat(&mut conversation, &history, &tools, &CallOptions::new())
        .await
        .unwrap();
    assert!(first.success, "{:?}", first.error);
    assert_eq!(first.tool_calls.len(), 1);
    let call = first.tool_calls[0].clone();
    assert!(call.recovered_from_text);
    assert_eq!(call.arguments_value(), serde_json::json!({"id": 7}));

    history.push(ChatMessage::assistant_tool_calls(
        Some(first.response.clone()),
        first.tool_calls.clone(),
    ));
    history.push(ChatMessage::tool_result(&call.id, "{\"total\":3}"));

    let second = client
        .chat(&mut conversation, &history, &tools, &CallOptions::new())
        .await
        .unwrap();
    assert_eq!(second.response, "Total is 3");

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let body: Value = requests[1].body_json().unwrap();
    let messages = body["messages"].as_array().unwrap();
    assert!(messages.iter().all(|m| m["role"] != Role::Tool.as_str()));
    let last = messages.last().unwrap();
    assert_eq!(last["role"], "user");
    let narration = last["content"].as_str().unwrap();
    assert!(narration.contains("The tool `lookup` returned:\n{\"total\":3}"));
    assert!(narration.ends_with("answer the original question: Receipt 7?"));
}

#[tokio::test]
async fn test_transient_failure_is_retried_and_usage_recorded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("loading model"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(text_stream(&["4"]))
        .mount(&server)
        .await;

    let sink = Arc::new(MemoryUsageSink::new());
    let client = client(&server).with_usage_sink(sink.clone());
    let mut conversation = Conversation::for_operation(Operation::Classification);

    let result = client
        .chat(
            &mut conversation,
            &[ChatMessage::user("2+2?")],
            &[],
            &CallOptions::new(),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.response, "4");
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].provider, "lmstudio");
    assert_eq!(records[0].operation, Some(Operation::Classification));
    assert_eq!(records[0].usage.total_tokens, 25);
    assert_eq!(
        records[0].session_id.as_deref(),
        Some(conversation.session().session_id.as_str())
    );
}

#[tokio::test]
async fn test_missing_configuration_is_not_retried() {
    let client = Client::new(ProviderRegistry::new());
    let mut conversation = Conversation::new();

    let result = client
        .chat(&mut conversation, &[ChatMessage::user("hi")], &[], &CallOptions::new())
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::ConfigurationMissing));
}

#[derive(Debug, Deserialize)]
struct Category {
    category: String,
    confidence: f64,
}

#[tokio::test]
async fn test_generate_json_reads_fenced_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(text_stream(&[
            "<think>dairy product</think>Here you go:\n```json\n",
            "{\"category\": \"Dairy\", \"confidence\": 0.93}\n```",
        ]))
        .mount(&server)
        .await;

    let structured = client(&server)
        .generate_json::<Category>(
            Operation::Classification,
            "Classify: Молоко 3.2%",
            JsonKind::Object,
            &CallOptions::new(),
        )
        .await
        .unwrap();

    assert!(structured.is_success());
    assert_eq!(structured.method, Some(ExtractionMethod::JsonFence));
    let value = structured.value.unwrap();
    assert_eq!(value.category, "Dairy");
    assert!((value.confidence - 0.93).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_generate_json_reports_parse_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(text_stream(&["I cannot classify this item."]))
        .mount(&server)
        .await;

    let structured = client(&server)
        .generate_json::<Category>(
            Operation::Classification,
            "Classify: ???",
            JsonKind::Object,
            &CallOptions::new(),
        )
        .await
        .unwrap();

    assert!(!structured.is_success());
    assert!(structured.value.is_none());
    assert_eq!(structured.generation.failure, Some(FailureKind::Parse));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}
