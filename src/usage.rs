//! Token usage reporting.
//!
//! The client hands one [`UsageRecord`] to a [`UsageSink`] after every
//! successful call that reported token counts. Storing or aggregating the
//! records is up to the host.

use crate::types::{Operation, TokenUsage};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

/// One call's token counts with the context needed to attribute them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub operation: Option<Operation>,
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            operation: None,
            usage,
            request_id: None,
            session_id: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_operation(mut self, operation: Option<Operation>) -> Self {
        self.operation = operation;
        self
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

/// Receiver of usage records. Implementations must not block.
pub trait UsageSink: Send + Sync {
    fn record(&self, record: UsageRecord);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUsageSink;

impl UsageSink for NoopUsageSink {
    fn record(&self, _record: UsageRecord) {}
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryUsageSink {
    records: Mutex<Vec<UsageRecord>>,
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Sum of all recorded counts.
    pub fn total(&self) -> TokenUsage {
        self.records
            .lock()
            .iter()
            .fold(TokenUsage::default(), |mut acc, r| {
                acc.prompt_tokens += r.usage.prompt_tokens;
                acc.completion_tokens += r.usage.completion_tokens;
                acc.cached_tokens += r.usage.cached_tokens;
                acc.reasoning_tokens += r.usage.reasoning_tokens;
                acc.total_tokens += r.usage.total_tokens;
                acc
            })
    }
}

impl UsageSink for MemoryUsageSink {
    fn record(&self, record: UsageRecord) {
        self.records.lock().push(record);
    }
}

/// Emits each record as an `info!` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingUsageSink;

impl UsageSink for TracingUsageSink {
    fn record(&self, record: UsageRecord) {
        info!(
            provider = %record.provider,
            model = %record.model,
            operation = record.operation.as_ref().map(Operation::as_str).unwrap_or("-"),
            prompt_tokens = record.usage.prompt_tokens,
            completion_tokens = record.usage.completion_tokens,
            cached_tokens = record.usage.cached_tokens,
            reasoning_tokens = record.usage.reasoning_tokens,
            total_tokens = record.usage.total_tokens,
            request_id = record.request_id.as_deref().unwrap_or("-"),
            session_id = record.session_id.as_deref().unwrap_or("-"),
            "Token usage"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_totals() {
        let sink = MemoryUsageSink::new();
        assert!(sink.is_empty());
        sink.record(UsageRecord::new("local", "qwen3", TokenUsage::new(10, 5)));
        sink.record(
            UsageRecord::new("cloud", "yandexgpt", TokenUsage::new(3, 1))
                .with_operation(Some(Operation::Classification))
                .with_session_id(Some("s1".into())),
        );

        assert_eq!(sink.len(), 2);
        let total = sink.total();
        assert_eq!(total.prompt_tokens, 13);
        assert_eq!(total.total_tokens, 19);
        assert_eq!(sink.records()[1].operation, Some(Operation::Classification));
    }

    #[test]
    fn test_record_serializes_operation_as_string() {
        let record = UsageRecord::new("p", "m", TokenUsage::new(1, 1))
            .with_operation(Some(Operation::Labeling));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["operation"], "labeling");
        assert!(value.get("request_id").is_none());
    }
}
