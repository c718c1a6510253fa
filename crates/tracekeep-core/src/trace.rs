//! Trace and span types for the conversation event log.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    truncate_chars, ChatMode, Feedback, CHAT_MODE_KEY, ERROR_MESSAGE_CHARS, MESSAGE_PREVIEW_CHARS,
};

/// Open key/value bag attached to a trace at creation.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Kind of event a span records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanType {
    LlmCall,
    ToolCall,
    UserMessage,
    AssistantMessage,
    UserFeedback,
    EditPrediction,
    Checkpoint,
    Error,
}

impl SpanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanType::LlmCall => "llm_call",
            SpanType::ToolCall => "tool_call",
            SpanType::UserMessage => "user_message",
            SpanType::AssistantMessage => "assistant_message",
            SpanType::UserFeedback => "user_feedback",
            SpanType::EditPrediction => "edit_prediction",
            SpanType::Checkpoint => "checkpoint",
            SpanType::Error => "error",
        }
    }
}

/// Payload of a span, keyed by span type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SpanData {
    LlmCall {
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_tokens: Option<u64>,
    },
    ToolCall {
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_params: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_success: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_error: Option<String>,
    },
    UserMessage {
        content_preview: String,
        content_length: usize,
    },
    AssistantMessage {
        content_preview: String,
        content_length: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
    },
    UserFeedback {
        feedback: Option<Feedback>,
    },
    EditPrediction {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        accepted: Option<bool>,
    },
    Checkpoint {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    Error {
        message: String,
    },
}

impl SpanData {
    /// User message payload with a truncated preview.
    pub fn user_message(content: &str) -> Self {
        SpanData::UserMessage {
            content_preview: truncate_chars(content, MESSAGE_PREVIEW_CHARS),
            content_length: content.chars().count(),
        }
    }

    /// Assistant message payload with a truncated preview.
    pub fn assistant_message(
        content: &str,
        model: Option<String>,
        provider: Option<String>,
    ) -> Self {
        SpanData::AssistantMessage {
            content_preview: truncate_chars(content, MESSAGE_PREVIEW_CHARS),
            content_length: content.chars().count(),
            model,
            provider,
        }
    }

    /// Error payload with a truncated message.
    pub fn error(message: &str) -> Self {
        SpanData::Error {
            message: truncate_chars(message, ERROR_MESSAGE_CHARS),
        }
    }

    pub fn span_type(&self) -> SpanType {
        match self {
            SpanData::LlmCall { .. } => SpanType::LlmCall,
            SpanData::ToolCall { .. } => SpanType::ToolCall,
            SpanData::UserMessage { .. } => SpanType::UserMessage,
            SpanData::AssistantMessage { .. } => SpanType::AssistantMessage,
            SpanData::UserFeedback { .. } => SpanType::UserFeedback,
            SpanData::EditPrediction { .. } => SpanType::EditPrediction,
            SpanData::Checkpoint { .. } => SpanType::Checkpoint,
            SpanData::Error { .. } => SpanType::Error,
        }
    }
}

/// One recorded event within a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    /// Unique span identifier.
    pub id: String,
    /// Owning trace identifier.
    pub trace_id: String,
    /// Conversation thread identifier.
    pub thread_id: String,
    /// Position of the message in the owning conversation.
    pub message_idx: u32,
    /// Unix timestamp (milliseconds) when the event was recorded.
    pub timestamp: i64,
    /// Duration of the event in milliseconds, if measured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Event payload.
    pub data: SpanData,
}

impl Span {
    /// Creates a span owned by `trace`.
    pub fn new(
        trace: &ConversationTrace,
        message_idx: u32,
        data: SpanData,
        timestamp: i64,
        duration: Option<u64>,
    ) -> Self {
        Self {
            id: crate::new_id(),
            trace_id: trace.id.clone(),
            thread_id: trace.thread_id.clone(),
            message_idx,
            timestamp,
            duration,
            data,
        }
    }

    pub fn span_type(&self) -> SpanType {
        self.data.span_type()
    }
}

/// Tool call counts for a single tool or for a whole trace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl ToolCallStats {
    pub fn record(&mut self, succeeded: bool) {
        self.total += 1;
        if succeeded {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }

    pub fn merge(&mut self, other: &ToolCallStats) {
        self.total += other.total;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
    }
}

/// A named reward axis with a value in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardDimension {
    pub name: String,
    pub value: f64,
}

impl RewardDimension {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: value.clamp(-1.0, 1.0),
        }
    }
}

/// Running aggregates maintained as spans are appended.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TraceSummary {
    pub total_llm_calls: u64,
    pub total_tool_calls: u64,
    pub total_tokens: u64,
    pub user_feedback: Option<Feedback>,
    pub has_errors: bool,
    pub tool_calls_succeeded: u64,
    pub tool_calls_failed: u64,
    pub tool_calls_by_name: BTreeMap<String, ToolCallStats>,
    /// Sum of measured tool call durations in milliseconds.
    pub total_tool_duration: u64,
    pub final_reward: Option<f64>,
    pub reward_dimensions: Vec<RewardDimension>,
}

impl TraceSummary {
    /// Folds one event into the counters.
    ///
    /// Assistant messages never count as LLM calls; only `LlmCall` spans do.
    pub fn absorb(&mut self, data: &SpanData, duration: Option<u64>) {
        match data {
            SpanData::LlmCall {
                input_tokens,
                output_tokens,
                total_tokens,
                ..
            } => {
                self.total_llm_calls += 1;
                let tokens = total_tokens
                    .unwrap_or_else(|| input_tokens.unwrap_or(0) + output_tokens.unwrap_or(0));
                self.total_tokens += tokens;
            }
            SpanData::ToolCall {
                tool_name,
                tool_success,
                tool_error,
                ..
            } => {
                let succeeded = tool_success.unwrap_or(tool_error.is_none());
                self.total_tool_calls += 1;
                if succeeded {
                    self.tool_calls_succeeded += 1;
                } else {
                    self.tool_calls_failed += 1;
                }
                self.tool_calls_by_name
                    .entry(tool_name.clone())
                    .or_default()
                    .record(succeeded);
                self.total_tool_duration += duration.unwrap_or(0);
            }
            SpanData::UserFeedback { feedback } => {
                self.user_feedback = *feedback;
            }
            SpanData::Error { .. } => {
                self.has_errors = true;
            }
            SpanData::UserMessage { .. }
            | SpanData::AssistantMessage { .. }
            | SpanData::EditPrediction { .. }
            | SpanData::Checkpoint { .. } => {}
        }
    }
}

/// One logical conversation session for a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTrace {
    /// Unique trace identifier.
    pub id: String,
    /// Conversation thread identifier.
    pub thread_id: String,
    /// Unix timestamp (milliseconds) when the trace started.
    pub start_time: i64,
    /// Unix timestamp (milliseconds) when the trace ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    /// Recorded spans in insertion order.
    #[serde(default)]
    pub spans: Vec<Span>,
    #[serde(default)]
    pub summary: TraceSummary,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ConversationTrace {
    pub fn new(
        id: impl Into<String>,
        thread_id: impl Into<String>,
        metadata: Metadata,
        start_time: i64,
    ) -> Self {
        Self {
            id: id.into(),
            thread_id: thread_id.into(),
            start_time,
            end_time: None,
            spans: Vec::new(),
            summary: TraceSummary::default(),
            metadata,
        }
    }

    /// Appends a span unless the trace already holds `max_spans`.
    pub fn push_span(&mut self, span: Span, max_spans: usize) -> bool {
        if self.spans.len() >= max_spans {
            return false;
        }
        self.spans.push(span);
        true
    }

    /// Updates the summary and appends the span.
    ///
    /// Counters always reflect the event, even when the span list is full.
    pub fn append(&mut self, span: Span, max_spans: usize) -> bool {
        self.summary.absorb(&span.data, span.duration);
        self.push_span(span, max_spans)
    }

    pub fn chat_mode(&self) -> ChatMode {
        self.metadata
            .get(CHAT_MODE_KEY)
            .and_then(|v| v.as_str())
            .map(ChatMode::parse_lossy)
            .unwrap_or_default()
    }

    pub fn is_agent_mode(&self) -> bool {
        self.chat_mode() == ChatMode::Agent
    }

    pub fn is_ended(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn count_spans(&self, span_type: SpanType) -> usize {
        self.spans.iter().filter(|s| s.span_type() == span_type).count()
    }

    /// Number of completed user/assistant exchanges.
    pub fn conversation_turns(&self) -> usize {
        self.count_spans(SpanType::UserMessage)
            .min(self.count_spans(SpanType::AssistantMessage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_call(name: &str, success: Option<bool>, error: Option<&str>) -> SpanData {
        SpanData::ToolCall {
            tool_name: name.to_string(),
            tool_params: None,
            tool_result: None,
            tool_success: success,
            tool_error: error.map(str::to_string),
        }
    }

    #[test]
    fn test_push_span_drops_past_cap() {
        let mut trace = ConversationTrace::new("t", "thread", Metadata::new(), 0);
        for i in 0..5 {
            let span = Span::new(&trace, i, SpanData::user_message("x"), 0, None);
            trace.push_span(span, 3);
        }
        assert_eq!(trace.spans.len(), 3);
    }

    #[test]
    fn test_summary_counts_tool_calls_by_name() {
        let mut summary = TraceSummary::default();
        summary.absorb(&tool_call("search", Some(true), None), Some(120));
        summary.absorb(&tool_call("search", Some(false), None), Some(80));
        summary.absorb(&tool_call("read_file", None, Some("not found")), None);
        summary.absorb(&tool_call("read_file", None, None), None);

        assert_eq!(summary.total_tool_calls, 4);
        assert_eq!(summary.tool_calls_succeeded, 2);
        assert_eq!(summary.tool_calls_failed, 2);
        assert_eq!(summary.total_tool_duration, 200);
        assert_eq!(
            summary.tool_calls_by_name["search"],
            ToolCallStats { total: 2, succeeded: 1, failed: 1 }
        );
        assert_eq!(
            summary.tool_calls_by_name["read_file"],
            ToolCallStats { total: 2, succeeded: 1, failed: 1 }
        );
    }

    #[test]
    fn test_assistant_message_is_not_an_llm_call() {
        let mut summary = TraceSummary::default();
        summary.absorb(&SpanData::assistant_message("hi", Some("gpt-4".into()), None), None);
        assert_eq!(summary.total_llm_calls, 0);

        summary.absorb(
            &SpanData::LlmCall {
                model: "gpt-4".into(),
                provider: None,
                input_tokens: Some(10),
                output_tokens: Some(5),
                total_tokens: None,
            },
            None,
        );
        assert_eq!(summary.total_llm_calls, 1);
        assert_eq!(summary.total_tokens, 15);
    }

    #[test]
    fn test_message_preview_is_truncated() {
        let long = "a".repeat(MESSAGE_PREVIEW_CHARS + 50);
        match SpanData::user_message(&long) {
            SpanData::UserMessage { content_preview, content_length } => {
                assert_eq!(content_preview.len(), MESSAGE_PREVIEW_CHARS);
                assert_eq!(content_length, MESSAGE_PREVIEW_CHARS + 50);
            }
            other => panic!("unexpected payload: {:?}", other),
        }

        let long_error = "e".repeat(ERROR_MESSAGE_CHARS * 2);
        match SpanData::error(&long_error) {
            SpanData::Error { message } => assert_eq!(message.len(), ERROR_MESSAGE_CHARS),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_span_json_shape() {
        let trace = ConversationTrace::new("trace-1", "thread-1", Metadata::new(), 0);
        let span = Span::new(&trace, 2, tool_call("search", Some(true), None), 42, Some(7));
        let json = serde_json::to_value(&span).unwrap();

        assert_eq!(json["traceId"], "trace-1");
        assert_eq!(json["threadId"], "thread-1");
        assert_eq!(json["messageIdx"], 2);
        assert_eq!(json["data"]["type"], "tool_call");
        assert_eq!(json["data"]["toolName"], "search");
        assert_eq!(json["data"]["toolSuccess"], true);

        let back: Span = serde_json::from_value(json).unwrap();
        assert_eq!(back.span_type(), SpanType::ToolCall);
    }

    #[test]
    fn test_conversation_turns_is_min_of_sides() {
        let mut trace = ConversationTrace::new("t", "thread", ChatMode::Agent.metadata(), 0);
        for i in 0..3 {
            let span = Span::new(&trace, i, SpanData::user_message("q"), 0, None);
            trace.append(span, 200);
        }
        let span = Span::new(&trace, 3, SpanData::assistant_message("a", None, None), 0, None);
        trace.append(span, 200);

        assert_eq!(trace.conversation_turns(), 1);
        assert!(trace.is_agent_mode());
    }
}
