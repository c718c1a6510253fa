//! Core domain types and error definitions for tracekeep.
//!
//! This crate provides the types shared by the collector and the ingest server:
//!
//! - [`ConversationTrace`], [`Span`] and [`SpanData`]: the recorded event log
//! - [`TraceSummary`] and [`RewardDimension`]: running aggregates and reward output
//! - [`Feedback`] and [`ChatMode`]: user signals and session mode
//! - [`UploadPayload`]: the JSON body shipped to a collector endpoint
//! - [`TraceError`]: error type for persistence and upload operations
//!
//! # Example
//!
//! ```rust
//! use tracekeep_core::{ConversationTrace, Span, SpanData, MAX_SPANS_PER_TRACE};
//!
//! let mut trace = ConversationTrace::new("trace-1", "thread-1", Default::default(), 0);
//! let span = Span::new(&trace, 0, SpanData::user_message("hello"), 0, None);
//! assert!(trace.push_span(span, MAX_SPANS_PER_TRACE));
//! assert_eq!(trace.spans.len(), 1);
//! ```

mod payload;
mod trace;

pub use payload::{RewardSummary, ToolCallSummary, UploadPayload, UploadResult};
pub use trace::{
    ConversationTrace, Metadata, RewardDimension, Span, SpanData, SpanType, ToolCallStats,
    TraceSummary,
};

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Maximum number of spans retained per trace.
pub const MAX_SPANS_PER_TRACE: usize = 200;
/// Maximum number of traces retained across the store.
pub const MAX_TRACES: usize = 1000;
/// Character cap for message content previews.
pub const MESSAGE_PREVIEW_CHARS: usize = 500;
/// Character cap for tool results.
pub const TOOL_RESULT_CHARS: usize = 500;
/// Character cap for error messages.
pub const ERROR_MESSAGE_CHARS: usize = 1000;
/// Metadata key holding the chat mode of a trace.
pub const CHAT_MODE_KEY: &str = "chatMode";

/// Errors raised while persisting or uploading traces.
#[derive(Error, Debug)]
pub enum TraceError {
    /// Durable storage read or write failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Snapshot or payload (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The HTTP request could not be sent.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The collector answered with an error status.
    #[error("Server responded with status {0}")]
    Status(u16),

    /// The request was cancelled before completing.
    #[error("Upload cancelled")]
    Cancelled,
}

/// Explicit user rating of an assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    Good,
    Bad,
}

impl Feedback {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feedback::Good => "good",
            Feedback::Bad => "bad",
        }
    }
}

/// Chat mode a conversation runs in. Agent sessions get relaxed scoring thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    #[default]
    Normal,
    Gather,
    Agent,
}

impl ChatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatMode::Normal => "normal",
            ChatMode::Gather => "gather",
            ChatMode::Agent => "agent",
        }
    }

    /// Parses a mode name, treating anything unknown as [`ChatMode::Normal`].
    pub fn parse_lossy(s: &str) -> Self {
        match s {
            "agent" => ChatMode::Agent,
            "gather" => ChatMode::Gather,
            _ => ChatMode::Normal,
        }
    }

    /// Builds trace metadata carrying this chat mode.
    pub fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert(CHAT_MODE_KEY.to_string(), self.as_str().into());
        metadata
    }
}

/// Builds the storage key for a feedback entry.
pub fn feedback_key(thread_id: &str, message_idx: u32) -> String {
    format!("{}:{}", thread_id, message_idx)
}

/// Splits a feedback key back into thread ID and message index.
///
/// Thread IDs may themselves contain `:`, so the split happens on the last one.
pub fn parse_feedback_key(key: &str) -> Option<(&str, u32)> {
    let (thread_id, idx) = key.rsplit_once(':')?;
    Some((thread_id, idx.parse().ok()?))
}

/// Truncates `s` to at most `max` characters without splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((byte_idx, _)) => s[..byte_idx].to_string(),
        None => s.to_string(),
    }
}

/// Generates a new unique identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current unix time in milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 2), "he");
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("日本語テキスト", 3), "日本語");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn test_feedback_key_round_trip_with_colons() {
        let key = feedback_key("thread:with:colons", 7);
        assert_eq!(key, "thread:with:colons:7");
        assert_eq!(parse_feedback_key(&key), Some(("thread:with:colons", 7)));
        assert_eq!(parse_feedback_key("no-index"), None);
        assert_eq!(parse_feedback_key("t1:abc"), None);
    }

    #[test]
    fn test_chat_mode_metadata() {
        let metadata = ChatMode::Agent.metadata();
        assert_eq!(metadata.get(CHAT_MODE_KEY).and_then(|v| v.as_str()), Some("agent"));
        assert_eq!(ChatMode::parse_lossy("gather"), ChatMode::Gather);
        assert_eq!(ChatMode::parse_lossy("whatever"), ChatMode::Normal);
    }

    #[test]
    fn test_feedback_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Feedback::Good).unwrap(), "\"good\"");
        let bad: Feedback = serde_json::from_str("\"bad\"").unwrap();
        assert_eq!(bad, Feedback::Bad);
    }
}
