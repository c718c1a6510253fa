//! Trace collector that records conversation events and persists snapshots.
//!
//! Recording calls never block: they queue a command for a background worker
//! that owns all mutation, so events for the same thread are applied in order.
//! The worker flushes dirty state on a timer and immediately after trace ends
//! and feedback, which are rare but valuable.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracekeep_config::CollectorConfig;
use tracekeep_core::{
    feedback_key, new_id, now_ms, parse_feedback_key, truncate_chars, ConversationTrace, Feedback,
    Metadata, Span, SpanData, ERROR_MESSAGE_CHARS, TOOL_RESULT_CHARS,
};

use crate::reward;
use crate::store::{
    keys, read_json, write_json, KeyValueStore, MemoryKvStore, SqliteKvStore, StoreError,
};

/// Version tag written into exports.
pub const EXPORT_VERSION: &str = "1.0";

const EVENT_CAPACITY: usize = 64;

/// Details of a completed LLM request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmCallInfo {
    pub model: String,
    pub provider: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    /// Request latency in milliseconds.
    pub duration: Option<u64>,
}

impl LlmCallInfo {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_tokens(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.input_tokens = Some(input_tokens);
        self.output_tokens = Some(output_tokens);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration = Some(duration_ms);
        self
    }
}

/// Details of a completed tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallInfo {
    pub tool_name: String,
    pub tool_params: Option<serde_json::Value>,
    pub tool_result: Option<String>,
    pub tool_success: Option<bool>,
    pub tool_error: Option<String>,
    /// Execution time in milliseconds.
    pub duration: Option<u64>,
}

impl ToolCallInfo {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            ..Default::default()
        }
    }

    pub fn succeeded(mut self, result: impl Into<String>) -> Self {
        self.tool_success = Some(true);
        self.tool_result = Some(result.into());
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.tool_success = Some(false);
        self.tool_error = Some(error.into());
        self
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.tool_success = Some(success);
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.tool_params = Some(params);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration = Some(duration_ms);
        self
    }
}

/// Coarse change notification for UI invalidation. Span appends never fire one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectorEvent {
    FeedbackChanged {
        thread_id: String,
        message_idx: u32,
        feedback: Option<Feedback>,
    },
    Cleared,
}

/// Store-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceStats {
    pub total_traces: usize,
    pub total_spans: usize,
    pub total_feedbacks: usize,
    pub good_feedbacks: usize,
    pub bad_feedbacks: usize,
    /// Byte length of the serialized trace and feedback snapshots.
    pub storage_size_bytes: usize,
    pub oldest_trace: Option<i64>,
    pub newest_trace: Option<i64>,
    pub tool_calls_succeeded: u64,
    pub tool_calls_failed: u64,
    pub average_reward: Option<f64>,
}

/// Full snapshot for export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportData {
    pub version: String,
    pub exported_at: i64,
    pub traces: Vec<ConversationTrace>,
    pub feedback: HashMap<String, Feedback>,
    pub stats: TraceStats,
}

enum RecordEvent {
    UserMessage {
        content: String,
    },
    AssistantMessage {
        content: String,
        model: Option<String>,
        provider: Option<String>,
    },
    LlmCall(LlmCallInfo),
    ToolCall(ToolCallInfo),
    Error {
        message: String,
    },
}

impl RecordEvent {
    fn into_span_data(self) -> (SpanData, Option<u64>) {
        match self {
            RecordEvent::UserMessage { content } => (SpanData::user_message(&content), None),
            RecordEvent::AssistantMessage {
                content,
                model,
                provider,
            } => (SpanData::assistant_message(&content, model, provider), None),
            RecordEvent::LlmCall(info) => {
                let total_tokens = match (info.input_tokens, info.output_tokens) {
                    (None, None) => None,
                    (input, output) => Some(input.unwrap_or(0) + output.unwrap_or(0)),
                };
                let data = SpanData::LlmCall {
                    model: info.model,
                    provider: info.provider,
                    input_tokens: info.input_tokens,
                    output_tokens: info.output_tokens,
                    total_tokens,
                };
                (data, info.duration)
            }
            RecordEvent::ToolCall(info) => {
                let data = SpanData::ToolCall {
                    tool_name: info.tool_name,
                    tool_params: info.tool_params,
                    tool_result: info.tool_result.map(|r| truncate_chars(&r, TOOL_RESULT_CHARS)),
                    tool_success: info.tool_success,
                    tool_error: info.tool_error.map(|e| truncate_chars(&e, ERROR_MESSAGE_CHARS)),
                };
                (data, info.duration)
            }
            RecordEvent::Error { message } => (SpanData::error(&message), None),
        }
    }
}

enum EndTarget {
    Trace(String),
    Thread(String),
}

enum Command {
    Start {
        trace_id: String,
        thread_id: String,
        metadata: Metadata,
        at: i64,
    },
    End {
        target: EndTarget,
        at: i64,
    },
    Record {
        thread_id: String,
        message_idx: u32,
        event: RecordEvent,
        at: i64,
    },
    Feedback {
        thread_id: String,
        message_idx: u32,
        feedback: Option<Feedback>,
        at: i64,
    },
    Clear(oneshot::Sender<()>),
    Flush(oneshot::Sender<()>),
    Settle(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

struct Snapshot {
    traces: String,
    feedback: String,
    uploaded: String,
}

impl Snapshot {
    fn write(&self, storage: &dyn KeyValueStore) -> Result<(), StoreError> {
        storage.store(keys::TRACES, &self.traces)?;
        storage.store(keys::FEEDBACK, &self.feedback)?;
        storage.store(keys::UPLOADED_TRACE_IDS, &self.uploaded)?;
        Ok(())
    }
}

#[derive(Default)]
struct CollectorState {
    traces: HashMap<String, ConversationTrace>,
    /// thread ID -> active trace ID
    active: HashMap<String, String>,
    /// `threadId:messageIdx` -> feedback
    feedback: HashMap<String, Feedback>,
    uploaded: HashSet<String>,
    dirty: bool,
}

impl CollectorState {
    fn load(storage: &dyn KeyValueStore) -> Self {
        let mut state = Self::default();

        match read_json::<Vec<ConversationTrace>>(storage, keys::TRACES) {
            Ok(Some(traces)) => {
                state.traces = traces.into_iter().map(|t| (t.id.clone(), t)).collect();
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to load trace snapshot: {}", e),
        }

        match read_json::<HashMap<String, Feedback>>(storage, keys::FEEDBACK) {
            Ok(Some(feedback)) => state.feedback = feedback,
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to load feedback snapshot: {}", e),
        }

        match read_json::<Vec<String>>(storage, keys::UPLOADED_TRACE_IDS) {
            Ok(Some(ids)) => state.uploaded = ids.into_iter().collect(),
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to load uploaded trace ids: {}", e),
        }

        tracing::debug!(
            traces = state.traces.len(),
            feedback = state.feedback.len(),
            uploaded = state.uploaded.len(),
            "Loaded collector snapshot"
        );
        state
    }

    fn trace_entry(
        &mut self,
        trace_id: String,
        thread_id: &str,
        at: i64,
    ) -> &mut ConversationTrace {
        self.traces
            .entry(trace_id.clone())
            .or_insert_with(|| ConversationTrace::new(trace_id, thread_id, Metadata::new(), at))
    }

    /// Active trace for the thread, created on first use.
    fn active_trace_mut(&mut self, thread_id: &str, at: i64) -> &mut ConversationTrace {
        let trace_id = self
            .active
            .get(thread_id)
            .filter(|id| self.traces.contains_key(id.as_str()))
            .cloned()
            .unwrap_or_else(|| {
                tracing::debug!(thread_id, "Lazily starting trace");
                new_id()
            });
        self.active.insert(thread_id.to_string(), trace_id.clone());
        self.trace_entry(trace_id, thread_id, at)
    }

    /// Trace that feedback for the thread applies to: the active one, else the
    /// most recently started one.
    fn feedback_trace_id(&self, thread_id: &str) -> Option<String> {
        if let Some(id) = self
            .active
            .get(thread_id)
            .filter(|id| self.traces.contains_key(id.as_str()))
        {
            return Some(id.clone());
        }
        self.traces
            .values()
            .filter(|t| t.thread_id == thread_id)
            .max_by_key(|t| t.start_time)
            .map(|t| t.id.clone())
    }

    fn sorted_traces(&self) -> Vec<ConversationTrace> {
        let mut traces: Vec<ConversationTrace> = self.traces.values().cloned().collect();
        newest_first(&mut traces);
        traces
    }

    /// Drops the oldest traces beyond `max_traces` and caps span lists.
    fn enforce_retention(&mut self, max_traces: usize, max_spans: usize) -> usize {
        for trace in self.traces.values_mut() {
            trace.spans.truncate(max_spans);
        }
        if self.traces.len() <= max_traces {
            return 0;
        }

        let mut order: Vec<(i64, String)> = self
            .traces
            .values()
            .map(|t| (t.start_time, t.id.clone()))
            .collect();
        order.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let evicted: Vec<String> = order.into_iter().skip(max_traces).map(|(_, id)| id).collect();
        for id in &evicted {
            self.traces.remove(id);
        }
        self.active.retain(|_, id| self.traces.contains_key(id.as_str()));
        self.uploaded.retain(|id| self.traces.contains_key(id));
        evicted.len()
    }

    fn snapshot(&self) -> Result<Snapshot, serde_json::Error> {
        let mut uploaded: Vec<&String> = self.uploaded.iter().collect();
        uploaded.sort();
        Ok(Snapshot {
            traces: serde_json::to_string(&self.sorted_traces())?,
            feedback: serde_json::to_string(&self.feedback)?,
            uploaded: serde_json::to_string(&uploaded)?,
        })
    }

    fn stats(&self) -> TraceStats {
        let mut stats = TraceStats {
            total_traces: self.traces.len(),
            total_feedbacks: self.feedback.len(),
            ..Default::default()
        };

        let mut reward_sum = 0.0;
        let mut rewarded = 0usize;
        for trace in self.traces.values() {
            stats.total_spans += trace.spans.len();
            stats.tool_calls_succeeded += trace.summary.tool_calls_succeeded;
            stats.tool_calls_failed += trace.summary.tool_calls_failed;
            stats.oldest_trace = Some(
                stats
                    .oldest_trace
                    .map_or(trace.start_time, |t| t.min(trace.start_time)),
            );
            stats.newest_trace = Some(
                stats
                    .newest_trace
                    .map_or(trace.start_time, |t| t.max(trace.start_time)),
            );
            if let Some(reward) = trace.summary.final_reward {
                reward_sum += reward;
                rewarded += 1;
            }
        }

        for feedback in self.feedback.values() {
            match feedback {
                Feedback::Good => stats.good_feedbacks += 1,
                Feedback::Bad => stats.bad_feedbacks += 1,
            }
        }

        if rewarded > 0 {
            stats.average_reward = Some(reward_sum / rewarded as f64);
        }
        stats.storage_size_bytes = self
            .snapshot()
            .map(|s| s.traces.len() + s.feedback.len())
            .unwrap_or(0);
        stats
    }

    fn pending_upload(&self) -> (Vec<ConversationTrace>, HashMap<String, Feedback>) {
        let mut traces: Vec<ConversationTrace> = self
            .traces
            .values()
            .filter(|t| !self.uploaded.contains(&t.id))
            .cloned()
            .collect();
        newest_first(&mut traces);

        let threads: HashSet<&str> = traces.iter().map(|t| t.thread_id.as_str()).collect();
        let feedback = self
            .feedback
            .iter()
            .filter(|(key, _)| {
                parse_feedback_key(key).is_some_and(|(thread_id, _)| threads.contains(thread_id))
            })
            .map(|(key, value)| (key.clone(), *value))
            .collect();

        (traces, feedback)
    }
}

fn newest_first(traces: &mut [ConversationTrace]) {
    traces.sort_by(|a, b| b.start_time.cmp(&a.start_time).then_with(|| a.id.cmp(&b.id)));
}

struct Shared {
    state: Mutex<CollectorState>,
    /// Held from taking a snapshot until it is written, so writes to
    /// storage land in the order their snapshots were taken.
    write_lock: Mutex<()>,
    storage: Arc<dyn KeyValueStore>,
    events: broadcast::Sender<CollectorEvent>,
    max_traces: usize,
    max_spans: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        // A poisoned lock still guards consistent state; keep recording.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, event: CollectorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn apply(&self, command: Command) {
        match command {
            Command::Start {
                trace_id,
                thread_id,
                metadata,
                at,
            } => {
                let mut state = self.lock();
                let trace =
                    ConversationTrace::new(trace_id.clone(), thread_id.clone(), metadata, at);
                state.traces.insert(trace_id.clone(), trace);
                state.active.insert(thread_id.clone(), trace_id.clone());
                state.dirty = true;
                tracing::debug!(%trace_id, %thread_id, "Started trace");
            }
            Command::End { target, at } => self.end_trace(target, at),
            Command::Record {
                thread_id,
                message_idx,
                event,
                at,
            } => {
                let max_spans = self.max_spans;
                let mut state = self.lock();
                let trace = state.active_trace_mut(&thread_id, at);
                let (data, duration) = event.into_span_data();
                let span = Span::new(trace, message_idx, data, at, duration);
                let span_type = span.span_type();
                if !trace.append(span, max_spans) {
                    tracing::trace!(
                        trace_id = %trace.id,
                        span_type = span_type.as_str(),
                        "Span cap reached, dropping span"
                    );
                }
                state.dirty = true;
            }
            Command::Feedback {
                thread_id,
                message_idx,
                feedback,
                at,
            } => {
                {
                    let max_spans = self.max_spans;
                    let mut state = self.lock();
                    let trace = match state.feedback_trace_id(&thread_id) {
                        Some(trace_id) => state.trace_entry(trace_id, &thread_id, at),
                        None => state.active_trace_mut(&thread_id, at),
                    };
                    let data = SpanData::UserFeedback { feedback };
                    let span = Span::new(trace, message_idx, data, at, None);
                    trace.append(span, max_spans);
                    let reward = reward::apply_reward(trace);
                    tracing::debug!(
                        trace_id = %trace.id,
                        message_idx,
                        feedback = feedback.map(|f| f.as_str()),
                        ?reward,
                        "Recorded user feedback"
                    );
                    state.dirty = true;
                }
                self.notify(CollectorEvent::FeedbackChanged {
                    thread_id,
                    message_idx,
                    feedback,
                });
                self.persist(false);
            }
            Command::Clear(ack) => {
                {
                    let mut state = self.lock();
                    *state = CollectorState::default();
                    state.dirty = true;
                }
                self.persist(true);
                self.notify(CollectorEvent::Cleared);
                tracing::info!("Cleared all trace data");
                let _ = ack.send(());
            }
            Command::Flush(ack) => {
                self.persist(false);
                let _ = ack.send(());
            }
            Command::Settle(ack) => {
                let _ = ack.send(());
            }
            Command::Shutdown(ack) => {
                self.persist(false);
                let _ = ack.send(());
            }
        }
    }

    fn end_trace(&self, target: EndTarget, at: i64) {
        {
            let mut state = self.lock();
            let trace_id = match target {
                EndTarget::Trace(id) => id,
                EndTarget::Thread(thread_id) => match state.active.get(&thread_id) {
                    Some(id) => id.clone(),
                    None => {
                        tracing::debug!(%thread_id, "No active trace to end");
                        return;
                    }
                },
            };

            let Some(trace) = state.traces.get_mut(&trace_id) else {
                tracing::debug!(%trace_id, "Unknown trace, ignoring end");
                return;
            };
            if trace.end_time.is_none() {
                trace.end_time = Some(at);
            }
            let reward = reward::apply_reward(trace);
            let thread_id = trace.thread_id.clone();
            tracing::debug!(%trace_id, ?reward, spans = trace.spans.len(), "Ended trace");

            if state.active.get(&thread_id) == Some(&trace_id) {
                state.active.remove(&thread_id);
            }
            state.dirty = true;
        }
        self.persist(false);
    }

    /// Writes the snapshot if dirty (or when forced).
    fn persist(&self, force: bool) {
        let _write = self.write_guard();
        let snapshot = {
            let mut state = self.lock();
            if !state.dirty && !force {
                return;
            }
            let evicted = state.enforce_retention(self.max_traces, self.max_spans);
            if evicted > 0 {
                tracing::debug!(evicted, "Evicted oldest traces");
            }
            state.dirty = false;
            state.snapshot()
        };

        let result = snapshot
            .map_err(StoreError::from)
            .and_then(|s| s.write(self.storage.as_ref()));
        if let Err(e) = result {
            tracing::warn!("Failed to persist trace snapshot: {}", e);
            self.lock().dirty = true;
        }
    }

    fn mark_uploaded(&self, trace_ids: &[String]) -> Result<(), StoreError> {
        let _write = self.write_guard();
        let uploaded = {
            let mut state = self.lock();
            let CollectorState {
                traces, uploaded, ..
            } = &mut *state;
            uploaded.extend(trace_ids.iter().cloned());
            uploaded.retain(|id| traces.contains_key(id));
            let mut ids: Vec<String> = uploaded.iter().cloned().collect();
            ids.sort();
            ids
        };

        let result = write_json(self.storage.as_ref(), keys::UPLOADED_TRACE_IDS, &uploaded);
        if result.is_err() {
            self.lock().dirty = true;
        }
        result
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    flush_interval: Duration,
) {
    let mut ticker = interval_at(Instant::now() + flush_interval, flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Shutdown(ack)) => {
                    shared.apply(Command::Shutdown(ack));
                    break;
                }
                Some(command) => shared.apply(command),
                None => {
                    shared.persist(false);
                    break;
                }
            },
            _ = ticker.tick() => shared.persist(false),
        }
    }

    tracing::debug!("Trace collector worker stopped");
}

struct Inner {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the trace collector. Cheap to clone; all clones share one store.
///
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct TraceCollector {
    inner: Arc<Inner>,
}

impl TraceCollector {
    /// Creates a collector backed by `storage`, loading any existing snapshot.
    pub fn new(storage: Arc<dyn KeyValueStore>, config: &CollectorConfig) -> Self {
        let state = CollectorState::load(storage.as_ref());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            write_lock: Mutex::new(()),
            storage,
            events,
            max_traces: config.max_traces,
            max_spans: config.max_spans_per_trace,
        });

        let (commands, receiver) = mpsc::unbounded_channel();
        let flush_interval = Duration::from_millis(config.flush_interval_ms.max(1));
        let worker = tokio::spawn(run_worker(shared.clone(), receiver, flush_interval));

        Self {
            inner: Arc::new(Inner {
                shared,
                commands,
                worker: Mutex::new(Some(worker)),
            }),
        }
    }

    /// Creates a collector with process-local storage.
    pub fn in_memory(config: &CollectorConfig) -> Self {
        Self::new(Arc::new(MemoryKvStore::new()), config)
    }

    /// Creates a collector using the SQLite file from `config`, or memory when unset.
    pub fn open(config: &CollectorConfig) -> Result<Self, StoreError> {
        let storage: Arc<dyn KeyValueStore> = match &config.storage_path {
            Some(path) => Arc::new(SqliteKvStore::new(path)?),
            None => Arc::new(MemoryKvStore::new()),
        };
        Ok(Self::new(storage, config))
    }

    fn send(&self, command: Command) {
        if self.inner.commands.send(command).is_err() {
            tracing::debug!("Trace collector stopped, dropping event");
        }
    }

    /// Starts a new trace for the thread, superseding (not ending) any active one.
    pub fn start_trace(&self, thread_id: &str, metadata: Option<Metadata>) -> String {
        let trace_id = new_id();
        self.send(Command::Start {
            trace_id: trace_id.clone(),
            thread_id: thread_id.to_string(),
            metadata: metadata.unwrap_or_default(),
            at: now_ms(),
        });
        trace_id
    }

    /// Ends a trace and scores it. Unknown IDs are ignored.
    pub fn end_trace(&self, trace_id: &str) {
        self.send(Command::End {
            target: EndTarget::Trace(trace_id.to_string()),
            at: now_ms(),
        });
    }

    /// Ends the thread's active trace, if any.
    pub fn end_trace_for_thread(&self, thread_id: &str) {
        self.send(Command::End {
            target: EndTarget::Thread(thread_id.to_string()),
            at: now_ms(),
        });
    }

    fn record(&self, thread_id: &str, message_idx: u32, event: RecordEvent) {
        self.send(Command::Record {
            thread_id: thread_id.to_string(),
            message_idx,
            event,
            at: now_ms(),
        });
    }

    pub fn record_user_message(&self, thread_id: &str, message_idx: u32, content: &str) {
        self.record(
            thread_id,
            message_idx,
            RecordEvent::UserMessage {
                content: content.to_string(),
            },
        );
    }

    /// Records an assistant reply. Does not count as an LLM call.
    pub fn record_assistant_message(
        &self,
        thread_id: &str,
        message_idx: u32,
        content: &str,
        model: Option<&str>,
        provider: Option<&str>,
    ) {
        self.record(
            thread_id,
            message_idx,
            RecordEvent::AssistantMessage {
                content: content.to_string(),
                model: model.map(str::to_string),
                provider: provider.map(str::to_string),
            },
        );
    }

    pub fn record_llm_call(&self, thread_id: &str, message_idx: u32, info: LlmCallInfo) {
        self.record(thread_id, message_idx, RecordEvent::LlmCall(info));
    }

    pub fn record_tool_call(&self, thread_id: &str, message_idx: u32, info: ToolCallInfo) {
        self.record(thread_id, message_idx, RecordEvent::ToolCall(info));
    }

    pub fn record_error(&self, thread_id: &str, message_idx: u32, error: &str) {
        self.record(
            thread_id,
            message_idx,
            RecordEvent::Error {
                message: error.to_string(),
            },
        );
    }

    /// Records (or clears, with `None`) feedback for a message.
    ///
    /// The feedback map is updated before returning; the audit span, rescoring,
    /// notification and flush happen on the worker.
    pub fn record_user_feedback(
        &self,
        thread_id: &str,
        message_idx: u32,
        feedback: Option<Feedback>,
    ) {
        {
            let mut state = self.inner.shared.lock();
            let key = feedback_key(thread_id, message_idx);
            match feedback {
                Some(value) => {
                    state.feedback.insert(key, value);
                }
                None => {
                    state.feedback.remove(&key);
                }
            }
            state.dirty = true;
        }
        self.send(Command::Feedback {
            thread_id: thread_id.to_string(),
            message_idx,
            feedback,
            at: now_ms(),
        });
    }

    pub fn get_feedback(&self, thread_id: &str, message_idx: u32) -> Option<Feedback> {
        let state = self.inner.shared.lock();
        state.feedback.get(&feedback_key(thread_id, message_idx)).copied()
    }

    pub fn get_stats(&self) -> TraceStats {
        self.inner.shared.lock().stats()
    }

    /// All traces, newest first.
    pub fn get_all_traces(&self) -> Vec<ConversationTrace> {
        self.inner.shared.lock().sorted_traces()
    }

    pub fn get_trace(&self, trace_id: &str) -> Option<ConversationTrace> {
        self.inner.shared.lock().traces.get(trace_id).cloned()
    }

    /// Active trace for a thread, as of the last applied command.
    pub fn get_active_trace_id(&self, thread_id: &str) -> Option<String> {
        self.inner.shared.lock().active.get(thread_id).cloned()
    }

    pub fn export_data(&self) -> ExportData {
        let state = self.inner.shared.lock();
        ExportData {
            version: EXPORT_VERSION.to_string(),
            exported_at: now_ms(),
            traces: state.sorted_traces(),
            feedback: state.feedback.clone(),
            stats: state.stats(),
        }
    }

    /// Wipes all traces, feedback and upload bookkeeping and persists the empty state.
    pub async fn clear_all_data(&self) {
        let (ack, done) = oneshot::channel();
        self.send(Command::Clear(ack));
        let _ = done.await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollectorEvent> {
        self.inner.shared.events.subscribe()
    }

    /// Waits until every command queued before this call has been applied.
    pub async fn settle(&self) {
        let (ack, done) = oneshot::channel();
        self.send(Command::Settle(ack));
        let _ = done.await;
    }

    /// Applies queued commands and writes dirty state to storage.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        self.send(Command::Flush(ack));
        let _ = done.await;
    }

    /// Drains the queue, performs a final flush and stops the worker.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        self.send(Command::Shutdown(ack));
        let _ = done.await;

        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                tracing::warn!("Trace collector worker failed: {}", e);
            }
        }
    }

    pub(crate) fn storage(&self) -> Arc<dyn KeyValueStore> {
        self.inner.shared.storage.clone()
    }

    /// Traces not yet uploaded, with feedback for the threads they cover.
    pub(crate) fn pending_upload(&self) -> (Vec<ConversationTrace>, HashMap<String, Feedback>) {
        self.inner.shared.lock().pending_upload()
    }

    /// Marks traces uploaded and persists the set, pruned to traces still held.
    pub(crate) fn mark_uploaded(&self, trace_ids: &[String]) -> Result<(), StoreError> {
        self.inner.shared.mark_uploaded(trace_ids)
    }
}
