//! Conversation trace collection, reward scoring, persistence and upload.
//!
//! The [`TraceCollector`] records events fire-and-forget from the host's hot
//! paths, keeps a bounded store of traces and flushes snapshots to a
//! [`KeyValueStore`]. The [`UploadClient`] ships traces that have not been
//! uploaded yet to a remote collector.

mod collector;
pub mod reward;
mod store;
mod upload;

pub use collector::{
    CollectorEvent, ExportData, LlmCallInfo, ToolCallInfo, TraceCollector, TraceStats,
    EXPORT_VERSION,
};
pub use reward::RewardScore;
pub use store::{
    keys, read_json, write_json, KeyValueStore, MemoryKvStore, SqliteKvStore, StoreError,
};
pub use upload::{HttpTransport, ReqwestTransport, UploadClient};
