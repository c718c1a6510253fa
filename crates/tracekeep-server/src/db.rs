//! SQLite persistence for uploaded trace batches.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracekeep_core::{now_ms, ConversationTrace, UploadPayload};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Lock error")]
    Lock,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Aggregate figures over everything received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    pub total_traces: u64,
    pub total_uploads: u64,
    pub total_tool_calls: u64,
    pub average_reward: Option<f64>,
}

/// Stores uploaded traces, keyed by trace ID, and one row per upload batch.
pub struct IngestStore {
    conn: Mutex<Connection>,
}

impl IngestStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Creates an in-memory store (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS uploaded_traces (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER,
                final_reward REAL,
                total_tool_calls INTEGER NOT NULL DEFAULT 0,
                span_count INTEGER NOT NULL DEFAULT 0,
                trace_json TEXT NOT NULL,
                received_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS upload_batches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uploaded_at INTEGER NOT NULL,
                received_at INTEGER NOT NULL,
                trace_count INTEGER NOT NULL,
                feedback_json TEXT NOT NULL,
                reward_summary_json TEXT NOT NULL,
                tool_call_summary_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_uploaded_traces_start ON uploaded_traces(start_time DESC);
            CREATE INDEX IF NOT EXISTS idx_uploaded_traces_thread ON uploaded_traces(thread_id);
            "#,
        )?;

        Ok(())
    }

    /// Stores a batch. Re-sent traces replace the earlier copy.
    pub fn insert_payload(&self, payload: &UploadPayload) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        let received_at = now_ms();
        let tx = conn.transaction()?;

        for trace in &payload.traces {
            tx.execute(
                r#"INSERT INTO uploaded_traces
                   (id, thread_id, start_time, end_time, final_reward, total_tool_calls,
                    span_count, trace_json, received_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                   ON CONFLICT(id) DO UPDATE SET
                     thread_id = excluded.thread_id,
                     start_time = excluded.start_time,
                     end_time = excluded.end_time,
                     final_reward = excluded.final_reward,
                     total_tool_calls = excluded.total_tool_calls,
                     span_count = excluded.span_count,
                     trace_json = excluded.trace_json,
                     received_at = excluded.received_at"#,
                params![
                    trace.id,
                    trace.thread_id,
                    trace.start_time,
                    trace.end_time,
                    trace.summary.final_reward,
                    trace.summary.total_tool_calls as i64,
                    trace.spans.len() as i64,
                    serde_json::to_string(trace)?,
                    received_at,
                ],
            )?;
        }

        tx.execute(
            r#"INSERT INTO upload_batches
               (uploaded_at, received_at, trace_count, feedback_json,
                reward_summary_json, tool_call_summary_json)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                payload.uploaded_at,
                received_at,
                payload.traces.len() as i64,
                serde_json::to_string(&payload.feedback)?,
                serde_json::to_string(&payload.reward_summary)?,
                serde_json::to_string(&payload.tool_call_summary)?,
            ],
        )?;

        tx.commit()?;
        Ok(payload.traces.len())
    }

    /// Lists traces newest first.
    pub fn list_traces(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationTrace>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        let mut stmt = conn.prepare(
            r#"SELECT trace_json FROM uploaded_traces
               ORDER BY start_time DESC, id ASC
               LIMIT ?1 OFFSET ?2"#,
        )?;
        let rows = stmt.query_map(params![limit, offset], |row| row.get::<_, String>(0))?;

        let mut traces = Vec::new();
        for row in rows {
            traces.push(serde_json::from_str(&row?)?);
        }
        Ok(traces)
    }

    pub fn get_trace(&self, trace_id: &str) -> Result<Option<ConversationTrace>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        let raw: Option<String> = conn
            .query_row(
                "SELECT trace_json FROM uploaded_traces WHERE id = ?1",
                params![trace_id],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn get_summary(&self) -> Result<IngestSummary, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        let (total_traces, total_tool_calls, average_reward) = conn.query_row(
            r#"SELECT
               COUNT(*),
               COALESCE(SUM(total_tool_calls), 0),
               AVG(final_reward)
               FROM uploaded_traces"#,
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                ))
            },
        )?;
        let total_uploads: i64 =
            conn.query_row("SELECT COUNT(*) FROM upload_batches", [], |row| row.get(0))?;

        Ok(IngestSummary {
            total_traces: total_traces as u64,
            total_uploads: total_uploads as u64,
            total_tool_calls: total_tool_calls as u64,
            average_reward,
        })
    }
}
