//! Upload wire format shared by the collector client and the ingest server.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::{ConversationTrace, Feedback, ToolCallStats};

/// Reward aggregates over a batch of traces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardSummary {
    /// Number of traces carrying a final reward.
    pub traces_with_reward: u64,
    /// Mean final reward over those traces.
    pub average_reward: Option<f64>,
    /// Mean value per reward dimension name.
    pub dimension_averages: BTreeMap<String, f64>,
}

impl RewardSummary {
    pub fn from_traces(traces: &[ConversationTrace]) -> Self {
        let rewards: Vec<f64> = traces.iter().filter_map(|t| t.summary.final_reward).collect();

        let mut sums: BTreeMap<String, (f64, u64)> = BTreeMap::new();
        for dim in traces.iter().flat_map(|t| &t.summary.reward_dimensions) {
            let entry = sums.entry(dim.name.clone()).or_insert((0.0, 0));
            entry.0 += dim.value;
            entry.1 += 1;
        }

        Self {
            traces_with_reward: rewards.len() as u64,
            average_reward: mean(&rewards),
            dimension_averages: sums
                .into_iter()
                .map(|(name, (sum, count))| (name, sum / count as f64))
                .collect(),
        }
    }
}

/// Tool call aggregates over a batch of traces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallSummary {
    pub total_tool_calls: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Fraction of successful calls, `0.0` when there were none.
    pub success_rate: f64,
    /// Sum of tool durations in milliseconds.
    pub total_duration: u64,
    pub by_tool_name: BTreeMap<String, ToolCallStats>,
}

impl ToolCallSummary {
    pub fn from_traces(traces: &[ConversationTrace]) -> Self {
        let mut summary = Self::default();
        for trace in traces {
            let s = &trace.summary;
            summary.succeeded += s.tool_calls_succeeded;
            summary.failed += s.tool_calls_failed;
            summary.total_duration += s.total_tool_duration;
            for (name, stats) in &s.tool_calls_by_name {
                summary.by_tool_name.entry(name.clone()).or_default().merge(stats);
            }
        }
        summary.total_tool_calls = summary.succeeded + summary.failed;
        if summary.total_tool_calls > 0 {
            summary.success_rate = summary.succeeded as f64 / summary.total_tool_calls as f64;
        }
        summary
    }
}

/// JSON body of a `POST /api/traces` upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPayload {
    pub traces: Vec<ConversationTrace>,
    /// Feedback entries keyed by `threadId:messageIdx`.
    #[serde(default)]
    pub feedback: HashMap<String, Feedback>,
    #[serde(default)]
    pub reward_summary: RewardSummary,
    #[serde(default)]
    pub tool_call_summary: ToolCallSummary,
    /// Unix timestamp (milliseconds) when the payload was built.
    pub uploaded_at: i64,
}

impl UploadPayload {
    pub fn new(
        traces: Vec<ConversationTrace>,
        feedback: HashMap<String, Feedback>,
        uploaded_at: i64,
    ) -> Self {
        let reward_summary = RewardSummary::from_traces(&traces);
        let tool_call_summary = ToolCallSummary::from_traces(&traces);
        Self {
            traces,
            feedback,
            reward_summary,
            tool_call_summary,
            uploaded_at,
        }
    }
}

/// Outcome of an upload attempt. Uploads report failure here instead of erroring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub success: bool,
    pub message: String,
    pub uploaded_count: usize,
}

impl UploadResult {
    pub fn ok(uploaded_count: usize, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            uploaded_count,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            uploaded_count: 0,
        }
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Metadata, RewardDimension};

    fn trace_with(id: &str, succeeded: u64, failed: u64, reward: Option<f64>) -> ConversationTrace {
        let mut trace = ConversationTrace::new(id, "thread", Metadata::new(), 0);
        trace.summary.tool_calls_succeeded = succeeded;
        trace.summary.tool_calls_failed = failed;
        trace.summary.total_tool_calls = succeeded + failed;
        trace.summary.total_tool_duration = 100 * (succeeded + failed);
        trace.summary.tool_calls_by_name.insert(
            "search".into(),
            ToolCallStats { total: succeeded + failed, succeeded, failed },
        );
        trace.summary.final_reward = reward;
        if let Some(r) = reward {
            trace.summary.reward_dimensions = vec![RewardDimension::new("user_feedback", r)];
        }
        trace
    }

    #[test]
    fn test_tool_call_summary_aggregates_across_traces() {
        let traces = vec![trace_with("a", 3, 1, None), trace_with("b", 1, 1, None)];
        let summary = ToolCallSummary::from_traces(&traces);

        assert_eq!(summary.total_tool_calls, 6);
        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.total_duration, 600);
        assert!((summary.success_rate - 4.0 / 6.0).abs() < 1e-9);
        assert_eq!(summary.by_tool_name["search"].total, 6);
    }

    #[test]
    fn test_reward_summary_skips_unscored_traces() {
        let traces = vec![
            trace_with("a", 0, 0, Some(0.5)),
            trace_with("b", 0, 0, None),
            trace_with("c", 0, 0, Some(-0.5)),
        ];
        let summary = RewardSummary::from_traces(&traces);

        assert_eq!(summary.traces_with_reward, 2);
        assert_eq!(summary.average_reward, Some(0.0));
        assert_eq!(summary.dimension_averages["user_feedback"], 0.0);
    }

    #[test]
    fn test_empty_batch_has_zero_rate() {
        let summary = ToolCallSummary::from_traces(&[]);
        assert_eq!(summary.total_tool_calls, 0);
        assert_eq!(summary.success_rate, 0.0);
        assert_eq!(RewardSummary::from_traces(&[]).average_reward, None);
    }
}
